use std::fmt;
use std::str::FromStr;

use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};

use crate::error::RequestError;
use crate::http::headers::{Headers, is_valid_name, is_valid_value};
use crate::http::query::Query;

/// HTTP request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Deserialize)]
pub enum Method {
    /// GET - Retrieve a resource
    #[default]
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }
}

impl FromStr for Method {
    type Err = ();

    /// Parses an uppercase method name.
    ///
    /// ```
    /// # use courier::http::request::Method;
    /// assert_eq!("GET".parse(), Ok(Method::GET));
    /// assert!("get".parse::<Method>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Method::GET),
            "POST" => Ok(Method::POST),
            "PUT" => Ok(Method::PUT),
            "DELETE" => Ok(Method::DELETE),
            "HEAD" => Ok(Method::HEAD),
            "OPTIONS" => Ok(Method::OPTIONS),
            "PATCH" => Ok(Method::PATCH),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport scheme of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl FromStr for Scheme {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(RequestError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing request record.
///
/// `path` holds the decoded path only; query arguments live in `qargs` and the
/// fragment in `fragment`. [`Request::normalize`] moves any query, fragment or
/// absolute-URL parts found in `path` into their own fields. Only one of
/// `body`, `data` and `fargs` may be set.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub qargs: Query,
    pub fragment: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Structured body, sent as JSON.
    pub data: Option<Value>,
    /// Form fields, sent as a multipart body.
    pub fargs: Option<Vec<(String, String)>>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub scheme: Option<Scheme>,
    /// Opaque caller fields copied into the echoed request of the response.
    pub tracking: Map<String, Value>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::GET,
            path: "/".to_string(),
            qargs: Query::new(),
            fragment: String::new(),
            headers: Headers::new(),
            body: Vec::new(),
            data: None,
            fargs: None,
            host: None,
            port: None,
            scheme: None,
            tracking: Map::new(),
        }
    }
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..Self::default()
        }
    }

    /// Retrieves a header value by name, ignoring case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Splits URL parts out of `path` and checks the body sources.
    ///
    /// Query pairs parsed from `path` are merged under the explicit `qargs`,
    /// so explicit entries win.
    pub fn normalize(mut self) -> Result<Self, RequestError> {
        let body_sources = [
            !self.body.is_empty(),
            self.data.is_some(),
            self.fargs.is_some(),
        ];
        if body_sources.iter().filter(|set| **set).count() > 1 {
            return Err(RequestError::ConflictingBody);
        }
        if let Some((name, _)) = self
            .headers
            .iter()
            .find(|(name, value)| !is_valid_name(name) || !is_valid_value(value))
        {
            return Err(RequestError::InvalidHeader(name.to_string()));
        }

        let raw = std::mem::take(&mut self.path);
        let mut rest = raw.as_str();

        if rest.contains("://") {
            let url = url::Url::parse(rest)?;
            let scheme: Scheme = url.scheme().parse()?;
            let host = url.host_str().ok_or(RequestError::MissingHost)?;
            self.scheme = Some(scheme);
            self.host = Some(host.to_string());
            self.port = Some(url.port().unwrap_or(scheme.default_port()));
            // Keep the remainder in raw form so it is decoded exactly once below.
            let after_authority = &rest[rest.find("://").map(|i| i + 3).unwrap_or(0)..];
            rest = after_authority
                .find(['/', '?', '#'])
                .map(|i| &after_authority[i..])
                .unwrap_or("");
        }

        let (before_fragment, fragment) = match rest.split_once('#') {
            Some((before, fragment)) => (before, Some(fragment)),
            None => (rest, None),
        };
        if let Some(fragment) = fragment {
            self.fragment = percent_decode_str(fragment).decode_utf8_lossy().into_owned();
        }

        let (path, raw_query) = match before_fragment.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (before_fragment, None),
        };
        if let Some(raw_query) = raw_query {
            let mut merged = Query::parse(raw_query);
            merged.extend(&self.qargs);
            self.qargs = merged;
        }

        let path = percent_decode_str(path).decode_utf8_lossy().into_owned();
        self.path = if path.is_empty() {
            "/".to_string()
        } else if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };

        Ok(self)
    }

    /// Absolute URL of this request, when it has an endpoint.
    pub fn url(&self) -> Option<url::Url> {
        let scheme = self.scheme?;
        let host = self.host.as_deref()?;
        let port = self.port.unwrap_or(scheme.default_port());
        let mut url = url::Url::parse(&format!("{}://{}:{}/", scheme, host, port)).ok()?;
        url.set_path(&self.path);
        if !self.qargs.is_empty() {
            url.set_query(Some(&self.qargs.encode()));
        }
        if !self.fragment.is_empty() {
            url.set_fragment(Some(&self.fragment));
        }
        Some(url)
    }
}

/// Builder for constructing Request records.
///
/// ```
/// # use courier::http::request::{Method, RequestBuilder};
/// let request = RequestBuilder::new()
///     .method(Method::GET)
///     .path("/echo?name=fame")
///     .header("Accept", "application/json")
///     .build()
///     .unwrap();
/// assert_eq!(request.path, "/echo");
/// assert_eq!(request.qargs.get("name"), Some("fame"));
/// ```
#[derive(Debug, Default)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.request.method = method;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.request.path = path.into();
        self
    }

    pub fn qarg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.qargs.insert(key, value);
        self
    }

    pub fn fragment(mut self, fragment: impl Into<String>) -> Self {
        self.request.fragment = fragment.into();
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.headers.set(key, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.request.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.request.body = body.into();
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.request.data = Some(data);
        self
    }

    pub fn form_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request
            .fargs
            .get_or_insert_with(Vec::new)
            .push((name.into(), value.into()));
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.request.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.request.port = Some(port);
        self
    }

    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.request.scheme = Some(scheme);
        self
    }

    pub fn track(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.request.tracking.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Request, RequestError> {
        self.request.normalize()
    }
}
