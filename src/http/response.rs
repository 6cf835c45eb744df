use serde_json::Value;

use crate::http::headers::Headers;
use crate::http::request::Request;

/// Numeric HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);

    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    ///
    /// ```
    /// # use courier::http::response::StatusCode;
    /// assert_eq!(StatusCode(404).as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns the standard reason phrase, or `""` for unknown codes.
    ///
    /// Used when a status line carries no reason of its own.
    ///
    /// # Example
    ///
    /// ```
    /// # use courier::http::response::StatusCode;
    /// assert_eq!(StatusCode(307).reason_phrase(), "Temporary Redirect");
    /// ```
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "",
        }
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.0)
    }

    /// Whether a response with this status may carry a body at all.
    pub fn allows_body(&self) -> bool {
        !self.is_informational() && self.0 != 204 && self.0 != 304
    }
}

/// A finished response record.
///
/// `request` is the request that produced this response, after defaults were
/// filled in. `redirects` lists the redirect responses followed on the way
/// here, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub version: (u8, u8),
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Decoded body when the content type is JSON.
    pub data: Option<Value>,
    pub request: Request,
    pub redirects: Vec<Response>,
    pub errored: bool,
    pub error: Option<String>,
}

impl Response {
    /// An errored response for `request` that never produced a usable reply.
    pub fn failed(request: Request, redirects: Vec<Response>, error: impl Into<String>) -> Self {
        Self {
            version: (1, 1),
            status: StatusCode::default(),
            reason: String::new(),
            headers: Headers::new(),
            body: Vec::new(),
            data: None,
            request,
            redirects,
            errored: true,
            error: Some(error.into()),
        }
    }

    /// Retrieves a header value by name, ignoring case.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Body as UTF-8 text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Whether a Content-Type value names JSON (`application/json`, `*+json`).
pub fn is_json_content_type(value: &str) -> bool {
    let mime = value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || mime.ends_with("+json")
}

/// Whether a Content-Type value names an event stream.
pub fn is_event_stream_content_type(value: &str) -> bool {
    value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .eq_ignore_ascii_case("text/event-stream")
}
