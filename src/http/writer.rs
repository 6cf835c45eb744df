use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use rand::Rng;

use crate::error::RequestError;
use crate::http::request::{Request, Scheme};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Characters escaped when a decoded path goes back on the wire.
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Fresh multipart boundary marker.
pub fn random_boundary() -> String {
    let n: u64 = rand::rng().random_range(0x0000_075b_cd15..=0xffff_ffff_ffff);
    format!("____________{:012x}", n)
}

/// Serializes request records into HTTP/1.1 bytes.
///
/// A requester is bound to a default endpoint, used for the `Host` header
/// when a request does not name its own. It is reused across requests; the
/// lines and head of the last build stay available for inspection.
#[derive(Debug)]
pub struct Requester {
    host: String,
    port: u16,
    scheme: Scheme,
    lines: Vec<String>,
    head: Vec<u8>,
}

impl Requester {
    pub fn new(host: impl Into<String>, port: u16, scheme: Scheme) -> Self {
        Self {
            host: host.into(),
            port,
            scheme,
            lines: Vec::new(),
            head: Vec::new(),
        }
    }

    /// Rebinds the default endpoint.
    pub fn retarget(&mut self, host: impl Into<String>, port: u16, scheme: Scheme) {
        self.host = host.into();
        self.port = port;
        self.scheme = scheme;
    }

    /// Forgets the last build.
    pub fn reset(&mut self) {
        self.lines.clear();
        self.head.clear();
    }

    /// Lines of the last head, ending with two empty strings for the blank
    /// line that closes it.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Bytes of the last head, terminating blank line included.
    pub fn head(&self) -> &[u8] {
        &self.head
    }

    /// Builds the wire bytes for `request`.
    ///
    /// Multipart bodies use a fresh random boundary on every build.
    pub fn build(&mut self, request: &Request) -> Result<Vec<u8>, RequestError> {
        self.build_with_boundary(request, random_boundary)
    }

    /// Like [`Requester::build`] with a caller-chosen boundary source.
    pub fn build_with_boundary(
        &mut self,
        request: &Request,
        boundary: impl FnOnce() -> String,
    ) -> Result<Vec<u8>, RequestError> {
        let mut content_type = None;
        let body = if let Some(fargs) = &request.fargs {
            let boundary = boundary();
            content_type = Some(format!("multipart/form-data; boundary={}", boundary));
            multipart_body(fargs, &boundary)
        } else if let Some(data) = &request.data {
            content_type = Some("application/json; charset=utf-8".to_string());
            serde_json::to_vec(data)?
        } else {
            request.body.clone()
        };

        let mut headers = request.headers.clone();
        headers.remove("Content-Length");
        if let Some(content_type) = &content_type {
            // Caller's Content-Type keeps its slot but takes our value.
            headers.set("Content-Type", content_type.as_str());
        }

        let mut lines = Vec::with_capacity(headers.len() + 6);
        lines.push(format!(
            "{} {} {}",
            request.method,
            request_target(request),
            HTTP_VERSION
        ));
        if !headers.contains("Host") {
            lines.push(format!("Host: {}", self.host_value(request)));
        }
        if !headers.contains("Accept-Encoding") {
            lines.push("Accept-Encoding: identity".to_string());
        }
        if !body.is_empty() {
            lines.push(format!("Content-Length: {}", body.len()));
        }
        for (name, value) in headers.iter() {
            lines.push(format!("{}: {}", name, value));
        }
        lines.push(String::new());
        lines.push(String::new());

        self.head = lines.join("\r\n").into_bytes();
        self.lines = lines;

        tracing::trace!(
            method = %request.method,
            path = %request.path,
            head = self.head.len(),
            body = body.len(),
            "Request built"
        );

        let mut msg = Vec::with_capacity(self.head.len() + body.len());
        msg.extend_from_slice(&self.head);
        msg.extend_from_slice(&body);
        Ok(msg)
    }

    fn host_value(&self, request: &Request) -> String {
        let host = request.host.as_deref().unwrap_or(&self.host);
        let scheme = request.scheme.unwrap_or(self.scheme);
        let port = request.port.unwrap_or(if request.host.is_some() {
            scheme.default_port()
        } else {
            self.port
        });
        if port == scheme.default_port() {
            host.to_string()
        } else {
            format!("{}:{}", host, port)
        }
    }
}

/// Encoded path plus query string; the fragment never goes on the wire.
fn request_target(request: &Request) -> String {
    let path = if request.path.is_empty() {
        "/"
    } else {
        &request.path
    };
    let mut target = utf8_percent_encode(path, PATH_ENCODE_SET).to_string();
    if !request.qargs.is_empty() {
        target.push('?');
        target.push_str(&request.qargs.encode());
    }
    target
}

fn multipart_body(fargs: &[(String, String)], boundary: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fargs {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{}\"\r\n", name).as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: text/plain; charset=utf-8\r\n\r\n");
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    body
}
