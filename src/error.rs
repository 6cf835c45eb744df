use std::io;

/// Failures of the underlying socket or TLS session.
///
/// These never escape the service loop; they mark the connection as cut off
/// and finalize any in-flight response as errored.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("could not resolve {host}:{port}")]
    Resolve { host: String, port: u16 },

    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),

    #[error("connection failed: {0}")]
    Io(#[from] io::Error),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid certified hostname: {0}")]
    ServerName(String),

    #[error("connection closed by peer")]
    PeerClosed,
}

/// Malformed response input.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid status line: {0}")]
    StatusLine(String),

    #[error("invalid header line: {0}")]
    Header(String),

    #[error("invalid content length: {0}")]
    ContentLength(String),

    #[error("invalid chunk: {0}")]
    Chunk(String),

    #[error("invalid JSON body: {0}")]
    Json(String),
}

/// A request record that cannot be sent.
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("request may carry only one of body, data or form fields")]
    ConflictingBody,

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid header: {0:?}")]
    InvalidHeader(String),

    #[error("request has no host")]
    MissingHost,

    #[error("invalid redirect location: {0}")]
    InvalidLocation(String),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}
