//! Incremental HTTP/1.1 response parsing.
//!
//! [`ResponseParser::consume`] takes whatever bytes have arrived and advances
//! as far as they allow, then returns. Partial lines and partial bodies stay
//! buffered until the next call, so the caller can feed bytes in any split.
//!
//! ```text
//!   StatusLine ──▶ Headers ──┬──▶ Body ───┐
//!                            ├──▶ Chunk ──┼──▶ Ended
//!                            └──▶ Stream ─┘
//!   (any malformed input) ──────────────────▶ Errored
//! ```
//!
//! Bodies of `text/event-stream` responses go to an [`EventParser`] instead of
//! the body buffer. Bytes past the end of one response stay buffered for the
//! next one after [`ResponseParser::reset`].

use bytes::{Buf, BytesMut};
use serde_json::Value;

use crate::error::ParseError;
use crate::http::event::{Event, EventParser};
use crate::http::headers::Headers;
use crate::http::request::{Method, Request};
use crate::http::response::{
    Response, StatusCode, is_event_stream_content_type, is_json_content_type,
};

/// Longest status line plus headers accepted before giving up.
const MAX_HEAD: usize = 64 * 1024;

/// Longest single chunk-size or trailer line.
const MAX_CHUNK_LINE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    StatusLine,
    Headers,
    Body,
    Chunk,
    Stream,
    Ended,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// No body expected (HEAD, 1xx, 204, 304).
    Empty,
    Length(usize),
    Chunked(ChunkState),
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

#[derive(Debug)]
pub struct ResponseParser {
    buf: BytesMut,
    phase: Phase,
    method: Method,
    head_len: usize,
    headed: bool,
    version: (u8, u8),
    status: StatusCode,
    reason: String,
    headers: Headers,
    body: Vec<u8>,
    framing: Framing,
    streaming: bool,
    events: EventParser,
    data: Option<Value>,
    error: Option<ParseError>,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            phase: Phase::StatusLine,
            method: Method::GET,
            head_len: 0,
            headed: false,
            version: (1, 1),
            status: StatusCode::default(),
            reason: String::new(),
            headers: Headers::new(),
            body: Vec::new(),
            framing: Framing::UntilClose,
            streaming: false,
            events: EventParser::new(),
            data: None,
            error: None,
        }
    }

    /// Prepares for the response to a request sent with `method`.
    ///
    /// Bytes already buffered past the previous response are kept; they
    /// belong to the next one. Undrained events, the last event id and the
    /// retry interval are kept too.
    pub fn reset(&mut self, method: Method) {
        self.phase = Phase::StatusLine;
        self.method = method;
        self.head_len = 0;
        self.headed = false;
        self.version = (1, 1);
        self.status = StatusCode::default();
        self.reason.clear();
        self.headers = Headers::new();
        self.body = Vec::new();
        self.framing = Framing::UntilClose;
        self.streaming = false;
        self.events.reset_block();
        self.data = None;
        self.error = None;
    }

    /// Drops buffered bytes, for when the connection they came from is gone.
    pub fn discard(&mut self, method: Method) {
        self.buf.clear();
        self.reset(method);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether status line and headers are complete.
    pub fn headed(&self) -> bool {
        self.headed
    }

    pub fn ended(&self) -> bool {
        self.phase == Phase::Ended
    }

    pub fn errored(&self) -> bool {
        self.phase == Phase::Errored
    }

    pub fn error(&self) -> Option<&ParseError> {
        self.error.as_ref()
    }

    /// Whether the body is being read as an event stream.
    pub fn streaming(&self) -> bool {
        self.streaming
    }

    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Unparsed bytes still buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether the headers describe a redirect: a 3xx with a Location.
    pub fn is_redirect(&self) -> bool {
        self.headed() && self.status.is_redirection() && self.headers.contains("Location")
    }

    pub fn location(&self) -> Option<&str> {
        self.headers.get("Location")
    }

    /// Last SSE event id seen on any stream parsed so far.
    pub fn leid(&self) -> &str {
        self.events.leid()
    }

    /// SSE retry interval in milliseconds.
    pub fn retry(&self) -> Option<u64> {
        self.events.retry()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.events.drain()
    }

    /// Feeds newly received bytes and parses as far as possible.
    pub fn consume(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.advance();
    }

    /// Parses buffered bytes without adding new ones.
    pub fn advance(&mut self) {
        while let Some(progressed) = self.step() {
            if !progressed {
                break;
            }
        }
    }

    /// Tells the parser the peer closed the connection.
    ///
    /// A body delimited by connection close ends here. Anything else that is
    /// still incomplete stays incomplete, event streams included; the caller
    /// decides what that means.
    pub fn close(&mut self) {
        if self.phase == Phase::Body && self.framing == Framing::UntilClose {
            let rest = self.buf.split();
            self.deliver(&rest);
            self.finish();
        }
    }

    /// Moves the parsed response out, echoing `request`.
    pub fn take_response(&mut self, request: Request, redirects: Vec<Response>) -> Response {
        let error = self.error.as_ref().map(|e| e.to_string());
        Response {
            version: self.version,
            status: self.status,
            reason: std::mem::take(&mut self.reason),
            headers: std::mem::take(&mut self.headers),
            body: std::mem::take(&mut self.body),
            data: self.data.take(),
            request,
            redirects,
            errored: error.is_some(),
            error,
        }
    }

    /// One parsing step. `None` once terminal, `Some(false)` when more input
    /// is needed.
    fn step(&mut self) -> Option<bool> {
        let result = match self.phase {
            Phase::StatusLine => self.parse_status_line(),
            Phase::Headers => self.parse_header_line(),
            Phase::Body | Phase::Chunk | Phase::Stream => self.parse_body(),
            Phase::Ended | Phase::Errored => return None,
        };
        match result {
            Ok(progressed) => Some(progressed),
            Err(err) => {
                tracing::warn!(error = %err, "Response parse failed");
                self.error = Some(err);
                self.phase = Phase::Errored;
                None
            }
        }
    }

    /// Takes one status or header line, counting it against the head limit.
    fn take_line(&mut self) -> Result<Option<String>, ParseError> {
        let limit = MAX_HEAD.saturating_sub(self.head_len);
        match self.split_line(limit) {
            Some(Ok(line)) => {
                self.head_len += line.len();
                Ok(Some(line))
            }
            Some(Err(())) => Err(ParseError::Header("response head too large".to_string())),
            None => Ok(None),
        }
    }

    /// Takes one chunk-size or trailer line. Each is bounded on its own.
    fn take_chunk_line(&mut self) -> Result<Option<String>, ParseError> {
        match self.split_line(MAX_CHUNK_LINE) {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(())) => Err(ParseError::Chunk("chunk line too long".to_string())),
            None => Ok(None),
        }
    }

    /// Splits one line off the buffer, without its terminator. `Err` when
    /// the line is longer than `limit`; `None` when it is still incomplete.
    fn split_line(&mut self, limit: usize) -> Option<Result<String, ()>> {
        let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
            return (self.buf.len() > limit).then_some(Err(()));
        };
        if pos + 1 > limit {
            return Some(Err(()));
        }
        let line = self.buf.split_to(pos + 1);
        let mut line = &line[..pos];
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        Some(Ok(String::from_utf8_lossy(line).into_owned()))
    }

    fn parse_status_line(&mut self) -> Result<bool, ParseError> {
        let Some(line) = self.take_line()? else {
            return Ok(false);
        };
        if line.is_empty() {
            // Stray blank lines before a status line are tolerated.
            return Ok(true);
        }

        let (version, rest) = line
            .split_once(' ')
            .ok_or_else(|| ParseError::StatusLine(line.clone()))?;
        let (code, reason) = match rest.split_once(' ') {
            Some((code, reason)) => (code, reason.trim()),
            None => (rest, ""),
        };

        self.version = parse_version(version).ok_or_else(|| ParseError::StatusLine(line.clone()))?;
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::StatusLine(line));
        }
        let code: u16 = code
            .parse()
            .map_err(|_| ParseError::StatusLine(line.clone()))?;
        self.status = StatusCode(code);
        self.reason = if reason.is_empty() {
            self.status.reason_phrase().to_string()
        } else {
            reason.to_string()
        };
        self.phase = Phase::Headers;
        Ok(true)
    }

    fn parse_header_line(&mut self) -> Result<bool, ParseError> {
        let Some(line) = self.take_line()? else {
            return Ok(false);
        };

        if line.is_empty() {
            self.end_head()?;
            return Ok(true);
        }

        if line.starts_with([' ', '\t']) {
            // obs-fold: continuation of the previous header value
            let Some((name, value)) = self.headers.iter().last() else {
                return Err(ParseError::Header(line));
            };
            let folded = format!("{} {}", value, line.trim());
            let name = name.to_string();
            let count = self.headers.get_all(&name).count();
            if count > 1 {
                return Err(ParseError::Header(line));
            }
            self.headers.set(name, folded);
            return Ok(true);
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::Header(line.clone()))?;
        let name = name.trim();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ParseError::Header(line.clone()));
        }
        self.headers.append(name, value.trim());
        Ok(true)
    }

    fn end_head(&mut self) -> Result<(), ParseError> {
        if self.status.is_informational() && self.status.as_u16() != 101 {
            // Interim response; the real one follows on the same connection.
            tracing::debug!(status = self.status.as_u16(), "Skipping interim response");
            self.phase = Phase::StatusLine;
            self.headers = Headers::new();
            self.reason.clear();
            return Ok(());
        }

        self.headed = true;
        self.head_len = 0;
        self.streaming = self
            .headers
            .get("Content-Type")
            .is_some_and(is_event_stream_content_type);

        self.framing = if !self.status.allows_body() || self.method == Method::HEAD {
            Framing::Empty
        } else if self.is_chunked() {
            Framing::Chunked(ChunkState::Size)
        } else if let Some(length) = self.content_length()? {
            Framing::Length(length)
        } else {
            Framing::UntilClose
        };

        self.phase = if self.streaming {
            Phase::Stream
        } else if matches!(self.framing, Framing::Chunked(_)) {
            Phase::Chunk
        } else {
            Phase::Body
        };

        tracing::debug!(
            status = self.status.as_u16(),
            framing = ?self.framing,
            streaming = self.streaming,
            "Response head parsed"
        );

        if matches!(self.framing, Framing::Empty | Framing::Length(0)) {
            self.finish();
        }
        Ok(())
    }

    fn is_chunked(&self) -> bool {
        self.headers
            .get_all("Transfer-Encoding")
            .flat_map(|v| v.split(','))
            .last()
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    }

    fn content_length(&self) -> Result<Option<usize>, ParseError> {
        let mut length = None;
        for value in self.headers.get_all("Content-Length").flat_map(|v| v.split(',')) {
            let value = value.trim();
            let parsed: usize = value
                .parse()
                .map_err(|_| ParseError::ContentLength(value.to_string()))?;
            match length {
                Some(prior) if prior != parsed => {
                    return Err(ParseError::ContentLength(format!(
                        "conflicting values {} and {}",
                        prior, parsed
                    )));
                }
                _ => length = Some(parsed),
            }
        }
        Ok(length)
    }

    fn parse_body(&mut self) -> Result<bool, ParseError> {
        match self.framing {
            Framing::Empty => {
                self.finish();
                Ok(true)
            }
            Framing::UntilClose => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let chunk = self.buf.split();
                self.deliver(&chunk);
                Ok(true)
            }
            Framing::Length(remaining) => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let n = remaining.min(self.buf.len());
                let chunk = self.buf.split_to(n);
                self.deliver(&chunk);
                self.framing = Framing::Length(remaining - n);
                if remaining == n {
                    self.finish();
                }
                Ok(true)
            }
            Framing::Chunked(state) => self.parse_chunk(state),
        }
    }

    fn parse_chunk(&mut self, state: ChunkState) -> Result<bool, ParseError> {
        match state {
            ChunkState::Size => {
                let Some(line) = self.take_chunk_line()? else {
                    return Ok(false);
                };
                let size_hex = line.split(';').next().unwrap_or("").trim();
                let size = usize::from_str_radix(size_hex, 16)
                    .map_err(|_| ParseError::Chunk(format!("bad size line {:?}", line)))?;
                self.framing = Framing::Chunked(if size == 0 {
                    ChunkState::Trailers
                } else {
                    ChunkState::Data(size)
                });
                Ok(true)
            }
            ChunkState::Data(remaining) => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let n = remaining.min(self.buf.len());
                let chunk = self.buf.split_to(n);
                self.deliver(&chunk);
                self.framing = Framing::Chunked(if remaining == n {
                    ChunkState::DataEnd
                } else {
                    ChunkState::Data(remaining - n)
                });
                Ok(true)
            }
            ChunkState::DataEnd => {
                if self.buf.starts_with(b"\r\n") {
                    self.buf.advance(2);
                } else if self.buf.starts_with(b"\n") {
                    self.buf.advance(1);
                } else if self.buf.is_empty() || self.buf[..] == b"\r"[..] {
                    return Ok(false);
                } else {
                    return Err(ParseError::Chunk("missing CRLF after chunk data".to_string()));
                }
                self.framing = Framing::Chunked(ChunkState::Size);
                Ok(true)
            }
            ChunkState::Trailers => {
                let Some(line) = self.take_chunk_line()? else {
                    return Ok(false);
                };
                if line.is_empty() {
                    self.finish();
                } else if let Some((name, value)) = line.split_once(':') {
                    self.headers.append(name.trim(), value.trim());
                }
                Ok(true)
            }
        }
    }

    fn deliver(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        tracing::trace!(bytes = bytes.len(), streaming = self.streaming, "Body bytes");
        if self.streaming {
            self.events.feed(bytes);
        } else {
            self.body.extend_from_slice(bytes);
        }
    }

    fn finish(&mut self) {
        self.phase = Phase::Ended;
        if let Err(err) = self.dictify() {
            tracing::warn!(error = %err, "Response body is not valid JSON");
            self.error = Some(err);
            self.phase = Phase::Errored;
        }
    }

    /// Decodes a JSON body into `data`.
    fn dictify(&mut self) -> Result<(), ParseError> {
        let is_json = self
            .headers
            .get("Content-Type")
            .is_some_and(is_json_content_type);
        if !is_json || self.body.is_empty() {
            return Ok(());
        }
        let data = serde_json::from_slice(&self.body).map_err(|e| ParseError::Json(e.to_string()))?;
        self.data = Some(data);
        Ok(())
    }
}

fn parse_version(s: &str) -> Option<(u8, u8)> {
    let (major, minor) = s.strip_prefix("HTTP/")?.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}
