//! HTTP/1.1 client protocol pieces.
//!
//! - **`connection`**: non-blocking TCP/TLS duplex with send and receive buffers
//! - **`writer`**: serializes request records into wire bytes
//! - **`parser`**: incremental response parser
//! - **`event`**: Server-Sent Events sub-parser
//! - **`request`** / **`response`**: the records passed across the API
//! - **`headers`** / **`query`**: ordered maps used by those records
//!
//! # Response Lifecycle
//!
//! ```text
//!        ┌─────────────┐
//!        │ StatusLine  │ ← Wait for `HTTP/1.1 200 OK`
//!        └──────┬──────┘
//!               │ status parsed
//!               ▼
//!        ┌─────────────┐
//!        │   Headers   │ ← Redirects are known once this completes
//!        └──────┬──────┘
//!               │ blank line
//!               ├─ Content-Length → Body  ─┐
//!               ├─ chunked        → Chunk ─┼→ Ended
//!               ├─ no framing     → Body (until close)
//!               └─ event-stream   → Stream (events until close)
//! ```
//!
//! # Example
//!
//! ```
//! use courier::http::parser::ResponseParser;
//! use courier::http::request::Method;
//!
//! let mut parser = ResponseParser::new();
//! parser.reset(Method::GET);
//! parser.consume(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi");
//! assert!(parser.ended());
//! assert_eq!(parser.body(), b"hi");
//! ```

pub mod connection;
pub mod event;
pub mod headers;
pub mod parser;
pub mod query;
pub mod request;
pub mod response;
pub mod writer;
