//! Courier - non-blocking HTTP/1.1 client
//!
//! A polled client engine: connections, request serialization, incremental
//! response parsing with chunked bodies and Server-Sent Events, redirects and
//! reconnects, all advanced by explicit service calls against a virtual clock.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod runner;
pub mod timing;

pub use client::Client;
pub use config::{Config, ResendPolicy, TlsConfig};
pub use error::{ConnectionError, ParseError, RequestError};
pub use http::event::Event;
pub use http::request::{Method, Request, RequestBuilder, Scheme};
pub use http::response::{Response, StatusCode};
pub use timing::{Timer, VirtualClock};
