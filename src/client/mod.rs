//! The client orchestrator.
//!
//! A [`Client`] binds one [`Connection`] to a FIFO of outgoing requests, a
//! FIFO of finished responses and a FIFO of stream events. Nothing runs on its
//! own: the caller drives everything by calling [`Client::service_all`] on
//! whatever schedule it likes, advancing the shared [`VirtualClock`] in
//! between.
//!
//! One request is on the wire at a time, so responses come out in the order
//! their requests went in.
//!
//! ```text
//!   enqueue ──▶ requests ──dispatch──▶ Requester ──▶ Connection tx
//!                                                         │
//!   responses ◀── finalize ◀── ResponseParser ◀── Connection rx
//!   events    ◀── drain    ◀──────┘
//! ```

pub mod redirect;

use std::collections::VecDeque;

use crate::config::{Config, ResendPolicy};
use crate::error::{ConnectionError, RequestError};
use crate::http::connection::{Connection, ConnectionState, same_address};
use crate::http::event::Event;
use crate::http::headers::Headers;
use crate::http::parser::ResponseParser;
use crate::http::request::{Method, Request};
use crate::http::response::Response;
use crate::http::writer::Requester;
use crate::timing::{Timer, VirtualClock};

pub struct Client {
    config: Config,
    clock: VirtualClock,
    connection: Connection,
    requester: Requester,
    parser: ResponseParser,
    requests: VecDeque<Request>,
    responses: VecDeque<Response>,
    events: VecDeque<Event>,
    redirects: Vec<Response>,
    in_flight: Option<Request>,
    waited: bool,
    idle: Option<Timer>,
    reconnect: Option<Timer>,
    span: tracing::Span,
}

impl Client {
    pub fn new(config: Config, clock: &VirtualClock) -> Self {
        let span = tracing::info_span!(
            "client",
            endpoint = %format!("{}:{}", config.host, config.port())
        );
        Self::with_span(config, clock, span)
    }

    /// Builds a client that logs under `span`.
    pub fn with_span(config: Config, clock: &VirtualClock, span: tracing::Span) -> Self {
        let port = config.port();
        let mut connection = Connection::new(config.host.clone(), port, config.scheme, clock)
            .with_timeout(config.timeout)
            .with_bufsize(config.bufsize)
            .with_reconnectable(config.reconnectable);
        if let Some(tls) = &config.tls {
            connection = connection.with_tls(tls.clone());
        }
        let requester = Requester::new(config.host.clone(), port, config.scheme);
        let idle = config.idle_timeout.map(|secs| Timer::new(clock, secs));

        Self {
            config,
            clock: clock.clone(),
            connection,
            requester,
            parser: ResponseParser::new(),
            requests: VecDeque::new(),
            responses: VecDeque::new(),
            events: VecDeque::new(),
            redirects: Vec::new(),
            in_flight: None,
            waited: false,
            idle,
            reconnect: None,
            span,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    pub fn parser(&self) -> &ResponseParser {
        &self.parser
    }

    /// Queues a request. Malformed records are rejected here, not later.
    pub fn enqueue(&mut self, request: Request) -> Result<(), RequestError> {
        let request = request.normalize()?;
        tracing::debug!(method = %request.method, path = %request.path, "Request queued");
        self.requests.push_back(request);
        Ok(())
    }

    /// Queues a request built from the given parts.
    pub fn request(
        &mut self,
        method: Method,
        path: impl Into<String>,
        headers: Headers,
    ) -> Result<(), RequestError> {
        let mut request = Request::new(method, path);
        request.headers = headers;
        self.enqueue(request)
    }

    /// Queues the configured default request.
    pub fn transmit(&mut self) -> Result<(), RequestError> {
        self.request(
            self.config.method,
            self.config.path.clone(),
            self.config.headers.clone(),
        )
    }

    /// Requests queued and not yet sent.
    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    /// The request whose response is being read.
    pub fn in_flight(&self) -> Option<&Request> {
        self.in_flight.as_ref()
    }

    /// Redirect responses followed so far for the request in flight.
    pub fn redirects(&self) -> &[Response] {
        &self.redirects
    }

    /// Whether the outstanding work outlived a deadline: the connect attempt
    /// ran past `timeout`, or the response went idle past `idle_timeout`.
    pub fn waited(&self) -> bool {
        self.waited
    }

    pub fn responses(&self) -> &VecDeque<Response> {
        &self.responses
    }

    pub fn pop_response(&mut self) -> Option<Response> {
        self.responses.pop_front()
    }

    pub fn events(&self) -> &VecDeque<Event> {
        &self.events
    }

    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Closes the connection. A request in flight is finalized as errored;
    /// queued requests stay queued and reopen it on the next service pass.
    pub fn close(&mut self) {
        if let Some(request) = self.in_flight.take() {
            let redirects = std::mem::take(&mut self.redirects);
            self.responses
                .push_back(Response::failed(request, redirects, "connection closed"));
        }
        self.connection.close();
        self.parser.discard(Method::GET);
        self.reconnect = None;
    }

    /// Runs one full service pass. Never blocks.
    pub fn service_all(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();

        self.service_connect();
        self.dispatch();
        self.connection.service_send();
        self.connection.service_receive();
        self.service_rx();
        self.service_disconnect();
        self.service_timers();

        // The next queued request can go out as soon as the last one finished.
        self.dispatch();
        self.connection.service_send();
    }

    fn service_connect(&mut self) {
        match self.connection.state() {
            ConnectionState::Connecting | ConnectionState::Handshaking => {
                if self.connection.service_connect() {
                    tracing::debug!(
                        host = %self.connection.host(),
                        port = self.connection.port(),
                        "Connected"
                    );
                }
            }
            ConnectionState::Closed | ConnectionState::Cutoff => {
                match &self.reconnect {
                    Some(timer) if !timer.expired() => return,
                    Some(_) => {}
                    None if self.requests.is_empty() => return,
                    None => {}
                }
                self.reconnect = None;

                if let Some(mut front) = self.requests.pop_front() {
                    self.fill_endpoint(&mut front);
                    if !self.aims_at_connection(&mut front) {
                        self.retarget(&front);
                    }
                    self.requests.push_front(front);
                }
                self.open();
            }
            ConnectionState::Connected => {}
        }
    }

    fn open(&mut self) {
        tracing::debug!(
            host = %self.connection.host(),
            port = self.connection.port(),
            "Opening connection"
        );
        if let Err(err) = self.connection.open() {
            tracing::debug!(error = %err, "Open failed");
        }
    }

    fn retarget(&mut self, request: &Request) {
        let host = request.host.clone().unwrap_or_else(|| self.config.host.clone());
        let scheme = request.scheme.unwrap_or(self.config.scheme);
        let port = request.port.unwrap_or(scheme.default_port());
        tracing::info!(host = %host, port, scheme = %scheme, "Retargeting connection");
        self.connection.retarget(host.clone(), port, scheme);
        self.requester.retarget(host, port, scheme);
        self.parser.discard(request.method);
    }

    /// Fills the endpoint fields a request left open from the configured
    /// target, wherever a redirect may have moved the connection since.
    fn fill_endpoint(&self, request: &mut Request) {
        if request.host.is_none() {
            request.host = Some(self.config.host.clone());
            request.port = request.port.or(Some(self.config.port()));
            request.scheme = request.scheme.or(Some(self.config.scheme));
        }
        let scheme = *request.scheme.get_or_insert(self.config.scheme);
        request.port.get_or_insert(scheme.default_port());
    }

    /// Whether the connection already points at the request's endpoint.
    ///
    /// Another spelling of the same address counts; the request then takes
    /// the connection's host name.
    fn aims_at_connection(&self, request: &mut Request) -> bool {
        let (Some(host), Some(port), Some(scheme)) =
            (request.host.as_deref(), request.port, request.scheme)
        else {
            return true;
        };
        if scheme != self.connection.scheme() {
            return false;
        }
        if host.eq_ignore_ascii_case(self.connection.host()) && port == self.connection.port() {
            return true;
        }
        // TLS identity is tied to the name, so only plain connections may alias.
        if scheme == crate::http::request::Scheme::Http
            && same_address((host, port), (self.connection.host(), self.connection.port()))
        {
            request.host = Some(self.connection.host().to_string());
            return true;
        }
        false
    }

    /// Sends the next queued request when the connection is free.
    fn dispatch(&mut self) {
        if !self.connection.connected()
            || self.connection.peer_closed()
            || self.in_flight.is_some()
        {
            return;
        }
        let Some(mut request) = self.requests.pop_front() else {
            return;
        };

        self.fill_endpoint(&mut request);
        if !self.aims_at_connection(&mut request) {
            self.retarget(&request);
            self.requests.push_front(request);
            self.open();
            return;
        }

        match self.requester.build(&request) {
            Ok(msg) => {
                tracing::debug!(
                    method = %request.method,
                    path = %request.path,
                    bytes = msg.len(),
                    "Request dispatched"
                );
                self.connection.enqueue_send(&msg);
                self.parser.reset(request.method);
                self.in_flight = Some(request);
                self.waited = false;
                if let Some(idle) = &mut self.idle {
                    idle.restart(None);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %request.path, "Request could not be built");
                let redirects = std::mem::take(&mut self.redirects);
                self.responses
                    .push_back(Response::failed(request, redirects, err.to_string()));
            }
        }
    }

    /// Feeds received bytes to the parser and acts on what it finds.
    fn service_rx(&mut self) {
        if self.in_flight.is_none() {
            return;
        }
        let rx = self.connection.take_rx();
        if !rx.is_empty() {
            self.waited = false;
            if let Some(idle) = &mut self.idle {
                idle.restart(None);
            }
        }
        self.parser.consume(&rx);
        self.service_parser();
    }

    fn service_parser(&mut self) {
        let Some(request) = self.in_flight.as_ref() else {
            return;
        };

        if self.parser.streaming() {
            self.events.extend(self.parser.drain_events());
        }

        if self.parser.errored() {
            let error = self
                .parser
                .error()
                .map(|e| e.to_string())
                .unwrap_or_default();
            tracing::warn!(error = %error, path = %request.path, "Response parse failed");
            self.finalize(None);
            // Framing is lost; whatever follows on this connection is garbage.
            self.connection.close();
            self.parser.discard(Method::GET);
            if self.config.reconnectable {
                self.schedule_reconnect();
            }
            return;
        }

        if self.config.redirectable && self.parser.is_redirect() {
            self.service_redirect();
            return;
        }

        if self.parser.ended() {
            self.finalize(None);
        }
    }

    fn service_redirect(&mut self) {
        let Some(request) = self.in_flight.as_ref() else {
            return;
        };

        if self.redirects.len() >= self.config.max_redirects {
            if self.parser.ended() {
                tracing::warn!(limit = self.config.max_redirects, "Redirect limit exceeded");
                self.finalize(Some("redirect limit exceeded".to_string()));
            }
            return;
        }

        let location = self.parser.location().unwrap_or_default().to_string();
        let mut next = match redirect::follow(request, self.parser.status(), &location) {
            Ok(next) => next,
            Err(err) => {
                if self.parser.ended() {
                    self.finalize(Some(err.to_string()));
                }
                return;
            }
        };
        self.fill_endpoint(&mut next);
        let same_endpoint = self.aims_at_connection(&mut next);

        // A redirect elsewhere does not need the rest of this body.
        if same_endpoint && !self.parser.ended() {
            return;
        }

        let Some(request) = self.in_flight.take() else {
            return;
        };
        tracing::info!(
            status = self.parser.status().as_u16(),
            location = %location,
            hops = self.redirects.len() + 1,
            "Following redirect"
        );
        let response = self.parser.take_response(request, Vec::new());
        self.redirects.push(response);
        self.requests.push_front(next);

        if same_endpoint {
            self.parser.reset(Method::GET);
        } else {
            self.connection.close();
            self.parser.discard(Method::GET);
        }
    }

    /// Moves the parsed response for the request in flight to the queue.
    fn finalize(&mut self, error: Option<String>) {
        let Some(request) = self.in_flight.take() else {
            return;
        };
        let redirects = std::mem::take(&mut self.redirects);
        let mut response = self.parser.take_response(request, redirects);
        if let Some(error) = error {
            response.errored = true;
            response.error = Some(error);
        }
        tracing::debug!(
            status = response.status.as_u16(),
            bytes = response.body.len(),
            errored = response.errored,
            "Response complete"
        );
        self.responses.push_back(response);
        self.waited = false;
    }

    /// Deals with a connection that was cut off or closed by the peer.
    fn service_disconnect(&mut self) {
        let cutoff = self.connection.cutoff();
        if !cutoff && !self.connection.peer_closed() {
            return;
        }

        if !cutoff && self.in_flight.is_some() {
            // Bodies framed by connection close end here.
            let rest = self.connection.take_rx();
            self.parser.consume(&rest);
            self.parser.close();
            self.service_parser();
        }

        let error = self
            .connection
            .error()
            .map(str::to_string)
            .unwrap_or_else(|| ConnectionError::PeerClosed.to_string());

        if let Some(mut request) = self.in_flight.take() {
            let resend = self.config.reconnectable
                && match self.config.resend {
                    ResendPolicy::Never => false,
                    ResendPolicy::Streams => self.parser.streaming(),
                    ResendPolicy::Always => true,
                };
            if resend {
                if !self.parser.leid().is_empty() {
                    request.headers.set("Last-Event-Id", self.parser.leid());
                }
                tracing::info!(path = %request.path, leid = %self.parser.leid(), "Resending interrupted request");
                self.requests.push_front(request);
            } else {
                tracing::warn!(path = %request.path, error = %error, "Request aborted by disconnect");
                let redirects = std::mem::take(&mut self.redirects);
                let response = if self.parser.headed() {
                    let mut response = self.parser.take_response(request, redirects);
                    response.errored = true;
                    response.error = Some(error.clone());
                    response
                } else {
                    Response::failed(request, redirects, error.clone())
                };
                self.responses.push_back(response);
            }
        }

        self.parser.discard(Method::GET);
        self.connection.close();

        if self.config.reconnectable {
            self.schedule_reconnect();
        } else if cutoff {
            for request in self.requests.drain(..) {
                let redirects = std::mem::take(&mut self.redirects);
                self.responses
                    .push_back(Response::failed(request, redirects, error.clone()));
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self
            .parser
            .retry()
            .map(|ms| ms as f64 / 1000.0)
            .unwrap_or(self.config.reconnect_delay);
        tracing::info!(delay, "Reconnect scheduled");
        self.reconnect = Some(Timer::new(&self.clock, delay));
    }

    /// Expired deadlines only raise `waited`; the caller decides what to close.
    fn service_timers(&mut self) {
        if self.waited {
            return;
        }
        let outstanding = self.in_flight.is_some() || !self.requests.is_empty();
        if outstanding && self.connection.timed_out() {
            tracing::debug!(
                host = %self.connection.host(),
                port = self.connection.port(),
                "Connect deadline passed"
            );
            self.waited = true;
            return;
        }
        if self.in_flight.is_none() || self.parser.ended() {
            return;
        }
        if self.idle.as_ref().is_some_and(Timer::expired) {
            tracing::debug!(
                streaming = self.parser.streaming(),
                "Response idle past deadline"
            );
            self.waited = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_rejects_conflicting_bodies() {
        let clock = VirtualClock::default();
        let mut client = Client::new(Config::default(), &clock);
        let mut request = Request::new(Method::POST, "/");
        request.body = b"raw".to_vec();
        request.data = Some(serde_json::json!({"a": 1}));
        assert!(matches!(
            client.enqueue(request),
            Err(RequestError::ConflictingBody)
        ));
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn enqueue_rejects_header_injection() {
        let clock = VirtualClock::default();
        let mut client = Client::new(Config::default(), &clock);
        let headers: Headers = [("X-Note", "x\r\nInjected: 1")].into_iter().collect();
        assert!(matches!(
            client.request(Method::GET, "/", headers),
            Err(RequestError::InvalidHeader(_))
        ));
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn transmit_queues_configured_default() {
        let clock = VirtualClock::default();
        let config = Config {
            path: "/status?verbose=1".to_string(),
            ..Config::default()
        };
        let mut client = Client::new(config, &clock);
        client.transmit().unwrap();
        assert_eq!(client.pending(), 1);
    }

    #[test]
    fn fills_endpoint_from_configured_target() {
        let clock = VirtualClock::default();
        let config = Config {
            port: Some(6101),
            ..Config::default()
        };
        let mut client = Client::new(config, &clock);
        let elsewhere = Request::new(Method::GET, "http://localhost:6102/")
            .normalize()
            .unwrap();
        client.retarget(&elsewhere);
        assert_eq!(client.connection().port(), 6102);

        let mut request = Request::new(Method::GET, "/");
        client.fill_endpoint(&mut request);
        assert_eq!(request.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(request.port, Some(6101));
        assert!(!client.aims_at_connection(&mut request));
    }
}
