//! Non-blocking client connection.
//!
//! A [`Connection`] owns one socket plus FIFO send and receive buffers. None
//! of its operations wait: each `service_*` call does whatever the socket
//! allows right now and returns.
//!
//! ```text
//!        ┌──────────┐  open()   ┌────────────┐ accepted ┌─────────────┐
//!        │  Closed  │──────────▶│ Connecting │─────────▶│ Handshaking │ (TLS only)
//!        └──────────┘           └─────┬──────┘          └──────┬──────┘
//!             ▲                       │ error/timeout          │ verified
//!             │ close()               ▼                        ▼
//!             │                 ┌────────────┐  error   ┌─────────────┐
//!             └─────────────────│   Cutoff   │◀─────────│  Connected  │
//!                               └────────────┘          └─────────────┘
//! ```
//!
//! An orderly shutdown by the peer does not change the state; it sets the
//! `peer_closed` flag, which the owner inspects.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::config::TlsConfig;
use crate::error::ConnectionError;
use crate::http::request::Scheme;
use crate::timing::{Timer, VirtualClock};

/// Default receive chunk size.
pub const BUFFER_SIZE: usize = 8192;

/// Reads per `service_receive` call before yielding to the caller.
const MAX_READS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Handshaking,
    Connected,
    Cutoff,
}

pub struct Connection {
    host: String,
    port: u16,
    scheme: Scheme,
    tls_settings: Option<TlsConfig>,
    tls_config: Option<Arc<ClientConfig>>,
    socket: Option<Socket>,
    stream: Option<TcpStream>,
    tls: Option<ClientConnection>,
    state: ConnectionState,
    accepted: bool,
    certified: bool,
    peer_closed: bool,
    error: Option<String>,
    tx: BytesMut,
    rx: BytesMut,
    scratch: Vec<u8>,
    reconnectable: bool,
    timeout: Option<f64>,
    timer: Timer,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl Connection {
    pub fn new(host: impl Into<String>, port: u16, scheme: Scheme, clock: &VirtualClock) -> Self {
        Self {
            host: host.into(),
            port,
            scheme,
            tls_settings: None,
            tls_config: None,
            socket: None,
            stream: None,
            tls: None,
            state: ConnectionState::Closed,
            accepted: false,
            certified: false,
            peer_closed: false,
            error: None,
            tx: BytesMut::new(),
            rx: BytesMut::new(),
            scratch: vec![0; BUFFER_SIZE],
            reconnectable: false,
            timeout: None,
            timer: Timer::new(clock, 0.0),
            local_addr: None,
            remote_addr: None,
        }
    }

    /// TLS files and expected peer name, used when the scheme is https.
    pub fn with_tls(mut self, settings: TlsConfig) -> Self {
        self.tls_settings = Some(settings);
        self.tls_config = None;
        self
    }

    /// Deadline in virtual seconds for connect plus handshake.
    pub fn with_timeout(mut self, timeout: Option<f64>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_bufsize(mut self, bufsize: usize) -> Self {
        self.scratch = vec![0; bufsize.max(1)];
        self
    }

    pub fn with_reconnectable(mut self, reconnectable: bool) -> Self {
        self.reconnectable = reconnectable;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnectable(&self) -> bool {
        self.reconnectable
    }

    /// TCP connect finished.
    pub fn accepted(&self) -> bool {
        self.accepted
    }

    /// Ready for application bytes: TCP connected and, for TLS, handshake done.
    pub fn connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn connecting(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Handshaking
        )
    }

    /// TLS peer certificate verified against the CA and certified host.
    pub fn certified(&self) -> bool {
        self.certified
    }

    pub fn cutoff(&self) -> bool {
        self.state == ConnectionState::Cutoff
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Description of the failure that cut the connection off.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Bytes waiting to be sent.
    pub fn tx_len(&self) -> usize {
        self.tx.len()
    }

    /// Whether everything enqueued has left for the socket, TLS records included.
    pub fn flushed(&self) -> bool {
        self.tx.is_empty() && self.tls.as_ref().is_none_or(|tls| !tls.wants_write())
    }

    pub fn rx(&self) -> &[u8] {
        &self.rx
    }

    /// Takes every received byte out of the receive buffer.
    pub fn take_rx(&mut self) -> BytesMut {
        self.rx.split()
    }

    pub fn clear_rx(&mut self) {
        self.rx.clear();
    }

    /// Points the connection at a new endpoint. Closes the current socket.
    pub fn retarget(&mut self, host: impl Into<String>, port: u16, scheme: Scheme) {
        self.close();
        self.host = host.into();
        self.port = port;
        if scheme != self.scheme {
            self.tls_config = None;
        }
        self.scheme = scheme;
    }

    /// Starts a non-blocking connect on a fresh socket.
    ///
    /// Any previous socket is closed and both buffers are cleared first. An
    /// error also leaves the connection cut off.
    pub fn open(&mut self) -> Result<(), ConnectionError> {
        self.close();
        self.error = None;
        match self.start_connect() {
            Ok(()) => {
                self.state = ConnectionState::Connecting;
                self.timer.restart(Some(self.timeout.unwrap_or(f64::INFINITY)));
                tracing::debug!(host = %self.host, port = self.port, scheme = %self.scheme, "Connecting");
                self.check_connect();
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn start_connect(&mut self) -> Result<(), ConnectionError> {
        if self.scheme == Scheme::Https && self.tls_config.is_none() {
            self.tls_config = Some(client_tls_config(self.tls_settings.as_ref())?);
        }

        let addr = resolve(&self.host, self.port)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(ConnectionError::Socket)?;
        socket.set_nonblocking(true).map_err(ConnectionError::Socket)?;
        socket.set_nodelay(true).map_err(ConnectionError::Socket)?;

        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(ConnectionError::Io(e)),
        }
        self.remote_addr = Some(addr);
        self.socket = Some(socket);
        Ok(())
    }

    /// Advances an in-progress connect and TLS handshake.
    ///
    /// Returns whether the connection is now ready for application bytes.
    pub fn service_connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Connecting => self.check_connect(),
            ConnectionState::Handshaking => self.drive_handshake(),
            _ => {}
        }
        self.connected()
    }

    /// Whether a connect or handshake still in progress ran past its deadline.
    ///
    /// Advisory only: the attempt keeps going until the owner closes it.
    pub fn timed_out(&self) -> bool {
        self.connecting() && self.timeout.is_some() && self.timer.expired()
    }

    fn check_connect(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        match socket.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                self.fail(&ConnectionError::Io(e));
                return;
            }
        }
        match socket.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
            Err(e) if connect_in_progress(&e) => return,
            Err(e) => {
                self.fail(&ConnectionError::Io(e));
                return;
            }
        }

        let Some(socket) = self.socket.take() else {
            return;
        };
        let stream: TcpStream = socket.into();
        self.local_addr = stream.local_addr().ok();
        self.remote_addr = stream.peer_addr().ok().or(self.remote_addr);
        self.stream = Some(stream);
        self.accepted = true;

        tracing::debug!(
            local = ?self.local_addr,
            remote = ?self.remote_addr,
            "TCP connection accepted"
        );

        if self.scheme == Scheme::Https {
            match self.start_tls() {
                Ok(()) => {
                    self.state = ConnectionState::Handshaking;
                    self.drive_handshake();
                }
                Err(err) => self.fail(&err),
            }
        } else {
            self.state = ConnectionState::Connected;
        }
    }

    fn start_tls(&mut self) -> Result<(), ConnectionError> {
        let config = match &self.tls_config {
            Some(config) => config.clone(),
            None => {
                let config = client_tls_config(self.tls_settings.as_ref())?;
                self.tls_config = Some(config.clone());
                config
            }
        };
        let name = self
            .tls_settings
            .as_ref()
            .and_then(|s| s.certedhost.clone())
            .unwrap_or_else(|| self.host.clone());
        let server_name = ServerName::try_from(name.clone())
            .map_err(|_| ConnectionError::ServerName(name))?;
        self.tls = Some(ClientConnection::new(config, server_name)?);
        Ok(())
    }

    fn drive_handshake(&mut self) {
        let (Some(stream), Some(tls)) = (self.stream.as_mut(), self.tls.as_mut()) else {
            return;
        };
        let eof = match pump_tls(tls, stream) {
            Ok(eof) => eof,
            Err(err) => {
                self.fail(&err);
                return;
            }
        };
        if !tls.is_handshaking() {
            self.certified = true;
            self.state = ConnectionState::Connected;
            tracing::debug!(
                host = %self.host,
                protocol = ?tls.protocol_version(),
                "TLS handshake complete"
            );
        } else if eof {
            self.fail(&ConnectionError::PeerClosed);
        }
    }

    /// Appends bytes to the send buffer.
    pub fn enqueue_send(&mut self, bytes: &[u8]) {
        self.tx.extend_from_slice(bytes);
    }

    /// Writes as much of the send buffer as the socket takes in one go.
    ///
    /// Returns the number of buffered bytes consumed.
    pub fn service_send(&mut self) -> usize {
        if !self.connected() {
            return 0;
        }
        let result = match (self.stream.as_mut(), self.tls.as_mut()) {
            (Some(stream), None) => match stream.write(&self.tx) {
                Ok(n) => Ok(n),
                Err(e) if is_transient(&e) => Ok(0),
                Err(e) => Err(ConnectionError::Io(e)),
            },
            (Some(stream), Some(tls)) => {
                let written = if self.tx.is_empty() {
                    Ok(0)
                } else {
                    tls.writer().write(&self.tx).map_err(ConnectionError::Io)
                };
                written.and_then(|n| flush_tls(tls, stream).map(|_| n))
            }
            _ => Ok(0),
        };
        match result {
            Ok(n) => {
                self.tx.advance(n);
                if n > 0 {
                    tracing::trace!(bytes = n, remaining = self.tx.len(), "Sent");
                }
                n
            }
            Err(err) => {
                self.fail(&err);
                0
            }
        }
    }

    /// Reads whatever has arrived into the receive buffer.
    ///
    /// Returns the number of bytes added. An orderly shutdown by the peer sets
    /// [`Connection::peer_closed`].
    pub fn service_receive(&mut self) -> usize {
        if !self.connected() || self.peer_closed {
            return 0;
        }
        let result = match (self.stream.as_mut(), self.tls.as_mut()) {
            (Some(stream), None) => read_plain(stream, &mut self.scratch, &mut self.rx),
            (Some(stream), Some(tls)) => read_tls(tls, stream, &mut self.scratch, &mut self.rx),
            _ => Ok((0, false)),
        };
        match result {
            Ok((n, eof)) => {
                if n > 0 {
                    tracing::trace!(bytes = n, "Received");
                }
                if eof {
                    tracing::debug!(host = %self.host, port = self.port, "Peer closed connection");
                    self.peer_closed = true;
                }
                n
            }
            Err(err) => {
                self.fail(&err);
                0
            }
        }
    }

    /// Releases the socket and clears both buffers. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let (Some(stream), Some(tls)) = (self.stream.as_mut(), self.tls.as_mut()) {
            tls.send_close_notify();
            let _ = flush_tls(tls, stream);
        }
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.socket = None;
        self.tls = None;
        self.tx.clear();
        self.rx.clear();
        self.accepted = false;
        self.certified = false;
        self.peer_closed = false;
        self.local_addr = None;
        // `error` survives so the cause of a cutoff stays visible.
        self.state = ConnectionState::Closed;
    }

    fn fail(&mut self, err: &ConnectionError) {
        tracing::warn!(host = %self.host, port = self.port, error = %err, "Connection cut off");
        self.socket = None;
        self.tls = None;
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.error = Some(err.to_string());
        self.state = ConnectionState::Cutoff;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Socket addresses for `host:port`. IP literals never touch the resolver.
///
/// Any other name goes through the system resolver, which blocks.
fn addresses(host: &str, port: u16) -> Vec<SocketAddr> {
    if let Ok(ip) = IpAddr::from_str(host) {
        return vec![SocketAddr::new(ip, port)];
    }
    (host, port)
        .to_socket_addrs()
        .map(|addrs| addrs.collect())
        .unwrap_or_default()
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectionError> {
    addresses(host, port)
        .into_iter()
        .next()
        .ok_or_else(|| ConnectionError::Resolve {
            host: host.to_string(),
            port,
        })
}

/// Whether two endpoints name the same socket address.
///
/// Two IP literals compare without a lookup; a host name costs a blocking
/// resolver call.
pub fn same_address(a: (&str, u16), b: (&str, u16)) -> bool {
    if a.1 != b.1 {
        return false;
    }
    if a.0.eq_ignore_ascii_case(b.0) {
        return true;
    }
    let left = addresses(a.0, a.1);
    addresses(b.0, b.1).iter().any(|addr| left.contains(addr))
}

fn connect_in_progress(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EINPROGRESS)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn read_plain(
    stream: &mut TcpStream,
    scratch: &mut [u8],
    rx: &mut BytesMut,
) -> Result<(usize, bool), ConnectionError> {
    let mut total = 0;
    for _ in 0..MAX_READS {
        match stream.read(scratch) {
            Ok(0) => return Ok((total, true)),
            Ok(n) => {
                rx.extend_from_slice(&scratch[..n]);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(ConnectionError::Io(e)),
        }
    }
    Ok((total, false))
}

fn read_tls(
    tls: &mut ClientConnection,
    stream: &mut TcpStream,
    scratch: &mut [u8],
    rx: &mut BytesMut,
) -> Result<(usize, bool), ConnectionError> {
    let eof = pump_tls(tls, stream)?;
    let mut total = 0;
    loop {
        match tls.reader().read(scratch) {
            Ok(0) => return Ok((total, true)),
            Ok(n) => {
                rx.extend_from_slice(&scratch[..n]);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok((total, true)),
            Err(e) => return Err(ConnectionError::Io(e)),
        }
    }
    Ok((total, eof))
}

/// Moves TLS records between the session and the socket without blocking.
///
/// Returns whether the socket reported end of stream.
fn pump_tls(tls: &mut ClientConnection, stream: &mut TcpStream) -> Result<bool, ConnectionError> {
    flush_tls(tls, stream)?;
    let mut eof = false;
    for _ in 0..MAX_READS {
        if !tls.wants_read() {
            break;
        }
        match tls.read_tls(stream) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(_) => {
                if let Err(err) = tls.process_new_packets() {
                    // Best effort to tell the peer why before giving up.
                    let _ = flush_tls(tls, stream);
                    return Err(err.into());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(ConnectionError::Io(e)),
        }
    }
    flush_tls(tls, stream)?;
    Ok(eof)
}

fn flush_tls(tls: &mut ClientConnection, stream: &mut TcpStream) -> Result<(), ConnectionError> {
    while tls.wants_write() {
        match tls.write_tls(stream) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if is_transient(&e) => break,
            Err(e) => return Err(ConnectionError::Io(e)),
        }
    }
    Ok(())
}

/// Client TLS configuration from PEM files.
///
/// Without a CA file the bundled web roots are trusted. Client authentication
/// is offered only when both key and certificate paths are set.
fn client_tls_config(settings: Option<&TlsConfig>) -> Result<Arc<ClientConfig>, ConnectionError> {
    let mut roots = RootCertStore::empty();
    match settings.and_then(|s| s.cafilepath.as_deref()) {
        Some(path) => {
            let certs = CertificateDer::pem_file_iter(path).map_err(|e| pem_error(path, e))?;
            for cert in certs {
                let cert = cert.map_err(|e| pem_error(path, e))?;
                roots.add(cert).map_err(|e| pem_error(path, e))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots);

    let keypair = settings.and_then(|s| Some((s.keypath.as_deref()?, s.certpath.as_deref()?)));
    let config = match keypair {
        Some((keypath, certpath)) => {
            let certs = CertificateDer::pem_file_iter(certpath)
                .map_err(|e| pem_error(certpath, e))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| pem_error(certpath, e))?;
            let key = PrivateKeyDer::from_pem_file(keypath).map_err(|e| pem_error(keypath, e))?;
            builder.with_client_auth_cert(certs, key)?
        }
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

fn pem_error(path: &Path, err: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::TlsConfig(format!("{}: {}", path.display(), err))
}
