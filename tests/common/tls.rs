//! TLS flavour of the mock server, backed by a self-signed `localhost` cert.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ServerConfig, ServerConnection};

static NEXT_CA: AtomicUsize = AtomicUsize::new(0);

pub struct TlsMockServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    conns: Vec<TlsMockConn>,
    /// PEM file holding the server certificate, trusted as the CA.
    pub ca_path: PathBuf,
}

pub struct TlsMockConn {
    stream: TcpStream,
    tls: ServerConnection,
    pub rx: Vec<u8>,
    /// The handshake or a record failed on the server side.
    pub failed: bool,
}

impl TlsMockServer {
    pub fn bind() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .expect("generate certificate");
        let ca_path = std::env::temp_dir().join(format!(
            "courier-ca-{}-{}.pem",
            std::process::id(),
            NEXT_CA.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&ca_path, cert.cert.pem()).expect("write CA file");

        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));
        let certs = vec![CertificateDer::from(cert.cert)];
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .expect("server certificate");

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind TLS mock server");
        listener.set_nonblocking(true).expect("nonblocking listener");
        Self {
            listener,
            config: Arc::new(config),
            conns: Vec::new(),
            ca_path,
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().expect("local addr").port()
    }

    /// Accepts pending connections and moves TLS records both ways.
    pub fn service(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true).expect("nonblocking stream");
                    self.conns.push(TlsMockConn {
                        stream,
                        tls: ServerConnection::new(self.config.clone()).expect("server session"),
                        rx: Vec::new(),
                        failed: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        for conn in &mut self.conns {
            conn.service();
        }
    }

    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    pub fn conn(&mut self, index: usize) -> &mut TlsMockConn {
        &mut self.conns[index]
    }
}

impl Drop for TlsMockServer {
    fn drop(&mut self) {
        std::fs::remove_file(&self.ca_path).ok();
    }
}

impl TlsMockConn {
    fn service(&mut self) {
        if self.failed {
            return;
        }
        loop {
            match self.tls.read_tls(&mut self.stream) {
                Ok(0) => break,
                Ok(_) => {
                    if self.tls.process_new_packets().is_err() {
                        self.failed = true;
                        self.flush();
                        return;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.failed = true;
                    return;
                }
            }
        }
        let mut buf = [0u8; 4096];
        loop {
            match self.tls.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.rx.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        self.flush();
    }

    fn flush(&mut self) {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(_) => break,
            }
        }
    }

    pub fn handshaking(&self) -> bool {
        self.tls.is_handshaking()
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.tls.writer().write_all(bytes).expect("buffer plaintext");
        self.flush();
    }
}
