//! In-process mock HTTP server for socket tests.
//!
//! The server is non-blocking and polled from the test thread, alternating
//! with `Client::service_all`, so both endpoints advance cooperatively.

#![allow(dead_code)]

pub mod tls;

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

use courier::Client;

/// Passes before a drive loop gives up.
pub const MAX_PASSES: usize = 20_000;

pub struct MockServer {
    listener: TcpListener,
    conns: Vec<MockConn>,
}

pub struct MockConn {
    stream: Option<TcpStream>,
    pub rx: Vec<u8>,
    pub peer_closed: bool,
}

impl MockServer {
    pub fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        listener.set_nonblocking(true).expect("nonblocking listener");
        Self {
            listener,
            conns: Vec::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().expect("local addr").port()
    }

    /// Accepts pending connections and reads whatever each has received.
    pub fn service(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true).expect("nonblocking stream");
                    stream.set_nodelay(true).ok();
                    self.conns.push(MockConn {
                        stream: Some(stream),
                        rx: Vec::new(),
                        peer_closed: false,
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

    pub fn conn(&mut self, index: usize) -> &mut MockConn {
        &mut self.conns[index]
    }
}

impl MockConn {
    fn service(&mut self) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => self.rx.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.peer_closed = true;
                    break;
                }
            }
        }
    }

    /// Takes one complete request (head plus Content-Length body) off `rx`.
    pub fn take_request(&mut self) -> Option<Vec<u8>> {
        let end = self.rx.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
        let head = String::from_utf8_lossy(&self.rx[..end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if self.rx.len() < end + length {
            return None;
        }
        Some(self.rx.drain(..end + length).collect())
    }

    pub fn send(&mut self, bytes: &[u8]) {
        let stream = self.stream.as_mut().expect("connection is open");
        let mut sent = 0;
        while sent < bytes.len() {
            match stream.write(&bytes[sent..]) {
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => panic!("send failed: {e}"),
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown(std::net::Shutdown::Both).ok();
        }
    }
}

/// Polls client and server until `until` holds. Returns whether it did.
pub fn drive<F>(client: &mut Client, server: &mut MockServer, mut until: F) -> bool
where
    F: FnMut(&mut Client, &mut MockServer) -> bool,
{
    for _ in 0..MAX_PASSES {
        client.service_all();
        server.service();
        if until(client, server) {
            return true;
        }
        std::thread::yield_now();
    }
    false
}

/// Drives until connection `index` holds a full request and returns it.
pub fn receive_request(client: &mut Client, server: &mut MockServer, index: usize) -> Vec<u8> {
    let mut request = None;
    let done = drive(client, server, |_, server| {
        if server.connections() > index {
            request = server.conn(index).take_request();
        }
        request.is_some()
    });
    assert!(done, "no request arrived on connection {index}");
    request.unwrap_or_default()
}

/// `HTTP/1.1 200 OK` with a JSON body and matching length.
pub fn json_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}
