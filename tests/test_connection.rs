//! Tests for the non-blocking connection

mod common;

use common::tls::TlsMockServer;
use common::{MAX_PASSES, MockServer};
use courier::TlsConfig;
use courier::http::connection::{Connection, ConnectionState};
use courier::{ConnectionError, Scheme, VirtualClock};

fn connect(conn: &mut Connection, server: &mut MockServer) {
    let before = server.connections();
    conn.open().unwrap();
    for _ in 0..MAX_PASSES {
        server.service();
        if conn.service_connect() && server.connections() > before {
            return;
        }
        std::thread::yield_now();
    }
    panic!("connection never completed");
}

#[test]
fn test_connect_send_receive() {
    let mut server = MockServer::bind();
    let clock = VirtualClock::default();
    let mut conn = Connection::new("127.0.0.1", server.port(), Scheme::Http, &clock);
    assert_eq!(conn.state(), ConnectionState::Closed);

    connect(&mut conn, &mut server);
    assert!(conn.accepted());
    assert!(conn.connected());
    assert!(!conn.certified());
    assert_eq!(conn.remote_addr().unwrap().port(), server.port());
    assert!(conn.local_addr().is_some());

    conn.enqueue_send(b"ping ");
    conn.enqueue_send(b"pong");
    assert_eq!(conn.tx_len(), 9);
    while !conn.flushed() {
        conn.service_send();
    }
    for _ in 0..MAX_PASSES {
        server.service();
        if server.conn(0).rx.len() == 9 {
            break;
        }
    }
    assert_eq!(server.conn(0).rx, b"ping pong");

    server.conn(0).send(b"hello");
    for _ in 0..MAX_PASSES {
        conn.service_receive();
        if conn.rx().len() == 5 {
            break;
        }
    }
    assert_eq!(conn.take_rx().as_ref(), b"hello");
    assert!(conn.rx().is_empty());
}

#[test]
fn test_peer_close_sets_flag() {
    let mut server = MockServer::bind();
    let clock = VirtualClock::default();
    let mut conn = Connection::new("127.0.0.1", server.port(), Scheme::Http, &clock);
    connect(&mut conn, &mut server);

    server.conn(0).send(b"bye");
    server.conn(0).close();
    for _ in 0..MAX_PASSES {
        conn.service_receive();
        if conn.peer_closed() {
            break;
        }
    }
    assert!(conn.peer_closed());
    assert!(!conn.cutoff());
    assert_eq!(conn.rx(), b"bye");

    conn.close();
    assert!(!conn.peer_closed());
    assert!(conn.rx().is_empty());
}

#[test]
fn test_reopen_gets_fresh_socket() {
    let mut server = MockServer::bind();
    let clock = VirtualClock::default();
    let mut conn = Connection::new("127.0.0.1", server.port(), Scheme::Http, &clock)
        .with_reconnectable(true);
    connect(&mut conn, &mut server);
    let first = conn.local_addr();
    conn.enqueue_send(b"stale");

    conn.close();
    assert_eq!(conn.tx_len(), 0);
    connect(&mut conn, &mut server);
    assert!(conn.reconnectable());
    assert_ne!(conn.local_addr(), first);
    assert_eq!(server.connections(), 2);
}

#[test]
fn test_retarget_moves_endpoint() {
    let mut a = MockServer::bind();
    let mut b = MockServer::bind();
    let clock = VirtualClock::default();
    let mut conn = Connection::new("127.0.0.1", a.port(), Scheme::Http, &clock);
    connect(&mut conn, &mut a);

    conn.retarget("127.0.0.1", b.port(), Scheme::Http);
    assert_eq!(conn.state(), ConnectionState::Closed);
    connect(&mut conn, &mut b);
    assert_eq!(conn.port(), b.port());
    assert_eq!(b.connections(), 1);
}

#[test]
fn test_missing_ca_file_cuts_off() {
    let clock = VirtualClock::default();
    let mut conn = Connection::new("localhost", 443, Scheme::Https, &clock).with_tls(TlsConfig {
        cafilepath: Some("/nonexistent/ca.pem".into()),
        ..TlsConfig::default()
    });
    let err = conn.open().unwrap_err();
    assert!(matches!(err, ConnectionError::TlsConfig(_)));
    assert!(conn.cutoff());
    assert!(conn.error().unwrap().starts_with("TLS configuration error"));
}

fn tls_connection(server: &TlsMockServer, certedhost: &str, clock: &VirtualClock) -> Connection {
    Connection::new("127.0.0.1", server.port(), Scheme::Https, clock).with_tls(TlsConfig {
        cafilepath: Some(server.ca_path.clone()),
        certedhost: Some(certedhost.to_string()),
        ..TlsConfig::default()
    })
}

#[test]
fn test_tls_echo_round_trip() {
    let mut server = TlsMockServer::bind();
    let clock = VirtualClock::default();
    let mut conn = tls_connection(&server, "localhost", &clock);

    conn.open().unwrap();
    for _ in 0..MAX_PASSES {
        server.service();
        if conn.service_connect() || conn.cutoff() {
            break;
        }
        std::thread::yield_now();
    }
    assert!(conn.connected(), "handshake failed: {:?}", conn.error());
    assert!(conn.accepted());
    assert!(conn.certified());

    conn.enqueue_send(b"GET /echo HTTP/1.1\r\n\r\n");
    for _ in 0..MAX_PASSES {
        conn.service_send();
        server.service();
        if server.connections() == 1 && server.conn(0).rx.len() == 22 {
            break;
        }
        std::thread::yield_now();
    }
    assert!(conn.flushed());
    assert!(!server.conn(0).handshaking());
    assert_eq!(server.conn(0).rx, b"GET /echo HTTP/1.1\r\n\r\n");

    server.conn(0).send(b"HTTP/1.1 204 No Content\r\n\r\n");
    for _ in 0..MAX_PASSES {
        conn.service_receive();
        server.service();
        if conn.rx().len() == 27 {
            break;
        }
        std::thread::yield_now();
    }
    assert_eq!(conn.take_rx().as_ref(), b"HTTP/1.1 204 No Content\r\n\r\n");
    assert!(!conn.cutoff());
}

#[test]
fn test_tls_wrong_certified_host_cuts_off() {
    let mut server = TlsMockServer::bind();
    let clock = VirtualClock::default();
    let mut conn = tls_connection(&server, "wrong.example", &clock);

    conn.open().unwrap();
    for _ in 0..MAX_PASSES {
        server.service();
        conn.service_connect();
        if conn.cutoff() {
            break;
        }
        std::thread::yield_now();
    }
    assert!(conn.cutoff());
    assert!(!conn.connected());
    assert!(!conn.certified());
    assert!(conn.error().unwrap().starts_with("TLS handshake failed"));
    assert_eq!(conn.service_send(), 0);
}

#[test]
fn test_send_before_connect_is_buffered() {
    let clock = VirtualClock::default();
    let mut conn = Connection::new("127.0.0.1", 9, Scheme::Http, &clock);
    conn.enqueue_send(b"early");
    assert_eq!(conn.service_send(), 0);
    assert_eq!(conn.service_receive(), 0);
    assert_eq!(conn.tx_len(), 5);
}
