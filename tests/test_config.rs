use courier::{Config, Method, ResendPolicy, Scheme};

#[test]
fn test_config_defaults() {
    let cfg = Config::default();
    assert_eq!(cfg.host, "127.0.0.1");
    assert_eq!(cfg.port(), 80);
    assert_eq!(cfg.scheme, Scheme::Http);
    assert_eq!(cfg.method, Method::GET);
    assert_eq!(cfg.path, "/");
    assert!(!cfg.reconnectable);
    assert!(cfg.redirectable);
    assert_eq!(cfg.max_redirects, 10);
    assert_eq!(cfg.resend, ResendPolicy::Never);
    assert!(cfg.tls.is_none());
}

#[test]
fn test_config_from_url() {
    let cfg = Config::from_url("https://example.com/events?topic=a").unwrap();
    assert_eq!(cfg.scheme, Scheme::Https);
    assert_eq!(cfg.host, "example.com");
    assert_eq!(cfg.port(), 443);
    assert_eq!(cfg.path, "/events?topic=a");

    let cfg = Config::from_url("http://127.0.0.1:6101/echo").unwrap();
    assert_eq!(cfg.port(), 6101);
}

#[test]
fn test_config_rejects_bad_url() {
    assert!(Config::from_url("not a url").is_err());
    assert!(Config::from_url("ftp://example.com/").is_err());
}

#[test]
fn test_config_from_yaml() {
    let cfg = Config::from_yaml_str(
        r#"
host: localhost
port: 6101
method: POST
path: /stream
headers:
  Accept: text/event-stream
  X-Trace: abc
reconnectable: true
idle_timeout: 0.5
reconnect_delay: 2
resend: streams
tls:
  cafilepath: /etc/ssl/ca.pem
  certedhost: localhost
"#,
    )
    .unwrap();

    assert_eq!(cfg.host, "localhost");
    assert_eq!(cfg.port(), 6101);
    assert_eq!(cfg.method, Method::POST);
    assert_eq!(cfg.headers.get("accept"), Some("text/event-stream"));
    let names: Vec<_> = cfg.headers.iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["Accept", "X-Trace"]);
    assert!(cfg.reconnectable);
    assert_eq!(cfg.idle_timeout, Some(0.5));
    assert_eq!(cfg.reconnect_delay, 2.0);
    assert_eq!(cfg.resend, ResendPolicy::Streams);
    let tls = cfg.tls.unwrap();
    assert_eq!(tls.certedhost.as_deref(), Some("localhost"));
    assert!(tls.keypath.is_none());
    // Unset fields keep their defaults.
    assert!(cfg.redirectable);
    assert_eq!(cfg.bufsize, 8192);
}

#[test]
fn test_config_yaml_errors() {
    assert!(Config::from_yaml_str("resend: sometimes").is_err());
    assert!(Config::from_yaml_file("/nonexistent/courier.yaml").is_err());
}

#[test]
fn test_config_load_from_env() {
    unsafe {
        std::env::remove_var("COURIER_CONFIG");
        std::env::remove_var("COURIER_TARGET");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg, Config::default());

    unsafe {
        std::env::set_var("COURIER_TARGET", "http://localhost:3000/health");
    }
    let cfg = Config::load().unwrap();
    assert_eq!(cfg.host, "localhost");
    assert_eq!(cfg.port(), 3000);
    assert_eq!(cfg.path, "/health");
    unsafe {
        std::env::remove_var("COURIER_TARGET");
    }
}

#[test]
fn test_config_clone() {
    let cfg1 = Config::from_url("http://example.com:8080/").unwrap();
    let cfg2 = cfg1.clone();
    assert_eq!(cfg1, cfg2);
}
