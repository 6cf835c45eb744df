use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::http::headers::Headers;
use crate::http::request::{Method, Scheme};

/// What happens to a request that was in flight when its connection dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResendPolicy {
    /// Finalize it as errored; the caller re-enqueues if it wants a retry.
    #[default]
    Never,
    /// Regenerate event-stream requests so the stream resumes with
    /// `Last-Event-Id`. Anything else is finalized as errored.
    Streams,
    /// Regenerate every interrupted request.
    Always,
}

/// TLS files and peer identity. Paths point at PEM files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub keypath: Option<PathBuf>,
    pub certpath: Option<PathBuf>,
    pub cafilepath: Option<PathBuf>,
    /// Name the server certificate must carry; the target host when unset.
    pub certedhost: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    /// Target port; the scheme's default when unset.
    pub port: Option<u16>,
    pub scheme: Scheme,
    pub method: Method,
    pub path: String,
    pub headers: Headers,
    pub reconnectable: bool,
    pub redirectable: bool,
    pub max_redirects: usize,
    /// Connect plus handshake deadline, seconds.
    pub timeout: Option<f64>,
    /// Seconds without new bytes before an outstanding response counts as waited.
    pub idle_timeout: Option<f64>,
    /// Seconds to wait before reopening after a disconnect.
    pub reconnect_delay: f64,
    pub bufsize: usize,
    pub resend: ResendPolicy,
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            scheme: Scheme::Http,
            method: Method::GET,
            path: "/".to_string(),
            headers: Headers::new(),
            reconnectable: false,
            redirectable: true,
            max_redirects: 10,
            timeout: None,
            idle_timeout: None,
            reconnect_delay: 0.0,
            bufsize: 8192,
            resend: ResendPolicy::Never,
            tls: None,
        }
    }
}

impl Config {
    /// Loads configuration from the environment.
    ///
    /// `COURIER_CONFIG` names a YAML file. Otherwise `COURIER_TARGET` is a URL
    /// that seeds the endpoint. Otherwise defaults.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var("COURIER_CONFIG") {
            return Self::from_yaml_file(path);
        }
        if let Ok(target) = std::env::var("COURIER_TARGET") {
            return Self::from_url(&target);
        }
        Ok(Self::default())
    }

    /// Seeds endpoint and path from an absolute URL.
    pub fn from_url(target: &str) -> anyhow::Result<Self> {
        let mut config = Self::default();
        config.set_target(target)?;
        Ok(config)
    }

    /// Points an existing config at `target`, keeping everything else.
    pub fn set_target(&mut self, target: &str) -> anyhow::Result<()> {
        let url = url::Url::parse(target).with_context(|| format!("invalid target URL {target}"))?;
        let scheme: Scheme = url.scheme().parse()?;
        let host = url
            .host_str()
            .with_context(|| format!("target URL {target} has no host"))?;

        self.scheme = scheme;
        self.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        self.port = url.port();
        self.path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("invalid client configuration")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("in {}", path.display()))
    }

    /// Effective target port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(self.scheme.default_port())
    }
}
