//! Configuration types for the pool, server, connector, and the process-wide
//! TLS options singleton.
//!
//! Applications are free to construct these structs directly; this module
//! additionally offers a `toml`-backed loader and a small builder for the
//! common case of a single static config file plus environment overrides.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration loaded from a single `toml` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetReactorConfig {
    pub pool: PoolConfig,
    pub server: ServerConfig,
    pub connector: ConnectorConfig,
    pub tls: Option<TlsOptions>,
}

/// Event-loop thread pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of worker loops. `0` means "use the number of available CPUs".
    pub thread_num: usize,
    pub name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { thread_num: 0, name: "netreactor-worker".to_string() }
    }
}

impl PoolConfig {
    /// Resolve `thread_num == 0` to the CPU count.
    pub fn resolved_thread_num(&self) -> usize {
        if self.thread_num == 0 {
            num_cpus::get().max(1)
        } else {
            self.thread_num
        }
    }
}

/// Server-side listen and keepalive behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Endpoints in `tcp://host:port` / `tls://host:port` form.
    pub listen_endpoints: Vec<String>,
    pub keepalive_idle_seconds: Option<u32>,
    pub dispatch_policy: DispatchPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_endpoints: Vec::new(),
            keepalive_idle_seconds: None,
            dispatch_policy: DispatchPolicy::RoundRobin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchPolicy {
    RoundRobin,
    FdHashing,
}

/// Outbound connection defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub connecting_timeout_ms: u64,
    pub need_retry: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self { connecting_timeout_ms: 3_000, need_retry: true }
    }
}

impl ConnectorConfig {
    pub fn connecting_timeout(&self) -> Duration {
        Duration::from_millis(self.connecting_timeout_ms)
    }
}

/// Process-wide TLS configuration. Constructed once and installed via
/// [`TlsOptions::install`]; subsequent reads clone the cached `Arc` handles
/// built from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Whitespace-separated subset of `TLSv1.2 TLSv1.3`; empty means both.
    pub tls_protocols: String,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub tls_auth_clients: bool,
    pub tls_ca_file: Option<String>,
    pub tls_session_caching: bool,
    pub tls_session_cache_size: usize,
    pub tls_session_cache_timeout_seconds: u64,
    pub tls_prefer_server_ciphers: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            tls_protocols: String::new(),
            tls_cert_file: String::new(),
            tls_key_file: String::new(),
            tls_auth_clients: false,
            tls_ca_file: None,
            tls_session_caching: true,
            tls_session_cache_size: 1024,
            tls_session_cache_timeout_seconds: 300,
            tls_prefer_server_ciphers: false,
        }
    }
}

impl TlsOptions {
    /// Validate the protocol token list, rejecting anything `rustls` cannot
    /// negotiate (TLS 1.0/1.1 are accepted by the grammar but rejected here).
    pub fn validate(&self) -> Result<()> {
        if self.tls_cert_file.is_empty() {
            return Err(Error::config("tls_cert_file is required"));
        }
        if self.tls_key_file.is_empty() {
            return Err(Error::config("tls_key_file is required"));
        }
        for token in self.tls_protocols.split_whitespace() {
            match token {
                "TLSv1.2" | "TLSv1.3" => {}
                "TLSv1" | "TLSv1.1" => {
                    return Err(Error::config(format!(
                        "protocol '{token}' is not supported by this build's TLS backend"
                    )))
                }
                other => return Err(Error::config(format!("unknown tls protocol token '{other}'"))),
            }
        }
        Ok(())
    }
}

static TLS_OPTIONS: OnceLock<TlsOptions> = OnceLock::new();

/// Install the process-wide TLS options singleton. Returns an error if
/// called more than once or if the options fail validation.
pub fn install_tls_options(options: TlsOptions) -> Result<()> {
    options.validate()?;
    TLS_OPTIONS
        .set(options)
        .map_err(|_| Error::config("tls options already installed"))
}

/// Read the installed TLS options, if any.
pub fn tls_options() -> Option<&'static TlsOptions> {
    TLS_OPTIONS.get()
}

impl NetReactorConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::config(format!("failed to read config file: {e}")))?;
        toml::from_str(&content).map_err(|e| Error::config(format!("failed to parse config: {e}")))
    }
}

/// Builder for the common case of assembling a config programmatically.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: NetReactorConfig,
}

impl Default for NetReactorConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            server: ServerConfig::default(),
            connector: ConnectorConfig::default(),
            tls: None,
        }
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self { config: NetReactorConfig::default() }
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn listen(mut self, endpoint: impl Into<String>) -> Self {
        self.config.server.listen_endpoints.push(endpoint.into());
        self
    }

    pub fn tls(mut self, cert_file: impl Into<String>, key_file: impl Into<String>) -> Self {
        self.config.tls = Some(TlsOptions {
            tls_cert_file: cert_file.into(),
            tls_key_file: key_file.into(),
            ..TlsOptions::default()
        });
        self
    }

    pub fn build(self) -> NetReactorConfig {
        self.config
    }
}

/// Applies `NETREACTOR_*` environment variable overrides on top of a loaded
/// configuration, mirroring the precedence applications typically want:
/// file defaults, then environment for per-deployment tuning.
pub struct EnvironmentOverrides {
    prefix: String,
}

impl EnvironmentOverrides {
    pub fn new() -> Self {
        Self { prefix: "NETREACTOR_".to_string() }
    }

    pub fn apply(&self, mut config: NetReactorConfig) -> NetReactorConfig {
        if let Ok(v) = std::env::var(format!("{}POOL_THREADS", self.prefix)) {
            if let Ok(n) = v.parse() {
                config.pool.thread_num = n;
            }
        }
        if let Ok(v) = std::env::var(format!("{}CONNECT_TIMEOUT_MS", self.prefix)) {
            if let Ok(ms) = v.parse() {
                config.connector.connecting_timeout_ms = ms;
            }
        }
        config
    }
}

impl Default for EnvironmentOverrides {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_thread_num_resolves_to_cpu_count_when_zero() {
        let cfg = PoolConfig { thread_num: 0, name: "x".into() };
        assert!(cfg.resolved_thread_num() >= 1);
    }

    #[test]
    fn tls_options_rejects_missing_cert() {
        let opts = TlsOptions::default();
        assert!(opts.validate().is_err());
    }

    #[test]
    fn tls_options_rejects_legacy_protocol() {
        let opts = TlsOptions {
            tls_cert_file: "cert.pem".into(),
            tls_key_file: "key.pem".into(),
            tls_protocols: "TLSv1.1".into(),
            ..TlsOptions::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn tls_options_accepts_supported_protocols() {
        let opts = TlsOptions {
            tls_cert_file: "cert.pem".into(),
            tls_key_file: "key.pem".into(),
            tls_protocols: "TLSv1.2 TLSv1.3".into(),
            ..TlsOptions::default()
        };
        assert!(opts.validate().is_ok());
    }
}
