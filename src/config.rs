//! Process-wide configuration.
//!
//! Configuration is resolved once at startup, either from command-line flags
//! ([`Cli`]) or from a YAML file, and is immutable afterwards. The dispatcher
//! captures it behind an `Arc`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Deserializer};
use url::{Host, Url};

use crate::error::ConfigError;

const DEFAULT_LISTEN: &str = ":8080";
const DEFAULT_TIMEOUT_SECS: u64 = 3;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Command-line flags.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "teeproxy",
    about = "Duplicates HTTP traffic to a primary and a shadow backend"
)]
pub struct Cli {
    /// Address to accept requests on
    #[arg(short = 'l', long = "listen", env = "LISTEN", default_value = DEFAULT_LISTEN)]
    pub listen: String,

    /// Path to the TLS private key file
    #[arg(long = "key.file")]
    pub key_file: Option<PathBuf>,

    /// Path to the TLS certificate file
    #[arg(long = "cert.file")]
    pub cert_file: Option<PathBuf>,

    /// Where primary traffic goes; its response is returned to the caller
    #[arg(short = 'a', default_value = "localhost:8080")]
    pub primary_host: String,

    /// Rewrite the Host header when proxying primary traffic
    #[arg(long = "a.rewrite")]
    pub primary_rewrite: bool,

    /// Timeout in seconds for primary traffic
    #[arg(long = "a.timeout", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub primary_timeout: u64,

    /// Proxy to the primary over TLS
    #[arg(long = "a.tls")]
    pub primary_tls: bool,

    /// Skip certificate checking on the primary
    #[arg(long = "a.tls.insecure")]
    pub primary_insecure: bool,

    /// Where shadow traffic goes; its response is discarded
    #[arg(short = 'b', default_value = "localhost:8081")]
    pub shadow_host: String,

    /// Rewrite the Host header when proxying shadow traffic
    #[arg(long = "b.rewrite")]
    pub shadow_rewrite: bool,

    /// Timeout in seconds for shadow traffic
    #[arg(long = "b.timeout", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub shadow_timeout: u64,

    /// Proxy to the shadow over TLS
    #[arg(long = "b.tls")]
    pub shadow_tls: bool,

    /// Skip certificate checking on the shadow
    #[arg(long = "b.tls.insecure")]
    pub shadow_insecure: bool,

    /// Seconds a caller connection may take to send the next request head
    #[arg(long = "idle.timeout", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout: u64,

    /// Load configuration from a YAML file instead of flags
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Resolved configuration for the whole process.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "listen", default = "default_listen")]
    pub listen_addr: String,

    /// Enables TLS termination on the listening socket.
    #[serde(default)]
    pub tls: Option<FrontendTls>,

    /// Bound on waiting for each request head from a caller.
    #[serde(
        rename = "idle_timeout_secs",
        default = "default_idle_timeout",
        deserialize_with = "deserialize_secs"
    )]
    pub idle_timeout: Duration,

    pub primary: BackendConfig,
    pub shadow: BackendConfig,
}

/// Certificate and key used to terminate TLS on the frontend.
#[derive(Debug, Clone, Deserialize)]
pub struct FrontendTls {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Dispatch policy for one backend.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// `host:port` of the backend. Also the value written to `Host` when
    /// `rewrite_host` is set.
    pub host: String,

    /// Bound on each network operation against this backend.
    #[serde(
        rename = "timeout_secs",
        default = "default_timeout",
        deserialize_with = "deserialize_secs"
    )]
    pub timeout: Duration,

    #[serde(default)]
    pub rewrite_host: bool,

    #[serde(default)]
    pub use_tls: bool,

    #[serde(default)]
    pub insecure_skip_verify: bool,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(DEFAULT_TIMEOUT_SECS)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)
}

fn deserialize_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

impl Config {
    /// Resolves the configuration from parsed flags and validates it.
    pub fn load(cli: Cli) -> Result<Self, ConfigError> {
        let cfg = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::from_cli(cli),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Builds the configuration from flags without validating it.
    pub fn from_cli(cli: Cli) -> Self {
        let tls = match (cli.cert_file, cli.key_file) {
            (None, None) => None,
            (cert, key) => Some(FrontendTls {
                cert_file: cert.unwrap_or_default(),
                key_file: key.unwrap_or_default(),
            }),
        };

        Self {
            listen_addr: cli.listen,
            tls,
            idle_timeout: Duration::from_secs(cli.idle_timeout),
            primary: BackendConfig {
                host: cli.primary_host,
                timeout: Duration::from_secs(cli.primary_timeout),
                rewrite_host: cli.primary_rewrite,
                use_tls: cli.primary_tls,
                insecure_skip_verify: cli.primary_insecure,
            },
            shadow: BackendConfig {
                host: cli.shadow_host,
                timeout: Duration::from_secs(cli.shadow_timeout),
                rewrite_host: cli.shadow_rewrite,
                use_tls: cli.shadow_tls,
                insecure_skip_verify: cli.shadow_insecure,
            },
        }
    }

    /// Reads a YAML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Parses a YAML configuration document.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Checks the configuration for values that cannot work at runtime.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("listen address is empty".to_string()));
        }

        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid("idle timeout must be positive".to_string()));
        }

        if let Some(tls) = &self.tls {
            if tls.cert_file.as_os_str().is_empty() || tls.key_file.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "frontend TLS needs both a certificate and a key file".to_string(),
                ));
            }
        }

        for (role, backend) in [("primary", &self.primary), ("shadow", &self.shadow)] {
            backend
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("{role}: {e}")))?;
        }

        Ok(())
    }

    /// The listen address in a form `TcpListener::bind` accepts.
    ///
    /// A bare `:port` binds every interface.
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }
}

impl BackendConfig {
    /// A plain-HTTP backend with the default timeout and no Host rewrite.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            timeout: default_timeout(),
            rewrite_host: false,
            use_tls: false,
            insecure_skip_verify: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rewrite_host(mut self, rewrite: bool) -> Self {
        self.rewrite_host = rewrite;
        self
    }

    pub fn with_tls(mut self, insecure_skip_verify: bool) -> Self {
        self.use_tls = true;
        self.insecure_skip_verify = insecure_skip_verify;
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("backend host is empty".to_string());
        }
        if self.timeout.is_zero() {
            return Err(format!("timeout for {} must be positive", self.host));
        }
        self.authority().map(|_| ()).map_err(|e| e.to_string())
    }

    /// Splits the configured host into a connectable host and port.
    ///
    /// The port defaults to 443 for TLS backends and 80 otherwise. IPv6
    /// literals are returned without brackets.
    pub fn authority(&self) -> Result<(String, u16), ConfigError> {
        let scheme = if self.use_tls { "https" } else { "http" };
        let url = Url::parse(&format!("{scheme}://{}", self.host))
            .map_err(|e| ConfigError::Invalid(format!("bad backend host {:?}: {e}", self.host)))?;

        if url.path() != "/" || url.query().is_some() {
            return Err(ConfigError::Invalid(format!(
                "backend host {:?} must not contain a path",
                self.host
            )));
        }

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => {
                return Err(ConfigError::Invalid(format!(
                    "backend host {:?} has no host part",
                    self.host
                )));
            }
        };
        let port = url.port_or_known_default().unwrap_or(80);

        Ok((host, port))
    }
}
