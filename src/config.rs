//! Command line and environment configuration.
//!
//! Every setting is a flag with an environment variable fallback and a
//! default, so the webhook runs unconfigured inside a pod that mounts its
//! certificate and substitutions at the standard paths.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::substitutions::DEFAULT_CONFIG_DIR;
use crate::tls::{DEFAULT_CERT_PATH, DEFAULT_KEY_PATH};
use crate::webhooks::{DEFAULT_SERVER_ADDRESS, DEFAULT_TARGET_KIND, RouterOptions};

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line (default)
    #[default]
    Json,
    /// Human readable
    Text,
}

/// Webhook configuration
#[derive(Parser, Debug, Clone)]
#[command(name = "flux-substitute-webhook", version, about, long_about = None)]
pub struct Config {
    /// Listen address: host:port, [v6]:port or :port for all interfaces
    #[arg(long, env = "SERVER_ADDRESS", default_value = DEFAULT_SERVER_ADDRESS, value_parser = parse_listen_addr)]
    pub server_address: SocketAddr,

    /// PEM certificate presented by the server
    #[arg(long, env = "CERT_FILE", default_value = DEFAULT_CERT_PATH)]
    pub cert_file: PathBuf,

    /// PEM private key matching the certificate
    #[arg(long, env = "KEY_FILE", default_value = DEFAULT_KEY_PATH)]
    pub key_file: PathBuf,

    /// Directory whose files become substitutions (file name = key)
    #[arg(long, env = "CONFIG_DIR", default_value = DEFAULT_CONFIG_DIR)]
    pub config_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Requests per second allowed on /mutate, also the burst size; 0 disables
    #[arg(long, env = "RATE_LIMIT", default_value_t = crate::webhooks::DEFAULT_RATE_LIMIT)]
    pub rate_limit: u32,

    /// Kind whose objects are mutated
    #[arg(long, env = "TARGET_KIND", default_value = DEFAULT_TARGET_KIND)]
    pub target_kind: String,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Time allowed for in-flight requests to finish on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE_SECS", default_value_t = 30)]
    pub shutdown_grace_secs: u64,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            rate_limit: self.rate_limit,
            request_timeout: self.request_timeout(),
        }
    }
}

/// Parse a listen address. `:port` binds every IPv4 interface.
pub fn parse_listen_addr(value: &str) -> Result<SocketAddr, String> {
    if let Some(port) = value.strip_prefix(':') {
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in {value:?}: {e}"))?;
        return Ok(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)));
    }

    value
        .parse()
        .map_err(|e| format!("invalid listen address {value:?}: {e}"))
}

/// Parse a log level name, accepting the common aliases.
pub fn parse_log_level(value: &str) -> Result<LevelFilter, String> {
    let normalized = value.trim().to_ascii_lowercase();
    let name = match normalized.as_str() {
        "warning" => "warn",
        "fatal" | "panic" => "error",
        other => other,
    };
    LevelFilter::from_str(name).map_err(|_| format!("unknown log level {value:?}"))
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` directives, when present, refine the configured level. An
/// unknown level falls back to `info` and is reported once logging is up.
pub fn init_logging(level: &str, format: LogFormat) {
    let (filter_level, invalid) = match parse_log_level(level) {
        Ok(level) => (level, None),
        Err(e) => (LevelFilter::INFO, Some(e)),
    };

    let filter = EnvFilter::builder()
        .with_default_directive(filter_level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }

    if let Some(reason) = invalid {
        warn!(error = %reason, "Invalid log level, defaulting to info");
    }
}
