//! Serving certificate management.
//!
//! The webhook's certificate is rotated on disk by external tooling
//! (cert-manager, or kubelet refreshing a mounted Secret). [`CertificateStore`]
//! holds the active rustls configuration in a swappable cell read on every
//! handshake; [`CertificateWatcher`] refreshes it when the files change.

mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use rustls::ServerConfig;
use thiserror::Error;
use tracing::{debug, info};

pub use watcher::{CertificateWatcher, FileEvent, ReloadRecorder, WatcherHandle};

/// Default path to webhook TLS certificate
pub const DEFAULT_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const DEFAULT_KEY_PATH: &str = "/etc/webhook/certs/tls.key";

/// Errors from certificate loading and watching
#[derive(Error, Debug)]
pub enum TlsError {
    /// The key pair could not be read or parsed
    #[error("failed to load key pair ({cert}, {key}): {source}")]
    Load {
        cert: PathBuf,
        key: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The certificate directory could not be watched
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File watching is not available on this platform
    #[error("certificate file watching is not supported on this platform")]
    WatchUnsupported,
}

/// Install the process-wide rustls crypto provider.
///
/// Safe to call more than once; later calls are no-ops.
pub fn install_crypto_provider() {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
}

/// The certificate currently presented by the server.
///
/// Cloning is cheap and every clone observes reloads.
#[derive(Clone)]
pub struct CertificateStore {
    cert_path: PathBuf,
    key_path: PathBuf,
    config: RustlsConfig,
}

impl CertificateStore {
    /// Load the initial key pair.
    pub async fn load(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Result<Self, TlsError> {
        let cert_path = cert_path.into();
        let key_path = key_path.into();

        let config = RustlsConfig::from_pem_file(&cert_path, &key_path)
            .await
            .map_err(|source| TlsError::Load {
                cert: cert_path.clone(),
                key: key_path.clone(),
                source,
            })?;

        info!(cert = %cert_path.display(), "Loaded TLS certificate");
        Ok(Self {
            cert_path,
            key_path,
            config,
        })
    }

    /// Re-read the key pair from disk and swap it in.
    ///
    /// On failure the previous certificate stays in service.
    pub async fn reload(&self) -> Result<(), TlsError> {
        self.config
            .reload_from_pem_file(&self.cert_path, &self.key_path)
            .await
            .map_err(|source| TlsError::Load {
                cert: self.cert_path.clone(),
                key: self.key_path.clone(),
                source,
            })
    }

    /// Snapshot of the active server configuration
    pub fn current(&self) -> Arc<ServerConfig> {
        self.config.get_inner()
    }

    /// Handle passed to the listener; shares the same cell
    pub fn rustls_config(&self) -> RustlsConfig {
        self.config.clone()
    }

    /// Directory holding the certificate, which is what gets watched
    pub fn watch_dir(&self) -> PathBuf {
        match self.cert_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}
