//! Crate-level error type.
//!
//! Each concern has its own error enum; this one aggregates them for the
//! startup path in `main`.

use thiserror::Error;

use crate::substitutions::SubstitutionError;
use crate::tls::TlsError;
use crate::webhooks::{MutationError, WebhookError};

/// Error type for webhook startup and serving
#[derive(Error, Debug)]
pub enum Error {
    /// Substitutions could not be loaded
    #[error("Substitution error: {0}")]
    Substitutions(#[from] SubstitutionError),

    /// Certificate could not be loaded or watched
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// A mutation could not be encoded
    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    /// The server failed
    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),
}

impl Error {
    /// Whether the process must stop rather than keep serving
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Substitutions(_) | Error::Webhook(_) => true,
            Error::Tls(TlsError::Load { .. }) => true,
            Error::Tls(TlsError::Watch { .. } | TlsError::WatchUnsupported) => false,
            Error::Mutation(_) => false,
        }
    }
}

/// Result type alias using the crate error
pub type Result<T, E = Error> = std::result::Result<T, E>;
