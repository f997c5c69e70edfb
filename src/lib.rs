//! flux-substitute-webhook library crate
//!
//! A mutating admission webhook that injects a fixed set of variables into
//! the `spec.postBuild.substitute` map of Flux Kustomizations.

pub mod config;
pub mod error;
pub mod health;
pub mod substitutions;
pub mod tls;
pub mod webhooks;

pub use config::{Config, LogFormat};
pub use error::{Error, Result};
pub use health::HealthState;
pub use substitutions::{DirectorySource, SubstitutionMap, SubstitutionSource};
pub use tls::{CertificateStore, CertificateWatcher};
pub use webhooks::{
    RouterOptions, SubstitutionMutator, WebhookError, WebhookState, create_webhook_router,
    run_webhook_server,
};

use std::sync::Arc;

use tracing::{info, warn};

/// Load substitutions and record them in the health state.
///
/// An unreadable source is an error. An empty one is not: the webhook keeps
/// serving (patching only the containers) but never reports ready.
pub async fn load_substitutions<S: SubstitutionSource>(
    source: &S,
    health: &HealthState,
) -> Result<Arc<SubstitutionMap>> {
    let substitutions = source.load()?;

    health.metrics.set_substitutions(substitutions.len());
    if substitutions.is_empty() {
        warn!("No substitutions loaded, webhook will report not ready");
    } else {
        info!(count = substitutions.len(), "Loaded substitutions");
        health.set_ready(true).await;
    }

    Ok(Arc::new(substitutions))
}
