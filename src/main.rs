//! flux-substitute-webhook - injects substitutions into Flux Kustomizations.
//!
//! This is the main entry point that:
//! - Parses configuration and initializes structured logging
//! - Loads the substitution map and the serving certificate
//! - Watches the certificate for rotation
//! - Serves the webhook until SIGTERM or SIGINT, then drains

use std::sync::Arc;

use axum_server::Handle;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use flux_substitute_webhook::config::{Config, init_logging};
use flux_substitute_webhook::tls::{CertificateStore, CertificateWatcher, install_crypto_provider};
use flux_substitute_webhook::{
    DirectorySource, Error, HealthState, SubstitutionMutator, WebhookState,
    create_webhook_router, load_substitutions, run_webhook_server,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_logging(&config.log_level, config.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %config.server_address,
        target_kind = %config.target_kind,
        "Starting flux-substitute-webhook"
    );

    install_crypto_provider();

    // Create shared health state
    let health_state = Arc::new(HealthState::new());

    let source = DirectorySource::new(&config.config_dir);
    let substitutions = load_substitutions(&source, &health_state)
        .await
        .inspect_err(|e| error!(error = %e, "Failed to load substitutions"))?;

    let store = CertificateStore::load(&config.cert_file, &config.key_file)
        .await
        .map_err(Error::from)
        .inspect_err(|e| error!(error = %e, "Failed to load TLS certificate"))?;

    // Serving with the initial certificate beats not serving at all
    let mut watcher = match CertificateWatcher::new(store.clone())
        .with_recorder(health_state.clone())
        .spawn()
    {
        Ok(handle) => Some(handle),
        Err(e) => {
            let err = Error::from(e);
            if err.is_fatal() {
                error!(error = %err, "Certificate watcher failed");
                return Err(err.into());
            }
            warn!(error = %err, "Certificate watcher not started, rotations need a restart");
            None
        }
    };

    let mutator = SubstitutionMutator::new(config.target_kind.clone(), substitutions);
    let state = Arc::new(WebhookState::new(mutator, health_state.clone()));
    let app = create_webhook_router(state, config.router_options());

    let handle = Handle::new();
    let mut server = {
        let handle = handle.clone();
        let store = store.clone();
        let addr = config.server_address;
        tokio::spawn(async move { run_webhook_server(addr, &store, app, handle).await })
    };

    let outcome = tokio::select! {
        result = &mut server => result,
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Mark as not ready to stop receiving new work
            health_state.set_ready(false).await;
            info!("Marked webhook as not ready");

            if let Some(watcher) = watcher.take() {
                watcher.stop().await;
            }

            info!(
                "Waiting up to {}s for in-flight requests to complete...",
                config.shutdown_grace_secs
            );
            handle.graceful_shutdown(Some(config.shutdown_grace()));
            server.await
        }
    };

    if let Some(watcher) = watcher.take() {
        watcher.stop().await;
    }

    match outcome {
        Ok(Ok(())) => {
            info!("Webhook stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Webhook server error");
            Err(Error::from(e).into())
        }
        Err(e) => {
            error!(error = %e, "Webhook server task panicked");
            Err(e.into())
        }
    }
}

/// Resolves on SIGTERM or SIGINT, which starts the drain of `/mutate`.
///
/// Without a handler kubelet's SIGTERM would kill in-flight admissions, so a
/// handler that cannot be installed aborts the process.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("SIGINT handler for webhook drain");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler for webhook drain")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
