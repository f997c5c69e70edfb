//! Mutating admission webhook for Flux Kustomizations.
//!
//! - [`mutation`]: decides whether a request is patched and builds the patch
//! - [`rate_limit`]: token bucket guarding `/mutate`
//! - [`middleware`]: request logging, rate limiting and timeouts
//! - `server`: the axum router and TLS listener

pub mod middleware;
pub mod mutation;
pub mod rate_limit;
mod server;

pub use mutation::{
    DEFAULT_TARGET_KIND, Mutation, MutationError, Outcome, SubstitutionMutator, build_patch,
    escape_pointer_token, nested_map,
};
pub use rate_limit::RateLimiter;
pub use server::{
    DEFAULT_RATE_LIMIT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SERVER_ADDRESS, RouterOptions,
    WebhookError, WebhookState, create_webhook_router, run_webhook_server,
};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
