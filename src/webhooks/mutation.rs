//! Substitution injection for Flux Kustomizations.
//!
//! Decides whether an admission request is mutated and builds the JSON patch
//! that establishes `spec.postBuild.substitute` and fills it from the
//! substitution map. Everything here is synchronous and free of I/O so it can
//! run on any request task without coordination.

use std::sync::Arc;

use json_patch::jsonptr::PointerBuf;
use json_patch::{AddOperation, Patch, PatchOperation};
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, Operation, SerializePatchError};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::substitutions::SubstitutionMap;

/// Kind mutated when no other target is configured
pub const DEFAULT_TARGET_KIND: &str = "Kustomization";

const POST_BUILD_PATH: &str = "/spec/postBuild";
const SUBSTITUTE_PATH: &str = "/spec/postBuild/substitute";

/// Errors that prevent a mutation decision from being encoded
#[derive(Error, Debug)]
pub enum MutationError {
    /// A generated path was rejected by the pointer parser
    #[error("invalid JSON pointer {path}: {reason}")]
    InvalidPointer { path: String, reason: String },

    /// The patch could not be serialized into the response
    #[error(transparent)]
    SerializePatch(#[from] SerializePatchError),

    /// The admission review could not be written to the response body
    #[error("could not encode admission review: {0}")]
    EncodeReview(#[source] serde_json::Error),
}

/// How a request was handled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A patch was attached to the response
    Patched,
    /// Target kind, but the object already had everything
    Unchanged,
    /// Not the target kind
    SkippedKind,
    /// DELETE, or the object is terminating
    SkippedDeletion,
    /// No object in the request (e.g. CONNECT)
    NoObject,
}

impl Outcome {
    /// Label value used in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Patched => "patched",
            Outcome::Unchanged => "unchanged",
            Outcome::SkippedKind => "skipped_kind",
            Outcome::SkippedDeletion => "skipped_deletion",
            Outcome::NoObject => "no_object",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a mutation decision
#[derive(Debug)]
pub struct Mutation {
    pub response: AdmissionResponse,
    pub outcome: Outcome,
    /// Number of patch operations attached
    pub operations: usize,
}

impl Mutation {
    fn allow(request: &AdmissionRequest<DynamicObject>, outcome: Outcome) -> Self {
        Self {
            response: AdmissionResponse::from(request),
            outcome,
            operations: 0,
        }
    }
}

/// Injects substitutions into objects of a single kind.
///
/// Never denies: every decision is `allowed`, with or without a patch.
#[derive(Clone, Debug)]
pub struct SubstitutionMutator {
    target_kind: String,
    substitutions: Arc<SubstitutionMap>,
}

impl SubstitutionMutator {
    pub fn new(target_kind: impl Into<String>, substitutions: Arc<SubstitutionMap>) -> Self {
        Self {
            target_kind: target_kind.into(),
            substitutions,
        }
    }

    /// Decide how to answer an admission request.
    pub fn decide(
        &self,
        request: &AdmissionRequest<DynamicObject>,
    ) -> Result<Mutation, MutationError> {
        if request.kind.kind != self.target_kind {
            return Ok(Mutation::allow(request, Outcome::SkippedKind));
        }

        if request.operation == Operation::Delete {
            return Ok(Mutation::allow(request, Outcome::SkippedDeletion));
        }

        let Some(object) = request.object.as_ref() else {
            return Ok(Mutation::allow(request, Outcome::NoObject));
        };

        if object.metadata.deletion_timestamp.is_some() {
            return Ok(Mutation::allow(request, Outcome::SkippedDeletion));
        }

        let operations = build_patch(&object.data, &self.substitutions)?;
        if operations.is_empty() {
            return Ok(Mutation::allow(request, Outcome::Unchanged));
        }

        let count = operations.len();
        let response = AdmissionResponse::from(request).with_patch(Patch(operations))?;
        Ok(Mutation {
            response,
            outcome: Outcome::Patched,
            operations: count,
        })
    }
}

/// Build the patch operations for one object document.
///
/// Both container checks look at the original document, so the result is
/// the same no matter which of them fire.
pub fn build_patch(
    document: &Value,
    substitutions: &SubstitutionMap,
) -> Result<Vec<PatchOperation>, MutationError> {
    let mut operations = Vec::with_capacity(substitutions.len() + 2);

    if nested_map(document, &["spec", "postBuild"]).is_none() {
        operations.push(add(POST_BUILD_PATH, Value::Object(Map::new()))?);
    }

    if nested_map(document, &["spec", "postBuild", "substitute"]).is_none() {
        operations.push(add(SUBSTITUTE_PATH, Value::Object(Map::new()))?);
    }

    for (key, value) in substitutions {
        let path = format!("{}/{}", SUBSTITUTE_PATH, escape_pointer_token(key));
        operations.push(add(&path, Value::String(value.clone()))?);
    }

    Ok(operations)
}

/// Escape a single JSON pointer reference token (RFC 6901).
///
/// `~` must be escaped before `/`, otherwise the `~` introduced by `~1`
/// would be escaped again.
pub fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Look up a map nested under `path`, if every step exists and the final
/// value is an object.
pub fn nested_map<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Map<String, Value>> {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))?
        .as_object()
}

fn add(path: &str, value: Value) -> Result<PatchOperation, MutationError> {
    let path = PointerBuf::parse(path).map_err(|e| MutationError::InvalidPointer {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    Ok(PatchOperation::Add(AddOperation { path, value }))
}
