//! Test fixtures and builder patterns for admission reviews.

use serde_json::{Value, json};

/// Builder for `admission.k8s.io/v1` AdmissionReview request bodies.
///
/// Defaults to a CREATE of a Flux Kustomization with an empty spec.
///
/// # Example
/// ```
/// let body = AdmissionReviewBuilder::new("uid-1")
///     .operation("UPDATE")
///     .spec(json!({"path": "./apps"}))
///     .body();
/// ```
#[derive(Clone, Debug)]
pub struct AdmissionReviewBuilder {
    uid: String,
    group: String,
    version: String,
    kind: String,
    resource: String,
    operation: String,
    name: String,
    namespace: Option<String>,
    spec: Option<Value>,
    deletion_timestamp: Option<String>,
    with_object: bool,
}

impl AdmissionReviewBuilder {
    /// Create a new builder with the given request UID.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            group: "kustomize.toolkit.fluxcd.io".to_string(),
            version: "v1".to_string(),
            kind: "Kustomization".to_string(),
            resource: "kustomizations".to_string(),
            operation: "CREATE".to_string(),
            name: "apps".to_string(),
            namespace: Some("flux-system".to_string()),
            spec: Some(json!({})),
            deletion_timestamp: None,
            with_object: true,
        }
    }

    /// Use a core `v1` kind instead of a Kustomization.
    pub fn core_kind(mut self, kind: impl Into<String>, resource: impl Into<String>) -> Self {
        self.group = String::new();
        self.version = "v1".to_string();
        self.kind = kind.into();
        self.resource = resource.into();
        self
    }

    /// Set the operation (CREATE, UPDATE, DELETE, CONNECT).
    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Set the object's spec.
    pub fn spec(mut self, spec: Value) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Drop `spec` from the object entirely.
    pub fn without_spec(mut self) -> Self {
        self.spec = None;
        self
    }

    /// Mark the object as terminating.
    pub fn deleting(mut self) -> Self {
        self.deletion_timestamp = Some("2024-01-01T00:00:00Z".to_string());
        self
    }

    /// Send the request without an object.
    pub fn without_object(mut self) -> Self {
        self.with_object = false;
        self
    }

    fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// The embedded object document.
    pub fn object(&self) -> Value {
        let mut metadata = json!({ "name": self.name });
        if let Some(ns) = &self.namespace {
            metadata["namespace"] = json!(ns);
        }
        if let Some(ts) = &self.deletion_timestamp {
            metadata["deletionTimestamp"] = json!(ts);
        }

        let mut object = json!({
            "apiVersion": self.api_version(),
            "kind": self.kind,
            "metadata": metadata,
        });
        if let Some(spec) = &self.spec {
            object["spec"] = spec.clone();
        }
        object
    }

    /// Build the AdmissionReview document.
    pub fn build(&self) -> Value {
        let mut request = json!({
            "uid": self.uid,
            "kind": {"group": self.group, "version": self.version, "kind": self.kind},
            "resource": {"group": self.group, "version": self.version, "resource": self.resource},
            "name": self.name,
            "operation": self.operation,
            "userInfo": {
                "username": "system:serviceaccount:flux-system:kustomize-controller"
            },
            "dryRun": false,
        });
        if let Some(ns) = &self.namespace {
            request["namespace"] = json!(ns);
        }
        if self.with_object {
            request["object"] = self.object();
        }

        json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": request,
        })
    }

    /// Serialized request body.
    pub fn body(&self) -> String {
        self.build().to_string()
    }
}
