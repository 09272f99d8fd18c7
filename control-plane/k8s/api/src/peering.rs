use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The only backend in which generated peering tokens are stored.
pub const BACKEND_KUBERNETES: &str = "kubernetes";

/// Accepts a peering from another mesh deployment by generating a token and storing it in a
/// secret.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "PeeringAcceptor",
    status = "PeeringAcceptorStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PeeringAcceptorSpec {
    pub peer: Peer,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Peer {
    pub secret: SecretRef,
}

/// Where the peering token is stored.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SecretRef {
    pub name: String,
    pub key: String,
    pub backend: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeeringAcceptorStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_error: Option<ReconcileError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_time: Option<Time>,
}

/// The secret most recently written, with the resource version it was written at.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretStatus {
    pub name: String,
    pub key: String,
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ReconcileError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// === impl PeeringAcceptor ===

impl PeeringAcceptor {
    pub fn secret_ref(&self) -> &SecretRef {
        &self.spec.peer.secret
    }

    pub fn status_secret(&self) -> Option<&SecretStatus> {
        self.status.as_ref().and_then(|s| s.secret.as_ref())
    }
}

// === impl SecretStatus ===

impl SecretStatus {
    pub fn from_ref(secret: &SecretRef, resource_version: Option<String>) -> Self {
        Self {
            name: secret.name.clone(),
            key: secret.key.clone(),
            backend: secret.backend.clone(),
            resource_version,
        }
    }
}
