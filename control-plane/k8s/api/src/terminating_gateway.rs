use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Registers an external service in the mesh catalog so that a terminating gateway can route to
/// it.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consul.hashicorp.com",
    version = "v1alpha1",
    kind = "TerminatingGatewayService",
    status = "TerminatingGatewayServiceStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct TerminatingGatewayServiceSpec {
    #[serde(rename = "service")]
    pub registration: Option<CatalogRegistrationSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRegistrationSpec {
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub datacenter: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tagged_addresses: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_meta: BTreeMap<String, String>,
    #[serde(default)]
    pub service: ServiceSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(default, rename = "ID", skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub service: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default)]
    pub enable_tag_override: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerminatingGatewayServiceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_info_ref: Option<ServiceInfoRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_time: Option<Time>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfoRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("spec.service must be specified")]
    MissingRegistration,
    #[error("spec.service.node must be specified")]
    MissingNode,
    #[error("spec.service.service.service must be specified")]
    MissingServiceName,
}

// === impl TerminatingGatewayService ===

impl TerminatingGatewayService {
    /// The validated catalog registration.
    pub fn registration(&self) -> Result<&CatalogRegistrationSpec, ValidationError> {
        let reg = self
            .spec
            .registration
            .as_ref()
            .ok_or(ValidationError::MissingRegistration)?;
        if reg.node.is_empty() {
            return Err(ValidationError::MissingNode);
        }
        if reg.service.service.is_empty() {
            return Err(ValidationError::MissingServiceName);
        }
        Ok(reg)
    }

    pub fn service_info_ref(&self) -> Option<&ServiceInfoRef> {
        self.status.as_ref().and_then(|s| s.service_info_ref.as_ref())
    }
}
