#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Client for the mesh control plane's HTTP API.

mod client;

pub use self::client::{HttpMeshClient, MeshConfig};
pub use consul_k8s_core::catalog;

use self::catalog::{
    AclPolicy, AclRole, AclToken, AgentCheck, AgentCheckRegistration, AgentService,
    AgentServiceRegistration, CatalogDeregistration, CatalogRegistration, CatalogService, Peering,
    PeeringToken, ProxyConfigEntry,
};
use std::{collections::BTreeMap, time::Duration};

pub type Result<T, E = MeshError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("not found")]
    NotFound,

    #[error("unexpected response code: {code} ({body})")]
    Status { code: u16, body: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid address: {0}")]
    Url(#[from] url::ParseError),
}

/// Scopes a request to a mesh namespace. An empty namespace means the default.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Scope<'a> {
    pub namespace: &'a str,
}

/// The subset of the mesh control plane's API used by the controllers.
///
/// Lookups of single named objects report a missing object as `Ok(None)`; every other call
/// surfaces it as [`MeshError::NotFound`].
#[async_trait::async_trait]
pub trait MeshClient: Send + Sync {
    // Agent.

    async fn register_service(&self, registration: &AgentServiceRegistration) -> Result<()>;

    async fn deregister_service(&self, service_id: &str, scope: Scope<'_>) -> Result<()>;

    /// Lists local services matching a filter expression.
    async fn services(
        &self,
        filter: &str,
        scope: Scope<'_>,
    ) -> Result<BTreeMap<String, AgentService>>;

    async fn service(&self, service_id: &str, scope: Scope<'_>) -> Result<Option<AgentService>>;

    async fn checks(&self, filter: &str, scope: Scope<'_>) -> Result<BTreeMap<String, AgentCheck>>;

    async fn register_check(&self, registration: &AgentCheckRegistration) -> Result<()>;

    async fn update_ttl(
        &self,
        check_id: &str,
        output: &str,
        status: &str,
        scope: Scope<'_>,
    ) -> Result<()>;

    // Catalog.

    async fn catalog_register(&self, registration: &CatalogRegistration) -> Result<()>;

    async fn catalog_deregister(&self, deregistration: &CatalogDeregistration) -> Result<()>;

    async fn catalog_service(&self, name: &str) -> Result<Vec<CatalogService>>;

    // ACLs.

    async fn tokens(&self) -> Result<Vec<AclToken>>;

    async fn delete_token(&self, accessor_id: &str) -> Result<()>;

    async fn create_policy(&self, policy: &AclPolicy) -> Result<AclPolicy>;

    async fn policies(&self) -> Result<Vec<AclPolicy>>;

    async fn delete_policy(&self, id: &str) -> Result<()>;

    async fn roles(&self) -> Result<Vec<AclRole>>;

    async fn update_role(&self, role: &AclRole) -> Result<AclRole>;

    // Peering.

    async fn peering(&self, name: &str) -> Result<Option<Peering>>;

    async fn generate_peering_token(&self, peer_name: &str) -> Result<PeeringToken>;

    async fn delete_peering(&self, name: &str) -> Result<()>;

    // Config entries.

    async fn proxy_defaults(&self, name: &str) -> Result<Option<ProxyConfigEntry>>;
}

// === impl MeshError ===

impl MeshError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

// === impl Scope ===

impl<'a> Scope<'a> {
    pub fn namespace(namespace: &'a str) -> Self {
        Self { namespace }
    }
}
