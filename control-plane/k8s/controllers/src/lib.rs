#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Reconcilers that keep the mesh catalog, ACLs and peerings in step with Kubernetes.

pub mod agents;
pub mod endpoints;
mod kube_api;
pub mod metrics;
pub mod peering;
pub mod terminating_gateway;

#[cfg(test)]
mod fake;

pub use self::{
    agents::{Agent, AgentDirectory, AgentPods, SharedAgent},
    kube_api::{KubeApi, KubeClient},
    metrics::ControllerMetrics,
};

use consul_k8s_core::{annotations::InvalidBool, upstreams::UpstreamError};
use consul_k8s_k8s_api::conditions::reasons;
use consul_k8s_mesh::MeshError;
use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes: {0}")]
    Kube(#[from] kube::Error),

    #[error("mesh: {0}")]
    Mesh(#[from] MeshError),

    #[error("{0}")]
    Invalid(String),

    #[error("agent {agent}: {source}")]
    Agent {
        agent: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Multi(#[from] Errors),
}

/// Errors accumulated over a pass that keeps going after individual failures.
#[derive(Debug, Default)]
pub struct Errors(Vec<Error>);

// === impl Error ===

impl Error {
    pub fn invalid(msg: impl fmt::Display) -> Self {
        Self::Invalid(msg.to_string())
    }

    /// The `Synced` condition reason recorded for this error.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Mesh(_) => reasons::CONSUL_AGENT_ERROR,
            Self::Kube(_) => reasons::KUBERNETES_ERROR,
            Self::Agent { source, .. } => source.reason(),
            Self::Invalid(_) | Self::Multi(_) => reasons::INTERNAL_ERROR,
        }
    }
}

impl From<InvalidBool> for Error {
    fn from(error: InvalidBool) -> Self {
        Self::invalid(error)
    }
}

impl From<UpstreamError> for Error {
    fn from(error: UpstreamError) -> Self {
        Self::invalid(error)
    }
}

impl From<consul_k8s_core::iptables::Error> for Error {
    fn from(error: consul_k8s_core::iptables::Error) -> Self {
        Self::invalid(error)
    }
}

// Port and original-pod resolution report through anyhow.
impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Self::Invalid(format!("{error:#}"))
    }
}

// === impl Errors ===

impl Errors {
    pub fn push(&mut self, error: Error) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Error> {
        self.0.iter()
    }

    /// Succeeds when nothing was accumulated. A single error is returned as is.
    pub fn into_result(mut self) -> Result<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(Error::Multi(self)),
        }
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.0.len())?;
        for error in &self.0 {
            write!(f, "\n\t* {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}
