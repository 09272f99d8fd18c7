//! Locates the mesh agents that registrations are written to.
//!
//! A deployment either talks to a single shared agent or to one agent per node, in which case
//! agents are discovered as pods labelled `component=client,app=consul,release=<release>`.

use crate::{KubeApi, Result};
use consul_k8s_k8s_api::Pod;
use consul_k8s_mesh::{HttpMeshClient, MeshClient, MeshConfig};
use std::sync::Arc;
use tracing::info;

/// A reachable agent and the name it is reported under.
#[derive(Clone)]
pub struct Agent {
    pub name: String,
    pub client: Arc<dyn MeshClient>,
}

#[async_trait::async_trait]
pub trait AgentDirectory: Send + Sync {
    /// The agent serving pods scheduled on the node with `host_ip`.
    async fn agent_for(&self, host_ip: &str) -> Result<Arc<dyn MeshClient>>;

    /// Every agent that is ready to take writes.
    async fn ready_agents(&self) -> Result<Vec<Agent>>;
}

/// One client for everything.
#[derive(Clone)]
pub struct SharedAgent(Arc<dyn MeshClient>);

/// Agents discovered as pods of a release.
pub struct AgentPods {
    kube: Arc<dyn KubeApi>,
    namespace: String,
    selector: String,
    config: MeshConfig,
    http: reqwest::Client,
}

/// The label selector matching a release's agent pods.
pub fn agent_selector(release_name: &str) -> String {
    format!("component=client,app=consul,release={release_name}")
}

/// True when `pod` carries the labels of an agent in `release_name`.
pub fn is_agent(pod: &Pod, release_name: &str) -> bool {
    let Some(labels) = pod.metadata.labels.as_ref() else {
        return false;
    };
    labels.get("component").map(String::as_str) == Some("client")
        && labels.get("app").map(String::as_str) == Some("consul")
        && labels.get("release").map(String::as_str) == Some(release_name)
}

pub fn is_ready(pod: &Pod) -> bool {
    pod.status
        .iter()
        .flat_map(|s| s.conditions.iter().flatten())
        .filter(|c| c.type_ == "Ready")
        .last()
        .is_some_and(|c| c.status == "True")
}

pub fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        == Some("Running")
}

// === impl SharedAgent ===

impl SharedAgent {
    pub fn new(client: Arc<dyn MeshClient>) -> Self {
        Self(client)
    }
}

#[async_trait::async_trait]
impl AgentDirectory for SharedAgent {
    async fn agent_for(&self, _host_ip: &str) -> Result<Arc<dyn MeshClient>> {
        Ok(self.0.clone())
    }

    async fn ready_agents(&self) -> Result<Vec<Agent>> {
        Ok(vec![Agent {
            name: "shared".to_string(),
            client: self.0.clone(),
        }])
    }
}

// === impl AgentPods ===

impl AgentPods {
    pub fn new(
        kube: Arc<dyn KubeApi>,
        release_name: &str,
        release_namespace: impl Into<String>,
        config: MeshConfig,
        http: reqwest::Client,
    ) -> Self {
        Self {
            kube,
            namespace: release_namespace.into(),
            selector: agent_selector(release_name),
            config,
            http,
        }
    }

    fn client(&self, host: &str) -> Result<Arc<dyn MeshClient>> {
        let client = HttpMeshClient::new(&self.config, self.http.clone(), host)?;
        Ok(Arc::new(client))
    }
}

#[async_trait::async_trait]
impl AgentDirectory for AgentPods {
    async fn agent_for(&self, host_ip: &str) -> Result<Arc<dyn MeshClient>> {
        self.client(host_ip)
    }

    async fn ready_agents(&self) -> Result<Vec<Agent>> {
        let pods = self.kube.pods(&self.namespace, &self.selector).await?;
        let mut agents = Vec::with_capacity(pods.len());
        for pod in pods {
            let name = pod.metadata.name.clone().unwrap_or_default();
            if !is_ready(&pod) {
                info!(agent = %name, "Agent is not ready; skipping");
                continue;
            }
            let Some(ip) = pod.status.as_ref().and_then(|s| s.pod_ip.as_deref()) else {
                info!(agent = %name, "Agent has no IP; skipping");
                continue;
            };
            let client = self.client(ip)?;
            agents.push(Agent { name, client });
        }
        Ok(agents)
    }
}
