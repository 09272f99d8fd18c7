use crate::{
    conf::{Command, Invocation},
    effector::Effector,
    pods::PodStore,
    Error,
};
use consul_k8s_core::{
    annotations::{
        self, REDIRECT_TRAFFIC_CONFIG, TPROXY_STATUS, TPROXY_STATUS_COMPLETE,
        TPROXY_STATUS_WAITING,
    },
    iptables::IptablesConfig,
};
use serde_json::Value;
use std::future::Future;
use tracing::{debug, info, instrument, warn};


/// Applies traffic redirection for one plugin invocation.
pub struct Driver<E> {
    effector: E,
}

// === impl Driver ===

impl<E: Effector> Driver<E> {
    pub fn new(effector: E) -> Self {
        Self { effector }
    }

    /// Handles `inv`, returning the document to print on stdout.
    ///
    /// `pods` is only awaited when the pod has to be looked up.
    pub async fn run<P, F>(&self, inv: &Invocation, pods: F) -> Result<Value, Error>
    where
        P: PodStore,
        F: Future<Output = Result<P, Error>>,
    {
        match inv.command {
            Command::Add => self.add(inv, pods).await,
            // Rules live and die with the network namespace.
            Command::Del | Command::Check => Ok(Value::Null),
            Command::Version => Ok(version()),
        }
    }

    #[instrument(skip_all, fields(namespace = %inv.args.pod_namespace, name = %inv.args.pod_name))]
    async fn add<P, F>(&self, inv: &Invocation, pods: F) -> Result<Value, Error>
    where
        P: PodStore,
        F: Future<Output = Result<P, Error>>,
    {
        if !inv.args.has_pod_identity() {
            return Err(Error::NoPodIdentity);
        }
        debug!(
            infra_container = %inv.args.infra_container_id,
            ip = %inv.args.ip,
            "consul-cni plugin config"
        );
        let result = inv.conf.result()?;

        if !inv.args.iptables_config.is_empty() {
            let mut config = IptablesConfig::from_json(&inv.args.iptables_config)
                .map_err(Error::InlineConfig)?;
            config.netns = inv.netns.clone();
            self.apply(&config).await?;
            info!("Applied traffic redirection from CNI_ARGS");
            return Ok(result);
        }

        let pods = pods.await?;
        let (namespace, name) = (&inv.args.pod_namespace, &inv.args.pod_name);
        let pod = pods.get(namespace, name).await.map_err(Error::Pod)?;
        if !annotations::traffic_redirection_requested(&pod) {
            debug!("Pod is not injected or transparent proxy is disabled; skipping");
            return Ok(result);
        }

        set_status(&pods, namespace, name, TPROXY_STATUS_WAITING).await;

        let raw = annotations::pod_annotation(&pod, REDIRECT_TRAFFIC_CONFIG).ok_or_else(|| {
            Error::MissingAnnotation {
                annotation: REDIRECT_TRAFFIC_CONFIG,
                pod: name.clone(),
            }
        })?;
        let mut config =
            IptablesConfig::from_json(raw).map_err(|source| Error::InvalidAnnotation {
                annotation: REDIRECT_TRAFFIC_CONFIG,
                pod: name.clone(),
                source,
            })?;
        config.netns = inv.netns.clone();
        self.apply(&config).await?;

        set_status(&pods, namespace, name, TPROXY_STATUS_COMPLETE).await;
        info!("Applied traffic redirection");
        Ok(result)
    }

    async fn apply(&self, config: &IptablesConfig) -> Result<(), Error> {
        self.effector.apply(config).await.map_err(Error::Effector)
    }
}

/// Updates the pod's redirection status. The pod may have changed since it was read, so a
/// failed write is only logged.
async fn set_status<P: PodStore>(pods: &P, namespace: &str, name: &str, status: &str) {
    if let Err(error) = pods.annotate(namespace, name, TPROXY_STATUS, status).await {
        warn!(%error, %status, "Unable to update {TPROXY_STATUS} pod annotation");
    }
}

fn version() -> Value {
    serde_json::json!({
        "cniVersion": crate::conf::SUPPORTED_VERSIONS[crate::conf::SUPPORTED_VERSIONS.len() - 1],
        "supportedVersions": crate::conf::SUPPORTED_VERSIONS,
    })
}
