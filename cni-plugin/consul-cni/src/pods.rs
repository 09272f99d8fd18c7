use crate::{conf::NetConf, Error};
use anyhow::Context;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use std::path::Path;

#[async_trait::async_trait]
pub trait PodStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error>;

    async fn annotate(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), kube::Error>;
}

/// [`PodStore`] backed by the API server.
pub struct KubePods(Client);

// === impl KubePods ===

impl KubePods {
    /// Connects with the kubeconfig installed next to the CNI network config, or with the
    /// ambient configuration when none is named.
    pub async fn connect(conf: &NetConf) -> Result<Self, Error> {
        let config = if conf.kubeconfig.is_empty() {
            Config::infer().await.map_err(|e| Error::Client(e.into()))?
        } else {
            let path = Path::new(&conf.cni_net_dir).join(&conf.kubeconfig);
            let kubeconfig = Kubeconfig::read_from(&path)
                .with_context(|| format!("failed to read {}", path.display()))
                .map_err(Error::Client)?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Client(e.into()))?
        };
        let client = Client::try_from(config).map_err(|e| Error::Client(e.into()))?;
        Ok(Self(client))
    }
}

#[async_trait::async_trait]
impl PodStore for KubePods {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error> {
        Api::<Pod>::namespaced(self.0.clone(), namespace)
            .get(name)
            .await
    }

    async fn annotate(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), kube::Error> {
        let patch = serde_json::json!({
            "metadata": { "annotations": { key: value } },
        });
        Api::<Pod>::namespaced(self.0.clone(), namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}
