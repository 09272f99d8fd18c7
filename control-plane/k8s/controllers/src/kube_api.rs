use consul_k8s_k8s_api::{
    self as k8s, peering::PeeringAcceptorStatus,
    terminating_gateway::TerminatingGatewayServiceStatus, Api, Endpoints, ListParams, Namespace,
    Patch, PatchParams, Pod, PostParams, Secret, Service,
};
use kube::Resource;
use serde_json::json;

type Result<T> = std::result::Result<T, kube::Error>;

/// The Kubernetes reads and writes the reconcilers perform.
///
/// Gets report a missing object as `Ok(None)`.
#[async_trait::async_trait]
pub trait KubeApi: Send + Sync {
    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>>;

    async fn pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    async fn pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    async fn set_pod_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    async fn namespace(&self, name: &str) -> Result<Option<Namespace>>;

    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret>;

    async fn replace_secret(&self, namespace: &str, name: &str, secret: &Secret) -> Result<Secret>;

    /// Deleting a secret that does not exist succeeds.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    async fn patch_peering_acceptor_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PeeringAcceptorStatus,
    ) -> Result<()>;

    async fn set_peering_acceptor_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()>;

    async fn patch_terminating_gateway_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TerminatingGatewayServiceStatus,
    ) -> Result<()>;

    async fn set_terminating_gateway_service_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()>;
}

/// [`KubeApi`] backed by the API server.
#[derive(Clone)]
pub struct KubeClient {
    client: k8s::Client,
    patch_params: PatchParams,
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

// === impl KubeClient ===

impl KubeClient {
    pub fn new(client: k8s::Client, field_manager: &str) -> Self {
        Self {
            client,
            patch_params: PatchParams::apply(field_manager),
        }
    }

    fn namespaced<T>(&self, namespace: &str) -> Api<T>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        T::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_status<T>(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        T::DynamicType: Default,
    {
        let patch = json!({ "status": status });
        self.namespaced::<T>(namespace)
            .patch_status(name, &self.patch_params, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_finalizers<T>(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()>
    where
        T: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + serde::de::DeserializeOwned
            + std::fmt::Debug,
        T::DynamicType: Default,
    {
        let patch = json!({ "metadata": { "finalizers": finalizers } });
        self.namespaced::<T>(namespace)
            .patch(name, &self.patch_params, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl KubeApi for KubeClient {
    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>> {
        self.namespaced(namespace).get_opt(name).await
    }

    async fn pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        self.namespaced(namespace).get_opt(name).await
    }

    async fn pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(label_selector);
        let pods = self.namespaced::<Pod>(namespace).list(&params).await?;
        Ok(pods.items)
    }

    async fn set_pod_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": { key: value } } });
        self.namespaced::<Pod>(namespace)
            .patch(name, &self.patch_params, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn namespace(&self, name: &str) -> Result<Option<Namespace>> {
        Api::<Namespace>::all(self.client.clone()).get_opt(name).await
    }

    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.namespaced(namespace).get_opt(name).await
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.namespaced(namespace).get_opt(name).await
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        self.namespaced(namespace)
            .create(&PostParams::default(), secret)
            .await
    }

    async fn replace_secret(&self, namespace: &str, name: &str, secret: &Secret) -> Result<Secret> {
        self.namespaced(namespace)
            .replace(name, &PostParams::default(), secret)
            .await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .namespaced::<Secret>(namespace)
            .delete(name, &Default::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn patch_peering_acceptor_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PeeringAcceptorStatus,
    ) -> Result<()> {
        let status = serde_json::to_value(status).map_err(kube::Error::SerdeError)?;
        self.patch_status::<k8s::PeeringAcceptor>(namespace, name, status)
            .await
    }

    async fn set_peering_acceptor_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        self.set_finalizers::<k8s::PeeringAcceptor>(namespace, name, finalizers)
            .await
    }

    async fn patch_terminating_gateway_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TerminatingGatewayServiceStatus,
    ) -> Result<()> {
        let status = serde_json::to_value(status).map_err(kube::Error::SerdeError)?;
        self.patch_status::<k8s::TerminatingGatewayService>(namespace, name, status)
            .await
    }

    async fn set_terminating_gateway_service_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        self.set_finalizers::<k8s::TerminatingGatewayService>(namespace, name, finalizers)
            .await
    }
}
