use crate::{
    catalog::{
        AclPolicy, AclRole, AclToken, AgentCheck, AgentCheckRegistration, AgentService,
        AgentServiceRegistration, CatalogDeregistration, CatalogRegistration, CatalogService,
        Peering, PeeringToken, ProxyConfigEntry, PROXY_DEFAULTS,
    },
    MeshClient, MeshError, Result, Scope,
};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::BTreeMap, future::Future, time::Duration};
use tracing::debug;
use url::Url;

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Connection settings shared by every client, whichever host it talks to.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    pub scheme: String,
    pub port: u16,
    pub token: Option<String>,
    pub partition: String,
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct HttpMeshClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
    partition: String,
    timeout: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CheckUpdate<'a> {
    status: &'a str,
    output: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PeeringTokenRequest<'a> {
    peer_name: &'a str,
}

// === impl MeshConfig ===

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            port: 8500,
            token: None,
            partition: String::new(),
            timeout: Duration::from_secs(5),
        }
    }
}

// === impl HttpMeshClient ===

impl HttpMeshClient {
    /// Builds a client for the agent or server at `host`.
    pub fn new(config: &MeshConfig, http: reqwest::Client, host: &str) -> Result<Self> {
        let base = Url::parse(&format!("{}://{}:{}", config.scheme, host, config.port))?;
        Ok(Self {
            http,
            base,
            token: config.token.clone(),
            partition: config.partition.clone(),
            timeout: config.timeout,
        })
    }

    pub fn http_client() -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder().build()?)
    }

    fn url(&self, path: &str, query: &[(&str, &str)], scope: Scope<'_>) -> Result<Url> {
        let mut url = self.base.join(path)?;
        {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
            if !scope.namespace.is_empty() {
                pairs.append_pair("ns", scope.namespace);
            }
            if !self.partition.is_empty() {
                pairs.append_pair("partition", &self.partition);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let req = self.http.request(method, url);
        match self.token.as_deref() {
            Some(token) if !token.is_empty() => req.header(TOKEN_HEADER, token),
            _ => req,
        }
    }

    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| MeshError::Timeout(self.timeout))?
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        self.timed(async move { check_status(req.send().await?).await })
            .await
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!(%url, "GET");
        self.timed(async move {
            let rsp = check_status(self.request(Method::GET, url).send().await?).await?;
            decode(rsp).await
        })
        .await
    }

    async fn get_opt<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        match self.get(url).await {
            Ok(v) => Ok(Some(v)),
            Err(MeshError::NotFound) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn put<B: Serialize + Sync>(&self, url: Url, body: Option<&B>) -> Result<reqwest::Response> {
        debug!(%url, "PUT");
        let req = self.request(Method::PUT, url);
        let req = match body {
            Some(body) => req.json(body),
            None => req,
        };
        self.send(req).await
    }

    async fn delete(&self, url: Url) -> Result<()> {
        debug!(%url, "DELETE");
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }
}

async fn check_status(rsp: reqwest::Response) -> Result<reqwest::Response> {
    let status = rsp.status();
    if status.is_success() {
        return Ok(rsp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(MeshError::NotFound);
    }
    let body = rsp.text().await.unwrap_or_default();
    Err(MeshError::Status {
        code: status.as_u16(),
        body: body.trim().to_string(),
    })
}

async fn decode<T: DeserializeOwned>(rsp: reqwest::Response) -> Result<T> {
    let bytes = rsp.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait::async_trait]
impl MeshClient for HttpMeshClient {
    async fn register_service(&self, registration: &AgentServiceRegistration) -> Result<()> {
        let scope = Scope::namespace(&registration.namespace);
        let url = self.url("/v1/agent/service/register", &[], scope)?;
        self.put(url, Some(registration)).await?;
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str, scope: Scope<'_>) -> Result<()> {
        let url = self.url(&format!("/v1/agent/service/deregister/{service_id}"), &[], scope)?;
        self.put::<()>(url, None).await?;
        Ok(())
    }

    async fn services(
        &self,
        filter: &str,
        scope: Scope<'_>,
    ) -> Result<BTreeMap<String, AgentService>> {
        let url = self.url("/v1/agent/services", &[("filter", filter)], scope)?;
        self.get(url).await
    }

    async fn service(&self, service_id: &str, scope: Scope<'_>) -> Result<Option<AgentService>> {
        let url = self.url(&format!("/v1/agent/service/{service_id}"), &[], scope)?;
        self.get_opt(url).await
    }

    async fn checks(&self, filter: &str, scope: Scope<'_>) -> Result<BTreeMap<String, AgentCheck>> {
        let url = self.url("/v1/agent/checks", &[("filter", filter)], scope)?;
        self.get(url).await
    }

    async fn register_check(&self, registration: &AgentCheckRegistration) -> Result<()> {
        let scope = Scope::namespace(&registration.namespace);
        let url = self.url("/v1/agent/check/register", &[], scope)?;
        self.put(url, Some(registration)).await?;
        Ok(())
    }

    async fn update_ttl(
        &self,
        check_id: &str,
        output: &str,
        status: &str,
        scope: Scope<'_>,
    ) -> Result<()> {
        let url = self.url(&format!("/v1/agent/check/update/{check_id}"), &[], scope)?;
        self.put(url, Some(&CheckUpdate { status, output })).await?;
        Ok(())
    }

    async fn catalog_register(&self, registration: &CatalogRegistration) -> Result<()> {
        let url = self.url("/v1/catalog/register", &[], Scope::default())?;
        self.put(url, Some(registration)).await?;
        Ok(())
    }

    async fn catalog_deregister(&self, deregistration: &CatalogDeregistration) -> Result<()> {
        let url = self.url("/v1/catalog/deregister", &[], Scope::default())?;
        self.put(url, Some(deregistration)).await?;
        Ok(())
    }

    async fn catalog_service(&self, name: &str) -> Result<Vec<CatalogService>> {
        let url = self.url(&format!("/v1/catalog/service/{name}"), &[], Scope::default())?;
        self.get(url).await
    }

    async fn tokens(&self) -> Result<Vec<AclToken>> {
        let url = self.url("/v1/acl/tokens", &[], Scope::default())?;
        self.get(url).await
    }

    async fn delete_token(&self, accessor_id: &str) -> Result<()> {
        let url = self.url(&format!("/v1/acl/token/{accessor_id}"), &[], Scope::default())?;
        self.delete(url).await
    }

    async fn create_policy(&self, policy: &AclPolicy) -> Result<AclPolicy> {
        let url = self.url("/v1/acl/policy", &[], Scope::default())?;
        let rsp = self.put(url, Some(policy)).await?;
        decode(rsp).await
    }

    async fn policies(&self) -> Result<Vec<AclPolicy>> {
        let url = self.url("/v1/acl/policies", &[], Scope::default())?;
        self.get(url).await
    }

    async fn delete_policy(&self, id: &str) -> Result<()> {
        let url = self.url(&format!("/v1/acl/policy/{id}"), &[], Scope::default())?;
        self.delete(url).await
    }

    async fn roles(&self) -> Result<Vec<AclRole>> {
        let url = self.url("/v1/acl/roles", &[], Scope::default())?;
        self.get(url).await
    }

    async fn update_role(&self, role: &AclRole) -> Result<AclRole> {
        let url = self.url(&format!("/v1/acl/role/{}", role.id), &[], Scope::default())?;
        let rsp = self.put(url, Some(role)).await?;
        decode(rsp).await
    }

    async fn peering(&self, name: &str) -> Result<Option<Peering>> {
        let url = self.url(&format!("/v1/peering/{name}"), &[], Scope::default())?;
        self.get_opt(url).await
    }

    async fn generate_peering_token(&self, peer_name: &str) -> Result<PeeringToken> {
        let url = self.url("/v1/peering/token", &[], Scope::default())?;
        debug!(%url, "POST");
        let req = self
            .request(Method::POST, url)
            .json(&PeeringTokenRequest { peer_name });
        let rsp = self.send(req).await?;
        decode(rsp).await
    }

    async fn delete_peering(&self, name: &str) -> Result<()> {
        let url = self.url(&format!("/v1/peering/{name}"), &[], Scope::default())?;
        self.delete(url).await
    }

    async fn proxy_defaults(&self, name: &str) -> Result<Option<ProxyConfigEntry>> {
        let url = self.url(
            &format!("/v1/config/{PROXY_DEFAULTS}/{name}"),
            &[],
            Scope::default(),
        )?;
        self.get_opt(url).await
    }
}
