//! Registers the pods behind each Endpoints object as mesh service instances, with a sidecar
//! proxy and a TTL health check that mirrors pod readiness.

use crate::{AgentDirectory, ControllerMetrics, Error, Errors, KubeApi, Result};
use consul_k8s_core::{
    annotations::{self, pod_annotation, REDIRECT_TRAFFIC_CONFIG},
    catalog::{
        AclToken, AgentCheckRegistration, AgentServiceCheck, AgentServiceRegistration, ProxyConfig,
        ServiceAddress, Upstream, HEALTH_CRITICAL, HEALTH_PASSING, KIND_CONNECT_PROXY,
        META_KEY_KUBE_NS, META_KEY_KUBE_SERVICE_NAME, META_KEY_MANAGED_BY, META_KEY_POD_NAME,
        PROXY_CONFIG_GLOBAL, PROXY_MODE_TRANSPARENT, VIRTUAL_TAGGED_ADDRESS,
    },
    iptables::{IptablesConfig, DEFAULT_INBOUND_PORT},
    metrics::MetricsConfig,
    ports,
    probes::{self, OriginalPod},
    token,
    upstreams::{self, ProxyDefaultsLookup},
    MeshNamespaces, NamespaceFilter, MANAGED_BY_ENDPOINTS_CONTROLLER,
};
use consul_k8s_k8s_api::{
    api::core::v1::{EndpointAddress, EndpointSubset},
    Action, Endpoints, Pod, ResourceExt, Service,
};
use consul_k8s_mesh::{MeshClient, MeshError, Scope};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    net::IpAddr,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
mod tests;

const CONTROLLER: &str = "endpoints";

const HEALTH_CHECK_NAME: &str = "Kubernetes Health Check";
const HEALTH_CHECK_TTL: &str = "100000h";
const HEALTH_PASSING_OUTPUT: &str = "Kubernetes health checks passing";

const PROMETHEUS_BIND_ADDR: &str = "envoy_prometheus_bind_addr";

const MAX_DELETE_BACKOFF: Duration = Duration::from_secs(300);

/// Controller-wide settings for the endpoints reconciler.
#[derive(Clone, Debug, Default)]
pub struct EndpointsConfig {
    pub namespaces: NamespaceFilter,
    pub mesh_namespaces: MeshNamespaces,
    pub enable_partitions: bool,
    /// Tokens minted by this auth method are deleted along with their service instance.
    pub auth_method: Option<String>,
    pub enable_transparent_proxy: bool,
    pub overwrite_probes: bool,
    pub metrics: MetricsConfig,
    pub resync: Duration,
    pub error_requeue: Duration,
}

pub struct EndpointsReconciler {
    kube: Arc<dyn KubeApi>,
    agents: Arc<dyn AgentDirectory>,
    config: EndpointsConfig,
    metrics: ControllerMetrics,
    passes: KeyLocks,
}

/// One lock per Endpoints key with a pass in flight, so passes over a key never overlap.
#[derive(Default)]
struct KeyLocks(Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>);

/// The service and proxy registrations derived from one pod.
#[derive(Clone, Debug, PartialEq)]
pub struct Registrations {
    pub service: AgentServiceRegistration,
    pub proxy: AgentServiceRegistration,
}

/// Reconciles the Endpoints object that triggered the controller.
pub async fn reconcile(
    endpoints: Arc<Endpoints>,
    ctx: Arc<EndpointsReconciler>,
) -> Result<Action> {
    let namespace = endpoints.namespace().unwrap_or_default();
    let name = endpoints.name_any();
    ctx.reconcile_key(&namespace, &name).await?;
    Ok(Action::requeue(ctx.config.resync))
}

pub fn error_policy(_: Arc<Endpoints>, error: &Error, ctx: Arc<EndpointsReconciler>) -> Action {
    warn!(%error, "Failed to reconcile endpoints");
    Action::requeue(ctx.config.error_requeue)
}

/// Names of the Endpoints objects with an address on the node running `agent`.
///
/// Agents that are not both running and ready contribute nothing.
pub fn endpoints_on_agent_node<'e>(
    agent: &Pod,
    endpoints: impl IntoIterator<Item = &'e Endpoints>,
) -> Vec<(String, String)> {
    if !crate::agents::is_running(agent) || !crate::agents::is_ready(agent) {
        return Vec::new();
    }
    let Some(node) = agent.spec.as_ref().and_then(|s| s.node_name.as_deref()) else {
        return Vec::new();
    };
    endpoints
        .into_iter()
        .filter(|ep| {
            ep.subsets
                .iter()
                .flatten()
                .flat_map(all_addresses)
                .any(|(address, _)| address.node_name.as_deref() == Some(node))
        })
        .map(|ep| (ep.namespace().unwrap_or_default(), ep.name_any()))
        .collect()
}

fn all_addresses(subset: &EndpointSubset) -> impl Iterator<Item = (&EndpointAddress, &'static str)> {
    let ready = subset.addresses.iter().flatten().map(|a| (a, HEALTH_PASSING));
    let not_ready = subset
        .not_ready_addresses
        .iter()
        .flatten()
        .map(|a| (a, HEALTH_CRITICAL));
    ready.chain(not_ready)
}

pub fn service_id(pod_name: &str, service_name: &str) -> String {
    format!("{pod_name}-{service_name}")
}

pub fn proxy_service_id(pod_name: &str, service_name: &str) -> String {
    format!("{pod_name}-{service_name}-sidecar-proxy")
}

pub fn health_check_id(namespace: &str, service_id: &str) -> String {
    format!("{namespace}/{service_id}/kubernetes-health-check")
}

fn health_check_output(status: &str, namespace: &str, pod_name: &str) -> String {
    if status == HEALTH_PASSING {
        return HEALTH_PASSING_OUTPUT.to_string();
    }
    format!("Pod \"{namespace}/{pod_name}\" is not ready")
}

/// The agent filter selecting instances registered for a Kubernetes service.
fn instances_filter(k8s_service: &str, namespace: &str) -> String {
    format!(
        "Meta[{META_KEY_KUBE_SERVICE_NAME:?}] == {k8s_service:?} and Meta[{META_KEY_KUBE_NS:?}] == {namespace:?} and Meta[{META_KEY_MANAGED_BY:?}] == {MANAGED_BY_ENDPOINTS_CONTROLLER:?}"
    )
}

// === impl EndpointsReconciler ===

impl EndpointsReconciler {
    pub fn new(
        kube: Arc<dyn KubeApi>,
        agents: Arc<dyn AgentDirectory>,
        config: EndpointsConfig,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            kube,
            agents,
            config,
            metrics,
            passes: KeyLocks::default(),
        }
    }

    /// Reconciles the Endpoints object `namespace/name`, whether or not it still exists.
    ///
    /// Waits for any other pass over the same key to finish first.
    #[instrument(skip_all, fields(%namespace, %name))]
    pub async fn reconcile_key(&self, namespace: &str, name: &str) -> Result<()> {
        let key = (namespace.to_string(), name.to_string());
        let lock = self.passes.acquire(&key);
        let result = {
            let _pass = lock.lock().await;
            self.sync(namespace, name).await
        };
        self.passes.release(&key, lock);
        self.metrics.record(CONTROLLER, &result);
        result
    }

    /// Reconciles a deleted Endpoints object until its instances are deregistered, backing
    /// off exponentially from the error requeue interval between attempts.
    pub async fn reconcile_deleted(&self, namespace: &str, name: &str) {
        let mut delay = self.config.error_requeue;
        let mut attempt = 1u32;
        while let Err(error) = self.reconcile_key(namespace, name).await {
            warn!(%error, %namespace, %name, attempt, retry_in = ?delay, "Failed to deregister deleted endpoints");
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2).min(MAX_DELETE_BACKOFF);
            attempt += 1;
        }
    }

    async fn sync(&self, namespace: &str, name: &str) -> Result<()> {
        if self.config.namespaces.should_ignore(namespace) {
            debug!("Ignoring namespace");
            return Ok(());
        }

        let endpoints = match self.kube.endpoints(namespace, name).await? {
            Some(endpoints) => endpoints,
            None => {
                info!("Endpoints deleted; deregistering all instances");
                return self.deregister(name, namespace, None).await;
            }
        };
        if annotations::is_labeled_ignore(endpoints.metadata.labels.as_ref()) {
            info!("Endpoints labeled to be ignored; deregistering all instances");
            return self.deregister(name, namespace, None).await;
        }

        let mut errors = Errors::default();
        let mut registered = BTreeSet::new();
        for (address, health) in endpoints.subsets.iter().flatten().flat_map(all_addresses) {
            let Some(target) = address
                .target_ref
                .as_ref()
                .filter(|r| r.kind.as_deref() == Some("Pod"))
            else {
                continue;
            };
            let pod_name = target.name.as_deref().unwrap_or_default();
            let pod_ns = target.namespace.as_deref().unwrap_or(namespace);
            let pod = match self.kube.pod(pod_ns, pod_name).await {
                Ok(Some(pod)) => pod,
                // The address is still listed, so its instance must survive this pass.
                Ok(None) => {
                    warn!(pod = %pod_name, "Pod not found");
                    registered.insert(address.ip.clone());
                    errors.push(Error::Invalid(format!("pod {pod_ns}/{pod_name} not found")));
                    continue;
                }
                Err(error) => {
                    warn!(pod = %pod_name, %error, "Failed to get pod");
                    registered.insert(address.ip.clone());
                    errors.push(error.into());
                    continue;
                }
            };

            if let Some(svc) = pod_annotation(&pod, annotations::KUBERNETES_SERVICE) {
                if svc != name {
                    debug!(pod = %pod_name, service = %svc, "Pod names a different service; skipping");
                    continue;
                }
            }

            if annotations::has_been_injected(&pod) {
                if let Some(ip) = pod.status.as_ref().and_then(|s| s.pod_ip.clone()) {
                    registered.insert(ip);
                }
                if let Err(error) = self.register(&pod, &endpoints, health).await {
                    warn!(pod = %pod_name, %error, "Failed to register pod");
                    errors.push(error);
                }
            }
        }

        if let Err(error) = self.deregister(name, namespace, Some(&registered)).await {
            warn!(%error, "Failed to deregister stale instances");
            errors.push(error);
        }
        errors.into_result()
    }

    async fn register(&self, pod: &Pod, endpoints: &Endpoints, health: &str) -> Result<()> {
        let host_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.host_ip.as_deref())
            .unwrap_or_default();
        let client = self.agents.agent_for(host_ip).await?;
        let pod_ns = pod.namespace().unwrap_or_default();
        let mesh_ns = self.config.mesh_namespaces.consul_namespace(&pod_ns);

        if annotations::is_managed_by_endpoints_controller(pod) {
            let Registrations { service, proxy } =
                self.registrations(pod, endpoints, &*client).await?;
            info!(id = %service.id, agent = %host_ip, "Registering service");
            client.register_service(&service).await?;
            info!(id = %proxy.id, "Registering proxy");
            client.register_service(&proxy).await?;
            self.refine_redirect_config(pod, &*client, &proxy.id, Scope::namespace(&mesh_ns))
                .await?;
        }

        let endpoints_name = endpoints.name_any();
        let service_name = annotations::service_name(pod, &endpoints_name);
        let id = service_id(&pod.name_any(), &service_name);
        self.upsert_health_check(&*client, pod, &id, health, Scope::namespace(&mesh_ns))
            .await
    }

    /// Rewrites the pod's redirect-traffic config with the proxy as the agent registered it.
    async fn refine_redirect_config(
        &self,
        pod: &Pod,
        client: &dyn MeshClient,
        proxy_id: &str,
        scope: Scope<'_>,
    ) -> Result<()> {
        let Some(raw) = pod_annotation(pod, REDIRECT_TRAFFIC_CONFIG) else {
            return Ok(());
        };
        let Some(proxy) = client.service(proxy_id, scope).await? else {
            return Ok(());
        };
        let current = IptablesConfig::from_json(raw)
            .map_err(|e| Error::invalid(format!("{REDIRECT_TRAFFIC_CONFIG}: {e}")))?;
        let mut refined = current.clone();
        refined.refine_from_proxy(&proxy).map_err(Error::invalid)?;
        if refined == current {
            return Ok(());
        }

        let value = refined.to_json().map_err(Error::invalid)?;
        info!(pod = %pod.name_any(), "Refining redirect-traffic config");
        self.kube
            .set_pod_annotation(
                &pod.namespace().unwrap_or_default(),
                &pod.name_any(),
                REDIRECT_TRAFFIC_CONFIG,
                &value,
            )
            .await?;
        Ok(())
    }

    async fn upsert_health_check(
        &self,
        client: &dyn MeshClient,
        pod: &Pod,
        service_id: &str,
        status: &str,
        scope: Scope<'_>,
    ) -> Result<()> {
        let pod_ns = pod.namespace().unwrap_or_default();
        let check_id = health_check_id(&pod_ns, service_id);
        let output = health_check_output(status, &pod_ns, &pod.name_any());

        let checks = client
            .checks(&format!("CheckID == `{check_id}`"), scope)
            .await?;
        match checks.get(&check_id) {
            None => {
                let registration = AgentCheckRegistration {
                    id: check_id.clone(),
                    name: HEALTH_CHECK_NAME.to_string(),
                    service_id: service_id.to_string(),
                    ttl: HEALTH_CHECK_TTL.to_string(),
                    status: status.to_string(),
                    success_before_passing: 1,
                    failures_before_critical: 1,
                    namespace: scope.namespace.to_string(),
                };
                client
                    .register_check(&registration)
                    .await
                    .map_err(|error| match error {
                        MeshError::Status { ref body, .. }
                            if body.contains(&format!("{service_id}\" does not exist")) =>
                        {
                            Error::Invalid(format!(
                                "service {service_id:?} not found in Consul: unable to register health check"
                            ))
                        }
                        error => error.into(),
                    })?;
                // The check's output can only be set through a TTL update.
                client.update_ttl(&check_id, &output, status, scope).await?;
            }
            Some(check) if check.status != status => {
                info!(id = %check_id, %status, "Updating health check");
                client.update_ttl(&check_id, &output, status, scope).await?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Builds the service and proxy registrations for `pod` behind `endpoints`.
    pub async fn registrations(
        &self,
        pod: &Pod,
        endpoints: &Endpoints,
        client: &dyn MeshClient,
    ) -> Result<Registrations> {
        let endpoints_name = endpoints.name_any();
        let endpoints_ns = endpoints.namespace().unwrap_or_default();
        let pod_name = pod.name_any();
        let pod_ns = pod.namespace().unwrap_or_default();
        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .unwrap_or_default();
        let mesh_ns = self.config.mesh_namespaces.consul_namespace(&pod_ns);
        let port_index = annotations::multi_port_index(pod, &endpoints_name);

        let port = service_port(pod, port_index);
        let service_name = annotations::service_name(pod, &endpoints_name);
        let id = service_id(&pod_name, &service_name);

        let mut meta = [
            (META_KEY_POD_NAME, pod_name.clone()),
            (META_KEY_KUBE_SERVICE_NAME, endpoints_name.clone()),
            (META_KEY_KUBE_NS, endpoints_ns.clone()),
            (META_KEY_MANAGED_BY, MANAGED_BY_ENDPOINTS_CONTROLLER.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect::<BTreeMap<_, _>>();
        meta.extend(annotations::service_meta(pod));
        let tags = annotations::service_tags(pod);

        let mut service = AgentServiceRegistration {
            id: id.clone(),
            name: service_name.clone(),
            port,
            address: pod_ip.clone(),
            meta: meta.clone(),
            namespace: mesh_ns.clone(),
            tags: tags.clone(),
            ..Default::default()
        };

        let mut proxy_config = ProxyConfig {
            destination_service_name: service_name.clone(),
            destination_service_id: id.clone(),
            ..Default::default()
        };
        if self.config.metrics.enable_metrics(pod)? {
            if let Some(scrape) = self.config.metrics.prometheus_scrape_port(pod)? {
                proxy_config.config.insert(
                    PROMETHEUS_BIND_ADDR.to_string(),
                    serde_json::Value::String(format!("0.0.0.0:{scrape}")),
                );
            }
        }
        if port > 0 {
            proxy_config.local_service_address = "127.0.0.1".to_string();
            proxy_config.local_service_port = port;
        }
        proxy_config.upstreams = self.upstreams(pod, port_index, client).await?;

        let proxy_port = DEFAULT_INBOUND_PORT
            .saturating_add(u16::try_from(port_index.unwrap_or(0)).unwrap_or(u16::MAX));
        let mut proxy = AgentServiceRegistration {
            kind: KIND_CONNECT_PROXY.to_string(),
            id: proxy_service_id(&pod_name, &service_name),
            name: format!("{service_name}-sidecar-proxy"),
            port: proxy_port,
            address: pod_ip.clone(),
            meta,
            namespace: mesh_ns,
            checks: vec![
                AgentServiceCheck {
                    name: "Proxy Public Listener".to_string(),
                    tcp: format!("{pod_ip}:{proxy_port}"),
                    interval: "10s".to_string(),
                    deregister_critical_service_after: "10m".to_string(),
                    ..Default::default()
                },
                AgentServiceCheck {
                    name: "Destination Alias".to_string(),
                    alias_service: id,
                    ..Default::default()
                },
            ],
            tags,
            ..Default::default()
        };

        let ns = self.kube.namespace(&pod_ns).await?;
        if annotations::transparent_proxy_enabled(
            pod,
            ns.as_ref(),
            self.config.enable_transparent_proxy,
        )? {
            let k8s_service = self
                .kube
                .service(&endpoints_ns, &endpoints_name)
                .await?
                .ok_or_else(|| {
                    Error::Invalid(format!("service {endpoints_ns}/{endpoints_name} not found"))
                })?;
            let cluster_ip = k8s_service
                .spec
                .as_ref()
                .and_then(|s| s.cluster_ip.clone())
                .unwrap_or_default();
            if cluster_ip.parse::<IpAddr>().is_ok() {
                let service_port = virtual_port(pod, &k8s_service, port)?;
                let tagged = [(
                    VIRTUAL_TAGGED_ADDRESS.to_string(),
                    ServiceAddress {
                        address: cluster_ip,
                        port: service_port,
                    },
                )]
                .into_iter()
                .collect::<BTreeMap<_, _>>();
                service.tagged_addresses = tagged.clone();
                proxy.tagged_addresses = tagged;
                proxy_config.mode = PROXY_MODE_TRANSPARENT.to_string();
            } else {
                info!(service = %endpoints_name, ip = %cluster_ip, "Service has no cluster IP; skipping virtual address");
            }

            if annotations::overwrite_probes(pod, self.config.overwrite_probes)? {
                let original = OriginalPod::from_annotation(pod)?;
                proxy_config
                    .expose
                    .paths
                    .extend(probes::expose_paths(pod, &original)?);
            }
        }

        proxy.proxy = Some(proxy_config);
        Ok(Registrations { service, proxy })
    }

    async fn upstreams(
        &self,
        pod: &Pod,
        port_index: Option<usize>,
        client: &dyn MeshClient,
    ) -> Result<Vec<Upstream>> {
        // Only the first service of a multi-port pod carries upstreams.
        if port_index.is_some_and(|i| i > 0) {
            return Ok(Vec::new());
        }
        let namespaced = self.config.mesh_namespaces.is_enabled() || self.config.enable_partitions;
        let parsed = upstreams::parse(pod, namespaced)?;

        let defaults = if parsed.iter().any(|u| u.requires_mesh_gateway) {
            Some(client.proxy_defaults(PROXY_CONFIG_GLOBAL).await)
        } else {
            None
        };
        let lookup = match &defaults {
            Some(Ok(Some(entry))) => ProxyDefaultsLookup::Found {
                mesh_gateway_mode: &entry.mesh_gateway.mode,
            },
            Some(Ok(None)) => ProxyDefaultsLookup::NotFound,
            Some(Err(error)) => {
                debug!(%error, "Failed to read proxy defaults");
                ProxyDefaultsLookup::Unavailable
            }
            None => ProxyDefaultsLookup::Unavailable,
        };

        let mut out = Vec::with_capacity(parsed.len());
        for upstream in parsed {
            upstream.check_mesh_gateway(lookup.clone())?;
            out.push(upstream.upstream);
        }
        Ok(out)
    }

    /// Deregisters instances of `k8s_service` from every ready agent.
    ///
    /// With `keep`, only instances whose address is absent from it are removed.
    async fn deregister(
        &self,
        k8s_service: &str,
        namespace: &str,
        keep: Option<&BTreeSet<String>>,
    ) -> Result<()> {
        let mesh_ns = self.config.mesh_namespaces.consul_namespace(namespace);
        let scope = Scope::namespace(&mesh_ns);
        let mut errors = Errors::default();
        for agent in self.agents.ready_agents().await? {
            if let Err(error) = self
                .deregister_on_agent(&*agent.client, k8s_service, namespace, keep, scope)
                .await
            {
                warn!(agent = %agent.name, %error, "Failed to deregister on agent");
                errors.push(Error::Agent {
                    agent: agent.name,
                    source: Box::new(error),
                });
            }
        }
        errors.into_result()
    }

    /// Removes every stale instance the agent holds, continuing past individual failures.
    async fn deregister_on_agent(
        &self,
        client: &dyn MeshClient,
        k8s_service: &str,
        namespace: &str,
        keep: Option<&BTreeSet<String>>,
        scope: Scope<'_>,
    ) -> Result<()> {
        let instances = client
            .services(&instances_filter(k8s_service, namespace), scope)
            .await?;
        let mut errors = Errors::default();
        // Listed at most once per pass, on the first deregistration that needs it.
        let mut tokens: Option<Vec<AclToken>> = None;
        for (id, instance) in instances {
            if keep.is_some_and(|keep| keep.contains(&instance.address)) {
                continue;
            }
            info!(%id, "Deregistering service");
            if let Err(error) = client.deregister_service(&id, scope).await {
                warn!(%id, %error, "Failed to deregister service");
                errors.push(error.into());
                continue;
            }

            let Some(auth_method) = self.config.auth_method.as_deref() else {
                continue;
            };
            let pod_name = instance
                .meta
                .as_ref()
                .and_then(|m| m.get(META_KEY_POD_NAME))
                .map(String::as_str)
                .unwrap_or_default();
            if pod_name.is_empty() {
                continue;
            }
            if tokens.is_none() {
                tokens = Some(match client.tokens().await {
                    Ok(list) => list,
                    Err(error) => {
                        warn!(%error, "Failed to list ACL tokens");
                        errors.push(error.into());
                        Vec::new()
                    }
                });
            }
            delete_tokens(
                client,
                tokens.get_or_insert_with(Vec::new),
                auth_method,
                &instance.service,
                namespace,
                pod_name,
                &mut errors,
            )
            .await;
        }
        errors.into_result()
    }
}

// === impl KeyLocks ===

impl KeyLocks {
    fn acquire(&self, key: &(String, String)) -> Arc<tokio::sync::Mutex<()>> {
        self.0.lock().entry(key.clone()).or_default().clone()
    }

    fn release(&self, key: &(String, String), lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.0.lock();
        // Only the map and this caller hold it; nobody else is waiting on the key.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().len()
    }
}

/// Deletes the tokens `pod_name` logged in with, dropping them from `tokens`.
async fn delete_tokens(
    client: &dyn MeshClient,
    tokens: &mut Vec<AclToken>,
    auth_method: &str,
    service_name: &str,
    namespace: &str,
    pod_name: &str,
    errors: &mut Errors,
) {
    let mut remaining = Vec::with_capacity(tokens.len());
    for acl in tokens.drain(..) {
        if !token::is_owned_by(&acl, auth_method, service_name, namespace, pod_name) {
            remaining.push(acl);
            continue;
        }
        info!(pod = %pod_name, accessor = %acl.accessor_id, "Deleting ACL token");
        if let Err(error) = client.delete_token(&acl.accessor_id).await {
            warn!(accessor = %acl.accessor_id, %error, "Failed to delete ACL token");
            errors.push(error.into());
            remaining.push(acl);
        }
    }
    *tokens = remaining;
}

/// The registered service port: the ordinal entry of a multi-port annotation, or the single
/// value. Values that do not resolve to a positive port leave it unset.
fn service_port(pod: &Pod, port_index: Option<usize>) -> u16 {
    let Some(raw) = pod_annotation(pod, annotations::SERVICE_PORT).filter(|r| !r.is_empty()) else {
        return 0;
    };
    let parts = raw.split(',').collect::<Vec<_>>();
    let raw = if parts.len() > 1 {
        match port_index.and_then(|i| parts.get(i)) {
            Some(part) => *part,
            None => return 0,
        }
    } else {
        raw
    };
    match ports::port_value(pod, raw) {
        Ok(port) => u16::try_from(port).unwrap_or(0),
        Err(error) => {
            debug!(%error, "Ignoring unresolvable service port");
            0
        }
    }
}

/// The port of `service` whose target (or, when unset, the port itself) is `port`.
fn virtual_port(pod: &Pod, service: &Service, port: u16) -> Result<u16> {
    for sp in service.spec.iter().flat_map(|s| s.ports.iter().flatten()) {
        let target = match sp.target_port.as_ref() {
            Some(target) => ports::port_from_int_or_string(pod, target)?,
            None => 0,
        };
        if (target != 0 && target == i32::from(port)) || sp.port == i32::from(port) {
            return Ok(u16::try_from(sp.port).unwrap_or(0));
        }
    }
    Ok(0)
}
