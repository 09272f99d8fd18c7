//! In-memory stand-ins for the mesh and the API server that record the calls made against them.

use crate::KubeApi;
use consul_k8s_core::catalog::{
    AclPolicy, AclRole, AclToken, AgentCheck, AgentCheckRegistration, AgentService,
    AgentServiceRegistration, CatalogDeregistration, CatalogRegistration, CatalogService, Peering,
    PeeringToken, ProxyConfigEntry,
};
use consul_k8s_k8s_api::{
    api::core::v1::{EndpointAddress, EndpointSubset, ObjectReference, PodCondition},
    peering::PeeringAcceptorStatus,
    terminating_gateway::TerminatingGatewayServiceStatus,
    Endpoints, Namespace, ObjectMeta, Pod, PodSpec, PodStatus, Secret, Service,
};
use consul_k8s_mesh::{MeshClient, MeshError, Result as MeshResult, Scope};
use maplit::btreemap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
pub struct FakeKube {
    state: Mutex<KubeState>,
}

#[derive(Default)]
struct KubeState {
    pods: BTreeMap<Key, Pod>,
    endpoints: BTreeMap<Key, Endpoints>,
    namespaces: BTreeMap<String, Namespace>,
    services: BTreeMap<Key, Service>,
    secrets: BTreeMap<Key, Secret>,
    peering_status: BTreeMap<Key, PeeringAcceptorStatus>,
    tgw_status: BTreeMap<Key, TerminatingGatewayServiceStatus>,
    finalizers: BTreeMap<Key, Vec<String>>,
    resource_version: u64,
    fail_secret_writes: bool,
    unreachable_pods: BTreeSet<Key>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeMesh {
    state: Mutex<MeshState>,
}

#[derive(Default)]
struct MeshState {
    services: BTreeMap<String, AgentService>,
    checks: BTreeMap<String, AgentCheck>,
    catalog: Vec<CatalogService>,
    tokens: Vec<AclToken>,
    policies: Vec<AclPolicy>,
    roles: Vec<AclRole>,
    peerings: BTreeSet<String>,
    proxy_defaults: Option<ProxyConfigEntry>,
    failing: BTreeSet<&'static str>,
    failing_calls: BTreeSet<String>,
    issued: u64,
    calls: Vec<String>,
}

// === impl FakeKube ===

impl FakeKube {
    pub fn add_pod(&self, namespace: &str, mut pod: Pod) {
        pod.metadata.namespace = Some(namespace.to_string());
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.state.lock().pods.insert(key(namespace, &name), pod);
    }

    pub fn add_endpoints(&self, endpoints: Endpoints) {
        let namespace = endpoints.metadata.namespace.clone().unwrap_or_default();
        let name = endpoints.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .endpoints
            .insert(key(&namespace, &name), endpoints);
    }

    pub fn add_namespace(&self, ns: Namespace) {
        let name = ns.metadata.name.clone().unwrap_or_default();
        self.state.lock().namespaces.insert(name, ns);
    }

    pub fn add_service(&self, service: Service) {
        let namespace = service.metadata.namespace.clone().unwrap_or_default();
        let name = service.metadata.name.clone().unwrap_or_default();
        self.state
            .lock()
            .services
            .insert(key(&namespace, &name), service);
    }

    /// Stores a secret as if it had been written by someone else, returning its version.
    pub fn add_secret(&self, namespace: &str, mut secret: Secret) -> String {
        let mut state = self.state.lock();
        state.resource_version += 1;
        let version = state.resource_version.to_string();
        secret.metadata.resource_version = Some(version.clone());
        let name = secret.metadata.name.clone().unwrap_or_default();
        state.secrets.insert(key(namespace, &name), secret);
        version
    }

    pub fn secret_value(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state.lock().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn fail_secret_writes(&self) {
        self.state.lock().fail_secret_writes = true;
    }

    pub fn pod_value(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state.lock().pods.get(&key(namespace, name)).cloned()
    }

    /// Makes reads of one pod time out.
    pub fn fail_pod(&self, namespace: &str, name: &str) {
        self.state.lock().unreachable_pods.insert(key(namespace, name));
    }

    pub fn peering_status(&self, namespace: &str, name: &str) -> Option<PeeringAcceptorStatus> {
        self.state
            .lock()
            .peering_status
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn tgw_status(&self, namespace: &str, name: &str) -> Option<TerminatingGatewayServiceStatus> {
        self.state
            .lock()
            .tgw_status
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn finalizers(&self, namespace: &str, name: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .finalizers
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    fn write_secret(&self, call: &str, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
        let mut state = self.state.lock();
        let name = secret.metadata.name.clone().unwrap_or_default();
        state.calls.push(format!("{call} {namespace}/{name}"));
        if state.fail_secret_writes {
            return Err(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "forbidden".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
            }));
        }
        state.resource_version += 1;
        let mut secret = secret.clone();
        secret.metadata.resource_version = Some(state.resource_version.to_string());
        state.secrets.insert(key(namespace, &name), secret.clone());
        Ok(secret)
    }
}

fn matches_selector(pod: &Pod, selector: &str) -> bool {
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    selector.split(',').all(|term| match term.split_once('=') {
        Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
        None => false,
    })
}

#[async_trait::async_trait]
impl KubeApi for FakeKube {
    async fn endpoints(&self, namespace: &str, name: &str) -> Result<Option<Endpoints>, kube::Error> {
        Ok(self.state.lock().endpoints.get(&key(namespace, name)).cloned())
    }

    async fn pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, kube::Error> {
        let state = self.state.lock();
        if state.unreachable_pods.contains(&key(namespace, name)) {
            return Err(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "the server was unable to return a response in the time allotted"
                    .to_string(),
                reason: "Timeout".to_string(),
                code: 504,
            }));
        }
        Ok(state.pods.get(&key(namespace, name)).cloned())
    }

    async fn pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>, kube::Error> {
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && matches_selector(pod, label_selector))
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn set_pod_annotation(
        &self,
        namespace: &str,
        name: &str,
        annotation: &str,
        value: &str,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock();
        state
            .calls
            .push(format!("set_pod_annotation {namespace}/{name} {annotation}"));
        if let Some(pod) = state.pods.get_mut(&key(namespace, name)) {
            pod.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(annotation.to_string(), value.to_string());
        }
        Ok(())
    }

    async fn namespace(&self, name: &str) -> Result<Option<Namespace>, kube::Error> {
        Ok(self.state.lock().namespaces.get(name).cloned())
    }

    async fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>, kube::Error> {
        Ok(self.state.lock().services.get(&key(namespace, name)).cloned())
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, kube::Error> {
        Ok(self.state.lock().secrets.get(&key(namespace, name)).cloned())
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret, kube::Error> {
        self.write_secret("create_secret", namespace, secret)
    }

    async fn replace_secret(
        &self,
        namespace: &str,
        _name: &str,
        secret: &Secret,
    ) -> Result<Secret, kube::Error> {
        self.write_secret("replace_secret", namespace, secret)
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let mut state = self.state.lock();
        state.calls.push(format!("delete_secret {namespace}/{name}"));
        state.secrets.remove(&key(namespace, name));
        Ok(())
    }

    async fn patch_peering_acceptor_status(
        &self,
        namespace: &str,
        name: &str,
        status: &PeeringAcceptorStatus,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock();
        state.calls.push(format!("patch_status {namespace}/{name}"));
        state
            .peering_status
            .insert(key(namespace, name), status.clone());
        Ok(())
    }

    async fn set_peering_acceptor_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock();
        state.calls.push(format!("set_finalizers {namespace}/{name}"));
        state.finalizers.insert(key(namespace, name), finalizers);
        Ok(())
    }

    async fn patch_terminating_gateway_service_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TerminatingGatewayServiceStatus,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock();
        state.calls.push(format!("patch_status {namespace}/{name}"));
        state.tgw_status.insert(key(namespace, name), status.clone());
        Ok(())
    }

    async fn set_terminating_gateway_service_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), kube::Error> {
        let mut state = self.state.lock();
        state.calls.push(format!("set_finalizers {namespace}/{name}"));
        state.finalizers.insert(key(namespace, name), finalizers);
        Ok(())
    }
}

// === impl FakeMesh ===

impl FakeMesh {
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Makes every call to `op` fail with a server error.
    pub fn fail(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    /// Fails only the call recorded as `call`, e.g. `"deregister_service web-abc-web"`.
    pub fn fail_call(&self, call: &str) {
        self.state.lock().failing_calls.insert(call.to_string());
    }

    /// Clears every injected failure.
    pub fn recover(&self) {
        let mut state = self.state.lock();
        state.failing.clear();
        state.failing_calls.clear();
    }

    pub fn services_snapshot(&self) -> BTreeMap<String, AgentService> {
        self.state.lock().services.clone()
    }

    pub fn check(&self, id: &str) -> Option<AgentCheck> {
        self.state.lock().checks.get(id).cloned()
    }

    pub fn add_service(&self, service: AgentService) {
        self.state
            .lock()
            .services
            .insert(service.id.clone(), service);
    }

    pub fn add_token(&self, token: AclToken) {
        self.state.lock().tokens.push(token);
    }

    pub fn tokens_snapshot(&self) -> Vec<AclToken> {
        self.state.lock().tokens.clone()
    }

    pub fn add_role(&self, role: AclRole) {
        self.state.lock().roles.push(role);
    }

    pub fn role(&self, id: &str) -> Option<AclRole> {
        self.state.lock().roles.iter().find(|r| r.id == id).cloned()
    }

    pub fn add_policy(&self, policy: AclPolicy) {
        self.state.lock().policies.push(policy);
    }

    pub fn policies_snapshot(&self) -> Vec<AclPolicy> {
        self.state.lock().policies.clone()
    }

    pub fn add_catalog_service(&self, service: CatalogService) {
        self.state.lock().catalog.push(service);
    }

    pub fn catalog_snapshot(&self) -> Vec<CatalogService> {
        self.state.lock().catalog.clone()
    }

    pub fn add_peering(&self, name: &str) {
        self.state.lock().peerings.insert(name.to_string());
    }

    pub fn has_peering(&self, name: &str) -> bool {
        self.state.lock().peerings.contains(name)
    }

    pub fn set_proxy_defaults(&self, mode: &str) {
        self.state.lock().proxy_defaults = Some(ProxyConfigEntry {
            kind: "proxy-defaults".to_string(),
            name: "global".to_string(),
            mesh_gateway: consul_k8s_core::catalog::MeshGatewayConfig {
                mode: mode.to_string(),
            },
        });
    }

    fn record(&self, op: &'static str, detail: impl std::fmt::Display) -> MeshResult<()> {
        let mut state = self.state.lock();
        let call = format!("{op} {detail}").trim_end().to_string();
        let fails = state.failing.contains(op) || state.failing_calls.contains(&call);
        state.calls.push(call);
        if fails {
            return Err(MeshError::Status {
                code: 500,
                body: format!("{op} failed"),
            });
        }
        Ok(())
    }
}

/// Evaluates the conjunction of `Meta["k"] == "v"` clauses used by the controllers.
fn matches_meta_filter(service: &AgentService, filter: &str) -> bool {
    let meta = service.meta.clone().unwrap_or_default();
    filter.split(" and ").all(|clause| {
        let Some((k, v)) = clause.split_once(" == ") else {
            return false;
        };
        let k = k.trim_start_matches("Meta[").trim_end_matches(']').trim_matches('"');
        meta.get(k).map(String::as_str) == Some(v.trim_matches('"'))
    })
}

#[async_trait::async_trait]
impl MeshClient for FakeMesh {
    async fn register_service(&self, reg: &AgentServiceRegistration) -> MeshResult<()> {
        self.record("register_service", &reg.id)?;
        let service = AgentService {
            kind: reg.kind.clone(),
            id: reg.id.clone(),
            service: reg.name.clone(),
            tags: Some(reg.tags.clone()),
            meta: Some(reg.meta.clone()),
            port: reg.port,
            address: reg.address.clone(),
            tagged_addresses: Some(reg.tagged_addresses.clone()),
            proxy: reg.proxy.clone(),
            namespace: reg.namespace.clone(),
            ..Default::default()
        };
        self.state.lock().services.insert(reg.id.clone(), service);
        Ok(())
    }

    async fn deregister_service(&self, service_id: &str, _scope: Scope<'_>) -> MeshResult<()> {
        self.record("deregister_service", service_id)?;
        self.state.lock().services.remove(service_id);
        Ok(())
    }

    async fn services(
        &self,
        filter: &str,
        _scope: Scope<'_>,
    ) -> MeshResult<BTreeMap<String, AgentService>> {
        self.record("services", "")?;
        Ok(self
            .state
            .lock()
            .services
            .iter()
            .filter(|(_, svc)| matches_meta_filter(svc, filter))
            .map(|(id, svc)| (id.clone(), svc.clone()))
            .collect())
    }

    async fn service(&self, service_id: &str, _scope: Scope<'_>) -> MeshResult<Option<AgentService>> {
        self.record("service", service_id)?;
        Ok(self.state.lock().services.get(service_id).cloned())
    }

    async fn checks(
        &self,
        filter: &str,
        _scope: Scope<'_>,
    ) -> MeshResult<BTreeMap<String, AgentCheck>> {
        self.record("checks", "")?;
        let id = filter.split('`').nth(1).unwrap_or_default();
        Ok(self
            .state
            .lock()
            .checks
            .get(id)
            .map(|c| btreemap! { id.to_string() => c.clone() })
            .unwrap_or_default())
    }

    async fn register_check(&self, reg: &AgentCheckRegistration) -> MeshResult<()> {
        self.record("register_check", &reg.id)?;
        let check = AgentCheck {
            check_id: reg.id.clone(),
            name: reg.name.clone(),
            status: reg.status.clone(),
            output: String::new(),
            service_id: reg.service_id.clone(),
        };
        self.state.lock().checks.insert(reg.id.clone(), check);
        Ok(())
    }

    async fn update_ttl(
        &self,
        check_id: &str,
        output: &str,
        status: &str,
        _scope: Scope<'_>,
    ) -> MeshResult<()> {
        self.record("update_ttl", format!("{check_id} {status}"))?;
        let mut state = self.state.lock();
        let check = state.checks.get_mut(check_id).ok_or(MeshError::NotFound)?;
        check.status = status.to_string();
        check.output = output.to_string();
        Ok(())
    }

    async fn catalog_register(&self, reg: &CatalogRegistration) -> MeshResult<()> {
        self.record("catalog_register", &reg.service.id)?;
        let service = CatalogService {
            node: reg.node.clone(),
            address: reg.address.clone(),
            datacenter: if reg.datacenter.is_empty() {
                "dc1".to_string()
            } else {
                reg.datacenter.clone()
            },
            service_id: reg.service.id.clone(),
            service_name: reg.service.service.clone(),
            service_address: reg.service.address.clone(),
            service_port: reg.service.port,
            service_enable_tag_override: reg.service.enable_tag_override,
        };
        let mut state = self.state.lock();
        state.catalog.retain(|s| s.service_id != service.service_id);
        state.catalog.push(service);
        Ok(())
    }

    async fn catalog_deregister(&self, dereg: &CatalogDeregistration) -> MeshResult<()> {
        self.record("catalog_deregister", &dereg.service_id)?;
        self.state
            .lock()
            .catalog
            .retain(|s| s.service_id != dereg.service_id);
        Ok(())
    }

    async fn catalog_service(&self, name: &str) -> MeshResult<Vec<CatalogService>> {
        self.record("catalog_service", name)?;
        Ok(self
            .state
            .lock()
            .catalog
            .iter()
            .filter(|s| s.service_name == name)
            .cloned()
            .collect())
    }

    async fn tokens(&self) -> MeshResult<Vec<AclToken>> {
        self.record("tokens", "")?;
        Ok(self.state.lock().tokens.clone())
    }

    async fn delete_token(&self, accessor_id: &str) -> MeshResult<()> {
        self.record("delete_token", accessor_id)?;
        self.state
            .lock()
            .tokens
            .retain(|t| t.accessor_id != accessor_id);
        Ok(())
    }

    async fn create_policy(&self, policy: &AclPolicy) -> MeshResult<AclPolicy> {
        self.record("create_policy", &policy.name)?;
        let mut state = self.state.lock();
        if state.policies.iter().any(|p| p.name == policy.name) {
            return Err(MeshError::Status {
                code: 500,
                body: "Invalid Policy: A Policy with Name already exists".to_string(),
            });
        }
        state.issued += 1;
        let created = AclPolicy {
            id: format!("policy-{}", state.issued),
            ..policy.clone()
        };
        state.policies.push(created.clone());
        Ok(created)
    }

    async fn policies(&self) -> MeshResult<Vec<AclPolicy>> {
        self.record("policies", "")?;
        Ok(self.state.lock().policies.clone())
    }

    async fn delete_policy(&self, id: &str) -> MeshResult<()> {
        self.record("delete_policy", id)?;
        self.state.lock().policies.retain(|p| p.id != id);
        Ok(())
    }

    async fn roles(&self) -> MeshResult<Vec<AclRole>> {
        self.record("roles", "")?;
        Ok(self.state.lock().roles.clone())
    }

    async fn update_role(&self, role: &AclRole) -> MeshResult<AclRole> {
        self.record("update_role", &role.name)?;
        let mut state = self.state.lock();
        let existing = state
            .roles
            .iter_mut()
            .find(|r| r.id == role.id)
            .ok_or(MeshError::NotFound)?;
        *existing = role.clone();
        Ok(role.clone())
    }

    async fn peering(&self, name: &str) -> MeshResult<Option<Peering>> {
        self.record("peering", name)?;
        Ok(self.state.lock().peerings.get(name).map(|name| Peering {
            name: name.clone(),
            state: "PENDING".to_string(),
            ..Default::default()
        }))
    }

    async fn generate_peering_token(&self, peer_name: &str) -> MeshResult<PeeringToken> {
        self.record("generate_peering_token", peer_name)?;
        let mut state = self.state.lock();
        state.peerings.insert(peer_name.to_string());
        state.issued += 1;
        Ok(PeeringToken {
            peering_token: format!("token-{}", state.issued),
        })
    }

    async fn delete_peering(&self, name: &str) -> MeshResult<()> {
        self.record("delete_peering", name)?;
        self.state.lock().peerings.remove(name);
        Ok(())
    }

    async fn proxy_defaults(&self, name: &str) -> MeshResult<Option<ProxyConfigEntry>> {
        self.record("proxy_defaults", name)?;
        Ok(self.state.lock().proxy_defaults.clone())
    }
}

// === fixtures ===

pub fn agent_pod(name: &str, node: &str, ip: &str, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("consul".to_string()),
            labels: Some(btreemap! {
                "component".to_string() => "client".to_string(),
                "app".to_string() => "consul".to_string(),
                "release".to_string() => "consul".to_string(),
            }),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: Some(ip.to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// An injected pod managed by the endpoints controller.
pub fn injected_pod(name: &str, ip: &str, annotations: BTreeMap<String, String>) -> Pod {
    let mut all = btreemap! {
        consul_k8s_core::annotations::INJECT_STATUS.to_string() =>
            consul_k8s_core::annotations::INJECTED.to_string(),
    };
    all.extend(annotations);
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            annotations: Some(all),
            labels: Some(btreemap! {
                consul_k8s_core::annotations::MANAGED_BY.to_string() =>
                    consul_k8s_core::MANAGED_BY_ENDPOINTS_CONTROLLER.to_string(),
            }),
            ..Default::default()
        },
        spec: Some(PodSpec::default()),
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            host_ip: Some("10.1.0.1".to_string()),
            ..Default::default()
        }),
    }
}

/// Endpoints whose addresses each target the pod of the same index in `ready` / `not_ready`.
pub fn endpoints(
    namespace: &str,
    name: &str,
    ready: &[(&str, &str)],
    not_ready: &[(&str, &str)],
) -> Endpoints {
    let address = |(pod, ip): &(&str, &str)| EndpointAddress {
        ip: ip.to_string(),
        node_name: Some("node-a".to_string()),
        target_ref: Some(ObjectReference {
            kind: Some("Pod".to_string()),
            name: Some(pod.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    };
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(ready.iter().map(address).collect()),
            not_ready_addresses: Some(not_ready.iter().map(address).collect()),
            ..Default::default()
        }]),
    }
}
