use crate::{ControllerMetrics, Error, KubeApi, Result};
use consul_k8s_core::catalog::{
    AclLink, AclPolicy, CatalogDeregistration, CatalogRegistration, CatalogRegistrationService,
    CatalogService,
};
use consul_k8s_k8s_api::{
    conditions, has_finalizer, is_deleting, now,
    terminating_gateway::{CatalogRegistrationSpec, ServiceInfoRef},
    Action, ResourceExt, TerminatingGatewayService, FINALIZER,
};
use consul_k8s_mesh::{MeshClient, MeshError};
use std::{sync::Arc, time::Duration};
use tracing::{info, instrument, warn};


const CONTROLLER: &str = "terminating-gateway-service";

/// Roles whose name contains this are granted write access to registered services.
const GATEWAY_ROLE_MARKER: &str = "terminating-gateway";

/// The catalog's view of a resource's service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Marked for deletion, with the instance to remove if one is registered.
    Deleting(Option<CatalogService>),
    Absent,
    Present(CatalogService),
}

pub struct TerminatingGatewayReconciler {
    kube: Arc<dyn KubeApi>,
    mesh: Arc<dyn MeshClient>,
    acls_enabled: bool,
    metrics: ControllerMetrics,
    resync: Duration,
    error_requeue: Duration,
}

pub fn classify(
    service: &TerminatingGatewayService,
    mut instances: Vec<CatalogService>,
) -> Result<State> {
    if instances.len() > 1 {
        return Err(Error::invalid("multiple services found with the same serviceName"));
    }
    let instance = instances.pop();
    if is_deleting(service) {
        return Ok(State::Deleting(instance));
    }
    Ok(instance.map(State::Present).unwrap_or(State::Absent))
}

/// True when the registered instance differs from the spec in a field that requires it to be
/// registered again.
pub fn needs_update(existing: &CatalogService, reg: &CatalogRegistrationSpec) -> bool {
    existing.node != reg.node
        || (!reg.datacenter.is_empty() && existing.datacenter != reg.datacenter)
        || existing.address != reg.address
        || existing.service_address != reg.service.address
        || existing.service_port != reg.service.port
        || existing.service_enable_tag_override != reg.service.enable_tag_override
}

pub fn policy_name(service_name: &str) -> String {
    format!("{service_name}-write-policy")
}

fn policy_rules(service_name: &str) -> String {
    format!("service \"{service_name}\" {{policy = \"write\"}}")
}

fn catalog_registration(reg: &CatalogRegistrationSpec) -> CatalogRegistration {
    let id = if reg.service.id.is_empty() {
        reg.service.service.clone()
    } else {
        reg.service.id.clone()
    };
    CatalogRegistration {
        node: reg.node.clone(),
        address: reg.address.clone(),
        tagged_addresses: reg.tagged_addresses.clone(),
        node_meta: reg.node_meta.clone(),
        datacenter: reg.datacenter.clone(),
        service: CatalogRegistrationService {
            id,
            service: reg.service.service.clone(),
            tags: reg.service.tags.clone(),
            meta: reg.service.meta.clone(),
            port: reg.service.port,
            address: reg.service.address.clone(),
            enable_tag_override: reg.service.enable_tag_override,
        },
        ..Default::default()
    }
}

fn is_already_exists(error: &MeshError) -> bool {
    matches!(error, MeshError::Status { body, .. } if body.contains("already exists"))
}

pub async fn reconcile(
    service: Arc<TerminatingGatewayService>,
    ctx: Arc<TerminatingGatewayReconciler>,
) -> Result<Action> {
    let result = ctx.reconcile_service(&service).await;
    ctx.metrics.record(CONTROLLER, &result);
    result?;
    Ok(Action::requeue(ctx.resync))
}

pub fn error_policy(
    _: Arc<TerminatingGatewayService>,
    error: &Error,
    ctx: Arc<TerminatingGatewayReconciler>,
) -> Action {
    warn!(%error, "Failed to reconcile terminating gateway service");
    Action::requeue(ctx.error_requeue)
}

// === impl TerminatingGatewayReconciler ===

impl TerminatingGatewayReconciler {
    pub fn new(
        kube: Arc<dyn KubeApi>,
        mesh: Arc<dyn MeshClient>,
        acls_enabled: bool,
        metrics: ControllerMetrics,
        resync: Duration,
        error_requeue: Duration,
    ) -> Self {
        Self {
            kube,
            mesh,
            acls_enabled,
            metrics,
            resync,
            error_requeue,
        }
    }

    #[instrument(skip_all, fields(namespace = %service.namespace().unwrap_or_default(), name = %service.name_any()))]
    pub async fn reconcile_service(&self, service: &TerminatingGatewayService) -> Result<()> {
        let namespace = service.namespace().unwrap_or_default();
        let name = service.name_any();

        if is_deleting(service) {
            if !has_finalizer(service) {
                return Ok(());
            }
            return self.finalize(service, &namespace, &name).await;
        }

        match self.sync(service).await {
            Ok(changed) => {
                self.record_synced(service, &namespace, &name, changed)
                    .await?;
                if !has_finalizer(service) {
                    let mut finalizers = service.finalizers().to_vec();
                    finalizers.push(FINALIZER.to_string());
                    self.kube
                        .set_terminating_gateway_service_finalizers(&namespace, &name, finalizers)
                        .await?;
                }
                Ok(())
            }
            Err(error) => {
                self.record_error(service, &namespace, &name, &error).await;
                Err(error)
            }
        }
    }

    /// Registers or refreshes the catalog entry, returning whether the mesh was written to.
    async fn sync(&self, service: &TerminatingGatewayService) -> Result<bool> {
        let reg = service.registration().map_err(Error::invalid)?;
        let instances = self.mesh.catalog_service(&reg.service.service).await?;

        match classify(service, instances)? {
            State::Deleting(_) => Ok(false),
            State::Absent => {
                info!(service = %reg.service.service, node = %reg.node, "Registering external service");
                self.mesh.catalog_register(&catalog_registration(reg)).await?;
                if self.acls_enabled {
                    self.ensure_policy(&reg.service.service).await?;
                }
                Ok(true)
            }
            State::Present(existing) => {
                let mut changed = false;
                if needs_update(&existing, reg) {
                    info!(service = %reg.service.service, "Catalog entry is stale; registering again");
                    self.deregister(&existing).await?;
                    self.mesh.catalog_register(&catalog_registration(reg)).await?;
                    changed = true;
                }
                let has_policy = service
                    .service_info_ref()
                    .is_some_and(|r| !r.policy_name.is_empty());
                if self.acls_enabled && !has_policy {
                    self.ensure_policy(&reg.service.service).await?;
                    changed = true;
                }
                Ok(changed)
            }
        }
    }

    async fn finalize(
        &self,
        service: &TerminatingGatewayService,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        if let Some(reg) = service.spec.registration.as_ref() {
            let instances = self.mesh.catalog_service(&reg.service.service).await?;
            if let State::Deleting(Some(existing)) = classify(service, instances)? {
                info!(service = %existing.service_name, "TerminatingGatewayService deleted; deregistering");
                self.deregister(&existing).await?;
                if self.acls_enabled {
                    self.remove_policy(&existing.service_name).await?;
                }
            }
        }

        let finalizers = service
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        self.kube
            .set_terminating_gateway_service_finalizers(namespace, name, finalizers)
            .await?;
        Ok(())
    }

    async fn deregister(&self, existing: &CatalogService) -> Result<()> {
        let dereg = CatalogDeregistration {
            node: existing.node.clone(),
            datacenter: existing.datacenter.clone(),
            service_id: existing.service_id.clone(),
        };
        self.mesh.catalog_deregister(&dereg).await?;
        Ok(())
    }

    /// Creates the service's write policy, if missing, and links it to the gateway's role.
    async fn ensure_policy(&self, service_name: &str) -> Result<()> {
        let mut role = self
            .mesh
            .roles()
            .await?
            .into_iter()
            .find(|r| r.name.contains(GATEWAY_ROLE_MARKER))
            .ok_or_else(|| Error::invalid("terminating gateway ACL role not found"))?;

        let name = policy_name(service_name);
        let exists = self
            .mesh
            .policies()
            .await?
            .iter()
            .any(|p| p.name.contains(&name));
        if !exists {
            let policy = AclPolicy {
                name: name.clone(),
                rules: policy_rules(service_name),
                ..Default::default()
            };
            match self.mesh.create_policy(&policy).await {
                Ok(created) => info!(policy = %created.name, id = %created.id, "Created write policy"),
                Err(error) if is_already_exists(&error) => {}
                Err(error) => return Err(error.into()),
            }
        }

        let links = role.policies.get_or_insert_with(Vec::new);
        if links.iter().any(|l| l.name.contains(&name)) {
            return Ok(());
        }
        links.push(AclLink {
            name,
            ..Default::default()
        });
        info!(role = %role.name, "Linking write policy to gateway role");
        self.mesh.update_role(&role).await?;
        Ok(())
    }

    /// Deletes the service's write policy and unlinks it from the gateway's role.
    async fn remove_policy(&self, service_name: &str) -> Result<()> {
        let name = policy_name(service_name);

        let policy = self
            .mesh
            .policies()
            .await?
            .into_iter()
            .find(|p| p.name.contains(&name));
        if let Some(policy) = policy {
            info!(policy = %policy.name, "Deleting write policy");
            match self.mesh.delete_policy(&policy.id).await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error.into()),
            }
        }

        let Some(mut role) = self
            .mesh
            .roles()
            .await?
            .into_iter()
            .find(|r| r.name.contains(GATEWAY_ROLE_MARKER))
        else {
            warn!("Terminating gateway ACL role not found; nothing to unlink");
            return Ok(());
        };
        let Some(links) = role.policies.as_mut() else {
            return Ok(());
        };
        let before = links.len();
        links.retain(|l| !l.name.contains(&name));
        if links.len() == before {
            return Ok(());
        }
        match self.mesh.update_role(&role).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Records a successful pass. An unchanged resource that is already synced is left alone so
    /// that status writes do not retrigger reconciliation.
    async fn record_synced(
        &self,
        service: &TerminatingGatewayService,
        namespace: &str,
        name: &str,
        changed: bool,
    ) -> Result<()> {
        let mut status = service.status.clone().unwrap_or_default();
        let service_name = service
            .spec
            .registration
            .as_ref()
            .map(|r| r.service.service.clone())
            .unwrap_or_default();
        let info = ServiceInfoRef {
            policy_name: if self.acls_enabled {
                policy_name(&service_name)
            } else {
                String::new()
            },
            service_name,
        };
        if !changed
            && status.service_info_ref.as_ref() == Some(&info)
            && conditions::is_synced(&status.conditions)
        {
            return Ok(());
        }

        let now = now();
        status.service_info_ref = Some(info);
        conditions::upsert(&mut status.conditions, conditions::synced(now.clone()));
        status.last_synced_time = Some(now);
        self.kube
            .patch_terminating_gateway_service_status(namespace, name, &status)
            .await?;
        Ok(())
    }

    async fn record_error(
        &self,
        service: &TerminatingGatewayService,
        namespace: &str,
        name: &str,
        error: &Error,
    ) {
        let mut status = service.status.clone().unwrap_or_default();
        conditions::upsert(
            &mut status.conditions,
            conditions::not_synced(error.reason(), error, now()),
        );
        if let Err(error) = self
            .kube
            .patch_terminating_gateway_service_status(namespace, name, &status)
            .await
        {
            warn!(%error, "Failed to record reconcile error");
        }
    }
}
