//! Generates peering tokens for `PeeringAcceptor` resources and keeps them stored in the secret
//! the resource names.

use crate::{ControllerMetrics, Error, KubeApi, Result};
use consul_k8s_k8s_api::{
    conditions, has_finalizer, is_deleting, now,
    peering::{ReconcileError, SecretStatus, BACKEND_KUBERNETES},
    Action, ObjectMeta, PeeringAcceptor, PeeringAcceptorStatus, Resource, ResourceExt, Secret,
    FINALIZER,
};
use consul_k8s_mesh::MeshClient;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, instrument, warn};

const CONTROLLER: &str = "peering-acceptor";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PeeringError {
    #[error("PeeringAcceptor backend cannot be changed")]
    BackendChanged,

    #[error("PeeringAcceptor backend {0:?} is not supported; only \"kubernetes\" is")]
    UnsupportedBackend(String),
}

/// What a pass has to do for an acceptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State {
    /// Marked for deletion.
    Deleting,
    /// The mesh has no peering under the acceptor's name.
    NoPeering,
    Exists(Drift),
}

/// How the stored token has drifted from the acceptor's spec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Drift {
    /// No token has been recorded yet.
    NoStatus,
    /// The secret was renamed; `old` must be removed once the new one is written.
    NameChanged { old: String },
    KeyChanged,
    BackendChanged,
    /// The secret is missing or was modified since it was written.
    VersionMismatch,
    InSync,
}

pub struct PeeringReconciler {
    kube: Arc<dyn KubeApi>,
    mesh: Arc<dyn MeshClient>,
    metrics: ControllerMetrics,
    resync: Duration,
    error_requeue: Duration,
}

/// Classifies `acceptor` given whether the mesh knows its peering and the resource version of
/// the secret its spec names, if that secret exists.
pub fn classify(
    acceptor: &PeeringAcceptor,
    peering_exists: bool,
    secret_version: Option<&str>,
) -> State {
    if is_deleting(acceptor) {
        return State::Deleting;
    }
    if !peering_exists {
        return State::NoPeering;
    }

    let Some(recorded) = acceptor.status_secret() else {
        return State::Exists(Drift::NoStatus);
    };
    let desired = acceptor.secret_ref();
    let drift = if recorded.name != desired.name {
        Drift::NameChanged {
            old: recorded.name.clone(),
        }
    } else if recorded.key != desired.key {
        Drift::KeyChanged
    } else if recorded.backend != desired.backend {
        Drift::BackendChanged
    } else if secret_version.is_none() || recorded.resource_version.as_deref() != secret_version {
        Drift::VersionMismatch
    } else {
        Drift::InSync
    };
    State::Exists(drift)
}

pub async fn reconcile(
    acceptor: Arc<PeeringAcceptor>,
    ctx: Arc<PeeringReconciler>,
) -> Result<Action> {
    let result = ctx.reconcile_acceptor(&acceptor).await;
    ctx.metrics.record(CONTROLLER, &result);
    result?;
    Ok(Action::requeue(ctx.resync))
}

pub fn error_policy(
    _: Arc<PeeringAcceptor>,
    error: &Error,
    ctx: Arc<PeeringReconciler>,
) -> Action {
    warn!(%error, "Failed to reconcile peering acceptor");
    Action::requeue(ctx.error_requeue)
}

impl From<PeeringError> for Error {
    fn from(error: PeeringError) -> Self {
        Self::invalid(error)
    }
}

// === impl PeeringReconciler ===

impl PeeringReconciler {
    pub fn new(
        kube: Arc<dyn KubeApi>,
        mesh: Arc<dyn MeshClient>,
        metrics: ControllerMetrics,
        resync: Duration,
        error_requeue: Duration,
    ) -> Self {
        Self {
            kube,
            mesh,
            metrics,
            resync,
            error_requeue,
        }
    }

    #[instrument(skip_all, fields(namespace = %acceptor.namespace().unwrap_or_default(), name = %acceptor.name_any()))]
    pub async fn reconcile_acceptor(&self, acceptor: &PeeringAcceptor) -> Result<()> {
        let namespace = acceptor.namespace().unwrap_or_default();
        let name = acceptor.name_any();

        if is_deleting(acceptor) {
            return self.finalize(acceptor, &namespace, &name).await;
        }
        if !has_finalizer(acceptor) {
            let mut finalizers = acceptor.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            self.kube
                .set_peering_acceptor_finalizers(&namespace, &name, finalizers)
                .await?;
        }

        match self.sync(acceptor, &namespace, &name).await {
            Ok(Some(secret)) => {
                let mut status = acceptor.status.clone().unwrap_or_default();
                status.secret = Some(secret);
                status.reconcile_error = Some(ReconcileError {
                    error: Some(false),
                    message: Some(String::new()),
                });
                let now = now();
                conditions::upsert(&mut status.conditions, conditions::synced(now.clone()));
                status.last_synced_time = Some(now);
                self.kube
                    .patch_peering_acceptor_status(&namespace, &name, &status)
                    .await?;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(error) => {
                self.record_error(acceptor, &namespace, &name, &error).await;
                Err(error)
            }
        }
    }

    /// Brings the token in line with the spec, returning the secret to record in status when a
    /// new token was issued.
    async fn sync(
        &self,
        acceptor: &PeeringAcceptor,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SecretStatus>> {
        let desired = acceptor.secret_ref();
        let existing = self.kube.secret(namespace, &desired.name).await?;
        let peering = self.mesh.peering(name).await?;
        let state = classify(
            acceptor,
            peering.is_some(),
            existing
                .as_ref()
                .and_then(|s| s.metadata.resource_version.as_deref()),
        );
        debug!(?state);

        match state {
            State::Deleting => Ok(None),
            State::NoPeering => {
                info!("Peering does not exist; generating a token");
                if let Some(stale) = acceptor.status_secret() {
                    info!(secret = %stale.name, "Deleting stale secret");
                    self.kube.delete_secret(namespace, &stale.name).await?;
                }
                self.issue(acceptor, namespace, name).await.map(Some)
            }
            State::Exists(Drift::BackendChanged) => Err(PeeringError::BackendChanged.into()),
            State::Exists(Drift::InSync) => Ok(None),
            State::Exists(Drift::NameChanged { old }) => {
                info!(%old, new = %desired.name, "Secret renamed; generating a token");
                let secret = self.issue(acceptor, namespace, name).await?;
                self.kube.delete_secret(namespace, &old).await?;
                Ok(Some(secret))
            }
            State::Exists(drift) => {
                info!(?drift, "Generating a token for the existing peering");
                self.issue(acceptor, namespace, name).await.map(Some)
            }
        }
    }

    /// Generates a token and stores it in the secret the spec names.
    async fn issue(
        &self,
        acceptor: &PeeringAcceptor,
        namespace: &str,
        name: &str,
    ) -> Result<SecretStatus> {
        let desired = acceptor.secret_ref();
        if desired.backend != BACKEND_KUBERNETES {
            return Err(PeeringError::UnsupportedBackend(desired.backend.clone()).into());
        }

        let token = self.mesh.generate_peering_token(name).await?;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(desired.name.clone()),
                namespace: Some(namespace.to_string()),
                owner_references: acceptor.controller_owner_ref(&()).map(|o| vec![o]),
                ..Default::default()
            },
            string_data: Some(
                [(desired.key.clone(), token.peering_token)]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };

        // The secret's contents are replaced in full so that repeated writes converge.
        let written = match self.kube.secret(namespace, &desired.name).await? {
            Some(_) => {
                self.kube
                    .replace_secret(namespace, &desired.name, &secret)
                    .await?
            }
            None => self.kube.create_secret(namespace, &secret).await?,
        };
        Ok(SecretStatus::from_ref(
            desired,
            written.metadata.resource_version,
        ))
    }

    async fn finalize(&self, acceptor: &PeeringAcceptor, namespace: &str, name: &str) -> Result<()> {
        if !has_finalizer(acceptor) {
            return Ok(());
        }
        info!("PeeringAcceptor deleted; deleting peering");
        match self.mesh.delete_peering(name).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error.into()),
        }
        if let Some(secret) = acceptor
            .status_secret()
            .filter(|s| s.backend == BACKEND_KUBERNETES)
        {
            self.kube.delete_secret(namespace, &secret.name).await?;
        }

        let finalizers = acceptor
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        self.kube
            .set_peering_acceptor_finalizers(namespace, name, finalizers)
            .await?;
        Ok(())
    }

    async fn record_error(
        &self,
        acceptor: &PeeringAcceptor,
        namespace: &str,
        name: &str,
        error: &Error,
    ) {
        let mut status: PeeringAcceptorStatus = acceptor.status.clone().unwrap_or_default();
        status.reconcile_error = Some(ReconcileError {
            error: Some(true),
            message: Some(error.to_string()),
        });
        conditions::upsert(
            &mut status.conditions,
            conditions::not_synced(error.reason(), error, now()),
        );
        if let Err(error) = self
            .kube
            .patch_peering_acceptor_status(namespace, name, &status)
            .await
        {
            warn!(%error, "Failed to record reconcile error");
        }
    }
}
