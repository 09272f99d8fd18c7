use crate::k8s::{self, api::apps::v1::Deployment, ObjectMeta, Resource};
use anyhow::{Context, Result};
use k8s_openapi::{
    api::coordination::v1::Lease, apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::api::PostParams;
use kubert::lease::{Claim, ClaimParams, LeaseManager};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info};

const NAME: &str = "consul-k8s-controller-write";

/// Gates the controllers' writes on holding a Lease shared by every controller replica.
pub struct WriteLease {
    claims: watch::Receiver<Arc<Claim>>,
    holder: String,
}

/// The Lease as first written, owned by the controller deployment so it goes away with it.
fn lease(namespace: &str, owner: Option<OwnerReference>) -> Lease {
    let labels = BTreeMap::from([
        ("app".to_string(), "consul".to_string()),
        ("component".to_string(), "connect-injector".to_string()),
    ]);
    Lease {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            owner_references: owner.map(|o| vec![o]),
            ..Default::default()
        },
        spec: None,
    }
}

// === impl WriteLease ===

impl WriteLease {
    /// Ensures the Lease exists and starts contending for it as `holder`.
    pub async fn contend<T>(
        runtime: &kubert::Runtime<T>,
        namespace: &str,
        deployment: &str,
        holder: String,
    ) -> Result<Self> {
        let owner = k8s::Api::<Deployment>::namespaced(runtime.client(), namespace)
            .get(deployment)
            .await
            .with_context(|| format!("failed to get deployment {namespace}/{deployment}"))?
            .controller_owner_ref(&());

        let api = k8s::Api::<Lease>::namespaced(runtime.client(), namespace);
        match api
            .create(&PostParams::default(), &lease(namespace, owner))
            .await
        {
            Ok(_) => info!(%namespace, name = NAME, "Created write Lease"),
            Err(k8s::Error::Api(e)) if e.code == 409 => debug!("Write Lease exists"),
            Err(error) => return Err(error).context("failed to create the write Lease"),
        }

        let params = ClaimParams {
            lease_duration: Duration::from_secs(30),
            renew_grace_period: Duration::from_secs(1),
        };
        let (claims, _task) = LeaseManager::init(api, NAME)
            .await?
            .spawn(&holder, params)
            .await?;
        Ok(Self { claims, holder })
    }

    /// Completes once this replica holds the Lease.
    pub async fn acquired(mut self) -> Result<()> {
        while !self.claims.borrow_and_update().is_current_for(self.holder.as_str()) {
            debug!(holder = %self.holder, "Waiting for the write Lease");
            self.claims
                .changed()
                .await
                .context("lease manager terminated")?;
        }
        Ok(())
    }
}
