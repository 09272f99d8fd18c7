#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod conditions;
pub mod peering;
pub mod terminating_gateway;

pub use self::{
    peering::{PeeringAcceptor, PeeringAcceptorSpec, PeeringAcceptorStatus},
    terminating_gateway::{
        TerminatingGatewayService, TerminatingGatewayServiceSpec, TerminatingGatewayServiceStatus,
    },
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Endpoints, Namespace, Pod, PodSpec, PodStatus, Secret, Service, ServiceSpec,
        },
    },
    apimachinery::pkg::apis::meta::v1::{Condition, OwnerReference, Time},
    ByteString,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    runtime::controller::Action,
    Client, Error, Resource,
};

/// The API group of every custom resource served by the control plane.
pub const GROUP: &str = "consul.hashicorp.com";

/// Finalizer placed on custom resources whose mesh-side state must be torn down on deletion.
pub const FINALIZER: &str = "finalizers.consul.hashicorp.com";

/// Returns the current time as a Kubernetes timestamp.
pub fn now() -> Time {
    Time(k8s_openapi::chrono::Utc::now())
}

/// True when `obj` is being deleted.
pub fn is_deleting<T: Resource>(obj: &T) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

/// True when `obj` carries the control plane's finalizer.
pub fn has_finalizer<T: Resource>(obj: &T) -> bool {
    obj.meta()
        .finalizers
        .iter()
        .flatten()
        .any(|f| f == FINALIZER)
}
