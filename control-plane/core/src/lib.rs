#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod annotations;
pub mod catalog;
pub mod iptables;
pub mod metrics;
pub mod namespaces;
pub mod ports;
pub mod probes;
pub mod token;
pub mod upstreams;

pub use self::{
    iptables::{IptablesConfig, IptablesConfigBuilder},
    namespaces::{MeshNamespaces, NamespaceFilter},
};

/// Value of the `managed-by` metadata and label written on everything the endpoints controller
/// registers.
pub const MANAGED_BY_ENDPOINTS_CONTROLLER: &str = "consul-k8s-endpoints-controller";
