//! Traffic-redirection configuration consumed by the CNI plugin.

use crate::{
    annotations::{self, InvalidBool},
    catalog::AgentService,
    metrics::MetricsConfig,
    probes,
};
use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use serde::{Deserialize, Serialize};
use std::{net::IpAddr, num::NonZeroU16};

/// The UID the sidecar proxy runs as. Its traffic is never redirected.
pub const PROXY_UID: u32 = 5995;

/// The UID of the init and copy containers.
pub const INIT_CONTAINER_UID: u32 = 5996;

pub const DEFAULT_INBOUND_PORT: u16 = 20000;
pub const DEFAULT_OUTBOUND_PORT: u16 = 15001;

const BIND_PORT: &str = "bind_port";
const STATS_BIND_ADDR: &str = "envoy_stats_bind_addr";

/// Declarative description of a pod's traffic redirection rules.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IptablesConfig {
    /// A nonzero DNS address enables redirection of DNS traffic to the mesh DNS service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consul_dns_ip: Option<String>,
    pub proxy_uid: String,
    pub proxy_inbound_port: u16,
    pub proxy_outbound_port: u16,
    #[serde(default)]
    pub exclude_inbound_ports: Vec<String>,
    #[serde(default)]
    pub exclude_outbound_ports: Vec<String>,
    #[serde(default)]
    pub exclude_outbound_cidrs: Vec<String>,
    #[serde(default)]
    pub exclude_uids: Vec<String>,
    /// The pod's network namespace path, filled in by the CNI plugin.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub netns: String,
}

/// Derives an `IptablesConfig` from a pod and controller-wide defaults.
#[derive(Clone, Debug, Default)]
pub struct IptablesConfigBuilder {
    pub metrics: MetricsConfig,
    pub enable_transparent_proxy: bool,
    pub overwrite_probes: bool,
    pub enable_consul_dns: bool,
    /// The Helm release prefix, from which the DNS service's env variable is derived.
    pub resource_prefix: String,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Annotation(#[from] InvalidBool),

    #[error("invalid prometheus scrape port: {0}")]
    ScrapePort(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("environment variable {0} not found")]
    MissingDnsEnv(String),

    #[error("failed parsing host and port from {STATS_BIND_ADDR}: {0}")]
    StatsBindAddr(String),

    #[error("failed parsing {BIND_PORT}: {0}")]
    BindPort(String),

    #[error("invalid port {0:?}")]
    InvalidPort(String),

    #[error("invalid CIDR {0:?}")]
    InvalidCidr(String),

    #[error("invalid UID {0:?}")]
    InvalidUid(String),
}

/// The env variable holding the mesh DNS service's cluster IP for a release prefix.
pub fn dns_env_name(resource_prefix: &str) -> String {
    let prefix = resource_prefix
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!("{prefix}_DNS_SERVICE_HOST")
}

// === impl IptablesConfigBuilder ===

impl IptablesConfigBuilder {
    /// Builds the configuration written to the pod at admission time.
    pub fn build(
        &self,
        pod: &Pod,
        namespace: Option<&Namespace>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<IptablesConfig, Error> {
        let mut config = IptablesConfig {
            proxy_uid: PROXY_UID.to_string(),
            proxy_inbound_port: DEFAULT_INBOUND_PORT,
            proxy_outbound_port: DEFAULT_OUTBOUND_PORT,
            ..Default::default()
        };

        if self.metrics.enable_metrics(pod)? {
            let port = self
                .metrics
                .prometheus_scrape_port(pod)
                .map_err(|e| Error::ScrapePort(e.into()))?;
            if let Some(port) = port {
                config.exclude_inbound_ports.push(port.to_string());
            }
        }

        let tproxy =
            annotations::transparent_proxy_enabled(pod, namespace, self.enable_transparent_proxy)?;
        if tproxy && annotations::overwrite_probes(pod, self.overwrite_probes)? {
            config
                .exclude_inbound_ports
                .extend(probes::listener_ports(pod).into_iter().map(|p| p.to_string()));
        }

        config.exclude_inbound_ports.extend(annotations::comma_separated(
            pod,
            annotations::TPROXY_EXCLUDE_INBOUND_PORTS,
        ));
        config.exclude_outbound_ports = annotations::comma_separated(
            pod,
            annotations::TPROXY_EXCLUDE_OUTBOUND_PORTS,
        );
        config.exclude_outbound_cidrs = annotations::comma_separated(
            pod,
            annotations::TPROXY_EXCLUDE_OUTBOUND_CIDRS,
        );
        config.exclude_uids = annotations::comma_separated(pod, annotations::TPROXY_EXCLUDE_UIDS);
        config.exclude_uids.push(INIT_CONTAINER_UID.to_string());

        if annotations::consul_dns_enabled(pod, namespace, self.enable_consul_dns)? {
            let name = dns_env_name(&self.resource_prefix);
            let ip = env(&name).filter(|ip| !ip.is_empty());
            config.consul_dns_ip = Some(ip.ok_or(Error::MissingDnsEnv(name))?);
        }

        Ok(config)
    }

    /// Builds the configuration and refines it with a known proxy registration.
    ///
    /// Equal to [`IptablesConfig::refine_from_proxy`] applied to [`Self::build`]'s output.
    pub fn build_with_proxy(
        &self,
        pod: &Pod,
        namespace: Option<&Namespace>,
        proxy: &AgentService,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<IptablesConfig, Error> {
        let mut config = self.build(pod, namespace, env)?;
        config.refine_from_proxy(proxy)?;
        Ok(config)
    }
}

// === impl IptablesConfig ===

impl IptablesConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Checks that every exclusion is well-formed before rules are rendered from it.
    pub fn validate(&self) -> Result<(), Error> {
        for port in self
            .exclude_inbound_ports
            .iter()
            .chain(&self.exclude_outbound_ports)
        {
            port.trim()
                .parse::<NonZeroU16>()
                .map_err(|_| Error::InvalidPort(port.clone()))?;
        }
        for cidr in &self.exclude_outbound_cidrs {
            let cidr = cidr.trim();
            if cidr.parse::<IpNet>().is_err() && cidr.parse::<IpAddr>().is_err() {
                return Err(Error::InvalidCidr(cidr.to_string()));
            }
        }
        for uid in self.exclude_uids.iter().chain(std::iter::once(&self.proxy_uid)) {
            uid.trim()
                .parse::<u32>()
                .map_err(|_| Error::InvalidUid(uid.clone()))?;
        }
        Ok(())
    }

    /// Refines an admission-time configuration with the proxy's registration.
    ///
    /// The inbound port is the proxy's `bind_port`, else its registered port. The stats
    /// listener and expose-path ports are appended to the excluded inbound ports unless
    /// already excluded, so refining twice changes nothing.
    pub fn refine_from_proxy(&mut self, svc: &AgentService) -> Result<(), Error> {
        let Some(proxy) = svc.proxy.as_ref() else {
            return Ok(());
        };

        let bind_port = proxy
            .config
            .get(BIND_PORT)
            .map(weak_port)
            .transpose()?
            .filter(|p| *p != 0);
        if let Some(port) = bind_port.or(Some(svc.port).filter(|p| *p != 0)) {
            self.proxy_inbound_port = port;
        }
        if let Some(port) = proxy
            .transparent_proxy
            .as_ref()
            .map(|t| t.outbound_listener_port)
            .filter(|p| *p != 0)
        {
            self.proxy_outbound_port = port;
        }

        let stats = proxy
            .config
            .get(STATS_BIND_ADDR)
            .and_then(|v| v.as_str())
            .filter(|addr| !addr.is_empty())
            .map(|addr| {
                addr.parse::<std::net::SocketAddr>()
                    .map(|a| a.port())
                    .map_err(|_| Error::StatsBindAddr(addr.to_string()))
            })
            .transpose()?;
        let exposed = proxy.expose.paths.iter().map(|p| p.listener_port);
        for port in stats.into_iter().chain(exposed) {
            let port = port.to_string();
            if !self.exclude_inbound_ports.contains(&port) {
                self.exclude_inbound_ports.push(port);
            }
        }
        Ok(())
    }
}

/// Reads a port from opaque proxy config, which may carry it as a number or a string.
fn weak_port(value: &serde_json::Value) -> Result<u16, Error> {
    let invalid = || Error::BindPort(value.to_string());
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(invalid),
        serde_json::Value::String(s) if s.is_empty() => Ok(0),
        serde_json::Value::String(s) => s.parse().map_err(|_| invalid()),
        serde_json::Value::Null => Ok(0),
        _ => Err(invalid()),
    }
}
