//! Plugin inputs: the network configuration on stdin and the `CNI_*` environment.

use crate::Error;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;

/// The version reported for results the plugin synthesizes.
pub const PLACEHOLDER_CNI_VERSION: &str = "0.3.1";

pub const SUPPORTED_VERSIONS: [&str; 5] = ["0.3.0", "0.3.1", "0.4.0", "1.0.0", "1.1.0"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Add,
    Del,
    Check,
    Version,
}

/// The network configuration passed on stdin.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NetConf {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_: String,
    /// The result of the previous plugin in the chain, passed through untouched.
    #[serde(rename = "prevResult", default)]
    pub prev_result: Option<Value>,
    #[serde(default)]
    pub cni_bin_dir: String,
    #[serde(default)]
    pub cni_net_dir: String,
    /// Kubeconfig file name, relative to `cni_net_dir`.
    #[serde(default)]
    pub kubeconfig: String,
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub multus: bool,
}

/// The `CNI_ARGS` keys the plugin understands. Other keys are ignored.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CniArgs {
    pub pod_name: String,
    pub pod_namespace: String,
    pub infra_container_id: String,
    pub ip: String,
    /// A pre-built redirection config from a non-Kubernetes orchestrator.
    pub iptables_config: String,
}

/// Everything known about one invocation.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub command: Command,
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: CniArgs,
    pub conf: NetConf,
}

// === impl Command ===

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "CHECK" => Ok(Self::Check),
            "VERSION" => Ok(Self::Version),
            _ => Err(Error::Command(s.to_string())),
        }
    }
}

// === impl NetConf ===

impl NetConf {
    pub fn parse(stdin: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(stdin).map_err(Error::Config)
    }

    /// The version results and errors are reported with.
    pub fn version(&self) -> &str {
        if self.cni_version.is_empty() {
            PLACEHOLDER_CNI_VERSION
        } else {
            &self.cni_version
        }
    }

    /// The result to print once the plugin is done.
    ///
    /// Unchained invocations (e.g. under multus) get a placeholder result. A chained result must
    /// carry at least one container IP.
    pub fn result(&self) -> Result<Value, Error> {
        let Some(prev) = self.prev_result.as_ref() else {
            return Ok(serde_json::json!({ "cniVersion": PLACEHOLDER_CNI_VERSION }));
        };
        let ips = match prev.get("ips") {
            None | Some(Value::Null) => 0,
            Some(Value::Array(ips)) => ips.len(),
            Some(other) => {
                return Err(Error::PrevResult(serde::de::Error::custom(format!(
                    "ips must be a list, got {other}"
                ))))
            }
        };
        if ips == 0 {
            return Err(Error::NoContainerIps);
        }
        Ok(prev.clone())
    }
}

// === impl CniArgs ===

impl FromStr for CniArgs {
    type Err = Error;

    /// Parses `KEY=VALUE` pairs separated by `;`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut args = Self::default();
        for pair in s.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Args(pair.to_string()))?;
            let slot = match key {
                "K8S_POD_NAME" => &mut args.pod_name,
                "K8S_POD_NAMESPACE" => &mut args.pod_namespace,
                "K8S_POD_INFRA_CONTAINER_ID" => &mut args.infra_container_id,
                "IP" => &mut args.ip,
                "CONSUL_IPTABLES_CONFIG" => &mut args.iptables_config,
                _ => continue,
            };
            *slot = value.to_string();
        }
        Ok(args)
    }
}

impl CniArgs {
    /// True when the pod's identity is known or its config was passed inline.
    pub fn has_pod_identity(&self) -> bool {
        (!self.pod_name.is_empty() && !self.pod_namespace.is_empty())
            || !self.iptables_config.is_empty()
    }
}
