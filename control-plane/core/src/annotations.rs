//! Typed access to the well-known pod annotations and namespace labels.
//!
//! Every per-feature toggle resolves with the same precedence: a pod annotation overrides a
//! namespace label, which overrides the controller-wide default.

use k8s_openapi::api::core::v1::{Namespace, Pod};
use std::collections::BTreeMap;

pub const INJECT_STATUS: &str = "consul.hashicorp.com/connect-inject-status";
pub const INJECTED: &str = "injected";

/// Label placed on pods whose registrations are owned by the endpoints controller.
pub const MANAGED_BY: &str = "consul.hashicorp.com/connect-inject-managed-by";

pub const SERVICE: &str = "consul.hashicorp.com/connect-service";
pub const KUBERNETES_SERVICE: &str = "consul.hashicorp.com/kubernetes-service";
pub const SERVICE_PORT: &str = "consul.hashicorp.com/connect-service-port";
pub const UPSTREAMS: &str = "consul.hashicorp.com/connect-service-upstreams";
pub const TAGS: &str = "consul.hashicorp.com/service-tags";
pub const CONNECT_TAGS: &str = "consul.hashicorp.com/connect-service-tags";
pub const META_PREFIX: &str = "consul.hashicorp.com/service-meta-";

pub const ENABLE_METRICS: &str = "consul.hashicorp.com/enable-metrics";
pub const ENABLE_METRICS_MERGING: &str = "consul.hashicorp.com/enable-metrics-merging";
pub const MERGED_METRICS_PORT: &str = "consul.hashicorp.com/merged-metrics-port";
pub const PROMETHEUS_SCRAPE_PORT: &str = "consul.hashicorp.com/prometheus-scrape-port";
pub const PROMETHEUS_SCRAPE_PATH: &str = "consul.hashicorp.com/prometheus-scrape-path";
pub const SERVICE_METRICS_PORT: &str = "consul.hashicorp.com/service-metrics-port";

pub const TRANSPARENT_PROXY: &str = "consul.hashicorp.com/transparent-proxy";
pub const TPROXY_OVERWRITE_PROBES: &str = "consul.hashicorp.com/transparent-proxy-overwrite-probes";
pub const TPROXY_EXCLUDE_INBOUND_PORTS: &str =
    "consul.hashicorp.com/transparent-proxy-exclude-inbound-ports";
pub const TPROXY_EXCLUDE_OUTBOUND_PORTS: &str =
    "consul.hashicorp.com/transparent-proxy-exclude-outbound-ports";
pub const TPROXY_EXCLUDE_OUTBOUND_CIDRS: &str =
    "consul.hashicorp.com/transparent-proxy-exclude-outbound-cidrs";
pub const TPROXY_EXCLUDE_UIDS: &str = "consul.hashicorp.com/transparent-proxy-exclude-uids";
pub const CONSUL_DNS: &str = "consul.hashicorp.com/consul-dns";

/// Pre-mutation pod spec stashed by the injector for probe rewriting.
pub const ORIGINAL_POD: &str = "consul.hashicorp.com/original-pod";

/// Serialized `IptablesConfig` consumed by the CNI plugin.
pub const REDIRECT_TRAFFIC_CONFIG: &str = "consul.hashicorp.com/redirect-traffic-config";

/// Progress of traffic redirection: `enabled` at admission, then `waiting` and `complete` as
/// the CNI plugin runs.
pub const TPROXY_STATUS: &str = "consul.hashicorp.com/transparent-proxy-status";
pub const TPROXY_STATUS_ENABLED: &str = "enabled";
pub const TPROXY_STATUS_WAITING: &str = "waiting";
pub const TPROXY_STATUS_COMPLETE: &str = "complete";

/// Endpoints label that forces deregistration of a service.
pub const SERVICE_IGNORE: &str = "consul.hashicorp.com/service-ignore";

const POD_NAME_INTERPOLATION: &str = "$POD_NAME";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{key} annotation value of {value} was invalid: expected a boolean")]
pub struct InvalidBool {
    pub key: String,
    pub value: String,
}

pub fn pod_annotation<'p>(pod: &'p Pod, key: &str) -> Option<&'p str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

fn pod_annotations(pod: &Pod) -> impl Iterator<Item = (&String, &String)> {
    pod.metadata.annotations.iter().flat_map(|a| a.iter())
}

/// Parses booleans with the same leniency as the injector (`1`, `t`, `TRUE`, `False`, ...).
pub fn parse_bool(key: &str, value: &str) -> Result<bool, InvalidBool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Resolves a boolean toggle from the pod annotation, then the namespace label, then `default`.
fn resolve_toggle(
    key: &str,
    pod: &Pod,
    namespace: Option<&Namespace>,
    default: bool,
) -> Result<bool, InvalidBool> {
    if let Some(raw) = pod_annotation(pod, key) {
        return parse_bool(key, raw);
    }
    let label = namespace
        .and_then(|ns| ns.metadata.labels.as_ref())
        .and_then(|labels| labels.get(key));
    if let Some(raw) = label {
        return parse_bool(key, raw);
    }
    Ok(default)
}

pub fn transparent_proxy_enabled(
    pod: &Pod,
    namespace: Option<&Namespace>,
    default: bool,
) -> Result<bool, InvalidBool> {
    resolve_toggle(TRANSPARENT_PROXY, pod, namespace, default)
}

pub fn consul_dns_enabled(
    pod: &Pod,
    namespace: Option<&Namespace>,
    default: bool,
) -> Result<bool, InvalidBool> {
    resolve_toggle(CONSUL_DNS, pod, namespace, default)
}

/// Probe overwriting has no namespace-level override.
pub fn overwrite_probes(pod: &Pod, default: bool) -> Result<bool, InvalidBool> {
    resolve_toggle(TPROXY_OVERWRITE_PROBES, pod, None, default)
}

pub fn has_been_injected(pod: &Pod) -> bool {
    pod_annotation(pod, INJECT_STATUS) == Some(INJECTED)
}

/// True when the pod was admitted for traffic redirection, i.e. it carries both a non-empty
/// injection status and a non-empty transparent proxy status.
pub fn traffic_redirection_requested(pod: &Pod) -> bool {
    let present = |key| pod_annotation(pod, key).is_some_and(|v| !v.is_empty());
    present(INJECT_STATUS) && present(TPROXY_STATUS)
}

pub fn is_managed_by_endpoints_controller(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_BY))
        .map(String::as_str)
        == Some(crate::MANAGED_BY_ENDPOINTS_CONTROLLER)
}

/// True only when the ignore label is present and parses as `true`.
pub fn is_labeled_ignore(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels
        .and_then(|l| l.get(SERVICE_IGNORE))
        .and_then(|v| parse_bool(SERVICE_IGNORE, v).ok())
        .unwrap_or(false)
}

/// Splits a comma-separated annotation verbatim. An absent annotation yields no items.
pub fn comma_separated(pod: &Pod, key: &str) -> Vec<String> {
    pod_annotation(pod, key)
        .map(|raw| raw.split(',').map(ToString::to_string).collect())
        .unwrap_or_default()
}

/// The mesh service name for `pod` behind the Endpoints object `endpoints_name`.
///
/// A single-valued service annotation overrides the Endpoints name; multi-port pods list
/// several names and always register under the Endpoints name.
pub fn service_name(pod: &Pod, endpoints_name: &str) -> String {
    match pod_annotation(pod, SERVICE) {
        Some(name) if !name.is_empty() && !name.contains(',') => name.to_string(),
        _ => endpoints_name.to_string(),
    }
}

/// The ordinal of this service within a multi-port pod's service annotation.
pub fn multi_port_index(pod: &Pod, endpoints_name: &str) -> Option<usize> {
    let name = service_name(pod, endpoints_name);
    pod_annotation(pod, SERVICE)
        .unwrap_or_default()
        .split(',')
        .position(|n| n == name)
}

/// Tags from the service and connect tag annotations, with `$POD_NAME` interpolated.
pub fn service_tags(pod: &Pod) -> Vec<String> {
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    [TAGS, CONNECT_TAGS]
        .into_iter()
        .filter_map(|key| pod_annotation(pod, key).filter(|raw| !raw.is_empty()))
        .flat_map(|raw| raw.split(','))
        .map(|tag| {
            if tag == POD_NAME_INTERPOLATION {
                pod_name.to_string()
            } else {
                tag.to_string()
            }
        })
        .collect()
}

/// User metadata from `service-meta-<key>` annotations, with `$POD_NAME` interpolated.
pub fn service_meta(pod: &Pod) -> BTreeMap<String, String> {
    let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
    pod_annotations(pod)
        .filter_map(|(k, v)| {
            let key = k.strip_prefix(META_PREFIX).filter(|key| !key.is_empty())?;
            let value = if v == POD_NAME_INTERPOLATION {
                pod_name.to_string()
            } else {
                v.clone()
            };
            Some((key.to_string(), value))
        })
        .collect()
}
