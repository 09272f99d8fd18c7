//! Parsing of the `connect-service-upstreams` annotation.
//!
//! Three forms are accepted, comma-separated:
//!
//! - `name[.namespace[.partition]]:port[:datacenter]`
//! - `name.svc[.namespace.ns[.X.{peer|ap|dc}]]:port`
//! - `prepared_query:query-name:port`

use crate::{
    annotations,
    catalog::{
        Upstream, MESH_GATEWAY_MODE_LOCAL, MESH_GATEWAY_MODE_REMOTE, UPSTREAM_DEST_PREPARED_QUERY,
        UPSTREAM_DEST_SERVICE,
    },
    ports,
};
use k8s_openapi::api::core::v1::Pod;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream structured incorrectly: {0}")]
    Structure(String),

    #[error("upstream {0:?} is invalid: there is no ProxyDefaults config to set mesh gateway mode")]
    NoProxyDefaults(String),

    #[error(
        "upstream {0:?} is invalid: ProxyDefaults mesh gateway mode is neither \"local\" nor \"remote\""
    )]
    MeshGatewayMode(String),
}

/// A parsed upstream, plus whether its datacenter requires a mesh gateway.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedUpstream {
    pub raw: String,
    pub upstream: Upstream,
    /// Set for datacenter-qualified unlabeled upstreams, which route through mesh gateways.
    pub requires_mesh_gateway: bool,
}

/// The outcome of looking up the global proxy-defaults entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProxyDefaultsLookup<'a> {
    Found { mesh_gateway_mode: &'a str },
    NotFound,
    /// The lookup failed for another reason, e.g. the mesh was unreachable.
    Unavailable,
}

/// Parses the pod's upstreams annotation. `namespaced` is set when mesh namespaces or
/// partitions are enabled.
pub fn parse(pod: &Pod, namespaced: bool) -> Result<Vec<ParsedUpstream>, UpstreamError> {
    let Some(raw) = annotations::pod_annotation(pod, annotations::UPSTREAMS).filter(|r| !r.is_empty())
    else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(|raw| parse_one(pod, raw, namespaced))
        .collect()
}

fn parse_one(pod: &Pod, raw: &str, namespaced: bool) -> Result<ParsedUpstream, UpstreamError> {
    let parts = raw.splitn(3, ':').collect::<Vec<_>>();
    let service = parts[0];
    let labeled = service.split('.').nth(1) == Some("svc");

    if service.trim() == "prepared_query" {
        return prepared_query(pod, raw, &parts);
    }
    let port = port(pod, raw, &parts)?;
    if labeled {
        labeled_upstream(raw, service, port, namespaced)
    } else {
        unlabeled_upstream(raw, &parts, port, namespaced)
    }
}

fn port(pod: &Pod, raw: &str, parts: &[&str]) -> Result<i32, UpstreamError> {
    let Some(port) = parts.get(1) else {
        return Err(UpstreamError::Structure(raw.to_string()));
    };
    Ok(ports::port_value(pod, port.trim()).unwrap_or_default())
}

fn service_upstream(port: i32, upstream: Upstream) -> Upstream {
    match u16::try_from(port) {
        Ok(local_bind_port) if local_bind_port > 0 => Upstream {
            destination_type: UPSTREAM_DEST_SERVICE.to_string(),
            local_bind_port,
            ..upstream
        },
        _ => Upstream::default(),
    }
}

fn prepared_query(pod: &Pod, raw: &str, parts: &[&str]) -> Result<ParsedUpstream, UpstreamError> {
    let (Some(name), Some(port)) = (parts.get(1), parts.get(2)) else {
        return Err(UpstreamError::Structure(raw.to_string()));
    };
    let port = ports::port_value(pod, port.trim()).unwrap_or_default();
    let upstream = match u16::try_from(port) {
        Ok(local_bind_port) if local_bind_port > 0 => Upstream {
            destination_type: UPSTREAM_DEST_PREPARED_QUERY.to_string(),
            destination_name: name.trim().to_string(),
            local_bind_port,
            ..Default::default()
        },
        _ => Upstream::default(),
    };
    Ok(ParsedUpstream {
        raw: raw.to_string(),
        upstream,
        requires_mesh_gateway: false,
    })
}

fn unlabeled_upstream(
    raw: &str,
    parts: &[&str],
    port: i32,
    namespaced: bool,
) -> Result<ParsedUpstream, UpstreamError> {
    let mut upstream = Upstream::default();
    if namespaced {
        let mut pieces = parts[0].splitn(3, '.').map(str::trim);
        upstream.destination_name = pieces.next().unwrap_or_default().to_string();
        upstream.destination_namespace = pieces.next().unwrap_or_default().to_string();
        upstream.destination_partition = pieces.next().unwrap_or_default().to_string();
    } else {
        upstream.destination_name = parts[0].trim().to_string();
    }

    let datacenter = parts.get(2).map(|dc| dc.trim().to_string());
    let requires_mesh_gateway = datacenter.is_some();
    upstream.datacenter = datacenter.unwrap_or_default();

    Ok(ParsedUpstream {
        raw: raw.to_string(),
        upstream: service_upstream(port, upstream),
        requires_mesh_gateway,
    })
}

fn labeled_upstream(
    raw: &str,
    service: &str,
    port: i32,
    namespaced: bool,
) -> Result<ParsedUpstream, UpstreamError> {
    let malformed = || UpstreamError::Structure(raw.to_string());
    let pieces = service.split('.').map(str::trim).collect::<Vec<_>>();
    let mut upstream = Upstream::default();

    // The optional trailing `X.{peer|ap|dc}` qualifier.
    let qualifier_at = if namespaced { 4 } else { 2 };
    match pieces.len() {
        n if n == qualifier_at + 2 => {
            let value = pieces[qualifier_at].to_string();
            match pieces[qualifier_at + 1] {
                "peer" => upstream.destination_peer = value,
                "ap" if namespaced => upstream.destination_partition = value,
                "dc" => upstream.datacenter = value,
                _ => return Err(malformed()),
            }
        }
        n if n == qualifier_at || n == 2 => {}
        _ => return Err(malformed()),
    }

    if namespaced && pieces.len() >= 4 {
        if pieces[3] != "ns" {
            return Err(malformed());
        }
        upstream.destination_namespace = pieces[2].to_string();
    }
    upstream.destination_name = pieces[0].to_string();

    Ok(ParsedUpstream {
        raw: raw.to_string(),
        upstream: service_upstream(port, upstream),
        requires_mesh_gateway: false,
    })
}

// === impl ParsedUpstream ===

impl ParsedUpstream {
    /// Validates a datacenter-qualified upstream against the global proxy defaults.
    ///
    /// A missing entry or a mode other than `local`/`remote` is invalid. Lookup failures are
    /// tolerated.
    pub fn check_mesh_gateway(&self, lookup: ProxyDefaultsLookup<'_>) -> Result<(), UpstreamError> {
        if !self.requires_mesh_gateway {
            return Ok(());
        }
        match lookup {
            ProxyDefaultsLookup::NotFound => Err(UpstreamError::NoProxyDefaults(self.raw.clone())),
            ProxyDefaultsLookup::Found { mesh_gateway_mode }
                if mesh_gateway_mode != MESH_GATEWAY_MODE_LOCAL
                    && mesh_gateway_mode != MESH_GATEWAY_MODE_REMOTE =>
            {
                Err(UpstreamError::MeshGatewayMode(self.raw.clone()))
            }
            _ => Ok(()),
        }
    }
}
