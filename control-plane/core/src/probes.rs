//! Rewriting of HTTP probes so that they are served through the proxy's expose listeners.

use crate::{annotations, catalog::ExposePath, ports};
use anyhow::{Context, Result};
use k8s_openapi::{
    api::core::v1::{Container, HTTPGetAction, Pod, Probe},
    apimachinery::pkg::util::intstr::IntOrString,
};
use serde::{Deserialize, Serialize};

pub const LIVENESS_PORTS_RANGE_START: u16 = 20300;
pub const READINESS_PORTS_RANGE_START: u16 = 20400;
pub const STARTUP_PORTS_RANGE_START: u16 = 20500;

/// The pod as it was before mutation, stored on the mutated pod so that probe rewrites can be
/// reversed.
///
/// Writers emit the versioned envelope. Readers also accept a bare pod document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OriginalPod {
    V1 { version: OriginalPodVersion, pod: Box<Pod> },
    Bare(Box<Pod>),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OriginalPodVersion {
    #[serde(rename = "v1")]
    V1,
}

#[derive(Copy, Clone, Debug)]
enum ProbeKind {
    Liveness,
    Readiness,
    Startup,
}

// === impl OriginalPod ===

impl OriginalPod {
    pub fn new(pod: Pod) -> Self {
        Self::V1 {
            version: OriginalPodVersion::V1,
            pod: Box::new(pod),
        }
    }

    pub fn from_annotation(pod: &Pod) -> Result<Self> {
        let raw = annotations::pod_annotation(pod, annotations::ORIGINAL_POD).unwrap_or_default();
        serde_json::from_str(raw).context("parsing original pod annotation")
    }

    pub fn to_annotation(&self) -> Result<String> {
        serde_json::to_string(self).context("serializing original pod")
    }

    pub fn pod(&self) -> &Pod {
        match self {
            Self::V1 { pod, .. } | Self::Bare(pod) => pod,
        }
    }
}

// === impl ProbeKind ===

impl ProbeKind {
    const ALL: [Self; 3] = [Self::Liveness, Self::Readiness, Self::Startup];

    fn probe(self, container: &Container) -> Option<&Probe> {
        match self {
            Self::Liveness => container.liveness_probe.as_ref(),
            Self::Readiness => container.readiness_probe.as_ref(),
            Self::Startup => container.startup_probe.as_ref(),
        }
    }

    fn http_get(self, container: &Container) -> Option<&HTTPGetAction> {
        self.probe(container).and_then(|p| p.http_get.as_ref())
    }

    fn range_start(self) -> u16 {
        match self {
            Self::Liveness => LIVENESS_PORTS_RANGE_START,
            Self::Readiness => READINESS_PORTS_RANGE_START,
            Self::Startup => STARTUP_PORTS_RANGE_START,
        }
    }
}

/// Expose paths mapping each mutated HTTP probe port back to the original container port.
pub fn expose_paths(mutated: &Pod, original: &OriginalPod) -> Result<Vec<ExposePath>> {
    let original = original.pod();
    let originals = original
        .spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .collect::<Vec<_>>();

    let mut paths = Vec::new();
    for container in mutated.spec.iter().flat_map(|s| s.containers.iter()) {
        let Some(orig) = originals.iter().find(|c| c.name == container.name) else {
            continue;
        };
        for kind in ProbeKind::ALL {
            let Some(http_get) = kind.http_get(container) else {
                continue;
            };
            let Some(orig_http_get) = kind.http_get(orig) else {
                continue;
            };
            let local_path_port = ports::port_from_int_or_string(original, &orig_http_get.port)
                .and_then(|port| Ok(u16::try_from(port)?))
                .with_context(|| format!("resolving {kind:?} probe port of {}", container.name))?;
            paths.push(ExposePath {
                listener_port: int_value(&http_get.port),
                local_path_port,
                path: http_get.path.clone().unwrap_or_default(),
                ..Default::default()
            });
        }
    }
    Ok(paths)
}

/// The expose listener ports assigned to the HTTP probes of `pod`'s containers.
///
/// The `n`th container's probes listen at offset `n` from each probe kind's range start.
pub fn listener_ports(pod: &Pod) -> Vec<u16> {
    let mut ports = Vec::new();
    for (idx, container) in pod.spec.iter().flat_map(|s| s.containers.iter()).enumerate() {
        for kind in ProbeKind::ALL {
            if kind.http_get(container).is_some() {
                ports.push(kind.range_start().saturating_add(idx as u16));
            }
        }
    }
    ports
}

fn int_value(port: &IntOrString) -> u16 {
    match port {
        IntOrString::Int(port) => u16::try_from(*port).unwrap_or_default(),
        IntOrString::String(s) => s.parse().unwrap_or_default(),
    }
}
