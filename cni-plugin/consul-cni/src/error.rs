use serde::Serialize;

/// Failures that abort a plugin invocation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse network configuration: {0}")]
    Config(#[source] serde_json::Error),

    #[error("could not parse prevResult: {0}")]
    PrevResult(#[source] serde_json::Error),

    #[error("got no container IPs")]
    NoContainerIps,

    #[error("invalid CNI_ARGS entry {0:?}")]
    Args(String),

    #[error("unsupported CNI_COMMAND {0:?}")]
    Command(String),

    #[error("not running in a pod, namespace and pod should have values")]
    NoPodIdentity,

    #[error("could not unmarshal CNI args: {0}")]
    InlineConfig(#[source] serde_json::Error),

    #[error("error retrieving pod: {0}")]
    Pod(#[source] kube::Error),

    #[error("could not create Kubernetes client: {0}")]
    Client(#[source] anyhow::Error),

    #[error("could not find {annotation} annotation for {pod} pod")]
    MissingAnnotation {
        annotation: &'static str,
        pod: String,
    },

    #[error("could not unmarshal {annotation} annotation for {pod} pod: {source}")]
    InvalidAnnotation {
        annotation: &'static str,
        pod: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not apply iptables setup: {0}")]
    Effector(#[source] anyhow::Error),
}

/// The error document printed on stdout when an invocation fails.
#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CniError {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

// === impl Error ===

impl Error {
    /// The CNI error code. Codes below 100 are reserved by the CNI specification.
    pub fn code(&self) -> u32 {
        match self {
            Self::Command(_) | Self::Args(_) | Self::NoPodIdentity => 4,
            Self::Config(_)
            | Self::PrevResult(_)
            | Self::InlineConfig(_)
            | Self::InvalidAnnotation { .. } => 6,
            Self::NoContainerIps => 7,
            Self::Pod(_) | Self::Client(_) => 11,
            Self::MissingAnnotation { .. } | Self::Effector(_) => 100,
        }
    }

    pub fn to_cni(&self, cni_version: &str) -> CniError {
        let details = std::error::Error::source(self)
            .map(|source| {
                let mut chain = source.to_string();
                let mut next = source.source();
                while let Some(cause) = next {
                    chain.push_str(": ");
                    chain.push_str(&cause.to_string());
                    next = cause.source();
                }
                chain
            })
            .unwrap_or_default();
        CniError {
            cni_version: cni_version.to_string(),
            code: self.code(),
            msg: self.to_string(),
            details,
        }
    }
}
