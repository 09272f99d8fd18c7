use std::collections::BTreeSet;

/// Namespaces that are never reconciled, regardless of the allow set.
pub const SYSTEM_NAMESPACES: [&str; 3] = ["kube-system", "kube-public", "local-path-storage"];

const WILDCARD: &str = "*";

/// Selects the Kubernetes namespaces the controllers act on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceFilter {
    pub allow: BTreeSet<String>,
    pub deny: BTreeSet<String>,
}

/// Maps Kubernetes namespaces onto mesh namespaces.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MeshNamespaces {
    /// Mesh namespaces are not in use; every registration goes to the default namespace.
    #[default]
    Disabled,
    /// Every Kubernetes namespace maps to a single mesh namespace.
    Destination(String),
    /// Every Kubernetes namespace maps to a mesh namespace of the same name plus a prefix.
    Mirrored { prefix: String },
}

// === impl NamespaceFilter ===

impl NamespaceFilter {
    pub fn allow_all() -> Self {
        Self {
            allow: std::iter::once(WILDCARD.to_string()).collect(),
            deny: BTreeSet::new(),
        }
    }

    pub fn should_ignore(&self, namespace: &str) -> bool {
        if SYSTEM_NAMESPACES.contains(&namespace) || self.deny.contains(namespace) {
            return true;
        }
        !(self.allow.contains(WILDCARD) || self.allow.contains(namespace))
    }
}

// === impl MeshNamespaces ===

impl MeshNamespaces {
    pub fn from_flags(enabled: bool, destination: String, mirroring: bool, prefix: String) -> Self {
        match (enabled, mirroring) {
            (false, _) => Self::Disabled,
            (true, true) => Self::Mirrored { prefix },
            (true, false) => Self::Destination(destination),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// The mesh namespace for resources in the Kubernetes namespace `namespace`.
    ///
    /// Empty when mesh namespaces are disabled.
    pub fn consul_namespace(&self, namespace: &str) -> String {
        match self {
            Self::Disabled => String::new(),
            Self::Destination(dest) => dest.clone(),
            Self::Mirrored { prefix } => format!("{prefix}{namespace}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn should_ignore() {
        let cases = [
            (set(&["*"]), set(&[]), "default", false),
            (set(&["*"]), set(&[]), "kube-system", true),
            (set(&["*"]), set(&[]), "local-path-storage", true),
            (set(&["*"]), set(&["blocked"]), "blocked", true),
            (set(&["ns1"]), set(&[]), "ns1", false),
            (set(&["ns1"]), set(&[]), "ns2", true),
            (set(&["ns1"]), set(&["ns1"]), "ns1", true),
            (set(&[]), set(&[]), "ns1", true),
        ];
        for (allow, deny, ns, expected) in cases {
            let filter = NamespaceFilter {
                allow: allow.clone(),
                deny: deny.clone(),
            };
            assert_eq!(
                filter.should_ignore(ns),
                expected,
                "allow={allow:?} deny={deny:?} ns={ns}"
            );
        }
    }

    #[test]
    fn consul_namespace() {
        assert_eq!(MeshNamespaces::Disabled.consul_namespace("ns1"), "");
        assert_eq!(
            MeshNamespaces::Destination("dest".to_string()).consul_namespace("ns1"),
            "dest"
        );
        assert_eq!(
            MeshNamespaces::Mirrored {
                prefix: "k8s-".to_string()
            }
            .consul_namespace("ns1"),
            "k8s-ns1"
        );
        assert_eq!(
            MeshNamespaces::from_flags(true, "dest".to_string(), true, "p-".to_string()),
            MeshNamespaces::Mirrored {
                prefix: "p-".to_string()
            }
        );
        assert_eq!(
            MeshNamespaces::from_flags(false, "dest".to_string(), true, String::new()),
            MeshNamespaces::Disabled
        );
    }
}
