//! Ownership of ACL tokens minted through the Kubernetes auth method.
//!
//! The auth method stamps each token's description with a JSON fragment such as
//! `token created via login: {"pod":"ns1/web-abc"}`.

use crate::catalog::AclToken;
use regex::Regex;
use serde::Deserialize;
use std::{collections::BTreeMap, sync::OnceLock};

#[derive(Debug, Deserialize)]
struct TokenMeta {
    #[serde(flatten)]
    fields: BTreeMap<String, serde_json::Value>,
}

fn description_json() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".*(\{.+\})").expect("valid regex"))
}

/// The pod name a token was minted for, with its `<namespace>/` prefix removed.
///
/// Returns `None` when the description carries no parseable metadata or no pod.
pub fn owning_pod(description: &str, namespace: &str) -> Option<String> {
    let json = description_json().captures(description)?.get(1)?.as_str();
    let meta = serde_json::from_str::<TokenMeta>(json).ok()?;
    let pod = meta.fields.get("pod")?.as_str()?;
    let prefix = format!("{namespace}/");
    let name = pod.strip_prefix(&prefix).unwrap_or(pod);
    (!name.is_empty()).then(|| name.to_string())
}

/// True when `token` was minted by `auth_method` for exactly `service_name` on `pod_name`.
pub fn is_owned_by(
    token: &AclToken,
    auth_method: &str,
    service_name: &str,
    namespace: &str,
    pod_name: &str,
) -> bool {
    if token.auth_method != auth_method {
        return false;
    }
    match token.service_identities.as_deref() {
        Some([identity]) if identity.service_name == service_name => {}
        _ => return false,
    }
    owning_pod(&token.description, namespace).as_deref() == Some(pod_name)
}
