use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const SYNCED: &str = "Synced";

pub const STATUS_TRUE: &str = "True";
pub const STATUS_FALSE: &str = "False";

/// Reasons recorded on a failed `Synced` condition.
pub mod reasons {
    pub const CONSUL_AGENT_ERROR: &str = "ConsulAgentError";
    pub const KUBERNETES_ERROR: &str = "KubernetesError";
    pub const INTERNAL_ERROR: &str = "InternalError";
    pub const SYNCED: &str = "Synced";
}

pub fn synced(now: Time) -> Condition {
    Condition {
        type_: SYNCED.to_string(),
        status: STATUS_TRUE.to_string(),
        reason: reasons::SYNCED.to_string(),
        message: String::new(),
        last_transition_time: now,
        observed_generation: None,
    }
}

pub fn not_synced(reason: &str, message: impl ToString, now: Time) -> Condition {
    Condition {
        type_: SYNCED.to_string(),
        status: STATUS_FALSE.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: now,
        observed_generation: None,
    }
}

/// Replaces the condition of the same type, keeping its transition time if the status is
/// unchanged.
pub fn upsert(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

pub fn is_synced(conditions: &[Condition]) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == SYNCED && c.status == STATUS_TRUE)
}
