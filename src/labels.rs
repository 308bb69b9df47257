//! Deterministic label values and readiness checks shared by every controller.

use k8s_openapi::api::core::v1::Pod;

pub const LABEL_POOL: &str = "agentland.dev/pool";
pub const LABEL_PROFILE_HASH: &str = "agentland.dev/profile-hash";
pub const LABEL_SANDBOX_NAME_HASH: &str = "agentland.dev/sandbox-name-hash";
pub const LABEL_CLAIM_UID: &str = "agentland.dev/claim-uid";

pub const ANNOTATION_POD_NAME: &str = "agentland.dev/pod-name";

/// Map a UTF-8 name to a stable 8-hex-character label value.
///
/// FNV-1a over the name's bytes, truncated to 32 bits. Not cryptographic —
/// only needs to be stable across runs and collision-unlikely for label
/// cardinality, not collision-resistant against an adversary.
pub fn name_hash(name: &str) -> String {
    const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:08x}")
}

/// True iff the pod's status conditions contain `Ready=True`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    #[test]
    fn name_hash_is_deterministic() {
        assert_eq!(name_hash("python-pool"), name_hash("python-pool"));
    }

    #[test]
    fn name_hash_is_eight_hex_chars() {
        let h = name_hash("session-abc123");
        assert_eq!(h.len(), 8);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn name_hash_differs_for_different_inputs() {
        assert_ne!(name_hash("python-pool"), name_hash("node-pool"));
    }

    #[test]
    fn name_hash_empty_string() {
        // Must not panic and must still be 8 hex chars.
        let h = name_hash("");
        assert_eq!(h.len(), 8);
    }

    fn pod_with_conditions(conditions: Vec<PodCondition>) -> Pod {
        Pod {
            status: Some(PodStatus {
                conditions: Some(conditions),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn condition(type_: &str, status: &str) -> PodCondition {
        PodCondition {
            type_: type_.to_owned(),
            status: status.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn ready_true_condition_is_ready() {
        let pod = pod_with_conditions(vec![condition("Ready", "True")]);
        assert!(is_pod_ready(&pod));
    }

    #[test]
    fn ready_false_condition_is_not_ready() {
        let pod = pod_with_conditions(vec![condition("Ready", "False")]);
        assert!(!is_pod_ready(&pod));
    }

    #[test]
    fn missing_ready_condition_is_not_ready() {
        let pod = pod_with_conditions(vec![condition("PodScheduled", "True")]);
        assert!(!is_pod_ready(&pod));
    }

    #[test]
    fn no_status_is_not_ready() {
        let pod = Pod::default();
        assert!(!is_pod_ready(&pod));
    }
}
