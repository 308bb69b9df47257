use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::{FallbackPolicy, SandboxTemplate};

/// A request to bind a session to either a warm pod or a freshly created one.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[kube(
    group = "agentland.dev",
    version = "v1alpha1",
    kind = "SandboxClaim",
    plural = "sandboxclaims",
    shortname = "sbc",
    status = "SandboxClaimStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxClaimSpec {
    #[serde(default = "super::default_profile")]
    pub profile: String,
    #[serde(default)]
    pub pool_ref: String,
    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
    pub template: SandboxTemplate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum ClaimPhase {
    #[default]
    Pending,
    Bound,
    Failed,
}

/// Observed outcome of warm-pod matching or cold-start delegation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,
    #[serde(default)]
    pub sandbox_name: String,
    #[serde(default)]
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_phase_defaults_to_pending() {
        assert_eq!(ClaimPhase::default(), ClaimPhase::Pending);
    }

    #[test]
    fn status_round_trips_through_json() {
        let status = SandboxClaimStatus {
            phase: ClaimPhase::Failed,
            sandbox_name: String::new(),
            reason: "NoWarmPod".to_owned(),
        };
        let json = serde_json::to_string(&status).unwrap();
        let back: SandboxClaimStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
