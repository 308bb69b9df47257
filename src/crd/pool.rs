use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::SandboxTemplate;

/// A reservoir of pre-warmed pods with a fixed replica count.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[kube(
    group = "agentland.dev",
    version = "v1alpha1",
    kind = "SandboxPool",
    plural = "sandboxpools",
    shortname = "sbp",
    status = "SandboxPoolStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPoolSpec {
    pub replicas: i32,
    #[serde(default = "super::default_profile")]
    pub profile: String,
    pub template: SandboxTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPoolStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_defaults_to_zero() {
        let status = SandboxPoolStatus::default();
        assert_eq!(status.replicas, 0);
        assert_eq!(status.ready_replicas, 0);
    }
}
