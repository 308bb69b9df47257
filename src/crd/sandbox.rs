use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::SandboxTemplate;

/// Desired state of a single pod: exactly one pod backs a Sandbox.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[kube(
    group = "agentland.dev",
    version = "v1alpha1",
    kind = "Sandbox",
    plural = "sandboxes",
    shortname = "sbx",
    status = "SandboxStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    #[serde(default = "super::default_profile")]
    pub profile: String,
    #[serde(default)]
    pub claim_ref: String,
    pub template: SandboxTemplate,
}

/// Observed pod state mirrored onto the Sandbox by its controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    #[serde(default)]
    pub phase: super::Phase,
    #[serde(default)]
    pub pod_ip: String,
    #[serde(default)]
    pub conditions: Vec<super::Condition>,
}

impl SandboxStatus {
    pub fn is_running(&self) -> bool {
        self.phase == super::Phase::Running && !self.pod_ip.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Phase;

    #[test]
    fn is_running_requires_phase_and_ip() {
        let mut status = SandboxStatus {
            phase: Phase::Running,
            pod_ip: String::new(),
            conditions: vec![],
        };
        assert!(!status.is_running());
        status.pod_ip = "10.42.0.10".to_owned();
        assert!(status.is_running());
    }

    #[test]
    fn default_status_is_not_running() {
        assert!(!SandboxStatus::default().is_running());
    }
}
