use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::{ProvisioningSpec, SandboxTemplate};

/// Named, cluster-side template reservoir referenced by Sessions via `runtimeRef`.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[kube(
    group = "agentland.dev",
    version = "v1alpha1",
    kind = "AgentRuntime",
    plural = "agentruntimes",
    shortname = "art",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AgentRuntimeSpec {
    pub template: SandboxTemplate,
    #[serde(default)]
    pub provisioning: ProvisioningSpec,
    #[serde(default)]
    pub ports: Vec<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_has_empty_template_image() {
        let spec = AgentRuntimeSpec::default();
        assert!(spec.template.image.is_empty());
        assert!(spec.ports.is_empty());
    }
}
