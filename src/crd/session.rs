use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::{Condition, Phase, ProvisioningSpec, SandboxTemplate};

/// Reference to a named, possibly cross-namespace `AgentRuntime`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeRef {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// Fields shared by both Session flavors; flattened into each CR's spec so
/// the two kinds stay structurally identical apart from their kind-specific
/// extras (§3 calls this "two flavors that share shape").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpecCore {
    #[serde(default)]
    pub template: Option<SandboxTemplate>,
    #[serde(default)]
    pub provisioning: Option<ProvisioningSpec>,
    #[serde(default)]
    pub runtime_ref: Option<RuntimeRef>,
    /// Idle timeout in seconds before GC reaps the session; falls back to
    /// the gateway's configured `MaxIdleDuration` when unset.
    #[serde(default)]
    pub session_timeout_secs: Option<i64>,
    /// Hard lifetime ceiling in seconds; falls back to `MaxSessionDuration`.
    #[serde(default)]
    pub max_session_duration_secs: Option<i64>,
}

/// Observed state mirrored upward from the child Sandbox or Claim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub pod_ip: String,
    #[serde(default)]
    pub claim_name: String,
    #[serde(default)]
    pub sandbox_name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl SessionStatus {
    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running && !self.pod_ip.is_empty()
    }

    /// The `reason`/`message` pair off the `Accepted=False` condition, if any.
    pub fn accepted_failure(&self) -> Option<(&str, &str)> {
        self.conditions
            .iter()
            .find(|c| c.type_ == "Accepted" && c.status == "False")
            .map(|c| (c.reason.as_str(), c.message.as_str()))
    }
}

/// A bare-language code-execution session, created by `CreateCodeInterpreter`.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[kube(
    group = "agentland.dev",
    version = "v1alpha1",
    kind = "CodeInterpreter",
    plural = "codeinterpreters",
    shortname = "ci",
    status = "SessionStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CodeInterpreterSpec {
    #[serde(flatten)]
    pub core: SessionSpecCore,
    /// Interpreter language, e.g. `"python"`; resolved to a template image
    /// by the gateway when no explicit `template` is set.
    #[serde(default)]
    pub language: String,
}

/// A runtime-backed agent session, created by `CreateAgentSession`.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
#[kube(
    group = "agentland.dev",
    version = "v1alpha1",
    kind = "AgentSession",
    plural = "agentsessions",
    shortname = "as",
    status = "SessionStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AgentSessionSpec {
    #[serde(flatten)]
    pub core: SessionSpecCore,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_running_requires_phase_and_ip() {
        let status = SessionStatus {
            phase: Phase::Running,
            pod_ip: "10.42.0.10".to_owned(),
            ..Default::default()
        };
        assert!(status.is_running());
    }

    #[test]
    fn accepted_failure_extracts_reason_and_message() {
        let status = SessionStatus {
            conditions: vec![Condition::accepted_false("TemplateMissing", "image is empty")],
            ..Default::default()
        };
        let (reason, message) = status.accepted_failure().unwrap();
        assert_eq!(reason, "TemplateMissing");
        assert_eq!(message, "image is empty");
    }

    #[test]
    fn accepted_failure_absent_when_no_matching_condition() {
        let status = SessionStatus::default();
        assert!(status.accepted_failure().is_none());
    }

    #[test]
    fn code_interpreter_spec_flattens_core_fields() {
        let json = serde_json::json!({
            "language": "python",
            "sessionTimeoutSecs": 900,
        });
        let spec: CodeInterpreterSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.language, "python");
        assert_eq!(spec.core.session_timeout_secs, Some(900));
    }
}
