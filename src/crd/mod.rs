//! Declarative object types persisted in the orchestrator's object store.
//!
//! Every kind here is a `kube::CustomResource` in the `agentland.dev/v1alpha1`
//! group, following the derive shape used for `AgentSandbox`/`AgentSandboxPool`
//! in `thrashr888-agentkernel`'s Kubernetes backend: serde + schemars +
//! `#[kube(...)]` attributes, with a separate status subresource.

pub mod claim;
pub mod pool;
pub mod runtime;
pub mod sandbox;
pub mod session;

pub use claim::{ClaimPhase, SandboxClaim, SandboxClaimSpec, SandboxClaimStatus};
pub use pool::{SandboxPool, SandboxPoolSpec, SandboxPoolStatus};
pub use runtime::{AgentRuntime, AgentRuntimeSpec};
pub use sandbox::{Sandbox, SandboxSpec, SandboxStatus};
pub use session::{
    AgentSession, AgentSessionSpec, CodeInterpreter, CodeInterpreterSpec, RuntimeRef,
    SessionSpecCore, SessionStatus,
};

use serde::{Deserialize, Serialize};

/// Container image and launch arguments for a sandbox pod's main container.
/// Immutable once embedded in a Sandbox/Claim/Session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SandboxTemplate {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// How a Session should be bound to a pod: directly, or via a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum ProvisioningMode {
    #[default]
    Direct,
    PoolPreferred,
    PoolRequired,
}

/// Desired provisioning strategy for a Session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ProvisioningSpec {
    #[serde(default)]
    pub mode: ProvisioningMode,
    #[serde(default)]
    pub pool_ref: String,
    #[serde(default = "default_profile")]
    pub profile: String,
}

pub fn default_profile() -> String {
    "default".to_owned()
}

/// Whether a Claim may cold-start a Sandbox when no warm pod matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum FallbackPolicy {
    #[default]
    AllowColdStart,
    ForbidColdStart,
}

/// Observed pod phase, mirrored from `pod.status.phase` (or absent).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Failed,
    Succeeded,
    Unknown,
}

impl Phase {
    /// Map a raw `pod.status.phase` string (absent = `Pending`).
    pub fn from_pod_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Running") => Self::Running,
            Some("Failed") => Self::Failed,
            Some("Succeeded") => Self::Succeeded,
            Some("Pending") | None => Self::Pending,
            Some(_) => Self::Unknown,
        }
    }
}

/// A typed condition surfaced on status subresources, e.g. `Accepted=False`
/// with a `reason`/`message` pair for terminal errors (§7 error taxonomy).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn accepted_false(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: "Accepted".to_owned(),
            status: "False".to_owned(),
            reason: reason.into(),
            message: message.into(),
        }
    }
}
