//! Drives a user-facing Session (CodeInterpreter or AgentSession) to a
//! running pod, via either a direct Sandbox or a pool-backed Claim (§4.7).
//!
//! Both Session kinds share `SessionSpecCore`/`SessionStatus`, so the same
//! reconcile logic (as a generic over the kind) drives each controller.

use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{CONFLICT_REQUEUE, Context, DEFAULT_REQUEUE, ReconcileError, error_policy};
use crate::config::Config;
use crate::crd::{
    AgentRuntime, AgentSession, ClaimPhase, CodeInterpreter, FallbackPolicy, ProvisioningMode,
    RuntimeRef, Sandbox, SandboxClaim, SandboxClaimSpec, SandboxSpec, SandboxTemplate,
    SessionSpecCore, SessionStatus,
};

/// Behavior shared by `AgentSession` and `CodeInterpreter` so reconcile logic
/// can be written once and instantiated per kind.
pub trait SessionResource:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + std::fmt::Debug + Send + Sync + 'static
{
    fn core(&self) -> &SessionSpecCore;
    fn status(&self) -> Option<&SessionStatus>;
}

impl SessionResource for AgentSession {
    fn core(&self) -> &SessionSpecCore {
        &self.spec.core
    }
    fn status(&self) -> Option<&SessionStatus> {
        self.status.as_ref()
    }
}

impl SessionResource for CodeInterpreter {
    fn core(&self) -> &SessionSpecCore {
        &self.spec.core
    }
    fn status(&self) -> Option<&SessionStatus> {
        self.status.as_ref()
    }
}

pub fn controller(
    client: Client,
    ctx: Arc<Context>,
) -> impl Stream<Item = Result<((), Action), String>> {
    // Each concrete Session kind runs its own Controller below; this wrapper
    // exists purely so `spawn_all` can hold one uniform handle type.
    let agent_sessions = run_kind::<AgentSession>(client.clone(), ctx.clone());
    let code_interpreters = run_kind::<CodeInterpreter>(client, ctx);
    futures_util::stream::select(agent_sessions, code_interpreters)
}

fn run_kind<K: SessionResource>(
    client: Client,
    ctx: Arc<Context>,
) -> impl Stream<Item = Result<((), Action), String>> {
    let sessions: Api<K> = Api::all(client.clone());
    let sandboxes: Api<Sandbox> = Api::all(client.clone());
    let claims: Api<SandboxClaim> = Api::all(client);
    Controller::new(sessions, WatcherConfig::default())
        .owns(sandboxes, WatcherConfig::default())
        .owns(claims, WatcherConfig::default())
        .run(reconcile::<K>, error_policy, ctx)
        .map(|r| r.map(|(_, action)| ((), action)).map_err(|e| e.to_string()))
}

async fn reconcile<K: SessionResource>(
    session: Arc<K>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    if session.meta().deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let namespace = session.namespace().unwrap_or_default();
    let name = session.name_any();

    let sessions: Api<K> = Api::namespaced(ctx.client.clone(), &namespace);

    let template = resolve_template(&session, &namespace, &ctx).await?;
    let Some(template) = template else {
        let failed = SessionStatus {
            phase: crate::crd::Phase::Failed,
            pod_ip: String::new(),
            claim_name: String::new(),
            sandbox_name: String::new(),
            conditions: vec![crate::crd::Condition::accepted_false(
                "TemplateMissing",
                "session has no usable template image",
            )],
        };
        return patch_status(&sessions, &name, session.status(), failed).await;
    };

    let mode = effective_mode(session.core(), &ctx.cfg);

    let new_status = match mode {
        ProvisioningMode::Direct => {
            ensure_sandbox(&ctx.client, &session, &namespace, &name, &template, &ctx.cfg).await?;
            mirror_sandbox_status(&ctx.client, &namespace, &name).await?
        }
        ProvisioningMode::PoolPreferred | ProvisioningMode::PoolRequired => {
            let fallback = if mode == ProvisioningMode::PoolRequired {
                FallbackPolicy::ForbidColdStart
            } else {
                FallbackPolicy::AllowColdStart
            };
            ensure_claim(&ctx.client, &session, &namespace, &name, &template, fallback, &ctx.cfg)
                .await?;
            mirror_claim_status(&ctx.client, &namespace, &name).await?
        }
    };

    patch_status(&sessions, &name, session.status(), new_status).await
}

/// Patches status if it changed and picks the next `Action`; shared by the
/// terminal template-missing path and the normal provisioning path.
async fn patch_status<K: SessionResource>(
    sessions: &Api<K>,
    name: &str,
    current: Option<&SessionStatus>,
    new_status: SessionStatus,
) -> Result<Action, ReconcileError> {
    if Some(&new_status) != current {
        let patch = serde_json::json!({ "status": new_status });
        if let Err(err) = sessions
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            if matches!(&err, kube::Error::Api(resp) if resp.code == 409) {
                return Ok(Action::requeue(CONFLICT_REQUEUE));
            }
            return Err(err.into());
        }
    }

    if new_status.is_running() || new_status.phase == crate::crd::Phase::Failed {
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(DEFAULT_REQUEUE))
    }
}

/// Resolves the effective template, folding in the referenced `AgentRuntime`
/// when present; session fields override the runtime's (§4.7 step 1).
/// Returns `Ok(None)` when the template is terminally invalid (no image).
async fn resolve_template<K: SessionResource>(
    session: &K,
    namespace: &str,
    ctx: &Context,
) -> Result<Option<SandboxTemplate>, ReconcileError> {
    let core = session.core();

    let mut template = core.template.clone();
    if template.is_none() {
        let runtime_ref = core.runtime_ref.clone().or_else(|| {
            ctx.cfg.default_runtime_name.clone().map(|name| RuntimeRef {
                name,
                namespace: ctx.cfg.default_runtime_namespace.clone().unwrap_or_default(),
            })
        });
        if let Some(runtime_ref) = runtime_ref {
            let runtime_ns = if runtime_ref.namespace.is_empty() {
                namespace
            } else {
                &runtime_ref.namespace
            };
            let runtimes: Api<AgentRuntime> = Api::namespaced(ctx.client.clone(), runtime_ns);
            if let Some(runtime) = runtimes.get_opt(&runtime_ref.name).await? {
                template = Some(runtime.spec.template);
            }
        }
    }

    match template {
        Some(t) if !t.image.is_empty() => Ok(Some(t)),
        _ => Ok(None),
    }
}

/// Resolves the mode a Session actually runs in: an explicit `provisioning`
/// field wins, otherwise falls back to `AL_DEFAULT_MODE`; either is downgraded
/// to `Direct` when warm-pool provisioning is disabled cluster-wide.
fn effective_mode(core: &SessionSpecCore, cfg: &Config) -> ProvisioningMode {
    let mode = core
        .provisioning
        .as_ref()
        .map(|p| p.mode)
        .unwrap_or_else(|| parse_mode(&cfg.default_mode));
    if !cfg.warm_pool_enabled && mode != ProvisioningMode::Direct {
        ProvisioningMode::Direct
    } else {
        mode
    }
}

fn parse_mode(s: &str) -> ProvisioningMode {
    match s {
        "PoolPreferred" => ProvisioningMode::PoolPreferred,
        "PoolRequired" => ProvisioningMode::PoolRequired,
        _ => ProvisioningMode::Direct,
    }
}

async fn ensure_sandbox<K: SessionResource>(
    client: &Client,
    session: &K,
    namespace: &str,
    name: &str,
    template: &SandboxTemplate,
    cfg: &Config,
) -> Result<(), ReconcileError> {
    let sandboxes: Api<Sandbox> = Api::namespaced(client.clone(), namespace);
    if sandboxes.get_opt(name).await?.is_some() {
        return Ok(());
    }
    let profile = session
        .core()
        .provisioning
        .as_ref()
        .map(|p| p.profile.clone())
        .unwrap_or_else(|| cfg.profile.clone());
    let mut sandbox = Sandbox::new(
        name,
        SandboxSpec {
            profile,
            claim_ref: String::new(),
            template: template.clone(),
        },
    );
    sandbox.metadata.namespace = Some(namespace.to_owned());
    sandbox.metadata.owner_references = session.controller_owner_ref(&()).map(|r| vec![r]);
    match sandboxes.create(&PostParams::default(), &sandbox).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn ensure_claim<K: SessionResource>(
    client: &Client,
    session: &K,
    namespace: &str,
    name: &str,
    template: &SandboxTemplate,
    fallback_policy: FallbackPolicy,
    cfg: &Config,
) -> Result<(), ReconcileError> {
    let claims: Api<SandboxClaim> = Api::namespaced(client.clone(), namespace);
    if claims.get_opt(name).await?.is_some() {
        return Ok(());
    }
    let (profile, pool_ref) = session
        .core()
        .provisioning
        .as_ref()
        .map(|p| (p.profile.clone(), p.pool_ref.clone()))
        .unwrap_or_else(|| (cfg.profile.clone(), cfg.pool_ref.clone().unwrap_or_default()));
    let mut claim = SandboxClaim::new(
        name,
        SandboxClaimSpec {
            profile,
            pool_ref,
            fallback_policy,
            template: template.clone(),
        },
    );
    claim.metadata.namespace = Some(namespace.to_owned());
    claim.metadata.owner_references = session.controller_owner_ref(&()).map(|r| vec![r]);
    match claims.create(&PostParams::default(), &claim).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn mirror_sandbox_status(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<SessionStatus, ReconcileError> {
    let sandboxes: Api<Sandbox> = Api::namespaced(client.clone(), namespace);
    let sandbox = sandboxes.get_opt(name).await?;
    Ok(match sandbox {
        Some(s) => {
            let status = s.status.unwrap_or_default();
            SessionStatus {
                phase: status.phase,
                pod_ip: status.pod_ip,
                claim_name: String::new(),
                sandbox_name: name.to_owned(),
                conditions: status.conditions,
            }
        }
        None => SessionStatus::default(),
    })
}

async fn mirror_claim_status(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<SessionStatus, ReconcileError> {
    let claims: Api<SandboxClaim> = Api::namespaced(client.clone(), namespace);
    let claim = claims.get_opt(name).await?;
    let Some(claim) = claim else {
        return Ok(SessionStatus::default());
    };
    let claim_status = claim.status.unwrap_or_default();

    if claim_status.phase == ClaimPhase::Failed {
        return Ok(SessionStatus {
            phase: crate::crd::Phase::Failed,
            pod_ip: String::new(),
            claim_name: name.to_owned(),
            sandbox_name: String::new(),
            conditions: vec![crate::crd::Condition::accepted_false(
                claim_status.reason.as_str(),
                "warm-pool claim failed",
            )],
        });
    }

    if claim_status.sandbox_name.is_empty() {
        return Ok(SessionStatus {
            phase: crate::crd::Phase::Pending,
            pod_ip: String::new(),
            claim_name: name.to_owned(),
            sandbox_name: String::new(),
            conditions: vec![],
        });
    }

    let mut status = mirror_sandbox_status(client, namespace, &claim_status.sandbox_name).await?;
    status.claim_name = name.to_owned();
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ProvisioningSpec;
    use std::time::Duration;

    fn test_cfg(default_mode: &str, warm_pool_enabled: bool) -> Config {
        Config {
            grpc_listen: "0.0.0.0:7443".to_owned(),
            valkey_url: "redis://localhost:6379".to_owned(),
            sandbox_namespace: "agentland-sandboxes".to_owned(),
            gateway_namespace: "agentland-system".to_owned(),
            signing_key_path: "/var/run/agentland/private.pem".to_owned(),
            issuer: "agentland-gateway".to_owned(),
            audience: "agentland-sandbox".to_owned(),
            token_ttl: Duration::from_secs(300),
            clock_skew: Duration::from_secs(30),
            kid: "agentland-1".to_owned(),
            default_runtime_name: None,
            default_runtime_namespace: None,
            warm_pool_enabled,
            default_mode: default_mode.to_owned(),
            pool_ref: None,
            profile: "default".to_owned(),
            image_pull_policy: "Always".to_owned(),
            interpreter_port: 1883,
            max_session_duration: Duration::from_secs(3600),
            max_idle_duration: Duration::from_secs(900),
            gc_interval: Duration::from_secs(30),
        }
    }

    #[test]
    fn effective_mode_defaults_to_direct() {
        let core = SessionSpecCore::default();
        let cfg = test_cfg("Direct", true);
        assert_eq!(effective_mode(&core, &cfg), ProvisioningMode::Direct);
    }

    #[test]
    fn effective_mode_reads_provisioning_field() {
        let core = SessionSpecCore {
            provisioning: Some(ProvisioningSpec {
                mode: ProvisioningMode::PoolRequired,
                ..Default::default()
            }),
            ..Default::default()
        };
        let cfg = test_cfg("Direct", true);
        assert_eq!(effective_mode(&core, &cfg), ProvisioningMode::PoolRequired);
    }

    #[test]
    fn effective_mode_falls_back_to_configured_default() {
        let core = SessionSpecCore::default();
        let cfg = test_cfg("PoolPreferred", true);
        assert_eq!(effective_mode(&core, &cfg), ProvisioningMode::PoolPreferred);
    }

    #[test]
    fn effective_mode_downgrades_to_direct_when_warm_pool_disabled() {
        let core = SessionSpecCore {
            provisioning: Some(ProvisioningSpec {
                mode: ProvisioningMode::PoolRequired,
                ..Default::default()
            }),
            ..Default::default()
        };
        let cfg = test_cfg("Direct", false);
        assert_eq!(effective_mode(&core, &cfg), ProvisioningMode::Direct);
    }
}
