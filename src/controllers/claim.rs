//! Matches a `SandboxClaim` to a warm pod or falls through to cold start (§4.5).

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::Stream;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Resource, ResourceExt};

use super::{CONFLICT_REQUEUE, Context, DEFAULT_REQUEUE, ReconcileError, error_policy};
use crate::crd::{ClaimPhase, FallbackPolicy, Sandbox, SandboxClaim, SandboxClaimStatus};
use crate::labels;

pub fn controller(
    client: Client,
    ctx: Arc<Context>,
) -> impl Stream<
    Item = Result<
        (kube::runtime::reflector::ObjectRef<SandboxClaim>, Action),
        kube::runtime::controller::Error<ReconcileError, kube::runtime::watcher::Error>,
    >,
> {
    let claims: Api<SandboxClaim> = Api::all(client.clone());
    Controller::new(claims, WatcherConfig::default()).run(reconcile, error_policy, ctx)
}

async fn reconcile(claim: Arc<SandboxClaim>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    if claim.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let namespace = claim.namespace().unwrap_or_default();
    let name = claim.name_any();
    let claims: Api<SandboxClaim> = Api::namespaced(ctx.client.clone(), &namespace);
    let sandboxes: Api<Sandbox> = Api::namespaced(ctx.client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);

    if claim.spec.template.image.is_empty() {
        return patch_status(
            &claims,
            &name,
            SandboxClaimStatus {
                phase: ClaimPhase::Failed,
                sandbox_name: String::new(),
                reason: "TemplateMissing".to_owned(),
            },
        )
        .await;
    }

    if let Some(sandbox) = sandboxes.get_opt(&name).await? {
        let status = sandbox.status.unwrap_or_default();
        let phase = if status.is_running() {
            ClaimPhase::Bound
        } else {
            ClaimPhase::Pending
        };
        return patch_status(
            &claims,
            &name,
            SandboxClaimStatus {
                phase,
                sandbox_name: name.clone(),
                reason: String::new(),
            },
        )
        .await;
    }

    let candidate_pods = pods
        .list(&ListParams::default().labels(&warm_selector(&claim.spec.profile, &claim.spec.pool_ref)))
        .await?;
    let candidate = select_warm_pod(&candidate_pods.items);

    let Some(candidate) = candidate else {
        if claim.spec.fallback_policy == FallbackPolicy::ForbidColdStart {
            return patch_status(
                &claims,
                &name,
                SandboxClaimStatus {
                    phase: ClaimPhase::Failed,
                    sandbox_name: String::new(),
                    reason: "NoWarmPod".to_owned(),
                },
            )
            .await;
        }
        create_sandbox(&sandboxes, &claim, &name, None).await?;
        return patch_status(
            &claims,
            &name,
            SandboxClaimStatus {
                phase: ClaimPhase::Pending,
                sandbox_name: name.clone(),
                reason: "SandboxCreating".to_owned(),
            },
        )
        .await;
    };

    let adopted_name = candidate.name_any();
    adopt_warm_pod(&pods, candidate.clone(), &claim, &name).await?;
    create_sandbox(&sandboxes, &claim, &name, Some(&adopted_name)).await?;
    patch_status(
        &claims,
        &name,
        SandboxClaimStatus {
            phase: ClaimPhase::Pending,
            sandbox_name: name.clone(),
            reason: "SandboxCreating".to_owned(),
        },
    )
    .await
}

fn warm_selector(profile: &str, pool_ref: &str) -> String {
    let mut selector = format!(
        "{}={}",
        labels::LABEL_PROFILE_HASH,
        labels::name_hash(profile)
    );
    if !pool_ref.is_empty() {
        selector.push_str(&format!(",{}={}", labels::LABEL_POOL, labels::name_hash(pool_ref)));
    }
    selector
}

/// Ready pods first, then oldest (§4.5 step 4). Pods owned by anything other
/// than a SandboxPool, or with a deletion timestamp, are not poachable.
fn select_warm_pod(pods: &[Pod]) -> Option<&Pod> {
    let mut candidates: Vec<&Pod> = pods
        .iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .filter(|p| {
            p.metadata
                .owner_references
                .as_ref()
                .is_none_or(|refs| refs.iter().all(|r| r.kind == "SandboxPool"))
        })
        .collect();

    candidates.sort_by(|a, b| {
        let ready_order = labels::is_pod_ready(b).cmp(&labels::is_pod_ready(a));
        if ready_order != std::cmp::Ordering::Equal {
            return ready_order;
        }
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
    });
    candidates.into_iter().next()
}

/// Clears pool/profile labels, stamps sandbox-name-hash/claim-uid, and
/// clears the owner-ref so the Sandbox controller can re-adopt it (§4.5 step 5).
async fn adopt_warm_pod(
    pods: &Api<Pod>,
    mut pod: Pod,
    claim: &SandboxClaim,
    sandbox_name: &str,
) -> Result<(), ReconcileError> {
    let pod_labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
    pod_labels.remove(labels::LABEL_POOL);
    pod_labels.remove(labels::LABEL_PROFILE_HASH);
    pod_labels.insert(
        labels::LABEL_SANDBOX_NAME_HASH.to_owned(),
        labels::name_hash(sandbox_name),
    );
    pod_labels.insert(labels::LABEL_CLAIM_UID.to_owned(), claim.uid().unwrap_or_default());
    pod.metadata.owner_references = None;

    let pod_name = pod.name_any();
    pods.replace(&pod_name, &PostParams::default(), &pod).await?;
    Ok(())
}

async fn create_sandbox(
    sandboxes: &Api<Sandbox>,
    claim: &SandboxClaim,
    name: &str,
    adopted_pod_name: Option<&str>,
) -> Result<(), ReconcileError> {
    let mut sandbox = Sandbox::new(
        name,
        crate::crd::SandboxSpec {
            profile: claim.spec.profile.clone(),
            claim_ref: claim.name_any(),
            template: claim.spec.template.clone(),
        },
    );
    sandbox.metadata.namespace = claim.namespace();
    sandbox.metadata.owner_references = claim.controller_owner_ref(&()).map(|r| vec![r]);
    if let Some(pod_name) = adopted_pod_name {
        sandbox
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(labels::ANNOTATION_POD_NAME.to_owned(), pod_name.to_owned());
    }
    match sandboxes.create(&PostParams::default(), &sandbox).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn patch_status(
    claims: &Api<SandboxClaim>,
    name: &str,
    status: SandboxClaimStatus,
) -> Result<Action, ReconcileError> {
    let phase = status.phase;
    let patch = serde_json::json!({ "status": status });
    match claims
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(match phase {
            ClaimPhase::Bound | ClaimPhase::Failed => Action::await_change(),
            ClaimPhase::Pending => Action::requeue(DEFAULT_REQUEUE),
        }),
        Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(Action::requeue(CONFLICT_REQUEUE)),
        Err(err) => Err(err.into()),
    }
}
