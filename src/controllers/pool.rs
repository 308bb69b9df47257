//! Maintains a fixed number of warm pods for a `SandboxPool` (§4.6).

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::Stream;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Resource, ResourceExt};

use super::{CONFLICT_REQUEUE, Context, DEFAULT_REQUEUE, ReconcileError, error_policy};
use crate::crd::{SandboxPool, SandboxPoolStatus, SandboxTemplate};
use crate::labels;

pub fn controller(
    client: Client,
    ctx: Arc<Context>,
) -> impl Stream<
    Item = Result<
        (kube::runtime::reflector::ObjectRef<SandboxPool>, Action),
        kube::runtime::controller::Error<ReconcileError, kube::runtime::watcher::Error>,
    >,
> {
    let pools: Api<SandboxPool> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);
    Controller::new(pools, WatcherConfig::default())
        .owns(pods, WatcherConfig::default())
        .run(reconcile, error_policy, ctx)
}

async fn reconcile(pool: Arc<SandboxPool>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    if pool.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let namespace = pool.namespace().unwrap_or_default();
    let name = pool.name_any();
    let pools: Api<SandboxPool> = Api::namespaced(ctx.client.clone(), &namespace);
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);

    let selector = format!("{}={}", labels::LABEL_POOL, labels::name_hash(&name));
    let listed = pods.list(&ListParams::default().labels(&selector)).await?;

    let mut active: Vec<Pod> = Vec::new();
    for pod in listed.items {
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let owned_by_other = pod
            .metadata
            .owner_references
            .as_ref()
            .is_some_and(|refs| refs.iter().any(|r| r.name != name));
        if owned_by_other {
            continue;
        }
        if pod
            .metadata
            .owner_references
            .as_ref()
            .is_none_or(Vec::is_empty)
            && let Ok(owner_ref) = pool.controller_owner_ref(&())
        {
            let mut claimed = pod.clone();
            claimed.metadata.owner_references = Some(vec![owner_ref]);
            let pod_name = claimed.name_any();
            if let Ok(updated) = pods.replace(&pod_name, &PostParams::default(), &claimed).await {
                active.push(updated);
                continue;
            }
        }
        active.push(pod);
    }

    let ready_count = active.iter().filter(|p| labels::is_pod_ready(p)).count();
    let delta = compute_pool_delta(active.len(), pool.spec.replicas as usize);

    if delta > 0 {
        for _ in 0..delta {
            let generated = build_pool_pod(&pool, &name);
            pods.create(&PostParams::default(), &generated).await?;
        }
    } else if delta < 0 {
        let mut surplus = active.clone();
        surplus.sort_by(|a, b| b.metadata.creation_timestamp.cmp(&a.metadata.creation_timestamp));
        for pod in surplus.into_iter().take((-delta) as usize) {
            let pod_name = pod.name_any();
            let _ = pods.delete(&pod_name, &kube::api::DeleteParams::default()).await;
        }
    }

    let status = SandboxPoolStatus {
        replicas: active.len() as i32,
        ready_replicas: ready_count as i32,
    };
    if status != pool.status.clone().unwrap_or_default() {
        let patch = serde_json::json!({ "status": status });
        if let Err(err) = pools
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            if matches!(&err, kube::Error::Api(resp) if resp.code == 409) {
                return Ok(Action::requeue(CONFLICT_REQUEUE));
            }
            return Err(err.into());
        }
    }

    if status.ready_replicas == pool.spec.replicas {
        Ok(Action::requeue(std::time::Duration::from_secs(30)))
    } else {
        Ok(Action::requeue(DEFAULT_REQUEUE))
    }
}

/// Positive = pods to create, negative = surplus to delete, zero = steady (§4.6 steps 4-5).
fn compute_pool_delta(active: usize, desired: usize) -> i64 {
    desired as i64 - active as i64
}

fn build_pool_pod(pool: &SandboxPool, pool_name: &str) -> Pod {
    let template: &SandboxTemplate = &pool.spec.template;
    let mut pod_labels = BTreeMap::new();
    pod_labels.insert(labels::LABEL_POOL.to_owned(), labels::name_hash(pool_name));
    pod_labels.insert(
        labels::LABEL_PROFILE_HASH.to_owned(),
        labels::name_hash(&pool.spec.profile),
    );

    let container = Container {
        name: "main".to_owned(),
        image: Some(template.image.clone()),
        command: (!template.command.is_empty()).then(|| template.command.clone()),
        args: (!template.args.is_empty()).then(|| template.args.clone()),
        ..Default::default()
    };

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{pool_name}-")),
            namespace: pool.namespace(),
            labels: Some(pod_labels),
            owner_references: pool.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_delta_when_understaffed() {
        assert_eq!(compute_pool_delta(1, 3), 2);
    }

    #[test]
    fn negative_delta_when_overstaffed() {
        assert_eq!(compute_pool_delta(5, 3), -2);
    }

    #[test]
    fn zero_delta_at_steady_state() {
        assert_eq!(compute_pool_delta(3, 3), 0);
    }
}
