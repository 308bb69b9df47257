//! Reconciles one `Sandbox` object into one pod (§4.4).

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::Stream;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Client, Resource, ResourceExt};

use super::{CONFLICT_REQUEUE, Context, DEFAULT_REQUEUE, ReconcileError, error_policy};
use crate::crd::{Phase, Sandbox, SandboxStatus, SandboxTemplate};
use crate::labels;

const PUBLIC_KEY_VOLUME: &str = "agentland-public-key";
const PUBLIC_KEY_MOUNT_PATH: &str = "/var/run/agentland";
const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_MOUNT_PATH: &str = "/workspace";

pub fn controller(
    client: Client,
    ctx: Arc<Context>,
) -> impl Stream<
    Item = Result<
        (kube::runtime::reflector::ObjectRef<Sandbox>, Action),
        kube::runtime::controller::Error<ReconcileError, kube::runtime::watcher::Error>,
    >,
> {
    let sandboxes: Api<Sandbox> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);
    Controller::new(sandboxes, WatcherConfig::default())
        .owns(pods, WatcherConfig::default())
        .run(reconcile, error_policy, ctx)
}

async fn reconcile(sandbox: Arc<Sandbox>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    if sandbox.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let namespace = sandbox.namespace().unwrap_or_default();
    let name = sandbox.name_any();
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let sandboxes: Api<Sandbox> = Api::namespaced(ctx.client.clone(), &namespace);

    let pod = resolve_pod(&pods, &sandbox, &name, &ctx).await?;

    let new_status = desired_status(pod.as_ref());
    if new_status != sandbox.status.clone().unwrap_or_default() {
        let patch = serde_json::json!({ "status": new_status });
        if let Err(err) = sandboxes
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            if is_conflict(&err) {
                return Ok(Action::requeue(CONFLICT_REQUEUE));
            }
            return Err(err.into());
        }
    }

    if new_status.is_running() {
        Ok(Action::requeue(std::time::Duration::from_secs(30)))
    } else {
        Ok(Action::requeue(DEFAULT_REQUEUE))
    }
}

/// Adopts the annotated pod, finds one by name-hash label, or creates a new
/// one — in that order (§4.4 step 3).
async fn resolve_pod(
    pods: &Api<Pod>,
    sandbox: &Sandbox,
    name: &str,
    ctx: &Context,
) -> Result<Option<Pod>, ReconcileError> {
    if let Some(pod_name) = sandbox.annotations().get(labels::ANNOTATION_POD_NAME) {
        if let Some(pod) = pods.get_opt(pod_name).await? {
            return Ok(Some(adopt_pod(pods, pod, sandbox).await?));
        }
    }

    let name_hash = labels::name_hash(name);
    let list = pods
        .list(&ListParams::default().labels(&format!(
            "{}={}",
            labels::LABEL_SANDBOX_NAME_HASH,
            name_hash
        )))
        .await?;
    if let Some(pod) = list
        .items
        .into_iter()
        .find(|p| p.metadata.deletion_timestamp.is_none())
    {
        return Ok(Some(pod));
    }

    let template = match &sandbox.spec.template {
        t if !t.image.is_empty() => t.clone(),
        _ => {
            tracing::error!(sandbox = name, "sandbox template missing image");
            return Ok(None);
        }
    };
    let pod = build_pod(sandbox, name, &template, &ctx.cfg.image_pull_policy);
    let created = pods.create(&PostParams::default(), &pod).await?;
    Ok(Some(created))
}

/// Stamps the sandbox-name-hash label and claims controller ownership of a
/// pre-existing pod only if it currently has no owner — pool-owned pods must
/// first lose theirs via the claim controller's adoption step (§4.4 step 3).
async fn adopt_pod(
    pods: &Api<Pod>,
    mut pod: Pod,
    sandbox: &Sandbox,
) -> Result<Pod, ReconcileError> {
    let name_hash = labels::name_hash(&sandbox.name_any());
    let pod_labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
    pod_labels.insert(labels::LABEL_SANDBOX_NAME_HASH.to_owned(), name_hash);

    if pod.metadata.owner_references.as_ref().is_none_or(Vec::is_empty)
        && let Ok(owner_ref) = sandbox.controller_owner_ref(&())
    {
        pod.metadata.owner_references = Some(vec![owner_ref]);
    }

    let pod_name = pod.name_any();
    pods.replace(&pod_name, &PostParams::default(), &pod).await
        .map_err(ReconcileError::from)
}

fn build_pod(
    sandbox: &Sandbox,
    name: &str,
    template: &SandboxTemplate,
    image_pull_policy: &str,
) -> Pod {
    let name_hash = labels::name_hash(name);
    let mut pod_labels = BTreeMap::new();
    pod_labels.insert(labels::LABEL_SANDBOX_NAME_HASH.to_owned(), name_hash);

    let container = Container {
        name: "main".to_owned(),
        image: Some(template.image.clone()),
        command: (!template.command.is_empty()).then(|| template.command.clone()),
        args: (!template.args.is_empty()).then(|| template.args.clone()),
        image_pull_policy: Some(image_pull_policy.to_owned()),
        volume_mounts: Some(vec![
            VolumeMount {
                name: PUBLIC_KEY_VOLUME.to_owned(),
                mount_path: PUBLIC_KEY_MOUNT_PATH.to_owned(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: WORKSPACE_VOLUME.to_owned(),
                mount_path: WORKSPACE_MOUNT_PATH.to_owned(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: PUBLIC_KEY_VOLUME.to_owned(),
            secret: Some(k8s_openapi::api::core::v1::SecretVolumeSource {
                secret_name: Some("agentland-public-key".to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: WORKSPACE_VOLUME.to_owned(),
            empty_dir: Some(k8s_openapi::api::core::v1::EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];

    let owner_ref = sandbox.controller_owner_ref(&());

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: sandbox.namespace(),
            labels: Some(pod_labels),
            owner_references: owner_ref.map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pure projection of pod state onto Sandbox status (§4.4 step 4).
fn desired_status(pod: Option<&Pod>) -> SandboxStatus {
    let phase_str = pod.and_then(|p| p.status.as_ref()).and_then(|s| s.phase.as_deref());
    let pod_ip = pod
        .and_then(|p| p.status.as_ref())
        .and_then(|s| s.pod_ip.clone())
        .unwrap_or_default();
    SandboxStatus {
        phase: Phase::from_pod_phase(phase_str),
        pod_ip,
        conditions: vec![],
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;

    fn pod_with(phase: Option<&str>, ip: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: phase.map(str::to_owned),
                pod_ip: ip.map(str::to_owned),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn no_pod_is_pending() {
        let status = desired_status(None);
        assert_eq!(status.phase, Phase::Pending);
        assert_eq!(status.pod_ip, "");
    }

    #[test]
    fn running_pod_with_ip_is_running() {
        let pod = pod_with(Some("Running"), Some("10.42.0.10"));
        let status = desired_status(Some(&pod));
        assert!(status.is_running());
    }

    #[test]
    fn running_pod_without_ip_is_not_running() {
        let pod = pod_with(Some("Running"), None);
        let status = desired_status(Some(&pod));
        assert!(!status.is_running());
    }

    #[test]
    fn failed_pod_maps_to_failed_phase() {
        let pod = pod_with(Some("Failed"), None);
        let status = desired_status(Some(&pod));
        assert_eq!(status.phase, Phase::Failed);
    }

    #[test]
    fn build_pod_sets_name_hash_label() {
        let sandbox = Sandbox::new(
            "sess-1",
            crate::crd::SandboxSpec {
                profile: "default".to_owned(),
                claim_ref: String::new(),
                template: SandboxTemplate {
                    image: "korokd:latest".to_owned(),
                    command: vec![],
                    args: vec![],
                },
            },
        );
        let pod = build_pod(&sandbox, "sess-1", &sandbox.spec.template, "Always");
        let expected = labels::name_hash("sess-1");
        assert_eq!(
            pod.metadata.labels.unwrap().get(labels::LABEL_SANDBOX_NAME_HASH),
            Some(&expected)
        );
    }
}
