//! Background session reaper: every `gc_interval`, within a 20s bounded
//! pass, deletes Session CRs and registry records past idle/expiry (§4.8).

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::Utc;
use kube::Client;
use kube::api::{Api, DeleteParams};

use crate::config::Config;
use crate::crd::{AgentSession, CodeInterpreter};
use crate::registry::SessionRegistry;

const PASS_BUDGET: Duration = Duration::from_secs(20);
const LIST_LIMIT: usize = 100;

/// Runs the reaper loop until `shutdown` fires. One task per process (§5).
pub async fn run(
    client: Client,
    registry: SessionRegistry,
    cfg: Config,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(cfg.gc_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = tokio::time::timeout(
                    PASS_BUDGET,
                    run_pass(&client, &registry, &cfg),
                )
                .await
                {
                    tracing::warn!(error = %err, "gc pass exceeded its time budget");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("gc loop shutting down");
                    return;
                }
            }
        }
    }
}

async fn run_pass(client: &Client, registry: &SessionRegistry, cfg: &Config) {
    let now = Utc::now();

    let inactive = registry
        .list_inactive_sessions(now - cfg.max_idle_duration, LIST_LIMIT)
        .await
        .inspect_err(|err| tracing::warn!(error = %err, "list_inactive_sessions failed"))
        .unwrap_or_default();
    let expired = registry
        .list_expired_sessions(now, LIST_LIMIT)
        .await
        .inspect_err(|err| tracing::warn!(error = %err, "list_expired_sessions failed"))
        .unwrap_or_default();

    let ids: BTreeSet<String> = inactive.into_iter().chain(expired).collect();

    for id in ids {
        if let Err(err) = reap_one(client, registry, &cfg.sandbox_namespace, &id).await {
            tracing::warn!(session = %id, error = %err, "gc failed for session");
        }
    }
}

async fn reap_one(
    client: &Client,
    registry: &SessionRegistry,
    namespace: &str,
    id: &str,
) -> anyhow::Result<()> {
    delete_ignoring_not_found::<AgentSession>(client, namespace, id).await?;
    delete_ignoring_not_found::<CodeInterpreter>(client, namespace, id).await?;
    registry.delete_session(id).await?;
    Ok(())
}

async fn delete_ignoring_not_found<K>(client: &Client, namespace: &str, name: &str) -> kube::Result<()>
where
    K: kube::Resource<DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedups_ids_seen_in_both_inactive_and_expired_lists() {
        let inactive = vec!["a".to_owned(), "b".to_owned()];
        let expired = vec!["b".to_owned(), "c".to_owned()];
        let merged: BTreeSet<String> = inactive.into_iter().chain(expired).collect();
        assert_eq!(merged.len(), 3);
        assert!(merged.contains("a"));
        assert!(merged.contains("b"));
        assert!(merged.contains("c"));
    }
}
