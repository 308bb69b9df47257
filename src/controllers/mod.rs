//! The four cooperating controllers (§4.4-4.7): Sandbox, SandboxClaim,
//! SandboxPool, Session. Each owns a `kube::runtime::controller::Controller`
//! loop; reconcile logic is kept in small pure functions where possible so
//! it can be unit-tested without a live cluster.

pub mod claim;
pub mod pool;
pub mod sandbox;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use kube::Client;

use crate::config::Config;

/// Requeue interval used after a routine, non-error reconcile that isn't
/// yet at its terminal state (§4.4).
pub const DEFAULT_REQUEUE: Duration = Duration::from_millis(500);
/// Requeue interval used after an optimistic-concurrency conflict.
pub const CONFLICT_REQUEUE: Duration = Duration::from_millis(100);

/// Shared state handed to every reconciler.
pub struct Context {
    pub client: Client,
    pub cfg: Config,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

pub fn error_policy<K>(
    _object: Arc<K>,
    error: &ReconcileError,
    _ctx: Arc<Context>,
) -> kube::runtime::controller::Action {
    tracing::warn!(error = %error, "reconcile error, requeuing");
    kube::runtime::controller::Action::requeue(Duration::from_secs(5))
}

/// Spawns all four controllers as background tasks against the given client
/// and configuration. Each runs until the process shuts down.
pub fn spawn_all(client: Client, cfg: Config) -> Vec<tokio::task::JoinHandle<()>> {
    let ctx = Arc::new(Context {
        client: client.clone(),
        cfg,
    });

    vec![
        tokio::spawn(run_reporting(sandbox::controller(client.clone(), ctx.clone()), "sandbox")),
        tokio::spawn(run_reporting(claim::controller(client.clone(), ctx.clone()), "claim")),
        tokio::spawn(run_reporting(pool::controller(client.clone(), ctx.clone()), "pool")),
        tokio::spawn(run_session_reporting(session::controller(client, ctx))),
    ]
}

async fn run_session_reporting(
    stream: impl futures_util::Stream<Item = Result<((), kube::runtime::controller::Action), String>>,
) {
    tokio::pin!(stream);
    while let Some(result) = stream.next().await {
        if let Err(err) = result {
            tracing::warn!(controller = "session", error = %err, "controller stream error");
        }
    }
}

async fn run_reporting<K>(
    stream: impl futures_util::Stream<
        Item = Result<
            (kube::runtime::reflector::ObjectRef<K>, kube::runtime::controller::Action),
            kube::runtime::controller::Error<ReconcileError, kube::runtime::watcher::Error>,
        >,
    >,
    name: &'static str,
) where
    K: kube::Resource<DynamicType = ()>,
{
    tokio::pin!(stream);
    while let Some(result) = stream.next().await {
        if let Err(err) = result {
            tracing::warn!(controller = name, error = %err, "controller stream error");
        }
    }
}
