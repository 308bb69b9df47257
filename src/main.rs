use std::sync::Arc;

use agentland_gateway::config::Config;
use agentland_gateway::credentials::bootstrap;
use agentland_gateway::registry::SessionRegistry;
use agentland_gateway::rpc::gc;
use agentland_gateway::rpc::proto::sandbox_service_server::SandboxServiceServer;
use agentland_gateway::rpc::service::Gateway;
use agentland_gateway::{controllers, credentials};
use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("AL_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    let cfg = Config::load();

    let client = kube::Client::try_default().await?;
    let in_cluster = std::env::var("KUBERNETES_SERVICE_HOST").is_ok();
    let cred_client = in_cluster.then_some(&client);

    // Bootstrap persists the keypair to disk and publishes the public half
    // into the sandbox namespace; the in-pod middleware consumes it from
    // there, not from this process.
    let _credential_service: credentials::CredentialService =
        bootstrap::bootstrap(cred_client, &cfg).await?;
    let registry = SessionRegistry::connect(&cfg.valkey_url).await?;

    let controller_handles = controllers::spawn_all(client.clone(), cfg.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let gc_handle = tokio::spawn(gc::run(client.clone(), registry.clone(), cfg.clone(), shutdown_rx));

    let gateway = Gateway::new(client, registry, Arc::new(cfg.clone()));

    let addr = cfg.grpc_listen.parse()?;
    tracing::info!(%addr, "starting gateway");

    tonic::transport::Server::builder()
        .add_service(SandboxServiceServer::new(gateway))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in controller_handles {
        handle.abort();
    }
    let _ = gc_handle.await;

    tracing::info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
