use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod control_tunnel;
mod controller;
mod docker;
mod error;
mod error_payload;
mod events;
#[cfg(test)]
mod fake_runtime;
mod frames;
mod health_service;
mod labels;
mod output;
mod recovery;
mod registry;
mod runtime;
mod session_service;
mod strategies;
mod volumes;

use crate::{
    config::AgentConfig,
    controller::SessionController,
    docker::DockerRuntime,
    events::EventPublisher,
    registry::SessionRegistry,
    runtime::ContainerRuntime,
    strategies::{ControlPlaneStrategies, NoStrategies, StrategySource},
};

fn init_tracing(
    log_dir: Option<&std::path::Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = tracing_subscriber::fmt::layer();

    let Some(dir) = log_dir else {
        tracing_subscriber::registry().with(filter).with(stdout).init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::daily(dir, "hostmgr-agent.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer))
        .init();
    Ok(Some(guard))
}

fn strategy_source(config: &AgentConfig) -> Arc<dyn StrategySource> {
    let Some(url) = config.control_grpc_url.as_deref() else {
        return Arc::new(NoStrategies);
    };
    match ControlPlaneStrategies::new(url, config.strategy_fetch_timeout, config.node_token.clone()) {
        Ok(src) => Arc::new(src),
        Err(e) => {
            tracing::warn!(error = %e, "config strategies disabled");
            Arc::new(NoStrategies)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AgentConfig::from_env()?;
    let _log_guard = init_tracing(config.log_dir.as_deref())?;
    let config = Arc::new(config);

    tracing::info!(
        server_id = %config.server_id,
        environment = config.environment.as_deref().unwrap_or("-"),
        data_root = %config.data_root.display(),
        "hostmgr-agent starting"
    );

    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerRuntime::connect(&config.docker_socket, config.docker_timeout)?);
    if let Err(e) = runtime.ping().await {
        tracing::warn!(error = %e, "container runtime not reachable yet");
    }

    let (events, events_rx) = EventPublisher::channel(config.event_queue_capacity);
    let controller = SessionController::new(
        config.clone(),
        runtime,
        SessionRegistry::new(),
        events,
        strategy_source(&config),
    );

    recovery::recover(&controller).await;

    let shutdown = CancellationToken::new();
    let sweeper = recovery::spawn_sweeper(controller.clone(), shutdown.clone());
    let tunnel = control_tunnel::spawn(controller.clone(), events_rx, shutdown.clone());

    let addr = config.grpc_addr;
    tracing::info!(%addr, "hostmgr-agent gRPC listening");

    let signal = shutdown.clone();
    Server::builder()
        .add_service(health_service::server(controller.clone()))
        .add_service(session_service::server(controller))
        .serve_with_shutdown(addr, async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "ctrl-c handler failed");
            }
            tracing::info!("shutdown requested; sessions are left running");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    let _ = tunnel.await;
    Ok(())
}
