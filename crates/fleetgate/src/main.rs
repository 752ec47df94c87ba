use anyhow::Context;
use clap::Parser;
use fleetgate::cli::Args;
use fleetgate::control::spawn_control_server;
use fleetgate::layers::policy::{JsonFileStore, Registry, RegistryFile, SharedRegistry};
use fleetgate::logging::init_tracing;
use fleetgate::{BrokerConfig, ExecutionCoordinator, FileAuditSink, SshTransport};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _file_guard = init_tracing(&args.audit_dir, args.log_to_stderr)?;

    let config = BrokerConfig::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;
    let registry_file = RegistryFile::load(&config.registry_path)?;
    let registry = Registry::build(registry_file, &config.policy.denied_patterns)
        .with_context(|| format!("invalid registry {}", config.registry_path.display()))?;
    tracing::info!(
        event = "registry.loaded",
        path = %config.registry_path.display(),
        commands = registry.len(),
    );
    let registry = Arc::new(SharedRegistry::new(registry));
    let store = Arc::new(JsonFileStore::new(config.registry_path.clone()));

    let records_dir = args.audit_dir.join("records");
    std::fs::create_dir_all(&records_dir)
        .with_context(|| format!("failed to create {}", records_dir.display()))?;
    let audit = Arc::new(FileAuditSink::new(records_dir));
    let transport = Arc::new(SshTransport::from_config(&config.ssh, &config.limits));

    let coordinator = Arc::new(ExecutionCoordinator::new(
        &config, registry, store, transport, audit,
    )?);

    let shutdown = CancellationToken::new();
    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    spawn_control_server(&args.control_addr, Arc::clone(&coordinator), shutdown.clone()).await?;
    let server = tokio::spawn(fleetgate::server::serve(
        listener,
        coordinator,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!(event = "shutdown.requested");
    shutdown.cancel();
    server.await.context("server task panicked")??;
    Ok(())
}
