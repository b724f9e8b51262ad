//! FlashGate server binary.
//!
//! Wires the in-memory cache, the session registry and the command
//! executor together and accepts client connections until Ctrl+C.

use clap::Parser;
use flashgate::commands::{
    CommandExecutor, CommandServices, CommandStats, InitializeHandler, TracingAuditSink,
};
use flashgate::config::{Cli, ServerConfig};
use flashgate::connection::{handle_connection, ConnectionStats};
use flashgate::session::{EventHub, SessionRegistry};
use flashgate::storage::{start_expiry_sweeper, MemoryCache, MemoryCatalog};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn print_banner(config: &ServerConfig) {
    println!(
        r#"
FlashGate v{} - Client Command Gate for an In-Memory Cache
──────────────────────────────────────────────────────────────
Serving cache '{}' ({}) on {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        flashgate::VERSION,
        config.cache_id,
        config.cache_type,
        config.bind_address()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::from(&cli);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    print_banner(&config);

    let events = Arc::new(EventHub::new());
    let cache = Arc::new(MemoryCache::new(config.cache_config()).with_events(Arc::clone(&events)));
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add(Arc::clone(&cache));
    info!(cache_id = %config.cache_id, "Cache initialized with 64 shards");

    let _sweeper = start_expiry_sweeper(Arc::clone(&cache));
    info!("Background expiry sweeper started");

    let registry = Arc::new(SessionRegistry::new());
    let initialize = InitializeHandler::new(
        catalog,
        Arc::clone(&registry),
        events,
        config.request_logging_enabled,
        config.deployment_policy(),
    )
    .with_event_push(config.event_push_enabled);
    let mut services = CommandServices::new(Arc::new(CommandStats::new()));
    if config.request_logging_enabled {
        services = services.with_audit(Arc::new(TracingAuditSink));
    }
    let executor = Arc::new(CommandExecutor::new(initialize, services));
    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("Listening on {}", config.bind_address());

    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping server..."),
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    };

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&executor), Arc::clone(&stats), config.event_push_enabled) => {}
        _ = shutdown => {}
    }

    info!(
        connections = stats.connections_accepted.load(Ordering::Relaxed),
        commands = stats.commands_processed.load(Ordering::Relaxed),
        events = stats.events_pushed.load(Ordering::Relaxed),
        sessions = registry.len(),
        "Server shutdown complete"
    );
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    executor: Arc<CommandExecutor>,
    stats: Arc<ConnectionStats>,
    event_push: bool,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let executor = Arc::clone(&executor);
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    handle_connection(stream, addr, executor, stats, event_push).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
