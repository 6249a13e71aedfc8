use clap::{Parser, ValueEnum};
use signoff_core::StorageConfig;
use signoff_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "signoffd", version, about = "Approval workflow orchestration REST service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8093
    #[arg(long, default_value = "127.0.0.1:8093")]
    listen: SocketAddr,
    /// Storage backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "SIGNOFF_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for approval record persistence.
    #[arg(long, env = "SIGNOFF_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "SIGNOFF_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Tenant whose pending SLA timers are rehydrated at startup.
    #[arg(long, env = "SIGNOFF_REHYDRATE_TENANT")]
    rehydrate_tenant: Option<String>,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StorageConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StorageConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => {
            if let Some(database_url) = resolved_url {
                StorageConfig::postgres(database_url, cli.pg_max_connections)
            } else {
                StorageConfig::Memory
            }
        }
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "signoff_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    let state = ServiceState::bootstrap(ServiceConfig { storage }).await?;

    // Durable backends may hold open tasks from before the restart;
    // their timers only exist in process memory and must be re-derived.
    if let Some(tenant) = &cli.rehydrate_tenant {
        let summary = state.sla.rehydrate_pending_timers(tenant).await?;
        info!(
            %tenant,
            scanned = summary.scanned,
            reminders = summary.reminders_scheduled,
            escalations = summary.escalations_scheduled,
            "startup SLA timer rehydration finished"
        );
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("signoff-service listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
