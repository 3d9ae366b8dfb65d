mod api;
mod cache;
mod config;
mod dispatcher;
mod error;
mod event;
mod insights;
mod invoice;
mod npub;
mod pool;
mod registry;
mod router;
mod scanner;
mod store;
mod timing;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use api::ApiContext;
use cache::InsightCache;
use config::Settings;
use dispatcher::{DispatchConfig, Dispatcher};
use pool::{FrameBuffer, PoolConfig, PoolHealth};
use registry::TenantRegistry;
use router::EventRouter;
use scanner::Scanner;
use store::Store;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "deepclaw",
    author,
    version,
    about = "Multi-tenant Nostr analytics and webhook service"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the database schema.
    Init,
    /// Run relay ingestion, webhook delivery, and the HTTP API.
    Serve,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::new(&cfg.database_path)?;
    match cli.command {
        Commands::Init => {
            store.init()?;
        }
        Commands::Serve => {
            store.init()?;
            serve(cfg, store).await?;
        }
    }
    Ok(())
}

/// Wire up all worker roles and serve until interrupted.
async fn serve(cfg: Settings, store: Store) -> anyhow::Result<()> {
    let registry = Arc::new(TenantRegistry::new());
    if let Err(e) = registry.reload(&store) {
        warn!("initial tenant registry load failed: {e:#}");
    }
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // relay pool -> router hand-off
    let pool_cfg = PoolConfig {
        relays: cfg.relays.clone(),
        ..Default::default()
    };
    let buffer = FrameBuffer::new(pool_cfg.buffer_capacity);
    let pool_health = Arc::new(PoolHealth::default());
    let pool_task = tokio::spawn(pool::run(
        pool_cfg,
        registry.clone(),
        buffer.clone(),
        pool_health.clone(),
        shutdown_rx.clone(),
    ));

    let event_router = EventRouter::new(store.clone(), registry.clone());
    let dispatch_notify = event_router.dispatch_notify.clone();
    let router_task = tokio::spawn(event_router.run(buffer, shutdown_rx.clone()));

    let dispatch_cfg = DispatchConfig {
        timeout: Duration::from_millis(cfg.webhook_timeout_ms),
        max_attempts: cfg.webhook_retries,
        ..Default::default()
    };
    let dispatcher = Dispatcher::new(store.clone(), dispatch_cfg, dispatch_notify.clone());
    let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_rx.clone()));
    let summary_task = tokio::spawn(dispatcher::daily_summary_task(
        store.clone(),
        dispatch_notify.clone(),
        Duration::from_secs(3_600),
        shutdown_rx.clone(),
    ));
    let registry_task = tokio::spawn(registry::reload_task(
        registry.clone(),
        store.clone(),
        Duration::from_secs(cfg.registry_reload_secs),
        shutdown_rx.clone(),
    ));

    let ctx = Arc::new(ApiContext {
        store: store.clone(),
        cache: InsightCache::new(store.clone()),
        scanner: Scanner::new(
            cfg.relays.clone(),
            Duration::from_secs(cfg.relay_query_timeout_secs),
        ),
        registry,
        pool_health,
        dispatch_notify,
        rate_limit_free: cfg.rate_limit_free,
        rate_limit_premium: cfg.rate_limit_premium,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let api_shutdown = {
        let mut rx = shutdown_rx.clone();
        async move {
            let _ = rx.changed().await;
        }
    };
    let api_task = tokio::spawn(api::serve(addr, ctx, api_shutdown));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for task in [pool_task, router_task, dispatcher_task, summary_task, registry_task] {
        let _ = task.await;
    }
    api_task.await??;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deepclaw=info".into()),
        )
        .init();
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, net::TcpListener, sync::Mutex, time::Duration};
    use tempfile::TempDir;
    use tokio::task;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_vars() {
        for v in [
            "DATABASE_PATH",
            "HTTP_PORT",
            "RELAYS",
            "WEBHOOK_TIMEOUT_MS",
            "WEBHOOK_RETRIES",
            "RATE_LIMIT_FREE",
            "RATE_LIMIT_PREMIUM",
            "REGISTRY_RELOAD_SECS",
            "RELAY_QUERY_TIMEOUT_SECS",
        ] {
            std::env::remove_var(v);
        }
    }

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn write_env(dir: &TempDir, port: u16) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "DATABASE_PATH={}\nHTTP_PORT={}\nRELAYS=ws://127.0.0.1:9\n",
            dir.path().join("deepclaw.db").display(),
            port
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn run_init_creates_database() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, 0);
        run(Cli {
            env: env_file,
            command: Commands::Init,
        })
        .await
        .unwrap();
        assert!(dir.path().join("deepclaw.db").exists());
    }

    #[tokio::test]
    async fn run_serve_answers_health() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let port = free_port();
        let env_file = write_env(&dir, port);

        let handle = task::spawn(run(Cli {
            env: env_file,
            command: Commands::Serve,
        }));
        tokio::time::sleep(Duration::from_millis(300)).await;
        let url = format!("http://127.0.0.1:{port}/health");
        let resp = reqwest::get(&url).await.unwrap();
        assert!(resp.status().is_success());
        let body: serde_json::Value = resp.json().await.unwrap();
        // the only configured relay is unreachable, so the pool is degraded
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["relays_total"], 1);
        handle.abort();
    }
}
