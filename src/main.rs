use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use ai_delegate::api::task_routes;
use ai_delegate::channels::{LogNotifier, NotifierRegistry, TelegramNotifier};
use ai_delegate::config::QueueConfig;
use ai_delegate::executors::{ExecutorRegistry, ShellExecutor};
use ai_delegate::notify::NotificationDispatcher;
use ai_delegate::store::{LibSqlBackend, TaskStore};
use ai_delegate::worker::WorkerPool;

/// Channels whose callers read results from the store or the log.
const LOG_CHANNELS: &[&str] = &["api", "ui", "webhook", "cli"];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = QueueConfig::from_env().context("invalid configuration")?;

    eprintln!("📬 AI Delegate v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Workers: {} (poll {}ms, retry {}ms..{}ms)",
        config.worker.max_concurrent,
        config.worker.poll_interval.as_millis(),
        config.worker.retry.base.as_millis(),
        config.worker.retry.cap.as_millis()
    );
    eprintln!(
        "   Ack gating: fallback {}s, grace {}ms",
        config.tuning.ack_fallback.as_secs(),
        config.tuning.ack_grace.as_millis()
    );
    eprintln!(
        "   Delegation cap: {} new tasks per turn; notify send timeout {}s",
        config.max_delegations,
        config.notify.send_timeout.as_secs()
    );

    // ── Store ─────────────────────────────────────────────────────────────
    let backend = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", config.db_path.display()))?
        .with_tuning(config.tuning);
    let store: Arc<dyn TaskStore> = Arc::new(backend);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Executors ─────────────────────────────────────────────────────────
    let executors = Arc::new(ExecutorRegistry::new());
    executors.register_sync(Arc::new(
        ShellExecutor::new().with_timeout(config.shell_timeout),
    ));
    eprintln!("   Executors: {}", executors.agents().await.join(", "));

    // ── Notifiers ─────────────────────────────────────────────────────────
    let notifiers = Arc::new(NotifierRegistry::new());
    for channel in LOG_CHANNELS {
        notifiers.register(Arc::new(LogNotifier::new(*channel))).await;
    }
    if let Some(token) = config.telegram_bot_token.clone() {
        let telegram = TelegramNotifier::new(token).with_timeout(config.notify.send_timeout);
        notifiers.register(Arc::new(telegram)).await;
    }
    eprintln!("   Channels: {}", notifiers.channels().await.join(", "));

    // ── Pollers ───────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&store),
        executors,
        config.worker.clone(),
    ));
    let mut handles = pool.start(shutdown_rx.clone()).await;

    let dispatcher = Arc::new(NotificationDispatcher::new(
        Arc::clone(&store),
        notifiers,
        config.notify.clone(),
    ));
    handles.push(dispatcher.start(shutdown_rx.clone()));

    // ── Admin API ─────────────────────────────────────────────────────────
    let app = task_routes(Arc::clone(&store));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    eprintln!("   Admin API: http://0.0.0.0:{}/api/tasks\n", config.http_port);
    tracing::info!(port = config.http_port, "Admin API server started");

    let mut server_shutdown = shutdown_rx;
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    eprintln!("\n   Shutting down; waiting for in-flight tasks...");
    shutdown_tx.send(true).ok();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Background loop ended abnormally");
        }
    }
    server
        .await
        .context("admin API task panicked")?
        .context("admin API server failed")?;

    eprintln!("   Bye.");
    Ok(())
}
