use std::sync::Arc;

use save_restricted_bot::api;
use save_restricted_bot::backup::MAINTENANCE_INTERVAL;
use save_restricted_bot::channels::{self, Channel, TelegramChannel};
use save_restricted_bot::clock::SystemClock;
use save_restricted_bot::commands::CommandHandler;
use save_restricted_bot::config::BotConfig;
use save_restricted_bot::context::ServiceContext;
use save_restricted_bot::platform::BotApiConnector;
use save_restricted_bot::progress::ProgressReporter;
use save_restricted_bot::store::LibSqlBackend;
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = BotConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export BOT_TOKEN=123456:ABC...");
        std::process::exit(1);
    });

    // Console plus a daily-rotated file in LOG_DIR
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "bot.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    eprintln!("🤖 Save Restricted Bot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Admin API: http://{}", config.admin_api.addr);
    eprintln!(
        "   Workers: {} total, {} per user",
        config.queue.max_concurrent_downloads, config.queue.max_user_concurrent_downloads
    );

    let backend = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);

    let telegram = Arc::new(TelegramChannel::new(
        config.telegram.bot_token.clone(),
        config.telegram.allowed_users.clone(),
    ));
    if let Err(e) = telegram.health_check().await {
        tracing::warn!(error = %e, "Telegram health check failed; continuing");
    }

    let connector = Arc::new(BotApiConnector::new(config.telegram.dump_chat_id));
    let ctx = Arc::new(ServiceContext::build(
        config.clone(),
        backend,
        connector,
        telegram.clone(),
        Arc::new(SystemClock),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reporter = ProgressReporter::new(telegram.clone(), config.queue.progress_step_percent);
    let _reporter_handle = reporter.spawn(ctx.engine.subscribe());

    let mut handles = ctx.engine.start(shutdown_rx.clone()).await?;
    handles.push(
        Arc::clone(&ctx.backups).spawn_maintenance(MAINTENANCE_INTERVAL, shutdown_rx.clone()),
    );

    {
        let ctx = Arc::clone(&ctx);
        let addr = config.admin_api.addr;
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = api::serve(ctx, addr, shutdown).await {
                tracing::error!(error = %e, "Admin API server error");
            }
        }));
    }

    {
        let handler = Arc::new(CommandHandler::new(Arc::clone(&ctx)));
        let channel: Arc<dyn Channel> = telegram;
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = channels::serve(channel, handler, shutdown).await {
                tracing::error!(error = %e, "Channel stopped with error");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    // In-flight workers keep their leases; recovery requeues them on restart.
    for handle in handles {
        let _ = handle.await;
    }
    tracing::info!("Stopped");
    Ok(())
}
