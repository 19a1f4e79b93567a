use std::sync::Arc;

use anyhow::Context;

use line_bridge::bridge::{Bridge, BridgeDeps, BridgeOptions};
use line_bridge::channels::{DiscordClient, LineClient};
use line_bridge::config::BridgeConfig;
use line_bridge::correlation::{self, CorrelationStore};
use line_bridge::delivery::DeliveryQueue;
use line_bridge::quota::{QuotaGovernor, SystemClock};
use line_bridge::webhook::bridge_routes;

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

    let config = BridgeConfig::from_env().context("Failed to load configuration")?;

    eprintln!("🌉 LINE Bridge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Routes: {}", config.routes.len());
    eprintln!(
        "   Quota: {} of {} (safety margin {})",
        config.quota.capacity(),
        config.quota.hard_limit,
        config.quota.safety_margin
    );
    eprintln!("   Webhooks: http://0.0.0.0:{}/webhook/{{line,discord}}", config.server.port);
    if config.routes.is_empty() {
        tracing::warn!("LINE_BRIDGE_ROUTES is empty; nothing will be bridged");
    }

    // ── Correlations ──────────────────────────────────────────────────────
    let correlations = CorrelationStore::load(&config.correlation).await;
    let _sweep_handle = correlation::spawn_sweep_task(
        Arc::clone(&correlations),
        config.correlation.sweep_interval,
        config.correlation.max_age_days,
    );

    // ── Quota + delivery ──────────────────────────────────────────────────
    let quota = QuotaGovernor::load(config.quota.clone(), Arc::new(SystemClock)).await;
    let line = Arc::new(LineClient::new(config.line.channel_access_token.clone()));
    let queue = DeliveryQueue::new(config.queue.clone(), Arc::clone(&quota), line);

    // ── Bridge ────────────────────────────────────────────────────────────
    let discord = Arc::new(DiscordClient::new(config.discord.bot_token.clone()));
    let bridge = Bridge::new(
        BridgeOptions::from_config(&config),
        BridgeDeps {
            correlations,
            quota,
            queue: Arc::clone(&queue),
            discord,
        },
    );
    let _report_handle = bridge.spawn_report_consumer();
    let _alert_handle = bridge.spawn_alert_forwarder();

    // ── HTTP ──────────────────────────────────────────────────────────────
    let app = bridge_routes(Arc::clone(&bridge));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.server.port))?;
    tracing::info!(port = config.server.port, "Webhook server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .context("Webhook server failed")?;

    let pending = queue.len().await;
    if pending > 0 {
        tracing::warn!(pending, "Shutting down with undelivered LINE messages");
    }
    Ok(())
}
