use clap::Parser;
use pacer::adapters::campaigns::{
    self, CampaignRegistry, SpendLog, SqlxCampaignSource,
};
use pacer::adapters::counter_store::RedisCounterStore;
use pacer::adapters::health_handler::HealthHandler;
use pacer::adapters::metrics_handler::{MetricsCollector, MetricsHandler};
use pacer::adapters::pacing_handler::PacingHandler;
use pacer::adapters::tracker::ResilientBudgetTracker;
use pacer::application::decision::DecisionEngine;
use pacer::cli::Cli;
use pacer::config::Settings;
use pacer::domain::{BreakerConfig, CampaignSource, CircuitBreakerManager};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt::init();

    let settings = Settings::new_with_cli(&cli)?;
    let tz = settings.tracker.timezone()?;

    info!(
        host = %settings.server.host,
        port = settings.server.port,
        timezone = %settings.tracker.timezone,
        "starting pacer service"
    );

    // Relational store: fatal if unreachable at startup.
    let pool = campaigns::connect_database(
        &settings.database.url,
        settings.database.max_connections,
    )
    .await?;

    // Counter store: never fatal. A down store means degraded decisions,
    // not a dead service.
    let counter_store = Arc::new(RedisCounterStore::new(&settings.counter_store)?);

    let tracker = ResilientBudgetTracker::new(
        counter_store,
        &settings.tracker,
        tz,
        Duration::from_secs(settings.counter_store.probe_interval_secs),
    );

    let breakers = Arc::new(CircuitBreakerManager::new(BreakerConfig::from(
        &settings.breaker,
    )));

    // Campaign registry: initial load plus periodic refresh.
    let registry = Arc::new(CampaignRegistry::new());
    let source: Arc<dyn CampaignSource> = Arc::new(SqlxCampaignSource::new(pool.clone()));
    match registry.refresh_from(source.as_ref()).await {
        Ok(count) => info!(campaigns = count, "loaded active campaigns"),
        Err(err) => warn!(error = %err, "failed to load campaigns, starting with an empty set"),
    }
    tracker.set_campaign_budgets(registry.budgets().await).await;

    {
        let tracker = tracker.clone();
        let rt = tokio::runtime::Handle::current();
        campaigns::spawn_refresh_task(
            registry.clone(),
            source,
            Duration::from_secs(settings.campaign_refresh_secs),
            move |budgets| {
                let tracker = tracker.clone();
                rt.spawn(async move {
                    tracker.set_campaign_budgets(budgets).await;
                });
            },
        );
    }

    let spend_log = Arc::new(SpendLog::new(pool, tz));
    let engine = Arc::new(DecisionEngine::new(
        registry,
        tracker.clone(),
        breakers,
        Some(spend_log),
    ));

    let metrics_collector = Arc::new(MetricsCollector::new()?);
    let pacing_handler = Arc::new(PacingHandler::new(engine, metrics_collector.clone()));
    let health_handler = Arc::new(HealthHandler::new(tracker));
    let metrics_handler = Arc::new(MetricsHandler::new(metrics_collector));

    let app = pacer::create_app(
        pacing_handler,
        health_handler,
        metrics_handler,
        settings.rate_limit.as_ref(),
    );

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port).parse()?;
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
