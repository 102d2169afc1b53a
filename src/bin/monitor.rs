use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use topic_latency_monitor::{
    alerts::AlertManager,
    broker::websocket::WebSocketConnector,
    config::read_config_file,
    probe::{ConnectionCache, LatencyProber},
    scheduler::run_interval,
    sweep::SweepDriver,
    util::get_log_level,
};
use tracing::{info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let level = LevelFilter::from_level(get_log_level());
    let filter = filter::Targets::new().with_targets(vec![
        ("topic_latency_monitor", level),
        ("latency_monitor", level),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = Arc::new(read_config_file(&args.file)?);

    let cache = Arc::new(ConnectionCache::new(WebSocketConnector::new()));
    let prober = LatencyProber::new(cache.clone());
    let alerts = AlertManager::new(&config.name, config.alerts.clone());
    let driver = Arc::new(SweepDriver::new(prober, alerts));

    info!(
        "monitoring {} clusters every {:?}",
        config.topics.len(),
        config.sweep_interval()
    );

    let schedule = {
        let config = config.clone();
        run_interval(config.sweep_interval(), move || {
            let driver = driver.clone();
            let config = config.clone();
            async move {
                driver.run_sweep(&config).await;
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    schedule.shutdown().await?;
    cache.close_all().await;

    Ok(())
}
