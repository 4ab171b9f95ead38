//! Gravity dispatcher server.
//!
//! Connects to NATS, loads product settings from the domain's KV store,
//! starts a subscriber per enabled product, and keeps following
//! configuration changes until SIGINT/SIGTERM, then drains.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gravity_dispatch::bus::nats::{NatsBus, NatsDeadLetterSink};
use gravity_dispatch::bus::{BusConsumer, ConfigStore, EventPublisher};
use gravity_dispatch::dlq::DeadLetterSink;
use gravity_dispatch::{
    ConfigWatcher, DispatcherConfig, ProcessorConfig, ProductLifecycle, RuleManager,
    SubscriberManager,
};
use gravity_record::JsonCodec;

#[derive(Debug, Parser)]
#[command(name = "gravity-dispatcher", version, about = "Gravity data-products dispatcher")]
struct Args {
    /// NATS server URL.
    #[arg(long, env = "GRAVITY_NATS_URL", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,

    /// Gravity domain; scopes subjects, streams, and the config store.
    #[arg(long, env = "GRAVITY_DOMAIN", default_value = "default")]
    domain: String,

    /// Transform/emit workers per product (defaults to the CPU count).
    #[arg(long)]
    worker_count: Option<usize>,

    /// Admission queue depth per product.
    #[arg(long, default_value_t = 1024)]
    queue_depth: usize,

    /// Wall-clock budget per transform script invocation, in milliseconds.
    #[arg(long, default_value_t = 500)]
    script_timeout_ms: u64,

    /// How long a drain waits for in-flight messages, in seconds.
    #[arg(long, default_value_t = 30)]
    drain_timeout_secs: u64,

    /// Log filter when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn dispatcher_config(&self) -> DispatcherConfig {
        let mut processor = ProcessorConfig::default()
            .with_queue_depth(self.queue_depth)
            .with_script_timeout(Duration::from_millis(self.script_timeout_ms));
        if let Some(workers) = self.worker_count {
            processor = processor.with_worker_count(workers);
        }
        DispatcherConfig {
            domain: self.domain.clone(),
            processor,
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            ..DispatcherConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    info!(
        nats_url = %args.nats_url,
        domain = %args.domain,
        "gravity dispatcher starting"
    );

    let bus = NatsBus::connect(&args.nats_url, &args.domain)
        .await
        .context("bus connection failed")?;
    bus.ensure_event_stream()
        .await
        .context("event stream setup failed")?;
    let store = Arc::new(bus.product_store().await.context("config store setup failed")?)
        as Arc<dyn ConfigStore>;

    let rule_manager = Arc::new(RuleManager::new());
    let manager = SubscriberManager::new(
        Arc::new(bus.clone()) as Arc<dyn BusConsumer>,
        Arc::new(bus.clone()) as Arc<dyn EventPublisher>,
        Arc::new(JsonCodec::new()),
        Arc::new(NatsDeadLetterSink::new(bus.clone())) as Arc<dyn DeadLetterSink>,
        Arc::clone(&rule_manager),
        args.dispatcher_config(),
    );
    let lifecycle = Arc::clone(&manager) as Arc<dyn ProductLifecycle>;

    let watcher = ConfigWatcher::new(store, rule_manager);
    watcher
        .load_existing(&lifecycle)
        .await
        .context("initial product load failed")?;
    info!(
        products = manager.active_products().await.len(),
        "initial products loaded"
    );

    let shutdown = Arc::new(Notify::new());
    let watcher_task = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { watcher.run(lifecycle, shutdown).await })
    };

    wait_for_signal().await;
    info!("shutdown signal received, draining");

    shutdown.notify_one();
    match watcher_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "config watcher failed"),
        Err(e) => error!(error = %e, "config watcher panicked"),
    }
    manager.shutdown().await;

    info!("gravity dispatcher stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "SIGTERM handler setup failed");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
