/// Application context - builds every component from `Config` and owns the task lifecycle
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::alerting::{
    default_rules, AlertEngine, AlertEngineStats, AlertRule, AlertStore, InMemoryAlertStore, JsonlAlertStore,
    SnapshotCache,
};
use crate::analytics::BarMetrics;
use crate::config::validate_config;
use crate::data::{AggregatorStats, BarAggregator, InMemoryMarketStore, MarketStore, ProcessorStats, TickProcessor};
use crate::error::{FlowError, Result};
use crate::events::{BroadcastStats, Broadcaster, Channel, StreamMessage, Subscription};
use crate::feed::{FeedClient, FeedConnector, FeedStats, TungsteniteConnector};
use crate::types::{Config, RawTick};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct AppStats {
    pub feed: FeedStats,
    pub processor: ProcessorStats,
    pub aggregator: AggregatorStats,
    pub broadcast: BroadcastStats,
    pub alerts: AlertEngineStats,
}

pub struct MarketApp {
    config: Arc<Config>,
    bus: Arc<Broadcaster>,
    store: Arc<dyn MarketStore>,
    processor: Arc<TickProcessor>,
    aggregator: Arc<BarAggregator>,
    snapshots: Arc<SnapshotCache>,
    alerts: Arc<AlertEngine>,
    feed: Arc<FeedClient>,
    ticks_rx: Mutex<Option<mpsc::Receiver<RawTick>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl MarketApp {
    /// Build against the live WebSocket feed
    pub fn new(config: Config) -> Result<Self> {
        Self::with_connector(config, Arc::new(TungsteniteConnector))
    }

    pub fn with_connector(config: Config, connector: Arc<dyn FeedConnector>) -> Result<Self> {
        validate_config(&config)?;
        let config = Arc::new(config);

        let bus = Arc::new(Broadcaster::from_config(&config.broadcast));
        let store: Arc<dyn MarketStore> = Arc::new(InMemoryMarketStore::from_config(&config.storage));

        let processor = Arc::new(TickProcessor::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            config.storage.tick_buffer_capacity,
        ));
        let aggregator = Arc::new(BarAggregator::new(
            config.aggregation.intervals.clone(),
            Arc::clone(&store),
            Arc::clone(&bus),
        ));

        let alert_store: Arc<dyn AlertStore> = match &config.alerts.log_path {
            Some(path) => {
                let store = JsonlAlertStore::new(path.clone());
                info!("Alerts will be logged to {}", store.path().display());
                Arc::new(store)
            }
            None => Arc::new(InMemoryAlertStore::new(config.alerts.history_cap * 10)),
        };

        let rules = if config.alerts.rules.is_empty() {
            default_rules()
        } else {
            config
                .alerts
                .rules
                .iter()
                .map(AlertRule::from_config)
                .collect::<Result<Vec<_>>>()?
        };

        let snapshots = Arc::new(SnapshotCache::new(Arc::clone(&bus)));
        let alerts = Arc::new(AlertEngine::new(
            rules,
            config.alerts.history_cap,
            Arc::clone(&snapshots),
            alert_store,
            Arc::clone(&bus),
        ));

        let (feed, ticks_rx) = FeedClient::new(&config.feed, connector);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(MarketApp {
            config,
            bus,
            store,
            processor,
            aggregator,
            snapshots,
            alerts,
            feed: Arc::new(feed),
            ticks_rx: Mutex::new(Some(ticks_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the feed, consume loop, timers, metrics consumer and tape logger
    pub async fn start(&self) -> Result<()> {
        let mut ticks_rx = self
            .ticks_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| FlowError::Internal("MarketApp already started".to_string()))?;

        info!("🚀 Starting market data pipeline");

        self.feed
            .connect(self.config.feed.symbols.clone(), self.config.feed.mode)
            .await?;

        let mut tasks = self.tasks.lock().await;

        // Feed run-loop
        let feed = Arc::clone(&self.feed);
        tasks.push((
            "feed",
            tokio::spawn(async move {
                if let Err(e) = feed.run().await {
                    error!("Feed client exited with error: {} ({})", e, e.error_code());
                }
            }),
        ));

        // Consume loop: processor -> aggregator
        let processor = Arc::clone(&self.processor);
        let aggregator = Arc::clone(&self.aggregator);
        let mut shutdown = self.shutdown_tx.subscribe();
        tasks.push((
            "consume",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        raw = ticks_rx.recv() => match raw {
                            Some(raw) => {
                                if let Ok(tick) = processor.process_tick(raw).await {
                                    aggregator.process_tick(&tick).await;
                                }
                            }
                            None => break,
                        },
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("Tick consume loop stopped");
            }),
        ));

        // Snapshot timer
        let aggregator = Arc::clone(&self.aggregator);
        let period = Duration::from_millis(self.config.aggregation.snapshot_interval_ms);
        tasks.push((
            "snapshots",
            tokio::spawn(aggregator.run_snapshots(period, self.shutdown_tx.subscribe())),
        ));

        // Alert timer
        let alerts = Arc::clone(&self.alerts);
        let period = Duration::from_millis(self.config.alerts.check_interval_ms);
        tasks.push(("alerts", tokio::spawn(alerts.run(period, self.shutdown_tx.subscribe()))));

        // Derived metrics from finalized bars
        let metrics = BarMetrics::new(&self.config.analytics, Arc::clone(&self.snapshots));
        tasks.push((
            "metrics",
            tokio::spawn(metrics.run(Arc::clone(&self.bus), self.shutdown_tx.subscribe())),
        ));

        // Tape: log finalized bars and alerts
        let bars = self.bus.subscribe(Channel::Ohlc).await;
        let alerts = self.bus.subscribe(Channel::Alerts).await;
        tasks.push((
            "tape",
            tokio::spawn(run_tape(bars, alerts, self.shutdown_tx.subscribe())),
        ));

        info!(
            mode = self.config.feed.mode.as_str(),
            "✅ Pipeline running: {} symbols, intervals {:?}",
            self.config.feed.symbols.len(),
            self.aggregator.intervals()
        );

        Ok(())
    }

    /// Stop every task, close open bars and wait for the tasks to finish
    pub async fn shutdown(&self) {
        info!(feed_connected = self.feed.is_connected().await, "Starting shutdown sequence...");

        self.feed.stop();
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for (name, mut handle) in tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "Task stopped"),
                Ok(Err(e)) => error!(task = name, "Task failed: {}", e),
                Err(_) => {
                    warn!(task = name, "Task did not stop within {:?}, aborting", SHUTDOWN_GRACE);
                    handle.abort();
                }
            }
        }

        let finalized = self.aggregator.finalize_all().await;

        let stats = self.stats().await;
        info!(
            "Shutdown complete: {} ticks processed, {} rejected, {} bars finalized ({} at shutdown), {} alerts",
            stats.processor.ticks_processed,
            stats.processor.errors,
            stats.aggregator.bars_finalized,
            finalized,
            stats.alerts.alerts_triggered
        );
    }

    pub async fn subscribe(&self, channel: Channel) -> Subscription {
        self.bus.subscribe(channel).await
    }

    pub async fn stats(&self) -> AppStats {
        AppStats {
            feed: self.feed.stats().await,
            processor: self.processor.stats().await,
            aggregator: self.aggregator.stats().await,
            broadcast: self.bus.stats().await,
            alerts: self.alerts.stats().await,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &Arc<Broadcaster> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<dyn MarketStore> {
        &self.store
    }

    pub fn processor(&self) -> &Arc<TickProcessor> {
        &self.processor
    }

    pub fn aggregator(&self) -> &Arc<BarAggregator> {
        &self.aggregator
    }

    pub fn snapshots(&self) -> &Arc<SnapshotCache> {
        &self.snapshots
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    pub fn feed(&self) -> &Arc<FeedClient> {
        &self.feed
    }
}

async fn run_tape(mut bars: Subscription, mut alerts: Subscription, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            message = bars.recv() => match message {
                Some(StreamMessage::Ohlc(bar)) if bar.is_final => {
                    info!(
                        symbol = %bar.symbol,
                        interval = %bar.interval,
                        "📊 Bar closed: O={:.2} H={:.2} L={:.2} C={:.2} V={:.4} ({} ticks)",
                        bar.open, bar.high, bar.low, bar.close, bar.volume, bar.tick_count
                    );
                }
                Some(_) => {}
                None => break,
            },
            message = alerts.recv() => match message {
                Some(StreamMessage::Alert(alert)) => {
                    info!(
                        rule = %alert.rule_name,
                        severity = alert.severity.as_str(),
                        "Alert on tape: {}",
                        alert.message
                    );
                }
                Some(_) => {}
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Tape stopped");
}
