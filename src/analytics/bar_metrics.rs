/// Per-bar derived metrics feeding the analytics snapshot
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alerting::SnapshotCache;
use crate::events::{Broadcaster, Channel, StreamMessage};
use crate::types::{AnalyticsConfig, AnalyticsSnapshot, Bar, Timeframe};

#[derive(Debug, Default)]
struct SymbolHistory {
    last_close: Option<f64>,
    volumes: VecDeque<f64>,
}

/// Turns finalized bars of one interval into snapshots with price change and
/// volume-vs-average figures. Owned by a single consumer task.
pub struct BarMetrics {
    interval: Timeframe,
    volume_window: usize,
    history: HashMap<String, SymbolHistory>,
    cache: Arc<SnapshotCache>,
}

impl BarMetrics {
    pub fn new(config: &AnalyticsConfig, cache: Arc<SnapshotCache>) -> Self {
        BarMetrics {
            interval: config.metrics_interval,
            volume_window: config.volume_window.max(1),
            history: HashMap::new(),
            cache,
        }
    }

    /// Snapshot for a finalized bar of the tracked interval; `None` for anything else
    pub fn observe(&mut self, bar: &Bar) -> Option<AnalyticsSnapshot> {
        if !bar.is_final || bar.interval != self.interval {
            return None;
        }

        let history = self.history.entry(bar.symbol.clone()).or_default();

        let reference = history.last_close.unwrap_or(bar.open);
        let price_change_pct = if reference != 0.0 {
            (bar.close - reference) / reference
        } else {
            0.0
        };

        let avg_volume = if history.volumes.is_empty() {
            0.0
        } else {
            history.volumes.iter().sum::<f64>() / history.volumes.len() as f64
        };
        let volume_ratio = if avg_volume > 0.0 { bar.volume / avg_volume } else { 0.0 };

        history.last_close = Some(bar.close);
        history.volumes.push_back(bar.volume);
        while history.volumes.len() > self.volume_window {
            history.volumes.pop_front();
        }

        Some(
            AnalyticsSnapshot::new()
                .with("symbol", bar.symbol.as_str())
                .with("interval", bar.interval.as_str())
                .with("close", bar.close)
                .with("price_change_pct", price_change_pct)
                .with("volume", bar.volume)
                .with("avg_volume", avg_volume)
                .with("volume_ratio", volume_ratio)
                .with("timestamp", bar.timestamp),
        )
    }

    pub async fn on_bar(&mut self, bar: &Bar) -> bool {
        match self.observe(bar) {
            Some(snapshot) => {
                self.cache.update(snapshot).await;
                true
            }
            None => false,
        }
    }

    /// Consume the bar channel until shutdown. Resubscribes after an eviction.
    pub async fn run(mut self, bus: Arc<Broadcaster>, mut shutdown: watch::Receiver<bool>) {
        info!(interval = %self.interval, "Bar metrics consumer started");

        let mut bars = bus.subscribe(Channel::Ohlc).await;

        loop {
            tokio::select! {
                message = bars.recv() => match message {
                    Some(StreamMessage::Ohlc(bar)) => {
                        if self.on_bar(&bar).await {
                            debug!(symbol = %bar.symbol, "Analytics snapshot refreshed");
                        }
                    }
                    Some(_) => {}
                    None => {
                        warn!(
                            subscriber = bars.id(),
                            channel = bars.channel().as_str(),
                            "Bar metrics consumer was evicted, resubscribing (bars in between are lost)"
                        );
                        bars = bus.subscribe(Channel::Ohlc).await;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Bar metrics consumer stopped");
    }
}
