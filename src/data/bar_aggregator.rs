/// Bar aggregation from live ticks
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::data::store::MarketStore;
use crate::events::{Broadcaster, Channel, StreamMessage};
use crate::types::{Bar, Tick, Timeframe};

/// Bar in progress (not yet complete)
#[derive(Debug, Clone)]
struct PartialBar {
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    tick_count: u64,
}

impl PartialBar {
    fn new(timestamp: i64, price: f64, quantity: f64) -> Self {
        PartialBar {
            timestamp,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: quantity,
            tick_count: 1,
        }
    }

    fn update(&mut self, price: f64, quantity: f64) {
        self.close = price;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.volume += quantity;
        self.tick_count += 1;
    }

    fn to_bar(&self, symbol: &str, interval: Timeframe, is_final: bool) -> Bar {
        Bar {
            symbol: symbol.to_string(),
            interval,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            tick_count: self.tick_count,
            timestamp: self.timestamp,
            is_final,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatorStats {
    pub intervals: Vec<Timeframe>,
    pub open_bars: usize,
    pub ticks_aggregated: u64,
    pub bars_finalized: u64,
    pub late_ticks_dropped: u64,
    pub persist_failures: u64,
    pub snapshots_published: u64,
}

/// Multi-symbol, multi-interval bar aggregator.
///
/// One task feeds ticks through `process_tick`; readers such as the snapshot
/// timer only ever see whole bars copied out under the lock.
pub struct BarAggregator {
    intervals: Vec<Timeframe>,
    current_bars: Arc<RwLock<HashMap<(String, Timeframe), PartialBar>>>,
    store: Arc<dyn MarketStore>,
    bus: Arc<Broadcaster>,
    ticks_aggregated: AtomicU64,
    bars_finalized: AtomicU64,
    late_ticks_dropped: AtomicU64,
    persist_failures: AtomicU64,
    snapshots_published: AtomicU64,
}

impl BarAggregator {
    pub fn new(intervals: Vec<Timeframe>, store: Arc<dyn MarketStore>, bus: Arc<Broadcaster>) -> Self {
        let mut intervals = intervals;
        intervals.sort();
        intervals.dedup();

        BarAggregator {
            intervals,
            current_bars: Arc::new(RwLock::new(HashMap::new())),
            store,
            bus,
            ticks_aggregated: AtomicU64::new(0),
            bars_finalized: AtomicU64::new(0),
            late_ticks_dropped: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            snapshots_published: AtomicU64::new(0),
        }
    }

    pub fn intervals(&self) -> &[Timeframe] {
        &self.intervals
    }

    /// Apply a tick to every tracked interval. Returns the bars it closed,
    /// already published and persisted.
    pub async fn process_tick(&self, tick: &Tick) -> Vec<Bar> {
        let mut completed = Vec::new();

        {
            let mut current = self.current_bars.write().await;

            for &interval in &self.intervals {
                let bucket = interval.bucket_start(tick.timestamp);

                match current.entry((tick.symbol.clone(), interval)) {
                    Entry::Vacant(slot) => {
                        slot.insert(PartialBar::new(bucket, tick.price, tick.quantity));
                        info!(
                            "Started first bar: {} {} @ {}",
                            tick.symbol,
                            interval.as_str(),
                            bucket
                        );
                    }
                    Entry::Occupied(mut slot) => {
                        let bar = slot.get_mut();

                        if bucket == bar.timestamp {
                            bar.update(tick.price, tick.quantity);
                        } else if bucket > bar.timestamp {
                            completed.push(bar.to_bar(&tick.symbol, interval, true));
                            *bar = PartialBar::new(bucket, tick.price, tick.quantity);
                        } else {
                            // bucket already closed, no late-bar correction
                            self.late_ticks_dropped.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                "Dropped late tick: {} {} ts={} (open bucket {})",
                                tick.symbol,
                                interval.as_str(),
                                tick.timestamp,
                                bar.timestamp
                            );
                        }
                    }
                }
            }

            // closed bars go out before any reader can copy the new bucket
            for bar in &completed {
                self.announce_final(bar.clone()).await;
            }
        }

        self.ticks_aggregated.fetch_add(1, Ordering::Relaxed);

        for bar in &completed {
            self.persist_final(bar).await;
        }

        completed
    }

    /// Count and publish a closed bar
    async fn announce_final(&self, bar: Bar) {
        self.bars_finalized.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Bar completed: {} {} @ {} - O:{:.2} H:{:.2} L:{:.2} C:{:.2} V:{:.4} N:{}",
            bar.symbol,
            bar.interval.as_str(),
            bar.timestamp,
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.tick_count
        );

        self.bus.publish(Channel::Ohlc, StreamMessage::Ohlc(bar)).await;
    }

    /// Failures are logged, never returned.
    async fn persist_final(&self, bar: &Bar) {
        if let Err(e) = self.store.store_ohlc(bar.clone()).await {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Failed to persist {} {} bar @ {}: {} ({})",
                bar.symbol,
                bar.interval.as_str(),
                bar.timestamp,
                e,
                e.error_code()
            );
        }
    }

    /// Consistent copy of the open bar for one key
    pub async fn current_bar(&self, symbol: &str, interval: Timeframe) -> Option<Bar> {
        let current = self.current_bars.read().await;
        current
            .get(&(symbol.to_string(), interval))
            .map(|b| b.to_bar(symbol, interval, false))
    }

    /// Consistent copy of every open bar
    pub async fn open_bars(&self) -> Vec<Bar> {
        let current = self.current_bars.read().await;
        let mut bars: Vec<Bar> = current
            .iter()
            .map(|((symbol, interval), b)| b.to_bar(symbol, *interval, false))
            .collect();
        bars.sort_by(|a, b| (&a.symbol, a.interval).cmp(&(&b.symbol, b.interval)));
        bars
    }

    /// Publish every open bar as a non-final snapshot. Returns how many went out.
    pub async fn publish_snapshots(&self) -> usize {
        let snapshots = self.open_bars().await;
        let count = snapshots.len();

        for bar in snapshots {
            self.bus.publish(Channel::Ohlc, StreamMessage::Ohlc(bar)).await;
        }

        if count > 0 {
            self.snapshots_published.fetch_add(count as u64, Ordering::Relaxed);
            debug!("Published {} bar snapshots", count);
        }

        count
    }

    /// Snapshot timer. Runs until `shutdown` flips to true.
    pub async fn run_snapshots(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;

        info!("Bar snapshot timer started (every {:?})", period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.publish_snapshots().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Bar snapshot timer stopped");
    }

    /// Close every open bar (e.g., at shutdown)
    pub async fn finalize_all(&self) -> usize {
        let drained: Vec<Bar> = {
            let mut current = self.current_bars.write().await;
            let drained: Vec<Bar> = current
                .drain()
                .map(|((symbol, interval), b)| b.to_bar(&symbol, interval, true))
                .collect();
            for bar in &drained {
                self.announce_final(bar.clone()).await;
            }
            drained
        };

        let count = drained.len();
        for bar in &drained {
            self.persist_final(bar).await;
        }

        info!("Finalized {} open bars", count);
        count
    }

    pub async fn stats(&self) -> AggregatorStats {
        let open_bars = self.current_bars.read().await.len();

        AggregatorStats {
            intervals: self.intervals.clone(),
            open_bars,
            ticks_aggregated: self.ticks_aggregated.load(Ordering::Relaxed),
            bars_finalized: self.bars_finalized.load(Ordering::Relaxed),
            late_ticks_dropped: self.late_ticks_dropped.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            snapshots_published: self.snapshots_published.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::test_support::{FailingStore, GatedStore};
    use crate::data::store::InMemoryMarketStore;
    use crate::events::Subscription;
    use chrono::Utc;

    fn tick(symbol: &str, price: f64, quantity: f64, timestamp: i64) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            price,
            quantity,
            timestamp,
            trade_id: 0,
            is_buyer_maker: false,
            processed_at: Utc::now(),
        }
    }

    fn setup(intervals: Vec<Timeframe>) -> (BarAggregator, Arc<InMemoryMarketStore>, Arc<Broadcaster>) {
        let store = Arc::new(InMemoryMarketStore::new(100, 100));
        let bus = Arc::new(Broadcaster::new(64, 3));
        let aggregator = BarAggregator::new(intervals, store.clone(), bus.clone());
        (aggregator, store, bus)
    }

    fn next_bar(sub: &mut Subscription) -> Option<Bar> {
        match sub.try_recv() {
            Some(StreamMessage::Ohlc(bar)) => Some(bar),
            _ => None,
        }
    }

    #[test]
    fn test_partial_bar_update() {
        let mut bar = PartialBar::new(0, 100.0, 1.0);

        bar.update(102.0, 0.5);
        assert_eq!(bar.high, 102.0);
        assert_eq!(bar.close, 102.0);

        bar.update(98.0, 0.3);
        assert_eq!(bar.low, 98.0);
        assert_eq!(bar.close, 98.0);
        assert!((bar.volume - 1.8).abs() < 1e-9);
        assert_eq!(bar.tick_count, 3);
    }

    #[tokio::test]
    async fn test_ohlcv_within_one_bucket() {
        let (aggregator, _store, _bus) = setup(vec![Timeframe::OneMinute]);

        for (price, qty, ts) in [(100.0, 1.0, 60_100), (105.0, 2.0, 75_000), (98.0, 1.0, 119_999)] {
            assert!(aggregator.process_tick(&tick("X", price, qty, ts)).await.is_empty());
        }

        let bar = aggregator.current_bar("X", Timeframe::OneMinute).await.unwrap();
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 105.0);
        assert_eq!(bar.low, 98.0);
        assert_eq!(bar.close, 98.0);
        assert_eq!(bar.volume, 4.0);
        assert_eq!(bar.tick_count, 3);
        assert_eq!(bar.timestamp, 60_000);
        assert!(!bar.is_final);
    }

    #[tokio::test]
    async fn test_rollover_emits_final_before_new_bar() {
        let (aggregator, store, bus) = setup(vec![Timeframe::OneMinute]);
        let mut sub = bus.subscribe(Channel::Ohlc).await;

        aggregator.process_tick(&tick("X", 100.0, 1.0, 90_123)).await;
        aggregator.process_tick(&tick("X", 101.0, 1.0, 100_000)).await;
        let completed = aggregator.process_tick(&tick("X", 110.0, 2.0, 120_500)).await;

        assert_eq!(completed.len(), 1);
        let published = next_bar(&mut sub).unwrap();
        assert!(published.is_final);
        assert_eq!(published.timestamp, 60_000);
        assert_eq!(published.close, 101.0);
        assert_eq!(published.tick_count, 2);

        let open = aggregator.current_bar("X", Timeframe::OneMinute).await.unwrap();
        assert!(!open.is_final);
        assert_eq!(open.timestamp, 120_000);
        assert_eq!(open.open, 110.0);

        let stored = store.get_ohlc("X", Timeframe::OneMinute, 10).await.unwrap();
        assert_eq!(stored, vec![published]);
    }

    #[tokio::test]
    async fn test_final_bar_published_before_next_bucket_snapshot() {
        let store = Arc::new(GatedStore::new());
        let bus = Arc::new(Broadcaster::new(64, 3));
        let aggregator = Arc::new(BarAggregator::new(vec![Timeframe::OneMinute], store.clone(), bus.clone()));
        let mut sub = bus.subscribe(Channel::Ohlc).await;

        aggregator.process_tick(&tick("X", 100.0, 1.0, 61_000)).await;

        // rollover parks inside store_ohlc
        let rolling = tokio::spawn({
            let aggregator = Arc::clone(&aggregator);
            let next = tick("X", 110.0, 1.0, 121_000);
            async move { aggregator.process_tick(&next).await }
        });
        store.entered.notified().await;

        assert_eq!(aggregator.publish_snapshots().await, 1);
        store.release.notify_one();
        assert_eq!(rolling.await.unwrap().len(), 1);

        let order: Vec<(i64, bool)> = std::iter::from_fn(|| next_bar(&mut sub))
            .map(|b| (b.timestamp, b.is_final))
            .collect();
        assert_eq!(order, vec![(60_000, true), (120_000, false)]);
        assert_eq!(store.inner.bar_count("X", Timeframe::OneMinute).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_timer_publishes_each_period_until_shutdown() {
        let (aggregator, _store, bus) = setup(vec![Timeframe::OneMinute]);
        let aggregator = Arc::new(aggregator);
        let mut sub = bus.subscribe(Channel::Ohlc).await;
        aggregator.process_tick(&tick("X", 100.0, 1.0, 1_000)).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let timer = tokio::spawn(Arc::clone(&aggregator).run_snapshots(Duration::from_secs(1), shutdown_rx));

        // nothing at t=0, then one per second
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(next_bar(&mut sub).is_none());

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        shutdown_tx.send(true).unwrap();
        timer.await.unwrap();

        assert_eq!(aggregator.stats().await.snapshots_published, 3);
        let snapshots: Vec<Bar> = std::iter::from_fn(|| next_bar(&mut sub)).collect();
        assert_eq!(snapshots.len(), 3);
        assert!(snapshots.iter().all(|b| !b.is_final && b.timestamp == 0));

        // stopped timer publishes nothing more
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(aggregator.stats().await.snapshots_published, 3);
    }

    #[tokio::test]
    async fn test_intervals_tracked_independently() {
        let (aggregator, _store, _bus) = setup(vec![Timeframe::OneSecond, Timeframe::OneMinute]);

        aggregator.process_tick(&tick("X", 10.0, 1.0, 1_000)).await;
        aggregator.process_tick(&tick("X", 11.0, 1.0, 1_500)).await;
        let completed = aggregator.process_tick(&tick("X", 12.0, 1.0, 2_100)).await;

        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].interval, Timeframe::OneSecond);

        let minute = aggregator.current_bar("X", Timeframe::OneMinute).await.unwrap();
        assert_eq!(minute.tick_count, 3);
        assert_eq!(minute.close, 12.0);
    }

    #[tokio::test]
    async fn test_late_tick_for_closed_bucket_is_dropped() {
        let (aggregator, _store, _bus) = setup(vec![Timeframe::OneMinute]);

        aggregator.process_tick(&tick("X", 100.0, 1.0, 61_000)).await;
        aggregator.process_tick(&tick("X", 200.0, 1.0, 121_000)).await;
        aggregator.process_tick(&tick("X", 1.0, 9.0, 65_000)).await;

        let open = aggregator.current_bar("X", Timeframe::OneMinute).await.unwrap();
        assert_eq!(open.low, 200.0);
        assert_eq!(open.tick_count, 1);
        assert_eq!(aggregator.stats().await.late_ticks_dropped, 1);
    }

    #[tokio::test]
    async fn test_out_of_order_tick_in_open_bucket_is_applied() {
        let (aggregator, _store, _bus) = setup(vec![Timeframe::OneMinute]);

        aggregator.process_tick(&tick("X", 100.0, 1.0, 70_000)).await;
        aggregator.process_tick(&tick("X", 95.0, 1.0, 61_000)).await;

        let open = aggregator.current_bar("X", Timeframe::OneMinute).await.unwrap();
        assert_eq!(open.low, 95.0);
        assert_eq!(open.close, 95.0);
        assert_eq!(open.tick_count, 2);
    }

    #[tokio::test]
    async fn test_snapshots_are_non_final() {
        let (aggregator, _store, bus) = setup(vec![Timeframe::OneMinute]);
        let mut sub = bus.subscribe(Channel::Ohlc).await;

        aggregator.process_tick(&tick("X", 100.0, 1.0, 1_000)).await;
        aggregator.process_tick(&tick("Y", 50.0, 1.0, 1_000)).await;

        assert_eq!(aggregator.publish_snapshots().await, 2);
        let first = next_bar(&mut sub).unwrap();
        let second = next_bar(&mut sub).unwrap();
        assert!(!first.is_final && !second.is_final);
        assert_eq!((first.symbol.as_str(), second.symbol.as_str()), ("X", "Y"));
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_stop_aggregation() {
        let bus = Arc::new(Broadcaster::new(64, 3));
        let aggregator = BarAggregator::new(vec![Timeframe::OneSecond], Arc::new(FailingStore), bus.clone());
        let mut sub = bus.subscribe(Channel::Ohlc).await;

        aggregator.process_tick(&tick("X", 1.0, 1.0, 1_000)).await;
        aggregator.process_tick(&tick("X", 2.0, 1.0, 2_000)).await;
        aggregator.process_tick(&tick("X", 3.0, 1.0, 3_000)).await;

        let stats = aggregator.stats().await;
        assert_eq!(stats.bars_finalized, 2);
        assert_eq!(stats.persist_failures, 2);
        // still broadcast even though the store refused them
        assert!(next_bar(&mut sub).unwrap().is_final);
        assert!(next_bar(&mut sub).unwrap().is_final);
    }

    #[tokio::test]
    async fn test_finalize_all_drains_open_bars() {
        let (aggregator, store, _bus) = setup(vec![Timeframe::OneMinute, Timeframe::FiveMinute]);
        aggregator.process_tick(&tick("X", 100.0, 1.0, 1_000)).await;

        assert_eq!(aggregator.finalize_all().await, 2);
        assert!(aggregator.open_bars().await.is_empty());
        assert_eq!(store.bar_count("X", Timeframe::FiveMinute).await, 1);
    }
}
