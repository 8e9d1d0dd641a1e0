/// Recent-window market store - bounded tick and bar history per key
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::types::{Bar, StorageConfig, Tick, Timeframe};

/// Time-ordered storage collaborator for ticks and bars
pub trait MarketStore: Send + Sync {
    fn add_tick(&self, tick: Tick) -> BoxFuture<'_, Result<()>>;

    /// Up to `count` ticks, most recent first
    fn get_recent_ticks<'a>(&'a self, symbol: &'a str, count: usize) -> BoxFuture<'a, Result<Vec<Tick>>>;

    /// Upsert keyed by (symbol, interval, bucket start)
    fn store_ohlc(&self, bar: Bar) -> BoxFuture<'_, Result<()>>;

    /// Up to `count` bars, most recent first
    fn get_ohlc<'a>(
        &'a self,
        symbol: &'a str,
        interval: Timeframe,
        count: usize,
    ) -> BoxFuture<'a, Result<Vec<Bar>>>;
}

/// In-process implementation. Every append+trim happens under one write lock.
pub struct InMemoryMarketStore {
    ticks: Arc<RwLock<HashMap<String, VecDeque<Tick>>>>,
    bars: Arc<RwLock<HashMap<(String, Timeframe), BTreeMap<i64, Bar>>>>,
    max_ticks: usize,
    max_bars: usize,
}

impl InMemoryMarketStore {
    pub fn new(max_ticks: usize, max_bars: usize) -> Self {
        InMemoryMarketStore {
            ticks: Arc::new(RwLock::new(HashMap::new())),
            bars: Arc::new(RwLock::new(HashMap::new())),
            max_ticks: max_ticks.max(1),
            max_bars: max_bars.max(1),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.max_ticks, config.max_bars)
    }

    pub async fn bar_count(&self, symbol: &str, interval: Timeframe) -> usize {
        let bars = self.bars.read().await;
        bars.get(&(symbol.to_string(), interval))
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

impl MarketStore for InMemoryMarketStore {
    fn add_tick(&self, tick: Tick) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut ticks = self.ticks.write().await;
            let window = ticks.entry(tick.symbol.clone()).or_default();

            window.push_back(tick);
            while window.len() > self.max_ticks {
                window.pop_front();
            }

            Ok(())
        })
    }

    fn get_recent_ticks<'a>(&'a self, symbol: &'a str, count: usize) -> BoxFuture<'a, Result<Vec<Tick>>> {
        Box::pin(async move {
            let ticks = self.ticks.read().await;
            Ok(ticks
                .get(symbol)
                .map(|w| w.iter().rev().take(count).cloned().collect())
                .unwrap_or_default())
        })
    }

    fn store_ohlc(&self, bar: Bar) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut bars = self.bars.write().await;
            let series = bars.entry((bar.symbol.clone(), bar.interval)).or_default();

            let replaced = series.insert(bar.timestamp, bar).is_some();
            while series.len() > self.max_bars {
                series.pop_first();
            }

            if replaced {
                debug!("Overwrote stored bar - series length {}", series.len());
            }

            Ok(())
        })
    }

    fn get_ohlc<'a>(
        &'a self,
        symbol: &'a str,
        interval: Timeframe,
        count: usize,
    ) -> BoxFuture<'a, Result<Vec<Bar>>> {
        Box::pin(async move {
            let bars = self.bars.read().await;
            Ok(bars
                .get(&(symbol.to_string(), interval))
                .map(|s| s.values().rev().take(count).cloned().collect())
                .unwrap_or_default())
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::FlowError;

    /// Store whose every call fails
    pub struct FailingStore;

    fn offline<T>() -> Result<T> {
        Err(FlowError::Persistence("store offline".into()))
    }

    impl MarketStore for FailingStore {
        fn add_tick(&self, _tick: Tick) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { offline() })
        }

        fn get_recent_ticks<'a>(&'a self, _symbol: &'a str, _count: usize) -> BoxFuture<'a, Result<Vec<Tick>>> {
            Box::pin(async { offline() })
        }

        fn store_ohlc(&self, _bar: Bar) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { offline() })
        }

        fn get_ohlc<'a>(
            &'a self,
            _symbol: &'a str,
            _interval: Timeframe,
            _count: usize,
        ) -> BoxFuture<'a, Result<Vec<Bar>>> {
            Box::pin(async { offline() })
        }
    }

    /// In-memory store whose `store_ohlc` parks until released
    pub struct GatedStore {
        pub inner: InMemoryMarketStore,
        pub entered: tokio::sync::Notify,
        pub release: tokio::sync::Notify,
    }

    impl GatedStore {
        pub fn new() -> Self {
            GatedStore {
                inner: InMemoryMarketStore::new(100, 100),
                entered: tokio::sync::Notify::new(),
                release: tokio::sync::Notify::new(),
            }
        }
    }

    impl MarketStore for GatedStore {
        fn add_tick(&self, tick: Tick) -> BoxFuture<'_, Result<()>> {
            self.inner.add_tick(tick)
        }

        fn get_recent_ticks<'a>(&'a self, symbol: &'a str, count: usize) -> BoxFuture<'a, Result<Vec<Tick>>> {
            self.inner.get_recent_ticks(symbol, count)
        }

        fn store_ohlc(&self, bar: Bar) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.entered.notify_one();
                self.release.notified().await;
                self.inner.store_ohlc(bar).await
            })
        }

        fn get_ohlc<'a>(
            &'a self,
            symbol: &'a str,
            interval: Timeframe,
            count: usize,
        ) -> BoxFuture<'a, Result<Vec<Bar>>> {
            self.inner.get_ohlc(symbol, interval, count)
        }
    }
}
