/// Feed ingestion client - supervised connections with capped backoff
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::connector::{FeedConnector, FrameStream};
use super::parser::{parse_combined, parse_symbol_frame};
use crate::error::{FlowError, Result};
use crate::types::{FeedConfig, FeedMode, RawTick};
use crate::utils::time::{is_recent, now_ms};

const COMBINED_KEY: &str = "combined";
const TICK_LOG_EVERY: u64 = 100;

/// `{base}/stream?streams=btcusdt@trade/ethusdt@trade`
pub fn combined_url(base_url: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@trade", s.to_lowercase()))
        .collect();
    format!("{}/stream?streams={}", base_url.trim_end_matches('/'), streams.join("/"))
}

/// `{base}/ws/btcusdt@trade`
pub fn symbol_url(base_url: &str, symbol: &str) -> String {
    format!("{}/ws/{}@trade", base_url.trim_end_matches('/'), symbol.to_lowercase())
}

#[derive(Debug, Clone)]
struct FeedSubscription {
    symbols: Vec<String>,
    mode: FeedMode,
}

/// One supervised connection
#[derive(Debug, Clone)]
struct StreamTarget {
    key: String,
    url: String,
    /// Set for per-symbol connections
    symbol: Option<String>,
}

enum PumpExit {
    Shutdown,
    Failed(FlowError),
    ReceiverGone,
}

#[derive(Debug, Default, Clone, Copy)]
struct SymbolActivity {
    ticks: u64,
    last_tick_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedStats {
    pub mode: FeedMode,
    pub symbols: Vec<String>,
    pub tick_counts: HashMap<String, u64>,
    pub total_ticks: u64,
    pub parse_errors: u64,
    pub reconnects: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_per_symbol: Option<HashMap<String, bool>>,
}

pub struct FeedClient {
    connector: Arc<dyn FeedConnector>,
    base_url: String,
    backoff: Backoff,
    liveness_window_ms: i64,
    subscription: RwLock<Option<FeedSubscription>>,
    tx: mpsc::Sender<RawTick>,
    shutdown_tx: watch::Sender<bool>,
    connected: RwLock<HashMap<String, bool>>,
    activity: RwLock<HashMap<String, SymbolActivity>>,
    total_ticks: AtomicU64,
    parse_errors: AtomicU64,
    reconnects: AtomicU64,
}

impl FeedClient {
    /// Build a client and the receiving end of its tick channel
    pub fn new(config: &FeedConfig, connector: Arc<dyn FeedConnector>) -> (Self, mpsc::Receiver<RawTick>) {
        let (tx, rx) = mpsc::channel(config.tick_channel_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        let client = FeedClient {
            connector,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: Backoff::from_millis(config.backoff_initial_ms, config.backoff_max_ms),
            liveness_window_ms: config.liveness_window_ms,
            subscription: RwLock::new(None),
            tx,
            shutdown_tx,
            connected: RwLock::new(HashMap::new()),
            activity: RwLock::new(HashMap::new()),
            total_ticks: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        };

        (client, rx)
    }

    /// Configure which symbols to stream and how. Takes effect on `run()`.
    pub async fn connect(&self, symbols: Vec<String>, mode: FeedMode) -> Result<()> {
        let mut seen = HashSet::new();
        let symbols: Vec<String> = symbols
            .into_iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();

        if symbols.is_empty() {
            return Err(FlowError::InvalidParameter("No symbols to subscribe".to_string()));
        }

        info!(mode = mode.as_str(), "📡 Feed configured for {} symbols: {:?}", symbols.len(), symbols);

        let mut subscription = self.subscription.write().await;
        *subscription = Some(FeedSubscription { symbols, mode });

        Ok(())
    }

    /// Supervise the configured connections until `stop()` is called
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let subscription = self
            .subscription
            .read()
            .await
            .clone()
            .ok_or_else(|| FlowError::InvalidParameter("run() called before connect()".to_string()))?;

        match subscription.mode {
            FeedMode::Combined => {
                let target = StreamTarget {
                    key: COMBINED_KEY.to_string(),
                    url: combined_url(&self.base_url, &subscription.symbols),
                    symbol: None,
                };
                self.supervise(target).await;
            }
            FeedMode::PerSymbol => {
                let mut tasks = JoinSet::new();
                for symbol in &subscription.symbols {
                    let target = StreamTarget {
                        key: symbol.clone(),
                        url: symbol_url(&self.base_url, symbol),
                        symbol: Some(symbol.clone()),
                    };
                    let client = Arc::clone(&self);
                    tasks.spawn(async move { client.supervise(target).await });
                }

                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = joined {
                        error!("Feed connection task failed: {}", e);
                    }
                }
            }
        }

        info!("Feed client stopped");
        Ok(())
    }

    /// Signal every connection loop to exit at its next suspension point
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        info!("Feed stop requested");
    }

    async fn supervise(&self, target: StreamTarget) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut backoff = self.backoff.clone();
        backoff.reset();

        loop {
            if *shutdown.borrow() {
                break;
            }

            info!(stream = %target.key, "🔌 Connecting to {}", target.url);

            let connected = tokio::select! {
                _ = shutdown.changed() => break,
                result = self.connector.connect(&target.url) => result,
            };

            match connected {
                Ok(frames) => {
                    backoff.reset();
                    self.set_connected(&target.key, true).await;
                    info!(stream = %target.key, "✅ Feed connected");

                    let exit = self.pump(frames, &target, &mut shutdown).await;
                    self.set_connected(&target.key, false).await;

                    match exit {
                        PumpExit::Shutdown => break,
                        PumpExit::ReceiverGone => {
                            warn!(stream = %target.key, "Tick receiver dropped, closing feed");
                            break;
                        }
                        PumpExit::Failed(e) => {
                            warn!(stream = %target.key, "Feed connection lost: {} ({})", e, e.error_code())
                        }
                    }
                }
                Err(e) => {
                    warn!(stream = %target.key, "Feed connect failed: {} ({})", e, e.error_code());
                }
            }

            let delay = backoff.next_delay();
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            info!(stream = %target.key, "Reconnecting in {:?}", delay);

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_connected(&target.key, false).await;
        debug!(stream = %target.key, "Connection loop exited");
    }

    async fn pump(
        &self,
        mut frames: FrameStream,
        target: &StreamTarget,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => return PumpExit::Shutdown,
                frame = frames.next() => frame,
            };

            let text = match frame {
                None => return PumpExit::Failed(FlowError::Disconnected("stream closed by server".to_string())),
                Some(Ok(text)) => text,
                Some(Err(FlowError::Parse(reason))) => {
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(stream = %target.key, "Dropped undecodable frame: {}", reason);
                    continue;
                }
                Some(Err(e)) => return PumpExit::Failed(e),
            };

            let parsed = match &target.symbol {
                None => parse_combined(&text),
                Some(symbol) => parse_symbol_frame(&text, symbol),
            };

            match parsed {
                Ok(Some(raw)) => {
                    self.record_tick(&raw).await;
                    tokio::select! {
                        _ = shutdown.changed() => return PumpExit::Shutdown,
                        sent = self.tx.send(raw) => {
                            if sent.is_err() {
                                return PumpExit::ReceiverGone;
                            }
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.parse_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(stream = %target.key, "Dropped malformed message: {}", e);
                }
            }
        }
    }

    async fn record_tick(&self, raw: &RawTick) {
        self.total_ticks.fetch_add(1, Ordering::Relaxed);

        let Some(symbol) = raw.symbol.as_deref() else {
            return;
        };

        let mut activity = self.activity.write().await;
        let entry = activity.entry(symbol.to_string()).or_default();
        entry.ticks += 1;
        entry.last_tick_ms = now_ms();

        if entry.ticks % TICK_LOG_EVERY == 0 {
            debug!(
                symbol = %symbol,
                "Received {} ticks (last price {:?})",
                entry.ticks,
                raw.price
            );
        }
    }

    async fn set_connected(&self, key: &str, state: bool) {
        let mut connected = self.connected.write().await;
        connected.insert(key.to_string(), state);
    }

    fn seen_recently(&self, activity: &SymbolActivity, now: i64) -> bool {
        is_recent(activity.last_tick_ms, now, self.liveness_window_ms)
    }

    /// Transport open, or a tick seen within the liveness window
    pub async fn is_connected(&self) -> bool {
        let stats = self.stats().await;
        match (stats.connected, stats.connected_per_symbol) {
            (Some(connected), _) => connected,
            (None, Some(per_symbol)) => per_symbol.values().any(|c| *c),
            (None, None) => false,
        }
    }

    pub async fn stats(&self) -> FeedStats {
        let subscription = self.subscription.read().await.clone();
        let (symbols, mode) = match subscription {
            Some(s) => (s.symbols, s.mode),
            None => (Vec::new(), FeedMode::default()),
        };

        let connected = self.connected.read().await;
        let activity = self.activity.read().await;
        let now = now_ms();

        let tick_counts = activity
            .iter()
            .map(|(symbol, a)| (symbol.clone(), a.ticks))
            .collect();

        let (connected_flag, per_symbol) = match mode {
            FeedMode::Combined => {
                let open = connected.get(COMBINED_KEY).copied().unwrap_or(false);
                let alive = open || activity.values().any(|a| self.seen_recently(a, now));
                (Some(alive), None)
            }
            FeedMode::PerSymbol => {
                let per_symbol = symbols
                    .iter()
                    .map(|symbol| {
                        let open = connected.get(symbol).copied().unwrap_or(false);
                        let recent = activity
                            .get(symbol)
                            .map(|a| self.seen_recently(a, now))
                            .unwrap_or(false);
                        (symbol.clone(), open || recent)
                    })
                    .collect();
                (None, Some(per_symbol))
            }
        };

        FeedStats {
            mode,
            symbols,
            tick_counts,
            total_ticks: self.total_ticks.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected: connected_flag,
            connected_per_symbol: per_symbol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    enum Step {
        Fail,
        Frames(Vec<String>),
    }

    /// Plays a per-URL script of connect outcomes; fails once a script runs out
    #[derive(Default)]
    struct ScriptedConnector {
        scripts: Mutex<HashMap<String, VecDeque<Step>>>,
        attempts: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedConnector {
        fn with(url: &str, steps: Vec<Step>) -> Self {
            let connector = ScriptedConnector::default();
            connector.add(url, steps);
            connector
        }

        fn add(&self, url: &str, steps: Vec<Step>) {
            self.scripts.lock().unwrap().insert(url.to_string(), steps.into());
        }

        fn attempts_for(&self, url: &str) -> Vec<Instant> {
            self.attempts
                .lock()
                .unwrap()
                .iter()
                .filter(|(u, _)| u == url)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    impl FeedConnector for ScriptedConnector {
        fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<FrameStream>> {
            Box::pin(async move {
                self.attempts.lock().unwrap().push((url.to_string(), Instant::now()));
                let step = self
                    .scripts
                    .lock()
                    .unwrap()
                    .get_mut(url)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or(Step::Fail);

                match step {
                    Step::Fail => Err(FlowError::Transport("connection refused".into())),
                    Step::Frames(frames) => Ok(stream::iter(frames.into_iter().map(Ok)).boxed()),
                }
            })
        }
    }

    fn config() -> FeedConfig {
        FeedConfig {
            base_url: "wss://feed.test".to_string(),
            ..FeedConfig::default()
        }
    }

    fn combined_trade(symbol: &str, price: &str) -> String {
        format!(
            r#"{{"stream":"{}@trade","data":{{"e":"trade","t":1,"p":"{}","q":"1.0","T":1700000000000,"m":false}}}}"#,
            symbol.to_lowercase(),
            price
        )
    }

    #[test]
    fn test_url_building() {
        let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        assert_eq!(
            combined_url("wss://stream.binance.com:9443/", &symbols),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@trade/ethusdt@trade"
        );
        assert_eq!(
            symbol_url("wss://stream.binance.com:9443", "BNBUSDT"),
            "wss://stream.binance.com:9443/ws/bnbusdt@trade"
        );
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_symbols() {
        let (client, _rx) = FeedClient::new(&config(), Arc::new(ScriptedConnector::default()));
        let err = client.connect(vec![" ".to_string()], FeedMode::Combined).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_connect_dedups_symbols_case_insensitively() {
        let (client, _rx) = FeedClient::new(&config(), Arc::new(ScriptedConnector::default()));
        let symbols = vec!["BTCUSDT".to_string(), "ethusdt".to_string(), "btcusdt".to_string()];
        client.connect(symbols, FeedMode::PerSymbol).await.unwrap();

        let stats = client.stats().await;
        assert_eq!(stats.symbols, vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert_eq!(stats.connected_per_symbol.unwrap().len(), 2);
    }

    async fn seed_activity(client: &FeedClient, symbol: &str, age_ms: i64) {
        let mut activity = client.activity.write().await;
        activity.insert(
            symbol.to_string(),
            SymbolActivity {
                ticks: 1,
                last_tick_ms: now_ms() - age_ms,
            },
        );
    }

    #[tokio::test]
    async fn test_is_connected_combined_uses_open_flag_or_recent_tick() {
        let (client, _rx) = FeedClient::new(&config(), Arc::new(ScriptedConnector::default()));
        assert!(!client.is_connected().await);

        client.connect(vec!["BTCUSDT".to_string()], FeedMode::Combined).await.unwrap();
        assert!(!client.is_connected().await);

        client.set_connected(COMBINED_KEY, true).await;
        assert!(client.is_connected().await);

        // transport closed, tick 2s ago keeps it alive
        client.set_connected(COMBINED_KEY, false).await;
        seed_activity(&client, "BTCUSDT", 2_000).await;
        assert!(client.is_connected().await);

        // tick older than the 10s window
        seed_activity(&client, "BTCUSDT", 30_000).await;
        assert!(!client.is_connected().await);
        assert_eq!(client.stats().await.connected, Some(false));
    }

    #[tokio::test]
    async fn test_is_connected_per_symbol_reports_each_connection() {
        let (client, _rx) = FeedClient::new(&config(), Arc::new(ScriptedConnector::default()));
        let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        client.connect(symbols, FeedMode::PerSymbol).await.unwrap();
        assert!(!client.is_connected().await);

        seed_activity(&client, "BTCUSDT", 30_000).await;
        seed_activity(&client, "ETHUSDT", 1_000).await;

        let per_symbol = client.stats().await.connected_per_symbol.unwrap();
        assert_eq!(per_symbol.get("BTCUSDT"), Some(&false));
        assert_eq!(per_symbol.get("ETHUSDT"), Some(&true));
        assert!(client.is_connected().await);

        seed_activity(&client, "ETHUSDT", 30_000).await;
        assert!(!client.is_connected().await);

        client.set_connected("BTCUSDT", true).await;
        assert!(client.is_connected().await);
        assert_eq!(client.stats().await.connected, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_and_reset_after_success() {
        let url = combined_url("wss://feed.test", &["BTCUSDT".to_string()]);
        let connector = Arc::new(ScriptedConnector::with(
            &url,
            vec![
                Step::Fail,
                Step::Fail,
                Step::Fail,
                Step::Frames(vec![combined_trade("BTCUSDT", "100.5")]),
                Step::Fail,
            ],
        ));

        let (client, mut rx) = FeedClient::new(&config(), connector.clone());
        let client = Arc::new(client);
        client.connect(vec!["btcusdt".to_string()], FeedMode::Combined).await.unwrap();
        let handle = tokio::spawn(Arc::clone(&client).run());

        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.symbol.as_deref(), Some("BTCUSDT"));
        assert_eq!(tick.price, Some(100.5));

        while connector.attempts_for(&url).len() < 6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        client.stop();
        handle.await.unwrap().unwrap();

        let attempts = connector.attempts_for(&url);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).take(5).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ]
        );
        assert!(client.stats().await.reconnects >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_dropped_not_fatal() {
        let url = combined_url("wss://feed.test", &["BTCUSDT".to_string()]);
        let connector = Arc::new(ScriptedConnector::with(
            &url,
            vec![Step::Frames(vec![
                "{garbage".to_string(),
                r#"{"stream":"btcusdt@trade","data":{"p":"not-a-number"}}"#.to_string(),
                combined_trade("BTCUSDT", "101"),
            ])],
        ));

        let (client, mut rx) = FeedClient::new(&config(), connector);
        let client = Arc::new(client);
        client.connect(vec!["BTCUSDT".to_string()], FeedMode::Combined).await.unwrap();
        let handle = tokio::spawn(Arc::clone(&client).run());

        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.price, Some(101.0));

        let stats = client.stats().await;
        assert_eq!(stats.parse_errors, 2);
        assert_eq!(stats.total_ticks, 1);
        assert_eq!(stats.tick_counts.get("BTCUSDT"), Some(&1));
        // a tick just arrived, so the feed reads as live
        assert_eq!(stats.connected, Some(true));

        client.stop();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_symbol_failure_is_isolated() {
        let btc_url = symbol_url("wss://feed.test", "BTCUSDT");
        let eth_url = symbol_url("wss://feed.test", "ETHUSDT");

        let connector = Arc::new(ScriptedConnector::with(&btc_url, vec![Step::Fail, Step::Fail]));
        connector.add(
            &eth_url,
            vec![Step::Frames(vec![
                r#"{"e":"trade","t":7,"p":"2500.25","q":"0.5","T":1700000000000,"m":true}"#.to_string(),
            ])],
        );

        let (client, mut rx) = FeedClient::new(&config(), connector.clone());
        let client = Arc::new(client);
        client
            .connect(vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()], FeedMode::PerSymbol)
            .await
            .unwrap();
        let handle = tokio::spawn(Arc::clone(&client).run());

        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.symbol.as_deref(), Some("ETHUSDT"));
        assert_eq!(tick.trade_id, Some(7));

        let stats = client.stats().await;
        let per_symbol = stats.connected_per_symbol.unwrap();
        assert_eq!(per_symbol.get("ETHUSDT"), Some(&true));
        assert_eq!(per_symbol.get("BTCUSDT"), Some(&false));
        assert!(stats.connected.is_none());

        client.stop();
        handle.await.unwrap().unwrap();
        assert!(!connector.attempts_for(&btc_url).is_empty());
    }

    #[tokio::test]
    async fn test_run_requires_connect() {
        let (client, _rx) = FeedClient::new(&config(), Arc::new(ScriptedConnector::default()));
        let result = Arc::new(client).run().await;
        assert!(matches!(result, Err(FlowError::InvalidParameter(_))));
    }
}
