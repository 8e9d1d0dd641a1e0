use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};

use tickflow::{
    data::MarketStore,
    events::{Channel, StreamMessage},
    feed::{FeedConnector, FrameStream},
    AlertSeverity, AnalyticsSnapshot, Bar, Config, FeedMode, MarketApp, Result, Timeframe,
};

const WAIT: Duration = Duration::from_secs(5);

// -----------------------
// Scripted feed
// -----------------------

/// Serves one connection with fixed frames, then holds it open
struct OneShotFeed {
    frames: Vec<String>,
    connects: AtomicUsize,
}

impl FeedConnector for OneShotFeed {
    fn connect<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<FrameStream>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let frames = stream::iter(self.frames.clone().into_iter().map(Ok)).chain(stream::pending());
            Ok(frames.boxed())
        })
    }
}

fn trade(trade_id: u64, price: f64, qty: f64, ts: i64) -> String {
    format!(
        r#"{{"stream":"btcusdt@trade","data":{{"e":"trade","t":{},"p":"{}","q":"{}","T":{},"m":false}}}}"#,
        trade_id, price, qty, ts
    )
}

fn config() -> Config {
    let mut config = Config::default();
    config.feed.base_url = "wss://feed.test".to_string();
    config.feed.mode = FeedMode::Combined;
    config.feed.symbols = vec!["BTCUSDT".to_string()];
    config.aggregation.intervals = vec![Timeframe::OneMinute];
    config.aggregation.snapshot_interval_ms = 60_000;
    config.alerts.check_interval_ms = 20;
    config
}

async fn next_final_bar(sub: &mut tickflow::events::Subscription) -> Bar {
    loop {
        match tokio::time::timeout(WAIT, sub.recv()).await {
            Ok(Some(StreamMessage::Ohlc(bar))) if bar.is_final => return bar,
            Ok(Some(_)) => continue,
            other => panic!("no final bar: {:?}", other.map(|m| m.map(|m| m.kind().to_string()))),
        }
    }
}

// -----------------------
// Tests
// -----------------------

#[tokio::test]
async fn test_ticks_flow_into_final_bars() {
    let feed = Arc::new(OneShotFeed {
        frames: vec![
            trade(1, 100.0, 1.0, 60_100),
            "{oops".to_string(),
            trade(2, 105.0, 2.0, 70_000),
            // no quantity -> rejected by validation
            r#"{"stream":"btcusdt@trade","data":{"t":9,"p":"1.0","T":75000}}"#.to_string(),
            trade(3, 98.0, 1.0, 80_000),
            trade(4, 99.0, 0.5, 120_500),
        ],
        connects: AtomicUsize::new(0),
    });

    let app = MarketApp::with_connector(config(), feed.clone()).unwrap();
    let mut bars = app.subscribe(Channel::Ohlc).await;
    let mut ticks = app.subscribe(Channel::MarketData).await;
    app.start().await.unwrap();

    let bar = next_final_bar(&mut bars).await;
    assert_eq!(bar.symbol, "BTCUSDT");
    assert_eq!(bar.timestamp, 60_000);
    assert_eq!(bar.open, 100.0);
    assert_eq!(bar.high, 105.0);
    assert_eq!(bar.low, 98.0);
    assert_eq!(bar.close, 98.0);
    assert_eq!(bar.volume, 4.0);
    assert_eq!(bar.tick_count, 3);

    // four valid ticks reached the tick channel
    for _ in 0..4 {
        let message = tokio::time::timeout(WAIT, ticks.recv()).await.unwrap().unwrap();
        assert_eq!(message.kind(), "tick");
    }

    let open = app.aggregator().current_bar("BTCUSDT", Timeframe::OneMinute).await.unwrap();
    assert_eq!(open.timestamp, 120_000);
    assert!(!open.is_final);

    let stats = app.stats().await;
    assert_eq!(stats.feed.parse_errors, 1);
    assert_eq!(stats.processor.ticks_processed, 4);
    assert_eq!(stats.processor.errors, 1);
    assert_eq!(feed.connects.load(Ordering::SeqCst), 1);

    app.shutdown().await;

    // the open bar was closed on shutdown
    let stored = app
        .store()
        .get_ohlc("BTCUSDT", Timeframe::OneMinute, 10)
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].timestamp, 120_000);
    assert!(stored.iter().all(|b| b.is_final));
}

#[tokio::test]
async fn test_snapshot_triggers_alert_broadcast() {
    let feed = Arc::new(OneShotFeed {
        frames: Vec::new(),
        connects: AtomicUsize::new(0),
    });

    let app = MarketApp::with_connector(config(), feed).unwrap();
    let mut alerts = app.subscribe(Channel::Alerts).await;
    app.start().await.unwrap();

    app.snapshots()
        .update(AnalyticsSnapshot::new().with("symbol", "BTCUSDT").with("zscore", 2.5))
        .await;

    let alert = match tokio::time::timeout(WAIT, alerts.recv()).await {
        Ok(Some(StreamMessage::Alert(alert))) => alert,
        other => panic!("expected alert, got {:?}", other.map(|m| m.map(|m| m.kind().to_string()))),
    };
    assert_eq!(alert.rule_id, "high_zscore");
    assert_eq!(alert.severity, AlertSeverity::Medium);
    assert!(alert.message.contains("BTCUSDT"));

    app.shutdown().await;

    let stats = app.alerts().stats().await;
    assert!(stats.alerts_triggered >= 1);
    assert!(stats.history_len <= app.config().alerts.history_cap);
}
