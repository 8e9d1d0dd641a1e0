/// Wall-clock helpers shared by the pipeline
use chrono::Utc;

/// Current time in ms since epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Whether `last_ms` lies within `window_ms` of `now_ms`
pub fn is_recent(last_ms: i64, now_ms: i64, window_ms: i64) -> bool {
    last_ms > 0 && now_ms - last_ms < window_ms
}
