/// Tick validation, buffering and hand-off to storage and fan-out
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::data::store::MarketStore;
use crate::data::tick_buffer::ConcurrentTickBuffer;
use crate::error::{FlowError, Result};
use crate::events::{Broadcaster, Channel, StreamMessage};
use crate::types::{RawTick, Tick};

pub struct TickProcessor {
    store: Arc<dyn MarketStore>,
    bus: Arc<Broadcaster>,
    buffer: ConcurrentTickBuffer,
    processed: AtomicU64,
    rejected: AtomicU64,
    persist_failures: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessorStats {
    pub ticks_processed: u64,
    pub errors: u64,
    pub persist_failures: u64,
    pub buffer_sizes: HashMap<String, usize>,
    pub total_buffered: usize,
}

impl TickProcessor {
    pub fn new(store: Arc<dyn MarketStore>, bus: Arc<Broadcaster>, buffer_capacity: usize) -> Self {
        TickProcessor {
            store,
            bus,
            buffer: ConcurrentTickBuffer::new(buffer_capacity),
            processed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
        }
    }

    /// Validate, stamp, buffer, persist and publish one tick.
    /// Rejected ticks are counted and never forwarded.
    pub async fn process_tick(&self, raw: RawTick) -> Result<Tick> {
        let tick = match validate(raw) {
            Ok(tick) => tick,
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Rejected tick: {} ({})", e, e.error_code());
                return Err(e);
            }
        };

        self.buffer.push(tick.clone()).await;

        if let Err(e) = self.store.add_tick(tick.clone()).await {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            warn!(symbol = %tick.symbol, "Failed to persist tick: {} ({})", e, e.error_code());
        }

        let receivers = self
            .bus
            .publish(Channel::MarketData, StreamMessage::Tick(tick.clone()))
            .await;

        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if processed % 1_000 == 0 {
            debug!(
                "Processed {} ticks (latest {} @ {:.2}, {} receivers)",
                processed, tick.symbol, tick.price, receivers
            );
        }

        Ok(tick)
    }

    /// Up to `count` ticks for `symbol`, most recent first. Falls back to the
    /// local buffer when the store cannot answer.
    pub async fn get_recent_ticks(&self, symbol: &str, count: usize) -> Vec<Tick> {
        match self.store.get_recent_ticks(symbol, count).await {
            Ok(ticks) => ticks,
            Err(e) => {
                warn!(symbol = %symbol, "Store read failed, serving buffered ticks: {}", e);
                self.buffer.get_recent(symbol, count).await
            }
        }
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> ProcessorStats {
        let buffer_sizes = self.buffer.sizes().await;
        let total_buffered = buffer_sizes.values().sum();

        ProcessorStats {
            ticks_processed: self.processed_count(),
            errors: self.error_count(),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            buffer_sizes,
            total_buffered,
        }
    }
}

/// Check required fields and build a stamped `Tick`
pub fn validate(raw: RawTick) -> Result<Tick> {
    let mut missing = Vec::new();

    let symbol = raw.symbol.filter(|s| !s.trim().is_empty());
    if symbol.is_none() {
        missing.push("symbol");
    }
    if raw.price.is_none() {
        missing.push("price");
    }
    if raw.quantity.is_none() {
        missing.push("quantity");
    }
    if raw.timestamp.is_none() {
        missing.push("timestamp");
    }

    match (symbol, raw.price, raw.quantity, raw.timestamp) {
        (Some(symbol), Some(price), Some(quantity), Some(timestamp)) => {
            if !price.is_finite() || !quantity.is_finite() {
                return Err(FlowError::Validation(format!(
                    "non-finite price/quantity for {}: {} / {}",
                    symbol, price, quantity
                )));
            }

            Ok(Tick {
                symbol: symbol.to_uppercase(),
                price,
                quantity,
                timestamp,
                trade_id: raw.trade_id.unwrap_or(0),
                is_buyer_maker: raw.is_buyer_maker.unwrap_or(false),
                processed_at: Utc::now(),
            })
        }
        _ => Err(FlowError::Validation(format!(
            "Missing required field(s): {}",
            missing.join(", ")
        ))),
    }
}
