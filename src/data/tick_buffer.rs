/// Tick buffer for real-time market data
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::types::Tick;

/// Bounded window of recent ticks per symbol
pub struct TickBuffer {
    buffers: HashMap<String, VecDeque<Tick>>,
    capacity: usize,
}

impl TickBuffer {
    pub fn new(capacity: usize) -> Self {
        TickBuffer {
            buffers: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a tick, evicting the oldest once the symbol's window is full
    pub fn push(&mut self, tick: Tick) {
        let capacity = self.capacity;
        let buffer = self
            .buffers
            .entry(tick.symbol.clone())
            .or_insert_with(|| VecDeque::with_capacity(capacity));

        if buffer.len() >= capacity {
            buffer.pop_front();
        }
        buffer.push_back(tick);
    }

    /// Up to `n` ticks for a symbol, most recent first
    pub fn get_recent(&self, symbol: &str, n: usize) -> Vec<Tick> {
        match self.buffers.get(symbol) {
            Some(buffer) => buffer.iter().rev().take(n).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.buffers.get(symbol).map(VecDeque::len).unwrap_or(0)
    }

    pub fn sizes(&self) -> HashMap<String, usize> {
        self.buffers
            .iter()
            .map(|(symbol, buffer)| (symbol.clone(), buffer.len()))
            .collect()
    }
}

/// Thread-safe tick buffer
pub struct ConcurrentTickBuffer {
    buffer: Arc<RwLock<TickBuffer>>,
}

impl ConcurrentTickBuffer {
    pub fn new(capacity: usize) -> Self {
        ConcurrentTickBuffer {
            buffer: Arc::new(RwLock::new(TickBuffer::new(capacity))),
        }
    }

    pub async fn push(&self, tick: Tick) {
        let mut buffer = self.buffer.write().await;
        buffer.push(tick);
    }

    pub async fn get_recent(&self, symbol: &str, n: usize) -> Vec<Tick> {
        let buffer = self.buffer.read().await;
        buffer.get_recent(symbol, n)
    }

    pub async fn sizes(&self) -> HashMap<String, usize> {
        let buffer = self.buffer.read().await;
        buffer.sizes()
    }
}
