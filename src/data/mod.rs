pub mod bar_aggregator;
pub mod store;
pub mod tick_buffer;
pub mod tick_processor;

pub use bar_aggregator::{AggregatorStats, BarAggregator};
pub use store::{InMemoryMarketStore, MarketStore};
pub use tick_buffer::{ConcurrentTickBuffer, TickBuffer};
pub use tick_processor::{ProcessorStats, TickProcessor};
