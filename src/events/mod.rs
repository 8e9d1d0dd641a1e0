pub mod broadcaster;
pub mod types;

pub use broadcaster::{Broadcaster, BroadcastStats, Subscription};
pub use types::{Channel, StreamMessage};
