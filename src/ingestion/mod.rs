pub mod price_feed;
pub mod ws_ticker;

pub use price_feed::{ChannelPriceFeed, FeedHandle};
pub use ws_ticker::WsTickerFeed;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::models::PriceTick;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed connect failed: {0}")]
    Connect(String),

    #[error("feed subscribe failed: {0}")]
    Subscribe(String),

    #[error("feed stream error: {0}")]
    Stream(String),

    #[error("feed connection closed")]
    Closed,
}

/// A venue price stream. The monitor drives it: `connect`, one aggregate
/// `subscribe_all`, then `next_tick` until it errors, then reconnect.
///
/// Adapters must not retry internally; reconnect timing belongs to
/// [`ReconnectPolicy`].
#[async_trait]
pub trait PriceFeed: Send {
    async fn connect(&mut self) -> Result<(), FeedError>;

    /// Subscribe to the single all-markets ticker stream.
    async fn subscribe_all(&mut self) -> Result<(), FeedError>;

    /// Wait for the next tick. Any error ends the current connection.
    async fn next_tick(&mut self) -> Result<PriceTick, FeedError>;

    /// Close the connection. Safe to call when not connected.
    async fn disconnect(&mut self);
}

/// Reconnect scheduling, kept apart from socket I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Fixed wait before every reconnect after a drop.
    pub delay: Duration,
    /// Connections are recycled once they reach this age, ahead of the
    /// venue's own hard limit.
    pub max_connection_age: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            // 23.5h, half an hour under the usual 24h venue ceiling
            max_connection_age: Duration::from_secs(84_600),
        }
    }
}

impl ReconnectPolicy {
    /// Wait before connection attempt `attempt` (0 = first connect, which is
    /// immediate).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.delay
        }
    }

    /// When a connection opened at `connected_at` should be recycled.
    pub fn recycle_at(&self, connected_at: Instant) -> Instant {
        connected_at + self.max_connection_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(50), Duration::from_secs(5));
    }

    #[test]
    fn test_recycle_before_day_ceiling() {
        let policy = ReconnectPolicy::default();
        let connected_at = Instant::now();
        let recycle_at = policy.recycle_at(connected_at);
        assert_eq!(recycle_at - connected_at, Duration::from_secs(84_600));
        assert!(recycle_at < connected_at + Duration::from_secs(86_400));
    }
}
