use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::models::PriceTick;

use super::{FeedError, PriceFeed};

enum Frame {
    Tick(PriceTick),
    Drop,
}

#[derive(Default)]
struct Counters {
    connects: AtomicUsize,
    subscribes: AtomicUsize,
}

/// In-process feed backed by an `mpsc` channel. Ticks are pushed through the
/// paired [`FeedHandle`], which can also simulate a dropped connection.
pub struct ChannelPriceFeed {
    rx: mpsc::UnboundedReceiver<Frame>,
    connected: bool,
    counters: Arc<Counters>,
}

/// Sending side of a [`ChannelPriceFeed`].
#[derive(Clone)]
pub struct FeedHandle {
    tx: mpsc::UnboundedSender<Frame>,
    counters: Arc<Counters>,
}

impl ChannelPriceFeed {
    pub fn new() -> (Self, FeedHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        (
            Self {
                rx,
                connected: false,
                counters: counters.clone(),
            },
            FeedHandle { tx, counters },
        )
    }
}

impl FeedHandle {
    /// Queue a tick. Returns `false` once the feed has been dropped.
    pub fn send(&self, pair: &str, price: Decimal) -> bool {
        self.tx.send(Frame::Tick(PriceTick::new(pair, price))).is_ok()
    }

    /// Make the feed's current connection fail on its next read.
    pub fn drop_connection(&self) -> bool {
        self.tx.send(Frame::Drop).is_ok()
    }

    pub fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.counters.subscribes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceFeed for ChannelPriceFeed {
    async fn connect(&mut self) -> Result<(), FeedError> {
        if self.rx.is_closed() && self.rx.is_empty() {
            return Err(FeedError::Connect("feed handle dropped".into()));
        }
        self.connected = true;
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe_all(&mut self) -> Result<(), FeedError> {
        if !self.connected {
            return Err(FeedError::Subscribe("not connected".into()));
        }
        self.counters.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn next_tick(&mut self) -> Result<PriceTick, FeedError> {
        if !self.connected {
            return Err(FeedError::Closed);
        }
        match self.rx.recv().await {
            Some(Frame::Tick(tick)) => Ok(tick),
            Some(Frame::Drop) => {
                self.connected = false;
                Err(FeedError::Stream("connection dropped".into()))
            }
            None => {
                self.connected = false;
                Err(FeedError::Closed)
            }
        }
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_ticks_flow_after_connect() {
        let (mut feed, handle) = ChannelPriceFeed::new();
        assert!(matches!(feed.next_tick().await, Err(FeedError::Closed)));

        feed.connect().await.unwrap();
        feed.subscribe_all().await.unwrap();
        handle.send("btc/usdt", dec!(50000));
        let tick = feed.next_tick().await.unwrap();
        assert_eq!(tick.pair, "BTCUSDT");
        assert_eq!(tick.price, dec!(50000));
        assert_eq!((handle.connects(), handle.subscribes()), (1, 1));
    }

    #[tokio::test]
    async fn test_drop_connection_ends_stream_until_reconnect() {
        let (mut feed, handle) = ChannelPriceFeed::new();
        feed.connect().await.unwrap();
        handle.drop_connection();
        handle.send("ETHUSDT", dec!(3000));

        assert!(feed.next_tick().await.is_err());
        assert!(matches!(feed.next_tick().await, Err(FeedError::Closed)));

        feed.connect().await.unwrap();
        assert_eq!(feed.next_tick().await.unwrap().pair, "ETHUSDT");
    }
}
