use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use futures_util::FutureExt;
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, Duration, MissedTickBehavior};

use crate::db::StoreError;
use crate::execution::position_math;
use crate::execution::{OrderError, PositionEngine};
use crate::ingestion::{FeedError, PriceFeed, ReconnectPolicy};
use crate::models::{normalize_pair, PositionEvent, PriceTick};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub refresh_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Stopped,
    Connecting,
    Subscribed,
    Disconnected,
}

struct Shared {
    engine: Arc<PositionEngine>,
    state: watch::Sender<MonitorState>,
    last_prices: RwLock<HashMap<String, Decimal>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    feed_task: JoinHandle<()>,
    refresh_task: JoinHandle<()>,
}

enum ConnectionEnd {
    Shutdown,
    Recycle,
    Dropped(FeedError),
}

/// Watches every open position against a live price feed and closes it on
/// take-profit, stop-loss or liquidation.
///
/// Ticks are handled one at a time in arrival order; each close runs under
/// the pair lock and re-checks the position, so a later tick never sees a
/// position an earlier tick already closed.
pub struct LiquidationMonitor {
    shared: Arc<Shared>,
    config: MonitorConfig,
    running: Mutex<Option<Running>>,
}

impl LiquidationMonitor {
    pub fn new(engine: Arc<PositionEngine>, config: MonitorConfig) -> Self {
        let (state, _) = watch::channel(MonitorState::Stopped);
        Self {
            shared: Arc::new(Shared {
                engine,
                state,
                last_prices: RwLock::new(HashMap::new()),
            }),
            config,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
        self.shared.state.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Most recent price seen on `pair`.
    pub fn last_price(&self, pair: &str) -> Option<Decimal> {
        self.shared.last_price(&normalize_pair(pair))
    }

    /// Load open positions, then start consuming `feed` and the periodic
    /// index refresh. A second call while running is a no-op.
    pub async fn start(&self, feed: Box<dyn PriceFeed>) -> Result<(), StoreError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::warn!("Liquidation monitor already running");
            return Ok(());
        }

        let engine = &self.shared.engine;
        let stats = engine.index().refresh_from_store(&**engine.store()).await?;
        tracing::info!(
            pairs = stats.pairs,
            positions = stats.positions,
            "Liquidation monitor loaded open positions"
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let feed_task = tokio::spawn(run_feed(
            self.shared.clone(),
            feed,
            self.config.reconnect,
            shutdown_rx.clone(),
        ));
        let refresh_task = tokio::spawn(run_refresh(
            self.shared.clone(),
            self.config.refresh_interval,
            shutdown_rx,
        ));

        *running = Some(Running {
            shutdown,
            feed_task,
            refresh_task,
        });
        Ok(())
    }

    /// Stop both loops, disconnect the feed and empty the index. Safe to
    /// call in any state.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            for (name, task) in [("feed", running.feed_task), ("refresh", running.refresh_task)] {
                if let Err(e) = task.await {
                    tracing::warn!(task = name, error = %e, "Monitor task ended abnormally");
                }
            }
        }

        self.shared.engine.index().clear().await;
        self.shared
            .last_prices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.shared.state.send_replace(MonitorState::Stopped);
        tracing::info!("Liquidation monitor stopped");
    }

    /// Run one tick through the trigger check without a feed. Returns the
    /// close events it produced.
    pub async fn check_symbol(&self, pair: &str, price: Decimal) -> Vec<PositionEvent> {
        self.shared.process_tick(PriceTick::new(pair, price)).await
    }
}

impl Shared {
    fn set_state(&self, state: MonitorState) {
        self.state.send_replace(state);
    }

    fn last_price(&self, pair: &str) -> Option<Decimal> {
        self.last_prices
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pair)
            .copied()
    }

    async fn process_tick(&self, tick: PriceTick) -> Vec<PositionEvent> {
        counter!("price_ticks_total").increment(1);
        self.last_prices
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tick.pair.clone(), tick.price);

        let positions = self.engine.index().positions_for(&tick.pair).await;
        if positions.is_empty() {
            tracing::trace!(pair = %tick.pair, "No open positions on pair");
            return Vec::new();
        }

        let started = Instant::now();
        let mut closed = Vec::new();
        for position in positions {
            let Some(reason) = position_math::trigger_for(&position, tick.price) else {
                continue;
            };
            tracing::info!(
                position_id = %position.id,
                pair = %tick.pair,
                price = %tick.price,
                reason = %reason,
                "Close rule triggered"
            );

            match self.engine.close_if_triggered(&tick.pair, position.id, tick.price).await {
                Ok(Some(event)) => closed.push(event),
                Ok(None) => {
                    tracing::debug!(position_id = %position.id, "Position already closed or no longer triggered");
                }
                Err(OrderError::Overflow(e)) => {
                    tracing::warn!(
                        position_id = %position.id,
                        pair = %tick.pair,
                        price = %tick.price,
                        error = %e,
                        "Cannot settle position at this price; skipped"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        position_id = %position.id,
                        pair = %tick.pair,
                        error = %e,
                        "Failed to close position; retrying on next tick"
                    );
                }
            }
        }
        histogram!("tick_processing_seconds").record(started.elapsed().as_secs_f64());
        closed
    }
}

async fn run_feed(
    shared: Arc<Shared>,
    mut feed: Box<dyn PriceFeed>,
    policy: ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delay = policy.delay_for(attempt);
        if !delay.is_zero() {
            tracing::info!(delay_secs = delay.as_secs(), attempt, "Reconnecting to price feed...");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }

        shared.set_state(MonitorState::Connecting);
        let connected = tokio::select! {
            result = connect_and_subscribe(feed.as_mut()) => result,
            _ = shutdown.changed() => break,
        };
        if let Err(e) = connected {
            tracing::warn!(error = %e, attempt, "Price feed connection failed");
            feed.disconnect().await;
            shared.set_state(MonitorState::Disconnected);
            counter!("feed_reconnects_total").increment(1);
            attempt = attempt.saturating_add(1);
            continue;
        }

        shared.set_state(MonitorState::Subscribed);
        let recycle_at = policy.recycle_at(tokio::time::Instant::now());

        let end = loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break ConnectionEnd::Shutdown,
                _ = sleep_until(recycle_at) => break ConnectionEnd::Recycle,
                tick = feed.next_tick() => match tick {
                    Ok(tick) => {
                        let pair = tick.pair.clone();
                        // One bad tick must not end the feed loop.
                        if AssertUnwindSafe(shared.process_tick(tick)).catch_unwind().await.is_err() {
                            tracing::error!(pair = %pair, "Tick processing panicked; tick dropped");
                        }
                    }
                    Err(e) => break ConnectionEnd::Dropped(e),
                },
            }
        };

        feed.disconnect().await;
        match end {
            ConnectionEnd::Shutdown => break,
            ConnectionEnd::Recycle => {
                tracing::info!("Recycling price feed connection before its age limit");
                attempt = 0;
            }
            ConnectionEnd::Dropped(e) => {
                tracing::warn!(error = %e, "Price feed disconnected");
                attempt = 1;
            }
        }
        shared.set_state(MonitorState::Disconnected);
        counter!("feed_reconnects_total").increment(1);
    }

    feed.disconnect().await;
}

async fn connect_and_subscribe(feed: &mut dyn PriceFeed) -> Result<(), FeedError> {
    feed.connect().await?;
    feed.subscribe_all().await
}

async fn run_refresh(shared: Arc<Shared>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // start() just loaded the index

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let engine = &shared.engine;
                match engine.index().refresh_from_store(&**engine.store()).await {
                    Ok(stats) => tracing::debug!(
                        pairs = stats.pairs,
                        positions = stats.positions,
                        "Position index refreshed"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Position index refresh failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BalanceLedger, MemoryStore, PositionStore, Store};
    use crate::execution::position_account::tests_support::open_position;
    use crate::execution::EngineConfig;
    use crate::ingestion::ChannelPriceFeed;
    use crate::models::{CloseReason, Side};
    use crate::services::{PositionIndex, UpdateBroadcaster};
    use rust_decimal_macros::dec;

    fn monitor(store: &MemoryStore) -> LiquidationMonitor {
        let store: Arc<dyn Store> = Arc::new(store.clone());
        let engine = PositionEngine::new(
            store,
            Arc::new(PositionIndex::new()),
            UpdateBroadcaster::new(),
            EngineConfig::default(),
        );
        LiquidationMonitor::new(
            Arc::new(engine),
            MonitorConfig {
                refresh_interval: Duration::from_secs(3600),
                reconnect: ReconnectPolicy {
                    delay: Duration::from_millis(10),
                    max_connection_age: Duration::from_secs(3600),
                },
            },
        )
    }

    #[tokio::test]
    async fn test_tick_on_untracked_pair_is_noop() {
        let store = MemoryStore::new();
        let m = monitor(&store);
        assert!(m.check_symbol("DOGEUSDT", dec!(0.1)).await.is_empty());
        assert_eq!(m.last_price("dogeusdt"), Some(dec!(0.1)));
    }

    #[tokio::test]
    async fn test_liquidation_closes_and_credits_once() {
        let store = MemoryStore::new();
        let p = open_position(Side::Buy, dec!(50000), dec!(1), dec!(500), dec!(100));
        store.insert_position(&p).await.unwrap();
        let m = monitor(&store);
        m.shared.engine.index().add(&p).await;

        assert!(m.check_symbol("BTCUSDT", dec!(49800)).await.is_empty());

        let events = m.check_symbol("BTCUSDT", dec!(49700)).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_liquidation);
        assert_eq!(events[0].reason, Some(CloseReason::Liquidation));
        assert_eq!(events[0].settlement, Some(dec!(200)));

        assert!(m.check_symbol("BTCUSDT", dec!(49600)).await.is_empty());
        assert_eq!(store.balance("alice", "USDT").await.unwrap(), dec!(200));
        let stored = store.get_position(p.id).await.unwrap().unwrap();
        assert!(stored.liquidated);
        assert!(!stored.is_open());
    }

    #[tokio::test]
    async fn test_stop_loss_takes_precedence() {
        let store = MemoryStore::new();
        let mut p = open_position(Side::Buy, dec!(100), dec!(1), dec!(10), dec!(10));
        p.stop_loss = Some(dec!(96));
        p.liquidation_price = Some(dec!(95.5));
        store.insert_position(&p).await.unwrap();
        let m = monitor(&store);
        m.shared.engine.index().add(&p).await;

        let events = m.check_symbol("BTCUSDT", dec!(95)).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, Some(CloseReason::StopLoss));
        assert!(!events[0].is_liquidation);
        assert!(!events[0].position.liquidated);
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let store = MemoryStore::new();
        let p = open_position(Side::Sell, dec!(100), dec!(1), dec!(10), dec!(10));
        store.insert_position(&p).await.unwrap();
        let m = monitor(&store);
        assert_eq!(m.state(), MonitorState::Stopped);

        let (feed, handle) = ChannelPriceFeed::new();
        m.start(Box::new(feed)).await.unwrap();
        assert_eq!(m.shared.engine.index().len().await, 1);

        let mut states = m.watch_state();
        states
            .wait_for(|s| *s == MonitorState::Subscribed)
            .await
            .unwrap();
        assert_eq!(handle.subscribes(), 1);

        m.stop().await;
        assert_eq!(m.state(), MonitorState::Stopped);
        assert!(m.shared.engine.index().is_empty().await);
        assert!(!m.is_running().await);

        // stopping twice is harmless
        m.stop().await;
    }
}
