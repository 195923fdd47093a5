use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use uuid::Uuid;

use margin_engine::db::{BalanceLedger, MemoryStore, PositionStore, ReversalOutcome, Store, StoreError};
use margin_engine::execution::{EngineConfig, PositionEngine};
use margin_engine::ingestion::ReconnectPolicy;
use margin_engine::models::{Debit, OrderRequest, Position, PositionEvent, PositionPatch, Settlement, Side};
use margin_engine::services::{
    LiquidationMonitor, MonitorConfig, PositionIndex, Subscription, UpdateBroadcaster,
};

/// Engine + monitor over an in-memory store, with every published event
/// captured on `events`.
#[allow(dead_code)]
pub struct Harness {
    pub store: FlakyStore,
    pub engine: Arc<PositionEngine>,
    pub monitor: Arc<LiquidationMonitor>,
    pub events: mpsc::UnboundedReceiver<PositionEvent>,
    _subscription: Subscription,
}

#[allow(dead_code)]
pub fn harness() -> Harness {
    harness_with(fast_monitor_config())
}

#[allow(dead_code)]
pub fn harness_with(monitor_config: MonitorConfig) -> Harness {
    let store = FlakyStore::default();
    let shared: Arc<dyn Store> = Arc::new(store.clone());
    let broadcaster = UpdateBroadcaster::new();
    let engine = Arc::new(PositionEngine::new(
        shared,
        Arc::new(PositionIndex::new()),
        broadcaster.clone(),
        EngineConfig::default(),
    ));
    let monitor = Arc::new(LiquidationMonitor::new(engine.clone(), monitor_config));

    let (tx, events) = mpsc::unbounded_channel();
    let subscription = broadcaster.subscribe(move |event| {
        tx.send(event.clone())?;
        Ok(())
    });

    Harness {
        store,
        engine,
        monitor,
        events,
        _subscription: subscription,
    }
}

#[allow(dead_code)]
impl Harness {
    pub async fn fund(&self, owner_id: &str, amount: Decimal) {
        self.store.inner.set_balance(owner_id, "USDT", amount).await;
    }

    pub async fn balance(&self, owner_id: &str) -> Decimal {
        self.store.balance(owner_id, "USDT").await.unwrap()
    }

    /// Next published event, failing the test after a few seconds.
    pub async fn next_event(&mut self) -> PositionEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for a position event")
            .expect("broadcaster dropped")
    }

    /// Skip events until one with a close reason arrives.
    pub async fn next_close(&mut self) -> PositionEvent {
        loop {
            let event = self.next_event().await;
            if event.reason.is_some() {
                return event;
            }
        }
    }
}

#[allow(dead_code)]
pub fn fast_monitor_config() -> MonitorConfig {
    MonitorConfig {
        refresh_interval: Duration::from_secs(3600),
        reconnect: ReconnectPolicy {
            delay: Duration::from_millis(10),
            max_connection_age: Duration::from_secs(3600),
        },
    }
}

#[allow(dead_code)]
pub fn order(side: Side, quantity: Decimal, price: Decimal, leverage: Decimal) -> OrderRequest {
    OrderRequest {
        owner_id: "alice".into(),
        symbol: "BTC".into(),
        base_currency: "USDT".into(),
        side,
        quantity: Some(quantity),
        amount: None,
        entry_price: price,
        leverage,
        take_profit: None,
        stop_loss: None,
        confirm_reversal: false,
    }
}

/// `10^exp` as a whole-number `Decimal`, for sizes past `u64`.
#[allow(dead_code)]
pub fn pow10(exp: u32) -> Decimal {
    Decimal::from_i128_with_scale(10i128.pow(exp), 0)
}

/// Poll `cond` every 10ms for up to 5s.
#[allow(dead_code)]
pub async fn eventually<F: FnMut() -> bool>(mut cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// `MemoryStore` whose settlements can be made to fail on demand, and
/// whose reversal batches can race a concurrent spend of the owner's funds.
#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_settlements: Arc<AtomicBool>,
    drain_before_reversal: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn fail_settlements(&self, fail: bool) {
        self.fail_settlements.store(fail, Ordering::SeqCst);
    }

    /// Zero the debited owner's balance right before the next reversal
    /// batch commits, as another order on a different pair would.
    pub fn drain_before_reversal(&self, drain: bool) {
        self.drain_before_reversal.store(drain, Ordering::SeqCst);
    }
}

#[async_trait]
impl PositionStore for FlakyStore {
    async fn find_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        self.inner.find_open_positions().await
    }

    async fn find_open_positions_for(
        &self,
        owner_id: &str,
        symbol: &str,
        base_currency: &str,
    ) -> Result<Vec<Position>, StoreError> {
        self.inner.find_open_positions_for(owner_id, symbol, base_currency).await
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        self.inner.get_position(id).await
    }

    async fn list_positions(&self, owner_id: Option<&str>) -> Result<Vec<Position>, StoreError> {
        self.inner.list_positions(owner_id).await
    }

    async fn insert_position(&self, position: &Position) -> Result<(), StoreError> {
        self.inner.insert_position(position).await
    }

    async fn update_position(&self, id: Uuid, patch: &PositionPatch) -> Result<bool, StoreError> {
        self.inner.update_position(id, patch).await
    }

    async fn apply_settlement(&self, settlement: &Settlement) -> Result<bool, StoreError> {
        if self.fail_settlements.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.apply_settlement(settlement).await
    }

    async fn apply_reversal(
        &self,
        settlements: &[Settlement],
        debit: Option<&Debit>,
    ) -> Result<ReversalOutcome, StoreError> {
        if self.fail_settlements.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        if let Some(debit) = debit {
            if self.drain_before_reversal.swap(false, Ordering::SeqCst) {
                self.inner
                    .set_balance(&debit.owner_id, &debit.currency, Decimal::ZERO)
                    .await;
            }
        }
        self.inner.apply_reversal(settlements, debit).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

#[async_trait]
impl BalanceLedger for FlakyStore {
    async fn balance(&self, owner_id: &str, currency: &str) -> Result<Decimal, StoreError> {
        self.inner.balance(owner_id, currency).await
    }

    async fn credit_balance(
        &self,
        owner_id: &str,
        currency: &str,
        delta: Decimal,
    ) -> Result<Decimal, StoreError> {
        self.inner.credit_balance(owner_id, currency, delta).await
    }

    async fn debit_balance(
        &self,
        owner_id: &str,
        currency: &str,
        amount: Decimal,
    ) -> Result<Option<Decimal>, StoreError> {
        self.inner.debit_balance(owner_id, currency, amount).await
    }
}
