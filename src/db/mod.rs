pub mod balance_repo;
pub mod memory_store;
pub mod pg_store;
pub mod position_repo;

pub use memory_store::MemoryStore;
pub use pg_store::PgStore;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Debit, Position, PositionPatch, Settlement};

/// Result of [`PositionStore::apply_reversal`]. Anything but `Applied`
/// means nothing was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReversalOutcome {
    Applied,
    /// A settlement target was missing or already closed.
    NotOpen(Uuid),
    /// Balance plus the batch's credits does not cover the debit.
    InsufficientBalance { available: Decimal },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt position record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

/// Document-style position persistence. Updates are filtered on
/// `status = open`, so a closed position can never be mutated again.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn find_open_positions(&self) -> Result<Vec<Position>, StoreError>;

    /// Open positions of one owner on one pair, oldest first.
    async fn find_open_positions_for(
        &self,
        owner_id: &str,
        symbol: &str,
        base_currency: &str,
    ) -> Result<Vec<Position>, StoreError>;

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError>;

    async fn list_positions(&self, owner_id: Option<&str>) -> Result<Vec<Position>, StoreError>;

    async fn insert_position(&self, position: &Position) -> Result<(), StoreError>;

    /// Returns `false` when the position is missing or no longer open.
    async fn update_position(&self, id: Uuid, patch: &PositionPatch) -> Result<bool, StoreError>;

    /// Apply the position patch and the balance credit atomically.
    /// Returns `false` (and credits nothing) when the position is no longer open.
    async fn apply_settlement(&self, settlement: &Settlement) -> Result<bool, StoreError>;

    /// Apply every settlement, then the conditional `debit`, as one unit.
    /// The debit may spend the credits of the same batch.
    async fn apply_reversal(
        &self,
        settlements: &[Settlement],
        debit: Option<&Debit>,
    ) -> Result<ReversalOutcome, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Owner balances. The ledger is the source of truth for funds and never
/// lets a balance drop below zero.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    async fn balance(&self, owner_id: &str, currency: &str) -> Result<Decimal, StoreError>;

    /// Add `delta` (may be negative); the result is clamped at zero.
    async fn credit_balance(
        &self,
        owner_id: &str,
        currency: &str,
        delta: Decimal,
    ) -> Result<Decimal, StoreError>;

    /// Conditional debit. `None` when the balance does not cover `amount`.
    async fn debit_balance(
        &self,
        owner_id: &str,
        currency: &str,
        amount: Decimal,
    ) -> Result<Option<Decimal>, StoreError>;
}

/// The full persistence collaborator.
pub trait Store: PositionStore + BalanceLedger {}

impl<T: PositionStore + BalanceLedger> Store for T {}

pub async fn init_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    // Verify connectivity
    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
