use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{pair_key, Debit, Position, PositionPatch, Settlement};

use super::{balance_repo, position_repo, BalanceLedger, PositionStore, ReversalOutcome, StoreError};

/// Postgres-backed store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PositionStore for PgStore {
    async fn find_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        position_repo::get_open_positions(&self.pool).await
    }

    async fn find_open_positions_for(
        &self,
        owner_id: &str,
        symbol: &str,
        base_currency: &str,
    ) -> Result<Vec<Position>, StoreError> {
        let pair = pair_key(symbol, base_currency);
        let positions =
            position_repo::get_open_positions_for_owner(&self.pool, owner_id, base_currency).await?;
        Ok(positions.into_iter().filter(|p| p.pair() == pair).collect())
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        position_repo::get_position(&self.pool, id).await
    }

    async fn list_positions(&self, owner_id: Option<&str>) -> Result<Vec<Position>, StoreError> {
        position_repo::get_all_positions(&self.pool, owner_id).await
    }

    async fn insert_position(&self, position: &Position) -> Result<(), StoreError> {
        position_repo::insert_position(&self.pool, position).await
    }

    async fn update_position(&self, id: Uuid, patch: &PositionPatch) -> Result<bool, StoreError> {
        position_repo::update_open_position(&self.pool, id, patch).await
    }

    async fn apply_settlement(&self, settlement: &Settlement) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated =
            position_repo::update_open_position(&mut *tx, settlement.position_id, &settlement.patch).await?;
        if !updated {
            tx.rollback().await?;
            return Ok(false);
        }

        if !settlement.credit.is_zero() {
            balance_repo::credit_balance(
                &mut *tx,
                &settlement.owner_id,
                &settlement.currency,
                settlement.credit,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn apply_reversal(
        &self,
        settlements: &[Settlement],
        debit: Option<&Debit>,
    ) -> Result<ReversalOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        for settlement in settlements {
            let updated =
                position_repo::update_open_position(&mut *tx, settlement.position_id, &settlement.patch).await?;
            if !updated {
                tx.rollback().await?;
                return Ok(ReversalOutcome::NotOpen(settlement.position_id));
            }
            if !settlement.credit.is_zero() {
                balance_repo::credit_balance(
                    &mut *tx,
                    &settlement.owner_id,
                    &settlement.currency,
                    settlement.credit,
                )
                .await?;
            }
        }

        if let Some(debit) = debit {
            let debited =
                balance_repo::debit_balance(&mut *tx, &debit.owner_id, &debit.currency, debit.amount).await?;
            if debited.is_none() {
                let available = balance_repo::get_balance(&mut *tx, &debit.owner_id, &debit.currency).await?;
                tx.rollback().await?;
                return Ok(ReversalOutcome::InsufficientBalance { available });
            }
        }

        tx.commit().await?;
        Ok(ReversalOutcome::Applied)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl BalanceLedger for PgStore {
    async fn balance(&self, owner_id: &str, currency: &str) -> Result<Decimal, StoreError> {
        balance_repo::get_balance(&self.pool, owner_id, currency).await
    }

    async fn credit_balance(
        &self,
        owner_id: &str,
        currency: &str,
        delta: Decimal,
    ) -> Result<Decimal, StoreError> {
        balance_repo::credit_balance(&self.pool, owner_id, currency, delta).await
    }

    async fn debit_balance(
        &self,
        owner_id: &str,
        currency: &str,
        amount: Decimal,
    ) -> Result<Option<Decimal>, StoreError> {
        balance_repo::debit_balance(&self.pool, owner_id, currency, amount).await
    }
}
