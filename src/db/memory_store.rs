use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{pair_key, Debit, Position, PositionPatch, Settlement};

use super::{BalanceLedger, PositionStore, ReversalOutcome, StoreError};

/// In-process store used when no database is configured, and in tests.
///
/// A single lock covers positions and balances so settlements are atomic.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    /// Insertion order doubles as entry order.
    positions: Vec<Position>,
    balances: HashMap<(String, String), Decimal>,
}

impl MemoryInner {
    fn position_mut(&mut self, id: Uuid) -> Option<&mut Position> {
        self.positions.iter_mut().find(|p| p.id == id)
    }

    fn credit(&mut self, owner_id: &str, currency: &str, delta: Decimal) -> Decimal {
        let entry = self
            .balances
            .entry((owner_id.to_string(), currency.to_uppercase()))
            .or_insert(Decimal::ZERO);
        *entry = entry.saturating_add(delta).max(Decimal::ZERO);
        *entry
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a balance directly (test fixtures, local runs).
    pub async fn set_balance(&self, owner_id: &str, currency: &str, amount: Decimal) {
        let mut inner = self.inner.lock().await;
        inner
            .balances
            .insert((owner_id.to_string(), currency.to_uppercase()), amount.max(Decimal::ZERO));
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn find_open_positions(&self) -> Result<Vec<Position>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.positions.iter().filter(|p| p.is_open()).cloned().collect())
    }

    async fn find_open_positions_for(
        &self,
        owner_id: &str,
        symbol: &str,
        base_currency: &str,
    ) -> Result<Vec<Position>, StoreError> {
        let pair = pair_key(symbol, base_currency);
        let inner = self.inner.lock().await;
        Ok(inner
            .positions
            .iter()
            .filter(|p| p.is_open() && p.owner_id == owner_id && p.pair() == pair)
            .cloned()
            .collect())
    }

    async fn get_position(&self, id: Uuid) -> Result<Option<Position>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.positions.iter().find(|p| p.id == id).cloned())
    }

    async fn list_positions(&self, owner_id: Option<&str>) -> Result<Vec<Position>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .positions
            .iter()
            .rev()
            .filter(|p| owner_id.map_or(true, |o| p.owner_id == o))
            .cloned()
            .collect())
    }

    async fn insert_position(&self, position: &Position) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.positions.push(position.clone());
        Ok(())
    }

    async fn update_position(&self, id: Uuid, patch: &PositionPatch) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.position_mut(id) {
            Some(position) if position.is_open() => {
                patch.apply(position);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn apply_settlement(&self, settlement: &Settlement) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.position_mut(settlement.position_id) {
            Some(position) if position.is_open() => settlement.patch.apply(position),
            _ => return Ok(false),
        }
        if !settlement.credit.is_zero() {
            inner.credit(&settlement.owner_id, &settlement.currency, settlement.credit);
        }
        Ok(true)
    }

    async fn apply_reversal(
        &self,
        settlements: &[Settlement],
        debit: Option<&Debit>,
    ) -> Result<ReversalOutcome, StoreError> {
        let mut inner = self.inner.lock().await;

        // Check everything first so a rejected batch writes nothing.
        for settlement in settlements {
            let open = inner
                .positions
                .iter()
                .any(|p| p.id == settlement.position_id && p.is_open());
            if !open {
                return Ok(ReversalOutcome::NotOpen(settlement.position_id));
            }
        }
        if let Some(debit) = debit {
            let key = (debit.owner_id.clone(), debit.currency.to_uppercase());
            let mut available = inner.balances.get(&key).copied().unwrap_or(Decimal::ZERO);
            for s in settlements.iter().filter(|s| s.owner_id == debit.owner_id) {
                if s.currency.eq_ignore_ascii_case(&debit.currency) && s.credit > Decimal::ZERO {
                    available = available.saturating_add(s.credit);
                }
            }
            if available < debit.amount {
                return Ok(ReversalOutcome::InsufficientBalance { available });
            }
        }

        for settlement in settlements {
            if let Some(position) = inner.position_mut(settlement.position_id) {
                settlement.patch.apply(position);
            }
            if !settlement.credit.is_zero() {
                inner.credit(&settlement.owner_id, &settlement.currency, settlement.credit);
            }
        }
        if let Some(debit) = debit {
            inner.credit(&debit.owner_id, &debit.currency, -debit.amount);
        }
        Ok(ReversalOutcome::Applied)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl BalanceLedger for MemoryStore {
    async fn balance(&self, owner_id: &str, currency: &str) -> Result<Decimal, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .balances
            .get(&(owner_id.to_string(), currency.to_uppercase()))
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn credit_balance(
        &self,
        owner_id: &str,
        currency: &str,
        delta: Decimal,
    ) -> Result<Decimal, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.credit(owner_id, currency, delta))
    }

    async fn debit_balance(
        &self,
        owner_id: &str,
        currency: &str,
        amount: Decimal,
    ) -> Result<Option<Decimal>, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (owner_id.to_string(), currency.to_uppercase());
        match inner.balances.get_mut(&key) {
            Some(balance) if *balance >= amount => {
                *balance -= amount;
                Ok(Some(*balance))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PositionStatus;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_credit_is_clamped_at_zero() {
        let store = MemoryStore::new();
        store.set_balance("alice", "usdt", dec!(100)).await;
        assert_eq!(store.credit_balance("alice", "USDT", dec!(-250)).await.unwrap(), Decimal::ZERO);
        assert_eq!(store.credit_balance("alice", "USDT", dec!(40)).await.unwrap(), dec!(40));
    }

    #[tokio::test]
    async fn test_debit_is_conditional() {
        let store = MemoryStore::new();
        store.set_balance("alice", "USDT", dec!(100)).await;
        assert_eq!(store.debit_balance("alice", "USDT", dec!(150)).await.unwrap(), None);
        assert_eq!(store.balance("alice", "USDT").await.unwrap(), dec!(100));
        assert_eq!(store.debit_balance("alice", "USDT", dec!(60)).await.unwrap(), Some(dec!(40)));
        assert_eq!(store.debit_balance("bob", "USDT", dec!(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_settlement_applies_once() {
        let store = MemoryStore::new();
        let position = crate::execution::position_account::tests_support::open_position(
            crate::models::Side::Buy,
            dec!(100),
            dec!(1),
            dec!(10),
            dec!(10),
        );
        store.insert_position(&position).await.unwrap();

        let settlement = Settlement {
            position_id: position.id,
            owner_id: "alice".into(),
            currency: "USDT".into(),
            patch: PositionPatch {
                status: Some(PositionStatus::Closed),
                exit_price: Some(dec!(105)),
                ..Default::default()
            },
            credit: dec!(15),
        };
        assert!(store.apply_settlement(&settlement).await.unwrap());
        assert!(!store.apply_settlement(&settlement).await.unwrap());
        assert_eq!(store.balance("alice", "USDT").await.unwrap(), dec!(15));
        assert!(store.find_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reversal_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        let position = crate::execution::position_account::tests_support::open_position(
            crate::models::Side::Buy,
            dec!(100),
            dec!(1),
            dec!(10),
            dec!(10),
        );
        store.insert_position(&position).await.unwrap();
        store.set_balance("alice", "USDT", dec!(3)).await;

        let settlements = vec![Settlement {
            position_id: position.id,
            owner_id: "alice".into(),
            currency: "USDT".into(),
            patch: PositionPatch {
                status: Some(PositionStatus::Closed),
                exit_price: Some(dec!(95)),
                ..Default::default()
            },
            credit: dec!(5),
        }];
        let debit = |amount| Debit {
            owner_id: "alice".into(),
            currency: "USDT".into(),
            amount,
        };

        let outcome = store.apply_reversal(&settlements, Some(&debit(dec!(9)))).await.unwrap();
        assert_eq!(outcome, ReversalOutcome::InsufficientBalance { available: dec!(8) });
        assert_eq!(store.balance("alice", "USDT").await.unwrap(), dec!(3));
        assert!(store.get_position(position.id).await.unwrap().unwrap().is_open());

        let outcome = store.apply_reversal(&settlements, Some(&debit(dec!(8)))).await.unwrap();
        assert_eq!(outcome, ReversalOutcome::Applied);
        assert_eq!(store.balance("alice", "USDT").await.unwrap(), Decimal::ZERO);
        assert!(!store.get_position(position.id).await.unwrap().unwrap().is_open());

        let outcome = store.apply_reversal(&settlements, None).await.unwrap();
        assert_eq!(outcome, ReversalOutcome::NotOpen(position.id));
    }
}
