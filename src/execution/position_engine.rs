use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::db::{BalanceLedger, PositionStore, ReversalOutcome, Store};
use crate::models::{
    normalize_pair, CloseReason, Debit, OrderRequest, Position, PositionEvent, PositionPatch,
    Settlement,
};
use crate::services::broadcaster::UpdateBroadcaster;
use crate::services::position_index::PositionIndex;

use super::position_account::{self, OrderPlan, Remainder, ReversalFill};
use super::position_math;
use super::OrderError;

/// Tunables for order intake and settlement.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fee on realized profit, in percent.
    pub fee_percentage: Decimal,
    pub max_leverage: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fee_percentage: Decimal::new(1, 1), // 0.1%
            max_leverage: Decimal::from(125),
        }
    }
}

/// What an accepted order did.
#[derive(Debug, Clone, Serialize)]
pub struct OrderOutcome {
    pub fills: Vec<ReversalFill>,
    /// The merged or newly opened position, if any quantity remained.
    pub position: Option<Position>,
    pub margin_debited: Decimal,
    pub collateral_returned: Decimal,
}

/// The canonical position engine: order intake (merge / reversal), closes,
/// margin top-ups and TP/SL edits.
///
/// Every mutation of positions on a pair runs under that pair's lock from
/// [`PositionIndex::pair_lock`], which the liquidation monitor shares.
pub struct PositionEngine {
    store: Arc<dyn Store>,
    index: Arc<PositionIndex>,
    broadcaster: UpdateBroadcaster,
    config: EngineConfig,
}

impl PositionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        index: Arc<PositionIndex>,
        broadcaster: UpdateBroadcaster,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            index,
            broadcaster,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn index(&self) -> &Arc<PositionIndex> {
        &self.index
    }

    pub fn broadcaster(&self) -> &UpdateBroadcaster {
        &self.broadcaster
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Order intake
    // -----------------------------------------------------------------------

    pub async fn place_order(&self, order: OrderRequest) -> Result<OrderOutcome, OrderError> {
        let result = self.place_order_inner(&order).await;
        match &result {
            Ok(outcome) => {
                counter!("orders_placed_total").increment(1);
                tracing::info!(
                    owner_id = %order.owner_id,
                    pair = %order.pair(),
                    side = %order.side,
                    reversals = outcome.fills.len(),
                    margin_debited = %outcome.margin_debited,
                    collateral_returned = %outcome.collateral_returned,
                    position_id = ?outcome.position.as_ref().map(|p| p.id),
                    "Order accepted"
                );
            }
            Err(e) => {
                counter!("orders_rejected_total").increment(1);
                tracing::info!(
                    owner_id = %order.owner_id,
                    pair = %order.pair(),
                    side = %order.side,
                    error = %e,
                    "Order rejected"
                );
            }
        }
        result
    }

    async fn place_order_inner(&self, order: &OrderRequest) -> Result<OrderOutcome, OrderError> {
        let pair = order.pair();
        let lock = self.index.pair_lock(&pair);
        let _guard = lock.lock().await;

        let open = self
            .store
            .find_open_positions_for(&order.owner_id, &order.symbol, &order.base_currency)
            .await?;
        let plan = position_account::plan_order(
            order,
            &open,
            self.config.fee_percentage,
            self.config.max_leverage,
            Utc::now(),
        )?;

        let currency = order.base_currency.to_uppercase();
        let available = self.store.balance(&order.owner_id, &currency).await?;
        let funds = available.saturating_add(plan.total_credit);
        if plan.margin_debit > funds {
            return Err(OrderError::InsufficientBalance {
                required: plan.margin_debit,
                available: funds,
            });
        }

        // Reversal credits and the margin debit commit together, so a
        // balance drained by a concurrent order rejects with nothing mutated.
        if plan.fills.is_empty() {
            self.debit(&order.owner_id, &currency, plan.margin_debit).await?;
        } else {
            self.apply_reversal(&order.owner_id, &plan, &currency).await?;
        }

        let position = match &plan.remainder {
            Some(Remainder::Merged { position, .. }) => {
                let updated = self
                    .store
                    .update_position(position.id, &PositionPatch::economics_of(position))
                    .await;
                match updated {
                    Ok(true) => {}
                    Ok(false) => {
                        self.refund(&order.owner_id, &currency, plan.margin_debit).await;
                        return Err(OrderError::NotFound(format!("open position {}", position.id)));
                    }
                    Err(e) => {
                        self.refund(&order.owner_id, &currency, plan.margin_debit).await;
                        return Err(e.into());
                    }
                }
                self.index.replace(position, position).await;
                self.broadcaster.publish(&PositionEvent::updated(position.clone()));
                Some(position.clone())
            }
            Some(Remainder::Opened { position }) => {
                if let Err(e) = self.store.insert_position(position).await {
                    self.refund(&order.owner_id, &currency, plan.margin_debit).await;
                    return Err(e.into());
                }
                self.index.add(position).await;
                self.broadcaster.publish(&PositionEvent::opened(position.clone()));
                Some(position.clone())
            }
            None => None,
        };

        Ok(OrderOutcome {
            collateral_returned: plan.total_credit,
            margin_debited: plan.margin_debit,
            fills: plan.fills,
            position,
        })
    }

    async fn debit(&self, owner_id: &str, currency: &str, amount: Decimal) -> Result<(), OrderError> {
        if amount <= Decimal::ZERO {
            return Ok(());
        }
        match self.store.debit_balance(owner_id, currency, amount).await? {
            Some(_) => Ok(()),
            None => {
                let available = self.store.balance(owner_id, currency).await?;
                Err(OrderError::InsufficientBalance {
                    required: amount,
                    available,
                })
            }
        }
    }

    async fn refund(&self, owner_id: &str, currency: &str, amount: Decimal) {
        if amount <= Decimal::ZERO {
            return;
        }
        if let Err(e) = self.store.credit_balance(owner_id, currency, amount).await {
            tracing::error!(
                owner_id = %owner_id,
                currency = %currency,
                amount = %amount,
                error = %e,
                "Failed to refund margin after aborted order"
            );
        }
    }

    async fn apply_reversal(&self, owner_id: &str, plan: &OrderPlan, currency: &str) -> Result<(), OrderError> {
        let settlements: Vec<Settlement> = plan
            .fills
            .iter()
            .map(|fill| Settlement {
                position_id: fill.position_id,
                owner_id: fill.position.owner_id.clone(),
                currency: currency.to_string(),
                patch: if fill.fully_closed {
                    PositionPatch::closing_of(&fill.position)
                } else {
                    PositionPatch::economics_of(&fill.position)
                },
                credit: fill.collateral_returned,
            })
            .collect();
        let debit = (plan.margin_debit > Decimal::ZERO).then(|| Debit {
            owner_id: owner_id.to_string(),
            currency: currency.to_string(),
            amount: plan.margin_debit,
        });

        match self.store.apply_reversal(&settlements, debit.as_ref()).await? {
            ReversalOutcome::Applied => {}
            ReversalOutcome::NotOpen(id) => {
                tracing::warn!(position_id = %id, "Reversal target was no longer open");
                if let Some(fill) = plan.fills.iter().find(|f| f.position_id == id) {
                    self.index.remove(&fill.position).await;
                }
                return Err(OrderError::NotFound(format!("open position {id}")));
            }
            ReversalOutcome::InsufficientBalance { available } => {
                return Err(OrderError::InsufficientBalance {
                    required: plan.margin_debit,
                    available,
                });
            }
        }

        for fill in &plan.fills {
            self.publish_fill(fill).await;
        }
        Ok(())
    }

    async fn publish_fill(&self, fill: &ReversalFill) {
        self.index.replace(&fill.position, &fill.position).await;
        let event = if fill.fully_closed {
            counter!("positions_closed_total", "reason" => CloseReason::Reversal.as_str()).increment(1);
            PositionEvent::closed(fill.position.clone(), CloseReason::Reversal, fill.collateral_returned)
        } else {
            PositionEvent::updated(fill.position.clone())
        };
        self.broadcaster.publish(&event);

        tracing::info!(
            position_id = %fill.position_id,
            closed_quantity = %fill.closed_quantity,
            realized_pnl = %fill.realized_pnl,
            collateral_returned = %fill.collateral_returned,
            fully_closed = fill.fully_closed,
            "Reversal fill settled"
        );
    }

    // -----------------------------------------------------------------------
    // Closing
    // -----------------------------------------------------------------------

    /// Close the position `id` on `pair` if `price` still hits one of its
    /// rules. Used by the monitor; the rule is re-evaluated under the pair
    /// lock against the current index entry, so a position closed or
    /// modified by an earlier tick is never closed twice.
    pub async fn close_if_triggered(
        &self,
        pair: &str,
        id: Uuid,
        price: Decimal,
    ) -> Result<Option<PositionEvent>, OrderError> {
        let pair = normalize_pair(pair);
        let lock = self.index.pair_lock(&pair);
        let _guard = lock.lock().await;

        let Some(current) = self.index.get(&pair, id).await else {
            return Ok(None);
        };
        let Some(reason) = position_math::trigger_for(&current, price) else {
            return Ok(None);
        };
        self.settle_close(&current, price, reason).await
    }

    /// Close a position at `price` for `reason` (manual close from the API).
    /// Returns `None` if it was already closed.
    pub async fn close_position(
        &self,
        id: Uuid,
        price: Decimal,
        reason: CloseReason,
    ) -> Result<Option<PositionEvent>, OrderError> {
        if price <= Decimal::ZERO {
            return Err(OrderError::InvalidPrice(price));
        }
        let pair = self.position(id).await?.pair();
        let lock = self.index.pair_lock(&pair);
        let _guard = lock.lock().await;

        let current = self.position(id).await?;
        if !current.is_open() {
            self.index.remove(&current).await;
            return Ok(None);
        }
        self.settle_close(&current, price, reason).await
    }

    /// Settle under the pair lock. The index entry is only dropped once the
    /// store accepted the close and credit; on a store error it stays so the
    /// next tick retries.
    async fn settle_close(
        &self,
        position: &Position,
        price: Decimal,
        reason: CloseReason,
    ) -> Result<Option<PositionEvent>, OrderError> {
        let (closed, credit) =
            position_account::close_at(position, price, reason, self.config.fee_percentage, Utc::now())?;
        let settlement = Settlement {
            position_id: position.id,
            owner_id: position.owner_id.clone(),
            currency: position.base_currency.to_uppercase(),
            patch: PositionPatch::closing_of(&closed),
            credit,
        };

        let applied = self.store.apply_settlement(&settlement).await?;
        self.index.remove(position).await;
        if !applied {
            tracing::debug!(position_id = %position.id, "Position already closed in store");
            return Ok(None);
        }

        counter!("positions_closed_total", "reason" => reason.as_str()).increment(1);
        tracing::info!(
            position_id = %position.id,
            owner_id = %position.owner_id,
            pair = %position.pair(),
            side = %position.side,
            entry = %position.entry_price,
            exit = %price,
            realized_pnl = ?closed.realized_pnl,
            credited = %credit,
            reason = %reason,
            "Position closed"
        );

        let event = PositionEvent::closed(closed, reason, credit);
        self.broadcaster.publish(&event);
        Ok(Some(event))
    }

    // -----------------------------------------------------------------------
    // Position maintenance
    // -----------------------------------------------------------------------

    /// Post extra collateral; the surplus over the leverage requirement
    /// moves the liquidation price away from entry.
    pub async fn add_margin(&self, id: Uuid, amount: Decimal) -> Result<Position, OrderError> {
        if amount <= Decimal::ZERO {
            return Err(OrderError::InvalidQuantity(amount));
        }
        let pair = self.position(id).await?.pair();
        let lock = self.index.pair_lock(&pair);
        let _guard = lock.lock().await;

        let current = self.open_position(id).await?;
        let currency = current.base_currency.to_uppercase();

        let mut updated = current.clone();
        updated.margin_allocated = current
            .margin_allocated
            .checked_add(amount)
            .ok_or(OrderError::InvalidQuantity(amount))?;
        updated.liquidation_price = position_math::position_liquidation_price(&updated)?;

        self.debit(&current.owner_id, &currency, amount).await?;

        let patch = PositionPatch {
            margin_allocated: Some(updated.margin_allocated),
            liquidation_price: Some(updated.liquidation_price),
            ..Default::default()
        };
        match self.store.update_position(id, &patch).await {
            Ok(true) => {}
            Ok(false) => {
                self.refund(&current.owner_id, &currency, amount).await;
                return Err(OrderError::NotFound(format!("open position {id}")));
            }
            Err(e) => {
                self.refund(&current.owner_id, &currency, amount).await;
                return Err(e.into());
            }
        }

        self.index.replace(&current, &updated).await;
        self.broadcaster.publish(&PositionEvent::updated(updated.clone()));
        tracing::info!(
            position_id = %id,
            added = %amount,
            margin = %updated.margin_allocated,
            liquidation_price = ?updated.liquidation_price,
            "Margin added"
        );
        Ok(updated)
    }

    /// Replace take-profit and stop-loss; `None` clears a threshold.
    pub async fn update_risk_controls(
        &self,
        id: Uuid,
        take_profit: Option<Decimal>,
        stop_loss: Option<Decimal>,
    ) -> Result<Position, OrderError> {
        let pair = self.position(id).await?.pair();
        let lock = self.index.pair_lock(&pair);
        let _guard = lock.lock().await;

        let current = self.open_position(id).await?;
        position_account::validate_risk_controls(current.side, current.entry_price, take_profit, stop_loss)?;

        let patch = PositionPatch {
            take_profit: Some(take_profit),
            stop_loss: Some(stop_loss),
            ..Default::default()
        };
        if !self.store.update_position(id, &patch).await? {
            return Err(OrderError::NotFound(format!("open position {id}")));
        }

        let mut updated = current.clone();
        patch.apply(&mut updated);
        self.index.replace(&current, &updated).await;
        self.broadcaster.publish(&PositionEvent::updated(updated.clone()));
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn position(&self, id: Uuid) -> Result<Position, OrderError> {
        self.store
            .get_position(id)
            .await?
            .ok_or_else(|| OrderError::NotFound(format!("position {id}")))
    }

    async fn open_position(&self, id: Uuid) -> Result<Position, OrderError> {
        let position = self.position(id).await?;
        if !position.is_open() {
            return Err(OrderError::NotFound(format!("open position {id}")));
        }
        Ok(position)
    }

    pub async fn positions(&self, owner_id: Option<&str>) -> Result<Vec<Position>, OrderError> {
        Ok(self.store.list_positions(owner_id).await?)
    }

    pub async fn balance(&self, owner_id: &str, currency: &str) -> Result<Decimal, OrderError> {
        Ok(self.store.balance(owner_id, &currency.to_uppercase()).await?)
    }
}
