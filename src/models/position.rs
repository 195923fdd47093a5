use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::CloseReason;
use super::{pair_key, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PositionStatus::Open),
            "closed" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

/// One owner's isolated-margin position on a single trading pair.
///
/// `quantity` is the leverage-adjusted size in units of `symbol`; PnL is
/// `price diff × quantity` and is never multiplied by `leverage` again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub owner_id: String,
    pub symbol: String,
    /// Margin and settlement currency (e.g. `USDT`).
    pub base_currency: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub margin_allocated: Decimal,
    pub leverage: Decimal,
    /// `None` for unleveraged positions, which never liquidate.
    pub liquidation_price: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub status: PositionStatus,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub fees: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub liquidated: bool,
    pub close_reason: Option<CloseReason>,
}

impl Position {
    pub fn pair(&self) -> String {
        pair_key(&self.symbol, &self.base_currency)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open && self.exit_price.is_none() && self.exit_time.is_none()
    }
}

/// Partial update of a stored position. `None` leaves a field untouched;
/// the nested options on nullable fields allow clearing them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionPatch {
    pub entry_price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub margin_allocated: Option<Decimal>,
    pub liquidation_price: Option<Option<Decimal>>,
    pub take_profit: Option<Option<Decimal>>,
    pub stop_loss: Option<Option<Decimal>>,
    pub status: Option<PositionStatus>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub fees: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub liquidated: Option<bool>,
    pub close_reason: Option<CloseReason>,
}

impl PositionPatch {
    /// Patch that rewrites the economic fields from a recomputed snapshot.
    pub fn economics_of(position: &Position) -> Self {
        Self {
            entry_price: Some(position.entry_price),
            quantity: Some(position.quantity),
            margin_allocated: Some(position.margin_allocated),
            liquidation_price: Some(position.liquidation_price),
            take_profit: Some(position.take_profit),
            stop_loss: Some(position.stop_loss),
            realized_pnl: position.realized_pnl,
            fees: position.fees,
            ..Default::default()
        }
    }

    /// Patch for the closing transition of `position` (already updated in memory).
    pub fn closing_of(position: &Position) -> Self {
        Self {
            status: Some(PositionStatus::Closed),
            exit_price: position.exit_price,
            exit_time: position.exit_time,
            fees: position.fees,
            realized_pnl: position.realized_pnl,
            liquidated: Some(position.liquidated),
            close_reason: position.close_reason,
            ..Default::default()
        }
    }

    pub fn apply(&self, position: &mut Position) {
        if let Some(v) = self.entry_price {
            position.entry_price = v;
        }
        if let Some(v) = self.quantity {
            position.quantity = v;
        }
        if let Some(v) = self.margin_allocated {
            position.margin_allocated = v;
        }
        if let Some(v) = self.liquidation_price {
            position.liquidation_price = v;
        }
        if let Some(v) = self.take_profit {
            position.take_profit = v;
        }
        if let Some(v) = self.stop_loss {
            position.stop_loss = v;
        }
        if let Some(v) = self.status {
            position.status = v;
        }
        if let Some(v) = self.exit_price {
            position.exit_price = Some(v);
        }
        if let Some(v) = self.exit_time {
            position.exit_time = Some(v);
        }
        if let Some(v) = self.fees {
            position.fees = Some(v);
        }
        if let Some(v) = self.realized_pnl {
            position.realized_pnl = Some(v);
        }
        if let Some(v) = self.liquidated {
            position.liquidated = v;
        }
        if let Some(v) = self.close_reason {
            position.close_reason = Some(v);
        }
    }
}

/// Position mutation paired with a balance credit; stores apply both or neither.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub position_id: Uuid,
    pub owner_id: String,
    pub currency: String,
    pub patch: PositionPatch,
    pub credit: Decimal,
}

/// Conditional balance debit committed together with a batch of settlements.
#[derive(Debug, Clone, PartialEq)]
pub struct Debit {
    pub owner_id: String,
    pub currency: String,
    pub amount: Decimal,
}
