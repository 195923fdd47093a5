use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Position;

// ---------------------------------------------------------------------------
// PriceTick: one price observation from the feed
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    /// Normalized pair key, see [`crate::models::normalize_pair`].
    pub pair: String,
    pub price: Decimal,
    pub received_at: DateTime<Utc>,
}

impl PriceTick {
    pub fn new(pair: &str, price: Decimal) -> Self {
        Self {
            pair: super::normalize_pair(pair),
            price,
            received_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Close reasons and broadcast events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Liquidation,
    TakeProfit,
    StopLoss,
    Manual,
    Reversal,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Liquidation => "liquidation",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::Manual => "manual",
            CloseReason::Reversal => "reversal",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "liquidation" => Some(CloseReason::Liquidation),
            "take_profit" => Some(CloseReason::TakeProfit),
            "stop_loss" => Some(CloseReason::StopLoss),
            "manual" => Some(CloseReason::Manual),
            "reversal" => Some(CloseReason::Reversal),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionAction {
    Opened,
    Updated,
    Closed,
    Liquidated,
}

/// Published by the broadcaster whenever a position changes.
#[derive(Debug, Clone, Serialize)]
pub struct PositionEvent {
    pub action: PositionAction,
    pub reason: Option<CloseReason>,
    pub is_liquidation: bool,
    pub position: Position,
    /// Amount credited back to the owner on a close.
    pub settlement: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl PositionEvent {
    pub fn opened(position: Position) -> Self {
        Self {
            action: PositionAction::Opened,
            reason: None,
            is_liquidation: false,
            position,
            settlement: None,
            timestamp: Utc::now(),
        }
    }

    pub fn updated(position: Position) -> Self {
        Self {
            action: PositionAction::Updated,
            ..Self::opened(position)
        }
    }

    pub fn closed(position: Position, reason: CloseReason, settlement: Decimal) -> Self {
        let is_liquidation = reason == CloseReason::Liquidation;
        Self {
            action: if is_liquidation {
                PositionAction::Liquidated
            } else {
                PositionAction::Closed
            },
            reason: Some(reason),
            is_liquidation,
            position,
            settlement: Some(settlement),
            timestamp: Utc::now(),
        }
    }
}
