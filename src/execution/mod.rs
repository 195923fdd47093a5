pub mod position_account;
pub mod position_engine;
pub mod position_math;

pub use position_engine::{EngineConfig, OrderOutcome, PositionEngine};

use rust_decimal::Decimal;
use thiserror::Error;

use crate::db::StoreError;
use crate::models::Side;

/// Order and position-operation failures. Everything except `Store` is
/// reported before any state is mutated.
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("leverage {requested}x does not match the open position; resubmit with leverage {required}x")]
    LeverageMismatch { requested: Decimal, required: Decimal },

    #[error("an open {side} position of {open_quantity} exists on this pair; resubmit with confirm_reversal=true to reverse it")]
    ReversalConfirmationRequired { side: Side, open_quantity: Decimal },

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Decimal, available: Decimal },

    #[error("invalid quantity {0}: must be greater than zero")]
    InvalidQuantity(Decimal),

    #[error("invalid price {0}: must be greater than zero")]
    InvalidPrice(Decimal),

    #[error("invalid leverage {leverage}: must be between 1 and {max}")]
    InvalidLeverage { leverage: Decimal, max: Decimal },

    #[error("invalid risk control: {0}")]
    InvalidRiskControl(String),

    #[error("no price available for {0}; pass an explicit price")]
    NoPrice(String),

    #[error("position value out of range: {0}")]
    Overflow(#[from] position_math::Overflow),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrderError {
    pub fn is_validation(&self) -> bool {
        !matches!(self, OrderError::NotFound(_) | OrderError::Store(_))
    }
}
