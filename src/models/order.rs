use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{pair_key, Side};

/// Inbound order from the REST layer.
///
/// Exactly one of `quantity` (position size) or `amount` (margin to post)
/// is expected; the other is derived from `entry_price` and `leverage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub owner_id: String,
    pub symbol: String,
    pub base_currency: String,
    #[serde(alias = "direction")]
    pub side: Side,
    #[serde(default)]
    pub quantity: Option<Decimal>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    pub entry_price: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: Decimal,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub confirm_reversal: bool,
}

fn default_leverage() -> Decimal {
    Decimal::ONE
}

impl OrderRequest {
    pub fn pair(&self) -> String {
        pair_key(&self.symbol, &self.base_currency)
    }
}
