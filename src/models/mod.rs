pub mod event;
pub mod order;
pub mod position;

pub use event::{CloseReason, PositionAction, PositionEvent, PriceTick};
pub use order::OrderRequest;
pub use position::{Debit, Position, PositionPatch, PositionStatus, Settlement};

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Position direction: `Buy` is long, `Sell` is short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    #[serde(alias = "long")]
    Buy,
    #[serde(alias = "short")]
    Sell,
}

impl Side {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "buy" | "long" => Some(Side::Buy),
            "sell" | "short" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Trading pair key
// ---------------------------------------------------------------------------

/// Normalized trading-pair key (`BTC` + `USDT` -> `BTCUSDT`).
///
/// Separators are stripped and case is folded so that `btc/usdt`,
/// `BTC-USDT` and `BTCUSDT` all land in the same bucket. A symbol that
/// already carries the base currency as suffix is not doubled.
pub fn pair_key(symbol: &str, base_currency: &str) -> String {
    let symbol = normalize_pair(symbol);
    let base = normalize_pair(base_currency);
    if base.is_empty() || (symbol.ends_with(&base) && symbol.len() > base.len()) {
        symbol
    } else {
        format!("{symbol}{base}")
    }
}

/// Case-fold a raw pair string coming from a price feed.
pub fn normalize_pair(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
