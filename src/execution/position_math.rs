use rust_decimal::Decimal;

use crate::models::{CloseReason, Position, Side};

/// Maintenance margin as a fraction of position value (0.5%).
pub const MAINTENANCE_MARGIN_RATE: Decimal = Decimal::from_parts(5, 0, 0, false, 3);

/// Liquidation price of an unleveraged short. No real tick reaches it.
pub const NEVER_LIQUIDATES_SHORT: Decimal = Decimal::MAX;

/// Position arithmetic left the range a `Decimal` can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("position arithmetic overflowed")]
pub struct Overflow;

fn add(a: Decimal, b: Decimal) -> Result<Decimal, Overflow> {
    a.checked_add(b).ok_or(Overflow)
}

fn sub(a: Decimal, b: Decimal) -> Result<Decimal, Overflow> {
    a.checked_sub(b).ok_or(Overflow)
}

fn mul(a: Decimal, b: Decimal) -> Result<Decimal, Overflow> {
    a.checked_mul(b).ok_or(Overflow)
}

fn div(a: Decimal, b: Decimal) -> Result<Decimal, Overflow> {
    a.checked_div(b).ok_or(Overflow)
}

/// Price at which a position's margin no longer covers losses plus
/// maintenance margin.
///
/// `extra_margin` is collateral posted beyond what `leverage` requires; it
/// pushes the liquidation price further away from entry.
///
/// Leverage of 1 or less never liquidates: `0` for a long, `Decimal::MAX`
/// for a short. The same sentinels are returned for degenerate inputs that
/// yield no exposure (zero margin or entry price).
pub fn liquidation_price(
    side: Side,
    entry_price: Decimal,
    leverage: Decimal,
    margin_allocated: Decimal,
    extra_margin: Decimal,
) -> Result<Decimal, Overflow> {
    let never = match side {
        Side::Buy => Decimal::ZERO,
        Side::Sell => NEVER_LIQUIDATES_SHORT,
    };
    if leverage <= Decimal::ONE || entry_price <= Decimal::ZERO || margin_allocated <= Decimal::ZERO {
        return Ok(never);
    }

    let position_value = mul(margin_allocated, leverage)?;
    let quantity = div(position_value, entry_price)?;
    let maintenance_margin = mul(position_value, MAINTENANCE_MARGIN_RATE)?;

    let margin_delta = div(sub(margin_allocated, maintenance_margin)?, quantity)?;
    let extra_delta = div(extra_margin, quantity)?;

    match side {
        Side::Buy => Ok(sub(sub(entry_price, margin_delta)?, extra_delta)?.max(Decimal::ZERO)),
        Side::Sell => add(add(entry_price, margin_delta)?, extra_delta),
    }
}

/// Signed PnL of `quantity` opened at `entry_price` and marked at `current_price`.
///
/// `quantity` already carries the leverage; never scale the result by it.
pub fn unrealized_pnl(
    side: Side,
    entry_price: Decimal,
    current_price: Decimal,
    quantity: Decimal,
) -> Result<Decimal, Overflow> {
    let diff = sub(current_price, entry_price)?;
    match side {
        Side::Buy => mul(diff, quantity),
        Side::Sell => mul(-diff, quantity),
    }
}

/// Fee charged on a realized profit. Losses are never charged.
pub fn fees(pnl: Decimal, fee_percentage: Decimal) -> Result<Decimal, Overflow> {
    if pnl > Decimal::ZERO {
        div(mul(pnl, fee_percentage)?, Decimal::ONE_HUNDRED)
    } else {
        Ok(Decimal::ZERO)
    }
}

/// Amount credited back to the owner on close: margin + pnl − fees.
pub fn settlement_amount(margin_allocated: Decimal, pnl: Decimal, fees: Decimal) -> Result<Decimal, Overflow> {
    sub(add(margin_allocated, pnl)?, fees)
}

/// Margin required to carry `quantity` at `entry_price` with `leverage`.
pub fn required_margin(quantity: Decimal, entry_price: Decimal, leverage: Decimal) -> Result<Decimal, Overflow> {
    let notional = mul(quantity, entry_price)?;
    if leverage <= Decimal::ZERO {
        return Ok(notional);
    }
    div(notional, leverage)
}

/// Recompute a position's stored liquidation price from its current
/// quantity, margin and entry. Margin beyond the leverage requirement is
/// treated as extra margin. Unleveraged positions get `None`.
pub fn position_liquidation_price(position: &Position) -> Result<Option<Decimal>, Overflow> {
    if position.leverage <= Decimal::ONE {
        return Ok(None);
    }
    let required = required_margin(position.quantity, position.entry_price, position.leverage)?;
    let (base, extra) = if position.margin_allocated > required && required > Decimal::ZERO {
        (required, position.margin_allocated - required)
    } else {
        (position.margin_allocated, Decimal::ZERO)
    };
    liquidation_price(position.side, position.entry_price, position.leverage, base, extra).map(Some)
}

/// Which close rule `price` hits for `position`, if any.
///
/// Checked in priority order take-profit, stop-loss, liquidation; the first
/// hit wins.
pub fn trigger_for(position: &Position, price: Decimal) -> Option<CloseReason> {
    let (tp_hit, sl_hit, liq_hit) = match position.side {
        Side::Buy => (
            position.take_profit.is_some_and(|tp| price >= tp),
            position.stop_loss.is_some_and(|sl| price <= sl),
            position.liquidation_price.is_some_and(|liq| price <= liq),
        ),
        Side::Sell => (
            position.take_profit.is_some_and(|tp| price <= tp),
            position.stop_loss.is_some_and(|sl| price >= sl),
            position.liquidation_price.is_some_and(|liq| price >= liq),
        ),
    };

    if tp_hit {
        Some(CloseReason::TakeProfit)
    } else if sl_hit {
        Some(CloseReason::StopLoss)
    } else if liq_hit {
        Some(CloseReason::Liquidation)
    } else {
        None
    }
}
