use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{CloseReason, OrderRequest, Position, PositionStatus, Side};

use super::position_math::{self, position_liquidation_price, Overflow};
use super::OrderError;

/// Quantity and margin of an order after resolving `quantity | amount`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderSizing {
    pub quantity: Decimal,
    pub margin: Decimal,
}

/// Result of consuming (part of) one opposing position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReversalFill {
    pub position_id: Uuid,
    pub closed_quantity: Decimal,
    pub ratio: Decimal,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
    /// Margin share + pnl − fees, floored at zero.
    pub collateral_returned: Decimal,
    pub fully_closed: bool,
    /// The opposing position after the fill.
    pub position: Position,
}

/// What happens with the order quantity left after all reversals.
#[derive(Debug, Clone, PartialEq)]
pub enum Remainder {
    Merged {
        position: Position,
        added_quantity: Decimal,
        added_margin: Decimal,
    },
    Opened {
        position: Position,
    },
}

impl Remainder {
    pub fn position(&self) -> &Position {
        match self {
            Remainder::Merged { position, .. } | Remainder::Opened { position } => position,
        }
    }
}

/// Every mutation an order causes, computed without touching storage.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderPlan {
    pub pair: String,
    pub sizing: OrderSizing,
    pub fills: Vec<ReversalFill>,
    pub remainder: Option<Remainder>,
    /// Margin to debit from the owner for the merged/opened remainder.
    pub margin_debit: Decimal,
    /// Sum of collateral returned by the reversal fills.
    pub total_credit: Decimal,
}

/// Resolve and validate order size, price and leverage.
pub fn size_order(order: &OrderRequest, max_leverage: Decimal) -> Result<OrderSizing, OrderError> {
    if order.entry_price <= Decimal::ZERO {
        return Err(OrderError::InvalidPrice(order.entry_price));
    }
    if order.leverage < Decimal::ONE || order.leverage > max_leverage {
        return Err(OrderError::InvalidLeverage {
            leverage: order.leverage,
            max: max_leverage,
        });
    }

    let (quantity, margin) = match (order.quantity, order.amount) {
        (Some(quantity), _) => {
            let margin = position_math::required_margin(quantity, order.entry_price, order.leverage)
                .map_err(|_| OrderError::InvalidQuantity(quantity))?;
            (quantity, margin)
        }
        (None, Some(amount)) => {
            let quantity = amount
                .checked_mul(order.leverage)
                .and_then(|v| v.checked_div(order.entry_price))
                .ok_or(OrderError::InvalidQuantity(amount))?;
            (quantity, amount)
        }
        (None, None) => return Err(OrderError::InvalidQuantity(Decimal::ZERO)),
    };

    if quantity <= Decimal::ZERO || margin <= Decimal::ZERO {
        return Err(OrderError::InvalidQuantity(quantity));
    }

    Ok(OrderSizing { quantity, margin })
}

/// Take-profit must sit on the profitable side of `reference`, stop-loss on
/// the losing side.
pub fn validate_risk_controls(
    side: Side,
    reference: Decimal,
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
) -> Result<(), OrderError> {
    if let Some(tp) = take_profit {
        let ok = match side {
            Side::Buy => tp > reference,
            Side::Sell => tp < reference && tp > Decimal::ZERO,
        };
        if !ok {
            return Err(OrderError::InvalidRiskControl(format!(
                "take profit {tp} must be {} entry price {reference} for a {side} position",
                if side == Side::Buy { "above" } else { "below" },
            )));
        }
    }
    if let Some(sl) = stop_loss {
        let ok = match side {
            Side::Buy => sl < reference && sl > Decimal::ZERO,
            Side::Sell => sl > reference,
        };
        if !ok {
            return Err(OrderError::InvalidRiskControl(format!(
                "stop loss {sl} must be {} entry price {reference} for a {side} position",
                if side == Side::Buy { "below" } else { "above" },
            )));
        }
    }
    Ok(())
}

/// Plan an order against the owner's open positions on the same pair.
///
/// Opposing positions are consumed first, in the order given. Any remaining
/// quantity merges into the same-direction position or opens a new one.
/// Fails before planning anything when the leverage differs from an open
/// same-direction position, or when a reversal is needed but not confirmed.
pub fn plan_order(
    order: &OrderRequest,
    open_positions: &[Position],
    fee_percentage: Decimal,
    max_leverage: Decimal,
    now: DateTime<Utc>,
) -> Result<OrderPlan, OrderError> {
    let sizing = size_order(order, max_leverage)?;
    validate_risk_controls(order.side, order.entry_price, order.take_profit, order.stop_loss)?;

    let pair = order.pair();
    let relevant: Vec<&Position> = open_positions
        .iter()
        .filter(|p| p.is_open() && p.owner_id == order.owner_id && p.pair() == pair)
        .collect();

    let same: Vec<&Position> = relevant.iter().copied().filter(|p| p.side == order.side).collect();
    if let Some(mismatch) = same.iter().find(|p| p.leverage != order.leverage) {
        return Err(OrderError::LeverageMismatch {
            requested: order.leverage,
            required: mismatch.leverage,
        });
    }

    let opposing: Vec<&Position> = relevant.iter().copied().filter(|p| p.side != order.side).collect();
    if !opposing.is_empty() && !order.confirm_reversal {
        let open_quantity = opposing.iter().map(|p| p.quantity).sum();
        return Err(OrderError::ReversalConfirmationRequired {
            side: opposing[0].side,
            open_quantity,
        });
    }

    let mut remaining = sizing.quantity;
    let mut fills = Vec::with_capacity(opposing.len());
    for position in opposing {
        if remaining <= Decimal::ZERO {
            break;
        }
        let fill = reverse_against(position, remaining, order.entry_price, fee_percentage, now)?;
        remaining -= fill.closed_quantity;
        fills.push(fill);
    }

    let total_credit = fills
        .iter()
        .try_fold(Decimal::ZERO, |acc, f| acc.checked_add(f.collateral_returned))
        .ok_or(Overflow)?;

    let remainder = if remaining > Decimal::ZERO {
        // Margin follows the quantity share that was not used for reversal.
        let remaining_margin = if remaining == sizing.quantity {
            sizing.margin
        } else {
            sizing
                .margin
                .checked_mul(remaining)
                .and_then(|m| m.checked_div(sizing.quantity))
                .ok_or(Overflow)?
        };
        Some(match same.first() {
            Some(existing) => Remainder::Merged {
                position: merge_into(
                    existing,
                    remaining,
                    remaining_margin,
                    order.entry_price,
                    order.take_profit,
                    order.stop_loss,
                )?,
                added_quantity: remaining,
                added_margin: remaining_margin,
            },
            None => Remainder::Opened {
                position: new_position(order, remaining, remaining_margin, now)?,
            },
        })
    } else {
        None
    };

    let margin_debit = match &remainder {
        Some(Remainder::Merged { added_margin, .. }) => *added_margin,
        Some(Remainder::Opened { position }) => position.margin_allocated,
        None => Decimal::ZERO,
    };

    Ok(OrderPlan {
        pair,
        sizing,
        fills,
        remainder,
        margin_debit,
        total_credit,
    })
}

/// Close up to `quantity` of an opposing position at `price`.
pub fn reverse_against(
    opposing: &Position,
    quantity: Decimal,
    price: Decimal,
    fee_percentage: Decimal,
    now: DateTime<Utc>,
) -> Result<ReversalFill, Overflow> {
    let closed_quantity = quantity.min(opposing.quantity);
    let ratio = closed_quantity.checked_div(opposing.quantity).ok_or(Overflow)?;
    let fully_closed = closed_quantity == opposing.quantity;

    let realized_pnl =
        position_math::unrealized_pnl(opposing.side, opposing.entry_price, price, closed_quantity)?;
    let fees = position_math::fees(realized_pnl, fee_percentage)?;
    let margin_share = if fully_closed {
        opposing.margin_allocated
    } else {
        opposing.margin_allocated.checked_mul(ratio).ok_or(Overflow)?
    };
    let collateral_returned =
        position_math::settlement_amount(margin_share, realized_pnl, fees)?.max(Decimal::ZERO);

    let mut position = opposing.clone();
    accumulate(&mut position, realized_pnl, fees)?;
    if fully_closed {
        position.status = PositionStatus::Closed;
        position.exit_price = Some(price);
        position.exit_time = Some(now);
        position.close_reason = Some(CloseReason::Reversal);
    } else {
        position.quantity = opposing.quantity - closed_quantity;
        position.margin_allocated = opposing.margin_allocated - margin_share;
        position.liquidation_price = position_liquidation_price(&position)?;
    }

    Ok(ReversalFill {
        position_id: opposing.id,
        closed_quantity,
        ratio,
        realized_pnl,
        fees,
        collateral_returned,
        fully_closed,
        position,
    })
}

/// Add a fill's realized pnl and fees onto the position's running totals.
fn accumulate(position: &mut Position, pnl: Decimal, fees: Decimal) -> Result<(), Overflow> {
    let realized = position.realized_pnl.unwrap_or_default().checked_add(pnl).ok_or(Overflow)?;
    let total_fees = position.fees.unwrap_or_default().checked_add(fees).ok_or(Overflow)?;
    position.realized_pnl = Some(realized);
    position.fees = Some(total_fees);
    Ok(())
}

/// Merge a same-direction fill into `existing` with a weighted entry price.
/// TP/SL are replaced only when the new order carries them.
pub fn merge_into(
    existing: &Position,
    quantity: Decimal,
    margin: Decimal,
    price: Decimal,
    take_profit: Option<Decimal>,
    stop_loss: Option<Decimal>,
) -> Result<Position, Overflow> {
    let total_quantity = existing.quantity.checked_add(quantity).ok_or(Overflow)?;
    let total_margin = existing.margin_allocated.checked_add(margin).ok_or(Overflow)?;
    let entry_price = existing
        .entry_price
        .checked_mul(existing.quantity)
        .zip(price.checked_mul(quantity))
        .and_then(|(a, b)| a.checked_add(b))
        .and_then(|weighted| weighted.checked_div(total_quantity))
        .ok_or(Overflow)?;

    let mut merged = existing.clone();
    merged.quantity = total_quantity;
    merged.margin_allocated = total_margin;
    merged.entry_price = entry_price;
    if take_profit.is_some() {
        merged.take_profit = take_profit;
    }
    if stop_loss.is_some() {
        merged.stop_loss = stop_loss;
    }
    merged.liquidation_price = position_liquidation_price(&merged)?;
    Ok(merged)
}

pub fn new_position(
    order: &OrderRequest,
    quantity: Decimal,
    margin: Decimal,
    now: DateTime<Utc>,
) -> Result<Position, Overflow> {
    let mut position = Position {
        id: Uuid::new_v4(),
        owner_id: order.owner_id.clone(),
        symbol: order.symbol.to_uppercase(),
        base_currency: order.base_currency.to_uppercase(),
        side: order.side,
        entry_price: order.entry_price,
        quantity,
        margin_allocated: margin,
        leverage: order.leverage,
        liquidation_price: None,
        take_profit: order.take_profit,
        stop_loss: order.stop_loss,
        status: PositionStatus::Open,
        entry_time: now,
        exit_price: None,
        exit_time: None,
        fees: None,
        realized_pnl: None,
        liquidated: false,
        close_reason: None,
    };
    position.liquidation_price = position_liquidation_price(&position)?;
    Ok(position)
}

/// Closing snapshot of `position` at `price` and the amount to credit back.
///
/// Liquidations and orderly closes both credit `margin + pnl − fees`
/// floored at zero; only liquidations set the `liquidated` flag.
pub fn close_at(
    position: &Position,
    price: Decimal,
    reason: CloseReason,
    fee_percentage: Decimal,
    now: DateTime<Utc>,
) -> Result<(Position, Decimal), Overflow> {
    let pnl = position_math::unrealized_pnl(position.side, position.entry_price, price, position.quantity)?;
    let fees = position_math::fees(pnl, fee_percentage)?;
    let settlement =
        position_math::settlement_amount(position.margin_allocated, pnl, fees)?.max(Decimal::ZERO);

    let mut closed = position.clone();
    accumulate(&mut closed, pnl, fees)?;
    closed.status = PositionStatus::Closed;
    closed.exit_price = Some(price);
    closed.exit_time = Some(now);
    closed.liquidated = reason == CloseReason::Liquidation;
    closed.close_reason = Some(reason);
    Ok((closed, settlement))
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub fn open_position(
        side: Side,
        entry_price: Decimal,
        quantity: Decimal,
        margin: Decimal,
        leverage: Decimal,
    ) -> Position {
        let order = OrderRequest {
            owner_id: "alice".into(),
            symbol: "BTC".into(),
            base_currency: "USDT".into(),
            side,
            quantity: Some(quantity),
            amount: None,
            entry_price,
            leverage,
            take_profit: None,
            stop_loss: None,
            confirm_reversal: false,
        };
        new_position(&order, quantity, margin, Utc::now()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::open_position;
    use super::*;
    use rust_decimal_macros::dec;

    fn order(side: Side, quantity: Decimal, price: Decimal, leverage: Decimal) -> OrderRequest {
        OrderRequest {
            owner_id: "alice".into(),
            symbol: "BTC".into(),
            base_currency: "USDT".into(),
            side,
            quantity: Some(quantity),
            amount: None,
            entry_price: price,
            leverage,
            take_profit: None,
            stop_loss: None,
            confirm_reversal: false,
        }
    }

    fn plan(order: &OrderRequest, open: &[Position]) -> Result<OrderPlan, OrderError> {
        plan_order(order, open, Decimal::ZERO, dec!(125), Utc::now())
    }

    #[test]
    fn test_amount_is_converted_to_quantity() {
        let mut o = order(Side::Buy, dec!(0), dec!(50000), dec!(10));
        o.quantity = None;
        o.amount = Some(dec!(500));
        let sizing = size_order(&o, dec!(125)).unwrap();
        assert_eq!(sizing.quantity, dec!(0.1));
        assert_eq!(sizing.margin, dec!(500));
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let o = order(Side::Buy, dec!(0), dec!(100), dec!(10));
        assert!(matches!(size_order(&o, dec!(125)), Err(OrderError::InvalidQuantity(_))));

        let o = order(Side::Buy, dec!(1), dec!(0), dec!(10));
        assert!(matches!(size_order(&o, dec!(125)), Err(OrderError::InvalidPrice(_))));

        let o = order(Side::Buy, dec!(1), dec!(100), dec!(200));
        assert!(matches!(size_order(&o, dec!(125)), Err(OrderError::InvalidLeverage { .. })));
    }

    #[test]
    fn test_out_of_range_size_rejected() {
        let huge = Decimal::from_i128_with_scale(10i128.pow(25), 0);
        let o = order(Side::Buy, huge, dec!(100000), dec!(10));
        assert!(matches!(size_order(&o, dec!(125)), Err(OrderError::InvalidQuantity(q)) if q == huge));

        let mut o = order(Side::Buy, dec!(0), dec!(0.0001), dec!(100));
        o.quantity = None;
        o.amount = Some(Decimal::MAX);
        assert!(matches!(size_order(&o, dec!(125)), Err(OrderError::InvalidQuantity(_))));
    }

    #[test]
    fn test_risk_controls_must_bracket_entry() {
        assert!(validate_risk_controls(Side::Buy, dec!(100), Some(dec!(110)), Some(dec!(90))).is_ok());
        assert!(validate_risk_controls(Side::Sell, dec!(100), Some(dec!(90)), Some(dec!(110))).is_ok());
        assert!(matches!(
            validate_risk_controls(Side::Buy, dec!(100), Some(dec!(95)), None),
            Err(OrderError::InvalidRiskControl(_))
        ));
        assert!(matches!(
            validate_risk_controls(Side::Sell, dec!(100), None, Some(dec!(95))),
            Err(OrderError::InvalidRiskControl(_))
        ));
    }

    #[test]
    fn test_no_position_opens_new() {
        let o = order(Side::Buy, dec!(1), dec!(100), dec!(10));
        let plan = plan(&o, &[]).unwrap();
        assert!(plan.fills.is_empty());
        let Some(Remainder::Opened { position }) = &plan.remainder else {
            panic!("expected a new position");
        };
        assert_eq!(position.quantity, dec!(1));
        assert_eq!(position.margin_allocated, dec!(10));
        assert_eq!(position.liquidation_price, Some(dec!(90.5)));
        assert_eq!(plan.margin_debit, dec!(10));
    }

    #[test]
    fn test_leverage_mismatch_rejected() {
        let existing = open_position(Side::Buy, dec!(100), dec!(1), dec!(10), dec!(10));
        let o = order(Side::Buy, dec!(1), dec!(100), dec!(20));
        match plan(&o, &[existing]) {
            Err(OrderError::LeverageMismatch { required, .. }) => assert_eq!(required, dec!(10)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_reversal_requires_confirmation() {
        let existing = open_position(Side::Buy, dec!(100), dec!(1), dec!(10), dec!(10));
        let o = order(Side::Sell, dec!(0.5), dec!(100), dec!(10));
        assert!(matches!(
            plan(&o, &[existing]),
            Err(OrderError::ReversalConfirmationRequired { .. })
        ));
    }

    #[test]
    fn test_merge_preserves_totals_and_averages_entry() {
        let existing = open_position(Side::Buy, dec!(100), dec!(1), dec!(10), dec!(10));
        let o = order(Side::Buy, dec!(1), dec!(120), dec!(10));
        let plan = plan(&o, &[existing.clone()]).unwrap();
        let Some(Remainder::Merged { position, added_margin, .. }) = &plan.remainder else {
            panic!("expected merge");
        };
        assert_eq!(position.id, existing.id);
        assert_eq!(position.quantity, dec!(2));
        assert_eq!(position.margin_allocated, existing.margin_allocated + *added_margin);
        assert_eq!(*added_margin, dec!(12));
        assert_eq!(position.entry_price, dec!(110));
        assert!(position.entry_price > dec!(100) && position.entry_price < dec!(120));
        // required margin 22 equals total margin: no extra margin term
        assert_eq!(position.liquidation_price, Some(dec!(99.55)));
    }

    #[test]
    fn test_merge_recomputes_stale_liquidation_price() {
        let mut existing = open_position(Side::Buy, dec!(100), dec!(1), dec!(10), dec!(10));
        existing.liquidation_price = Some(dec!(1));
        let o = order(Side::Buy, dec!(1), dec!(100), dec!(10));
        let plan = plan(&o, &[existing]).unwrap();
        assert_eq!(plan.remainder.unwrap().position().liquidation_price, Some(dec!(90.5)));
    }

    #[test]
    fn test_partial_reversal_keeps_remaining_proportional() {
        let existing = open_position(Side::Buy, dec!(50000), dec!(1), dec!(500), dec!(100));
        let mut o = order(Side::Sell, dec!(0.5), dec!(51000), dec!(100));
        o.confirm_reversal = true;
        let plan = plan(&o, &[existing.clone()]).unwrap();

        assert!(plan.remainder.is_none());
        assert_eq!(plan.margin_debit, Decimal::ZERO);
        let fill = &plan.fills[0];
        assert!(!fill.fully_closed);
        assert_eq!(fill.ratio, dec!(0.5));
        assert_eq!(fill.realized_pnl, dec!(500));
        assert_eq!(fill.collateral_returned, dec!(750));
        assert_eq!(fill.position.quantity, dec!(0.5));
        assert_eq!(fill.position.margin_allocated, dec!(250));
        assert_eq!(fill.position.liquidation_price, existing.liquidation_price);
        assert!(fill.position.is_open());
    }

    #[test]
    fn test_full_reversal_closes_opposing() {
        let existing = open_position(Side::Sell, dec!(100), dec!(1), dec!(10), dec!(10));
        let mut o = order(Side::Buy, dec!(1), dec!(90), dec!(10));
        o.confirm_reversal = true;
        let plan = plan(&o, &[existing]).unwrap();

        let fill = &plan.fills[0];
        assert!(fill.fully_closed);
        assert_eq!(fill.realized_pnl, dec!(10));
        assert_eq!(fill.collateral_returned, dec!(20));
        assert_eq!(fill.position.status, PositionStatus::Closed);
        assert_eq!(fill.position.exit_price, Some(dec!(90)));
        assert_eq!(fill.position.close_reason, Some(CloseReason::Reversal));
        assert!(plan.remainder.is_none());
    }

    #[test]
    fn test_reversal_overflow_opens_new_with_proportional_margin() {
        let existing = open_position(Side::Sell, dec!(100), dec!(1), dec!(10), dec!(10));
        let mut o = order(Side::Buy, dec!(4), dec!(100), dec!(10));
        o.confirm_reversal = true;
        let plan = plan(&o, &[existing]).unwrap();

        assert_eq!(plan.fills.len(), 1);
        let Some(Remainder::Opened { position }) = &plan.remainder else {
            panic!("expected new position");
        };
        assert_eq!(position.side, Side::Buy);
        assert_eq!(position.quantity, dec!(3));
        // order margin 40, 3/4 of it stays with the new position
        assert_eq!(position.margin_allocated, dec!(30));
        assert_eq!(plan.margin_debit, dec!(30));
    }

    #[test]
    fn test_multi_position_reversal_conserves_margin() {
        let a = open_position(Side::Buy, dec!(100), dec!(1), dec!(10), dec!(10));
        let b = open_position(Side::Buy, dec!(100), dec!(0.5), dec!(5), dec!(10));
        // Two opposing buys only happen with different leverage in practice;
        // the planner consumes them in the order given.
        let mut o = order(Side::Sell, dec!(2), dec!(100), dec!(10));
        o.confirm_reversal = true;
        let plan = plan(&o, &[a, b]).unwrap();

        assert_eq!(plan.fills.len(), 2);
        assert!(plan.fills.iter().all(|f| f.fully_closed));
        assert_eq!(plan.total_credit, dec!(15));
        assert_eq!(plan.margin_debit, dec!(5));
        assert_eq!(plan.total_credit + plan.margin_debit, plan.sizing.margin);
    }

    #[test]
    fn test_reversal_stops_when_quantity_consumed() {
        let a = open_position(Side::Buy, dec!(100), dec!(1), dec!(10), dec!(10));
        let b = open_position(Side::Buy, dec!(100), dec!(1), dec!(10), dec!(10));
        let mut o = order(Side::Sell, dec!(1), dec!(100), dec!(10));
        o.confirm_reversal = true;
        let plan = plan(&o, &[a, b]).unwrap();
        assert_eq!(plan.fills.len(), 1);
        assert!(plan.remainder.is_none());
    }

    #[test]
    fn test_losing_reversal_credit_is_floored() {
        let existing = open_position(Side::Buy, dec!(100), dec!(1), dec!(10), dec!(10));
        let fill = reverse_against(&existing, dec!(1), dec!(80), Decimal::ZERO, Utc::now()).unwrap();
        assert_eq!(fill.realized_pnl, dec!(-20));
        assert_eq!(fill.collateral_returned, Decimal::ZERO);
    }

    #[test]
    fn test_other_owners_and_pairs_ignored() {
        let mut other_owner = open_position(Side::Sell, dec!(100), dec!(1), dec!(10), dec!(10));
        other_owner.owner_id = "bob".into();
        let mut other_pair = open_position(Side::Sell, dec!(100), dec!(1), dec!(10), dec!(10));
        other_pair.symbol = "ETH".into();
        let o = order(Side::Buy, dec!(1), dec!(100), dec!(10));
        let plan = plan(&o, &[other_owner, other_pair]).unwrap();
        assert!(plan.fills.is_empty());
        assert!(matches!(plan.remainder, Some(Remainder::Opened { .. })));
    }

    #[test]
    fn test_close_at_flags_liquidation_and_floors_credit() {
        let position = open_position(Side::Buy, dec!(50000), dec!(1), dec!(500), dec!(100));
        let (closed, credit) =
            close_at(&position, dec!(49700), CloseReason::Liquidation, dec!(0.1), Utc::now()).unwrap();
        assert!(closed.liquidated);
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.realized_pnl, Some(dec!(-300)));
        assert_eq!(credit, dec!(200));

        let (_, credit) =
            close_at(&position, dec!(49000), CloseReason::StopLoss, dec!(0.1), Utc::now()).unwrap();
        assert_eq!(credit, Decimal::ZERO);

        let (closed, credit) =
            close_at(&position, dec!(51000), CloseReason::TakeProfit, dec!(0.1), Utc::now()).unwrap();
        assert!(!closed.liquidated);
        assert_eq!(closed.fees, Some(dec!(1)));
        assert_eq!(credit, dec!(1499));
    }

    #[test]
    fn test_close_at_far_price_is_an_error() {
        let huge = Decimal::from_i128_with_scale(10i128.pow(24), 0);
        let position = open_position(Side::Buy, dec!(10), huge, huge * dec!(5), dec!(2));
        let result = close_at(&position, dec!(100000000), CloseReason::TakeProfit, dec!(0.1), Utc::now());
        assert_eq!(result, Err(Overflow));

        let (_, credit) =
            close_at(&position, dec!(11), CloseReason::TakeProfit, dec!(0.1), Utc::now()).unwrap();
        assert_eq!(credit, huge * dec!(5.999));
    }
}
