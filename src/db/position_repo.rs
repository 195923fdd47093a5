use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgExecutor;
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::{CloseReason, Position, PositionPatch, PositionStatus, Side};

use super::StoreError;

/// Database row for the positions table.
#[derive(Debug, Clone, FromRow)]
pub struct PositionRow {
    pub id: Uuid,
    pub owner_id: String,
    pub symbol: String,
    pub base_currency: String,
    pub side: String,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub margin_allocated: Decimal,
    pub leverage: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub status: String,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub fees: Option<Decimal>,
    pub realized_pnl: Option<Decimal>,
    pub liquidated: bool,
    pub close_reason: Option<String>,
}

impl TryFrom<PositionRow> for Position {
    type Error = StoreError;

    fn try_from(row: PositionRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StoreError::Corrupt { id: row.id, reason };
        let side = Side::from_api_str(&row.side)
            .ok_or_else(|| corrupt(format!("unknown side '{}'", row.side)))?;
        let status = PositionStatus::from_db_str(&row.status)
            .ok_or_else(|| corrupt(format!("unknown status '{}'", row.status)))?;
        let close_reason = match row.close_reason.as_deref() {
            Some(s) => Some(
                CloseReason::from_db_str(s).ok_or_else(|| corrupt(format!("unknown close reason '{s}'")))?,
            ),
            None => None,
        };

        Ok(Position {
            id: row.id,
            owner_id: row.owner_id,
            symbol: row.symbol,
            base_currency: row.base_currency,
            side,
            entry_price: row.entry_price,
            quantity: row.quantity,
            margin_allocated: row.margin_allocated,
            leverage: row.leverage,
            liquidation_price: row.liquidation_price,
            take_profit: row.take_profit,
            stop_loss: row.stop_loss,
            status,
            entry_time: row.entry_time,
            exit_price: row.exit_price,
            exit_time: row.exit_time,
            fees: row.fees,
            realized_pnl: row.realized_pnl,
            liquidated: row.liquidated,
            close_reason,
        })
    }
}

fn into_positions(rows: Vec<PositionRow>) -> Result<Vec<Position>, StoreError> {
    rows.into_iter().map(Position::try_from).collect()
}

/// Get all open positions, oldest first.
pub async fn get_open_positions<'e>(db: impl PgExecutor<'e>) -> Result<Vec<Position>, StoreError> {
    let rows = sqlx::query_as::<_, PositionRow>(
        "SELECT * FROM positions WHERE status = 'open' ORDER BY entry_time ASC",
    )
    .fetch_all(db)
    .await?;

    into_positions(rows)
}

/// Open positions of one owner settled in `base_currency`. Callers narrow
/// further by normalized pair.
pub async fn get_open_positions_for_owner<'e>(
    db: impl PgExecutor<'e>,
    owner_id: &str,
    base_currency: &str,
) -> Result<Vec<Position>, StoreError> {
    let rows = sqlx::query_as::<_, PositionRow>(
        r#"
        SELECT * FROM positions
        WHERE owner_id = $1 AND UPPER(base_currency) = UPPER($2) AND status = 'open'
        ORDER BY entry_time ASC
        "#,
    )
    .bind(owner_id)
    .bind(base_currency)
    .fetch_all(db)
    .await?;

    into_positions(rows)
}

pub async fn get_position<'e>(db: impl PgExecutor<'e>, id: Uuid) -> Result<Option<Position>, StoreError> {
    let row = sqlx::query_as::<_, PositionRow>("SELECT * FROM positions WHERE id = $1")
        .bind(id)
        .fetch_optional(db)
        .await?;

    row.map(Position::try_from).transpose()
}

/// All positions (open and closed), newest first.
pub async fn get_all_positions<'e>(
    db: impl PgExecutor<'e>,
    owner_id: Option<&str>,
) -> Result<Vec<Position>, StoreError> {
    let rows = sqlx::query_as::<_, PositionRow>(
        r#"
        SELECT * FROM positions
        WHERE ($1::TEXT IS NULL OR owner_id = $1)
        ORDER BY entry_time DESC
        LIMIT 500
        "#,
    )
    .bind(owner_id)
    .fetch_all(db)
    .await?;

    into_positions(rows)
}

pub async fn insert_position<'e>(db: impl PgExecutor<'e>, p: &Position) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO positions (
            id, owner_id, symbol, base_currency, side, entry_price, quantity,
            margin_allocated, leverage, liquidation_price, take_profit, stop_loss,
            status, entry_time, exit_price, exit_time, fees, realized_pnl,
            liquidated, close_reason
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
        "#,
    )
    .bind(p.id)
    .bind(&p.owner_id)
    .bind(&p.symbol)
    .bind(&p.base_currency)
    .bind(p.side.as_str())
    .bind(p.entry_price)
    .bind(p.quantity)
    .bind(p.margin_allocated)
    .bind(p.leverage)
    .bind(p.liquidation_price)
    .bind(p.take_profit)
    .bind(p.stop_loss)
    .bind(p.status.as_str())
    .bind(p.entry_time)
    .bind(p.exit_price)
    .bind(p.exit_time)
    .bind(p.fees)
    .bind(p.realized_pnl)
    .bind(p.liquidated)
    .bind(p.close_reason.map(|r| r.as_str()))
    .execute(db)
    .await?;

    Ok(())
}

/// Apply a patch to an open position. Returns `false` if no open row matched.
///
/// Nullable columns carry a separate "set" flag so a patch can clear them.
pub async fn update_open_position<'e>(
    db: impl PgExecutor<'e>,
    id: Uuid,
    patch: &PositionPatch,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE positions SET
            entry_price       = COALESCE($2, entry_price),
            quantity          = COALESCE($3, quantity),
            margin_allocated  = COALESCE($4, margin_allocated),
            liquidation_price = CASE WHEN $5 THEN $6 ELSE liquidation_price END,
            take_profit       = CASE WHEN $7 THEN $8 ELSE take_profit END,
            stop_loss         = CASE WHEN $9 THEN $10 ELSE stop_loss END,
            status            = COALESCE($11, status),
            exit_price        = COALESCE($12, exit_price),
            exit_time         = COALESCE($13, exit_time),
            fees              = COALESCE($14, fees),
            realized_pnl      = COALESCE($15, realized_pnl),
            liquidated        = COALESCE($16, liquidated),
            close_reason      = COALESCE($17, close_reason)
        WHERE id = $1 AND status = 'open'
        "#,
    )
    .bind(id)
    .bind(patch.entry_price)
    .bind(patch.quantity)
    .bind(patch.margin_allocated)
    .bind(patch.liquidation_price.is_some())
    .bind(patch.liquidation_price.flatten())
    .bind(patch.take_profit.is_some())
    .bind(patch.take_profit.flatten())
    .bind(patch.stop_loss.is_some())
    .bind(patch.stop_loss.flatten())
    .bind(patch.status.map(|s| s.as_str()))
    .bind(patch.exit_price)
    .bind(patch.exit_time)
    .bind(patch.fees)
    .bind(patch.realized_pnl)
    .bind(patch.liquidated)
    .bind(patch.close_reason.map(|r| r.as_str()))
    .execute(db)
    .await?;

    Ok(result.rows_affected() > 0)
}
