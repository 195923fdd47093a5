use rust_decimal::Decimal;
use sqlx::postgres::PgExecutor;

use super::StoreError;

pub async fn get_balance<'e>(
    db: impl PgExecutor<'e>,
    owner_id: &str,
    currency: &str,
) -> Result<Decimal, StoreError> {
    let row: Option<(Decimal,)> =
        sqlx::query_as("SELECT amount FROM balances WHERE owner_id = $1 AND currency = $2")
            .bind(owner_id)
            .bind(currency)
            .fetch_optional(db)
            .await?;

    Ok(row.map(|r| r.0).unwrap_or(Decimal::ZERO))
}

/// Add `delta` to a balance in a single statement, clamped at zero.
pub async fn credit_balance<'e>(
    db: impl PgExecutor<'e>,
    owner_id: &str,
    currency: &str,
    delta: Decimal,
) -> Result<Decimal, StoreError> {
    let row: (Decimal,) = sqlx::query_as(
        r#"
        INSERT INTO balances (owner_id, currency, amount)
        VALUES ($1, $2, GREATEST($3, 0))
        ON CONFLICT (owner_id, currency) DO UPDATE
            SET amount = GREATEST(balances.amount + $3, 0), updated_at = NOW()
        RETURNING amount
        "#,
    )
    .bind(owner_id)
    .bind(currency)
    .bind(delta)
    .fetch_one(db)
    .await?;

    Ok(row.0)
}

/// Subtract `amount` only if the balance covers it.
pub async fn debit_balance<'e>(
    db: impl PgExecutor<'e>,
    owner_id: &str,
    currency: &str,
    amount: Decimal,
) -> Result<Option<Decimal>, StoreError> {
    let row: Option<(Decimal,)> = sqlx::query_as(
        r#"
        UPDATE balances
        SET amount = amount - $3, updated_at = NOW()
        WHERE owner_id = $1 AND currency = $2 AND amount >= $3
        RETURNING amount
        "#,
    )
    .bind(owner_id)
    .bind(currency)
    .bind(amount)
    .fetch_optional(db)
    .await?;

    Ok(row.map(|r| r.0))
}
