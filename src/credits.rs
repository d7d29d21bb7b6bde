use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use tracing::info;
use uuid::Uuid;

use crate::database::{now_iso, ComicFormat};
use crate::error::{PipelineError, Result};

/// Static cost table consulted at precheck and deduction time.
pub fn format_cost(format: ComicFormat) -> i64 {
    match format {
        ComicFormat::SinglePanel => 5,
        ComicFormat::ThreePanel => 8,
        ComicFormat::FourPanel => 10,
        ComicFormat::FivePage => 15,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    pub description: String,
    pub related_type: Option<String>,
    pub related_id: Option<String>,
    pub created_at: String,
}

pub async fn balance(pool: &Pool<Sqlite>, user_id: &str) -> Result<i64> {
    let row = sqlx::query(r#"SELECT balance FROM credits WHERE user_id = ?1"#)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

    Ok(match row {
        Some(r) => r.try_get("balance")?,
        None => 0,
    })
}

/// Precheck only; does not reserve anything.
pub async fn check(pool: &Pool<Sqlite>, user_id: &str, amount: i64) -> Result<i64> {
    let current = balance(pool, user_id).await?;
    if current < amount {
        return Err(PipelineError::InsufficientCredits {
            required: amount,
            balance: current,
        });
    }
    Ok(current)
}

/// Add credits and record the grant in the ledger.
pub async fn grant(pool: &Pool<Sqlite>, user_id: &str, amount: i64, description: &str) -> Result<i64> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO credits (user_id, balance) VALUES (?1, ?2)
        ON CONFLICT(user_id) DO UPDATE SET balance = balance + excluded.balance
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .execute(&mut *tx)
    .await?;

    insert_ledger_entry(&mut tx, user_id, amount, description, None, None).await?;

    let row = sqlx::query(r#"SELECT balance FROM credits WHERE user_id = ?1"#)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
    let new_balance: i64 = row.try_get("balance")?;

    tx.commit().await?;
    Ok(new_balance)
}

/// Atomically deduct `amount` from the user's balance and record the
/// transaction. The conditional UPDATE guards against a concurrent job
/// draining the same account: zero rows affected means the balance
/// dropped below `amount` since the precheck.
pub async fn deduct(
    pool: &Pool<Sqlite>,
    user_id: &str,
    amount: i64,
    description: &str,
    related_type: &str,
    related_id: &str,
) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let updated = sqlx::query(
        r#"UPDATE credits SET balance = balance - ?1 WHERE user_id = ?2 AND balance >= ?1"#,
    )
    .bind(amount)
    .bind(user_id)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 0 {
        let row = sqlx::query(r#"SELECT balance FROM credits WHERE user_id = ?1"#)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        let current: i64 = match row {
            Some(r) => r.try_get("balance")?,
            None => 0,
        };
        return Err(PipelineError::InsufficientCredits {
            required: amount,
            balance: current,
        });
    }

    insert_ledger_entry(
        &mut tx,
        user_id,
        -amount,
        description,
        Some(related_type),
        Some(related_id),
    )
    .await?;

    let row = sqlx::query(r#"SELECT balance FROM credits WHERE user_id = ?1"#)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
    let new_balance: i64 = row.try_get("balance")?;

    tx.commit().await?;
    info!(user_id, amount, new_balance, "credits deducted");
    Ok(new_balance)
}

async fn insert_ledger_entry(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    user_id: &str,
    amount: i64,
    description: &str,
    related_type: Option<&str>,
    related_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO credit_ledger (id, user_id, amount, description, related_type, related_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(amount)
    .bind(description)
    .bind(related_type)
    .bind(related_id)
    .bind(now_iso())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn ledger_for_user(pool: &Pool<Sqlite>, user_id: &str) -> Result<Vec<LedgerEntry>> {
    let rows = sqlx::query(
        r#"SELECT id, user_id, amount, description, related_type, related_id, created_at
           FROM credit_ledger WHERE user_id = ?1 ORDER BY created_at ASC"#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(LedgerEntry {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                amount: row.try_get("amount")?,
                description: row.try_get("description")?,
                related_type: row.try_get("related_type")?,
                related_id: row.try_get("related_id")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_db;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> Pool<Sqlite> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_db(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn empty_account_has_zero_balance() {
        let pool = memory_pool().await;
        assert_eq!(balance(&pool, "nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deduct_refuses_to_go_negative() {
        let pool = memory_pool().await;
        grant(&pool, "u1", 5, "signup bonus").await.unwrap();

        let err = deduct(&pool, "u1", 10, "comic", "comic", "c1").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientCredits { required: 10, balance: 5 }
        ));
        // Failed deduction leaves no ledger trace.
        let entries = ledger_for_user(&pool, "u1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(balance(&pool, "u1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn deduct_records_signed_ledger_entry() {
        let pool = memory_pool().await;
        grant(&pool, "u1", 20, "purchase").await.unwrap();

        let new_balance = deduct(&pool, "u1", 10, "four-panel comic", "comic", "c1")
            .await
            .unwrap();
        assert_eq!(new_balance, 10);

        let entries = ledger_for_user(&pool, "u1").await.unwrap();
        assert_eq!(entries.len(), 2);
        let debit = &entries[1];
        assert_eq!(debit.amount, -10);
        assert_eq!(debit.related_type.as_deref(), Some("comic"));
        assert_eq!(debit.related_id.as_deref(), Some("c1"));
    }

    #[test]
    fn cost_table_is_fixed_per_format() {
        assert_eq!(format_cost(ComicFormat::SinglePanel), 5);
        assert_eq!(format_cost(ComicFormat::FourPanel), 10);
        assert_eq!(format_cost(ComicFormat::FivePage), 15);
    }
}
