use anyhow::Result;
use sqlx::{Pool, Sqlite};

pub const GITHUB_SOURCE: &str = "github";

/// Record a webhook delivery id. Returns true only for the first caller to
/// record `event_id`; every later or concurrent caller gets false and must
/// not apply the delivery's side effects.
pub async fn record_if_new(event_id: &str, source: &str, pool: &Pool<Sqlite>) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO WebhookEvents (event_id, source) VALUES (?, ?)
         ON CONFLICT(event_id) DO NOTHING",
    )
    .bind(event_id)
    .bind(source)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Forget a delivery whose processing failed, so a manual redelivery from
/// GitHub is applied instead of being dropped as a duplicate.
pub async fn release(event_id: &str, pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query("DELETE FROM WebhookEvents WHERE event_id = ?")
        .bind(event_id)
        .execute(pool)
        .await?;

    Ok(())
}
