//! Row operations for `queued_messages`.
//!
//! Every function is generic over the executor so the coordinator can run the
//! same queries inside a scope-lock transaction or against the plain pool.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor};

use bookline_core::domain::message::{MessageStatus, QueuedMessage, QueuedMessageId};

use super::{format_timestamp, parse_timestamp, parse_u32, RepositoryError};

pub async fn insert<'e, E>(executor: E, message: &QueuedMessage) -> Result<(), RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO queued_messages (
            id,
            project_id,
            client_id,
            original_text,
            aggregated_text,
            status,
            retry_count,
            created_at,
            updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&message.id.0)
    .bind(&message.project_id)
    .bind(&message.client_id)
    .bind(&message.original_text)
    .bind(&message.aggregated_text)
    .bind(message.status.as_str())
    .bind(i64::from(message.retry_count))
    .bind(format_timestamp(message.created_at))
    .bind(format_timestamp(message.updated_at))
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn find_by_id<'e, E>(
    executor: E,
    id: &QueuedMessageId,
) -> Result<Option<QueuedMessage>, RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(
        "SELECT id, project_id, client_id, original_text, aggregated_text, status,
                retry_count, created_at, updated_at
         FROM queued_messages
         WHERE id = ?",
    )
    .bind(&id.0)
    .fetch_optional(executor)
    .await?;

    row.map(message_from_row).transpose()
}

/// Rows for one client in any of `statuses`, oldest first. Creation order is
/// total: ties on `created_at` fall back to insertion order.
pub async fn list_for_client<'e, E>(
    executor: E,
    project_id: &str,
    client_id: &str,
    statuses: &[MessageStatus],
) -> Result<Vec<QueuedMessage>, RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    if statuses.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; statuses.len()].join(", ");
    let sql = format!(
        "SELECT id, project_id, client_id, original_text, aggregated_text, status,
                retry_count, created_at, updated_at
         FROM queued_messages
         WHERE project_id = ? AND client_id = ? AND status IN ({placeholders})
         ORDER BY created_at ASC, rowid ASC"
    );

    let mut query = sqlx::query(&sql).bind(project_id).bind(client_id);
    for status in statuses {
        query = query.bind(status.as_str());
    }

    let rows = query.fetch_all(executor).await?;
    rows.into_iter().map(message_from_row).collect()
}

/// Every row for one client regardless of status, oldest first. Winner
/// arbitration needs the full set, terminal and superseded rows included.
pub async fn list_all_for_client<'e, E>(
    executor: E,
    project_id: &str,
    client_id: &str,
) -> Result<Vec<QueuedMessage>, RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    let rows = sqlx::query(
        "SELECT id, project_id, client_id, original_text, aggregated_text, status,
                retry_count, created_at, updated_at
         FROM queued_messages
         WHERE project_id = ? AND client_id = ?
         ORDER BY created_at ASC, rowid ASC",
    )
    .bind(project_id)
    .bind(client_id)
    .fetch_all(executor)
    .await?;

    rows.into_iter().map(message_from_row).collect()
}

pub async fn set_status<'e, E>(
    executor: E,
    id: &QueuedMessageId,
    status: MessageStatus,
    updated_at: DateTime<Utc>,
) -> Result<(), RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query("UPDATE queued_messages SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(format_timestamp(updated_at))
        .bind(&id.0)
        .execute(executor)
        .await?;

    Ok(())
}

fn message_from_row(row: SqliteRow) -> Result<QueuedMessage, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = MessageStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown queued message status `{status_raw}`"))
    })?;

    Ok(QueuedMessage {
        id: QueuedMessageId(row.try_get("id")?),
        project_id: row.try_get("project_id")?,
        client_id: row.try_get("client_id")?,
        original_text: row.try_get("original_text")?,
        aggregated_text: row.try_get("aggregated_text")?,
        status,
        retry_count: parse_u32("retry_count", row.try_get("retry_count")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
