//! Local cache of the spreadsheet mirror, one row per occupied slot. The
//! reconciler replaces a day's rows wholesale after each read of the mirror so
//! the cache never drifts from the last observed remote state.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor};

use super::{format_date, format_time, format_timestamp, parse_date, parse_time, parse_timestamp, RepositoryError};

/// One occupied slot as last seen in the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSlotRow {
    pub project_id: String,
    pub specialist: String,
    pub slot_date: NaiveDate,
    pub slot_time: NaiveTime,
    pub client_id: Option<String>,
    pub client_name: Option<String>,
    pub service: Option<String>,
    pub last_synced_at: DateTime<Utc>,
}

pub async fn upsert<'e, E>(executor: E, slot: &MirrorSlotRow) -> Result<(), RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO mirror_slots (
            project_id, specialist, slot_date, slot_time,
            client_id, client_name, service, last_synced_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (project_id, specialist, slot_date, slot_time) DO UPDATE SET
            client_id = excluded.client_id,
            client_name = excluded.client_name,
            service = excluded.service,
            last_synced_at = excluded.last_synced_at",
    )
    .bind(&slot.project_id)
    .bind(&slot.specialist)
    .bind(format_date(slot.slot_date))
    .bind(format_time(slot.slot_time))
    .bind(slot.client_id.as_deref())
    .bind(slot.client_name.as_deref())
    .bind(slot.service.as_deref())
    .bind(format_timestamp(slot.last_synced_at))
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn for_specialist_day<'e, E>(
    executor: E,
    project_id: &str,
    specialist: &str,
    date: NaiveDate,
) -> Result<Vec<MirrorSlotRow>, RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    let rows = sqlx::query(
        "SELECT project_id, specialist, slot_date, slot_time,
                client_id, client_name, service, last_synced_at
         FROM mirror_slots
         WHERE project_id = ? AND specialist = ? AND slot_date = ?
         ORDER BY slot_time ASC",
    )
    .bind(project_id)
    .bind(specialist)
    .bind(format_date(date))
    .fetch_all(executor)
    .await?;

    rows.into_iter().map(slot_from_row).collect()
}

/// Drops a day's cached rows and writes the freshly observed set in their
/// place. Must run inside one transaction so readers never see a half-replaced
/// day.
pub async fn replace_day(
    conn: &mut sqlx::SqliteConnection,
    project_id: &str,
    specialist: &str,
    date: NaiveDate,
    slots: &[MirrorSlotRow],
) -> Result<(), RepositoryError> {
    sqlx::query(
        "DELETE FROM mirror_slots WHERE project_id = ? AND specialist = ? AND slot_date = ?",
    )
    .bind(project_id)
    .bind(specialist)
    .bind(format_date(date))
    .execute(&mut *conn)
    .await?;

    for slot in slots {
        upsert(&mut *conn, slot).await?;
    }

    Ok(())
}

fn slot_from_row(row: SqliteRow) -> Result<MirrorSlotRow, RepositoryError> {
    Ok(MirrorSlotRow {
        project_id: row.try_get("project_id")?,
        specialist: row.try_get("specialist")?,
        slot_date: parse_date("slot_date", row.try_get("slot_date")?)?,
        slot_time: parse_time("slot_time", row.try_get("slot_time")?)?,
        client_id: row.try_get("client_id")?,
        client_name: row.try_get("client_name")?,
        service: row.try_get("service")?,
        last_synced_at: parse_timestamp("last_synced_at", row.try_get("last_synced_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

    use crate::{connect_with_settings, migrations, DbPool};

    use super::MirrorSlotRow;

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn slot(time: &str, client: &str) -> MirrorSlotRow {
        MirrorSlotRow {
            project_id: "salon".to_string(),
            specialist: "Anna".to_string(),
            slot_date: NaiveDate::from_ymd_opt(2026, 9, 1).expect("valid date"),
            slot_time: NaiveTime::parse_from_str(time, "%H:%M").expect("valid time"),
            client_id: Some(client.to_string()),
            client_name: Some("Maria".to_string()),
            service: Some("manicure".to_string()),
            last_synced_at: DateTime::parse_from_rfc3339("2026-08-30T10:00:00Z")
                .expect("valid rfc3339")
                .with_timezone(&Utc),
        }
    }

    #[tokio::test]
    async fn upsert_overwrites_slot_occupant() {
        let pool = setup_pool().await;

        super::upsert(&pool, &slot("10:00", "c-1")).await.expect("insert");
        super::upsert(&pool, &slot("10:00", "c-2")).await.expect("overwrite");

        let date = NaiveDate::from_ymd_opt(2026, 9, 1).expect("valid date");
        let rows = super::for_specialist_day(&pool, "salon", "Anna", date)
            .await
            .expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].client_id.as_deref(), Some("c-2"));

        pool.close().await;
    }

    #[tokio::test]
    async fn replace_day_swaps_the_full_set() {
        let pool = setup_pool().await;

        super::upsert(&pool, &slot("10:00", "c-1")).await.expect("insert");
        super::upsert(&pool, &slot("11:00", "c-1")).await.expect("insert");

        let date = NaiveDate::from_ymd_opt(2026, 9, 1).expect("valid date");
        let mut conn = pool.acquire().await.expect("acquire");
        super::replace_day(&mut conn, "salon", "Anna", date, &[slot("12:00", "c-9")])
            .await
            .expect("replace");
        drop(conn);

        let rows = super::for_specialist_day(&pool, "salon", "Anna", date)
            .await
            .expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].slot_time, NaiveTime::parse_from_str("12:00", "%H:%M").expect("time"));
        assert_eq!(rows[0].client_id.as_deref(), Some("c-9"));

        pool.close().await;
    }
}
