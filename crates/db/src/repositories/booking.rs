//! Row operations for `bookings`. Executor-generic for the same reason as the
//! queue module: conflict re-validation runs inside a calendar scope lock.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteExecutor};

use bookline_core::domain::booking::{Booking, BookingDetails, BookingId, BookingStatus};

use super::{
    format_date, format_time, format_timestamp, parse_date, parse_time, parse_timestamp, parse_u32,
    RepositoryError,
};

const BOOKING_COLUMNS: &str = "id, project_id, specialist, booking_date, start_time, \
     duration_slots, client_id, client_name, service, client_phone, status, created_at, updated_at";

pub async fn insert<'e, E>(executor: E, booking: &Booking) -> Result<(), RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "INSERT INTO bookings (
            id,
            project_id,
            specialist,
            booking_date,
            start_time,
            duration_slots,
            client_id,
            client_name,
            service,
            client_phone,
            status,
            created_at,
            updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&booking.id.0)
    .bind(&booking.project_id)
    .bind(&booking.specialist)
    .bind(format_date(booking.date))
    .bind(format_time(booking.start_time))
    .bind(i64::from(booking.duration_slots))
    .bind(&booking.client_id)
    .bind(booking.details.client_name.as_deref())
    .bind(booking.details.service.as_deref())
    .bind(booking.details.client_phone.as_deref())
    .bind(booking.status.as_str())
    .bind(format_timestamp(booking.created_at))
    .bind(format_timestamp(booking.updated_at))
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn find_by_id<'e, E>(
    executor: E,
    id: &BookingId,
) -> Result<Option<Booking>, RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = ?");
    let row = sqlx::query(&sql).bind(&id.0).fetch_optional(executor).await?;
    row.map(booking_from_row).transpose()
}

/// Active bookings for one specialist's day, ordered by start time. `exclude`
/// drops the booking being changed from its own conflict check.
pub async fn active_for_specialist_day<'e, E>(
    executor: E,
    project_id: &str,
    specialist: &str,
    date: NaiveDate,
    exclude: Option<&BookingId>,
) -> Result<Vec<Booking>, RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    let sql = format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings
         WHERE project_id = ? AND specialist = ? AND booking_date = ? AND status = 'active'
           AND (? IS NULL OR id != ?)
         ORDER BY start_time ASC"
    );

    let excluded = exclude.map(|id| id.0.as_str());
    let rows = sqlx::query(&sql)
        .bind(project_id)
        .bind(specialist)
        .bind(format_date(date))
        .bind(excluded)
        .bind(excluded)
        .fetch_all(executor)
        .await?;

    rows.into_iter().map(booking_from_row).collect()
}

/// Project ids with at least one booking row. Drives the reconciliation
/// sweep, which only heals projects the local store already knows about.
pub async fn distinct_projects<'e, E>(executor: E) -> Result<Vec<String>, RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    let rows = sqlx::query("SELECT DISTINCT project_id FROM bookings ORDER BY project_id ASC")
        .fetch_all(executor)
        .await?;

    rows.into_iter()
        .map(|row| row.try_get::<String, _>("project_id").map_err(RepositoryError::from))
        .collect()
}

pub async fn set_status<'e, E>(
    executor: E,
    id: &BookingId,
    status: BookingStatus,
    updated_at: DateTime<Utc>,
) -> Result<(), RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query("UPDATE bookings SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(format_timestamp(updated_at))
        .bind(&id.0)
        .execute(executor)
        .await?;

    Ok(())
}

/// Moves a booking to a new slot in place, preserving its identity and
/// creation history. Client metadata is overwritten alongside the schedule.
#[allow(clippy::too_many_arguments)]
pub async fn reschedule<'e, E>(
    executor: E,
    id: &BookingId,
    specialist: &str,
    date: NaiveDate,
    start_time: NaiveTime,
    duration_slots: u32,
    details: &BookingDetails,
    updated_at: DateTime<Utc>,
) -> Result<(), RepositoryError>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query(
        "UPDATE bookings
         SET specialist = ?,
             booking_date = ?,
             start_time = ?,
             duration_slots = ?,
             client_name = ?,
             service = ?,
             client_phone = ?,
             updated_at = ?
         WHERE id = ?",
    )
    .bind(specialist)
    .bind(format_date(date))
    .bind(format_time(start_time))
    .bind(i64::from(duration_slots))
    .bind(details.client_name.as_deref())
    .bind(details.service.as_deref())
    .bind(details.client_phone.as_deref())
    .bind(format_timestamp(updated_at))
    .bind(&id.0)
    .execute(executor)
    .await?;

    Ok(())
}

fn booking_from_row(row: SqliteRow) -> Result<Booking, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = BookingStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown booking status `{status_raw}`")))?;

    Ok(Booking {
        id: BookingId(row.try_get("id")?),
        project_id: row.try_get("project_id")?,
        specialist: row.try_get("specialist")?,
        date: parse_date("booking_date", row.try_get("booking_date")?)?,
        start_time: parse_time("start_time", row.try_get("start_time")?)?,
        duration_slots: parse_u32("duration_slots", row.try_get("duration_slots")?)?,
        client_id: row.try_get("client_id")?,
        details: BookingDetails {
            client_name: row.try_get("client_name")?,
            service: row.try_get("service")?,
            client_phone: row.try_get("client_phone")?,
        },
        status,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
