//! Periodic mirror reconciliation. The spreadsheet is the tie-break
//! authority: after a crash or a lost best-effort write, a sweep re-reads the
//! mirror and overwrites local state that differs. Divergent local bookings
//! are cancelled and occupied mirror runs with no local counterpart are
//! adopted as bookings.
//!
//! Each day is healed under the same calendar-scope lock the allocator takes,
//! so a sweep never clobbers an allocation in flight.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use bookline_core::domain::booking::{Booking, BookingDetails, BookingId, BookingStatus};
use bookline_core::errors::MirrorSyncError;
use bookline_core::schedule::SlotGrid;
use bookline_db::repositories::mirror_cache::MirrorSlotRow;
use bookline_db::repositories::{booking as booking_repo, mirror_cache, RepositoryError};
use bookline_db::{calendar_scope, DbPool, ScopeLock};

use crate::mirror::{MirrorSlot, MirrorStore};

/// Fallback client id for bookings adopted from mirror rows that carry no id,
/// for example rows typed into the spreadsheet by hand.
const ADOPTED_CLIENT_ID: &str = "mirror-import";

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Mirror(#[from] MirrorSyncError),
    #[error("store unavailable: {0}")]
    Store(String),
}

/// What one day's reconciliation changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DayReport {
    pub cancelled: usize,
    pub adopted: usize,
    pub remote_slots: usize,
}

impl DayReport {
    pub fn changed(&self) -> bool {
        self.cancelled > 0 || self.adopted > 0
    }
}

pub struct MirrorReconciler {
    pool: DbPool,
    grid: SlotGrid,
    mirror: Arc<dyn MirrorStore>,
}

impl MirrorReconciler {
    pub fn new(pool: DbPool, grid: SlotGrid, mirror: Arc<dyn MirrorStore>) -> Self {
        Self { pool, grid, mirror }
    }

    /// Heals one specialist's day against the mirror. The mirror is read
    /// before the lock is taken; if the read fails the day is left untouched.
    pub async fn reconcile_day(
        &self,
        project_id: &str,
        specialist: &str,
        date: NaiveDate,
    ) -> Result<DayReport, ReconcileError> {
        let remote = self.mirror.occupied_slots(project_id, specialist, date).await?;
        let remote_by_time = self.index_remote(&remote, specialist, date);

        let scope = calendar_scope(project_id, specialist, date);
        let mut lock = ScopeLock::acquire(&self.pool, &[scope]).await.map_err(store_err)?;

        let local =
            booking_repo::active_for_specialist_day(lock.conn(), project_id, specialist, date, None)
                .await
                .map_err(store_err)?;

        let now = Utc::now();
        let mut report = DayReport { remote_slots: remote_by_time.len(), ..DayReport::default() };
        let mut surviving: BTreeSet<NaiveTime> = BTreeSet::new();

        for booking in &local {
            if self.matches_remote(booking, &remote_by_time) {
                surviving.extend(booking.covered_slots(self.grid.slot_minutes()));
            } else {
                booking_repo::set_status(lock.conn(), &booking.id, BookingStatus::Cancelled, now)
                    .await
                    .map_err(store_err)?;
                report.cancelled += 1;
            }
        }

        let orphans: Vec<&MirrorSlot> = remote_by_time
            .values()
            .filter(|slot| !surviving.contains(&slot.time))
            .collect();
        for run in contiguous_runs(&orphans, self.grid.slot_minutes()) {
            let adopted = adopt_run(project_id, specialist, date, &run, now);
            booking_repo::insert(lock.conn(), &adopted).await.map_err(store_err)?;
            report.adopted += 1;
        }

        let cache_rows: Vec<MirrorSlotRow> = remote_by_time
            .values()
            .map(|slot| MirrorSlotRow {
                project_id: project_id.to_string(),
                specialist: specialist.to_string(),
                slot_date: date,
                slot_time: slot.time,
                client_id: slot.client_id.clone(),
                client_name: slot.client_name.clone(),
                service: slot.service.clone(),
                last_synced_at: now,
            })
            .collect();
        mirror_cache::replace_day(lock.conn(), project_id, specialist, date, &cache_rows)
            .await
            .map_err(store_err)?;

        lock.commit().await.map_err(store_err)?;
        Ok(report)
    }

    /// Endless sweep over every known project, configured specialist, and day
    /// in the horizon. Per-day failures are logged and the sweep moves on.
    pub async fn run_sweep(
        self: Arc<Self>,
        specialists: Vec<String>,
        interval: Duration,
        horizon_days: u32,
    ) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;

            let projects = match booking_repo::distinct_projects(&self.pool).await {
                Ok(projects) => projects,
                Err(error) => {
                    warn!(
                        event_name = "reconciler.project_scan_failed",
                        error = %error,
                        "skipping sweep pass"
                    );
                    continue;
                }
            };

            let today = Utc::now().date_naive();
            for project_id in &projects {
                for specialist in &specialists {
                    for offset in 0..i64::from(horizon_days) {
                        let date = today + chrono::Duration::days(offset);
                        match self.reconcile_day(project_id, specialist, date).await {
                            Ok(report) if report.changed() => info!(
                                event_name = "reconciler.day_healed",
                                project_id = %project_id,
                                specialist = %specialist,
                                date = %date,
                                cancelled = report.cancelled,
                                adopted = report.adopted,
                                "local store realigned with mirror"
                            ),
                            Ok(_) => {}
                            Err(error) => warn!(
                                event_name = "reconciler.day_failed",
                                project_id = %project_id,
                                specialist = %specialist,
                                date = %date,
                                error = %error,
                                "reconciliation pass failed"
                            ),
                        }
                    }
                }
            }
        }
    }

    /// Remote slots keyed by time, restricted to the business-hours grid.
    /// Off-grid rows cannot map onto a booking and are dropped with a warning.
    fn index_remote(
        &self,
        remote: &[MirrorSlot],
        specialist: &str,
        date: NaiveDate,
    ) -> BTreeMap<NaiveTime, MirrorSlot> {
        let grid_times: BTreeSet<NaiveTime> = self.grid.slot_starts().into_iter().collect();
        let mut by_time = BTreeMap::new();
        for slot in remote {
            if grid_times.contains(&slot.time) {
                by_time.insert(slot.time, slot.clone());
            } else {
                warn!(
                    event_name = "reconciler.off_grid_slot",
                    specialist = %specialist,
                    date = %date,
                    time = %slot.time,
                    "mirror row outside the slot grid, ignoring"
                );
            }
        }
        by_time
    }

    /// A local booking matches when every covered cell is occupied in the
    /// mirror and no cell names a different client. Cells without a client id
    /// in the mirror are treated as matching.
    fn matches_remote(
        &self,
        booking: &Booking,
        remote_by_time: &BTreeMap<NaiveTime, MirrorSlot>,
    ) -> bool {
        booking
            .covered_slots(self.grid.slot_minutes())
            .iter()
            .all(|time| match remote_by_time.get(time) {
                Some(slot) => slot
                    .client_id
                    .as_ref()
                    .map_or(true, |client_id| *client_id == booking.client_id),
                None => false,
            })
    }
}

/// Splits orphaned mirror slots into maximal contiguous same-client runs.
/// Input must be time-ordered.
fn contiguous_runs<'a>(orphans: &[&'a MirrorSlot], slot_minutes: u32) -> Vec<Vec<&'a MirrorSlot>> {
    let step = chrono::Duration::minutes(i64::from(slot_minutes));
    let mut runs: Vec<Vec<&MirrorSlot>> = Vec::new();
    for slot in orphans {
        match runs.last_mut() {
            Some(run) => {
                let last = run.last().expect("runs are never empty");
                if last.time + step == slot.time && last.client_id == slot.client_id {
                    run.push(slot);
                } else {
                    runs.push(vec![slot]);
                }
            }
            None => runs.push(vec![slot]),
        }
    }
    runs
}

fn adopt_run(
    project_id: &str,
    specialist: &str,
    date: NaiveDate,
    run: &[&MirrorSlot],
    now: chrono::DateTime<Utc>,
) -> Booking {
    let first = run.first().expect("runs are never empty");
    Booking {
        id: BookingId(Uuid::new_v4().to_string()),
        project_id: project_id.to_string(),
        specialist: specialist.to_string(),
        date,
        start_time: first.time,
        duration_slots: run.len() as u32,
        client_id: first.client_id.clone().unwrap_or_else(|| ADOPTED_CLIENT_ID.to_string()),
        details: BookingDetails {
            client_name: first.client_name.clone(),
            service: first.service.clone(),
            client_phone: None,
        },
        status: BookingStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

fn store_err(error: RepositoryError) -> ReconcileError {
    ReconcileError::Store(error.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{NaiveDate, NaiveTime};

    use bookline_core::domain::booking::BookingStatus;
    use bookline_core::schedule::SlotGrid;
    use bookline_db::repositories::{booking as booking_repo, mirror_cache};
    use bookline_db::{connect_with_settings, migrations, DbPool};

    use crate::allocator::{AllocationRequest, SlotAllocator};
    use crate::mirror::{InMemoryMirrorStore, MirrorSlot, MirrorStore};

    use super::{DayReport, MirrorReconciler, ReconcileError};

    fn grid() -> SlotGrid {
        SlotGrid::new(time("09:00"), time("18:00"), 30).expect("valid grid")
    }

    fn time(value: &str) -> NaiveTime {
        NaiveTime::parse_from_str(value, "%H:%M").expect("valid time")
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 9, 1).expect("valid date")
    }

    async fn setup() -> (DbPool, Arc<InMemoryMirrorStore>, MirrorReconciler) {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        let mirror = Arc::new(InMemoryMirrorStore::new());
        let reconciler = MirrorReconciler::new(pool.clone(), grid(), mirror.clone());
        (pool, mirror, reconciler)
    }

    fn remote_slot(start: &str, client: Option<&str>) -> MirrorSlot {
        MirrorSlot {
            project_id: "salon".to_string(),
            specialist: "Anna".to_string(),
            date: date(),
            time: time(start),
            client_id: client.map(str::to_string),
            client_name: Some("Walk In".to_string()),
            service: Some("haircut".to_string()),
        }
    }

    async fn allocate(pool: &DbPool, mirror: &Arc<InMemoryMirrorStore>, start: &str, slots: u32) {
        let allocator = SlotAllocator::new(pool.clone(), grid(), mirror.clone());
        allocator
            .allocate(AllocationRequest {
                project_id: "salon".to_string(),
                specialist: "Anna".to_string(),
                date: date(),
                start_time: time(start),
                duration_slots: slots,
                client_id: "c-1".to_string(),
                details: Default::default(),
            })
            .await
            .expect("allocate");
        // Let the fire-and-forget mirror write land before reconciling.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn in_sync_day_reports_no_changes() {
        let (pool, mirror, reconciler) = setup().await;
        allocate(&pool, &mirror, "10:00", 2).await;

        let report = reconciler.reconcile_day("salon", "Anna", date()).await.expect("reconcile");
        assert_eq!(report, DayReport { cancelled: 0, adopted: 0, remote_slots: 2 });

        pool.close().await;
    }

    #[tokio::test]
    async fn booking_missing_from_mirror_is_cancelled() {
        let (pool, mirror, reconciler) = setup().await;
        allocate(&pool, &mirror, "10:00", 1).await;

        // Someone emptied the cell in the spreadsheet.
        mirror
            .clear_slot("salon", "Anna", date(), time("10:00"))
            .await
            .expect("clear");

        let report = reconciler.reconcile_day("salon", "Anna", date()).await.expect("reconcile");
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.adopted, 0);

        let local = booking_repo::active_for_specialist_day(&pool, "salon", "Anna", date(), None)
            .await
            .expect("list");
        assert!(local.is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn contiguous_mirror_run_is_adopted_as_one_booking() {
        let (pool, mirror, reconciler) = setup().await;

        mirror.seed(remote_slot("14:00", Some("c-7")));
        mirror.seed(remote_slot("14:30", Some("c-7")));
        mirror.seed(remote_slot("16:00", None));

        let report = reconciler.reconcile_day("salon", "Anna", date()).await.expect("reconcile");
        assert_eq!(report.adopted, 2);

        let local = booking_repo::active_for_specialist_day(&pool, "salon", "Anna", date(), None)
            .await
            .expect("list");
        assert_eq!(local.len(), 2);
        assert_eq!(local[0].start_time, time("14:00"));
        assert_eq!(local[0].duration_slots, 2);
        assert_eq!(local[0].client_id, "c-7");
        assert_eq!(local[1].start_time, time("16:00"));
        assert_eq!(local[1].duration_slots, 1);
        assert_eq!(local[1].client_id, "mirror-import");

        pool.close().await;
    }

    #[tokio::test]
    async fn mirror_client_mismatch_replaces_the_local_booking() {
        let (pool, mirror, reconciler) = setup().await;
        allocate(&pool, &mirror, "10:00", 1).await;

        // The sheet now names a different client for the same cell.
        mirror.seed(remote_slot("10:00", Some("c-9")));

        let report = reconciler.reconcile_day("salon", "Anna", date()).await.expect("reconcile");
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.adopted, 1);

        let local = booking_repo::active_for_specialist_day(&pool, "salon", "Anna", date(), None)
            .await
            .expect("list");
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].client_id, "c-9");

        pool.close().await;
    }

    #[tokio::test]
    async fn reconciliation_refreshes_the_local_cache() {
        let (pool, mirror, reconciler) = setup().await;
        mirror.seed(remote_slot("14:00", Some("c-7")));

        reconciler.reconcile_day("salon", "Anna", date()).await.expect("reconcile");

        let cached = mirror_cache::for_specialist_day(&pool, "salon", "Anna", date())
            .await
            .expect("read cache");
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].slot_time, time("14:00"));
        assert_eq!(cached[0].client_id.as_deref(), Some("c-7"));

        pool.close().await;
    }

    #[tokio::test]
    async fn unreachable_mirror_leaves_the_day_untouched() {
        let (pool, mirror, reconciler) = setup().await;
        allocate(&pool, &mirror, "10:00", 1).await;
        mirror.fail_reads(true);

        let result = reconciler.reconcile_day("salon", "Anna", date()).await;
        assert!(matches!(result, Err(ReconcileError::Mirror(_))));

        let local = booking_repo::active_for_specialist_day(&pool, "salon", "Anna", date(), None)
            .await
            .expect("list");
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].status, BookingStatus::Active);

        pool.close().await;
    }
}
