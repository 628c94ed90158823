//! Slot allocation. Availability is pure grid math over the active bookings
//! of one specialist's day; commits re-validate under a calendar-scope lock
//! so the no-overlap invariant holds across processes. The spreadsheet mirror
//! is consulted before the lock and written after commit, never inside it.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use bookline_core::domain::booking::{Booking, BookingDetails, BookingId, BookingStatus};
use bookline_core::errors::{AllocationError, DomainError};
use bookline_core::schedule::SlotGrid;
use bookline_db::repositories::{booking as booking_repo, mirror_cache, RepositoryError};
use bookline_db::{calendar_scope, DbPool, ScopeLock};

use crate::mirror::{MirrorSlot, MirrorStore};

#[derive(Clone, Debug)]
pub struct AllocationRequest {
    pub project_id: String,
    pub specialist: String,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub duration_slots: u32,
    pub client_id: String,
    pub details: BookingDetails,
}

pub struct SlotAllocator {
    pool: DbPool,
    grid: SlotGrid,
    mirror: Arc<dyn MirrorStore>,
}

impl SlotAllocator {
    pub fn new(pool: DbPool, grid: SlotGrid, mirror: Arc<dyn MirrorStore>) -> Self {
        Self { pool, grid, mirror }
    }

    pub fn grid(&self) -> &SlotGrid {
        &self.grid
    }

    /// Free start times for a run of `duration_slots` on one specialist's day.
    pub async fn available_slots(
        &self,
        project_id: &str,
        specialist: &str,
        date: NaiveDate,
        duration_slots: u32,
    ) -> Result<Vec<NaiveTime>, AllocationError> {
        if duration_slots == 0 {
            return Err(DomainError::Validation(
                "duration must be at least one slot".to_string(),
            )
            .into());
        }

        let bookings =
            booking_repo::active_for_specialist_day(&self.pool, project_id, specialist, date, None)
                .await
                .map_err(store_err)?;
        Ok(self.grid.available_starts(duration_slots, &self.occupied_set(&bookings)))
    }

    /// Commits a new booking. Availability is re-validated against the local
    /// store at commit time; a caller-supplied snapshot is never trusted. The
    /// mirror is read first as a secondary conflict source: a slot the mirror
    /// shows occupied is rejected even when the local store shows it free.
    pub async fn allocate(&self, request: AllocationRequest) -> Result<Booking, AllocationError> {
        self.validate_slot(request.start_time, request.duration_slots)?;

        let occupied_in_mirror = self
            .mirror_occupied(
                &request.project_id,
                &request.specialist,
                request.date,
                request.start_time,
                request.duration_slots,
                None,
            )
            .await;
        if occupied_in_mirror {
            return Err(conflict(&request.specialist, request.date, request.start_time));
        }

        let scope = calendar_scope(&request.project_id, &request.specialist, request.date);
        let mut lock = ScopeLock::acquire(&self.pool, &[scope]).await.map_err(store_err)?;

        let existing = booking_repo::active_for_specialist_day(
            lock.conn(),
            &request.project_id,
            &request.specialist,
            request.date,
            None,
        )
        .await
        .map_err(store_err)?;
        if self.overlaps_any(&existing, request.start_time, request.duration_slots) {
            lock.rollback().await.map_err(store_err)?;
            return Err(conflict(&request.specialist, request.date, request.start_time));
        }

        let now = Utc::now();
        let booking = Booking {
            id: BookingId(Uuid::new_v4().to_string()),
            project_id: request.project_id,
            specialist: request.specialist,
            date: request.date,
            start_time: request.start_time,
            duration_slots: request.duration_slots,
            client_id: request.client_id,
            details: request.details,
            status: BookingStatus::Active,
            created_at: now,
            updated_at: now,
        };
        booking_repo::insert(lock.conn(), &booking).await.map_err(store_err)?;
        lock.commit().await.map_err(store_err)?;

        info!(
            event_name = "allocator.booked",
            booking_id = %booking.id,
            specialist = %booking.specialist,
            date = %booking.date,
            start_time = %booking.start_time,
            end_time = %booking.end_time(self.grid.slot_minutes()),
            duration_slots = booking.duration_slots,
            "booking committed"
        );
        self.spawn_mirror_set(&booking);
        Ok(booking)
    }

    /// Logical cancellation. The row stays, its range is vacated, and the
    /// mirror is asked to clear the freed cells.
    pub async fn cancel(&self, id: &BookingId) -> Result<Booking, AllocationError> {
        let booking = booking_repo::find_by_id(&self.pool, id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| AllocationError::NotFound(id.clone()))?;
        if booking.status == BookingStatus::Cancelled {
            return Ok(booking);
        }

        let scope = calendar_scope(&booking.project_id, &booking.specialist, booking.date);
        let mut lock = ScopeLock::acquire(&self.pool, &[scope]).await.map_err(store_err)?;
        booking_repo::set_status(lock.conn(), id, BookingStatus::Cancelled, Utc::now())
            .await
            .map_err(store_err)?;
        lock.commit().await.map_err(store_err)?;

        info!(
            event_name = "allocator.cancelled",
            booking_id = %id,
            specialist = %booking.specialist,
            date = %booking.date,
            "booking cancelled"
        );
        self.spawn_mirror_clear(&booking);

        let mut cancelled = booking;
        cancelled.status = BookingStatus::Cancelled;
        Ok(cancelled)
    }

    /// Moves a booking to a new slot while preserving its identity. Validated
    /// as allocate-new with the booking itself excluded from the conflict
    /// check, then an in-place mutation. Old and new calendar scopes are
    /// locked together so no other writer slips between the two.
    pub async fn change(
        &self,
        id: &BookingId,
        specialist: &str,
        date: NaiveDate,
        start_time: NaiveTime,
        duration_slots: u32,
    ) -> Result<Booking, AllocationError> {
        self.validate_slot(start_time, duration_slots)?;

        let booking = booking_repo::find_by_id(&self.pool, id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| AllocationError::NotFound(id.clone()))?;
        if booking.status != BookingStatus::Active {
            return Err(DomainError::Validation(format!(
                "booking {id} is cancelled and cannot be changed"
            ))
            .into());
        }

        // Slots inside the booking's own current range are not conflicts.
        let own_range = (booking.specialist == specialist && booking.date == date)
            .then(|| (booking.start_time, booking.duration_slots));
        let occupied_in_mirror = self
            .mirror_occupied(
                &booking.project_id,
                specialist,
                date,
                start_time,
                duration_slots,
                own_range,
            )
            .await;
        if occupied_in_mirror {
            return Err(conflict(specialist, date, start_time));
        }

        let scopes = [
            calendar_scope(&booking.project_id, &booking.specialist, booking.date),
            calendar_scope(&booking.project_id, specialist, date),
        ];
        let mut lock = ScopeLock::acquire(&self.pool, &scopes).await.map_err(store_err)?;

        let existing = booking_repo::active_for_specialist_day(
            lock.conn(),
            &booking.project_id,
            specialist,
            date,
            Some(id),
        )
        .await
        .map_err(store_err)?;
        if self.overlaps_any(&existing, start_time, duration_slots) {
            lock.rollback().await.map_err(store_err)?;
            return Err(conflict(specialist, date, start_time));
        }

        let now = Utc::now();
        booking_repo::reschedule(
            lock.conn(),
            id,
            specialist,
            date,
            start_time,
            duration_slots,
            &booking.details,
            now,
        )
        .await
        .map_err(store_err)?;
        lock.commit().await.map_err(store_err)?;

        let mut changed = booking.clone();
        changed.specialist = specialist.to_string();
        changed.date = date;
        changed.start_time = start_time;
        changed.duration_slots = duration_slots;
        changed.updated_at = now;

        info!(
            event_name = "allocator.changed",
            booking_id = %id,
            specialist = %changed.specialist,
            date = %changed.date,
            start_time = %changed.start_time,
            end_time = %changed.end_time(self.grid.slot_minutes()),
            "booking moved"
        );
        // Clear the old range before occupying the new one. The two may share
        // cells when the move is within the same day.
        self.spawn_mirror_move(&booking, &changed);
        Ok(changed)
    }

    fn validate_slot(&self, start: NaiveTime, duration_slots: u32) -> Result<(), AllocationError> {
        if duration_slots == 0 {
            return Err(DomainError::Validation(
                "duration must be at least one slot".to_string(),
            )
            .into());
        }
        if !self.grid.fits(start, duration_slots) {
            return Err(DomainError::Validation(format!(
                "start time {start} with {duration_slots} slot(s) does not fit business hours"
            ))
            .into());
        }
        Ok(())
    }

    fn occupied_set(&self, bookings: &[Booking]) -> BTreeSet<NaiveTime> {
        bookings
            .iter()
            .flat_map(|booking| booking.covered_slots(self.grid.slot_minutes()))
            .collect()
    }

    fn overlaps_any(&self, existing: &[Booking], start: NaiveTime, duration_slots: u32) -> bool {
        existing.iter().any(|booking| {
            self.grid.ranges_overlap(
                booking.start_time,
                booking.duration_slots,
                start,
                duration_slots,
            )
        })
    }

    /// Live mirror read for a candidate range. When the mirror is unreachable
    /// the last snapshot the reconciler cached in `mirror_slots` stands in, so
    /// a known-occupied cell still rejects while the mirror is down. With no
    /// usable snapshot either, the local store alone decides: the mirror is a
    /// secondary source and must never block booking outright.
    async fn mirror_occupied(
        &self,
        project_id: &str,
        specialist: &str,
        date: NaiveDate,
        start: NaiveTime,
        duration_slots: u32,
        ignore_range: Option<(NaiveTime, u32)>,
    ) -> bool {
        let occupied: Vec<NaiveTime> =
            match self.mirror.occupied_slots(project_id, specialist, date).await {
                Ok(slots) => slots.into_iter().map(|slot| slot.time).collect(),
                Err(error) => {
                    warn!(
                        event_name = "allocator.mirror_read_failed",
                        error = %error,
                        specialist = %specialist,
                        date = %date,
                        "mirror unreachable, checking the last synced snapshot"
                    );
                    match mirror_cache::for_specialist_day(&self.pool, project_id, specialist, date)
                        .await
                    {
                        Ok(rows) => rows.into_iter().map(|row| row.slot_time).collect(),
                        Err(error) => {
                            warn!(
                                event_name = "allocator.mirror_cache_read_failed",
                                error = %error,
                                specialist = %specialist,
                                date = %date,
                                "snapshot unavailable, falling back to local store only"
                            );
                            return false;
                        }
                    }
                }
            };

        let wanted: BTreeSet<NaiveTime> = self.grid.covered(start, duration_slots).into_iter().collect();
        let ignored: BTreeSet<NaiveTime> = ignore_range
            .map(|(own_start, own_slots)| self.grid.covered(own_start, own_slots).into_iter().collect())
            .unwrap_or_default();

        occupied.iter().any(|time| wanted.contains(time) && !ignored.contains(time))
    }

    fn spawn_mirror_set(&self, booking: &Booking) {
        let slots = self.mirror_cells(booking);
        let mirror = Arc::clone(&self.mirror);
        let booking_id = booking.id.clone();
        tokio::spawn(async move {
            for slot in slots {
                if let Err(error) = mirror.set_slot(&slot).await {
                    warn!(
                        event_name = "allocator.mirror_write_failed",
                        error = %error,
                        booking_id = %booking_id,
                        "mirror update failed, reconciliation will retry"
                    );
                }
            }
        });
    }

    fn spawn_mirror_clear(&self, booking: &Booking) {
        let cells = self.covered_cells(booking);
        let mirror = Arc::clone(&self.mirror);
        let project_id = booking.project_id.clone();
        let specialist = booking.specialist.clone();
        let date = booking.date;
        let booking_id = booking.id.clone();
        tokio::spawn(async move {
            for time in cells {
                if let Err(error) = mirror.clear_slot(&project_id, &specialist, date, time).await {
                    warn!(
                        event_name = "allocator.mirror_clear_failed",
                        error = %error,
                        booking_id = %booking_id,
                        "mirror clear failed, reconciliation will retry"
                    );
                }
            }
        });
    }

    fn spawn_mirror_move(&self, old: &Booking, new: &Booking) {
        let old_cells = self.covered_cells(old);
        let new_slots = self.mirror_cells(new);
        let mirror = Arc::clone(&self.mirror);
        let project_id = old.project_id.clone();
        let old_specialist = old.specialist.clone();
        let old_date = old.date;
        let booking_id = new.id.clone();
        tokio::spawn(async move {
            for time in old_cells {
                if let Err(error) =
                    mirror.clear_slot(&project_id, &old_specialist, old_date, time).await
                {
                    warn!(
                        event_name = "allocator.mirror_clear_failed",
                        error = %error,
                        booking_id = %booking_id,
                        "mirror clear failed, reconciliation will retry"
                    );
                }
            }
            for slot in new_slots {
                if let Err(error) = mirror.set_slot(&slot).await {
                    warn!(
                        event_name = "allocator.mirror_write_failed",
                        error = %error,
                        booking_id = %booking_id,
                        "mirror update failed, reconciliation will retry"
                    );
                }
            }
        });
    }

    fn covered_cells(&self, booking: &Booking) -> Vec<NaiveTime> {
        booking.covered_slots(self.grid.slot_minutes())
    }

    fn mirror_cells(&self, booking: &Booking) -> Vec<MirrorSlot> {
        self.covered_cells(booking)
            .into_iter()
            .map(|time| MirrorSlot {
                project_id: booking.project_id.clone(),
                specialist: booking.specialist.clone(),
                date: booking.date,
                time,
                client_id: Some(booking.client_id.clone()),
                client_name: booking.details.client_name.clone(),
                service: booking.details.service.clone(),
            })
            .collect()
    }
}

fn conflict(specialist: &str, date: NaiveDate, start_time: NaiveTime) -> AllocationError {
    AllocationError::Conflict { specialist: specialist.to_string(), date, start_time }
}

fn store_err(error: RepositoryError) -> AllocationError {
    AllocationError::Store(error.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{NaiveDate, NaiveTime, Utc};

    use bookline_core::domain::booking::{BookingDetails, BookingStatus};
    use bookline_core::errors::AllocationError;
    use bookline_core::schedule::SlotGrid;
    use bookline_db::repositories::mirror_cache::{self, MirrorSlotRow};
    use bookline_db::repositories::booking as booking_repo;
    use bookline_db::{connect_with_settings, migrations, DbPool};

    use crate::mirror::{InMemoryMirrorStore, MirrorSlot};

    use super::{AllocationRequest, SlotAllocator};

    fn grid() -> SlotGrid {
        SlotGrid::new(time("09:00"), time("18:00"), 30).expect("valid grid")
    }

    fn time(value: &str) -> NaiveTime {
        NaiveTime::parse_from_str(value, "%H:%M").expect("valid time")
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 9, 1).expect("valid date")
    }

    async fn setup() -> (DbPool, Arc<InMemoryMirrorStore>, SlotAllocator) {
        let pool = connect_with_settings("sqlite::memory:?cache=shared", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        let mirror = Arc::new(InMemoryMirrorStore::new());
        let allocator = SlotAllocator::new(pool.clone(), grid(), mirror.clone());
        (pool, mirror, allocator)
    }

    fn request(start: &str, duration_slots: u32) -> AllocationRequest {
        AllocationRequest {
            project_id: "salon".to_string(),
            specialist: "Anna".to_string(),
            date: date(),
            start_time: time(start),
            duration_slots,
            client_id: "c-1".to_string(),
            details: BookingDetails {
                client_name: Some("Maria".to_string()),
                service: Some("manicure".to_string()),
                client_phone: None,
            },
        }
    }

    async fn wait_for_mirror(mirror: &InMemoryMirrorStore, expected: usize) {
        for _ in 0..100 {
            if mirror.len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("mirror never reached {expected} slot(s), has {}", mirror.len());
    }

    #[tokio::test]
    async fn multi_slot_availability_excludes_partially_blocked_starts() {
        let (pool, _mirror, allocator) = setup().await;

        allocator.allocate(request("10:00", 1)).await.expect("allocate");

        // A 60 minute request cannot start at 09:30 or 10:00, both would
        // overlap the 10:00-10:30 booking.
        let available = allocator
            .available_slots("salon", "Anna", date(), 2)
            .await
            .expect("availability");
        assert!(!available.contains(&time("09:30")));
        assert!(!available.contains(&time("10:00")));
        assert!(available.contains(&time("09:00")));
        assert!(available.contains(&time("10:30")));

        pool.close().await;
    }

    #[tokio::test]
    async fn commit_time_revalidation_rejects_overlap() {
        let (pool, _mirror, allocator) = setup().await;

        allocator.allocate(request("10:00", 2)).await.expect("allocate");
        let result = allocator.allocate(request("10:30", 1)).await;
        assert!(matches!(result, Err(AllocationError::Conflict { .. })));

        // Back-to-back is not a conflict.
        allocator.allocate(request("11:00", 1)).await.expect("allocate adjacent");

        pool.close().await;
    }

    #[tokio::test]
    async fn mirror_occupied_slot_is_rejected_even_when_local_store_is_free() {
        let (pool, mirror, allocator) = setup().await;

        mirror.seed(MirrorSlot {
            project_id: "salon".to_string(),
            specialist: "Anna".to_string(),
            date: date(),
            time: time("10:00"),
            client_id: Some("walk-in".to_string()),
            client_name: None,
            service: None,
        });

        let result = allocator.allocate(request("10:00", 1)).await;
        assert!(matches!(result, Err(AllocationError::Conflict { .. })));

        pool.close().await;
    }

    #[tokio::test]
    async fn mirror_failure_never_blocks_a_booking() {
        let (pool, mirror, allocator) = setup().await;
        mirror.fail_reads(true);
        mirror.fail_writes(true);

        let booking = allocator.allocate(request("11:00", 1)).await.expect("allocate");
        assert_eq!(booking.status, BookingStatus::Active);

        let available = allocator
            .available_slots("salon", "Anna", date(), 1)
            .await
            .expect("availability");
        assert!(!available.contains(&time("11:00")));

        pool.close().await;
    }

    #[tokio::test]
    async fn last_synced_snapshot_still_rejects_when_the_mirror_is_unreachable() {
        let (pool, mirror, allocator) = setup().await;

        // The reconciler saw this cell occupied on its last pass.
        mirror_cache::upsert(
            &pool,
            &MirrorSlotRow {
                project_id: "salon".to_string(),
                specialist: "Anna".to_string(),
                slot_date: date(),
                slot_time: time("10:00"),
                client_id: Some("walk-in".to_string()),
                client_name: None,
                service: None,
                last_synced_at: Utc::now(),
            },
        )
        .await
        .expect("seed snapshot");
        mirror.fail_reads(true);

        let result = allocator.allocate(request("10:00", 1)).await;
        assert!(matches!(result, Err(AllocationError::Conflict { .. })));

        // Cells the snapshot shows free still book normally.
        allocator.allocate(request("11:00", 1)).await.expect("allocate free cell");

        pool.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_allocations_across_connections_book_exactly_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("bookline.db").display());
        let pool = connect_with_settings(&url, 4, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");

        let mirror = Arc::new(InMemoryMirrorStore::new());
        let allocator = Arc::new(SlotAllocator::new(pool.clone(), grid(), mirror));

        let mut handles = Vec::new();
        for i in 0..6 {
            let allocator = Arc::clone(&allocator);
            handles.push(tokio::spawn(async move {
                let mut req = request("10:00", 1);
                req.client_id = format!("c-{i}");
                allocator.allocate(req).await
            }));
        }

        let mut booked = 0;
        for handle in handles {
            match handle.await.expect("join") {
                Ok(_) => booked += 1,
                Err(AllocationError::Conflict { .. }) => {}
                Err(error) => panic!("unexpected allocation error: {error}"),
            }
        }
        assert_eq!(booked, 1);

        let active = booking_repo::active_for_specialist_day(&pool, "salon", "Anna", date(), None)
            .await
            .expect("list day");
        assert_eq!(active.len(), 1);

        pool.close().await;
    }

    #[tokio::test]
    async fn successful_allocation_propagates_to_the_mirror() {
        let (pool, mirror, allocator) = setup().await;

        let booking = allocator.allocate(request("10:00", 2)).await.expect("allocate");
        wait_for_mirror(&mirror, 2).await;

        let cell = mirror
            .slot("salon", "Anna", date(), time("10:30"))
            .expect("second covered cell");
        assert_eq!(cell.client_id.as_deref(), Some(booking.client_id.as_str()));

        pool.close().await;
    }

    #[tokio::test]
    async fn cancel_frees_the_range_and_clears_the_mirror() {
        let (pool, mirror, allocator) = setup().await;

        let booking = allocator.allocate(request("10:00", 1)).await.expect("allocate");
        wait_for_mirror(&mirror, 1).await;

        let cancelled = allocator.cancel(&booking.id).await.expect("cancel");
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        wait_for_mirror(&mirror, 0).await;

        let available = allocator
            .available_slots("salon", "Anna", date(), 1)
            .await
            .expect("availability");
        assert!(available.contains(&time("10:00")));

        // Cancelling again is a no-op.
        allocator.cancel(&booking.id).await.expect("cancel twice");

        pool.close().await;
    }

    #[tokio::test]
    async fn change_moves_the_booking_and_swaps_mirror_cells() {
        let (pool, mirror, allocator) = setup().await;

        let booking = allocator.allocate(request("10:00", 1)).await.expect("allocate");
        wait_for_mirror(&mirror, 1).await;

        let moved = allocator
            .change(&booking.id, "Anna", date(), time("14:00"), 2)
            .await
            .expect("change");
        assert_eq!(moved.id, booking.id);
        assert_eq!(moved.start_time, time("14:00"));
        assert_eq!(moved.duration_slots, 2);
        wait_for_mirror(&mirror, 2).await;
        assert!(mirror.slot("salon", "Anna", date(), time("10:00")).is_none());

        let available = allocator
            .available_slots("salon", "Anna", date(), 1)
            .await
            .expect("availability");
        assert!(available.contains(&time("10:00")));
        assert!(!available.contains(&time("14:00")));
        assert!(!available.contains(&time("14:30")));

        pool.close().await;
    }

    #[tokio::test]
    async fn change_cannot_land_on_another_active_booking() {
        let (pool, _mirror, allocator) = setup().await;

        let first = allocator.allocate(request("10:00", 1)).await.expect("allocate");
        let mut second = request("12:00", 1);
        second.client_id = "c-2".to_string();
        allocator.allocate(second).await.expect("allocate second");

        let result = allocator.change(&first.id, "Anna", date(), time("12:00"), 1).await;
        assert!(matches!(result, Err(AllocationError::Conflict { .. })));

        // Shifting within its own range is allowed.
        allocator
            .change(&first.id, "Anna", date(), time("10:00"), 2)
            .await
            .expect("extend in place");

        pool.close().await;
    }

    #[tokio::test]
    async fn out_of_hours_and_zero_duration_fail_validation() {
        let (pool, _mirror, allocator) = setup().await;

        assert!(matches!(
            allocator.allocate(request("08:00", 1)).await,
            Err(AllocationError::Domain(_))
        ));
        // 17:30 is the last slot; two slots would run past closing.
        assert!(matches!(
            allocator.allocate(request("17:30", 2)).await,
            Err(AllocationError::Domain(_))
        ));
        assert!(matches!(
            allocator.allocate(request("10:00", 0)).await,
            Err(AllocationError::Domain(_))
        ));
        // Off-grid start times are rejected too.
        assert!(matches!(
            allocator.allocate(request("10:15", 1)).await,
            Err(AllocationError::Domain(_))
        ));

        pool.close().await;
    }
}
