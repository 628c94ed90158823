//! Slot-grid arithmetic for the booking calendar.
//!
//! Business hours are discretized into fixed-size slots. All availability and
//! conflict questions reduce to set operations over slot start times, so this
//! module stays pure and the allocator owns the I/O.

use std::collections::BTreeSet;

use chrono::{Duration, NaiveTime};

use crate::errors::DomainError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotGrid {
    day_start: NaiveTime,
    day_end: NaiveTime,
    slot_minutes: u32,
}

impl SlotGrid {
    pub fn new(
        day_start: NaiveTime,
        day_end: NaiveTime,
        slot_minutes: u32,
    ) -> Result<Self, DomainError> {
        if slot_minutes == 0 || slot_minutes > 24 * 60 {
            return Err(DomainError::Validation(format!(
                "slot size must be between 1 and 1440 minutes, got {slot_minutes}"
            )));
        }
        if day_start >= day_end {
            return Err(DomainError::Validation(format!(
                "business hours are empty: {day_start} >= {day_end}"
            )));
        }
        Ok(Self { day_start, day_end, slot_minutes })
    }

    pub fn slot_minutes(&self) -> u32 {
        self.slot_minutes
    }

    /// Every slot start time within business hours, in order. A start time
    /// counts only if the full slot fits before closing.
    pub fn slot_starts(&self) -> Vec<NaiveTime> {
        let step = Duration::minutes(i64::from(self.slot_minutes));
        let mut starts = Vec::new();
        let mut cursor = self.day_start;
        while cursor + step <= self.day_end {
            starts.push(cursor);
            let next = cursor + step;
            // NaiveTime arithmetic wraps at midnight; a wrapped cursor means
            // the grid reached the end of the day.
            if next <= cursor {
                break;
            }
            cursor = next;
        }
        starts
    }

    /// Slot start times a run of `duration_slots` beginning at `start` covers.
    pub fn covered(&self, start: NaiveTime, duration_slots: u32) -> Vec<NaiveTime> {
        (0..duration_slots)
            .map(|i| start + Duration::minutes(i64::from(i * self.slot_minutes)))
            .collect()
    }

    /// Whether the whole run lies on the grid and within business hours.
    pub fn fits(&self, start: NaiveTime, duration_slots: u32) -> bool {
        if duration_slots == 0 {
            return false;
        }
        let offset = start.signed_duration_since(self.day_start);
        let on_grid = offset.num_minutes() >= 0
            && offset.num_minutes() % i64::from(self.slot_minutes) == 0
            && offset.num_seconds() % 60 == 0;
        if !on_grid {
            return false;
        }
        let starts: BTreeSet<NaiveTime> = self.slot_starts().into_iter().collect();
        self.covered(start, duration_slots).iter().all(|slot| starts.contains(slot))
    }

    /// Available start times for a run of `duration_slots`: the business-hours
    /// grid minus `occupied`, windowed so every slot of the run must be free.
    pub fn available_starts(
        &self,
        duration_slots: u32,
        occupied: &BTreeSet<NaiveTime>,
    ) -> Vec<NaiveTime> {
        if duration_slots == 0 {
            return Vec::new();
        }
        let grid: BTreeSet<NaiveTime> = self.slot_starts().into_iter().collect();
        self.slot_starts()
            .into_iter()
            .filter(|start| {
                self.covered(*start, duration_slots)
                    .iter()
                    .all(|slot| grid.contains(slot) && !occupied.contains(slot))
            })
            .collect()
    }

    /// Half-open range overlap. Back-to-back runs (end of one equals start of
    /// the next) do not overlap.
    pub fn ranges_overlap(
        &self,
        a_start: NaiveTime,
        a_slots: u32,
        b_start: NaiveTime,
        b_slots: u32,
    ) -> bool {
        let a_end = a_start + Duration::minutes(i64::from(a_slots * self.slot_minutes));
        let b_end = b_start + Duration::minutes(i64::from(b_slots * self.slot_minutes));
        a_start < b_end && b_start < a_end
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::NaiveTime;

    use super::SlotGrid;
    use crate::errors::DomainError;

    fn t(value: &str) -> NaiveTime {
        NaiveTime::parse_from_str(value, "%H:%M").expect("valid time")
    }

    fn grid() -> SlotGrid {
        SlotGrid::new(t("09:00"), t("18:00"), 30).expect("valid grid")
    }

    #[test]
    fn rejects_empty_hours_and_zero_slot() {
        assert!(matches!(
            SlotGrid::new(t("18:00"), t("09:00"), 30),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            SlotGrid::new(t("09:00"), t("18:00"), 0),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn grid_covers_business_hours() {
        let starts = grid().slot_starts();
        assert_eq!(starts.len(), 18);
        assert_eq!(starts.first(), Some(&t("09:00")));
        assert_eq!(starts.last(), Some(&t("17:30")));
    }

    #[test]
    fn last_slot_must_fit_before_closing() {
        let grid = SlotGrid::new(t("09:00"), t("10:15"), 30).expect("valid grid");
        assert_eq!(grid.slot_starts(), vec![t("09:00"), t("09:30")]);
    }

    #[test]
    fn multi_slot_availability_excludes_windows_overlapping_occupancy() {
        // One occupied slot at 10:00. A 60-minute request must lose both
        // 09:30 and 10:00 as start times.
        let occupied: BTreeSet<NaiveTime> = [t("10:00")].into_iter().collect();
        let available = grid().available_starts(2, &occupied);

        assert!(!available.contains(&t("09:30")));
        assert!(!available.contains(&t("10:00")));
        assert!(available.contains(&t("09:00")));
        assert!(available.contains(&t("10:30")));
    }

    #[test]
    fn multi_slot_run_must_fit_inside_business_hours() {
        let available = grid().available_starts(2, &BTreeSet::new());
        assert!(available.contains(&t("17:00")));
        assert!(!available.contains(&t("17:30")));
    }

    #[test]
    fn fits_rejects_off_grid_and_overflow_starts() {
        assert!(grid().fits(t("10:00"), 2));
        assert!(!grid().fits(t("10:15"), 1));
        assert!(!grid().fits(t("08:30"), 1));
        assert!(!grid().fits(t("17:30"), 2));
        assert!(!grid().fits(t("10:00"), 0));
    }

    #[test]
    fn back_to_back_ranges_do_not_overlap() {
        let grid = grid();
        assert!(!grid.ranges_overlap(t("10:00"), 1, t("10:30"), 1));
        assert!(grid.ranges_overlap(t("10:00"), 2, t("10:30"), 1));
        assert!(grid.ranges_overlap(t("09:30"), 2, t("10:00"), 1));
    }
}
