//! Day-of-week recurrence and calendar rendering.
//!
//! All arithmetic happens in one fixed UTC offset, so stepping by whole days
//! keeps the hour and minute of the original start.

use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc};

use super::types::{CalendarEvent, DaysOfWeek, Schedule, ScheduledTestItem, ONE_DAY_MS};

#[derive(Debug, Clone, Copy)]
pub struct RecurrenceEngine {
    offset: FixedOffset,
}

impl Default for RecurrenceEngine {
    fn default() -> Self {
        Self::utc()
    }
}

impl RecurrenceEngine {
    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    /// `minutes` east of UTC. `None` if outside +/- 24h.
    pub fn with_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(|offset| Self { offset })
    }

    fn local(&self, epoch_ms: i64) -> DateTime<FixedOffset> {
        DateTime::from_timestamp_millis(epoch_ms)
            .unwrap_or_default()
            .with_timezone(&self.offset)
    }

    /// Weekday of `epoch_ms`, 0 = Sunday.
    pub fn weekday(&self, epoch_ms: i64) -> u32 {
        self.local(epoch_ms).weekday().num_days_from_sunday()
    }

    /// Smallest instant after `now` that keeps the time of day of
    /// `current_start` and falls on one of `days`.
    pub fn compute_next_start(&self, current_start: i64, days: &DaysOfWeek, now: i64) -> i64 {
        let mut next = current_start;
        if next <= now {
            next += ((now - next) / ONE_DAY_MS + 1) * ONE_DAY_MS;
        }
        self.advance_to_allowed_day(next, days)
    }

    /// First instant at or after `schedule_date` on one of `days`.
    pub fn first_start(&self, schedule_date: i64, days: &DaysOfWeek) -> i64 {
        self.advance_to_allowed_day(schedule_date, days)
    }

    fn advance_to_allowed_day(&self, mut next: i64, days: &DaysOfWeek) -> i64 {
        // `days` is never empty, so a week is always enough.
        for _ in 0..7 {
            if days.contains(self.weekday(next)) {
                break;
            }
            next += ONE_DAY_MS;
        }
        next
    }

    /// Calendar shape of `item` at its current `next_start`.
    pub fn calendar_event(&self, item: &ScheduledTestItem) -> CalendarEvent {
        let message = &item.test_message;
        let run_time_ms = message.run_time_ms();
        match &item.schedule {
            Schedule::OneOff => CalendarEvent::Single {
                id: message.test_id.clone(),
                title: message.yaml_file.clone(),
                start: item.next_start,
                end: run_time_ms.map(|ms| item.next_start + ms),
            },
            Schedule::Recurring(recurrence) => {
                let start = self.local(item.next_start);
                let start_minutes = i64::from(start.hour() * 60 + start.minute());
                let end_time = message
                    .test_run_time_mn
                    .map(|mn| clock_label(start_minutes + i64::from(mn)));
                CalendarEvent::Recurring {
                    id: message.test_id.clone(),
                    title: message.yaml_file.clone(),
                    start_recur: item.next_start,
                    end_recur: recurrence.end_date,
                    start_time: clock_label(start_minutes),
                    end_time,
                    days_of_week: recurrence.days_of_week.as_slice().to_vec(),
                }
            }
        }
    }
}

// Minutes since local midnight as `HH:MM`; runs past midnight give hours >= 24.
fn clock_label(minutes: i64) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}
