//! The scheduler facade used by the API layer and the tick loops.
//!
//! Every mutation runs load-then-mutate-then-save on the whole map while
//! holding the shared slot's writer lock, so mutations by every service
//! built on one [`SharedState`] are serialized. Nothing coordinates
//! separate processes: two hosts saving at the same time lose one of the
//! two updates.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::cache::{SchedulerCache, SharedSlot, SharedStateProvider};
use super::dispatch::{item_state, plan, DispatchOutcome, Dispatcher, ItemState};
use super::history::HistoricalJanitor;
use super::recurrence::RecurrenceEngine;
use super::store::{EntryMap, HistoryStore, ScheduleStore};
use super::types::{
    now_ms, ApiResponse, AuthUser, CalendarEvent, DaysOfWeek, HistoricalEvent, Recurrence,
    RecurrenceRequest, Schedule, ScheduleRequest, ScheduledTestItem, TestData, TestStatus,
    TestStatusRecord,
};
use crate::error::{SchedulerError, SchedulerResult};
use crate::storage::{MessageQueue, ObjectStore, TestStatusStore};

/// External systems the scheduler drives.
#[derive(Clone)]
pub struct Collaborators {
    pub objects: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn MessageQueue>,
    pub status: Arc<dyn TestStatusStore>,
}

/// Process-scoped cache slots. Clone it into every service built in the
/// same process to share loaded maps between them.
#[derive(Clone)]
pub struct SharedState {
    pub schedule: Arc<dyn SharedStateProvider<ScheduledTestItem>>,
    pub history: Arc<dyn SharedStateProvider<HistoricalEvent>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            schedule: Arc::new(SharedSlot::new()),
            history: Arc::new(SharedSlot::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub schedule_key: String,
    pub history_key: String,
    pub retention_days: u32,
    pub engine: RecurrenceEngine,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            schedule_key: "settings/scheduledtests.json".to_string(),
            history_key: "settings/historicaltests.json".to_string(),
            retention_days: 365,
            engine: RecurrenceEngine::utc(),
        }
    }
}

pub struct SchedulerService {
    schedule: Mutex<SchedulerCache<ScheduledTestItem>>,
    /// Writer lock shared with every service on the same schedule slot.
    /// Always taken before `schedule`.
    writer: Arc<Mutex<()>>,
    history: HistoricalJanitor,
    dispatcher: Dispatcher,
    objects: Arc<dyn ObjectStore>,
    status: Arc<dyn TestStatusStore>,
    engine: RecurrenceEngine,
}

impl SchedulerService {
    pub fn new(collaborators: Collaborators, shared: SharedState, options: ServiceOptions) -> Self {
        let Collaborators { objects, queue, status } = collaborators;
        let schedule_store = ScheduleStore::new(Arc::clone(&objects), options.schedule_key);
        let history_store = HistoryStore::new(Arc::clone(&objects), options.history_key);
        let schedule = SchedulerCache::new(schedule_store, shared.schedule);
        Self {
            writer: schedule.mutation_lock(),
            schedule: Mutex::new(schedule),
            history: HistoricalJanitor::new(
                history_store,
                shared.history,
                Arc::clone(&status),
                options.retention_days,
            ),
            dispatcher: Dispatcher::new(Arc::clone(&objects), queue, Arc::clone(&status)),
            objects,
            status,
            engine: options.engine,
        }
    }

    pub fn history(&self) -> &HistoricalJanitor {
        &self.history
    }

    pub fn engine(&self) -> &RecurrenceEngine {
        &self.engine
    }

    /// Load the schedule map, from storage when `force` is set. Returns the
    /// number of scheduled items.
    pub async fn load_tests(&self, force: bool) -> SchedulerResult<usize> {
        let map = if force {
            let _writer = self.writer.lock().await;
            self.schedule.lock().await.force_reload().await?
        } else {
            self.schedule.lock().await.ensure_loaded().await?
        };
        Ok(map.len())
    }

    async fn schedule_snapshot(&self) -> SchedulerResult<Arc<EntryMap<ScheduledTestItem>>> {
        Ok(self.schedule.lock().await.ensure_loaded().await?)
    }

    pub async fn get_scheduled_item(&self, test_id: &str) -> SchedulerResult<Option<ScheduledTestItem>> {
        Ok(self.schedule_snapshot().await?.get(test_id).cloned())
    }

    /// All scheduled items ordered by next start.
    pub async fn scheduled_items(&self) -> SchedulerResult<Vec<ScheduledTestItem>> {
        let mut items: Vec<ScheduledTestItem> =
            self.schedule_snapshot().await?.values().cloned().collect();
        items.sort_by(|a, b| a.next_start.cmp(&b.next_start).then_with(|| a.test_id().cmp(b.test_id())));
        Ok(items)
    }

    /// Scheduled items followed by historical events.
    pub async fn get_calendar_events(&self) -> SchedulerResult<Vec<CalendarEvent>> {
        let mut events: Vec<CalendarEvent> = self
            .scheduled_items()
            .await?
            .iter()
            .map(|item| self.engine.calendar_event(item))
            .collect();
        events.extend(self.history.events().await?.iter().map(CalendarEvent::from));
        Ok(events)
    }

    /// Test ids scheduled against a test-runner version. A version in this
    /// list must not be deleted.
    pub async fn get_test_ids_for_pewpew_version(&self, version: &str) -> SchedulerResult<Vec<String>> {
        Ok(self
            .schedule_snapshot()
            .await?
            .values()
            .filter(|item| item.test_message.version == version)
            .map(|item| item.test_id().to_string())
            .collect())
    }

    /// Schedule a one-off or recurring test.
    pub async fn add_test(&self, request: ScheduleRequest, auth: &AuthUser) -> ApiResponse {
        match self.try_add_test(request, auth).await {
            Ok(test_data) => match serde_json::to_value(&test_data) {
                Ok(json) => ApiResponse::ok(json),
                Err(e) => ApiResponse {
                    status: 500,
                    json: json!({ "message": "failed to encode test data", "error": e.to_string() }),
                },
            },
            Err(e) => {
                if e.status_code() >= 500 {
                    error!(user = %auth.user_id, error = %e, "addTest failed");
                } else {
                    info!(user = %auth.user_id, error = %e, "addTest rejected");
                }
                e.to_response()
            }
        }
    }

    pub async fn try_add_test(&self, request: ScheduleRequest, auth: &AuthUser) -> SchedulerResult<TestData> {
        let now = now_ms();
        if request.schedule_date <= now {
            return Err(SchedulerError::validation(
                "Could not schedule test: the schedule date is in the past",
                format!("scheduleDate {} is not after {}", request.schedule_date, now),
            ));
        }
        let test_id = request.test_message.test_id.clone();
        if test_id.is_empty() {
            return Err(SchedulerError::validation("Could not schedule test: missing testId", "testId is empty"));
        }
        let schedule = validate_recurrence(request.recurrence.as_ref(), request.schedule_date)?;
        let next_start = match &schedule {
            Schedule::OneOff => request.schedule_date,
            Schedule::Recurring(recurrence) => {
                let first = self.engine.first_start(request.schedule_date, &recurrence.days_of_week);
                if recurrence.end_date <= first {
                    return Err(SchedulerError::validation(
                        "Could not schedule test: the recurrence ends before its first run",
                        format!("endDate {} is not after first run {}", recurrence.end_date, first),
                    ));
                }
                first
            }
        };

        let item = ScheduledTestItem {
            test_message: request.test_message,
            queue_name: request.queue_name,
            environment_variables_meta: request.environment_variables_meta,
            schedule_date: request.schedule_date,
            schedule,
            next_start,
            user_id: Some(auth.user_id.clone()),
        };

        let _writer = self.writer.lock().await;
        let mut cache = self.schedule.lock().await;
        if cache.ensure_loaded().await?.contains_key(&test_id) {
            return Err(SchedulerError::validation(
                format!("Test {test_id} is already scheduled"),
                "duplicate testId",
            ));
        }

        let record = TestStatusRecord::for_message(
            &item.test_message,
            TestStatus::Scheduled,
            item.schedule_date,
            &item.queue_name,
        );
        self.status.write(&test_id, &record).await?;

        let test_data = TestData::from_record(&item.test_message, &record, &item.queue_name);
        cache
            .commit(|map| map.insert(test_id.clone(), item))
            .await?;
        info!(test_id = %test_id, user = %auth.user_id, next_start, "Test scheduled");
        Ok(test_data)
    }

    /// Remove a scheduled test, optionally deleting its uploaded files.
    pub async fn remove_test(&self, test_id: &str, auth: &AuthUser, delete_files: bool) -> ApiResponse {
        match self.try_remove_test(test_id, auth, delete_files).await {
            Ok(failed_deletes) => ApiResponse::ok(json!({
                "message": format!("Test {test_id} removed from the schedule"),
                "testId": test_id,
                "failedDeletes": failed_deletes,
            })),
            Err(e) => {
                warn!(test_id = %test_id, user = %auth.user_id, error = %e, "removeTest failed");
                e.to_response()
            }
        }
    }

    /// Returns the artifact keys that could not be deleted.
    pub async fn try_remove_test(
        &self,
        test_id: &str,
        auth: &AuthUser,
        delete_files: bool,
    ) -> SchedulerResult<Vec<String>> {
        let removed = {
            let _writer = self.writer.lock().await;
            let mut cache = self.schedule.lock().await;
            let Some(item) = cache.ensure_loaded().await?.get(test_id).cloned() else {
                return Err(SchedulerError::NotFound(format!("No scheduled test {test_id}")));
            };
            cache.commit(|map| map.remove(test_id)).await?;
            item
        };
        info!(test_id = %test_id, user = %auth.user_id, delete_files, "Test removed from schedule");

        if !delete_files {
            return Ok(Vec::new());
        }
        Ok(self.delete_artifacts(&removed).await)
    }

    // Each file is attempted on its own; failures are logged, not raised.
    async fn delete_artifacts(&self, item: &ScheduledTestItem) -> Vec<String> {
        let keys = item.test_message.artifact_keys();
        let results = join_all(keys.iter().map(|key| self.objects.delete(key))).await;
        keys.into_iter()
            .zip(results)
            .filter_map(|(key, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(test_id = %item.test_id(), key = %key, error = %e, "Failed to delete test artifact");
                    Some(key)
                }
            })
            .collect()
    }

    /// Dispatch one schedule entry. `item` must still be in the schedule map;
    /// its `next_start` is the occurrence being run.
    pub async fn start_scheduled_item(&self, item: ScheduledTestItem) -> SchedulerResult<TestData> {
        let _writer = self.writer.lock().await;
        let mut cache = self.schedule.lock().await;
        let test_id = item.test_id().to_string();
        if !cache.ensure_loaded().await?.contains_key(&test_id) {
            return Err(SchedulerError::NotFound(format!("No scheduled test {test_id}")));
        }

        let now = now_ms();
        let dispatch_plan = plan(&item, &self.engine, now);
        let outcome = self.dispatcher.dispatch(&item, dispatch_plan, now).await?;

        let saved = match &outcome {
            DispatchOutcome::Removed(_) => cache.commit(|map| map.remove(&test_id)).await.map(|_| ()),
            DispatchOutcome::Rescheduled { next_start, .. } => {
                let mut rescheduled = item;
                rescheduled.next_start = *next_start;
                cache
                    .commit(|map| map.insert(test_id.clone(), rescheduled))
                    .await
                    .map(|_| ())
            }
        };
        if let Err(e) = saved {
            // The run is already on the queue; the entry will be seen as due again.
            error!(test_id = %test_id, started = %outcome.test_data().test_id, error = %e, "Dispatched but failed to save schedule");
            return Err(e.into());
        }

        match &outcome {
            DispatchOutcome::Removed(_) => {
                info!(test_id = %test_id, "Terminal dispatch, entry removed");
            }
            DispatchOutcome::Rescheduled { test_data, next_start } => {
                info!(test_id = %test_id, started = %test_data.test_id, next_start, "Recurring dispatch, entry rescheduled");
            }
        }
        Ok(outcome.into_test_data())
    }

    /// One dispatch pass: reload the map from storage and start every due
    /// entry, earliest first. A failing entry is logged and skipped.
    pub async fn start_scheduled_tests(&self) -> SchedulerResult<Vec<TestData>> {
        let due: Vec<ScheduledTestItem> = {
            let _writer = self.writer.lock().await;
            let mut cache = self.schedule.lock().await;
            let map = cache.force_reload().await?;
            let now = now_ms();
            let mut due: Vec<ScheduledTestItem> = map
                .values()
                .filter(|item| item_state(item, now) == ItemState::Due)
                .cloned()
                .collect();
            due.sort_by_key(|item| item.next_start);
            due
        };

        let mut started = Vec::with_capacity(due.len());
        for item in due {
            let test_id = item.test_id().to_string();
            match self.start_scheduled_item(item).await {
                Ok(test_data) => started.push(test_data),
                Err(e) => error!(test_id = %test_id, error = %e, "Failed to start scheduled test"),
            }
        }
        Ok(started)
    }
}

fn validate_recurrence(
    recurrence: Option<&RecurrenceRequest>,
    schedule_date: i64,
) -> SchedulerResult<Schedule> {
    let Some(recurrence) = recurrence else {
        return Ok(Schedule::OneOff);
    };
    let days: Vec<u8> = recurrence
        .days_of_week
        .iter()
        .map(|d| u8::try_from(*d).ok().filter(|d| *d <= 6))
        .collect::<Option<_>>()
        .ok_or_else(|| {
            SchedulerError::validation(
                "Could not schedule test: invalid daysOfWeek",
                format!("daysOfWeek {:?} must only contain 0-6", recurrence.days_of_week),
            )
        })?;
    let days_of_week = DaysOfWeek::try_from(days)
        .map_err(|detail| SchedulerError::validation("Could not schedule test: invalid daysOfWeek", detail))?;
    if recurrence.end_date <= schedule_date {
        return Err(SchedulerError::validation(
            "Could not schedule test: endDate must be after scheduleDate",
            format!("endDate {} is not after {}", recurrence.end_date, schedule_date),
        ));
    }
    Ok(Schedule::Recurring(Recurrence {
        days_of_week,
        end_date: recurrence.end_date,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_recurrence() {
        assert_eq!(validate_recurrence(None, 10).unwrap(), Schedule::OneOff);

        let ok = RecurrenceRequest { days_of_week: vec![3, 1, 1], end_date: 20 };
        match validate_recurrence(Some(&ok), 10).unwrap() {
            Schedule::Recurring(r) => assert_eq!(r.days_of_week.as_slice(), &[1, 3]),
            other => panic!("expected recurring, got {other:?}"),
        }

        for bad in [
            RecurrenceRequest { days_of_week: vec![], end_date: 20 },
            RecurrenceRequest { days_of_week: vec![-1], end_date: 20 },
            RecurrenceRequest { days_of_week: vec![7], end_date: 20 },
            RecurrenceRequest { days_of_week: vec![1], end_date: 10 },
        ] {
            let err = validate_recurrence(Some(&bad), 10).unwrap_err();
            assert_eq!(err.status_code(), 400);
        }
    }
}
