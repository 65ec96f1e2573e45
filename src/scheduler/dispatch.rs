//! Turning a due schedule entry into a running test.
//!
//! ```text
//! Scheduled --(next_start <= now)--> Due --dispatch--> Dispatched
//!                                                        ├── Removed      (one-off / recurrence over)
//!                                                        └── Rescheduled  (next_start advanced)
//! ```
//!
//! The dispatcher only talks to the collaborators. Removing or rescheduling
//! the entry in the schedule map is the service's job, and only happens after
//! the dispatch succeeded. A failed dispatch undoes its own side effects:
//! copied artifacts are deleted and an enqueued message is retracted.

use std::sync::Arc;

use tracing::{info, warn};

use super::recurrence::RecurrenceEngine;
use super::types::{
    Schedule, ScheduledTestItem, TestData, TestIdentity, TestMessage, TestStatus,
    TestStatusRecord,
};
use crate::error::{SchedulerResult, StorageError};
use crate::storage::{MessageQueue, ObjectStore, TestStatusStore};

/// At-rest state of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Scheduled,
    Due,
}

pub fn item_state(item: &ScheduledTestItem, now: i64) -> ItemState {
    if item.next_start <= now {
        ItemState::Due
    } else {
        ItemState::Scheduled
    }
}

/// How a due entry is dispatched on this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPlan {
    /// Run under the entry's own identity, then remove the entry.
    Terminal,
    /// Run under a fresh identity and keep the entry with a new `next_start`.
    Recurring { next_start: i64 },
}

/// A recurring entry whose `end_date` is at or before the given or the
/// computed next occurrence has no recurring life left and runs terminally.
pub fn plan(item: &ScheduledTestItem, engine: &RecurrenceEngine, now: i64) -> DispatchPlan {
    match &item.schedule {
        Schedule::OneOff => DispatchPlan::Terminal,
        Schedule::Recurring(recurrence) => {
            if recurrence.end_date <= item.next_start {
                return DispatchPlan::Terminal;
            }
            let next_start =
                engine.compute_next_start(item.next_start, &recurrence.days_of_week, now);
            if recurrence.end_date <= next_start {
                DispatchPlan::Terminal
            } else {
                DispatchPlan::Recurring { next_start }
            }
        }
    }
}

/// Result of a dispatch, telling the service what to do with the entry.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Removed(TestData),
    Rescheduled { test_data: TestData, next_start: i64 },
}

impl DispatchOutcome {
    pub fn test_data(&self) -> &TestData {
        match self {
            DispatchOutcome::Removed(test_data) => test_data,
            DispatchOutcome::Rescheduled { test_data, .. } => test_data,
        }
    }

    pub fn into_test_data(self) -> TestData {
        match self {
            DispatchOutcome::Removed(test_data) => test_data,
            DispatchOutcome::Rescheduled { test_data, .. } => test_data,
        }
    }
}

pub struct Dispatcher {
    objects: Arc<dyn ObjectStore>,
    queue: Arc<dyn MessageQueue>,
    status: Arc<dyn TestStatusStore>,
}

impl Dispatcher {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        queue: Arc<dyn MessageQueue>,
        status: Arc<dyn TestStatusStore>,
    ) -> Self {
        Self { objects, queue, status }
    }

    pub async fn dispatch(
        &self,
        item: &ScheduledTestItem,
        plan: DispatchPlan,
        now: i64,
    ) -> SchedulerResult<DispatchOutcome> {
        match plan {
            DispatchPlan::Terminal => {
                let test_data = self.start_existing_test(item, now).await?;
                Ok(DispatchOutcome::Removed(test_data))
            }
            DispatchPlan::Recurring { next_start } => {
                let test_data = self.start_new_test(item, now).await?;
                Ok(DispatchOutcome::Rescheduled { test_data, next_start })
            }
        }
    }

    /// Start the test under the `testId`/`s3Folder` minted when it was added.
    pub async fn start_existing_test(
        &self,
        item: &ScheduledTestItem,
        now: i64,
    ) -> SchedulerResult<TestData> {
        self.launch(&item.test_message, &item.queue_name, now).await
    }

    /// Start a copy of the template under a brand-new identity.
    pub async fn start_new_test(
        &self,
        item: &ScheduledTestItem,
        now: i64,
    ) -> SchedulerResult<TestData> {
        let template = &item.test_message;
        let mut identity = TestIdentity::mint(&template.yaml_file, now);
        if identity.test_id == template.test_id {
            identity = TestIdentity::mint(&template.yaml_file, now + 1);
        }
        let message = template.with_identity(&identity);
        let mut copied = Vec::new();
        if let Err(e) = self.copy_artifacts(template, &message, &mut copied).await {
            self.remove_copies(&message.test_id, &copied).await;
            return Err(e.into());
        }
        info!(template = %template.test_id, test_id = %message.test_id, "Starting recurring run");
        match self.launch(&message, &item.queue_name, now).await {
            Ok(test_data) => Ok(test_data),
            Err(e) => {
                self.remove_copies(&message.test_id, &copied).await;
                Err(e)
            }
        }
    }

    /// Copy every artifact of `from` to `to`, recording each written key.
    async fn copy_artifacts(
        &self,
        from: &TestMessage,
        to: &TestMessage,
        copied: &mut Vec<String>,
    ) -> Result<(), StorageError> {
        for (source, target) in from.artifact_keys().iter().zip(to.artifact_keys()) {
            let body = self.objects.get(source).await.map_err(|e| {
                warn!(test_id = %from.test_id, key = %source, error = %e, "Failed to read test artifact");
                e
            })?;
            self.objects.put(&target, body).await.map_err(|e| {
                warn!(test_id = %to.test_id, key = %target, error = %e, "Failed to copy test artifact");
                e
            })?;
            copied.push(target);
        }
        Ok(())
    }

    async fn remove_copies(&self, test_id: &str, copied: &[String]) {
        for key in copied {
            if let Err(e) = self.objects.delete(key).await {
                warn!(test_id = %test_id, key = %key, error = %e, "Failed to clean up copied artifact");
            }
        }
    }

    async fn launch(
        &self,
        message: &TestMessage,
        queue_name: &str,
        now: i64,
    ) -> SchedulerResult<TestData> {
        let message_id = self.queue.enqueue(queue_name, message).await.map_err(|e| {
            tracing::error!(test_id = %message.test_id, queue = %queue_name, error = %e, "Failed to enqueue test");
            e
        })?;

        let record = TestStatusRecord::for_message(message, TestStatus::Created, now, queue_name);
        if let Err(e) = self.status.write(&message.test_id, &record).await {
            tracing::error!(test_id = %message.test_id, error = %e, "Failed to write test status");
            match self.queue.retract(queue_name, &message_id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(test_id = %message.test_id, message_id = %message_id, "Message already taken, could not retract");
                }
                Err(retract) => {
                    tracing::error!(test_id = %message.test_id, message_id = %message_id, error = %retract, "Failed to retract message");
                }
            }
            return Err(e.into());
        }

        info!(test_id = %message.test_id, queue = %queue_name, message_id = %message_id, "Test dispatched");
        Ok(TestData::from_record(message, &record, queue_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::types::{DaysOfWeek, Recurrence, ONE_DAY_MS};
    use crate::storage::{MemoryObjectStore, MemoryQueue, MemoryStatusStore};
    use bytes::Bytes;
    use std::collections::BTreeMap;

    const NOW: i64 = 1_704_105_000_000;

    fn item(schedule: Schedule, next_start: i64) -> ScheduledTestItem {
        ScheduledTestItem {
            test_message: TestMessage {
                test_id: "dispatch20240101T000000000".into(),
                s3_folder: "dispatch/20240101T000000000".into(),
                yaml_file: "dispatch.yaml".into(),
                additional_files: vec![],
                test_run_time_mn: Some(1),
                bucket_size_ms: None,
                version: "latest".into(),
                env_variables: BTreeMap::new(),
                user_id: None,
                restart_on_failure: false,
                bypass_parser: None,
            },
            queue_name: "unittests".into(),
            environment_variables_meta: vec![],
            schedule_date: next_start,
            schedule,
            next_start,
            user_id: None,
        }
    }

    fn recurring(end_date: i64) -> Schedule {
        Schedule::Recurring(Recurrence {
            days_of_week: DaysOfWeek::every_day(),
            end_date,
        })
    }

    #[test]
    fn test_item_state() {
        assert_eq!(item_state(&item(Schedule::OneOff, NOW), NOW), ItemState::Due);
        assert_eq!(item_state(&item(Schedule::OneOff, NOW + 1), NOW), ItemState::Scheduled);
    }

    #[test]
    fn test_plan_one_off_is_terminal() {
        let engine = RecurrenceEngine::utc();
        assert_eq!(plan(&item(Schedule::OneOff, NOW), &engine, NOW), DispatchPlan::Terminal);
    }

    #[test]
    fn test_plan_end_date_equal_to_next_start_is_terminal() {
        let engine = RecurrenceEngine::utc();
        assert_eq!(plan(&item(recurring(NOW), NOW), &engine, NOW), DispatchPlan::Terminal);
    }

    #[test]
    fn test_plan_end_date_before_computed_next_is_terminal() {
        let engine = RecurrenceEngine::utc();
        let plan = plan(&item(recurring(NOW + ONE_DAY_MS), NOW), &engine, NOW);
        assert_eq!(plan, DispatchPlan::Terminal);
    }

    #[test]
    fn test_plan_recurring_advances_one_day() {
        let engine = RecurrenceEngine::utc();
        let plan = plan(&item(recurring(NOW + 7 * ONE_DAY_MS), NOW), &engine, NOW);
        assert_eq!(plan, DispatchPlan::Recurring { next_start: NOW + ONE_DAY_MS });
    }

    struct Fixture {
        objects: Arc<MemoryObjectStore>,
        queue: Arc<MemoryQueue>,
        status: Arc<MemoryStatusStore>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let objects = Arc::new(MemoryObjectStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let status = Arc::new(MemoryStatusStore::new());
        let dispatcher = Dispatcher::new(objects.clone(), queue.clone(), status.clone());
        Fixture { objects, queue, status, dispatcher }
    }

    #[tokio::test]
    async fn test_status_failure_retracts_enqueued_message() {
        let f = fixture();
        f.status.set_failing(true);

        let one_off = item(Schedule::OneOff, NOW);
        let err = f.dispatcher.dispatch(&one_off, DispatchPlan::Terminal, NOW).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(f.queue.len().await, 0);

        f.status.set_failing(false);
        f.dispatcher.dispatch(&one_off, DispatchPlan::Terminal, NOW).await.unwrap();
        assert_eq!(f.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_failed_recurring_launch_removes_copied_artifacts() {
        let f = fixture();
        let template = item(recurring(NOW + 7 * ONE_DAY_MS), NOW);
        for key in template.test_message.artifact_keys() {
            f.objects.put(&key, Bytes::from_static(b"yaml")).await.unwrap();
        }
        f.queue.set_failing(true);

        let plan = DispatchPlan::Recurring { next_start: NOW + ONE_DAY_MS };
        assert!(f.dispatcher.dispatch(&template, plan, NOW).await.is_err());

        // Only the template's own files are left.
        assert_eq!(f.objects.list("dispatch/").await.unwrap(), template.test_message.artifact_keys());
        assert!(matches!(f.status.read(&template.test_message.test_id).await, Err(_)));
    }

    #[tokio::test]
    async fn test_missing_artifact_aborts_before_enqueue() {
        let f = fixture();
        let template = item(recurring(NOW + 7 * ONE_DAY_MS), NOW);

        let plan = DispatchPlan::Recurring { next_start: NOW + ONE_DAY_MS };
        assert!(f.dispatcher.dispatch(&template, plan, NOW).await.is_err());
        assert_eq!(f.queue.len().await, 0);
        assert!(f.objects.list("dispatch/").await.unwrap().is_empty());
    }
}
