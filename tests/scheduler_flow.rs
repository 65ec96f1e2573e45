//! End-to-end scheduler flows against the in-memory collaborators.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use pewpew_scheduler::scheduler::{
    now_ms, AuthUser, Collaborators, DaysOfWeek, Recurrence, RecurrenceRequest, Schedule,
    ScheduleRequest, ScheduledTestItem, SchedulerService, ServiceOptions, SharedState,
    TestMessage, TestStatus, ONE_DAY_MS, ONE_MINUTE_MS,
};
use pewpew_scheduler::error::StorageError;
use pewpew_scheduler::storage::{
    MemoryObjectStore, MemoryQueue, MemoryStatusStore, ObjectStore, TestStatusStore,
};

const SCHEDULE_KEY: &str = "settings/scheduledtests.json";

struct Harness {
    objects: Arc<MemoryObjectStore>,
    queue: Arc<MemoryQueue>,
    status: Arc<MemoryStatusStore>,
    service: SchedulerService,
}

fn harness_with(shared: SharedState) -> Harness {
    let objects = Arc::new(MemoryObjectStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let status = Arc::new(MemoryStatusStore::new());
    let service = SchedulerService::new(
        Collaborators {
            objects: objects.clone(),
            queue: queue.clone(),
            status: status.clone(),
        },
        shared,
        ServiceOptions::default(),
    );
    Harness { objects, queue, status, service }
}

fn harness() -> Harness {
    harness_with(SharedState::default())
}

/// Object store that yields to the runtime around every call, so concurrent
/// load-mutate-save sequences interleave.
#[derive(Default)]
struct YieldingStore {
    inner: MemoryObjectStore,
}

#[async_trait]
impl ObjectStore for YieldingStore {
    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        tokio::task::yield_now().await;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<(), StorageError> {
        tokio::task::yield_now().await;
        let result = self.inner.put(key, body).await;
        tokio::task::yield_now().await;
        result
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        tokio::task::yield_now().await;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.inner.list(prefix).await
    }
}

fn service_on(objects: &Arc<YieldingStore>, shared: SharedState) -> SchedulerService {
    SchedulerService::new(
        Collaborators {
            objects: objects.clone(),
            queue: Arc::new(MemoryQueue::new()),
            status: Arc::new(MemoryStatusStore::new()),
        },
        shared,
        ServiceOptions::default(),
    )
}

fn user() -> AuthUser {
    AuthUser { user_id: "flow-user".to_string() }
}

fn message(test_id: &str, version: &str) -> TestMessage {
    let mut env_variables = BTreeMap::new();
    env_variables.insert("PASSWORD".to_string(), "s3cr3t".to_string());
    TestMessage {
        test_id: test_id.to_string(),
        s3_folder: format!("flow/{test_id}"),
        yaml_file: "flow.yaml".to_string(),
        additional_files: vec!["data.csv".to_string()],
        test_run_time_mn: Some(2),
        bucket_size_ms: None,
        version: version.to_string(),
        env_variables,
        user_id: Some("flow-user".to_string()),
        restart_on_failure: false,
        bypass_parser: None,
    }
}

fn request(test_id: &str, schedule_date: i64, recurrence: Option<RecurrenceRequest>) -> ScheduleRequest {
    ScheduleRequest {
        test_message: message(test_id, "0.5.13"),
        queue_name: "unittests".to_string(),
        environment_variables_meta: vec![],
        schedule_date,
        recurrence,
    }
}

fn item(test_id: &str, next_start: i64, schedule: Schedule) -> ScheduledTestItem {
    ScheduledTestItem {
        test_message: message(test_id, "0.5.13"),
        queue_name: "unittests".to_string(),
        environment_variables_meta: vec![],
        schedule_date: next_start,
        schedule,
        next_start,
        user_id: Some("flow-user".to_string()),
    }
}

fn every_day_until(end_date: i64) -> Schedule {
    Schedule::Recurring(Recurrence {
        days_of_week: DaysOfWeek::every_day(),
        end_date,
    })
}

/// Write the schedule map straight into object storage.
async fn seed_schedule(objects: &MemoryObjectStore, items: Vec<ScheduledTestItem>) {
    let map: BTreeMap<String, ScheduledTestItem> = items
        .into_iter()
        .map(|item| (item.test_id().to_string(), item))
        .collect();
    let body = serde_json::to_vec(&map).unwrap();
    objects.put(SCHEDULE_KEY, Bytes::from(body)).await.unwrap();
}

async fn seed_artifacts(objects: &MemoryObjectStore, message: &TestMessage) {
    for key in message.artifact_keys() {
        objects.put(&key, Bytes::from_static(b"artifact")).await.unwrap();
    }
}

#[tokio::test]
async fn test_add_in_the_past_is_rejected() {
    let h = harness();
    let response = h
        .service
        .add_test(request("past", now_ms() - ONE_MINUTE_MS, None), &user())
        .await;

    assert_eq!(response.status, 400);
    let message = response.json["message"].as_str().unwrap();
    assert!(message.contains("past"), "unexpected message: {message}");
    assert_eq!(h.service.load_tests(false).await.unwrap(), 0);
    assert!(!h.objects.contains(SCHEDULE_KEY).await);
}

#[tokio::test]
async fn test_add_one_off_then_duplicate() {
    let h = harness();
    let when = now_ms() + ONE_DAY_MS;

    let response = h.service.add_test(request("oneoff", when, None), &user()).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.json["testId"], "oneoff");
    assert_eq!(response.json["status"], "Scheduled");
    assert!(!response.json.to_string().contains("s3cr3t"));

    let stored = h.service.get_scheduled_item("oneoff").await.unwrap().unwrap();
    assert_eq!(stored.next_start, when);
    assert_eq!(stored.user_id.as_deref(), Some("flow-user"));
    assert_eq!(h.status.read("oneoff").await.unwrap().status, TestStatus::Scheduled);

    let duplicate = h.service.add_test(request("oneoff", when, None), &user()).await;
    assert_eq!(duplicate.status, 400);
    assert_eq!(h.service.load_tests(true).await.unwrap(), 1);
}

#[tokio::test]
async fn test_add_recurring_with_invalid_days_is_rejected() {
    let h = harness();
    let now = now_ms();
    let recurrence = RecurrenceRequest {
        days_of_week: vec![9],
        end_date: now + 7 * ONE_DAY_MS,
    };
    let response = h
        .service
        .add_test(request("baddays", now + ONE_MINUTE_MS, Some(recurrence)), &user())
        .await;
    assert_eq!(response.status, 400);
    assert_eq!(h.service.load_tests(false).await.unwrap(), 0);
}

#[tokio::test]
async fn test_one_off_dispatch_keeps_identity_and_removes_entry() {
    let h = harness();
    let now = now_ms();
    seed_schedule(&h.objects, vec![item("due", now - ONE_MINUTE_MS, Schedule::OneOff)]).await;

    let started = h.service.start_scheduled_tests().await.unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].test_id, "due");
    assert_eq!(started[0].status, TestStatus::Created);

    assert!(h.service.get_scheduled_item("due").await.unwrap().is_none());
    assert_eq!(h.queue.len().await, 1);
    assert_eq!(h.status.read("due").await.unwrap().status, TestStatus::Created);

    // The saved map no longer has the entry either.
    assert_eq!(h.service.load_tests(true).await.unwrap(), 0);
}

#[tokio::test]
async fn test_recurring_dispatch_mints_new_run_and_advances() {
    let h = harness();
    let now = now_ms();
    let next_start = now - ONE_MINUTE_MS;
    let template = item("template", next_start, every_day_until(now + 7 * ONE_DAY_MS));
    seed_artifacts(&h.objects, &template.test_message).await;
    seed_schedule(&h.objects, vec![template]).await;

    let started = h.service.start_scheduled_tests().await.unwrap();
    assert_eq!(started.len(), 1);
    assert_ne!(started[0].test_id, "template");
    assert!(started[0].test_id.starts_with("flow"));

    let remaining = h.service.get_scheduled_item("template").await.unwrap().unwrap();
    assert_eq!(remaining.next_start, next_start + ONE_DAY_MS);

    // The new run has its own copy of every file.
    let copied = h.objects.list("flow/").await.unwrap();
    assert!(copied.len() >= 4, "expected template and run artifacts, got {copied:?}");
}

#[tokio::test]
async fn test_recurring_dispatch_ending_at_next_start_is_terminal() {
    let h = harness();
    let now = now_ms();
    let next_start = now - ONE_MINUTE_MS;
    seed_schedule(&h.objects, vec![item("ending", next_start, every_day_until(next_start))]).await;

    let started = h.service.start_scheduled_tests().await.unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].test_id, "ending");
    assert!(h.service.get_scheduled_item("ending").await.unwrap().is_none());
}

#[tokio::test]
async fn test_add_then_start_recurring_end_to_end() {
    let h = harness();
    let now = now_ms();
    let schedule_date = now + 600_000;
    let recurrence = RecurrenceRequest {
        days_of_week: vec![0, 1, 2, 3, 4, 5, 6],
        end_date: schedule_date + 7 * ONE_DAY_MS,
    };
    let req = request("e2e", schedule_date, Some(recurrence));
    seed_artifacts(&h.objects, &req.test_message).await;

    let response = h.service.add_test(req, &user()).await;
    assert_eq!(response.status, 200);

    let mut scheduled = h.service.get_scheduled_item("e2e").await.unwrap().unwrap();
    assert_eq!(scheduled.next_start, schedule_date);

    let last_minute = now - now % ONE_MINUTE_MS;
    scheduled.next_start = last_minute;
    let run = h.service.start_scheduled_item(scheduled).await.unwrap();
    assert_ne!(run.test_id, "e2e");
    assert_eq!(h.status.read(&run.test_id).await.unwrap().status, TestStatus::Created);

    assert_eq!(h.service.load_tests(false).await.unwrap(), 1);
    let after = h.service.get_scheduled_item("e2e").await.unwrap().unwrap();
    assert_eq!(after.next_start, last_minute + ONE_DAY_MS);

    let events = h.service.get_calendar_events().await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_remove_with_missing_file_still_succeeds() {
    let h = harness();
    let req = request("removeme", now_ms() + ONE_DAY_MS, None);
    // Only the yaml is uploaded; data.csv is missing.
    let yaml_key = req.test_message.artifact_keys()[0].clone();
    h.objects.put(&yaml_key, Bytes::from_static(b"yaml")).await.unwrap();
    assert_eq!(h.service.add_test(req, &user()).await.status, 200);

    let response = h.service.remove_test("removeme", &user(), true).await;
    assert_eq!(response.status, 200);
    let failed = response.json["failedDeletes"].as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].as_str().unwrap().ends_with("data.csv"));
    assert!(!h.objects.contains(&yaml_key).await);
    assert!(h.service.get_scheduled_item("removeme").await.unwrap().is_none());

    let missing = h.service.remove_test("removeme", &user(), false).await;
    assert_eq!(missing.status, 404);
}

#[tokio::test]
async fn test_test_ids_for_pewpew_version() {
    let h = harness();
    let later = now_ms() + ONE_DAY_MS;
    let mut latest = request("onlatest", later, None);
    latest.test_message.version = "latest".to_string();
    assert_eq!(h.service.add_test(latest, &user()).await.status, 200);
    assert_eq!(h.service.add_test(request("onpinned", later, None), &user()).await.status, 200);

    assert_eq!(
        h.service.get_test_ids_for_pewpew_version("0.5.13").await.unwrap(),
        vec!["onpinned".to_string()]
    );
    assert_eq!(
        h.service.get_test_ids_for_pewpew_version("latest").await.unwrap(),
        vec!["onlatest".to_string()]
    );
    assert!(h
        .service
        .get_test_ids_for_pewpew_version("0.0.1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_failed_dispatch_leaves_map_unchanged() {
    let h = harness();
    let now = now_ms();
    seed_schedule(&h.objects, vec![item("stuck", now - ONE_MINUTE_MS, Schedule::OneOff)]).await;
    let before = h.objects.get(SCHEDULE_KEY).await.unwrap();

    h.queue.set_failing(true);
    let started = h.service.start_scheduled_tests().await.unwrap();
    assert!(started.is_empty());
    assert!(h.service.get_scheduled_item("stuck").await.unwrap().is_some());
    assert_eq!(h.objects.get(SCHEDULE_KEY).await.unwrap(), before);

    // Picked up on the next pass once the queue recovers.
    h.queue.set_failing(false);
    let started = h.service.start_scheduled_tests().await.unwrap();
    assert_eq!(started.len(), 1);
}

#[tokio::test]
async fn test_shared_state_is_reused_across_services() {
    let shared = SharedState::default();
    let first = harness_with(shared.clone());
    let second = harness_with(shared);

    let when = now_ms() + ONE_DAY_MS;
    assert_eq!(first.service.add_test(request("shared", when, None), &user()).await.status, 200);

    // The second service has its own (empty) storage but sees the loaded map.
    assert!(!second.objects.contains(SCHEDULE_KEY).await);
    let seen = second.service.get_scheduled_item("shared").await.unwrap();
    assert_eq!(seen.map(|item| item.next_start), Some(when));
}

#[tokio::test]
async fn test_concurrent_adds_across_services_are_all_saved() {
    let objects = Arc::new(YieldingStore::default());
    let shared = SharedState::default();
    let first = service_on(&objects, shared.clone());
    let second = service_on(&objects, shared);

    let when = now_ms() + ONE_DAY_MS;
    let caller = user();
    let (a, b) = tokio::join!(
        first.add_test(request("left", when, None), &caller),
        second.add_test(request("right", when, None), &caller),
    );
    assert_eq!(a.status, 200);
    assert_eq!(b.status, 200);

    let fresh = service_on(&objects, SharedState::default());
    assert_eq!(fresh.load_tests(true).await.unwrap(), 2);
}

#[tokio::test]
async fn test_concurrent_add_and_remove_on_one_service() {
    let objects = Arc::new(YieldingStore::default());
    let service = service_on(&objects, SharedState::default());
    let when = now_ms() + ONE_DAY_MS;
    assert_eq!(service.add_test(request("leaving", when, None), &user()).await.status, 200);

    let caller = user();
    let (added, removed) = tokio::join!(
        service.add_test(request("arriving", when, None), &caller),
        service.remove_test("leaving", &caller, false),
    );
    assert_eq!(added.status, 200);
    assert_eq!(removed.status, 200);

    let fresh = service_on(&objects, SharedState::default());
    assert_eq!(fresh.load_tests(true).await.unwrap(), 1);
    assert!(fresh.get_scheduled_item("arriving").await.unwrap().is_some());
}

#[tokio::test]
async fn test_concurrent_history_adds_across_services_are_all_saved() {
    let objects = Arc::new(YieldingStore::default());
    let shared = SharedState::default();
    let first = service_on(&objects, shared.clone());
    let second = service_on(&objects, shared);

    let now = now_ms();
    let (a, b) = tokio::join!(
        first.history().add_historical_test("one", "a.yaml", now, now),
        second.history().add_historical_test("two", "b.yaml", now, now),
    );
    a.unwrap();
    b.unwrap();

    let fresh = service_on(&objects, SharedState::default());
    let saved = fresh.history().load_historical(true).await.unwrap();
    assert!(saved.contains_key("one"));
    assert!(saved.contains_key("two"));
}

#[tokio::test]
async fn test_status_failure_during_tick_leaves_no_message_behind() {
    let h = harness();
    seed_schedule(&h.objects, vec![item("flaky", now_ms() - ONE_MINUTE_MS, Schedule::OneOff)]).await;

    h.status.set_failing(true);
    let started = h.service.start_scheduled_tests().await.unwrap();
    assert!(started.is_empty());
    assert_eq!(h.queue.len().await, 0);
    assert!(h.service.get_scheduled_item("flaky").await.unwrap().is_some());

    // Retried on the next pass, and enqueued exactly once.
    h.status.set_failing(false);
    let started = h.service.start_scheduled_tests().await.unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(h.queue.len().await, 1);
}
