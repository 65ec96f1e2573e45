//! Scheduled items, historical events, test messages and the records the
//! scheduler hands back to its callers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const ONE_MINUTE_MS: i64 = 60_000;
pub const ONE_DAY_MS: i64 = 86_400_000;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The message a test-runner agent receives from the queue.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestMessage {
    pub test_id: String,
    pub s3_folder: String,
    pub yaml_file: String,
    #[serde(default)]
    pub additional_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_run_time_mn: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_size_ms: Option<u64>,
    pub version: String,
    #[serde(default)]
    pub env_variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub restart_on_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_parser: Option<bool>,
}

impl TestMessage {
    /// Same template, new identity.
    pub fn with_identity(&self, identity: &TestIdentity) -> Self {
        Self {
            test_id: identity.test_id.clone(),
            s3_folder: identity.s3_folder.clone(),
            ..self.clone()
        }
    }

    /// Object keys of the yaml file and every additional file.
    pub fn artifact_keys(&self) -> Vec<String> {
        std::iter::once(&self.yaml_file)
            .chain(self.additional_files.iter())
            .map(|file| format!("{}/{}", self.s3_folder, file))
            .collect()
    }

    pub fn run_time_ms(&self) -> Option<i64> {
        self.test_run_time_mn
            .map(|mn| i64::from(mn) * ONE_MINUTE_MS)
    }
}

// Env variable values can hold credentials, only names are printed.
impl fmt::Debug for TestMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env: BTreeMap<&str, &str> = self
            .env_variables
            .keys()
            .map(|name| (name.as_str(), "<redacted>"))
            .collect();
        f.debug_struct("TestMessage")
            .field("test_id", &self.test_id)
            .field("s3_folder", &self.s3_folder)
            .field("yaml_file", &self.yaml_file)
            .field("additional_files", &self.additional_files)
            .field("test_run_time_mn", &self.test_run_time_mn)
            .field("bucket_size_ms", &self.bucket_size_ms)
            .field("version", &self.version)
            .field("env_variables", &env)
            .field("user_id", &self.user_id)
            .field("restart_on_failure", &self.restart_on_failure)
            .field("bypass_parser", &self.bypass_parser)
            .finish()
    }
}

/// Presentation metadata for one environment variable. Never the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentVariableMeta {
    pub name: String,
    #[serde(default)]
    pub hidden: bool,
}

/// `testId` + `s3Folder` pair identifying one run of a test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestIdentity {
    pub test_id: String,
    pub s3_folder: String,
}

impl TestIdentity {
    /// Mint a fresh identity for `yaml_file` at `at_ms`.
    ///
    /// `testId` is the lowercased alphanumeric yaml stem followed by a UTC
    /// `YYYYMMDDTHHMMSSmmm` stamp; `s3Folder` is `<stem>/<stamp>`.
    pub fn mint(yaml_file: &str, at_ms: i64) -> Self {
        let file_name = yaml_file.rsplit('/').next().unwrap_or(yaml_file);
        let stem = file_name
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(file_name);
        let stem: String = stem
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let stamp = Utc
            .timestamp_millis_opt(at_ms)
            .single()
            .unwrap_or_default()
            .format("%Y%m%dT%H%M%S%3f")
            .to_string();
        Self {
            test_id: format!("{stem}{stamp}"),
            s3_folder: format!("{stem}/{stamp}"),
        }
    }
}

/// Weekdays a recurring test runs on; 0 is Sunday. Non-empty, sorted, unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct DaysOfWeek(Vec<u8>);

impl DaysOfWeek {
    pub fn every_day() -> Self {
        Self((0..=6).collect())
    }

    pub fn contains(&self, day: u32) -> bool {
        self.0.iter().any(|d| u32::from(*d) == day)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<Vec<u8>> for DaysOfWeek {
    type Error = String;

    fn try_from(mut days: Vec<u8>) -> Result<Self, Self::Error> {
        if days.is_empty() {
            return Err("daysOfWeek must not be empty".to_string());
        }
        if let Some(bad) = days.iter().find(|d| **d > 6) {
            return Err(format!("daysOfWeek value {bad} is outside 0-6"));
        }
        days.sort_unstable();
        days.dedup();
        Ok(Self(days))
    }
}

impl From<DaysOfWeek> for Vec<u8> {
    fn from(days: DaysOfWeek) -> Self {
        days.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recurrence {
    pub days_of_week: DaysOfWeek,
    /// No occurrences are generated at or after this instant.
    pub end_date: i64,
}

/// Whether an item runs once or repeats. Persisted as an optional
/// `recurrence` field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<Recurrence>", into = "Option<Recurrence>")]
pub enum Schedule {
    #[default]
    OneOff,
    Recurring(Recurrence),
}

impl Schedule {
    pub fn is_one_off(&self) -> bool {
        matches!(self, Schedule::OneOff)
    }
}

impl From<Option<Recurrence>> for Schedule {
    fn from(recurrence: Option<Recurrence>) -> Self {
        match recurrence {
            Some(r) => Schedule::Recurring(r),
            None => Schedule::OneOff,
        }
    }
}

impl From<Schedule> for Option<Recurrence> {
    fn from(schedule: Schedule) -> Self {
        match schedule {
            Schedule::OneOff => None,
            Schedule::Recurring(r) => Some(r),
        }
    }
}

/// One entry of the schedule map, keyed by `test_message.test_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTestItem {
    pub test_message: TestMessage,
    pub queue_name: String,
    #[serde(default)]
    pub environment_variables_meta: Vec<EnvironmentVariableMeta>,
    pub schedule_date: i64,
    #[serde(rename = "recurrence", default, skip_serializing_if = "Schedule::is_one_off")]
    pub schedule: Schedule,
    pub next_start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ScheduledTestItem {
    pub fn test_id(&self) -> &str {
        &self.test_message.test_id
    }
}

/// Raw recurrence as it arrives from the API layer, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurrenceRequest {
    pub days_of_week: Vec<i64>,
    pub end_date: i64,
}

/// Input to `add_test`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub test_message: TestMessage,
    pub queue_name: String,
    #[serde(default)]
    pub environment_variables_meta: Vec<EnvironmentVariableMeta>,
    pub schedule_date: i64,
    #[serde(default)]
    pub recurrence: Option<RecurrenceRequest>,
}

/// A past run shown on the calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalEvent {
    /// The test id.
    pub id: String,
    /// The yaml file name.
    pub title: String,
    pub start: i64,
    pub end: i64,
}

/// Calendar shape of a schedule entry or historical event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum CalendarEvent {
    Single {
        id: String,
        title: String,
        start: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        end: Option<i64>,
    },
    Recurring {
        id: String,
        title: String,
        start_recur: i64,
        end_recur: i64,
        /// `HH:MM` local time of day.
        start_time: String,
        /// `HH:MM`, with hours past 23 when the run ends after midnight.
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<String>,
        days_of_week: Vec<u8>,
    },
}

impl From<&HistoricalEvent> for CalendarEvent {
    fn from(event: &HistoricalEvent) -> Self {
        CalendarEvent::Single {
            id: event.id.clone(),
            title: event.title.clone(),
            start: event.start,
            end: Some(event.end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    Scheduled,
    Created,
    Running,
    Finished,
    Failed,
    Unknown,
}

impl TestStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, TestStatus::Finished | TestStatus::Failed)
    }
}

/// Per-test record kept by the status store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatusRecord {
    pub status: TestStatus,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yaml_file: Option<String>,
}

impl TestStatusRecord {
    pub fn for_message(
        message: &TestMessage,
        status: TestStatus,
        start_time: i64,
        queue_name: &str,
    ) -> Self {
        Self {
            status,
            start_time,
            end_time: message.run_time_ms().map(|ms| start_time + ms),
            user_id: message.user_id.clone(),
            queue_name: Some(queue_name.to_string()),
            version: Some(message.version.clone()),
            errors: None,
            yaml_file: Some(message.yaml_file.clone()),
        }
    }
}

/// What the scheduler reports about a test it scheduled or started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestData {
    pub test_id: String,
    pub s3_folder: String,
    pub yaml_file: String,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub queue_name: String,
    pub version: String,
}

impl TestData {
    pub fn from_record(message: &TestMessage, record: &TestStatusRecord, queue_name: &str) -> Self {
        Self {
            test_id: message.test_id.clone(),
            s3_folder: message.s3_folder.clone(),
            yaml_file: message.yaml_file.clone(),
            start_time: record.start_time,
            end_time: record.end_time,
            status: record.status,
            user_id: record.user_id.clone(),
            queue_name: queue_name.to_string(),
            version: message.version.clone(),
        }
    }
}

/// Identity of the caller, as resolved by the API layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: String,
}

/// `{status, json}` envelope handed back to the API layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub json: serde_json::Value,
}

impl ApiResponse {
    pub fn ok(json: serde_json::Value) -> Self {
        Self { status: 200, json }
    }
}
