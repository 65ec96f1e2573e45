//! Test scheduler: durable schedule and history maps, recurrence, dispatch.

pub mod cache;
pub mod dispatch;
pub mod engine;
pub mod history;
pub mod recurrence;
pub mod service;
pub mod store;
pub mod types;

// Re-export common types
pub use self::cache::{SchedulerCache, SharedSlot, SharedStateProvider};
pub use self::dispatch::{DispatchOutcome, DispatchPlan, Dispatcher, ItemState};
pub use self::engine::{run_history_loop, run_scheduler_loop};
pub use self::history::{HistoricalJanitor, HistoryTick};
pub use self::recurrence::RecurrenceEngine;
pub use self::service::{Collaborators, SchedulerService, ServiceOptions, SharedState};
pub use self::store::{EntryMap, HistoryStore, JsonStore, ScheduleStore};
pub use self::types::*;
