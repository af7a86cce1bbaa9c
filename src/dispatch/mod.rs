//! # Dispatch
//!
//! Background relay from the staged message store to the broker. A
//! [`DispatchScheduler`] owns one [`PartitionWorker`] task per partition; each
//! firing claims a batch, sends every claimed entity, and reports the
//! per-message outcomes back to the store.

pub mod scheduler;
pub mod worker;

pub use scheduler::{DispatchScheduler, SchedulerState};
pub use worker::{DispatchReport, PartitionWorker};
