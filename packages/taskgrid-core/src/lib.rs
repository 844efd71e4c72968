//! GPU-aware task scheduling engine for a shared multi-GPU workstation.
//!
//! This crate is the scheduling domain only: device discovery and ranking,
//! admission control, per-queue worker execution, retry/backoff, and the
//! live status snapshot. It has no network dependency — `taskgrid-server`
//! exposes it over HTTP, `taskgrid-cli` drives that server.

pub mod error;
pub mod events;
pub mod instance;
pub mod ledger;
pub mod model;
pub mod parser;
pub mod probe;
pub mod registry;
pub mod retry;
pub mod selector;
pub mod worker;

pub use error::{Identity, ParseError, Result, SchedulerError};
pub use events::{EventBus, SchedEvent};
pub use instance::{InstanceSnapshot, QueueSnapshot, SchedulerInstance, TaskSnapshot};
pub use model::{Mode, SchedulerConfig};
pub use registry::SchedulerRegistry;
