//! bobbin-core
//!
//! Core building blocks for the Bobbin lease-based work queue.
//!
//! # Module layout
//! - **domain**: record model (ids, state, record)
//! - **ports**: seams to the outside world (Store, ResetStore, Clock)
//! - **impls**: implementations of the ports (MemoryStore)
//! - **app**: background loops that drive the store (Resetter, Worker, WorkerGroup)
//! - **config**: TOML-backed configuration
//! - **observability**: counters and state counts
//! - **error**: error types shared across layers

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;

pub use app::{Handler, HandlerError, Resetter, ResetterOptions, Worker, WorkerGroup, WorkerOptions};
pub use config::BobbinConfig;
pub use domain::{JobRecord, Record, RecordId, RecordState};
pub use error::{ConfigError, StoreError};
pub use impls::MemoryStore;
pub use observability::{QueueCounts, ResetterMetrics, WorkerMetrics};
pub use ports::{Clock, MockClock, ResetOutcome, ResetStore, Store, StoreOptions, SystemClock};
