//! App: background loops built on top of the ports.
//!
//! # Components
//! - **Handler**: the seam where business logic plugs in
//! - **Resetter**: reclaims records whose worker stopped heartbeating
//! - **Worker**: dequeue -> handle -> heartbeat -> finalize loop
//! - **WorkerGroup**: several workers sharing one store and one shutdown switch

pub mod handler;
pub mod resetter;
pub mod worker_loop;

pub use self::handler::{Handler, HandlerError};
pub use self::resetter::{ResetSummary, Resetter, ResetterOptions};
pub use self::worker_loop::{Worker, WorkerGroup, WorkerOptions};
