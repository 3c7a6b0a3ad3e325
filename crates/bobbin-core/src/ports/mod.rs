//! Ports: the seams between the queue logic and the outside world.
//!
//! - `Store` / `ResetStore` are the authority for record state. Every method is
//!   atomic with respect to concurrent callers, whatever the backing engine.
//! - `Clock` abstracts time so lease ages can be tested deterministically.

pub mod clock;
pub mod store;

pub use self::clock::{Clock, MockClock, SystemClock};
pub use self::store::{ResetOutcome, ResetStore, Store, StoreOptions};
