//! Implementations of the ports.
//!
//! - **MemoryStore**: single-process store guarded by one async mutex. Suitable
//!   for tests, demos and embedding; the `Store` trait is the seam for a
//!   database-backed engine.

mod memory_store;

pub use memory_store::{MAX_RESETS_MESSAGE, MemoryStore};
