//! Domain model: record identity, lifecycle state, and the record itself.

pub mod ids;
pub mod record;
pub mod state;

pub use ids::RecordId;
pub use record::{JobRecord, Record};
pub use state::RecordState;
