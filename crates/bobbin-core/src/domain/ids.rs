//! Record identifiers.
//!
//! Records are keyed by a store-assigned integer. The newtype keeps record ids
//! from being mixed up with counters and other plain integers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a record, assigned by the store on insert.
///
/// Ids are monotonically increasing within one store, so ordering by id matches
/// insertion order.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(i64);

impl RecordId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    /// The id that follows this one, or `None` past `i64::MAX`.
    pub(crate) fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_order_by_value() {
        let mut ids = vec![RecordId::new(44), RecordId::new(41), RecordId::new(43)];
        ids.sort();
        assert_eq!(ids, vec![RecordId::new(41), RecordId::new(43), RecordId::new(44)]);
        assert_eq!(RecordId::new(41).next(), Some(RecordId::new(42)));
        assert_eq!(RecordId::new(i64::MAX).next(), None);
    }

    #[test]
    fn ids_serialize_as_plain_integers() {
        let id = RecordId::new(42);

        let serialized = serde_json::to_string(&id).unwrap();
        assert_eq!(serialized, "42");

        let parsed: Vec<RecordId> = serde_json::from_str("[41, 43]").unwrap();
        assert_eq!(parsed, vec![RecordId::new(41), RecordId::new(43)]);
        assert_eq!(id.to_string(), "42");
    }
}
