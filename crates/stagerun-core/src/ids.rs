//! Newtype wrappers for identifiers to ensure type safety.
//!
//! Both identifiers are storage-assigned monotone integers; the zero value
//! marks a row that has not been persisted yet.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a Task.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TaskId(i64);

impl TaskId {
    /// Create a TaskId from a raw integer.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw integer value.
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Unique identifier for a Subtask.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SubtaskId(i64);

impl SubtaskId {
    /// Create a SubtaskId from a raw integer.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw integer value.
    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for SubtaskId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ordering() {
        assert!(TaskId::new(1) < TaskId::new(2));
        assert_eq!(TaskId::new(7).value(), 7);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", TaskId::new(42)), "42");
        assert_eq!(format!("{}", SubtaskId::new(9)), "9");
    }
}
