//! Optimistic concurrency versions for job records.

use serde::{Deserialize, Serialize};

/// Version every freshly created job starts at.
pub const INITIAL_VERSION: u64 = 1;

/// Optimistic concurrency expectation for a conditional update.
///
/// There is deliberately no "any version" escape hatch: every mutation of a
/// job must name the version it read.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpectedVersion(pub u64);

impl ExpectedVersion {
    pub fn new(version: u64) -> Self {
        Self(version)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn matches(self, actual: u64) -> bool {
        self.0 == actual
    }

    /// Version the record carries after a successful update.
    pub fn next(self) -> u64 {
        self.0 + 1
    }
}

impl From<u64> for ExpectedVersion {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_only_exact_version() {
        let expected = ExpectedVersion::new(3);
        assert!(expected.matches(3));
        assert!(!expected.matches(2));
        assert!(!expected.matches(4));
        assert_eq!(expected.next(), 4);
    }
}
