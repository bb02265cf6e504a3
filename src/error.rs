//! Error types for the fast-copyable hash map.
//!
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations, the same way every other error type in this codebase
//! is built.

use thiserror::Error;

/// Result type alias for FCHM operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types returned by [`crate::Series`], [`crate::MutableSnapshot`]
/// and [`crate::Snapshot`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Operation requires the series' mutable snapshot.
    #[error("operation requires the mutable snapshot")]
    MutableExpected,

    /// The snapshot handle has already been released.
    #[error("snapshot already released")]
    UseAfterRelease,

    /// Attempted to release the mutable snapshot while immutable
    /// snapshots are still live.
    #[error("cannot release the mutable snapshot while {live_immutable} immutable snapshot(s) remain live")]
    ReleaseOrderViolated {
        /// Number of immutable snapshots still outstanding.
        live_immutable: usize,
    },

    /// Attempted to release a version that is not currently live.
    #[error("version {0} is not currently live (already released or never existed)")]
    DuplicateRelease(u64),

    /// The version counter would overflow `u64`. The series is poisoned
    /// from this point on.
    #[error("version counter overflowed; series is poisoned")]
    VersionOverflow,

    /// A prior `VersionOverflow` poisoned this series; no further
    /// operations are possible.
    #[error("series is poisoned by a prior fatal error")]
    SeriesPoisoned,
}

impl Error {
    /// True for errors that leave the series permanently unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::VersionOverflow | Error::SeriesPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_mutable_expected() {
        let err = Error::MutableExpected;
        assert_eq!(err.to_string(), "operation requires the mutable snapshot");
    }

    #[test]
    fn test_error_display_release_order_violated() {
        let err = Error::ReleaseOrderViolated { live_immutable: 3 };
        let msg = err.to_string();
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_error_display_duplicate_release() {
        let err = Error::DuplicateRelease(7);
        assert!(err.to_string().contains('7'));
    }

    #[test]
    fn test_is_fatal() {
        assert!(Error::VersionOverflow.is_fatal());
        assert!(Error::SeriesPoisoned.is_fatal());
        assert!(!Error::MutableExpected.is_fatal());
        assert!(!Error::DuplicateRelease(0).is_fatal());
    }

    #[test]
    fn test_error_is_clone_and_eq() {
        let a = Error::DuplicateRelease(5);
        let b = a.clone();
        assert_eq!(a, b);
    }
}
