//! Error types for semaphore and mutex operations

use thiserror::Error;

/// Errors produced by [`Semaphore`](crate::Semaphore) and [`Mutex`](crate::Mutex) operations
///
/// Two families live here: synchronous validation errors (`InvalidArgument`,
/// `OverRelease`) that are returned immediately and never enqueued, and
/// asynchronous acquisition failures (`Aborted`, `TimedOut`, `Cleared`,
/// `TooLargeForResize`) delivered through the acquire future. Acquisition
/// failures are terminal: the request is removed from the wait queue and any
/// permits it had already reserved are returned to the pool. Retry, if
/// desired, is the caller's responsibility via a fresh acquire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SemaphoreError {
    /// Malformed argument to construct, acquire, release, or resize
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The cancellation signal fired while the request was pending
    #[error("acquisition aborted by cancellation signal")]
    Aborted,

    /// The timeout elapsed while the request was pending
    #[error("acquisition timed out")]
    TimedOut,

    /// The wait queue was explicitly cleared while the request was pending
    #[error("acquisition rejected: wait queue cleared")]
    Cleared,

    /// A capacity shrink made this pending request permanently unsatisfiable
    #[error("pending request for {requested} permits exceeds resized capacity {capacity}")]
    TooLargeForResize {
        /// Permits the pending request asked for
        requested: usize,
        /// Capacity after the shrink
        capacity: usize,
    },

    /// Release called when every permit was already available
    ///
    /// This is a fatal caller bug (a release without a matching acquire); the
    /// semaphore never attempts to self-correct its accounting.
    #[error("release without matching acquire: all permits already available")]
    OverRelease,
}

/// Convenience alias used throughout this crate
pub type Result<T> = std::result::Result<T, SemaphoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SemaphoreError::InvalidArgument("capacity must be at least 1").to_string(),
            "invalid argument: capacity must be at least 1"
        );
        assert_eq!(
            SemaphoreError::TooLargeForResize {
                requested: 8,
                capacity: 7
            }
            .to_string(),
            "pending request for 8 permits exceeds resized capacity 7"
        );
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(SemaphoreError::Aborted, SemaphoreError::Aborted);
        assert_ne!(SemaphoreError::Aborted, SemaphoreError::TimedOut);
    }
}
