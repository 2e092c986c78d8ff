//! Async mutex built as a single-permit semaphore
//!
//! A [`Mutex`] is a [`Semaphore`] fixed at capacity 1, by composition rather
//! than inheritance: the semaphore's resize surface is deliberately not
//! exposed, since a mutex that can grow permits is no longer a mutex.

use std::future::Future;

use crate::error::{Result, SemaphoreError};
use crate::semaphore::{AcquireRequest, Semaphore};

/// Mutual exclusion over a cooperatively scheduled critical section
///
/// Callers pair [`acquire`](Mutex::acquire) with [`release`](Mutex::release)
/// manually, or use [`exec`](Mutex::exec) to run a task with the lock held
/// and released on every exit path. Clones share the same lock.
///
/// # Example
///
/// ```rust,no_run
/// use compio_sema::Mutex;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mutex = Mutex::new();
///
/// mutex.acquire().await?;
/// // ... critical section ...
/// mutex.release()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct Mutex {
    semaphore: Semaphore,
}

impl Mutex {
    /// Create an unlocked mutex
    #[must_use]
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::with_capacity(1),
        }
    }

    /// Acquire the lock, waiting until it is free
    ///
    /// # Errors
    ///
    /// [`SemaphoreError::Cleared`](crate::SemaphoreError::Cleared) if the
    /// queue is cleared while waiting.
    pub async fn acquire(&self) -> Result<()> {
        self.semaphore.acquire(1).await.map(|_granted| ())
    }

    /// Acquire the lock with an abort signal and/or timeout attached
    ///
    /// A mutex acquisition is always exactly one permit; a request built for
    /// any other count is a caller bug and is rejected.
    ///
    /// # Errors
    ///
    /// [`SemaphoreError::InvalidArgument`](crate::SemaphoreError::InvalidArgument)
    /// if the request's permit count is not 1; otherwise as
    /// [`Semaphore::acquire_with`].
    pub async fn acquire_with(&self, request: AcquireRequest) -> Result<()> {
        self.semaphore
            .acquire_with(Self::single_permit(request)?)
            .await
            .map(|_granted| ())
    }

    /// Take the lock without waiting; `true` if it was taken
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.semaphore.try_acquire(1).is_some()
    }

    /// Release the lock
    ///
    /// # Errors
    ///
    /// [`SemaphoreError::OverRelease`](crate::SemaphoreError::OverRelease)
    /// if the mutex was not held.
    pub fn release(&self) -> Result<()> {
        self.semaphore.release(1)
    }

    /// Run `task` with the lock held, releasing it on every exit path
    ///
    /// # Errors
    ///
    /// The acquisition's failure, if any; the task's own output is forwarded
    /// unchanged inside `Ok`.
    pub async fn exec<F, Fut>(&self, task: F) -> Result<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.semaphore.exec(task).await
    }

    /// [`exec`](Mutex::exec) with an abort signal and/or timeout attached
    ///
    /// # Errors
    ///
    /// [`SemaphoreError::InvalidArgument`](crate::SemaphoreError::InvalidArgument)
    /// if the request's permit count is not 1; otherwise the acquisition's
    /// failure, if any.
    pub async fn exec_with<F, Fut>(&self, request: AcquireRequest, task: F) -> Result<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.semaphore
            .exec_with(Self::single_permit(request)?, task)
            .await
    }

    /// Validate that a request asks for exactly the mutex's one permit
    fn single_permit(request: AcquireRequest) -> Result<AcquireRequest> {
        if request.permits != 1 {
            return Err(SemaphoreError::InvalidArgument(
                "mutex acquisition takes exactly one permit",
            ));
        }
        Ok(request)
    }

    /// Reject every task waiting for the lock with
    /// [`SemaphoreError::Cleared`](crate::SemaphoreError::Cleared)
    pub fn clear_queue(&self) {
        self.semaphore.clear_queue();
    }

    /// Whether the lock is currently held
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.semaphore.available() == 0
    }

    /// Number of tasks waiting for the lock
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.semaphore.waiting()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::AbortHandle;

    use crate::error::SemaphoreError;

    use super::*;

    #[test]
    fn test_new_is_unlocked() {
        let mutex = Mutex::new();
        assert!(!mutex.is_locked());
        assert_eq!(mutex.waiting(), 0);
    }

    #[test]
    fn test_try_acquire_and_release() {
        let mutex = Mutex::new();
        assert!(mutex.try_acquire());
        assert!(mutex.is_locked());
        assert!(!mutex.try_acquire());
        mutex.release().unwrap();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_release_unheld_is_over_release() {
        let mutex = Mutex::new();
        assert_eq!(mutex.release(), Err(SemaphoreError::OverRelease));
    }

    #[compio::test]
    async fn test_acquire_serializes_waiters() {
        let mutex = Mutex::new();
        mutex.acquire().await.unwrap();

        let contender = mutex.clone();
        let handle = compio::runtime::spawn(async move {
            contender.acquire().await.unwrap();
            contender.release().unwrap();
        });

        compio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mutex.waiting(), 1);

        mutex.release().unwrap();
        handle.await.unwrap();
        assert!(!mutex.is_locked());
    }

    #[compio::test]
    async fn test_acquire_with_rejects_multi_permit_request() {
        let mutex = Mutex::new();
        // A request built for any count other than 1 is a caller bug
        assert_eq!(
            mutex.acquire_with(AcquireRequest::new(3)).await,
            Err(SemaphoreError::InvalidArgument(
                "mutex acquisition takes exactly one permit"
            ))
        );
        assert_eq!(
            mutex
                .exec_with(AcquireRequest::new(0), || async {})
                .await,
            Err(SemaphoreError::InvalidArgument(
                "mutex acquisition takes exactly one permit"
            ))
        );
        // The failed requests touched nothing
        assert!(!mutex.is_locked());
        mutex.acquire_with(AcquireRequest::new(1)).await.unwrap();
        assert!(mutex.is_locked());
        mutex.release().unwrap();
    }

    #[compio::test]
    async fn test_acquire_with_timeout_on_contended_lock() {
        let mutex = Mutex::new();
        mutex.acquire().await.unwrap();

        let request = AcquireRequest::new(1).timeout(Duration::from_millis(20));
        assert_eq!(
            mutex.acquire_with(request).await,
            Err(SemaphoreError::TimedOut)
        );
        assert_eq!(mutex.waiting(), 0);
        mutex.release().unwrap();
    }

    #[compio::test]
    async fn test_acquire_with_abort_signal() {
        let mutex = Mutex::new();
        mutex.acquire().await.unwrap();

        let (abort, registration) = AbortHandle::new_pair();
        let contender = mutex.clone();
        let handle = compio::runtime::spawn(async move {
            contender
                .acquire_with(AcquireRequest::new(1).signal(registration))
                .await
        });
        compio::time::sleep(Duration::from_millis(10)).await;

        abort.abort();
        assert_eq!(handle.await.unwrap(), Err(SemaphoreError::Aborted));
        mutex.release().unwrap();
        assert!(!mutex.is_locked());
    }

    #[compio::test]
    async fn test_exec_holds_and_releases_lock() {
        let mutex = Mutex::new();
        let observed = mutex.clone();
        let value = mutex
            .exec(|| async move {
                assert!(observed.is_locked());
                7
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(!mutex.is_locked());
    }

    #[compio::test]
    async fn test_clear_queue_rejects_waiters() {
        let mutex = Mutex::new();
        mutex.acquire().await.unwrap();

        let contender = mutex.clone();
        let handle = compio::runtime::spawn(async move { contender.acquire().await });
        compio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mutex.waiting(), 1);

        mutex.clear_queue();
        assert_eq!(handle.await.unwrap(), Err(SemaphoreError::Cleared));
        assert!(mutex.is_locked());
        mutex.release().unwrap();
    }
}
