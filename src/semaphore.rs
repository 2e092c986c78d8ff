//! Async counting semaphore with FIFO multi-permit acquisition
//!
//! The semaphore owns a permit pool and an ordered queue of pending
//! acquisitions. A request for N permits is a single atomic queue entry: it
//! is granted one permit at a time as capacity frees up, but it stays at the
//! head of the queue, blocking everything behind it, until fully satisfied.
//! This is a deliberate fairness choice: a large request is never starved by
//! a stream of smaller ones arriving later, at the cost of a convoy effect
//! behind it.
//!
//! Pending acquisitions can be abandoned three ways: an abort signal
//! ([`AbortHandle`](futures::future::AbortHandle)), a timeout, or
//! [`Semaphore::clear_queue`]. All three remove the request from the queue
//! immediately and return any permits it had already reserved, so a doomed
//! request never leaks permits or blocks the requests behind it.
//!
//! # Example
//!
//! ```rust,no_run
//! use compio_sema::Semaphore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sem = Semaphore::new(3)?;
//!
//! // Bound concurrent work to three tasks at a time
//! let granted = sem.acquire(1).await?;
//! // ... do work ...
//! sem.release(granted)?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use futures::future::{AbortRegistration, Abortable};
use tracing::{debug, trace, warn};

use crate::error::{Result, SemaphoreError};

/// Configuration for a single acquisition
///
/// Named optional fields replace the positional count/signal/timeout shapes a
/// caller might otherwise juggle: build one request value and hand it to
/// [`Semaphore::acquire_with`] or [`Semaphore::exec_with`].
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use compio_sema::{AcquireRequest, Semaphore};
/// use futures::future::AbortHandle;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let sem = Semaphore::new(4)?;
/// let (handle, registration) = AbortHandle::new_pair();
///
/// let request = AcquireRequest::new(2)
///     .signal(registration)
///     .timeout(Duration::from_millis(500));
/// let granted = sem.acquire_with(request).await?;
/// # let _ = handle;
/// sem.release(granted)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct AcquireRequest {
    pub(crate) permits: usize,
    pub(crate) signal: Option<AbortRegistration>,
    pub(crate) timeout: Option<Duration>,
}

impl AcquireRequest {
    /// Create a request for the given number of permits
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            permits,
            signal: None,
            timeout: None,
        }
    }

    /// Attach an abort signal; firing it rejects the pending request with
    /// [`SemaphoreError::Aborted`] regardless of its queue position
    #[must_use]
    pub fn signal(mut self, signal: AbortRegistration) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Attach a timeout; the request is rejected with
    /// [`SemaphoreError::TimedOut`] no earlier than `timeout` after enqueue
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Default for AcquireRequest {
    fn default() -> Self {
        Self::new(1)
    }
}

/// An async counting semaphore with a resizable permit pool
///
/// # Design
///
/// - **FIFO queue of atomic multi-permit requests**: permits flow to the
///   queue head one at a time; the head blocks later entries until it is
///   fully granted or removed (head-of-line policy).
/// - **Manual release accounting**: `acquire` resolves to the granted count
///   and the caller releases it; releasing when nothing is held is
///   [`SemaphoreError::OverRelease`]. The [`exec`](Semaphore::exec) wrapper
///   handles the pairing for scoped work.
/// - **Leak-free cancellation**: abort, timeout, queue clear, and shrink all
///   return a doomed request's partial grants to the pool and trigger a
///   fresh dispatch pass.
/// - **Cloneable**: clones share one pool via `Arc`, so one limiter can be
///   handed to many tasks.
#[derive(Clone, Debug)]
pub struct Semaphore {
    /// Shared state between all clones of this semaphore
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Permit pool and wait queue; every operation locks, mutates to
    /// completion, then wakes outside the lock
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    /// Configured permit ceiling, always at least 1
    capacity: usize,
    /// Permits not currently held, `0 ..= capacity`
    available: usize,
    /// Pending acquisitions in arrival order; every entry is `Pending`
    queue: VecDeque<Arc<Waiter>>,
}

/// One queued acquisition, shared between the queue and its `Wait` future
#[derive(Debug)]
struct Waiter {
    /// Total permits this request needs, fixed at creation
    requested: usize,
    cell: Mutex<WaiterCell>,
}

#[derive(Debug)]
struct WaiterCell {
    /// Permits already reserved toward this request
    granted: usize,
    outcome: Outcome,
    waker: Option<Waker>,
}

/// Per-request state machine: terminal once resolved, never back to pending
#[derive(Debug, Clone)]
enum Outcome {
    Pending,
    Fulfilled,
    Rejected(SemaphoreError),
    /// The owning future was dropped before resolution; the entry has left
    /// the queue and its grants are back in the pool. Nothing can observe
    /// this state, it exists so an abandoned request is still terminal.
    Abandoned,
}

/// Lock a mutex, ignoring poisoning
///
/// State transitions never panic while holding the lock, so a poisoned guard
/// still holds consistent state.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Move available permits to the queue head, one at a time
///
/// Runs after every release, resize, initial enqueue, and permit-returning
/// rejection. The head keeps receiving permits until it is fully granted
/// (then it is dequeued, marked fulfilled, and its waker collected) or
/// `available` hits zero. Later entries are never touched while the head is
/// unsatisfied.
fn dispatch(state: &mut State, wakers: &mut Vec<Waker>) {
    while state.available > 0 {
        let Some(head) = state.queue.front().cloned() else {
            break;
        };
        let mut cell = lock(&head.cell);
        state.available -= 1;
        cell.granted += 1;
        trace!(
            granted = cell.granted,
            requested = head.requested,
            available = state.available,
            "granted permit to queue head"
        );
        if cell.granted == head.requested {
            cell.outcome = Outcome::Fulfilled;
            if let Some(waker) = cell.waker.take() {
                wakers.push(waker);
            }
            drop(cell);
            state.queue.pop_front();
        }
    }
}

/// Reject a waiter in place: terminal outcome, grants returned, waker taken
///
/// The caller is responsible for having removed (or not re-inserting) the
/// waiter into the queue within the same critical section.
fn reject(
    state: &mut State,
    waiter: &Waiter,
    reason: SemaphoreError,
    wakers: &mut Vec<Waker>,
) {
    let mut cell = lock(&waiter.cell);
    state.available = (state.available + cell.granted).min(state.capacity);
    cell.granted = 0;
    cell.outcome = Outcome::Rejected(reason);
    if let Some(waker) = cell.waker.take() {
        wakers.push(waker);
    }
}

impl Semaphore {
    /// Create a semaphore with the given permit capacity
    ///
    /// # Errors
    ///
    /// Returns [`SemaphoreError::InvalidArgument`] if `capacity` is zero.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_sema::Semaphore;
    ///
    /// let sem = Semaphore::new(1024).unwrap();
    /// assert_eq!(sem.available(), 1024);
    /// assert!(Semaphore::new(0).is_err());
    /// ```
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(SemaphoreError::InvalidArgument(
                "capacity must be at least 1",
            ));
        }
        Ok(Self::with_capacity(capacity))
    }

    /// Infallible constructor for callers that fix a valid capacity
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    capacity,
                    available: capacity,
                    queue: VecDeque::new(),
                }),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    /// Current permit capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.lock_state().capacity
    }

    /// Permits not currently held
    ///
    /// Useful for monitoring and tests; the value may change as soon as
    /// another task runs.
    #[must_use]
    pub fn available(&self) -> usize {
        self.lock_state().available
    }

    /// Total permit-units still owed to pending requests
    ///
    /// The sum of `requested - granted` over the wait queue.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_sema::Semaphore;
    ///
    /// let sem = Semaphore::new(2).unwrap();
    /// assert_eq!(sem.waiting(), 0);
    /// ```
    #[must_use]
    pub fn waiting(&self) -> usize {
        let state = self.lock_state();
        state
            .queue
            .iter()
            .map(|waiter| waiter.requested - lock(&waiter.cell).granted)
            .sum()
    }

    /// Resize the permit pool
    ///
    /// Growth adds the delta to `available` and immediately dispatches it to
    /// the queue, waking up to `min(waiting, delta)` queued permit-units
    /// without any release call. Shrink subtracts the delta from `available`
    /// (clamped at zero; permits already held stay held until released) and
    /// rejects every queued request whose `requested` now exceeds the new
    /// capacity with [`SemaphoreError::TooLargeForResize`], returning any
    /// permits those requests had partially reserved.
    ///
    /// # Errors
    ///
    /// Returns [`SemaphoreError::InvalidArgument`] if `new_capacity` is zero.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_sema::Semaphore;
    ///
    /// let sem = Semaphore::new(4).unwrap();
    /// sem.resize(9).unwrap();
    /// assert_eq!(sem.capacity(), 9);
    /// assert_eq!(sem.available(), 9);
    /// ```
    pub fn resize(&self, new_capacity: usize) -> Result<()> {
        if new_capacity == 0 {
            return Err(SemaphoreError::InvalidArgument(
                "capacity must be at least 1",
            ));
        }
        let mut wakers = Vec::new();
        {
            let mut state = self.lock_state();
            let old_capacity = state.capacity;
            if new_capacity >= old_capacity {
                state.available += new_capacity - old_capacity;
            } else {
                state.available = state
                    .available
                    .saturating_sub(old_capacity - new_capacity);
            }
            state.capacity = new_capacity;
            debug!(
                old_capacity,
                new_capacity,
                available = state.available,
                "resized semaphore"
            );

            // A shrink can never satisfy a request that now exceeds the
            // ceiling, even one already partially granted.
            let queue = std::mem::take(&mut state.queue);
            for waiter in queue {
                if waiter.requested > new_capacity {
                    debug!(
                        requested = waiter.requested,
                        capacity = new_capacity,
                        "rejecting pending request oversized by shrink"
                    );
                    reject(
                        &mut state,
                        &waiter,
                        SemaphoreError::TooLargeForResize {
                            requested: waiter.requested,
                            capacity: new_capacity,
                        },
                        &mut wakers,
                    );
                } else {
                    state.queue.push_back(waiter);
                }
            }
            dispatch(&mut state, &mut wakers);
        }
        for waker in wakers {
            waker.wake();
        }
        Ok(())
    }

    /// Acquire permits without waiting
    ///
    /// Grants only when the wait queue is empty (strict FIFO: nobody jumps
    /// ahead of queued requests) and `permits` are available. Returns the
    /// granted count, or `None` if the grant is not immediately possible or
    /// `permits` is zero or above capacity.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_sema::Semaphore;
    ///
    /// let sem = Semaphore::new(2).unwrap();
    /// assert_eq!(sem.try_acquire(2), Some(2));
    /// assert_eq!(sem.try_acquire(1), None);
    /// sem.release(2).unwrap();
    /// ```
    #[must_use]
    pub fn try_acquire(&self, permits: usize) -> Option<usize> {
        if permits == 0 {
            return None;
        }
        let mut state = self.lock_state();
        if permits > state.capacity || !state.queue.is_empty() || state.available < permits {
            return None;
        }
        state.available -= permits;
        Some(permits)
    }

    /// Acquire `permits` permits, waiting until they are all granted
    ///
    /// Resolves with the granted count (always `permits`). The request is a
    /// single atomic queue entry: it collects permits one at a time at the
    /// queue head and blocks later arrivals until fully satisfied.
    ///
    /// # Errors
    ///
    /// [`SemaphoreError::InvalidArgument`] if `permits` is zero or exceeds
    /// the current capacity; [`SemaphoreError::Cleared`] or
    /// [`SemaphoreError::TooLargeForResize`] if the queue is cleared or
    /// shrunk underneath the request while it waits.
    pub async fn acquire(&self, permits: usize) -> Result<usize> {
        self.acquire_with(AcquireRequest::new(permits)).await
    }

    /// Acquire with an explicit [`AcquireRequest`] configuration
    ///
    /// The abort signal and timeout race against fulfillment; the first
    /// terminal event wins and is applied exactly once. Losing sources are
    /// torn down with the wait future itself, and a request rejected after
    /// partial grants returns those permits to the pool on every path.
    ///
    /// # Errors
    ///
    /// Everything [`acquire`](Semaphore::acquire) returns, plus
    /// [`SemaphoreError::Aborted`] and [`SemaphoreError::TimedOut`] from the
    /// attached cancellation sources, and
    /// [`SemaphoreError::InvalidArgument`] for a zero timeout.
    pub async fn acquire_with(&self, request: AcquireRequest) -> Result<usize> {
        let AcquireRequest {
            permits,
            signal,
            timeout,
        } = request;
        if let Some(timeout) = timeout {
            if timeout.is_zero() {
                return Err(SemaphoreError::InvalidArgument("timeout must be positive"));
            }
        }
        let wait = self.start_wait(permits)?;
        match (signal, timeout) {
            (None, None) => wait.await,
            (Some(signal), None) => match Abortable::new(wait, signal).await {
                Ok(outcome) => outcome,
                Err(futures::future::Aborted) => Err(SemaphoreError::Aborted),
            },
            (None, Some(timeout)) => match compio::time::timeout(timeout, wait).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => Err(SemaphoreError::TimedOut),
            },
            (Some(signal), Some(timeout)) => {
                match compio::time::timeout(timeout, Abortable::new(wait, signal)).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(futures::future::Aborted)) => Err(SemaphoreError::Aborted),
                    Err(_elapsed) => Err(SemaphoreError::TimedOut),
                }
            }
        }
    }

    /// Validate and start one acquisition: immediate grant or enqueue
    fn start_wait(&self, permits: usize) -> Result<Wait<'_>> {
        let mut state = self.lock_state();
        if permits == 0 {
            return Err(SemaphoreError::InvalidArgument("permits must be at least 1"));
        }
        if permits > state.capacity {
            return Err(SemaphoreError::InvalidArgument(
                "permits exceed semaphore capacity",
            ));
        }
        if state.queue.is_empty() && state.available >= permits {
            state.available -= permits;
            trace!(permits, available = state.available, "acquired immediately");
            return Ok(Wait {
                semaphore: self,
                waiter: None,
                permits,
                done: false,
            });
        }
        let waiter = Arc::new(Waiter {
            requested: permits,
            cell: Mutex::new(WaiterCell {
                granted: 0,
                outcome: Outcome::Pending,
                waker: None,
            }),
        });
        state.queue.push_back(Arc::clone(&waiter));
        // Partial grants flow to the new entry only if it became the head of
        // an otherwise empty queue; nothing can complete here.
        let mut wakers = Vec::new();
        dispatch(&mut state, &mut wakers);
        debug_assert!(wakers.is_empty());
        trace!(permits, "enqueued acquisition");
        Ok(Wait {
            semaphore: self,
            waiter: Some(waiter),
            permits,
            done: false,
        })
    }

    /// Return `permits` permits to the pool
    ///
    /// Permits are returned one unit at a time, with a dispatch pass after
    /// each unit, so one multi-unit release can wake several small pending
    /// requests or progress one large one in head-of-line order.
    ///
    /// # Errors
    ///
    /// [`SemaphoreError::InvalidArgument`] if `permits` is zero or exceeds
    /// capacity; [`SemaphoreError::OverRelease`] if a unit is returned while
    /// every permit is already available. Over-release is a fatal caller bug:
    /// accounting is left as of the failing unit, not rolled back.
    ///
    /// # Example
    ///
    /// ```rust
    /// use compio_sema::{Semaphore, SemaphoreError};
    ///
    /// let sem = Semaphore::new(2).unwrap();
    /// assert_eq!(sem.try_acquire(1), Some(1));
    /// sem.release(1).unwrap();
    /// assert_eq!(sem.release(1), Err(SemaphoreError::OverRelease));
    /// ```
    pub fn release(&self, permits: usize) -> Result<()> {
        let mut wakers = Vec::new();
        let outcome = {
            let mut state = self.lock_state();
            if permits == 0 {
                return Err(SemaphoreError::InvalidArgument("permits must be at least 1"));
            }
            if permits > state.capacity {
                return Err(SemaphoreError::InvalidArgument(
                    "permits exceed semaphore capacity",
                ));
            }
            let mut outcome = Ok(());
            for _ in 0..permits {
                if state.available == state.capacity {
                    outcome = Err(SemaphoreError::OverRelease);
                    break;
                }
                state.available += 1;
                dispatch(&mut state, &mut wakers);
            }
            trace!(permits, available = state.available, "released permits");
            outcome
        };
        for waker in wakers {
            waker.wake();
        }
        outcome
    }

    /// Alias for [`release`](Semaphore::release)
    ///
    /// # Errors
    ///
    /// Same as [`release`](Semaphore::release).
    pub fn signal(&self, permits: usize) -> Result<()> {
        self.release(permits)
    }

    /// Reject every pending acquisition with [`SemaphoreError::Cleared`]
    ///
    /// Removes all entries from the wait queue; permits partially granted to
    /// queued requests are returned to the pool. Permits held by completed
    /// acquisitions are untouched.
    pub fn clear_queue(&self) {
        let mut wakers = Vec::new();
        {
            let mut state = self.lock_state();
            let queue = std::mem::take(&mut state.queue);
            if !queue.is_empty() {
                debug!(cleared = queue.len(), "clearing wait queue");
            }
            for waiter in queue {
                reject(&mut state, &waiter, SemaphoreError::Cleared, &mut wakers);
            }
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Acquire one permit, run `task`, release the permit
    ///
    /// See [`exec_with`](Semaphore::exec_with).
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
        self.exec_with(AcquireRequest::default(), task).await
    }

    /// Acquire per `request`, run `task`, release exactly once
    ///
    /// If the acquisition fails, `task` never runs, nothing is released, and
    /// the acquisition error propagates. Once the permits are held, they are
    /// released by a drop guard, so exactly one release happens whether the
    /// task completes, panics, or its future is dropped mid-run. The task's
    /// output (including any `Err` value it produces) is forwarded unchanged.
    ///
    /// # Errors
    ///
    /// The acquisition's failure, if any.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use compio_sema::Semaphore;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let sem = Semaphore::new(3).unwrap();
    /// let value = sem.exec(|| async { 40 + 2 }).await?;
    /// assert_eq!(value, 42);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn exec_with<F, Fut>(&self, request: AcquireRequest, task: F) -> Result<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let permits = request.permits;
        self.acquire_with(request).await?;
        let _guard = ReleaseGuard {
            semaphore: self,
            permits,
        };
        Ok(task().await)
    }
}

impl Default for Semaphore {
    /// A semaphore with a single permit
    fn default() -> Self {
        Self::with_capacity(1)
    }
}

/// Releases held permits when an `exec` task finishes on any path
struct ReleaseGuard<'a> {
    semaphore: &'a Semaphore,
    permits: usize,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.semaphore.release(self.permits) {
            // Reachable only if the caller tampered with accounting (e.g.
            // released permits it never held) while the task ran.
            warn!(%error, permits = self.permits, "release after exec task failed");
        }
    }
}

/// Future for one acquisition
///
/// `waiter: None` means the permits were granted synchronously at creation.
/// Dropping an unfinished `Wait` is the guaranteed-cleanup path shared by
/// every cancellation source: the entry leaves the queue, reserved permits
/// return to the pool, and a fresh dispatch pass runs.
struct Wait<'a> {
    semaphore: &'a Semaphore,
    waiter: Option<Arc<Waiter>>,
    permits: usize,
    /// Outcome was handed to the caller; drop must not touch accounting
    done: bool,
}

impl Future for Wait<'_> {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(waiter) = &this.waiter else {
            this.done = true;
            return Poll::Ready(Ok(this.permits));
        };
        let mut cell = lock(&waiter.cell);
        match &cell.outcome {
            Outcome::Pending => {
                cell.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Outcome::Fulfilled => {
                drop(cell);
                this.done = true;
                Poll::Ready(Ok(this.permits))
            }
            Outcome::Rejected(reason) => {
                let reason = reason.clone();
                drop(cell);
                this.done = true;
                Poll::Ready(Err(reason))
            }
            // Set only while dropping this future; a dropped future is
            // never polled again.
            Outcome::Abandoned => Poll::Pending,
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut wakers = Vec::new();
        {
            let mut state = self.semaphore.lock_state();
            match &self.waiter {
                None => {
                    // Synchronous grant that the caller never observed (a
                    // pre-fired abort signal, for instance): hand it back.
                    state.available = (state.available + self.permits).min(state.capacity);
                    dispatch(&mut state, &mut wakers);
                }
                Some(waiter) => {
                    let cell = lock(&waiter.cell);
                    match cell.outcome {
                        Outcome::Pending => {
                            drop(cell);
                            if let Some(position) = state
                                .queue
                                .iter()
                                .position(|entry| Arc::ptr_eq(entry, waiter))
                            {
                                let _ = state.queue.remove(position);
                            }
                            let mut cell = lock(&waiter.cell);
                            state.available =
                                (state.available + cell.granted).min(state.capacity);
                            cell.granted = 0;
                            cell.outcome = Outcome::Abandoned;
                            drop(cell);
                            dispatch(&mut state, &mut wakers);
                        }
                        Outcome::Fulfilled => {
                            // Fulfilled, then lost the race to a timeout or
                            // abort before the caller saw it: return the full
                            // grant so nothing leaks.
                            drop(cell);
                            state.available =
                                (state.available + self.permits).min(state.capacity);
                            dispatch(&mut state, &mut wakers);
                        }
                        // The rejecting operation already returned the grants.
                        Outcome::Rejected(_) => {}
                        // Set only by this drop, which runs at most once, so
                        // this arm is unreachable.
                        Outcome::Abandoned => {}
                    }
                }
            }
        }
        for waker in wakers {
            waker.wake();
        }
    }
}
