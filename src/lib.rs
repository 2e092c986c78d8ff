//! compio-sema: async counting semaphore and mutex for the compio runtime
//!
//! This crate bounds concurrent access to a logical resource pool inside a
//! cooperatively scheduled async runtime. The [`Semaphore`] hands out permits
//! from a resizable pool; acquisitions beyond the pool wait in a strict FIFO
//! queue, with multi-permit requests treated as one atomic entry so large
//! requests are never starved by smaller ones arriving later. A pending
//! acquisition can be abandoned by an abort signal, a timeout, or an explicit
//! queue clear; all three return any partially reserved permits to the pool.
//! [`Mutex`] is the single-permit specialization.
//!
//! # Example
//!
//! ```rust,no_run
//! use compio_sema::Semaphore;
//!
//! #[compio::main]
//! async fn main() {
//!     let sem = Semaphore::new(3).unwrap();
//!
//!     // Spawn many tasks, but only 3 run concurrently
//!     let mut handles = Vec::new();
//!     for i in 0..100 {
//!         let sem = sem.clone();
//!         handles.push(compio::runtime::spawn(async move {
//!             sem.exec(|| async move {
//!                 println!("Task {}", i);
//!             })
//!             .await
//!         }));
//!     }
//!     for handle in handles {
//!         handle.await.unwrap().unwrap();
//!     }
//! }
//! ```

pub mod error;
pub mod mutex;
pub mod semaphore;

// Re-export commonly used types
pub use error::{Result, SemaphoreError};
pub use mutex::Mutex;
pub use semaphore::{AcquireRequest, Semaphore};

// The abort-signal capability consumed by `AcquireRequest::signal`
pub use futures::future::{AbortHandle, AbortRegistration};
