//! # relay-queue
//!
//! Unbounded multi-producer multi-consumer FIFO queues.
//!
//! Two variants with the same contract and different synchronization
//! trade-offs:
//!
//! - [`LockFreeQueue`]: the Michael & Scott CAS-linked queue. Every
//!   operation is a compare-and-swap retry loop; no mutexes anywhere.
//!   Best under many-producer contention.
//! - [`TwoLockQueue`]: one mutex guarding the head, another guarding the
//!   tail. A producer and a consumer proceed concurrently, but producers
//!   serialize among themselves (as do consumers). Simpler to reason
//!   about; lower throughput when many threads push at once.
//!
//! Both preserve global FIFO order of completed pushes and signal "empty"
//! with `None` rather than blocking: there is nothing to wait on and no
//! error to handle.
//!
//! ## Example
//!
//! ```
//! use relay_queue::LockFreeQueue;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let queue = Arc::new(LockFreeQueue::new());
//!
//! let producers: Vec<_> = (0..4)
//!     .map(|p| {
//!         let queue = Arc::clone(&queue);
//!         thread::spawn(move || {
//!             for i in 0..100 {
//!                 queue.push(p * 100 + i);
//!             }
//!         })
//!     })
//!     .collect();
//!
//! for handle in producers {
//!     handle.join().unwrap();
//! }
//!
//! let mut drained = 0;
//! while queue.poll().is_some() {
//!     drained += 1;
//! }
//! assert_eq!(drained, 400);
//! ```
//!
//! ## Memory reclamation
//!
//! The lock-free variant retires consumed nodes through epoch-based
//! reclamation (`crossbeam-epoch`): a node is freed only once every thread
//! that could still hold a reference to it has moved past the epoch in
//! which it was unlinked. The two-lock variant frees nodes directly; the
//! head mutex guarantees no concurrent reader exists.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod lock_free;
mod two_lock;

pub use lock_free::LockFreeQueue;
pub use two_lock::TwoLockQueue;
