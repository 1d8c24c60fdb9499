//! The Michael & Scott lock-free unbounded FIFO queue.
//!
//! Reference: M. Michael and M. Scott, "Simple, Fast, and Practical
//! Non-Blocking and Blocking Concurrent Queue Algorithms", PODC 1996.
//!
//! The queue is a singly-linked list with atomic `head` and `tail`
//! pointers. `head` always points at a sentinel node whose successor is
//! the logical front of the queue. A push links the new node after the
//! current last node with a single CAS on its `next` field, then swings
//! `tail` forward best-effort; a poll swings `head` one node forward with
//! a single CAS and takes the value out of the node that just became the
//! sentinel. Threads that observe a lagging `tail` help advance it, so
//! some thread always makes progress (lock-free, not wait-free).

use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

struct Node<T> {
    /// Uninitialized in the sentinel, initialized in every queued node.
    /// A winning poll CAS transfers the value out before the node is
    /// reused as the sentinel.
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> Self {
        Self {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        }
    }
}

/// An unbounded lock-free MPMC FIFO queue.
///
/// Any number of threads may [`push`](LockFreeQueue::push) and
/// [`poll`](LockFreeQueue::poll) concurrently through a shared reference.
/// Consumed nodes are reclaimed through epoch-based reclamation, so no
/// thread ever reads freed memory even while another thread is unlinking
/// the node it is looking at.
///
/// # Example
///
/// ```
/// use relay_queue::LockFreeQueue;
///
/// let queue = LockFreeQueue::new();
/// queue.push_all([1, 2, 3]);
///
/// assert_eq!(queue.poll(), Some(1));
/// assert_eq!(queue.poll(), Some(2));
/// assert_eq!(queue.poll(), Some(3));
/// assert_eq!(queue.poll(), None);
/// ```
pub struct LockFreeQueue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
}

// Safety: the queue hands values across threads (push on one, poll on
// another), which requires T: Send. The queue itself synchronizes all
// shared mutation through atomics.
unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> LockFreeQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let queue = Self {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
        };

        // Safety: the queue is not shared yet.
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = Owned::new(Node::sentinel()).into_shared(guard);
            queue.head.store(sentinel, Relaxed);
            queue.tail.store(sentinel, Relaxed);
        }

        queue
    }

    /// Appends `value` at the tail of the queue.
    ///
    /// Never blocks and never fails; contention only causes internal CAS
    /// retries.
    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        self.push_with(value, &guard);
    }

    /// Appends every element of `iter` at the tail, in iteration order.
    ///
    /// Elements pushed by other threads may interleave between them.
    pub fn push_all<I: IntoIterator<Item = T>>(&self, iter: I) {
        let guard = epoch::pin();
        for value in iter {
            self.push_with(value, &guard);
        }
    }

    fn push_with(&self, value: T, guard: &Guard) {
        let mut new = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        });

        loop {
            let tail = self.tail.load(Acquire, guard);
            // Safety: head/tail are never null and the guard keeps the
            // node alive even if another thread unlinks it.
            let t = unsafe { tail.deref() };
            let next = t.next.load(Acquire, guard);

            // Re-read tail: act only on a consistent snapshot.
            if tail != self.tail.load(Acquire, guard) {
                continue;
            }

            if next.is_null() {
                // The link step: exactly one CAS makes the push visible.
                match t.next.compare_exchange(Shared::null(), new, Release, Relaxed, guard) {
                    Ok(linked) => {
                        // Swing tail to the inserted node. Failure means
                        // another thread already helped it forward.
                        let _ = self.tail.compare_exchange(tail, linked, Release, Relaxed, guard);
                        return;
                    }
                    Err(err) => new = err.new,
                }
            } else {
                // Tail was not pointing at the last node; help advance it.
                let _ = self.tail.compare_exchange(tail, next, Release, Relaxed, guard);
            }
        }
    }

    /// Removes and returns the front element, or `None` if the queue is
    /// empty.
    pub fn poll(&self) -> Option<T> {
        let guard = epoch::pin();

        loop {
            let head = self.head.load(Acquire, &guard);
            let tail = self.tail.load(Acquire, &guard);
            // Safety: head is never null; pinned by the guard.
            let h = unsafe { head.deref() };
            let next = h.next.load(Acquire, &guard);

            if head != self.head.load(Acquire, &guard) {
                continue;
            }

            if head == tail {
                if next.is_null() {
                    return None;
                }
                // Tail is falling behind a completed link; help advance it
                // and retry.
                let _ = self.tail.compare_exchange(tail, next, Release, Relaxed, &guard);
            } else {
                // head != tail on a consistent snapshot implies the
                // sentinel has a successor.
                // Safety: non-null, pinned.
                let n = unsafe { next.deref() };
                if self
                    .head
                    .compare_exchange(head, next, Release, Relaxed, &guard)
                    .is_ok()
                {
                    // The winning CAS transfers ownership of the value;
                    // `next` is the sentinel from here on.
                    // Safety: every non-sentinel node holds an initialized
                    // value, and only the CAS winner reads it.
                    let value = unsafe { n.value.assume_init_read() };
                    // Safety: the old sentinel is unreachable for new
                    // operations; free it once all pinned threads moved on.
                    unsafe { guard.defer_destroy(head) };
                    return Some(value);
                }
            }
        }
    }

    /// Returns a reference to the front element without removing it, or
    /// `None` if the queue is empty.
    ///
    /// Takes `&mut self`: with shared access a racing [`poll`] could move
    /// the value out (and drop it) while the reference is alive. The
    /// two-lock queue offers a shared-access `peek` for callers that need
    /// to observe concurrently.
    ///
    /// [`poll`]: LockFreeQueue::poll
    pub fn peek(&mut self) -> Option<&T> {
        // Safety: exclusive access, no concurrent mutation possible.
        unsafe {
            let guard = epoch::unprotected();
            let head = self.head.load(Relaxed, guard);
            let next = head.deref().next.load(Relaxed, guard);
            if next.is_null() {
                None
            } else {
                Some(next.deref().value.assume_init_ref())
            }
        }
    }

    /// Returns `true` if the queue has no elements.
    ///
    /// The answer may be stale by the time it is returned if other threads
    /// are pushing or polling concurrently.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let head = self.head.load(Acquire, &guard);
        // Safety: head is never null; pinned.
        let next = unsafe { head.deref() }.next.load(Acquire, &guard);
        next.is_null()
    }

    /// Removes every element currently in the queue.
    ///
    /// Elements pushed concurrently with `clear` may survive it.
    pub fn clear(&self) {
        while self.poll().is_some() {}
    }
}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LockFreeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeQueue")
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        // Safety: exclusive access; no guard is needed and nodes can be
        // freed immediately.
        unsafe {
            let guard = epoch::unprotected();
            let mut node = self.head.load(Relaxed, guard);
            let mut is_sentinel = true;

            while !node.is_null() {
                let next = node.deref().next.load(Relaxed, guard);
                let mut owned = node.into_owned();
                if !is_sentinel {
                    // Safety: only the sentinel's value slot is vacant.
                    owned.value.assume_init_drop();
                }
                drop(owned);
                is_sentinel = false;
                node = next;
            }
        }
    }
}
