//! The two-lock unbounded FIFO queue.
//!
//! One mutex guards the head (consumers), a second guards the tail
//! (producers), so a push and a poll never contend with each other. The
//! list keeps a sentinel node: `head` points at it and its successor is
//! the logical front, which means the two critical sections touch
//! disjoint nodes except when the queue is momentarily empty. For that
//! one overlap the node `next` link is an atomic pointer: a producer
//! publishes it with a release store and a consumer inspects it with an
//! acquire load.

use std::fmt;
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::Mutex;

struct Node<T> {
    /// `None` in the sentinel, `Some` in every queued node. A poll takes
    /// the value out of the node that becomes the new sentinel, dropping
    /// payload references promptly.
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn boxed(value: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// An unbounded MPMC FIFO queue with separate head and tail locks.
///
/// Same contract as [`LockFreeQueue`](crate::LockFreeQueue): `push` never
/// blocks on capacity and never fails, `poll`/`peek` report an empty
/// queue with `None`. A producer and a consumer run concurrently; two
/// producers (or two consumers) serialize on their lock.
///
/// Unlike the lock-free variant, `peek` works through a shared reference:
/// the head lock excludes any concurrent `poll` for the duration of the
/// clone.
///
/// # Example
///
/// ```
/// use relay_queue::TwoLockQueue;
///
/// let queue = TwoLockQueue::new();
/// queue.push(1);
/// queue.push(2);
///
/// assert_eq!(queue.peek(), Some(1));
/// assert_eq!(queue.poll(), Some(1));
/// assert_eq!(queue.poll(), Some(2));
/// assert_eq!(queue.poll(), None);
/// ```
pub struct TwoLockQueue<T> {
    /// Points at the sentinel. Guards all consumer-side traversal.
    head: Mutex<*mut Node<T>>,
    /// Points at the last node. Guards all producer-side linking.
    tail: Mutex<*mut Node<T>>,
}

// Safety: the raw node pointers are only dereferenced under the
// respective mutex (or with exclusive access in Drop), and values cross
// threads, hence T: Send.
unsafe impl<T: Send> Send for TwoLockQueue<T> {}
unsafe impl<T: Send> Sync for TwoLockQueue<T> {}

impl<T> TwoLockQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        let sentinel = Node::boxed(None);
        Self {
            head: Mutex::new(sentinel),
            tail: Mutex::new(sentinel),
        }
    }

    /// Appends `value` at the tail of the queue.
    pub fn push(&self, value: T) {
        let node = Node::boxed(Some(value));
        let mut tail = self.tail.lock().unwrap();

        // Safety: tail is a valid node and we hold the tail lock, so no
        // other producer is linking concurrently.
        unsafe { (**tail).next.store(node, Release) };
        *tail = node;
    }

    /// Appends every element of `iter` at the tail, in order, taking the
    /// tail lock once for the whole batch.
    ///
    /// The batch is linked atomically with respect to other producers: no
    /// foreign element lands between two elements of `iter`.
    pub fn push_all<I: IntoIterator<Item = T>>(&self, iter: I) {
        // Build the chain outside the critical section.
        let mut first: *mut Node<T> = ptr::null_mut();
        let mut last: *mut Node<T> = ptr::null_mut();
        for value in iter {
            let node = Node::boxed(Some(value));
            if first.is_null() {
                first = node;
            } else {
                // Safety: last is a node we just allocated; unshared.
                unsafe { (*last).next.store(node, Relaxed) };
            }
            last = node;
        }
        if first.is_null() {
            return;
        }

        let mut tail = self.tail.lock().unwrap();
        // Safety: as in push; the release store publishes the whole chain.
        unsafe { (**tail).next.store(first, Release) };
        *tail = last;
    }

    /// Removes and returns the front element, or `None` if the queue is
    /// empty.
    pub fn poll(&self) -> Option<T> {
        let mut head = self.head.lock().unwrap();
        let sentinel = *head;

        // Safety: sentinel is valid; the acquire load pairs with the
        // producer's release store of the same link.
        let first = unsafe { (*sentinel).next.load(Acquire) };
        if first.is_null() {
            return None;
        }

        // Safety: first was published by a completed push and the head
        // lock keeps other consumers out; taking the value clears the new
        // sentinel's payload.
        let value = unsafe { (*first).value.take() };
        *head = first;
        drop(head);

        // Safety: the old sentinel is no longer reachable from either end.
        unsafe { drop(Box::from_raw(sentinel)) };
        value
    }

    /// Returns a clone of the front element without removing it, or
    /// `None` if the queue is empty.
    ///
    /// Sound under concurrency: the head lock excludes any `poll` while
    /// the value is being cloned.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let head = self.head.lock().unwrap();

        // Safety: as in poll.
        let first = unsafe { (**head).next.load(Acquire) };
        if first.is_null() {
            return None;
        }

        // Safety: first holds an initialized value until a poll consumes
        // it, and polls are excluded by the head lock.
        unsafe { (*first).value.clone() }
    }

    /// Returns `true` if the queue has no elements.
    pub fn is_empty(&self) -> bool {
        let head = self.head.lock().unwrap();
        // Safety: as in poll.
        unsafe { (**head).next.load(Acquire).is_null() }
    }

    /// Removes every element and resets the queue to a fresh sentinel.
    ///
    /// Takes the tail lock and then the head lock, in that fixed order,
    /// so it cannot deadlock against any other lock user.
    pub fn clear(&self) {
        let mut tail = self.tail.lock().unwrap();
        let mut head = self.head.lock().unwrap();

        let old = *head;
        let fresh = Node::boxed(None);
        *head = fresh;
        *tail = fresh;
        drop(head);
        drop(tail);

        // Safety: both locks released; the old chain is unreachable and
        // exclusively ours.
        unsafe { free_chain(old) };
    }
}

/// Frees a detached node chain, dropping any stored values.
///
/// # Safety
///
/// `node` and its successors must be unreachable from any queue.
unsafe fn free_chain<T>(mut node: *mut Node<T>) {
    while !node.is_null() {
        let boxed = Box::from_raw(node);
        node = boxed.next.load(Relaxed);
    }
}

impl<T> Default for TwoLockQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TwoLockQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoLockQueue")
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for TwoLockQueue<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut().unwrap();
        // Safety: exclusive access; the whole chain is ours.
        unsafe { free_chain(head) };
    }
}
