//! An unbounded MPMC channel assembled from bounded parts.
//!
//! [`UnboundedChannel`] composes two bounded channels and a growable ring
//! buffer, run by one dedicated pump thread:
//!
//! ```text
//! producers ──> [ in ] ──> pump ──────────────> [ out ] ──> consumers
//!                            │                     ▲
//!                            │ out full            │ out has room
//!                            ▼                     │
//!                        RingBuffer ───────────────┘
//! ```
//!
//! The pump continuously drains `in`. While consumers keep up, values are
//! relayed straight into `out` and the ring buffer stays empty, with
//! no allocation beyond the two fixed channels. When consumers fall behind
//! and `out` fills up, the pump absorbs the overflow into the ring
//! buffer and then races two operations: sending the buffer head into
//! `out` and receiving more input from `in`. Producers therefore only
//! ever block for the brief window in which `in` is full *and* the pump
//! has not yet drained it: a transient backpressure hiccup, not a
//! logical bound.
//!
//! # Consistency
//!
//! [`poll`](UnboundedChannel::poll) is non-blocking and only sees what
//! has already been relayed into `out`. An element that is still inside
//! the pump or the ring buffer makes [`len`](UnboundedChannel::len)
//! non-zero while `poll` momentarily returns `None`. This relaxed
//! consistency is intentional; tightening it would put a lock on the
//! hot relay path.
//!
//! # Shutdown
//!
//! [`close`](UnboundedChannel::close) closes the producer side. The pump
//! then drains everything left in the ring buffer into `out` and closes
//! it, so consumers can keep polling until the backlog is fully served.
//! Dropping the channel closes both sides; the pump notices and exits on
//! its own.
//!
//! # Example
//!
//! ```
//! use relay_channel::UnboundedChannel;
//!
//! let chan = UnboundedChannel::new(4);
//! chan.push_all(0..100u32);
//! chan.close();
//!
//! let mut received = Vec::new();
//! while received.len() < 100 {
//!     if let Some(v) = chan.poll() {
//!         received.push(v);
//!     }
//! }
//! assert_eq!(received, (0..100).collect::<Vec<u32>>());
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Select, Sender, TrySendError};
use relay_ring::RingBuffer;

/// An unbounded FIFO hand-off queue backed by a pump thread.
///
/// Producers call [`push`](Self::push) (blocking only through a transient
/// backpressure window), consumers call [`poll`](Self::poll)
/// (non-blocking). Any number of threads may do either concurrently.
pub struct UnboundedChannel<T> {
    /// Producer side of `in`. Taken (dropped) by `close`.
    in_tx: Mutex<Option<Sender<T>>>,
    /// Consumer side of `out`.
    out_rx: Receiver<T>,
    /// Holds an element pulled out of `out` by `peek` until a `poll`
    /// consumes it. Also serializes consumers, keeping poll order stable.
    staged: Mutex<Option<T>>,
    /// Ring buffer occupancy, maintained by the pump.
    buffered: Arc<AtomicUsize>,
}

impl<T: Send + 'static> UnboundedChannel<T> {
    /// Creates the channel and starts its pump thread.
    ///
    /// `capacity` sizes each of the two internal bounded channels
    /// (minimum 1). It bounds hand-off batching, not the channel: any
    /// number of elements can be in flight, the overflow parks in the
    /// ring buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (in_tx, in_rx) = bounded(capacity);
        let (out_tx, out_rx) = bounded(capacity);
        let buffered = Arc::new(AtomicUsize::new(0));

        let pump = Pump {
            in_rx,
            out_tx,
            buffer: RingBuffer::new(),
            buffered: Arc::clone(&buffered),
        };
        thread::Builder::new()
            .name("relay-channel-pump".into())
            .spawn(move || pump.run())
            .expect("failed to spawn channel pump thread");

        Self {
            in_tx: Mutex::new(Some(in_tx)),
            out_rx,
            staged: Mutex::new(None),
            buffered,
        }
    }

    /// Sends `value` into the channel.
    ///
    /// Blocks only while the `in` channel is full and not yet drained by
    /// the pump; the pump guarantees that window is transient.
    ///
    /// # Panics
    ///
    /// Panics if the channel has been [`close`](Self::close)d.
    pub fn push(&self, value: T) {
        let tx = self.producer().expect("push on closed UnboundedChannel");
        // The pump holds the receiving side for as long as this channel
        // (and thus our sender clone) is alive.
        tx.send(value).expect("channel pump terminated");
    }

    /// Sends every element of `iter`, in order.
    ///
    /// # Panics
    ///
    /// Panics if the channel has been [`close`](Self::close)d.
    pub fn push_all<I: IntoIterator<Item = T>>(&self, iter: I) {
        let tx = self.producer().expect("push on closed UnboundedChannel");
        for value in iter {
            tx.send(value).expect("channel pump terminated");
        }
    }

    /// Removes and returns the front relayed element, or `None` if
    /// nothing is ready.
    ///
    /// Never blocks. `None` does not mean the channel is logically empty:
    /// elements may still be in flight through the pump (see
    /// [`len`](Self::len)).
    pub fn poll(&self) -> Option<T> {
        let mut staged = self.staged.lock().unwrap();
        if let Some(value) = staged.take() {
            return Some(value);
        }
        self.out_rx.try_recv().ok()
    }

    /// Returns a clone of the front relayed element without removing it,
    /// or `None` if nothing is ready.
    ///
    /// The element is parked in an internal staging slot; the next `poll`
    /// returns it first, preserving FIFO order.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let mut staged = self.staged.lock().unwrap();
        if staged.is_none() {
            *staged = self.out_rx.try_recv().ok();
        }
        staged.clone()
    }

    /// Returns the number of elements currently observable: ring-buffer
    /// backlog plus elements already relayed into `out` (plus a peeked
    /// element, if any).
    ///
    /// The count lags the pump by at most its one in-flight element.
    #[must_use]
    pub fn len(&self) -> usize {
        let staged = usize::from(self.staged.lock().unwrap().is_some());
        self.buffered.load(Ordering::Acquire) + self.out_rx.len() + staged
    }

    /// Returns the number of elements parked in the ring buffer, i.e. the
    /// backlog that built up while consumers were behind.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Returns `true` if no element is currently observable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards every element currently retrievable.
    ///
    /// Elements still in flight through the pump may become retrievable
    /// right after `clear` returns.
    pub fn clear(&self) {
        while self.poll().is_some() {}
    }

    /// Closes the producer side. Idempotent.
    ///
    /// The pump drains the remaining backlog into `out` and then closes
    /// it; consumers keep receiving until everything has been served.
    pub fn close(&self) {
        self.in_tx.lock().unwrap().take();
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.in_tx.lock().unwrap().is_none()
    }

    /// Clones the producer out of the slot so a blocking send does not
    /// hold the lock. A clone taken before `close` keeps `in` open until
    /// that send completes.
    fn producer(&self) -> Option<Sender<T>> {
        self.in_tx.lock().unwrap().clone()
    }
}

impl<T> Drop for UnboundedChannel<T> {
    fn drop(&mut self) {
        // Close the producer side; `out_rx` drops right after, and the
        // pump exits once it observes both.
        self.in_tx.get_mut().unwrap().take();
    }
}

// ============================================================================
// Pump
// ============================================================================

/// Why the relay loop ended.
enum PumpExit {
    /// `in` closed: drain the backlog, then close `out`.
    InClosed,
    /// `out` disconnected: all consumers are gone, nothing left to serve.
    OutClosed,
}

/// The single thread that moves elements from `in` to `out`, spilling
/// into the ring buffer whenever `out` is full.
struct Pump<T> {
    in_rx: Receiver<T>,
    out_tx: Sender<T>,
    buffer: RingBuffer<T>,
    buffered: Arc<AtomicUsize>,
}

impl<T> Pump<T> {
    fn run(mut self) {
        match self.relay() {
            PumpExit::InClosed => self.drain(),
            PumpExit::OutClosed => {}
        }
    }

    fn relay(&mut self) -> PumpExit {
        loop {
            let Ok(value) = self.in_rx.recv() else {
                return PumpExit::InClosed;
            };

            // Fast path: consumers are keeping up and the backlog is
            // empty, so the element goes straight to `out`.
            match self.out_tx.try_send(value) {
                Ok(()) => continue,
                Err(TrySendError::Disconnected(_)) => return PumpExit::OutClosed,
                Err(TrySendError::Full(value)) => self.stash(value),
            }

            if let Some(exit) = self.relay_backlog() {
                return exit;
            }
        }
    }

    /// Backlog mode: race relaying the buffer head into `out` against
    /// absorbing new input, so producers never wait on slow consumers.
    fn relay_backlog(&mut self) -> Option<PumpExit> {
        let mut sel = Select::new();
        let send_out = sel.send(&self.out_tx);
        let recv_in = sel.recv(&self.in_rx);

        while !self.buffer.is_empty() {
            let oper = sel.select();
            let index = oper.index();

            if index == send_out {
                // The send slot is ours; hand over the buffer head.
                let value = self.buffer.must_poll();
                self.buffered.store(self.buffer.len(), Ordering::Release);
                if oper.send(&self.out_tx, value).is_err() {
                    return Some(PumpExit::OutClosed);
                }
            } else {
                debug_assert_eq!(index, recv_in);
                match oper.recv(&self.in_rx) {
                    Ok(value) => {
                        self.buffer.push(value);
                        self.buffered.store(self.buffer.len(), Ordering::Release);
                    }
                    Err(_) => return Some(PumpExit::InClosed),
                }
            }
        }

        None
    }

    /// After `in` closed: push the remaining backlog into `out`, blocking
    /// sends are fine since no producer exists anymore. Dropping `out_tx`
    /// afterwards is what closes `out`.
    fn drain(mut self) {
        while let Some(value) = self.buffer.poll() {
            self.buffered.store(self.buffer.len(), Ordering::Release);
            if self.out_tx.send(value).is_err() {
                return;
            }
        }
    }

    fn stash(&mut self, value: T) {
        self.buffer.push(value);
        self.buffered.store(self.buffer.len(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    /// Spins until `cond` holds, failing the test after a generous
    /// deadline. The pump runs on its own thread, so observable state
    /// changes are eventual.
    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::yield_now();
        }
    }

    fn poll_next<T: Send + 'static>(chan: &UnboundedChannel<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(v) = chan.poll() {
                return v;
            }
            assert!(Instant::now() < deadline, "element not relayed in time");
            thread::yield_now();
        }
    }

    // ============================================================================
    // Relay and FIFO
    // ============================================================================

    #[test]
    fn relays_in_order() {
        let chan = UnboundedChannel::new(4);
        chan.push_all(0..10u32);

        for i in 0..10 {
            assert_eq!(poll_next(&chan), i);
        }
        assert_eq!(chan.poll(), None);
    }

    #[test]
    fn poll_is_nonblocking() {
        let chan = UnboundedChannel::<u32>::new(4);
        let started = Instant::now();
        assert_eq!(chan.poll(), None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn backlog_absorption() {
        // `out` holds 2; push far more without any consumer. Producers
        // must not block, and everything must come back out in order.
        let chan = UnboundedChannel::new(2);
        for i in 0..1000u32 {
            chan.push(i);
        }

        for i in 0..1000 {
            assert_eq!(poll_next(&chan), i);
        }
        assert_eq!(chan.poll(), None);
    }

    #[test]
    fn backlog_engages_ring_buffer() {
        let chan = UnboundedChannel::new(2);
        chan.push_all(0..100u32);

        // Everything past the two bounded channels parks in the buffer.
        wait_until(|| chan.buffered_len() > 0);
        wait_until(|| chan.len() == 100);

        // A single clear can observe a transiently empty `out` while the
        // pump is still relaying backlog, so clear until it sticks.
        wait_until(|| {
            chan.clear();
            chan.is_empty() && chan.buffered_len() == 0
        });
    }

    #[test]
    fn concurrent_producers_no_loss() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 10_000;

        let chan = Arc::new(UnboundedChannel::new(8));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let chan = Arc::clone(&chan);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        chan.push(p * PER_PRODUCER + i);
                    }
                })
            })
            .collect();

        let consumer = {
            let chan = Arc::clone(&chan);
            thread::spawn(move || {
                let mut seen = vec![false; (PRODUCERS * PER_PRODUCER) as usize];
                for _ in 0..PRODUCERS * PER_PRODUCER {
                    let v = poll_next(&chan);
                    assert!(!seen[v as usize], "value {v} received twice");
                    seen[v as usize] = true;
                }
                seen
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        let seen = consumer.join().unwrap();
        assert!(seen.iter().all(|&s| s), "values lost in transit");
    }

    // ============================================================================
    // Peek and Staging
    // ============================================================================

    #[test]
    fn peek_preserves_poll_order() {
        let chan = UnboundedChannel::new(4);
        chan.push_all([1, 2, 3]);

        wait_until(|| chan.peek().is_some());
        assert_eq!(chan.peek(), Some(1));
        assert_eq!(chan.peek(), Some(1));

        // The peeked element is served first.
        assert_eq!(chan.poll(), Some(1));
        assert_eq!(poll_next(&chan), 2);
        assert_eq!(poll_next(&chan), 3);
    }

    #[test]
    fn len_counts_staged_element() {
        let chan = UnboundedChannel::new(4);
        chan.push(42u32);

        wait_until(|| chan.peek().is_some());
        assert_eq!(chan.len(), 1);
        assert_eq!(chan.poll(), Some(42));
        assert_eq!(chan.len(), 0);
    }

    // ============================================================================
    // Close Semantics
    // ============================================================================

    #[test]
    fn close_drains_backlog_to_consumers() {
        let chan = UnboundedChannel::new(2);
        chan.push_all(0..500u32);
        chan.close();
        assert!(chan.is_closed());

        for i in 0..500 {
            assert_eq!(poll_next(&chan), i);
        }

        // Fully drained and closed: poll stays empty for good.
        wait_until(|| chan.len() == 0);
        assert_eq!(chan.poll(), None);
        assert_eq!(chan.poll(), None);
    }

    #[test]
    fn close_is_idempotent() {
        let chan = UnboundedChannel::<u32>::new(4);
        chan.close();
        chan.close();
        assert!(chan.is_closed());
    }

    #[test]
    #[should_panic(expected = "closed UnboundedChannel")]
    fn push_after_close_panics() {
        let chan = UnboundedChannel::new(4);
        chan.close();
        chan.push(1u32);
    }

    #[test]
    fn drop_terminates_pump() {
        // Leave a backlog behind; dropping must not hang even though the
        // pump still holds buffered elements.
        let chan = UnboundedChannel::new(1);
        chan.push_all(0..100u32);
        drop(chan);
    }

    // ============================================================================
    // Drop Behavior
    // ============================================================================

    #[test]
    fn undelivered_values_are_released() {
        use std::sync::atomic::AtomicUsize;

        static DROP_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct DropCounter;
        impl Drop for DropCounter {
            fn drop(&mut self) {
                DROP_COUNT.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROP_COUNT.store(0, Ordering::SeqCst);

        let chan = UnboundedChannel::new(1);
        for _ in 0..50 {
            chan.push(DropCounter);
        }
        drop(chan.poll());
        drop(chan);

        // The pump exits on its own once both sides disconnect; give it
        // a moment to drop its buffer.
        let deadline = Instant::now() + Duration::from_secs(5);
        while DROP_COUNT.load(Ordering::SeqCst) < 50 {
            assert!(Instant::now() < deadline, "pump leaked values");
            thread::yield_now();
        }
    }
}
