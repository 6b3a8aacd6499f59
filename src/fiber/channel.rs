//! A bounded channel of futures.
//!
//! Unlike a typical MPSC channel, `send`/`receive` never block the calling
//! fiber themselves — each returns a [`Future`] immediately and the channel
//! does its handoff work by pairing queued sends with queued receives under
//! its own lock, exactly the way a producer/consumer queue of promises would
//! in any other promise library. Code that wants the familiar "block until
//! this completes" feel awaits the returned future with
//! [`crate::fiber::await_future`] (or one of [`Sender::send_value`]/
//! [`Receiver::recv_value`], which do exactly that).
//!
//! `send(inner_future)` hands the channel a future representing the item
//! being produced and gets back a future that resolves with the post-push
//! queue length once `inner_future` is actually queued — immediately if
//! there's room, later if backpressured. `receive()` gets back a future that
//! resolves with the *value* of whichever `inner_future` it eventually gets
//! paired with, not with the future itself.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::error::Error;
use crate::future::{Future, Promise};

bitflags! {
    /// Snapshot of what a channel currently permits without blocking or
    /// failing.
    pub struct Flags: u8 {
        /// New sends are accepted (may still queue behind backpressure).
        const CAN_SEND = 0b01;
        /// A `receive` might still be satisfied, now or later.
        const CAN_RECEIVE = 0b10;
    }
}

struct Item<V> {
    inner_future: Future<V>,
    send_promise: Promise<usize>,
}

struct Inner<V> {
    capacity: usize,
    queue: VecDeque<Item<V>>,
    sendq: VecDeque<Item<V>>,
    recvq: VecDeque<Promise<V>>,
    flags: Flags,
    tx_count: usize,
    rx_count: usize,
}

/// Matches made while holding the channel lock, resolved only after it's
/// released — see [`Channel::send`]'s doc note on lock ordering.
struct PairingOutcome<V> {
    deliveries: Vec<(Future<V>, Promise<V>)>,
    promoted: Vec<(Promise<usize>, usize)>,
}

fn pair_step<V: Clone + Send + 'static>(inner: &mut Inner<V>) -> PairingOutcome<V> {
    let mut deliveries = Vec::new();
    let mut promoted = Vec::new();
    // A rendezvous channel (capacity 0) never buffers anything in `queue` —
    // `send` always backpressures straight into `sendq` — so the only way a
    // send and a receive ever meet is matching `sendq` against `recvq`
    // directly.
    if inner.capacity == 0 {
        while !inner.sendq.is_empty() && !inner.recvq.is_empty() {
            let item = inner.sendq.pop_front().unwrap();
            let promise = inner.recvq.pop_front().unwrap();
            crate::trace_ctx!("channel paired rendezvous send with waiting receiver");
            promoted.push((item.send_promise, 0));
            deliveries.push((item.inner_future, promise));
        }
        return PairingOutcome { deliveries, promoted };
    }
    while !inner.queue.is_empty() && !inner.recvq.is_empty() {
        let item = inner.queue.pop_front().unwrap();
        let promise = inner.recvq.pop_front().unwrap();
        crate::trace_ctx!("channel paired queued send with waiting receiver, {} left queued", inner.queue.len());
        deliveries.push((item.inner_future, promise));
        if !inner.sendq.is_empty() && inner.queue.len() < inner.capacity {
            let promoted_item = inner.sendq.pop_front().unwrap();
            let send_promise = promoted_item.send_promise.clone();
            inner.queue.push_back(promoted_item);
            crate::trace_ctx!("channel promoted backpressured send into queue, len {}", inner.queue.len());
            promoted.push((send_promise, inner.queue.len()));
        }
    }
    PairingOutcome { deliveries, promoted }
}

fn run_pairing<V: Clone + Send + 'static>(outcome: PairingOutcome<V>) {
    for (inner_future, promise) in outcome.deliveries {
        Future::chain(&inner_future, &promise.future());
    }
    for (promise, len) in outcome.promoted {
        promise.resolve(len);
    }
}

/// The shared channel object. Most code interacts with a channel through
/// the [`Sender`]/[`Receiver`] handles returned by [`Channel::new`] rather
/// than this type directly.
pub struct Channel<V> {
    inner: Arc<Mutex<Inner<V>>>,
}

impl<V> Clone for Channel<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Channel<V>
where
    V: Clone + Send + 'static,
{
    /// Creates a channel with room for `capacity` queued items and returns
    /// one paired sender and receiver. `0` is a valid rendezvous capacity:
    /// nothing is ever buffered in `queue`, so a send only completes once a
    /// receiver is already waiting to take it directly out of `sendq`.
    pub fn new(capacity: usize) -> (Sender<V>, Receiver<V>) {
        let channel = Self {
            inner: Arc::new(Mutex::new(Inner {
                capacity,
                queue: VecDeque::new(),
                sendq: VecDeque::new(),
                recvq: VecDeque::new(),
                flags: Flags::CAN_SEND | Flags::CAN_RECEIVE,
                tx_count: 1,
                rx_count: 1,
            })),
        };
        (
            Sender {
                channel: channel.clone(),
            },
            Receiver { channel },
        )
    }

    pub fn flags(&self) -> Flags {
        self.inner.lock().unwrap().flags
    }

    pub fn can_send(&self) -> bool {
        self.flags().contains(Flags::CAN_SEND)
    }

    pub fn can_receive(&self) -> bool {
        self.flags().contains(Flags::CAN_RECEIVE)
    }

    /// Number of items currently in `queue` (not counting ones still stuck
    /// in `sendq` behind backpressure).
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity
    }

    /// Hands `inner_future` to the channel. The returned future resolves
    /// with the post-push queue length once `inner_future` is actually
    /// queued, or rejects with [`Error::ChannelClosed`] if sending is
    /// already closed.
    pub fn send(&self, inner_future: Future<V>) -> Future<usize> {
        let send_promise = Promise::new();
        let future = send_promise.future();

        let mut guard = self.inner.lock().unwrap();
        if !guard.flags.contains(Flags::CAN_SEND) {
            drop(guard);
            send_promise.reject(Error::ChannelClosed);
            return future;
        }

        let item = Item {
            inner_future,
            send_promise: send_promise.clone(),
        };
        let immediate_len = if guard.sendq.is_empty() && guard.queue.len() < guard.capacity {
            guard.queue.push_back(item);
            Some(guard.queue.len())
        } else {
            guard.sendq.push_back(item);
            None
        };
        let outcome = pair_step(&mut guard);
        drop(guard);

        // Resolved after releasing the lock, same as everything `pair_step`
        // found, to avoid reentering the channel from inside a listener.
        if let Some(len) = immediate_len {
            send_promise.resolve(len);
        }
        run_pairing(outcome);
        future
    }

    /// Registers interest in the next item. The returned future resolves
    /// with the *value* of whichever `inner_future` this gets paired with,
    /// or rejects with [`Error::ChannelClosed`] if receiving is closed, or
    /// if sending is closed and nothing already queued can ever satisfy it.
    pub fn receive(&self) -> Future<V> {
        let promise = Promise::new();
        let future = promise.future();

        let mut guard = self.inner.lock().unwrap();
        if !guard.flags.contains(Flags::CAN_RECEIVE) {
            drop(guard);
            promise.reject(Error::ChannelClosed);
            return future;
        }
        let starved = !guard.flags.contains(Flags::CAN_SEND)
            && guard.queue.len() + guard.sendq.len() <= guard.recvq.len();
        if starved {
            drop(guard);
            promise.reject(Error::ChannelClosed);
            return future;
        }

        guard.recvq.push_back(promise);
        let outcome = pair_step(&mut guard);
        drop(guard);
        run_pairing(outcome);
        future
    }

    /// Clears `CAN_SEND`, as if no producer could ever send again. Any
    /// `recvq` entries beyond what `queue`/`sendq` can still fulfill are
    /// rejected with [`Error::ChannelClosed`] right away.
    pub fn close_send(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.flags.remove(Flags::CAN_SEND);
        let fulfillable = guard.queue.len() + guard.sendq.len();
        let mut rejected = Vec::new();
        while guard.recvq.len() > fulfillable {
            if let Some(p) = guard.recvq.pop_back() {
                rejected.push(p);
            } else {
                break;
            }
        }
        drop(guard);
        for p in rejected {
            p.reject(Error::ChannelClosed);
        }
    }

    /// Clears `CAN_RECEIVE` and drains `queue`/`sendq`/`recvq`, rejecting
    /// every pending promise with [`Error::ChannelClosed`].
    pub fn close_receive(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.flags.remove(Flags::CAN_RECEIVE);
        let queue = std::mem::take(&mut guard.queue);
        let sendq = std::mem::take(&mut guard.sendq);
        let recvq = std::mem::take(&mut guard.recvq);
        drop(guard);
        for item in queue.into_iter().chain(sendq) {
            // Already resolved for anything that made it into `queue`;
            // `Promise::reject` on an already-terminal future is a no-op.
            item.send_promise.reject(Error::ChannelClosed);
        }
        for p in recvq {
            p.reject(Error::ChannelClosed);
        }
    }
}

/// The write half of a [`Channel`]. Cloning increments the channel's sender
/// count; dropping the last clone calls [`Channel::close_send`].
pub struct Sender<V: Clone + Send + 'static> {
    channel: Channel<V>,
}

impl<V: Clone + Send + 'static> Sender<V> {
    pub fn send(&self, inner_future: Future<V>) -> Future<usize> {
        self.channel.send(inner_future)
    }

    /// Fiber-blocking convenience: wraps `value` as an already-resolved
    /// future, sends it, and awaits the channel's own backpressure future.
    ///
    /// # Panics
    /// Panics if called outside a fiber.
    pub fn send_value(&self, value: V) -> Result<usize, Error> {
        crate::fiber::await_future(&self.send(Future::new_resolved(value)))
    }

    pub fn channel(&self) -> Channel<V> {
        self.channel.clone()
    }
}

impl<V: Clone + Send + 'static> Clone for Sender<V> {
    fn clone(&self) -> Self {
        self.channel.inner.lock().unwrap().tx_count += 1;
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<V: Clone + Send + 'static> Drop for Sender<V> {
    fn drop(&mut self) {
        let last = {
            let mut guard = self.channel.inner.lock().unwrap();
            guard.tx_count -= 1;
            guard.tx_count == 0
        };
        if last {
            self.channel.close_send();
        }
    }
}

/// The read half of a [`Channel`]. Cloning increments the channel's
/// receiver count; dropping the last clone calls [`Channel::close_receive`].
pub struct Receiver<V: Clone + Send + 'static> {
    channel: Channel<V>,
}

impl<V: Clone + Send + 'static> Receiver<V> {
    pub fn receive(&self) -> Future<V> {
        self.channel.receive()
    }

    /// Fiber-blocking convenience: awaits the channel for the next value.
    ///
    /// # Panics
    /// Panics if called outside a fiber.
    pub fn recv_value(&self) -> Result<V, Error> {
        crate::fiber::await_future(&self.receive())
    }

    pub fn channel(&self) -> Channel<V> {
        self.channel.clone()
    }
}

impl<V: Clone + Send + 'static> Clone for Receiver<V> {
    fn clone(&self) -> Self {
        self.channel.inner.lock().unwrap().rx_count += 1;
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<V: Clone + Send + 'static> Drop for Receiver<V> {
    fn drop(&mut self) {
        let last = {
            let mut guard = self.channel.inner.lock().unwrap();
            guard.rx_count -= 1;
            guard.rx_count == 0
        };
        if last {
            self.channel.close_receive();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::{self, Builder, Scheduler};
    use crate::future::Status;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn send_then_recv_preserves_fifo_order() {
        let scheduler = Scheduler::new();
        let (tx, rx) = Channel::new(4);
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen2 = seen.clone();
        Builder::new()
            .spawn_on(&scheduler, move || {
                for i in 0..4 {
                    tx.send_value(i).unwrap();
                }
            })
            .unwrap();
        Builder::new()
            .spawn_on(&scheduler, move || {
                for _ in 0..4 {
                    seen2.lock().unwrap().push(rx.recv_value().unwrap());
                }
            })
            .unwrap();
        scheduler.dispatch();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn channel_fifo_matches_worked_example() {
        // ch = channel_new(2); send f1, f2, f3; resolve f1, f2, f3; receive
        // four times: first three succeed in order, fourth stays pending
        // until close_send, then rejects with CHANNEL_CLOSED.
        let (tx, rx) = Channel::new(2);
        let p1 = Promise::new();
        let p2 = Promise::new();
        let p3 = Promise::new();
        tx.send(p1.future());
        tx.send(p2.future());
        tx.send(p3.future());
        p1.resolve(1);
        p2.resolve(2);
        p3.resolve(3);

        let r1 = rx.receive();
        let r2 = rx.receive();
        let r3 = rx.receive();
        let r4 = rx.receive();
        assert_eq!(r1.value(), Some(1));
        assert_eq!(r2.value(), Some(2));
        assert_eq!(r3.value(), Some(3));
        assert_eq!(r4.status(), Status::Pending);

        tx.channel.close_send();
        assert_eq!(r4.error(), Some(Error::ChannelClosed));
    }

    #[test]
    fn backpressure_matches_worked_example() {
        // ch = channel_new(1); send f1: send_promise1 resolves with 1; send
        // f2: send_promise2 stays pending; receive once: send_promise2
        // resolves with 1.
        let (tx, rx) = Channel::<i32>::new(1);
        let send1 = tx.send(Future::new_resolved(1));
        assert_eq!(send1.value(), Some(1));

        let send2 = tx.send(Future::new_resolved(2));
        assert_eq!(send2.status(), Status::Pending);

        let received = rx.receive();
        assert_eq!(received.value(), Some(1));
        assert_eq!(send2.value(), Some(1));
    }

    #[test]
    fn rendezvous_channel_pairs_send_with_a_waiting_receiver() {
        let scheduler = Scheduler::new();
        let (tx, rx) = Channel::new(0);
        let seen = Arc::new(StdMutex::new(None));
        let seen2 = seen.clone();
        Builder::new()
            .spawn_on(&scheduler, move || {
                *seen2.lock().unwrap() = Some(rx.recv_value());
            })
            .unwrap();
        Builder::new()
            .spawn_on(&scheduler, move || {
                fiber::yield_now();
                tx.send_value(42).unwrap();
            })
            .unwrap();
        scheduler.dispatch();
        assert_eq!(seen.lock().unwrap().take(), Some(Ok(42)));
    }

    #[test]
    fn receive_on_drained_closed_channel_errors() {
        let scheduler = Scheduler::new();
        let (tx, rx) = Channel::new(2);
        tx.send(Future::new_resolved(1));
        drop(tx);
        let result = Arc::new(StdMutex::new(None));
        let result2 = result.clone();
        Builder::new()
            .spawn_on(&scheduler, move || {
                let first = rx.recv_value();
                let second = rx.recv_value();
                *result2.lock().unwrap() = Some((first, second));
            })
            .unwrap();
        scheduler.dispatch();
        let (first, second) = result.lock().unwrap().take().unwrap();
        assert_eq!(first.unwrap(), 1);
        assert!(matches!(second, Err(Error::ChannelClosed)));
    }

    #[test]
    fn send_after_close_send_rejects_immediately() {
        let (tx, rx) = Channel::<i32>::new(1);
        tx.channel().close_send();
        let f = tx.send(Future::new_resolved(1));
        assert_eq!(f.error(), Some(Error::ChannelClosed));
        drop(rx);
    }

    #[test]
    fn flags_reflect_open_and_closed_state() {
        let (tx, rx) = Channel::<i32>::new(1);
        assert!(tx.channel().can_send());
        assert!(tx.channel().can_receive());
        drop(rx);
        assert!(!tx.channel().can_send());
    }
}
