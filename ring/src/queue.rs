// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The ring queue proper.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::waiter::Waiter;

/// Largest supported capacity, matching the largest receive ring any
/// supported NIC exposes with room to spare.
const MAX_CAPACITY: usize = 1 << 20;

/// Slot holds no queued value.  On an exchange queue the cell still holds
/// the current placeholder.
const EMPTY: u8 = 0;
/// Slot is claimed by exactly one thread which is moving a value in or out.
const BUSY: u8 = 1;
/// Slot holds a queued value.
const FULL: u8 = 2;

struct Slot<T> {
    tag: AtomicU8,
    cell: UnsafeCell<Option<T>>,
}

impl<T> Slot<T> {
    fn new(fill: Option<T>) -> Self {
        Self {
            tag: AtomicU8::new(EMPTY),
            cell: UnsafeCell::new(fill),
        }
    }
}

struct Half {
    cursor: AtomicUsize,
    /// Serializes the multi-producer (or multi-consumer) variants.  Never
    /// touched by the single-side operations.
    lock: Mutex<()>,
    waiter: Waiter,
}

impl Half {
    fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            lock: Mutex::new(()),
            waiter: Waiter::new(),
        }
    }
}

/// A fixed-capacity ring queue.  See the crate docs for the variant matrix.
///
/// Capacity is rounded up to the next power of two so the cursors can be
/// masked instead of taken modulo.
pub struct Queue<T> {
    mask: usize,
    exchange: bool,
    producer: CachePadded<Half>,
    consumer: CachePadded<Half>,
    slots: Box<[Slot<T>]>,
}

// SAFETY: slots are handed between threads through the tag protocol; a cell
// is only touched by the thread that won the EMPTY/FULL -> BUSY claim.
unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

fn round_capacity(requested: usize) -> usize {
    assert!(
        requested <= MAX_CAPACITY,
        "queue capacity {requested} exceeds {MAX_CAPACITY}"
    );
    requested.next_power_of_two().max(1)
}

impl<T> Queue<T> {
    /// Create a queue with at least `capacity` slots, all empty.
    pub fn new(capacity: usize) -> Self {
        let n = round_capacity(capacity);
        let slots = (0..n).map(|_| Slot::new(None)).collect();
        Self {
            mask: n - 1,
            exchange: false,
            producer: CachePadded::new(Half::new()),
            consumer: CachePadded::new(Half::new()),
            slots,
        }
    }

    /// Create an exchange queue with at least `capacity` slots, every slot
    /// pre-filled with a placeholder produced by `fill`.
    pub fn with_placeholders(capacity: usize, mut fill: impl FnMut() -> T) -> Self {
        let n = round_capacity(capacity);
        let slots = (0..n).map(|_| Slot::new(Some(fill()))).collect();
        Self {
            mask: n - 1,
            exchange: true,
            producer: CachePadded::new(Half::new()),
            consumer: CachePadded::new(Half::new()),
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// True when the slot under the consumer cursor holds a value.  Only
    /// meaningful to the (sole) consumer; used as a waiter predicate.
    pub fn has_ready(&self) -> bool {
        let at = self.consumer.cursor.load(Ordering::Relaxed);
        self.slots[at & self.mask].tag.load(Ordering::SeqCst) == FULL
    }

    /// True when the slot under the producer cursor is free.  Only
    /// meaningful to the (sole) producer; used as a waiter predicate.
    pub fn has_room(&self) -> bool {
        let at = self.producer.cursor.load(Ordering::Relaxed);
        self.slots[at & self.mask].tag.load(Ordering::SeqCst) == EMPTY
    }

    /// The consumer half's sleep/wake primitive.  Producers kick this after
    /// pushing when a consumer may be parked.
    pub fn consumer_waiter(&self) -> &Waiter {
        &self.consumer.waiter
    }

    /// The producer half's sleep/wake primitive.
    pub fn producer_waiter(&self) -> &Waiter {
        &self.producer.waiter
    }

    /// Non-blocking single-producer push.  On a full queue the value is
    /// handed back and any parked consumer is woken so it can drain.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        debug_assert!(!self.exchange);
        let at = self.producer.cursor.load(Ordering::Relaxed);
        let slot = &self.slots[at & self.mask];
        match slot
            .tag
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                // SAFETY: the BUSY claim grants exclusive access to the cell.
                unsafe { *slot.cell.get() = Some(value) };
                slot.tag.store(FULL, Ordering::SeqCst);
                self.producer.cursor.store(at.wrapping_add(1), Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                self.consumer.waiter.kick();
                Err(value)
            }
        }
    }

    /// Blocking single-producer push: parks on the producer waiter until the
    /// slot frees.
    pub fn push(&self, value: T) {
        let mut value = value;
        loop {
            match self.try_push(value) {
                Ok(()) => return,
                Err(back) => {
                    value = back;
                    self.producer.waiter.wait_until(|| self.has_room());
                }
            }
        }
    }

    /// Non-blocking multi-producer push.
    pub fn try_push_mp(&self, value: T) -> Result<(), T> {
        let _serial = self.producer.lock.lock();
        self.try_push(value)
    }

    /// Blocking multi-producer push.  The producer lock is held for the
    /// duration, so contending producers queue up behind the sleeper.
    pub fn push_mp(&self, value: T) {
        let _serial = self.producer.lock.lock();
        self.push(value);
    }

    /// Non-blocking single-consumer pop.  On an empty queue any parked
    /// producer is woken, since there is certainly room now.
    pub fn try_pop(&self) -> Option<T> {
        debug_assert!(!self.exchange);
        let at = self.consumer.cursor.load(Ordering::Relaxed);
        let slot = &self.slots[at & self.mask];
        match slot
            .tag
            .compare_exchange(FULL, BUSY, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                // SAFETY: the BUSY claim grants exclusive access to the cell.
                let value = unsafe { (*slot.cell.get()).take() };
                slot.tag.store(EMPTY, Ordering::SeqCst);
                self.consumer.cursor.store(at.wrapping_add(1), Ordering::Relaxed);
                value
            }
            Err(_) => {
                self.producer.waiter.kick();
                None
            }
        }
    }

    /// Blocking single-consumer pop.
    pub fn pop(&self) -> T {
        loop {
            if let Some(value) = self.try_pop() {
                return value;
            }
            self.consumer.waiter.wait_until(|| self.has_ready());
        }
    }

    /// Non-blocking multi-consumer pop.
    pub fn try_pop_mc(&self) -> Option<T> {
        let _serial = self.consumer.lock.lock();
        self.try_pop()
    }

    /// Blocking multi-consumer pop.
    pub fn pop_mc(&self) -> T {
        let _serial = self.consumer.lock.lock();
        self.pop()
    }

    /// Non-blocking single-producer exchange put: stores `value` and hands
    /// back the placeholder it displaced.  On a full queue the value is
    /// returned and any parked consumer woken.
    pub fn try_exchange_push(&self, value: T) -> Result<T, T> {
        debug_assert!(self.exchange);
        let at = self.producer.cursor.load(Ordering::Relaxed);
        let slot = &self.slots[at & self.mask];
        match slot
            .tag
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                // SAFETY: the BUSY claim grants exclusive access to the cell.
                let previous = unsafe { (*slot.cell.get()).replace(value) };
                slot.tag.store(FULL, Ordering::SeqCst);
                self.producer.cursor.store(at.wrapping_add(1), Ordering::Relaxed);
                match previous {
                    Some(placeholder) => Ok(placeholder),
                    None => unreachable!("exchange slot lost its placeholder"),
                }
            }
            Err(_) => {
                self.consumer.waiter.kick();
                Err(value)
            }
        }
    }

    /// Blocking single-producer exchange put.
    pub fn exchange_push(&self, value: T) -> T {
        let mut value = value;
        loop {
            match self.try_exchange_push(value) {
                Ok(placeholder) => return placeholder,
                Err(back) => {
                    value = back;
                    self.producer.waiter.wait_until(|| self.has_room());
                }
            }
        }
    }

    /// Non-blocking multi-producer exchange put.
    pub fn try_exchange_push_mp(&self, value: T) -> Result<T, T> {
        let _serial = self.producer.lock.lock();
        self.try_exchange_push(value)
    }

    /// Blocking multi-producer exchange put.
    pub fn exchange_push_mp(&self, value: T) -> T {
        let _serial = self.producer.lock.lock();
        self.exchange_push(value)
    }

    /// Non-blocking single-consumer exchange get: takes the queued value and
    /// installs `replacement` as the slot's new placeholder.  On an empty
    /// queue the replacement is handed back and any parked producer woken.
    pub fn try_exchange_pop(&self, replacement: T) -> Result<T, T> {
        debug_assert!(self.exchange);
        let at = self.consumer.cursor.load(Ordering::Relaxed);
        let slot = &self.slots[at & self.mask];
        match slot
            .tag
            .compare_exchange(FULL, BUSY, Ordering::Acquire, Ordering::Relaxed)
        {
            Ok(_) => {
                // SAFETY: the BUSY claim grants exclusive access to the cell.
                let value = unsafe { (*slot.cell.get()).replace(replacement) };
                slot.tag.store(EMPTY, Ordering::SeqCst);
                self.consumer.cursor.store(at.wrapping_add(1), Ordering::Relaxed);
                match value {
                    Some(value) => Ok(value),
                    None => unreachable!("exchange slot lost its placeholder"),
                }
            }
            Err(_) => {
                self.producer.waiter.kick();
                Err(replacement)
            }
        }
    }

    /// Blocking single-consumer exchange get.
    pub fn exchange_pop(&self, replacement: T) -> T {
        let mut replacement = replacement;
        loop {
            match self.try_exchange_pop(replacement) {
                Ok(value) => return value,
                Err(back) => {
                    replacement = back;
                    self.consumer.waiter.wait_until(|| self.has_ready());
                }
            }
        }
    }

    /// Non-blocking multi-consumer exchange get.
    pub fn try_exchange_pop_mc(&self, replacement: T) -> Result<T, T> {
        let _serial = self.consumer.lock.lock();
        self.try_exchange_pop(replacement)
    }

    /// Blocking multi-consumer exchange get.
    pub fn exchange_pop_mc(&self, replacement: T) -> T {
        let _serial = self.consumer.lock.lock();
        self.exchange_pop(replacement)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn capacity_rounds_to_power_of_two() {
        assert_eq!(Queue::<u32>::new(0).capacity(), 1);
        assert_eq!(Queue::<u32>::new(5).capacity(), 8);
        assert_eq!(Queue::<u32>::new(8).capacity(), 8);
        assert_eq!(Queue::<u32>::new(513).capacity(), 1024);
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let q = Queue::<u32>::new(4);
        assert_eq!(q.try_pop(), None);
        assert_eq!(q.try_pop_mc(), None);
    }

    #[test]
    fn push_on_full_hands_value_back() {
        let q = Queue::new(2);
        q.try_push(1u32).unwrap();
        q.try_push(2).unwrap();
        assert_eq!(q.try_push(3), Err(3));
        assert_eq!(q.try_push_mp(4), Err(4));
    }

    #[test]
    fn fifo_order_and_bounded_residency() {
        // Exercise every cursor wrap point of a small ring: at no moment are
        // more than `capacity` items resident, and values always come out in
        // push order.
        let q = Queue::new(4);
        let cap = q.capacity();
        let mut next_in = 0u32;
        let mut next_out = 0u32;
        for round in 0..100 {
            let fill = (round % (cap + 1)).min(cap);
            for _ in 0..fill {
                q.try_push(next_in).unwrap();
                next_in += 1;
            }
            assert!(next_in - next_out <= cap as u32);
            for _ in 0..fill {
                assert_eq!(q.try_pop(), Some(next_out));
                next_out += 1;
            }
            assert_eq!(q.try_pop(), None);
        }
    }

    #[test]
    fn exchange_round_trip_returns_placeholder() {
        let mut seed = 0u32;
        let q = Queue::with_placeholders(2, || {
            seed += 100;
            seed
        });
        // First put displaces the first placeholder.
        assert_eq!(q.try_exchange_push(1), Ok(100));
        assert_eq!(q.try_exchange_push(2), Ok(200));
        // Full: the value comes straight back.
        assert_eq!(q.try_exchange_push(3), Err(3));
        // Gets take the queued values and install fresh placeholders.
        assert_eq!(q.try_exchange_pop(777), Ok(1));
        assert_eq!(q.try_exchange_pop(888), Ok(2));
        assert_eq!(q.try_exchange_pop(999), Err(999));
        // The installed placeholders come back out on the next puts.
        assert_eq!(q.try_exchange_push(4), Ok(777));
        assert_eq!(q.try_exchange_push_mp(5), Ok(888));
    }

    #[test]
    fn spsc_threads_preserve_order() {
        let q = Arc::new(Queue::new(8));
        const N: u64 = 100_000;

        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || {
                for i in 0..N {
                    let mut v = i;
                    loop {
                        match q.try_push(v) {
                            Ok(()) => break,
                            Err(back) => {
                                v = back;
                                std::hint::spin_loop();
                            }
                        }
                    }
                }
            })
        };

        let mut expected = 0;
        while expected < N {
            if let Some(v) = q.try_pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn mp_mc_threads_lose_nothing() {
        let q = Arc::new(Queue::new(16));
        const PER_THREAD: u64 = 20_000;
        const THREADS: u64 = 4;

        let producers: Vec<_> = (0..THREADS)
            .map(|t| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        q.push_mp(t * PER_THREAD + i);
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let mut sum = 0u64;
                    let mut taken = 0u64;
                    // Each consumer takes exactly half of the total.
                    while taken < THREADS * PER_THREAD / 2 {
                        if let Some(v) = q.try_pop_mc() {
                            sum += v;
                            taken += 1;
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                    sum
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        let total: u64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        let n = THREADS * PER_THREAD;
        assert_eq!(total, n * (n - 1) / 2);
    }

    #[test]
    fn blocking_pop_wakes_on_kick() {
        let q = Arc::new(Queue::new(2));
        let consumer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.pop())
        };
        std::thread::sleep(Duration::from_millis(20));
        q.try_push(42u32).unwrap();
        q.consumer_waiter().kick();
        assert_eq!(consumer.join().unwrap(), 42);
    }

    #[test]
    fn blocking_push_waits_for_room() {
        let q = Arc::new(Queue::new(1));
        q.try_push(1u32).unwrap();
        let producer = {
            let q = Arc::clone(&q);
            std::thread::spawn(move || q.push(2))
        };
        std::thread::sleep(Duration::from_millis(20));
        // Popping to empty wakes the parked producer.
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), None);
        producer.join().unwrap();
        assert_eq!(q.try_pop(), Some(2));
    }

    #[test]
    fn values_in_dropped_queue_are_dropped() {
        let counter = Arc::new(());
        let q = Queue::new(4);
        q.try_push(Arc::clone(&counter)).unwrap();
        q.try_push(Arc::clone(&counter)).unwrap();
        assert_eq!(Arc::strong_count(&counter), 3);
        drop(q);
        assert_eq!(Arc::strong_count(&counter), 1);
    }
}
