// Copyright 2025 CloudWeGo Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ptr,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicPtr, Ordering},
    },
};

/// How [`QueueConsumer::front`] and [`QueueConsumer::pop`] behave on an empty
/// queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    /// Never blocks. The caller must check [`QueueConsumer::is_empty`] first;
    /// popping an empty queue is a programming error.
    WaitFree,
    /// Busy-loops until an element is available.
    Spin,
    /// Parks on a condition variable; the producer publishes the new tail
    /// under the mutex so a wakeup is never lost.
    Blocking,
}

/// Unbounded linked queue for one producer thread and one consumer thread.
///
/// Guarantees:
/// 1. The live list and the node free list each always contain at least one
///    node (a sentinel head).
/// 2. The queue is empty iff `head == tail`.
/// 3. `head.next` is the front, `tail` is the back.
/// 4. Nodes never move in memory after allocation; elements never move.
/// 5. `head` is read or written only by the consumer; `tail` is written only
///    by the producer but read by both. Symmetric for `free_head`/`free_tail`.
///
/// Popped nodes are recycled through the free list, so a queue that has
/// reached its working depth stops allocating.
pub struct SpscQueue;

impl SpscQueue {
    pub fn split<T>(mode: WaitMode) -> (QueueProducer<T>, QueueConsumer<T>) {
        let head = Node::sentinel();
        let free_head = Node::sentinel();
        let shared = Arc::new(Shared {
            head: UnsafeCell::new(head),
            tail: AtomicPtr::new(head),
            free_head: UnsafeCell::new(free_head),
            free_tail: AtomicPtr::new(free_head),
            mode,
            mux: Mutex::new(()),
            cond: Condvar::new(),
        });
        (
            QueueProducer {
                shared: shared.clone(),
            },
            QueueConsumer { shared },
        )
    }
}

struct Node<T> {
    value: MaybeUninit<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value: MaybeUninit::uninit(),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

struct Shared<T> {
    /// Owned by the consumer. Its node is a sentinel: the payload has already
    /// been moved out (or never existed).
    head: UnsafeCell<*mut Node<T>>,
    tail: AtomicPtr<Node<T>>,
    /// Owned by the producer; same sentinel shape as `head`.
    free_head: UnsafeCell<*mut Node<T>>,
    free_tail: AtomicPtr<Node<T>>,
    mode: WaitMode,
    mux: Mutex<()>,
    cond: Condvar,
}

unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        unsafe {
            // Live list: every node after the sentinel still holds a value.
            let mut node = *self.head.get();
            let mut is_sentinel = true;
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Relaxed);
                let mut boxed = Box::from_raw(node);
                if !is_sentinel {
                    boxed.value.assume_init_drop();
                }
                is_sentinel = false;
                drop(boxed);
                node = next;
            }
            // Free list: payloads were moved out before recycling.
            let mut node = *self.free_head.get();
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Relaxed);
                drop(Box::from_raw(node));
                node = next;
            }
        }
    }
}

pub struct QueueProducer<T> {
    shared: Arc<Shared<T>>,
}

unsafe impl<T: Send> Send for QueueProducer<T> {}

impl<T> QueueProducer<T> {
    /// Appends `value` at the back and publishes it to the consumer.
    pub fn push(&mut self, value: T) {
        let node = match self.detach_free_node() {
            Some(node) => unsafe {
                (*node).value.write(value);
                (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
                node
            },
            None => Box::into_raw(Box::new(Node {
                value: MaybeUninit::new(value),
                next: AtomicPtr::new(ptr::null_mut()),
            })),
        };

        let tail = self.shared.tail.load(Ordering::Relaxed);
        unsafe { (*tail).next.store(node, Ordering::Relaxed) };
        if self.shared.mode == WaitMode::Blocking {
            // The store must still be atomic: is_empty() does not take the
            // lock.
            let guard = self.shared.mux.lock().unwrap();
            self.shared.tail.store(node, Ordering::Release);
            drop(guard);
            self.shared.cond.notify_one();
        } else {
            self.shared.tail.store(node, Ordering::Release);
        }
    }

    /// The element most recently pushed.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the element at the back has not been
    /// popped by the consumer, e.g. by never letting the queue drain below
    /// one element. Otherwise the payload read here may already be gone.
    pub unsafe fn back(&self) -> &T {
        let tail = self.shared.tail.load(Ordering::Relaxed);
        unsafe { (*tail).value.assume_init_ref() }
    }

    fn detach_free_node(&mut self) -> Option<*mut Node<T>> {
        // The free-list sentinel itself is reused; its successor becomes the
        // new sentinel. Pairs with the consumer's release store in pop().
        let free_head = unsafe { *self.shared.free_head.get() };
        if free_head == self.shared.free_tail.load(Ordering::Acquire) {
            return None;
        }
        let next = unsafe { (*free_head).next.load(Ordering::Relaxed) };
        unsafe { *self.shared.free_head.get() = next };
        Some(free_head)
    }
}

pub struct QueueConsumer<T> {
    shared: Arc<Shared<T>>,
}

unsafe impl<T: Send> Send for QueueConsumer<T> {}

impl<T> QueueConsumer<T> {
    #[inline]
    pub fn is_empty(&self) -> bool {
        let head = unsafe { *self.shared.head.get() };
        head == self.shared.tail.load(Ordering::Acquire)
    }

    /// Waits per the queue's [`WaitMode`], then returns the front element
    /// without removing it.
    pub fn front(&mut self) -> &T {
        self.wait_nonempty();
        debug_assert!(!self.is_empty(), "front() on an empty wait-free queue");
        unsafe {
            let head = *self.shared.head.get();
            let next = (*head).next.load(Ordering::Relaxed);
            (*next).value.assume_init_ref()
        }
    }

    /// Waits per the queue's [`WaitMode`], removes the front element and
    /// returns it. The vacated node is recycled onto the free list.
    pub fn pop(&mut self) -> T {
        self.wait_nonempty();
        debug_assert!(!self.is_empty(), "pop() on an empty wait-free queue");

        unsafe {
            let head = *self.shared.head.get();
            let next = (*head).next.load(Ordering::Relaxed);
            let value = (*next).value.assume_init_read();

            // The old sentinel goes to the free list; the popped node becomes
            // the new sentinel.
            (*head).next.store(ptr::null_mut(), Ordering::Relaxed);
            let free_tail = self.shared.free_tail.load(Ordering::Relaxed);
            (*free_tail).next.store(head, Ordering::Relaxed);
            *self.shared.head.get() = next;
            self.shared.free_tail.store(head, Ordering::Release);

            value
        }
    }

    fn wait_nonempty(&self) {
        match self.shared.mode {
            WaitMode::WaitFree => {}
            WaitMode::Spin => {
                while self.is_empty() {
                    std::hint::spin_loop();
                }
            }
            WaitMode::Blocking => {
                if self.is_empty() {
                    let mut guard = self.shared.mux.lock().unwrap();
                    while self.is_empty() {
                        guard = self.shared.cond.wait(guard).unwrap();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, thread, time::Duration};

    use super::{SpscQueue, WaitMode};

    #[test]
    fn test_queue_operate() {
        let (mut tx, mut rx) = SpscQueue::split::<u64>(WaitMode::WaitFree);
        assert!(rx.is_empty());

        for i in 0..1024u64 {
            tx.push(i);
            assert_eq!(i, unsafe { *tx.back() });
        }
        assert!(!rx.is_empty());

        for i in 0..1024u64 {
            assert_eq!(i, *rx.front());
            assert_eq!(i, rx.pop());
        }
        assert!(rx.is_empty());

        // Nodes recycled through the free list keep working.
        for i in 0..1024u64 {
            tx.push(i);
            assert_eq!(i, rx.pop());
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn test_queue_drops_in_flight_elements() {
        let (count_tx, count_rx) = mpsc::channel::<()>();

        struct Witness(mpsc::Sender<()>);
        impl Drop for Witness {
            fn drop(&mut self) {
                self.0.send(()).unwrap();
            }
        }

        let (mut tx, mut rx) = SpscQueue::split(WaitMode::WaitFree);
        for _ in 0..10 {
            tx.push(Witness(count_tx.clone()));
        }
        for _ in 0..4 {
            rx.pop();
        }
        drop(tx);
        drop(rx);
        drop(count_tx);
        assert_eq!(10, count_rx.into_iter().count());
    }

    #[test]
    fn test_queue_spsc_spin() {
        const N: u64 = 200_000;
        let (mut tx, mut rx) = SpscQueue::split::<u64>(WaitMode::Spin);

        let producer = thread::spawn(move || {
            for i in 0..N {
                tx.push(i);
            }
        });
        for i in 0..N {
            assert_eq!(i, rx.pop());
        }
        producer.join().unwrap();
        assert!(rx.is_empty());
    }

    #[test]
    fn test_queue_spsc_blocking() {
        const N: u64 = 100_000;
        let (mut tx, mut rx) = SpscQueue::split::<u64>(WaitMode::Blocking);

        let producer = thread::spawn(move || {
            for i in 0..N {
                tx.push(i);
                if i % 8192 == 0 {
                    // Let the consumer drain so the condvar path is exercised.
                    thread::sleep(Duration::from_micros(50));
                }
            }
        });
        for i in 0..N {
            assert_eq!(i, rx.pop());
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_queue_elements_never_move() {
        let (mut tx, mut rx) = SpscQueue::split::<u64>(WaitMode::WaitFree);
        tx.push(7);
        tx.push(8);
        let first = rx.front() as *const u64;
        tx.push(9);
        for _ in 0..64 {
            tx.push(0);
        }
        assert_eq!(first, rx.front() as *const u64);
        assert_eq!(7, rx.pop());
    }
}
