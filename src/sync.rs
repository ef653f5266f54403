//! Synchronization primitives.
//!
//! `IrqMutex` is the only lock in the kernel: a spinlock that masks
//! interrupts for as long as it is held. On a single core that makes it safe
//! to share data between task context and interrupt handlers — an ISR can
//! never observe the lock held, because whoever holds it cannot be
//! interrupted.
//!
//! `Completion` and `Semaphore` are plain data here; the parking and waking
//! of tasks lives in [`crate::sched`], next to the run-state transitions it
//! performs.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::fifo::BoundedFifo;
use crate::sched::TaskId;

/// Spinlock plus interrupt masking. Lock ordering is flat: never take a
/// second `IrqMutex` while holding one, except `sched` → wait-queue which is
/// the one sanctioned pair.
pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

pub struct IrqMutexGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    irq_state: usize,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        IrqMutex {
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let irq_state = crate::arch_irq_save();
        IrqMutexGuard {
            guard: Some(self.inner.lock()),
            irq_state,
        }
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<'a, T> Drop for IrqMutexGuard<'a, T> {
    fn drop(&mut self) {
        // Release the spinlock before restoring the interrupt state.
        self.guard.take();
        crate::arch_irq_restore(self.irq_state);
    }
}

// ── Completion ──────────────────────────────────────────────────────────────

/// A wait queue with wake-all semantics: `wait` parks the calling task,
/// `wake` releases every parked task at once. The queue is bounded; a `wait`
/// that finds it full fails without parking.
pub struct Completion {
    pub(crate) waiters: IrqMutex<BoundedFifo<TaskId>>,
}

impl Completion {
    pub fn new(capacity: usize) -> Self {
        Completion {
            waiters: IrqMutex::new(BoundedFifo::with_capacity(capacity)),
        }
    }

    pub fn pending(&self) -> usize {
        self.waiters.lock().len()
    }
}

// ── Counting semaphore ──────────────────────────────────────────────────────

pub(crate) struct SemInner {
    pub cur: i32,
    pub max: i32,
    pub waiters: BoundedFifo<TaskId>,
}

/// Counting semaphore. `try_down` is the non-blocking test-and-decrement;
/// `down` parks the caller on contention; `up` releases at most one waiter.
pub struct Semaphore {
    pub(crate) inner: IrqMutex<SemInner>,
    id: heapless::String<16>,
}

/// Max tasks parked on one semaphore.
const SEM_WAIT_SIZE: usize = 10;

impl Semaphore {
    pub fn new(cur: i32, max: i32, id: &str) -> Self {
        let mut name = heapless::String::new();
        let _ = name.push_str(id);
        Semaphore {
            inner: IrqMutex::new(SemInner {
                cur,
                max,
                waiters: BoundedFifo::with_capacity(SEM_WAIT_SIZE),
            }),
            id: name,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Take the semaphore if it is available. Returns `true` on success.
    pub fn try_down(&self) -> bool {
        let mut s = self.inner.lock();
        if s.cur > 0 {
            s.cur -= 1;
            true
        } else {
            false
        }
    }

    pub fn count(&self) -> i32 {
        self.inner.lock().cur
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irq_mutex_guards_data() {
        let m = IrqMutex::new(41);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 42);
    }

    #[test]
    fn try_down_counts() {
        let s = Semaphore::new(2, 2, "test");
        assert!(s.try_down());
        assert!(s.try_down());
        assert!(!s.try_down());
        assert_eq!(s.count(), 0);
    }
}
