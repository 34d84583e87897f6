//! Module `spinlock` implement a read-write-spinlock for short critical
//! sections.
//!
//! The cursor registry and per-cursor state are touched for a handful of
//! instructions at a time -- insert, erase, lookup -- so a latch-and-spin
//! primitive beats a blocking lock. A writer first flips the latch, which
//! stops new readers from entering, then waits for in-flight readers to
//! drain before flipping the lock bit and taking exclusive ownership.
//! Readers spin only while the latch or lock bit is up.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    result,
    sync::atomic::{AtomicU32, Ordering::SeqCst},
    thread,
};

/// Spinlock implements latch-and-spin mechanism for non-blocking
/// concurrency, protecting value `T`.
///
/// Layout of the control word:
/// * ref-count of active readers, bits 0-29.
/// * latch flag, bit 30.
/// * lock flag, bit 31.
pub struct Spinlock<T> {
    latchlock: AtomicU32,
    n_reads: AtomicU32,
    n_writes: AtomicU32,

    value: T,
}

impl<T> Spinlock<T> {
    const LATCH_FLAG: u32 = 0x40000000;
    const LOCK_FLAG: u32 = 0x80000000;
    const LATCH_LOCK_FLAG: u32 = 0xC0000000;
    const READERS_FLAG: u32 = 0x3FFFFFFF;

    /// Create a new Spinlock over `value`.
    pub fn new(value: T) -> Spinlock<T> {
        Spinlock {
            latchlock: AtomicU32::new(0),
            n_reads: AtomicU32::new(0),
            n_writes: AtomicU32::new(0),

            value,
        }
    }

    /// Acquire shared permission.
    pub fn read(&self) -> ReadGuard<T> {
        loop {
            let old = self.latchlock.load(SeqCst);
            if (old & Self::LATCH_LOCK_FLAG) == 0 {
                // no writer has the latch
                if self
                    .latchlock
                    .compare_exchange(old, old + 1, SeqCst, SeqCst)
                    .is_ok()
                {
                    self.n_reads.fetch_add(1, SeqCst);
                    break ReadGuard { door: self };
                }
            }
            thread::yield_now();
        }
    }

    /// Acquire exclusive permission.
    pub fn write(&self) -> WriteGuard<T> {
        // latch
        loop {
            let old = self.latchlock.load(SeqCst);
            if (old & Self::LATCH_FLAG) == 0 {
                if (old & Self::LOCK_FLAG) != 0 {
                    panic!("spinlock: lock without latch, call the programmer");
                }
                let new = old | Self::LATCH_FLAG;
                if self
                    .latchlock
                    .compare_exchange(old, new, SeqCst, SeqCst)
                    .is_ok()
                {
                    break;
                }
            }
            thread::yield_now();
        }
        // wait out readers, then lock
        loop {
            let old = self.latchlock.load(SeqCst);
            if (old & Self::READERS_FLAG) == 0 {
                let new = old | Self::LOCK_FLAG;
                if self
                    .latchlock
                    .compare_exchange(old, new, SeqCst, SeqCst)
                    .is_ok()
                {
                    self.n_writes.fetch_add(1, SeqCst);
                    let door = unsafe {
                        let door = self as *const Self as *mut Self;
                        door.as_mut().unwrap()
                    };
                    break WriteGuard { door };
                }
                panic!("spinlock: zero readers but lock failed, call the programmer");
            }
            thread::yield_now();
        }
    }

    pub fn to_stats(&self) -> Stats {
        Stats {
            latchlock: self.latchlock.load(SeqCst),
            n_reads: self.n_reads.load(SeqCst),
            n_writes: self.n_writes.load(SeqCst),
        }
    }
}

/// Shared permission handle, dropping it releases the latch count.
pub struct ReadGuard<'a, T> {
    door: &'a Spinlock<T>,
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.door.value
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.door.latchlock.fetch_sub(1, SeqCst);
    }
}

/// Exclusive permission handle, dropping it releases latch and lock.
pub struct WriteGuard<'a, T> {
    door: &'a mut Spinlock<T>,
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.door.value
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.door.value
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        let old = self.door.latchlock.load(SeqCst);
        if (old & Spinlock::<T>::READERS_FLAG) > 0 {
            panic!("spinlock: active readers while locked, call the programmer");
        }
        if self
            .door
            .latchlock
            .compare_exchange(old, 0, SeqCst, SeqCst)
            .is_err()
        {
            panic!("spinlock: concurrent modification while locked, call the programmer")
        }
    }
}

/// Statistic type, to capture [Spinlock] metrics.
#[derive(Default)]
pub struct Stats {
    pub latchlock: u32,
    pub n_reads: u32,
    pub n_writes: u32,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "{{ latchlock = {:X}, n_reads = {}, n_writes = {} }}",
            self.latchlock, self.n_reads, self.n_writes,
        )
    }
}

#[cfg(test)]
#[path = "spinlock_test.rs"]
mod spinlock_test;
