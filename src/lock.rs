//! Module `lock` implement the engine-wide readers-writer lock.
//!
//! Every externally invoked operation runs under one [GlobalLock]: reads in
//! shared mode, mutations in exclusive mode. The lock is recursive within a
//! thread and supports two extra affordances long operations depend on,
//!
//! * `release_early` -- a writer may release before its guard goes out of
//!   scope; the guard's eventual drop becomes a no-op.
//! * `temp_release` -- release, pause briefly so queued requests can run,
//!   then re-acquire in the same mode. This is the cursor yield point;
//!   callers snapshot cursor state before invoking it.
//!
//! Lock hierarchy, lower level acquired first: diagnostic logger (1),
//! cursor registry (2), global lock (3). Code holding the registry spinlock
//! must never block on this lock.
//!
//! Per-thread state is a signed counter: positive values count write
//! recursion, negative values count read recursion, zero is unlocked.
//! Upgrading a read lock to a write lock (or downgrading) is a programming
//! error and panics.

use lazy_static::lazy_static;

use std::{
    cell::{RefCell, UnsafeCell},
    collections::HashMap,
    fmt,
    ops::{Deref, DerefMut},
    result,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering::SeqCst},
        Condvar, Mutex,
    },
    thread, time,
};

lazy_static! {
    static ref LOCK_IDS: AtomicUsize = AtomicUsize::new(1);
}

thread_local! {
    // (depth, released_early) per lock instance, keyed by lock id.
    static TLS: RefCell<HashMap<usize, (i32, bool)>> = RefCell::new(HashMap::new());
}

#[derive(Default)]
struct State {
    readers: u32,
    writer: bool,
    writers_waiting: u32,
}

/// Process-wide readers-writer lock guarding value `T`.
///
/// Writers are preferred: once a writer is queued, new readers wait. Within
/// a thread the lock is recursive; a read request while the thread already
/// holds the write lock simply deepens the write recursion, since exclusive
/// access covers shared access.
pub struct GlobalLock<T> {
    id: usize,
    state: Mutex<State>,
    readers_ok: Condvar,
    writer_ok: Condvar,
    n_shared: AtomicU64,
    n_exclusive: AtomicU64,

    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for GlobalLock<T> {}
unsafe impl<T: Send> Sync for GlobalLock<T> {}

impl<T> GlobalLock<T> {
    pub fn new(value: T) -> GlobalLock<T> {
        GlobalLock {
            id: LOCK_IDS.fetch_add(1, SeqCst),
            state: Mutex::new(State::default()),
            readers_ok: Condvar::new(),
            writer_ok: Condvar::new(),
            n_shared: AtomicU64::new(0),
            n_exclusive: AtomicU64::new(0),

            value: UnsafeCell::new(value),
        }
    }

    /// Per-thread state: > 0 write recursion, < 0 read recursion, 0 unlocked.
    pub fn state(&self) -> i32 {
        TLS.with(|tls| tls.borrow().get(&self.id).map(|s| s.0).unwrap_or(0))
    }

    pub fn assert_write_locked(&self) {
        assert!(self.state() > 0, "global-lock: write lock not held");
    }

    pub fn assert_at_least_read_locked(&self) {
        assert!(self.state() != 0, "global-lock: lock not held");
    }

    /// Acquire shared permission. Recursive within a thread.
    pub fn read(&self) -> ReadGuard<T> {
        match self.state() {
            d if d > 0 => self.set_depth(d + 1), // write covers read
            d if d < 0 => self.set_depth(d - 1),
            _ => {
                let mut state = self.state.lock().unwrap();
                while state.writer || state.writers_waiting > 0 {
                    state = self.readers_ok.wait(state).unwrap();
                }
                state.readers += 1;
                self.n_shared.fetch_add(1, SeqCst);
                self.set_depth(-1);
            }
        }
        ReadGuard { door: self }
    }

    /// Acquire exclusive permission. Recursive within a thread. Panics if
    /// the thread holds shared permission: locks are not upgradeable.
    pub fn write(&self) -> WriteGuard<T> {
        match self.state() {
            d if d > 0 => self.set_depth(d + 1),
            d if d < 0 => panic!("global-lock: locks are not upgradeable"),
            _ => {
                let mut state = self.state.lock().unwrap();
                state.writers_waiting += 1;
                while state.writer || state.readers > 0 {
                    state = self.writer_ok.wait(state).unwrap();
                }
                state.writers_waiting -= 1;
                state.writer = true;
                self.n_exclusive.fetch_add(1, SeqCst);
                self.set_depth(1);
            }
        }
        WriteGuard { door: self }
    }

    /// Release the write lock before its guard is dropped; the guard's drop
    /// then unwinds without touching the lock. Must not be recursive.
    pub fn release_early(&self) {
        assert!(self.state() == 1, "global-lock: release_early while recursive");
        assert!(!self.released_early(), "global-lock: released twice");
        self.set_released_early(true);
        self.unlock();
    }

    /// The yield point: fully release, pause for `pause`, re-acquire in the
    /// same mode. Must not be recursive -- a depth other than 1 or -1
    /// panics, since an enclosing level still expects its permission.
    pub fn temp_release(&self, pause: time::Duration) {
        let depth = self.state();
        match depth {
            1 | -1 => self.unlock(),
            _ => panic!("global-lock: temp_release at depth {}", depth),
        }
        thread::yield_now();
        if pause > time::Duration::from_micros(0) {
            thread::sleep(pause);
        }
        match depth {
            1 => std::mem::forget(self.write()),
            _ => std::mem::forget(self.read()),
        }
    }

    pub fn to_stats(&self) -> Stats {
        Stats {
            n_shared: self.n_shared.load(SeqCst),
            n_exclusive: self.n_exclusive.load(SeqCst),
        }
    }

    fn unlock(&self) {
        match self.state() {
            d if d > 1 => self.set_depth(d - 1),
            d if d < -1 => self.set_depth(d + 1),
            1 => {
                self.set_depth(0);
                let mut state = self.state.lock().unwrap();
                state.writer = false;
                if state.writers_waiting > 0 {
                    self.writer_ok.notify_one();
                } else {
                    self.readers_ok.notify_all();
                }
            }
            -1 => {
                self.set_depth(0);
                let mut state = self.state.lock().unwrap();
                state.readers -= 1;
                if state.readers == 0 && state.writers_waiting > 0 {
                    self.writer_ok.notify_one();
                }
            }
            _ if self.released_early() => self.set_released_early(false),
            _ => panic!("global-lock: unlock while not locked"),
        }
    }

    fn set_depth(&self, depth: i32) {
        TLS.with(|tls| {
            let mut tls = tls.borrow_mut();
            let slot = tls.entry(self.id).or_insert((0, false));
            slot.0 = depth;
        })
    }

    fn released_early(&self) -> bool {
        TLS.with(|tls| tls.borrow().get(&self.id).map(|s| s.1).unwrap_or(false))
    }

    fn set_released_early(&self, flag: bool) {
        TLS.with(|tls| {
            let mut tls = tls.borrow_mut();
            let slot = tls.entry(self.id).or_insert((0, false));
            slot.1 = flag;
        })
    }
}

/// Shared permission handle.
pub struct ReadGuard<'a, T> {
    door: &'a GlobalLock<T>,
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.door.value.get() }
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.door.unlock();
    }
}

/// Exclusive permission handle.
pub struct WriteGuard<'a, T> {
    door: &'a GlobalLock<T>,
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.door.value.get() }
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.door.value.get() }
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        self.door.unlock();
    }
}

/// Statistic type, to capture [GlobalLock] metrics.
#[derive(Default)]
pub struct Stats {
    pub n_shared: u64,
    pub n_exclusive: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "{{ n_shared = {}, n_exclusive = {} }}",
            self.n_shared, self.n_exclusive
        )
    }
}

#[cfg(test)]
#[path = "lock_test.rs"]
mod lock_test;
