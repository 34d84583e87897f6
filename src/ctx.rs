//! Module `ctx` implement the per-operation context.
//!
//! An [Opctx] travels with every externally invoked operation. It carries
//! the cooperative interrupt flag, the last-error slot for the connection
//! that issued the operation, and a yield hint set by the scheduler when
//! other requests are queued behind the global lock. Long operations probe
//! `check_interrupt` at yield points, at external-sort chunk boundaries and
//! at extent boundaries during compaction.

use std::sync::{
    atomic::{AtomicBool, Ordering::SeqCst},
    Arc,
};

use crate::{util::Spinlock, Error, Result};

/// Per-operation context, cheap to clone, shared with the issuing thread.
#[derive(Clone)]
pub struct Opctx {
    inner: Arc<Inner>,
}

struct Inner {
    interrupt: AtomicBool,
    yield_hint: AtomicBool,
    last_error: Spinlock<Option<String>>,
}

impl Default for Opctx {
    fn default() -> Opctx {
        Opctx::new()
    }
}

impl Opctx {
    pub fn new() -> Opctx {
        let inner = Inner {
            interrupt: AtomicBool::new(false),
            yield_hint: AtomicBool::new(false),
            last_error: Spinlock::new(None),
        };
        Opctx { inner: Arc::new(inner) }
    }

    /// Ask the operation to stop at its next probe point.
    pub fn kill(&self) {
        self.inner.interrupt.store(true, SeqCst);
    }

    /// Err(Interrupted) once `kill` has been called.
    pub fn check_interrupt(&self) -> Result<()> {
        if self.inner.interrupt.load(SeqCst) {
            err_at!(Interrupted, msg: "operation interrupted")
        } else {
            Ok(())
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupt.load(SeqCst)
    }

    /// Hint that other requests are waiting; long operations should reach
    /// their next yield point soon.
    pub fn request_yield(&self) {
        self.inner.yield_hint.store(true, SeqCst);
    }

    /// True once per `request_yield`, consuming the hint.
    pub fn take_yield_hint(&self) -> bool {
        self.inner.yield_hint.swap(false, SeqCst)
    }

    pub fn set_last_error(&self, err: &Error) {
        *self.inner.last_error.write() = Some(err.to_string());
    }

    pub fn to_last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }
}
