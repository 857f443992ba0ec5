use portable_atomic::{AtomicBool, Ordering};

/// Tells whether events were requested since the last time someone looked.
///
/// This drives the C2H poll rate on chips, where TX reports have to be polled. Every frame
/// requesting a report raises the flag and every poll lowers it again, regardless of whether
/// the report showed up. A lost report therefore only keeps the poller busy until it backs off.
pub struct PendingFlag {
    pending: AtomicBool,
}
impl PendingFlag {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }
    /// Record that an event is expected.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::Relaxed);
    }
    /// Lower the flag and return, whether it was raised.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::Relaxed)
    }
}
impl Default for PendingFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// A flag, which can only be acquired by one party at a time.
pub struct Latch {
    state: AtomicBool,
}
impl Latch {
    pub const fn new() -> Self {
        Self {
            state: AtomicBool::new(false),
        }
    }
    /// Try to set the latch.
    ///
    /// Returns [false] if it was already set.
    pub fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
    pub fn release(&self) {
        self.state.store(false, Ordering::Release);
    }
    pub fn is_set(&self) -> bool {
        self.state.load(Ordering::Acquire)
    }
}
impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs a closure when dropped, unless it was defused first.
///
/// The calibration path uses this to release its [Latch], if sending the H2C command fails or
/// panics halfway through. On success the guard is defused and the latch stays set, until the
/// firmware reports completion.
pub struct DropGuard<F: FnMut()> {
    drop_closure: F,
}
impl<F: FnMut()> DropGuard<F> {
    #[inline]
    /// Create a new drop guard.
    pub const fn new(drop_closure: F) -> Self {
        Self { drop_closure }
    }
    #[inline]
    /// Defuse the drop guard.
    ///
    /// This will prevent the drop closure from being run.
    pub fn defuse(self) {
        core::mem::forget(self);
    }
}
impl<F: FnMut()> Drop for DropGuard<F> {
    fn drop(&mut self) {
        (self.drop_closure)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_flag_is_cleared_by_take() {
        let flag = PendingFlag::new();
        assert!(!flag.take());
        flag.raise();
        flag.raise();
        assert!(flag.take());
        // Two requests don't need two takes.
        assert!(!flag.take());
    }
    #[test]
    fn latch_is_exclusive() {
        let latch = Latch::new();
        assert!(latch.try_acquire());
        assert!(!latch.try_acquire());
        latch.release();
        assert!(latch.try_acquire());
    }
    #[test]
    fn drop_guard() {
        let latch = Latch::new();
        latch.try_acquire();
        {
            let _guard = DropGuard::new(|| latch.release());
        }
        assert!(!latch.is_set());

        latch.try_acquire();
        DropGuard::new(|| latch.release()).defuse();
        assert!(latch.is_set());
    }
}
