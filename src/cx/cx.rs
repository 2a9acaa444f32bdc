//! The cancellation context type.
//!
//! `Cx` is the token passed to every blocking acquisition on an
//! [`Interlock`](crate::sync::Interlock). It carries:
//! - A cancellation flag observable by waiters
//! - A mask depth for sections that must not be interrupted
//! - An optional label used in diagnostics
//!
//! # Blocking Waits
//!
//! A thread blocked on the interlock registers a [`Waker`] with its `Cx`.
//! Several threads may block on clones of one context; each keeps its own
//! registration. [`Cx::cancel`] sets the flag and fires every registered
//! waker, so each blocked thread wakes up, removes itself from the wait queue
//! and reports [`InterlockError::Cancelled`]. There is no polling interval.
//!
//! # Cloning
//!
//! `Cx` is cheaply clonable (it wraps an `Arc`). Clones share the same state,
//! so a supervisor can keep a clone and cancel a worker that is blocked.

use crate::error::InterlockError;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use std::task::Waker;

#[derive(Debug, Default)]
struct CxInner {
    label: Option<Arc<str>>,
    cancel_requested: bool,
    mask_depth: u32,
    // One entry per thread blocked on this context or a clone of it.
    wakers: SmallVec<[(u64, Waker); 2]>,
    next_registration: u64,
}

/// Cancellation context for interlock acquisitions.
///
/// # Example
///
/// ```
/// use interlock::Cx;
///
/// let cx = Cx::new();
/// assert!(cx.checkpoint().is_ok());
///
/// cx.cancel();
/// assert!(cx.checkpoint().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Cx {
    inner: Arc<Mutex<CxInner>>,
}

impl Cx {
    /// Creates a fresh, uncancelled context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context carrying a label for log output.
    #[must_use]
    pub fn named(label: impl Into<Arc<str>>) -> Self {
        let cx = Self::new();
        cx.inner.lock().label = Some(label.into());
        cx
    }

    /// Creates a context for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self::named("test")
    }

    /// Returns the diagnostic label, if any.
    #[must_use]
    pub fn label(&self) -> Option<Arc<str>> {
        self.inner.lock().label.clone()
    }

    /// Returns true if cancellation has been requested.
    ///
    /// Unlike [`checkpoint`](Self::checkpoint) this ignores masking.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.lock().cancel_requested
    }

    /// Checks for cancellation and returns an error if cancelled.
    ///
    /// While masked (see [`masked`](Self::masked)) this returns `Ok(())` even
    /// if cancellation is pending.
    ///
    /// # Errors
    ///
    /// Returns [`InterlockError::Cancelled`] if cancellation is pending and the
    /// context is not masked.
    pub fn checkpoint(&self) -> Result<(), InterlockError> {
        if self.inner.lock().is_effectively_cancelled() {
            Err(InterlockError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Executes a closure with cancellation masked.
    ///
    /// Masking nests: cancellation is only observable again once every
    /// `masked` call has returned. A waiter blocked while the mask is lifted
    /// is woken so it can observe a pending cancellation.
    pub fn masked<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.inner.lock().mask_depth += 1;

        struct Unmask<'a>(&'a Cx);

        impl Drop for Unmask<'_> {
            fn drop(&mut self) {
                let wakers = {
                    let mut inner = self.0.inner.lock();
                    inner.mask_depth = inner.mask_depth.saturating_sub(1);
                    if inner.is_effectively_cancelled() {
                        inner.registered_wakers()
                    } else {
                        SmallVec::new()
                    }
                };
                wake_all(wakers);
            }
        }

        let _unmask = Unmask(self);
        f()
    }

    /// Requests cancellation and wakes every waiter blocked on this context
    /// or one of its clones.
    pub fn cancel(&self) {
        self.set_cancel_requested(true);
    }

    /// Sets the cancellation flag.
    ///
    /// Setting it to `true` wakes every waiter blocked on this context.
    pub fn set_cancel_requested(&self, value: bool) {
        let wakers = {
            let mut inner = self.inner.lock();
            inner.cancel_requested = value;
            if value {
                inner.registered_wakers()
            } else {
                SmallVec::new()
            }
        };
        wake_all(wakers);
    }

    /// True when a blocked waiter should give up.
    pub(crate) fn should_abandon_wait(&self) -> bool {
        self.inner.lock().is_effectively_cancelled()
    }

    /// Registers the waker of a blocked acquisition. The registration is
    /// removed when the returned guard drops.
    pub(crate) fn register_waker(&self, waker: &Waker) -> WakerRegistration<'_> {
        let mut inner = self.inner.lock();
        let id = inner.next_registration;
        inner.next_registration += 1;
        inner.wakers.push((id, waker.clone()));
        drop(inner);
        WakerRegistration { cx: self, id }
    }
}

impl CxInner {
    const fn is_effectively_cancelled(&self) -> bool {
        self.cancel_requested && self.mask_depth == 0
    }

    fn registered_wakers(&self) -> SmallVec<[Waker; 2]> {
        self.wakers.iter().map(|(_, waker)| waker.clone()).collect()
    }
}

fn wake_all(wakers: SmallVec<[Waker; 2]>) {
    for waker in wakers {
        waker.wake();
    }
}

/// Keeps a waker registered on a [`Cx`] for the duration of a blocking wait.
pub(crate) struct WakerRegistration<'a> {
    cx: &'a Cx,
    id: u64,
}

impl Drop for WakerRegistration<'_> {
    fn drop(&mut self) {
        self.cx.inner.lock().wakers.retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn checkpoint_without_cancel() {
        let cx = Cx::for_testing();
        assert!(cx.checkpoint().is_ok());
    }

    #[test]
    fn checkpoint_with_cancel() {
        let cx = Cx::for_testing();
        cx.cancel();
        assert_eq!(cx.checkpoint(), Err(InterlockError::Cancelled));
        assert!(cx.is_cancel_requested());
    }

    #[test]
    fn masked_defers_cancel() {
        let cx = Cx::for_testing();
        cx.cancel();

        cx.masked(|| {
            assert!(cx.checkpoint().is_ok(), "checkpoint should pass while masked");
            cx.masked(|| assert!(cx.checkpoint().is_ok()));
            assert!(cx.checkpoint().is_ok(), "outer mask still active");
        });

        assert!(cx.checkpoint().is_err(), "cancel observable after unmask");
    }

    #[test]
    fn clones_share_cancellation() {
        let cx = Cx::named("worker");
        let handle = cx.clone();
        handle.cancel();
        assert!(cx.is_cancel_requested());
        assert_eq!(cx.label().as_deref(), Some("worker"));
    }

    #[test]
    fn cancel_wakes_registered_waker() {
        let cx = Cx::for_testing();
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));

        {
            let _registration = cx.register_waker(&waker);
            cx.cancel();
            assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        }

        // Registration dropped: a later cancel wakes nobody.
        cx.set_cancel_requested(false);
        cx.cancel();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_wakes_every_registered_waker() {
        let cx = Cx::for_testing();
        let clone = cx.clone();
        let first = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let second = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let first_waker = Waker::from(Arc::clone(&first));
        let second_waker = Waker::from(Arc::clone(&second));

        let first_registration = cx.register_waker(&first_waker);
        let second_registration = clone.register_waker(&second_waker);

        // Dropping one registration must not forget the other.
        drop(first_registration);
        cx.cancel();
        assert_eq!(first.0.load(Ordering::SeqCst), 0);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);

        let first_registration = cx.register_waker(&first_waker);
        cx.set_cancel_requested(false);
        clone.cancel();
        assert_eq!(first.0.load(Ordering::SeqCst), 1);
        assert_eq!(second.0.load(Ordering::SeqCst), 2);
        drop(first_registration);
        drop(second_registration);
    }

    #[test]
    fn unmask_wakes_waiter_with_pending_cancel() {
        let cx = Cx::for_testing();
        let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let waker = Waker::from(Arc::clone(&counter));
        let _registration = cx.register_waker(&waker);

        cx.masked(|| {
            cx.cancel();
            assert!(!cx.should_abandon_wait());
        });

        assert!(cx.should_abandon_wait());
        // Once from cancel(), once from lifting the mask.
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }
}
