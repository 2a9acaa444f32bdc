//! Cancel-aware interlock between running and loading/unloading sections.
//!
//! Many threads execute code that assumes the currently loaded definitions are
//! stable ("running" sections). Occasionally one thread must add definitions
//! ("load") or tear them down ("unload"). The interlock lets running sections
//! overlap freely while giving load/unload sections exclusive access.
//!
//! # Compatibility
//!
//! | Active \ Requested | run   | load  | unload |
//! |--------------------|-------|-------|--------|
//! | nothing            | allow | allow | allow  |
//! | run (any number)   | allow | block | block  |
//! | load               | block | block | block  |
//! | unload             | block | block | block  |
//!
//! `load` and `unload` exclude identically; the kind only shows up in
//! [`InterlockSnapshot`] and in log output.
//!
//! # Fairness
//!
//! Waiters form a single FIFO queue. A newcomer is admitted immediately only if
//! the queue is empty and the table above allows it, so a queued exclusive
//! request holds back every run request that arrives after it. Whenever the
//! state changes the releasing thread admits, in order:
//!
//! - the front waiter, if it is exclusive and nothing is active, and nobody else; or
//! - the longest prefix of queued run waiters, if no exclusive section is active.
//!
//! Admission is a hand-off: counts are updated on the waiter's behalf before it
//! is woken, so no newcomer can slip in between.
//!
//! # Cancel Safety
//!
//! Blocking acquisitions take a [`Cx`]. Cancelling it while the caller is queued
//! removes the waiter and returns [`InterlockError::Cancelled`]; the interlock is
//! otherwise unchanged. An admitted section is never revoked, and its guard
//! releases on every exit path, including unwinding.
//!
//! # Reentrancy
//!
//! Each thread records which sections it holds on which interlock. A nested run
//! section inside a run section is admitted at once (queueing it behind a
//! waiting writer would deadlock). Every other nested request (an upgrade from
//! run to load/unload, or anything inside an exclusive section) fails with
//! [`InterlockError::Reentrancy`] instead of deadlocking.
//!
//! # Example
//!
//! ```
//! use interlock::{Cx, Interlock};
//!
//! let interlock = Interlock::new();
//! let cx = Cx::new();
//!
//! let answer = interlock.run(&cx, || 40 + 2)?;
//! assert_eq!(answer, 42);
//!
//! interlock.unload(&cx, || {
//!     // tear down cached definitions
//! })?;
//! # Ok::<(), interlock::InterlockError>(())
//! ```

use crate::cx::Cx;
use crate::error::InterlockError;
use crate::tracing_compat::{debug, trace};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Wake, Waker};
use std::thread::{self, Thread};

static NEXT_INTERLOCK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Sections held by the current thread, keyed by interlock id.
    static HELD: RefCell<SmallVec<[(u64, SectionKind); 4]>> = RefCell::new(SmallVec::new());

    /// Run shares given up by `permit_concurrent_loads`, one frame per active
    /// call, keyed by interlock id.
    static LENT: RefCell<SmallVec<[(u64, usize); 2]>> = RefCell::new(SmallVec::new());
}

/// The kind of section a caller holds or requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    /// Executing code against the currently loaded definitions.
    Run,
    /// Adding definitions.
    Load,
    /// Removing definitions.
    Unload,
}

impl SectionKind {
    /// Returns a lowercase name for diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Load => "load",
            Self::Unload => "unload",
        }
    }

    /// Returns true for `Load` and `Unload`.
    #[must_use]
    pub const fn is_exclusive(self) -> bool {
        matches!(self, Self::Load | Self::Unload)
    }
}

impl std::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Point-in-time view of an interlock, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterlockSnapshot {
    /// Number of active running sections.
    pub running: usize,
    /// Kind of the active exclusive section, if any.
    pub exclusive: Option<SectionKind>,
    /// Queued run requests.
    pub queued_run: usize,
    /// Queued load/unload requests.
    pub queued_exclusive: usize,
}

impl InterlockSnapshot {
    /// True when nothing is active and nobody is waiting.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.running == 0
            && self.exclusive.is_none()
            && self.queued_run == 0
            && self.queued_exclusive == 0
    }
}

#[derive(Debug, Default)]
struct State {
    running: usize,
    exclusive: Option<SectionKind>,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    kind: SectionKind,
    waker: Waker,
}

impl State {
    #[inline]
    fn compatible(&self, kind: SectionKind) -> bool {
        match kind {
            SectionKind::Run => self.exclusive.is_none(),
            SectionKind::Load | SectionKind::Unload => {
                self.exclusive.is_none() && self.running == 0
            }
        }
    }

    #[inline]
    fn admits_newcomer(&self, kind: SectionKind) -> bool {
        self.queue.is_empty() && self.compatible(kind)
    }

    #[inline]
    fn grant(&mut self, kind: SectionKind) {
        match kind {
            SectionKind::Run => self.running += 1,
            SectionKind::Load | SectionKind::Unload => self.exclusive = Some(kind),
        }
        self.assert_invariants();
    }

    fn release(&mut self, kind: SectionKind) {
        match kind {
            SectionKind::Run => {
                assert!(
                    self.running > 0,
                    "interlock released a run section that was not held"
                );
                self.running -= 1;
            }
            SectionKind::Load | SectionKind::Unload => {
                assert_eq!(
                    self.exclusive,
                    Some(kind),
                    "interlock released a {kind} section that was not held"
                );
                self.exclusive = None;
            }
        }
    }

    fn enqueue(&mut self, kind: SectionKind, waker: Waker) -> u64 {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        self.queue.push_back(Waiter { id, kind, waker });
        id
    }

    #[inline]
    fn is_queued(&self, id: u64) -> bool {
        self.queue.iter().any(|w| w.id == id)
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.queue.len();
        self.queue.retain(|w| w.id != id);
        before != self.queue.len()
    }

    /// Admits whatever the queue front allows and returns the wakers to fire
    /// once the state lock is released.
    fn admit_waiters(&mut self) -> SmallVec<[Waker; 4]> {
        let mut admitted = SmallVec::new();
        while let Some(front) = self.queue.front() {
            let kind = front.kind;
            if !self.compatible(kind) {
                break;
            }
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.grant(kind);
            admitted.push(waiter.waker);
            if kind.is_exclusive() {
                break;
            }
        }
        admitted
    }

    fn assert_invariants(&self) {
        assert!(
            self.exclusive.is_none() || self.running == 0,
            "interlock invariant violated: {:?} section active with {} running sections",
            self.exclusive,
            self.running
        );
    }

    fn snapshot(&self) -> InterlockSnapshot {
        let queued_exclusive = self.queue.iter().filter(|w| w.kind.is_exclusive()).count();
        InterlockSnapshot {
            running: self.running,
            exclusive: self.exclusive,
            queued_run: self.queue.len() - queued_exclusive,
            queued_exclusive,
        }
    }
}

/// Unparks a blocked thread.
struct ThreadWaker {
    thread: Thread,
}

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.thread.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.thread.unpark();
    }
}

fn current_thread_waker() -> Waker {
    Waker::from(Arc::new(ThreadWaker {
        thread: thread::current(),
    }))
}

fn wake_all(wakers: SmallVec<[Waker; 4]>) {
    for waker in wakers {
        waker.wake();
    }
}

fn held_push(interlock: u64, kind: SectionKind) {
    let _ = HELD.try_with(|held| held.borrow_mut().push((interlock, kind)));
}

/// Forgets one held section. Returns false if the thread has no such entry,
/// i.e. the share is currently lent out. Untracked threads (thread-local
/// storage already torn down) count as holding it.
fn held_remove(interlock: u64, kind: SectionKind) -> bool {
    HELD.try_with(|held| {
        let mut held = held.borrow_mut();
        let pos = held.iter().rposition(|entry| *entry == (interlock, kind));
        pos.map(|pos| held.remove(pos)).is_some()
    })
    .unwrap_or(true)
}

fn lent_push(interlock: u64, shares: usize) {
    let _ = LENT.try_with(|lent| lent.borrow_mut().push((interlock, shares)));
}

/// Removes the innermost lent frame for `interlock` and returns its count.
fn lent_pop(interlock: u64) -> usize {
    LENT.try_with(|lent| {
        let mut lent = lent.borrow_mut();
        let pos = lent.iter().rposition(|(id, _)| *id == interlock);
        pos.map_or(0, |pos| lent.remove(pos).1)
    })
    .unwrap_or(0)
}

/// A guard whose share is lent out was dropped: it must not be taken back.
fn lent_forget_one(interlock: u64) -> bool {
    LENT.try_with(|lent| {
        let mut lent = lent.borrow_mut();
        match lent
            .iter_mut()
            .rev()
            .find(|(id, shares)| *id == interlock && *shares > 0)
        {
            Some((_, shares)) => {
                *shares -= 1;
                true
            }
            None => false,
        }
    })
    .unwrap_or(false)
}

/// Exclusive sections win over run sections when reporting what is held.
fn held_on(interlock: u64) -> Option<SectionKind> {
    HELD.try_with(|held| {
        held.borrow()
            .iter()
            .filter(|(id, _)| *id == interlock)
            .map(|(_, kind)| *kind)
            .max_by_key(|kind| kind.is_exclusive())
    })
    .ok()
    .flatten()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Fresh,
    NestedRun,
}

/// Shared/exclusive interlock for running, loading and unloading sections.
///
/// The interlock has no owner. Share it with `Arc<Interlock>` and pass it to
/// every collaborator that needs it.
#[derive(Debug)]
pub struct Interlock {
    id: u64,
    state: Mutex<State>,
}

impl Default for Interlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Interlock {
    /// Creates an idle interlock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_INTERLOCK_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State::default()),
        }
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    /// Executes `body` inside a running section.
    ///
    /// # Errors
    ///
    /// [`InterlockError::Cancelled`] if `cx` is cancelled while waiting, or
    /// [`InterlockError::Reentrancy`] if this thread holds a load/unload section.
    pub fn run<F, R>(&self, cx: &Cx, body: F) -> Result<R, InterlockError>
    where
        F: FnOnce() -> R,
    {
        let _section = self.enter_run(cx)?;
        Ok(body())
    }

    /// Executes `body` inside an exclusive load section.
    ///
    /// # Errors
    ///
    /// [`InterlockError::Cancelled`] if `cx` is cancelled while waiting, or
    /// [`InterlockError::Reentrancy`] if this thread already holds any section.
    pub fn load<F, R>(&self, cx: &Cx, body: F) -> Result<R, InterlockError>
    where
        F: FnOnce() -> R,
    {
        let _section = self.enter_load(cx)?;
        Ok(body())
    }

    /// Executes `body` inside an exclusive unload section.
    ///
    /// # Errors
    ///
    /// Same as [`load`](Self::load).
    pub fn unload<F, R>(&self, cx: &Cx, body: F) -> Result<R, InterlockError>
    where
        F: FnOnce() -> R,
    {
        let _section = self.enter_unload(cx)?;
        Ok(body())
    }

    /// Opens a running section, blocking while an exclusive section is active
    /// or queued.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub fn enter_run(&self, cx: &Cx) -> Result<RunSection<'_>, InterlockError> {
        self.acquire(SectionKind::Run, cx)?;
        Ok(RunSection::new(self))
    }

    /// Opens a load section, blocking until no other section is active.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn enter_load(&self, cx: &Cx) -> Result<ExclusiveSection<'_>, InterlockError> {
        self.acquire(SectionKind::Load, cx)?;
        Ok(ExclusiveSection::new(self, SectionKind::Load))
    }

    /// Opens an unload section, blocking until no other section is active.
    ///
    /// # Errors
    ///
    /// See [`load`](Self::load).
    pub fn enter_unload(&self, cx: &Cx) -> Result<ExclusiveSection<'_>, InterlockError> {
        self.acquire(SectionKind::Unload, cx)?;
        Ok(ExclusiveSection::new(self, SectionKind::Unload))
    }

    /// Opens a running section without waiting.
    ///
    /// # Errors
    ///
    /// [`InterlockError::WouldBlock`] if the section cannot be admitted right
    /// now; this never bypasses queued waiters.
    pub fn try_run(&self) -> Result<RunSection<'_>, InterlockError> {
        self.try_acquire(SectionKind::Run)?;
        Ok(RunSection::new(self))
    }

    /// Opens a load section without waiting.
    ///
    /// # Errors
    ///
    /// See [`try_run`](Self::try_run).
    pub fn try_load(&self) -> Result<ExclusiveSection<'_>, InterlockError> {
        self.try_acquire(SectionKind::Load)?;
        Ok(ExclusiveSection::new(self, SectionKind::Load))
    }

    /// Opens an unload section without waiting.
    ///
    /// # Errors
    ///
    /// See [`try_run`](Self::try_run).
    pub fn try_unload(&self) -> Result<ExclusiveSection<'_>, InterlockError> {
        self.try_acquire(SectionKind::Unload)?;
        Ok(ExclusiveSection::new(self, SectionKind::Unload))
    }

    /// Returns the current counts, for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> InterlockSnapshot {
        self.state.lock().snapshot()
    }

    /// Returns the kind of section the calling thread holds on this interlock.
    #[must_use]
    pub fn held_by_current_thread(&self) -> Option<SectionKind> {
        held_on(self.id)
    }

    fn check_reentrancy(&self, requested: SectionKind) -> Result<Entry, InterlockError> {
        match (held_on(self.id), requested) {
            (None, _) => Ok(Entry::Fresh),
            (Some(SectionKind::Run), SectionKind::Run) => Ok(Entry::NestedRun),
            (Some(held), requested) => {
                debug!(
                    interlock = self.id,
                    held = %held,
                    requested = %requested,
                    "reentrant interlock acquisition rejected"
                );
                Err(InterlockError::Reentrancy { held, requested })
            }
        }
    }

    fn admit_nested_run(&self) {
        let mut state = self.state.lock();
        state.grant(SectionKind::Run);
        drop(state);
        trace!(interlock = self.id, "nested run section admitted");
    }

    fn try_acquire(&self, kind: SectionKind) -> Result<(), InterlockError> {
        if self.check_reentrancy(kind)? == Entry::NestedRun {
            self.admit_nested_run();
            return Ok(());
        }

        let mut state = self.state.lock();
        if !state.admits_newcomer(kind) {
            return Err(InterlockError::WouldBlock);
        }
        state.grant(kind);
        drop(state);
        trace!(interlock = self.id, kind = %kind, "section admitted");
        Ok(())
    }

    fn acquire(&self, kind: SectionKind, cx: &Cx) -> Result<(), InterlockError> {
        if self.check_reentrancy(kind)? == Entry::NestedRun {
            self.admit_nested_run();
            return Ok(());
        }

        let (id, waker) = {
            let mut state = self.state.lock();
            if state.admits_newcomer(kind) {
                state.grant(kind);
                drop(state);
                trace!(interlock = self.id, kind = %kind, "section admitted");
                return Ok(());
            }
            // Already cancelled: fail without touching the queue.
            cx.checkpoint()?;
            let waker = current_thread_waker();
            (state.enqueue(kind, waker.clone()), waker)
        };
        debug!(interlock = self.id, kind = %kind, waiter = id, "section queued");

        let _registration = cx.register_waker(&waker);
        if self.park_until_admitted(id, || cx.should_abandon_wait()) {
            trace!(interlock = self.id, kind = %kind, waiter = id, "queued section admitted");
            Ok(())
        } else {
            debug!(
                interlock = self.id,
                kind = %kind,
                waiter = id,
                label = ?cx.label(),
                "queued section cancelled"
            );
            Err(InterlockError::Cancelled)
        }
    }

    /// Waits for a run share without observing cancellation.
    fn acquire_run_uninterruptibly(&self) {
        let id = {
            let mut state = self.state.lock();
            if state.admits_newcomer(SectionKind::Run) {
                state.grant(SectionKind::Run);
                return;
            }
            state.enqueue(SectionKind::Run, current_thread_waker())
        };
        self.park_until_admitted(id, || false);
    }

    /// Parks until waiter `id` has been handed the section (returns true) or
    /// `abandon` asks to give up (returns false, waiter removed).
    fn park_until_admitted(&self, id: u64, mut abandon: impl FnMut() -> bool) -> bool {
        loop {
            {
                let mut state = self.state.lock();
                if !state.is_queued(id) {
                    return true;
                }
                if abandon() {
                    state.remove(id);
                    // The departing waiter may have been holding back the
                    // run requests queued behind it.
                    let wakers = state.admit_waiters();
                    drop(state);
                    wake_all(wakers);
                    return false;
                }
            }
            thread::park();
        }
    }

    fn release(&self, kind: SectionKind, shares: usize) {
        let wakers = {
            let mut state = self.state.lock();
            for _ in 0..shares {
                state.release(kind);
            }
            state.assert_invariants();
            state.admit_waiters()
        };
        trace!(
            interlock = self.id,
            kind = %kind,
            woken = wakers.len(),
            "section released"
        );
        wake_all(wakers);
    }
}

/// An active running section. Releases on drop.
///
/// Sections belong to the thread that opened them and are not `Send`.
#[derive(Debug)]
#[must_use = "section will be immediately released if not held"]
pub struct RunSection<'a> {
    interlock: &'a Interlock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> RunSection<'a> {
    fn new(interlock: &'a Interlock) -> Self {
        held_push(interlock.id, SectionKind::Run);
        Self {
            interlock,
            _not_send: PhantomData,
        }
    }

    /// Gives up every run share this thread holds on the interlock while
    /// `body` executes, so a queued load/unload section can proceed, then
    /// takes them back before returning.
    ///
    /// `body` must not rely on the loaded definitions staying put. Taking the
    /// shares back ignores cancellation: the caller's section is restored
    /// before this returns, whatever happens inside `body`.
    pub fn permit_concurrent_loads<F, R>(&mut self, body: F) -> R
    where
        F: FnOnce() -> R,
    {
        struct Reacquire<'a> {
            interlock: &'a Interlock,
        }

        impl Drop for Reacquire<'_> {
            fn drop(&mut self) {
                // Guards dropped inside the body have already been subtracted.
                let shares = lent_pop(self.interlock.id);
                if shares == 0 {
                    return;
                }
                self.interlock.acquire_run_uninterruptibly();
                if shares > 1 {
                    let mut state = self.interlock.state.lock();
                    for _ in 1..shares {
                        state.grant(SectionKind::Run);
                    }
                }
                for _ in 0..shares {
                    held_push(self.interlock.id, SectionKind::Run);
                }
            }
        }

        let interlock = self.interlock;
        let shares = HELD
            .try_with(|held| {
                let mut held = held.borrow_mut();
                let before = held.len();
                held.retain(|entry| *entry != (interlock.id, SectionKind::Run));
                before - held.len()
            })
            .unwrap_or(0);
        debug!(interlock = interlock.id, shares, "permitting concurrent loads");
        lent_push(interlock.id, shares);
        interlock.release(SectionKind::Run, shares);

        let _reacquire = Reacquire { interlock };
        body()
    }
}

impl Drop for RunSection<'_> {
    fn drop(&mut self) {
        if held_remove(self.interlock.id, SectionKind::Run) {
            self.interlock.release(SectionKind::Run, 1);
        } else if lent_forget_one(self.interlock.id) {
            trace!(interlock = self.interlock.id, "lent run section dropped");
        }
    }
}

/// An active load or unload section. Releases on drop.
///
/// Sections belong to the thread that opened them and are not `Send`.
#[derive(Debug)]
#[must_use = "section will be immediately released if not held"]
pub struct ExclusiveSection<'a> {
    interlock: &'a Interlock,
    kind: SectionKind,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ExclusiveSection<'a> {
    fn new(interlock: &'a Interlock, kind: SectionKind) -> Self {
        debug_assert!(kind.is_exclusive());
        held_push(interlock.id, kind);
        Self {
            interlock,
            kind,
            _not_send: PhantomData,
        }
    }

    /// Returns `Load` or `Unload`.
    #[must_use]
    pub const fn kind(&self) -> SectionKind {
        self.kind
    }

    /// Returns true if this section was opened on `interlock`.
    #[must_use]
    pub fn belongs_to(&self, interlock: &Interlock) -> bool {
        self.interlock.id == interlock.id
    }

    pub(crate) const fn interlock_id(&self) -> u64 {
        self.interlock.id
    }
}

impl Drop for ExclusiveSection<'_> {
    fn drop(&mut self) {
        let _ = held_remove(self.interlock.id, self.kind);
        self.interlock.release(self.kind, 1);
    }
}
