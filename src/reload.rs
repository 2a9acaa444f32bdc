//! Clearing cached state and reloading inside one unload section.
//!
//! [`ReloadCoordinator::clear`] is the only writer of reloadable state. It opens
//! an unload section, empties [`TrackedClasses`], calls the injected
//! [`Reloader`] exactly once and closes the section. A reloader that reports
//! [`ReloadError::Disabled`] turns into a fatal [`ConfigurationError`]; any
//! other reloader error comes back unchanged in [`ClearError::Reload`].

use crate::cx::Cx;
use crate::error::{ClearError, ConfigurationError};
use crate::registry::TrackedClasses;
use crate::sync::Interlock;
use crate::tracing_compat::{info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Failure reported by a [`Reloader`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReloadError<E> {
    /// Reloading is switched off by configuration.
    #[error("reloading is disabled")]
    Disabled,
    /// Any other failure, owned by the reloader.
    #[error(transparent)]
    Failed(E),
}

/// The external operation that drops stale definitions and reloads them.
pub trait Reloader {
    /// Error type for failures other than [`ReloadError::Disabled`].
    type Error;

    /// Performs one reload. Called with the unload section held.
    ///
    /// # Errors
    ///
    /// [`ReloadError::Disabled`] when reloading is switched off, otherwise
    /// whatever the reloader fails with.
    fn reload(&self) -> Result<(), ReloadError<Self::Error>>;
}

impl<F, E> Reloader for F
where
    F: Fn() -> Result<(), ReloadError<E>>,
{
    type Error = E;

    fn reload(&self) -> Result<(), ReloadError<E>> {
        self()
    }
}

/// Wraps a reloader and refuses to run it when reloading is disabled.
#[derive(Debug, Clone)]
pub struct GatedReloader<R> {
    inner: R,
    enabled: bool,
}

impl<R> GatedReloader<R> {
    /// Gates `inner` behind `enabled`.
    pub const fn new(inner: R, enabled: bool) -> Self {
        Self { inner, enabled }
    }

    /// Returns true if the inner reloader will be called.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the wrapped reloader.
    pub const fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: Reloader> Reloader for GatedReloader<R> {
    type Error = R::Error;

    fn reload(&self) -> Result<(), ReloadError<R::Error>> {
        if self.enabled {
            self.inner.reload()
        } else {
            Err(ReloadError::Disabled)
        }
    }
}

/// Performs atomic clear-and-reload cycles.
#[derive(Debug)]
pub struct ReloadCoordinator<R> {
    interlock: Arc<Interlock>,
    tracked: Arc<TrackedClasses>,
    reloader: R,
    completed: AtomicU64,
}

impl<R: Reloader> ReloadCoordinator<R> {
    /// Creates a coordinator over a shared interlock and tracked set.
    pub fn new(interlock: Arc<Interlock>, tracked: Arc<TrackedClasses>, reloader: R) -> Self {
        Self {
            interlock,
            tracked,
            reloader,
            completed: AtomicU64::new(0),
        }
    }

    /// Clears tracked classes and reloads, all inside one unload section.
    ///
    /// The tracked set is emptied before the reloader runs, so it is empty
    /// afterwards even when the reloader fails.
    ///
    /// # Errors
    ///
    /// - [`ClearError::Interlock`] if `cx` is cancelled while waiting for the
    ///   section, or this thread already holds a section on the interlock.
    /// - [`ClearError::Configuration`] if the reloader reports
    ///   [`ReloadError::Disabled`]. Fatal; do not retry.
    /// - [`ClearError::Reload`] with the reloader's own error, unchanged.
    pub fn clear(&self, cx: &Cx) -> Result<(), ClearError<R::Error>> {
        let section = self.interlock.enter_unload(cx)?;
        let cleared = self.tracked.clear(&section);

        match self.reloader.reload() {
            Ok(()) => {
                let cycle = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
                drop(section);
                info!(cycle, cleared, "reload completed");
                Ok(())
            }
            Err(ReloadError::Disabled) => {
                drop(section);
                warn!(cleared, "{}", ConfigurationError::RELOADING_DISABLED);
                Err(ConfigurationError::reloading_disabled().into())
            }
            Err(ReloadError::Failed(err)) => Err(ClearError::Reload(err)),
        }
    }

    /// Number of clear cycles whose reload succeeded.
    #[must_use]
    pub fn reload_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// The interlock this coordinator unloads through.
    #[must_use]
    pub fn interlock(&self) -> &Arc<Interlock> {
        &self.interlock
    }

    /// The tracked set this coordinator clears.
    #[must_use]
    pub fn tracked(&self) -> &Arc<TrackedClasses> {
        &self.tracked
    }

    /// The injected reloader.
    pub fn reloader(&self) -> &R {
        &self.reloader
    }
}
