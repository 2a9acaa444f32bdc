//! Error types for the interlock and the reload protocol.
//!
//! Errors are split by who can act on them:
//!
//! - [`InterlockError`]: an acquisition did not happen (cancelled, would block,
//!   or a same-thread reentrancy that would deadlock). Interlock state is left
//!   untouched apart from removing the waiter from the queue.
//! - [`ConfigurationError`]: reloading was requested but is disabled by
//!   configuration. Fatal; callers are expected to surface it to the operator.
//! - [`ClearError`]: everything [`ReloadCoordinator::clear`] can return. The
//!   reloader's own failures travel through it unchanged.
//!
//! Invariant violations inside the interlock are programming defects and panic
//! instead of producing an error value.
//!
//! [`ReloadCoordinator::clear`]: crate::reload::ReloadCoordinator::clear

use crate::sync::SectionKind;

/// Error returned when a section cannot be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InterlockError {
    /// The caller's context was cancelled before the section was admitted.
    #[error("interlock acquisition cancelled")]
    Cancelled,
    /// A non-blocking acquisition could not be admitted immediately.
    #[error("interlock is busy")]
    WouldBlock,
    /// The calling thread already holds a section that makes this request
    /// impossible to satisfy without deadlocking.
    #[error("reentrant {requested} section requested while holding {held} section")]
    Reentrancy {
        /// Section kind the thread already holds.
        held: SectionKind,
        /// Section kind that was requested.
        requested: SectionKind,
    },
}

impl InterlockError {
    /// Returns true if the acquisition failed because of cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Fatal error raised when reloading is refused by configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ConfigurationError {
    message: &'static str,
}

impl ConfigurationError {
    /// Message carried when the reloader reports that reloading is disabled.
    pub const RELOADING_DISABLED: &'static str =
        "reloading is disabled because reload.enabled is false";

    pub(crate) const fn reloading_disabled() -> Self {
        Self {
            message: Self::RELOADING_DISABLED,
        }
    }

    /// Returns the operator-facing message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        self.message
    }
}

/// Error returned by [`ReloadCoordinator::clear`](crate::reload::ReloadCoordinator::clear).
///
/// `E` is the reloader's own error type.
#[derive(Debug, thiserror::Error)]
pub enum ClearError<E> {
    /// The unload section could not be opened.
    #[error(transparent)]
    Interlock(#[from] InterlockError),
    /// Reloading is disabled by configuration.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    /// The reloader failed for any other reason.
    #[error(transparent)]
    Reload(E),
}

impl<E> ClearError<E> {
    /// Returns the reloader error, if that is what this is.
    pub fn into_reload(self) -> Option<E> {
        match self {
            Self::Reload(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true for the fatal configuration case.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
