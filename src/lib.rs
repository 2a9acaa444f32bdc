//! Coordinating running, loading and unloading of reloadable code.
//!
//! Threads that execute application code hold a shared *running* section.
//! Loading new definitions, or unloading stale ones, requires an exclusive
//! section that waits until every running section has finished and keeps new
//! ones out until it is released.
//!
//! # Core types
//!
//! - [`Interlock`]: the shared/exclusive primitive with FIFO handoff
//! - [`Cx`]: cancellation context threaded through every blocking acquisition
//! - [`ReloadCoordinator`]: clears [`TrackedClasses`] and reloads inside one
//!   unload section
//! - [`Dependencies`]: facade bundling the above with the configured search
//!   paths
//!
//! # Example
//!
//! ```
//! use interlock::{Cx, Dependencies, DependenciesConfig, ReloadError};
//! use std::convert::Infallible;
//!
//! let deps = Dependencies::new(&DependenciesConfig::default(), || {
//!     Ok::<(), ReloadError<Infallible>>(())
//! })?;
//! let cx = Cx::new();
//!
//! let answer = deps.run_interlock(&cx, || 42)?;
//! assert_eq!(answer, 42);
//!
//! deps.track("Widget");
//! deps.clear(&cx)?;
//! assert!(deps.tracked_classes().is_empty());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
pub mod cx;
pub mod dependencies;
pub mod error;
pub mod registry;
pub mod reload;
pub mod sync;
#[doc(hidden)]
pub mod tracing_compat;

#[cfg(test)]
mod test_utils;

pub use config::{ConfigError, ConfigLoader, DependenciesConfig};
pub use cx::Cx;
pub use dependencies::Dependencies;
pub use error::{ClearError, ConfigurationError, InterlockError};
pub use registry::{
    AutoloadPaths, EagerLoadMembership, EagerLoadPaths, FileSearch, TrackedClasses,
};
pub use reload::{GatedReloader, ReloadCoordinator, ReloadError, Reloader};
pub use sync::{ExclusiveSection, Interlock, InterlockSnapshot, RunSection, SectionKind};
