//! The facade an application holds: one interlock, the tracked set, the search
//! paths and the reload coordinator, built from a validated configuration.

use crate::config::{ConfigError, DependenciesConfig};
use crate::cx::Cx;
use crate::error::{ClearError, InterlockError};
use crate::registry::{
    AutoloadPaths, EagerLoadMembership, EagerLoadPaths, FileSearch, TrackedClasses,
};
use crate::reload::{GatedReloader, ReloadCoordinator, Reloader};
use crate::sync::Interlock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Entry point for running, loading and unloading reloadable code.
///
/// The interlock is shared through an [`Arc`]; pass it to
/// [`with_interlock`](Self::with_interlock) to let several facades, or code
/// outside this crate, coordinate on the same interlock.
#[derive(Debug)]
pub struct Dependencies<R> {
    interlock: Arc<Interlock>,
    tracked: Arc<TrackedClasses>,
    autoload: AutoloadPaths,
    eager_load: EagerLoadPaths,
    coordinator: ReloadCoordinator<GatedReloader<R>>,
}

impl<R: Reloader> Dependencies<R> {
    /// Builds a facade with a fresh interlock.
    ///
    /// # Errors
    ///
    /// Returns the validation error if `config` is invalid.
    pub fn new(config: &DependenciesConfig, reloader: R) -> Result<Self, ConfigError> {
        Self::with_interlock(Arc::new(Interlock::new()), config, reloader)
    }

    /// Builds a facade around an existing interlock.
    ///
    /// # Errors
    ///
    /// Returns the validation error if `config` is invalid.
    pub fn with_interlock(
        interlock: Arc<Interlock>,
        config: &DependenciesConfig,
        reloader: R,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let tracked = Arc::new(TrackedClasses::guarded_by(&interlock));
        let autoload =
            AutoloadPaths::new(config.autoload_paths.iter().cloned(), config.extension.as_str())
                .with_once_roots(config.autoload_once_paths.iter().cloned());
        let eager_load = EagerLoadPaths::new(config.eager_load_paths.iter().cloned());
        let coordinator = ReloadCoordinator::new(
            Arc::clone(&interlock),
            Arc::clone(&tracked),
            GatedReloader::new(reloader, config.reloading_enabled),
        );
        Ok(Self {
            interlock,
            tracked,
            autoload,
            eager_load,
            coordinator,
        })
    }

    /// Runs `body` without interference from concurrent loads.
    ///
    /// # Errors
    ///
    /// See [`Interlock::run`].
    pub fn run_interlock<F, T>(&self, cx: &Cx, body: F) -> Result<T, InterlockError>
    where
        F: FnOnce() -> T,
    {
        self.interlock.run(cx, body)
    }

    /// Runs `body` while no other thread is inside any section.
    ///
    /// # Errors
    ///
    /// See [`Interlock::load`].
    pub fn load_interlock<F, T>(&self, cx: &Cx, body: F) -> Result<T, InterlockError>
    where
        F: FnOnce() -> T,
    {
        self.interlock.load(cx, body)
    }

    /// Runs `body` as an unload while no other thread is inside any section.
    ///
    /// # Errors
    ///
    /// See [`Interlock::unload`].
    pub fn unload_interlock<F, T>(&self, cx: &Cx, body: F) -> Result<T, InterlockError>
    where
        F: FnOnce() -> T,
    {
        self.interlock.unload(cx, body)
    }

    /// Drops tracked classes and reloads. See [`ReloadCoordinator::clear`].
    ///
    /// # Errors
    ///
    /// See [`ReloadCoordinator::clear`]. When reloading is disabled by
    /// configuration this is always [`ClearError::Configuration`].
    pub fn clear(&self, cx: &Cx) -> Result<(), ClearError<R::Error>> {
        self.coordinator.clear(cx)
    }

    /// Records a dynamically loaded entity for the next [`clear`](Self::clear).
    pub fn track(&self, id: impl Into<String>) -> bool {
        self.tracked.track(id)
    }

    /// Returns the first autoload root containing `relpath`.
    #[must_use]
    pub fn search_for_file(&self, relpath: &str) -> Option<PathBuf> {
        self.autoload.search_for_file(relpath)
    }

    /// Returns true if `path` is an eager-load path.
    #[must_use]
    pub fn is_eager_load(&self, path: &Path) -> bool {
        self.eager_load.is_eager_load(path)
    }

    /// Returns true if reloading is enabled by configuration.
    #[must_use]
    pub fn is_reloading_enabled(&self) -> bool {
        self.coordinator.reloader().is_enabled()
    }

    /// Number of successful clear cycles.
    #[must_use]
    pub fn reload_count(&self) -> u64 {
        self.coordinator.reload_count()
    }

    /// The shared interlock.
    #[must_use]
    pub fn interlock(&self) -> &Arc<Interlock> {
        &self.interlock
    }

    /// The tracked set emptied by [`clear`](Self::clear).
    #[must_use]
    pub fn tracked_classes(&self) -> &TrackedClasses {
        &self.tracked
    }

    /// Autoload roots and extension.
    #[must_use]
    pub fn autoload_paths(&self) -> &AutoloadPaths {
        &self.autoload
    }

    /// Eager-load paths.
    #[must_use]
    pub fn eager_load_paths(&self) -> &EagerLoadPaths {
        &self.eager_load
    }
}
