//! Passive bookkeeping shared by running and unloading sections.
//!
//! - [`TrackedClasses`]: identifiers of dynamically loaded entities, recorded
//!   while code runs and dropped in bulk by an unload section.
//! - [`EagerLoadPaths`]: directories loaded up front; fixed at startup.
//! - [`AutoloadPaths`]: ordered roots searched for a source file.
//!
//! None of these coordinate with the [`Interlock`](crate::Interlock). The path
//! sets are immutable after construction, and clearing the tracked set demands
//! an unload section as proof that no running section can observe it. The
//! tracked set is guarded by one interlock: either the one named in
//! [`TrackedClasses::guarded_by`] or the one behind the first section that
//! clears it. A section from any other interlock is rejected.

use crate::sync::{ExclusiveSection, Interlock, SectionKind};
use crate::tracing_compat::{debug, trace};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

/// Answers "which file backs this relative path?".
pub trait FileSearch {
    /// Returns the first existing file for `relpath`, or `None`.
    fn search_for_file(&self, relpath: &str) -> Option<PathBuf>;
}

/// Answers "is this path loaded eagerly?".
pub trait EagerLoadMembership {
    /// Returns true if `path` is a configured eager-load path.
    fn is_eager_load(&self, path: &Path) -> bool;
}

/// Identifiers of dynamically loaded entities awaiting invalidation.
#[derive(Debug, Default)]
pub struct TrackedClasses {
    ids: Mutex<HashSet<String>>,
    // Id of the interlock whose unload sections may clear the set.
    guard: Mutex<Option<u64>>,
}

impl TrackedClasses {
    /// Creates an empty set, bound to the first interlock that clears it.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty set that only `interlock`'s unload sections may clear.
    #[must_use]
    pub fn guarded_by(interlock: &Interlock) -> Self {
        Self {
            ids: Mutex::default(),
            guard: Mutex::new(Some(interlock.id())),
        }
    }

    /// Records `id`. Returns false if it was already tracked.
    pub fn track(&self, id: impl Into<String>) -> bool {
        let id = id.into();
        trace!(id = %id, "tracking loaded entity");
        self.ids.lock().insert(id)
    }

    /// Returns true if `id` is tracked.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.lock().contains(id)
    }

    /// Number of tracked identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    /// Returns the tracked identifiers in sorted order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ids.lock().iter().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Forgets every tracked identifier and returns how many there were.
    ///
    /// # Panics
    ///
    /// Panics if `section` is a load section (clearing is part of unloading),
    /// or if it was opened on an interlock other than the one guarding the set.
    pub fn clear(&self, section: &ExclusiveSection<'_>) -> usize {
        assert_eq!(
            section.kind(),
            SectionKind::Unload,
            "tracked classes may only be cleared inside an unload section"
        );
        let guard = *self.guard.lock().get_or_insert(section.interlock_id());
        assert_eq!(
            guard,
            section.interlock_id(),
            "tracked classes cleared through an unload section of another interlock"
        );
        let mut ids = self.ids.lock();
        let cleared = ids.len();
        ids.clear();
        drop(ids);
        debug!(cleared, "tracked classes cleared");
        cleared
    }
}

/// Directories whose contents are loaded up front. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EagerLoadPaths {
    paths: BTreeSet<PathBuf>,
}

impl EagerLoadPaths {
    /// Builds the set from configured paths.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if `path` is one of the configured eager-load paths.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    /// Number of configured paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Returns true if no path is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Iterates the paths in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }
}

impl EagerLoadMembership for EagerLoadPaths {
    fn is_eager_load(&self, path: &Path) -> bool {
        self.contains(path)
    }
}

/// Ordered autoload roots plus the source extension used when searching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoloadPaths {
    roots: Vec<PathBuf>,
    once_roots: Vec<PathBuf>,
    extension: String,
}

impl AutoloadPaths {
    /// Creates a search list. `extension` is given without the leading dot.
    pub fn new<I, P>(roots: I, extension: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
            once_roots: Vec::new(),
            extension: extension.into(),
        }
    }

    /// Sets the roots whose code is loaded once and never reloaded.
    #[must_use]
    pub fn with_once_roots<I, P>(mut self, once_roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.once_roots = once_roots.into_iter().map(Into::into).collect();
        self
    }

    /// Autoload roots in search order.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Roots loaded only once.
    #[must_use]
    pub fn once_roots(&self) -> &[PathBuf] {
        &self.once_roots
    }

    /// Source extension, without the dot.
    #[must_use]
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Returns true if `path` lives under an autoload root that is not an
    /// autoload-once root, i.e. its code is dropped by a reload.
    #[must_use]
    pub fn is_reloadable(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
            && !self.once_roots.iter().any(|root| path.starts_with(root))
    }

    fn with_extension(&self, relpath: &str) -> String {
        let suffix = format!(".{}", self.extension);
        if relpath.ends_with(&suffix) {
            relpath.to_owned()
        } else {
            format!("{relpath}{suffix}")
        }
    }
}

impl FileSearch for AutoloadPaths {
    fn search_for_file(&self, relpath: &str) -> Option<PathBuf> {
        let relpath = self.with_extension(relpath);
        let found = self
            .roots
            .iter()
            .map(|root| root.join(&relpath))
            .find(|candidate| candidate.is_file());
        trace!(relpath = %relpath, found = ?found, "searched autoload paths");
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use crate::{Cx, Interlock};
    use std::fs;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn tracked_classes_clear_inside_unload() {
        init_test("tracked_classes_clear_inside_unload");
        let interlock = Interlock::new();
        let tracked = TrackedClasses::new();
        assert!(tracked.track("Widget"));
        assert!(tracked.track("Gadget"));
        assert!(!tracked.track("Widget"), "duplicate ignored");
        assert_eq!(tracked.snapshot(), ["Gadget", "Widget"]);

        let section = interlock.enter_unload(&Cx::for_testing()).expect("unload");
        let cleared = tracked.clear(&section);
        crate::assert_with_log!(cleared == 2, "cleared count", 2usize, cleared);
        assert!(tracked.is_empty());
        assert!(!tracked.contains("Widget"));
        crate::test_complete!("tracked_classes_clear_inside_unload");
    }

    #[test]
    #[should_panic(expected = "only be cleared inside an unload section")]
    fn tracked_classes_refuse_load_section() {
        let interlock = Interlock::new();
        let tracked = TrackedClasses::new();
        let section = interlock.enter_load(&Cx::for_testing()).expect("load");
        tracked.clear(&section);
    }

    #[test]
    #[should_panic(expected = "unload section of another interlock")]
    fn tracked_classes_refuse_foreign_interlock() {
        let guarding = Interlock::new();
        let other = Interlock::new();
        let tracked = TrackedClasses::guarded_by(&guarding);
        tracked.track("Widget");
        let section = other.enter_unload(&Cx::for_testing()).expect("unload");
        tracked.clear(&section);
    }

    #[test]
    fn tracked_classes_bind_to_first_clearing_interlock() {
        init_test("tracked_classes_bind_to_first_clearing_interlock");
        let first = Interlock::new();
        let second = Interlock::new();
        let tracked = TrackedClasses::new();
        let cx = Cx::for_testing();

        tracked.track("Widget");
        let section = first.enter_unload(&cx).expect("unload");
        assert_eq!(tracked.clear(&section), 1);
        drop(section);

        tracked.track("Gadget");
        let section = second.enter_unload(&cx).expect("unload");
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tracked.clear(&section)
        }));
        drop(section);
        crate::assert_with_log!(
            outcome.is_err(),
            "second interlock rejected",
            true,
            outcome.is_err()
        );
        assert!(tracked.contains("Gadget"));

        let section = first.enter_unload(&cx).expect("unload");
        assert_eq!(tracked.clear(&section), 1);
        crate::test_complete!("tracked_classes_bind_to_first_clearing_interlock");
    }

    #[test]
    fn eager_load_membership() {
        let eager = EagerLoadPaths::new(["/app/models", "/app/lib"]);
        assert!(eager.is_eager_load(Path::new("/app/models")));
        assert!(!eager.is_eager_load(Path::new("/app/models/user")));
        assert!(!eager.is_eager_load(Path::new("/app")));
        assert_eq!(eager.len(), 2);
        assert_eq!(
            eager.iter().collect::<Vec<_>>(),
            [Path::new("/app/lib"), Path::new("/app/models")]
        );
    }

    #[test]
    fn search_for_file_returns_first_root_with_file() {
        init_test("search_for_file_returns_first_root_with_file");
        let first = tempfile::tempdir().expect("tempdir");
        let second = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(second.path().join("admin")).expect("mkdir");
        fs::write(second.path().join("admin/user.rb"), "").expect("write");

        let paths = AutoloadPaths::new([first.path(), second.path()], "rb");
        let expected = second.path().join("admin/user.rb");
        assert_eq!(paths.search_for_file("admin/user"), Some(expected.clone()));
        assert_eq!(paths.search_for_file("admin/user.rb"), Some(expected));

        // Shadowed by an earlier root once it exists there too.
        fs::create_dir_all(first.path().join("admin")).expect("mkdir");
        fs::write(first.path().join("admin/user.rb"), "").expect("write");
        assert_eq!(
            paths.search_for_file("admin/user"),
            Some(first.path().join("admin/user.rb"))
        );
        crate::test_complete!("search_for_file_returns_first_root_with_file");
    }

    #[test]
    fn search_for_file_ignores_directories_and_missing_files() {
        let root = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(root.path().join("widget.rb")).expect("mkdir");

        let paths = AutoloadPaths::new([root.path()], "rb");
        assert_eq!(paths.search_for_file("widget"), None);
        assert_eq!(paths.search_for_file("missing"), None);
        assert_eq!(AutoloadPaths::new(Vec::<PathBuf>::new(), "rb").search_for_file("x"), None);
    }

    #[test]
    fn once_roots_are_not_reloadable() {
        let paths = AutoloadPaths::new(["/app/models", "/app/vendor"], "rb")
            .with_once_roots(["/app/vendor"]);
        assert!(paths.is_reloadable(Path::new("/app/models/user.rb")));
        assert!(!paths.is_reloadable(Path::new("/app/vendor/gem.rb")));
        assert!(!paths.is_reloadable(Path::new("/elsewhere/thing.rb")));
        assert_eq!(paths.once_roots(), [PathBuf::from("/app/vendor")]);
        assert_eq!(paths.extension(), "rb");
    }
}
