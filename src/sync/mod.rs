//! Synchronization primitives for reloadable code.
//!
//! # Primitives
//!
//! - [`Interlock`]: shared running sections, exclusive load/unload sections
//!
//! # Two-Phase Pattern
//!
//! Acquisition follows a two-phase pattern:
//!
//! - **Phase 1 (Wait)**: wait for the section to become available. Cancelling
//!   the [`Cx`](crate::Cx) during the wait is a clean abort; nothing is held.
//! - **Phase 2 (Hold)**: hold the section guard. Dropping it releases the
//!   section, including when the holder unwinds.

mod interlock;

pub use interlock::{ExclusiveSection, Interlock, InterlockSnapshot, RunSection, SectionKind};
