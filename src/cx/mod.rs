//! Explicit cancellation context.
//!
//! Every blocking acquisition takes a [`Cx`]. Nothing in this crate consults
//! ambient state to decide whether a wait should be abandoned.

#[allow(clippy::module_inception)]
mod cx;

pub use cx::Cx;
