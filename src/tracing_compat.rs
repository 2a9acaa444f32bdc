//! Logging macros that compile away when `tracing-integration` is disabled.
//!
//! Library code logs through `crate::tracing_compat::{trace, debug, ...}` rather
//! than `tracing` directly, so the crate builds without the dependency.

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    #[doc(hidden)]
    #[macro_export]
    macro_rules! __interlock_noop_log {
        ($($arg:tt)*) => {{}};
    }

    pub use crate::__interlock_noop_log as debug;
    pub use crate::__interlock_noop_log as error;
    pub use crate::__interlock_noop_log as info;
    pub use crate::__interlock_noop_log as trace;
    pub use crate::__interlock_noop_log as warn;
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::{debug, error, info, trace, warn};
