//! Built-in providers.
//!
//! Each provider implements the [`Mailer`](crate::Mailer) trait. Real
//! network adapters live outside this crate and plug in the same way.
//!
//! | Provider | Feature Flag | Description |
//! |----------|-------------|-------------|
//! | [`LocalMailer`] | `local` | In-memory capture with scriptable failures |
//! | [`LoggerMailer`] | (none) | Logs messages without sending |

#[cfg(feature = "local")]
mod local;
#[cfg(feature = "local")]
pub use local::LocalMailer;

mod logger;
pub use logger::LoggerMailer;

use std::sync::Arc;

use crate::Mailer;

/// Built-in provider for an `EMAIL_PROVIDER`-style name.
///
/// Knows `logger`, `logger_full` and (with the `local` feature) `local`.
pub fn builtin(name: &str) -> Option<Arc<dyn Mailer>> {
    match name {
        "logger" => Some(Arc::new(LoggerMailer::new())),
        "logger_full" => Some(Arc::new(LoggerMailer::full())),
        #[cfg(feature = "local")]
        "local" => Some(Arc::new(LocalMailer::new())),
        _ => None,
    }
}
