//! Supporting utility types.
mod bytestr;
mod sizedstr;
mod latch;

pub use bytestr::ByteStr;
pub use sizedstr::SizedStr;
pub(crate) use latch::Latch;

/// Lock a std mutex, ignoring poisoning.
///
/// Engine state stays consistent under panic because every critical
/// section is a handful of field updates with no early exit.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Trace when `verbose` feature enabled.
macro_rules! verbose {
    ($($tt:tt)*) => {
        #[cfg(feature = "verbose")]
        tracing::trace!($($tt)*)
    };
}

/// Create and enter `Span` when `verbose` feature enabled.
macro_rules! span {
    ($($tt:tt)*) => {
        #[cfg(feature = "verbose")]
        let s = tracing::trace_span!($($tt)*);
        #[cfg(feature = "verbose")]
        let _s = s.enter();
    };
}

pub(crate) use verbose;
pub(crate) use span;
