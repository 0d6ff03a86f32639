/// Emits a trace-level event only when the `trace-more` feature is on.
///
/// Per-record tracing is too hot for production builds; the gate compiles
/// it out entirely.
#[cfg(feature = "trace-more")]
macro_rules! trace {
    ($($arg:tt)+) => (::tracing::trace!($($arg)+));
}
/// Emits a trace-level event only when the `trace-more` feature is on.
#[cfg(not(feature = "trace-more"))]
macro_rules! trace {
    ($($arg:tt)+) => {};
}
pub(crate) use trace;
