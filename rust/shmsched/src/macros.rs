// Logging macros for shmsched.
//
// These macros forward to the tracing crate.

#![allow(unused_macro_rules)]

// Loop iterations, per-command decisions.
macro_rules! trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) }
}

// Lifecycle of commands and wake sources.
macro_rules! debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) }
}

// Region lifecycle: created, booted, terminated.
macro_rules! info {
    ($($arg:tt)*) => { ::tracing::info!($($arg)*) }
}

// Recoverable failures: fork retries, unknown children, lost wakeups.
macro_rules! warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) }
}

macro_rules! error {
    ($($arg:tt)*) => { ::tracing::error!($($arg)*) }
}

// Made available crate-wide via #[macro_use] in lib.rs
