//! Error primitives shared by every evmstack crate.
//!
//! Component boundaries use typed `snafu` enums. Everything above them (unit hooks, the operator binary) deals in
//! [`GenericError`], which carries a chain of context messages on top of the typed source.
#![deny(missing_docs)]

use std::fmt::Display;

/// Catch-all error type used outside of typed component boundaries.
pub type GenericError = anyhow::Error;

/// Builds a [`GenericError`] from a literal, a format string with arguments, or an existing error value.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod sealed {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Attaches human-readable context to a failed result.
///
/// `snafu::ResultExt` also provides a `context` method, so these are named differently to let both traits be imported
/// in the same module.
pub trait ErrorContext<T, E>: sealed::Sealed {
    /// Wraps the error with the given context message.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error with a context message built only when the result is an error.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        anyhow::Context::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        anyhow::Context::with_context(self, f)
    }
}

/// Finds the first error of type `E` anywhere in the chain of `error`.
///
/// Context layers added through [`ErrorContext`] hide the typed error underneath; this walks past them so callers can
/// still branch on a specific failure, such as the container runtime being unreachable.
pub fn find_in_chain<E>(error: &GenericError) -> Option<&E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    error.chain().find_map(|cause| cause.downcast_ref::<E>())
}

#[cfg(test)]
mod tests {
    use std::fmt;

    use super::*;

    #[derive(Debug)]
    struct Unreachable;

    impl fmt::Display for Unreachable {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "runtime unreachable")
        }
    }

    impl std::error::Error for Unreachable {}

    #[test]
    fn finds_typed_error_below_context() {
        let result: Result<(), Unreachable> = Err(Unreachable);
        let error = result
            .error_context("Failed to list containers.")
            .error_context("Failed to clean stack.")
            .unwrap_err();

        assert!(find_in_chain::<Unreachable>(&error).is_some());
        assert!(find_in_chain::<std::io::Error>(&error).is_none());
    }

    #[test]
    fn lazy_context_is_not_built_on_success() {
        let result: Result<u8, Unreachable> = Ok(7);
        let value = result
            .with_error_context(|| -> String { panic!("context built for a successful result") })
            .unwrap();
        assert_eq!(value, 7);
    }
}
