//! Error handling for the register manager
//!
//! Broken allocator invariants are programming defects in the code generator
//! driving the register manager. They are never reported as ordinary errors:
//! `ice!` and `ice_assert!` panic with a recognizable prefix, and `guard`
//! turns such a panic back into a `CompilerError` at the method boundary so
//! the caller can discard the half-built method.

use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Prefix carried by every fatal register allocator message
pub const ICE_PREFIX: &str = "internal register allocator error";

/// Main error type for the register manager and its driver
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompilerError {
    #[error("Internal compiler error: {message}")]
    InternalError { message: String },

    #[error("Method `{method}` left the register manager inconsistent: {}", problems.join("; "))]
    InconsistentState {
        method: String,
        problems: Vec<String>,
    },

    #[error("IO error: {message}")]
    IoError { message: String },
}

/// Abort the current method with an internal allocator error.
#[macro_export]
macro_rules! ice {
    ($($arg:tt)*) => {
        panic!("{}: {}", $crate::ICE_PREFIX, format_args!($($arg)*))
    };
}

/// Check an allocator invariant, aborting the current method if it does not hold.
#[macro_export]
macro_rules! ice_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::ice!($($arg)*);
        }
    };
}

/// Run one method's worth of register management, converting a fatal
/// allocator failure into `CompilerError::InternalError`.
///
/// Panics that did not come from `ice!` are not ours to swallow and are
/// resumed unchanged.
pub fn guard<R>(f: impl FnOnce() -> R) -> Result<R, CompilerError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => Ok(result),
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else {
                panic::resume_unwind(payload)
            };

            match message.strip_prefix(ICE_PREFIX) {
                Some(rest) => Err(CompilerError::InternalError {
                    message: rest.trim_start_matches(':').trim().to_string(),
                }),
                None => panic::resume_unwind(Box::new(message)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_guard_passes_result_through() {
        assert_eq!(guard(|| 42), Ok(42));
    }

    #[test]
    fn test_guard_catches_ice() {
        let result: Result<(), _> = guard(|| ice!("no register for {}", "v1"));
        assert_eq!(
            result,
            Err(CompilerError::InternalError {
                message: "no register for v1".to_string()
            })
        );
    }

    #[test]
    fn test_ice_assert_holds() {
        let result = guard(|| {
            ice_assert!(1 + 1 == 2, "arithmetic is broken");
            "ok"
        });
        assert_eq!(result, Ok("ok"));
    }

    #[test]
    #[should_panic(expected = "unrelated failure")]
    fn test_guard_resumes_foreign_panics() {
        let _ = guard(|| panic!("unrelated failure"));
    }

    #[test]
    fn test_inconsistent_state_message() {
        let err = CompilerError::InconsistentState {
            method: "main".to_string(),
            problems: vec!["r0 still bound".to_string(), "1 temp in use".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Method `main` left the register manager inconsistent: r0 still bound; 1 temp in use"
        );
    }
}
