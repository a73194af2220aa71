//! Error types for engine operations.
//!
//! All errors implement `std::error::Error` via the `thiserror` crate. Two
//! families matter to callers:
//!
//! - **Structural errors** (cycles, duplicate args, missing edges, negative
//!   reference counts, failed validation or init) are returned synchronously
//!   from [`Txn::commit`](crate::txn::Txn::commit). They are local and
//!   recoverable: the engine keeps running and the caller may retry or
//!   [`reverse`](crate::txn::Txn::reverse) the applied prefix.
//! - **Runtime errors** (a function's stream failing, a function exiting
//!   before it ever produced a value, a recovered panic) surface once through
//!   the engine's event stream and are fatal to the run: the engine cancels
//!   itself, drains, and `run` returns the error.
//!
//! Cancellation is never reported as an error: shutting the engine down
//! closes the event stream and `run` returns `Ok(())`.

use streamdag_graph::DagError;
use thiserror::Error;

use crate::value::ValueError;

/// Convenience result type using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all engine operations.
///
/// The enum is `Clone` so a fatal error can be both forwarded on the event
/// stream and returned from [`Engine::run`](crate::engine::Engine::run).
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Graph store error: cycle, self-loop, duplicate argument name or a
    /// dangling edge handle. Structural.
    #[error("graph error: {0}")]
    Dag(#[from] DagError),

    /// Value comparison error (kind or content mismatch).
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// A function signature declares the same field name twice. Structural.
    #[error("duplicate signature field '{0}'")]
    DuplicateSigField(String),

    /// `Func::validate` rejected the function's parameters. Structural; the
    /// vertex is not added.
    #[error("func '{func}' failed validation: {error}")]
    Validate {
        /// Name of the function that failed validation.
        func: String,
        /// Error message from validation.
        error: String,
    },

    /// `Func::init` failed. Structural; the engine state is untouched.
    #[error("func '{func}' failed to initialize: {error}")]
    Init {
        /// Name of the function that failed to initialize.
        func: String,
        /// Error message from init.
        error: String,
    },

    /// A function's `stream` ran without `init` having stored its handles.
    #[error("func '{func}' was not initialized before streaming")]
    Uninitialized {
        /// Name of the function.
        func: String,
    },

    /// Synthetic runtime error: a function's stream exited normally without
    /// ever emitting a value.
    #[error("func {func} stopped before it was loaded")]
    NotLoaded {
        /// Name of the function that stopped early.
        func: String,
    },

    /// A reference count was asked to drop below zero. This is a caller
    /// bug (releasing a reference that was never taken) and is reported
    /// loudly rather than silently clamped.
    #[error("negative reference count for {entity}")]
    NegativeRefCount {
        /// Description of the vertex or edge argument involved.
        entity: String,
    },

    /// Two incoming edge arguments assign the same input field. Fatal: the
    /// graph wiring is inconsistent with itself.
    #[error("duplicate input field '{field}' for func '{func}'")]
    DuplicateInputField {
        /// Destination function.
        func: String,
        /// The doubly-assigned field.
        field: String,
    },

    /// An incoming edge argument does not name a signature field of the
    /// destination. Fatal.
    #[error("input field '{field}' is not in the signature of func '{func}'")]
    UnknownInputField {
        /// Destination function.
        func: String,
        /// The unknown field.
        field: String,
    },

    /// A panic recovered from a function stream or from the process loop,
    /// converted into a fatal runtime error.
    #[error("panic: {0}")]
    Panic(String),

    /// The engine is shutting down; the operation was abandoned.
    #[error("engine is shutting down")]
    Closing,

    /// `setup` has not been run yet.
    #[error("engine setup has not been run")]
    NotSetup,

    /// `run` was called twice on the same engine.
    #[error("engine is already running")]
    AlreadyRunning,

    /// The event stream has already been taken; it is single-consumer.
    #[error("event stream was already taken")]
    StreamTaken,

    /// Application-defined error, typically returned from a `Func::stream`
    /// implementation.
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// Create a validation error with function context.
    pub fn validate(func: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Validate {
            func: func.into(),
            error: error.into(),
        }
    }

    /// Create an init error with function context.
    pub fn init(func: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Init {
            func: func.into(),
            error: error.into(),
        }
    }

    /// Create an application-defined error.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_loaded_message() {
        let err = Error::NotLoaded {
            func: "f1".to_string(),
        };
        assert_eq!(format!("{}", err), "func f1 stopped before it was loaded");
    }

    #[test]
    fn test_dag_error_converts() {
        let err: Error = DagError::SelfLoop.into();
        assert!(matches!(err, Error::Dag(DagError::SelfLoop)));
    }
}
