//! Shared utilities

pub mod error;

pub use error::{
    ErrorKind, FailureEvent, FailureObserver, FailureReporter, RecorderError, RecorderResult,
};
