use std::string::FromUtf8Error;
use std::sync::Arc;

use crate::message::{Method, Reply, Serial};

/// All error types that can occur while scripting Wiz lights.
///
/// Errors are cheap to clone so the same failure can be handed to an error
/// catcher and kept for an aggregate report. Two errors are equal when they
/// render the same message, which is also how aggregates de-duplicate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Failed to serialize data to JSON.
    #[error("failed to dump json: {0:?}")]
    JsonDump(Arc<serde_json::Error>),

    /// Failed to deserialize JSON data.
    #[error("failed to load json: {0:?}")]
    JsonLoad(Arc<serde_json::Error>),

    /// A network socket operation failed while communicating with a bulb.
    #[error("socket {action} error: {err:?}")]
    Socket {
        action: String,
        err: Arc<std::io::Error>,
    },

    /// The UDP response from a bulb contained invalid UTF-8.
    #[error("utf8 decoding error: {0:?}")]
    Utf8Decode(FromUtf8Error),

    /// A string could not be used as a device serial.
    #[error("invalid serial {0:?}")]
    InvalidSerial(String),

    /// A device in a reference could not be found on the network.
    #[error("couldn't find a device: {serial}")]
    FailedToFindDevice { serial: Serial },

    /// A device never answered a message.
    #[error("timed out waiting for a reply to {method} from {serial}")]
    TimedOut { serial: Serial, method: Method },

    /// A device answered a message with an error.
    #[error("{serial} rejected {method}: {reason}")]
    Rejected {
        serial: Serial,
        method: Method,
        reason: String,
    },

    /// Every distinct failure recorded during a run that had no error catcher.
    #[error("{}", describe(.0))]
    RunErrors(Vec<Error>),

    /// A run that failed after producing some results.
    #[error(
        "run failed after {} result(s): {}",
        .results.len(),
        describe(.errors)
    )]
    BadRunWithResults {
        results: Vec<Reply>,
        errors: Vec<Error>,
    },

    /// Raised from a repeater's end of loop hook to stop the loop.
    #[error("repeater stop requested")]
    StopLoop,

    /// The work was cancelled before it completed.
    #[error("cancelled")]
    Cancelled,

    /// An error raised by caller supplied code.
    #[error("{0}")]
    Custom(Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Create a new socket error
    pub fn socket(action: &str, err: std::io::Error) -> Self {
        Error::Socket {
            action: action.to_string(),
            err: Arc::new(err),
        }
    }

    pub fn json_dump(err: serde_json::Error) -> Self {
        Error::JsonDump(Arc::new(err))
    }

    pub fn json_load(err: serde_json::Error) -> Self {
        Error::JsonLoad(Arc::new(err))
    }

    pub fn failed_to_find(serial: &Serial) -> Self {
        Error::FailedToFindDevice {
            serial: serial.clone(),
        }
    }

    pub fn timed_out(serial: &Serial, method: Method) -> Self {
        Error::TimedOut {
            serial: serial.clone(),
            method,
        }
    }

    pub fn rejected(serial: &Serial, method: Method, reason: &str) -> Self {
        Error::Rejected {
            serial: serial.clone(),
            method,
            reason: reason.to_string(),
        }
    }

    /// Wrap an error from caller supplied code.
    ///
    /// ```
    /// use wiz_script_rs::Error;
    ///
    /// assert_eq!(Error::custom("bad hook").to_string(), "bad hook");
    /// ```
    pub fn custom(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Custom(Arc::from(err.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// The individual failures this error stands for.
    pub fn errors(&self) -> &[Error] {
        match self {
            Error::RunErrors(errors) | Error::BadRunWithResults { errors, .. } => errors,
            other => std::slice::from_ref(other),
        }
    }

    /// Combine failures into one error.
    ///
    /// Duplicates are dropped. No failures means no error, a single failure is
    /// returned as is and several become [`Error::RunErrors`].
    pub fn merge(errors: impl IntoIterator<Item = Error>) -> Option<Error> {
        let mut errors = dedupe(errors);
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::RunErrors(errors)),
        }
    }
}

/// Drop repeated errors, keeping the first occurrence of each.
pub(crate) fn dedupe(errors: impl IntoIterator<Item = Error>) -> Vec<Error> {
    let mut unique: Vec<Error> = Vec::new();
    for error in errors {
        if !unique.contains(&error) {
            unique.push(error);
        }
    }
    unique
}

fn describe(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}
