//! Sinks for errors that should not abort a run.

use std::fmt;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::errors::{self, Error};

/// Where a run reports failures.
///
/// A run given an error catcher never fails because of a single message; the
/// failures are handed to the catcher instead and the run carries on.
/// Cancellation is never reported.
///
/// # Example
///
/// ```
/// use wiz_script_rs::{Error, ErrorCatcher};
///
/// let catcher = ErrorCatcher::collection();
/// catcher.add(Error::custom("one"));
/// catcher.add(Error::custom("one"));
/// catcher.add(Error::Cancelled);
/// assert_eq!(catcher.errors(), vec![Error::custom("one")]);
/// ```
#[derive(Clone)]
pub enum ErrorCatcher {
    /// Called once for every error.
    Callback(Arc<dyn Fn(Error) + Send + Sync>),
    /// Collects distinct errors.
    Collection(Arc<Mutex<Vec<Error>>>),
}

impl ErrorCatcher {
    pub fn callback(callback: impl Fn(Error) + Send + Sync + 'static) -> Self {
        ErrorCatcher::Callback(Arc::new(callback))
    }

    pub fn collection() -> Self {
        ErrorCatcher::Collection(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn add(&self, err: Error) {
        if err.is_cancelled() {
            return;
        }
        match self {
            ErrorCatcher::Callback(callback) => callback(err),
            ErrorCatcher::Collection(errors) => {
                let mut errors = errors.lock().unwrap();
                if !errors.contains(&err) {
                    errors.push(err);
                }
            }
        }
    }

    /// The collected errors. Always empty for a callback.
    pub fn errors(&self) -> Vec<Error> {
        match self {
            ErrorCatcher::Callback(_) => Vec::new(),
            ErrorCatcher::Collection(errors) => errors.lock().unwrap().clone(),
        }
    }
}

impl fmt::Debug for ErrorCatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCatcher::Callback(_) => f.write_str("ErrorCatcher::Callback"),
            ErrorCatcher::Collection(errors) => f
                .debug_tuple("ErrorCatcher::Collection")
                .field(&errors.lock().unwrap().len())
                .finish(),
        }
    }
}

/// The errors of one run.
///
/// Uses the caller's catcher when there is one. Otherwise errors are kept
/// locally so they can be raised together once the run is over.
pub(crate) struct ErrorScope {
    catcher: ErrorCatcher,
    raise: bool,
}

impl ErrorScope {
    pub(crate) fn new(supplied: Option<&ErrorCatcher>) -> Self {
        match supplied {
            Some(catcher) => ErrorScope {
                catcher: catcher.clone(),
                raise: false,
            },
            None => ErrorScope {
                catcher: ErrorCatcher::collection(),
                raise: true,
            },
        }
    }

    pub(crate) fn catcher(&self) -> &ErrorCatcher {
        &self.catcher
    }

    /// The error to raise at the end of the run, if any.
    pub(crate) fn into_error(self) -> Option<Error> {
        if !self.raise {
            return None;
        }
        let errors = errors::dedupe(self.catcher.errors());
        if errors.is_empty() {
            None
        } else {
            debug!("Raising {} error(s) at the end of a run", errors.len());
            Some(Error::RunErrors(errors))
        }
    }
}
