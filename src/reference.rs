//! Turning references into the devices they stand for.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;

use crate::errors::Error;
use crate::message::Serial;
use crate::runtime::BoxFuture;
use crate::session::Session;

type Result<T> = std::result::Result<T, Error>;

/// Something that knows how to find a set of devices.
pub trait SpecialReference: Send + Sync + fmt::Debug {
    /// Find the devices this reference stands for.
    fn find<'a>(
        &'a self,
        session: &'a dyn Session,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<Serial>>>;

    /// The devices this reference expected that are not in `found`.
    fn missing(&self, found: &[Serial]) -> Vec<Serial>;

    /// Forget what was found so the next `find` looks again.
    fn reset(&self) {}
}

/// The devices a script is run against.
///
/// # Example
///
/// ```
/// use wiz_script_rs::{Reference, Serial};
///
/// assert!(matches!(Reference::from(""), Reference::All));
/// assert!(matches!(Reference::from("_"), Reference::All));
///
/// let Reference::Serials(serials) = Reference::from("d073d5000001,d073d5000002") else {
///     unreachable!()
/// };
/// assert_eq!(serials[1], Serial::new("d073d5000002"));
/// ```
#[derive(Debug, Clone)]
pub enum Reference {
    /// Every device discovery can find.
    All,
    /// Exactly these devices.
    Serials(Vec<Serial>),
    /// Devices chosen by a custom resolver.
    Special(Arc<dyn SpecialReference>),
}

impl Reference {
    pub fn special(reference: impl SpecialReference + 'static) -> Self {
        Reference::Special(Arc::new(reference))
    }

    /// The resolver for this reference.
    pub fn resolver(&self) -> Arc<dyn SpecialReference> {
        match self {
            Reference::All => Arc::new(FoundSerials::new()),
            Reference::Serials(serials) => Arc::new(HardCodedSerials::new(serials.clone())),
            Reference::Special(special) => Arc::clone(special),
        }
    }

    /// Reset the resolver behind this reference, if it keeps state.
    pub fn reset(&self) {
        if let Reference::Special(special) = self {
            special.reset();
        }
    }
}

impl From<&str> for Reference {
    fn from(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == "_" {
            return Reference::All;
        }
        Reference::Serials(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Serial::new)
                .collect(),
        )
    }
}

impl From<Serial> for Reference {
    fn from(serial: Serial) -> Self {
        Reference::Serials(vec![serial])
    }
}

impl From<Vec<Serial>> for Reference {
    fn from(serials: Vec<Serial>) -> Self {
        Reference::Serials(serials)
    }
}

impl From<Vec<&str>> for Reference {
    fn from(serials: Vec<&str>) -> Self {
        Reference::Serials(serials.into_iter().map(Serial::new).collect())
    }
}

/// Every device discovery finds. Never reports anything missing.
#[derive(Debug, Default)]
pub struct FoundSerials {
    found: Mutex<Option<Vec<Serial>>>,
}

impl FoundSerials {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpecialReference for FoundSerials {
    fn find<'a>(
        &'a self,
        session: &'a dyn Session,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<Serial>>> {
        Box::pin(async move {
            if let Some(found) = self.found.lock().unwrap().clone() {
                return Ok(found);
            }
            let found = session.discover(None, timeout).await?;
            *self.found.lock().unwrap() = Some(found.clone());
            Ok(found)
        })
    }

    fn missing(&self, _found: &[Serial]) -> Vec<Serial> {
        Vec::new()
    }

    fn reset(&self) {
        self.found.lock().unwrap().take();
    }
}

/// A fixed list of devices. Any of them discovery can't find is missing.
#[derive(Debug)]
pub struct HardCodedSerials {
    wanted: Vec<Serial>,
    found: Mutex<Option<Vec<Serial>>>,
}

impl HardCodedSerials {
    pub fn new(wanted: Vec<Serial>) -> Self {
        HardCodedSerials {
            wanted,
            found: Mutex::new(None),
        }
    }
}

impl SpecialReference for HardCodedSerials {
    fn find<'a>(
        &'a self,
        session: &'a dyn Session,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<Serial>>> {
        Box::pin(async move {
            if let Some(found) = self.found.lock().unwrap().clone() {
                return Ok(found);
            }
            let discovered = session.discover(Some(self.wanted.as_slice()), timeout).await?;
            let found: Vec<Serial> = self
                .wanted
                .iter()
                .filter(|serial| discovered.contains(serial))
                .cloned()
                .collect();
            *self.found.lock().unwrap() = Some(found.clone());
            Ok(found)
        })
    }

    fn missing(&self, found: &[Serial]) -> Vec<Serial> {
        self.wanted
            .iter()
            .filter(|serial| !found.contains(serial))
            .cloned()
            .collect()
    }

    fn reset(&self) {
        self.found.lock().unwrap().take();
    }
}

/// Resolve `reference` into the devices that were found and those that weren't.
pub async fn find_serials(
    reference: &Reference,
    session: &dyn Session,
    timeout: Duration,
) -> Result<(Vec<Serial>, Vec<Serial>)> {
    let resolver = reference.resolver();
    let found = resolver.find(session, timeout).await?;
    let missing = resolver.missing(&found);
    debug!(
        "Resolved {:?}: found {:?}, missing {:?}",
        reference, found, missing
    );
    Ok((found, missing))
}
