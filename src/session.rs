//! The boundary between the scripting engine and a transport.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_lock::{Semaphore, SemaphoreGuardArc};

use crate::catcher::ErrorCatcher;
use crate::errors::Error;
use crate::handle::LifetimeHandle;
use crate::message::{Message, Reply, Serial};
use crate::runtime::BoxFuture;

/// A connection to the devices a script talks to.
///
/// One session is shared by every run that uses it. Cancelling its
/// [`stop_handle`](Session::stop_handle) must abort every discovery and send
/// still in flight, which then return [`Error::Cancelled`].
pub trait Session: Send + Sync {
    /// Cancelled when the session is shutting down.
    fn stop_handle(&self) -> &LifetimeHandle;

    /// Find devices on the network.
    ///
    /// With `wanted`, discovery may stop as soon as all of those are found.
    fn discover<'a>(
        &'a self,
        wanted: Option<&'a [Serial]>,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Vec<Serial>, Error>>;

    /// Send one message to one device and wait for its reply.
    fn send<'a>(
        &'a self,
        serial: &'a Serial,
        message: &'a Message,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<Reply, Error>>;
}

/// Caps how many messages a run has waiting for a reply at once.
///
/// Clones share their permits, so every batch of a run draws from the same
/// pool.
#[derive(Clone)]
pub struct SendLimit {
    permits: usize,
    semaphore: Arc<Semaphore>,
}

impl SendLimit {
    /// A limit of `permits` messages in flight. At least one is always allowed.
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        SendLimit {
            permits,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    pub(crate) async fn acquire(&self) -> SemaphoreGuardArc {
        self.semaphore.acquire_arc().await
    }
}

impl fmt::Debug for SendLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendLimit")
            .field("permits", &self.permits)
            .finish()
    }
}

/// Options that apply to one run of a script.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Where failures go. Without one, a run raises them together at the end.
    pub error_catcher: Option<ErrorCatcher>,
    /// How long to wait for a reply to each message.
    pub message_timeout: Duration,
    /// How long to spend resolving references into devices.
    pub find_timeout: Duration,
    /// Send messages without a reference or target to every device.
    pub broadcast: bool,
    /// How many messages may wait for a reply at once. `None` removes the cap.
    pub limit: Option<SendLimit>,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            error_catcher: None,
            message_timeout: Duration::from_secs(10),
            find_timeout: Duration::from_secs(20),
            broadcast: false,
            limit: Some(SendLimit::new(30)),
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_catcher(mut self, catcher: ErrorCatcher) -> Self {
        self.error_catcher = Some(catcher);
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_find_timeout(mut self, timeout: Duration) -> Self {
        self.find_timeout = timeout;
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }

    /// Allow at most `limit` messages in flight, or any number with `None`.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit.map(SendLimit::new);
        self
    }
}
