//! One-shot completion handles with parent to child cancellation.
//!
//! A [`CancellableHandle`] resolves exactly once, to a value, an error or
//! cancellation. Handles derived with [`CancellableHandle::child`] are cancelled
//! as soon as their parent resolves in any way. Resolving a child never touches
//! its parent.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use crate::errors::Error;

/// How a handle was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Succeeded(T),
    Failed(Error),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn into_result(self) -> Result<T, Error> {
        match self {
            Outcome::Succeeded(value) => Ok(value),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled => Err(Error::Cancelled),
        }
    }
}

type DoneCallback<T> = Box<dyn FnOnce(&Outcome<T>) + Send>;

struct State<T> {
    outcome: Option<Outcome<T>>,
    wakers: Vec<(u64, Waker)>,
    next_waiter: u64,
    callbacks: Vec<DoneCallback<T>>,
    children: Vec<Weak<dyn Terminal>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

/// A handle of any value type, seen only as something that can be cancelled.
pub(crate) trait Terminal: Send + Sync {
    fn cancel(&self) -> bool;
    fn is_done(&self) -> bool;
}

impl<T: Clone + Send + 'static> Shared<T> {
    fn resolve(&self, outcome: Outcome<T>) -> bool {
        let (wakers, callbacks, children) = {
            let mut state = self.state.lock().unwrap();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.children),
            )
        };

        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
        for (_, waker) in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }
}

impl<T: Clone + Send + 'static> Terminal for Shared<T> {
    fn cancel(&self) -> bool {
        self.resolve(Outcome::Cancelled)
    }

    fn is_done(&self) -> bool {
        self.state.lock().unwrap().outcome.is_some()
    }
}

/// A one-shot completion signal.
///
/// Clones share the same state, so any clone may resolve it and every clone
/// observes the result.
///
/// # Example
///
/// ```
/// use wiz_script_rs::{CancellableHandle, LifetimeHandle};
///
/// let parent = LifetimeHandle::new();
/// let child: CancellableHandle<u32> = parent.child();
///
/// parent.cancel();
/// assert!(child.is_cancelled());
///
/// // Resolving twice is a no-op.
/// assert!(!child.succeed(1));
/// ```
pub struct CancellableHandle<T> {
    shared: Arc<Shared<T>>,
}

/// A handle that only signals "this scope should stop now".
pub type LifetimeHandle = CancellableHandle<()>;

/// The handle a procedure receives for each batch it yields.
///
/// It resolves to `true` when every unit in the batch succeeded and to
/// `false` as soon as one of them fails.
pub type Completion = CancellableHandle<bool>;

impl<T> Clone for CancellableHandle<T> {
    fn clone(&self) -> Self {
        CancellableHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Default for CancellableHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> CancellableHandle<T> {
    pub fn new() -> Self {
        CancellableHandle {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    outcome: None,
                    wakers: Vec::new(),
                    next_waiter: 0,
                    callbacks: Vec::new(),
                    children: Vec::new(),
                }),
            }),
        }
    }

    /// Derive a handle that is cancelled when this one resolves.
    ///
    /// The child may carry a different value type. A child of a handle that
    /// already resolved starts out cancelled.
    pub fn child<U: Clone + Send + 'static>(&self) -> CancellableHandle<U> {
        let child = CancellableHandle::<U>::new();
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.outcome.is_none() {
                let weak: Weak<Shared<U>> = Arc::downgrade(&child.shared);
                state.children.retain(|c| c.strong_count() > 0);
                state.children.push(weak);
                return child;
            }
        }
        child.cancel();
        child
    }

    pub fn cancel(&self) -> bool {
        self.shared.resolve(Outcome::Cancelled)
    }

    pub fn fail(&self, err: Error) -> bool {
        self.shared.resolve(Outcome::Failed(err))
    }

    pub fn succeed(&self, value: T) -> bool {
        self.shared.resolve(Outcome::Succeeded(value))
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().unwrap().outcome.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.shared.state.lock().unwrap().outcome,
            Some(Outcome::Cancelled)
        )
    }

    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.shared.state.lock().unwrap().outcome.clone()
    }

    /// A future that resolves with the outcome once the handle is resolved.
    pub fn done(&self) -> Done<T> {
        Done {
            shared: Arc::clone(&self.shared),
            waiter_id: None,
        }
    }

    /// Wait for the handle, returning its value or the error it failed with.
    ///
    /// Cancellation is returned as [`Error::Cancelled`].
    pub async fn wait(&self) -> Result<T, Error> {
        self.done().await.into_result()
    }

    /// Run `callback` once the handle is resolved.
    ///
    /// Callbacks run synchronously on whichever thread resolves the handle, or
    /// straight away if it already is.
    pub fn add_done_callback(&self, callback: impl FnOnce(&Outcome<T>) + Send + 'static) {
        let outcome = {
            let mut state = self.shared.state.lock().unwrap();
            match state.outcome.clone() {
                Some(outcome) => outcome,
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }

    pub(crate) fn as_terminal(&self) -> Arc<dyn Terminal> {
        self.shared.clone()
    }
}

impl Completion {
    /// Wait for a batch to complete and report whether all of it succeeded.
    pub async fn succeeded(&self) -> bool {
        matches!(self.done().await, Outcome::Succeeded(true))
    }
}

impl<T: fmt::Debug> fmt::Debug for CancellableHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock().unwrap();
        f.debug_struct("CancellableHandle")
            .field("outcome", &state.outcome)
            .field("children", &state.children.len())
            .finish()
    }
}

/// Future returned by [`CancellableHandle::done`].
///
/// Dropping it while pending removes its waker from the handle.
pub struct Done<T> {
    shared: Arc<Shared<T>>,
    waiter_id: Option<u64>,
}

impl<T: Clone> Future for Done<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock().unwrap();
        if let Some(outcome) = &state.outcome {
            this.waiter_id = None;
            return Poll::Ready(outcome.clone());
        }

        let waker = cx.waker();
        let registered = this
            .waiter_id
            .and_then(|id| state.wakers.iter().position(|(slot, _)| *slot == id));
        match registered {
            Some(index) => {
                if !state.wakers[index].1.will_wake(waker) {
                    state.wakers[index].1 = waker.clone();
                }
            }
            None => {
                let id = state.next_waiter;
                state.next_waiter += 1;
                state.wakers.push((id, waker.clone()));
                this.waiter_id = Some(id);
            }
        }
        Poll::Pending
    }
}

impl<T> Drop for Done<T> {
    fn drop(&mut self) {
        if let Some(id) = self.waiter_id.take() {
            let mut state = self.shared.state.lock().unwrap();
            state.wakers.retain(|(slot, _)| *slot != id);
        }
    }
}
