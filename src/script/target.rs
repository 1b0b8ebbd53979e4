use std::fmt;
use std::sync::Arc;

use futures::future;
use futures::stream::{self, StreamExt};
use log::debug;

use super::{
    FromGenerator, Procedure, ReferenceOverride, ReplyStream, Runnable, ScriptPart, Step, simplify,
};
use crate::errors::Error;
use crate::handle::Completion;
use crate::message::Reply;
use crate::reference::Reference;
use crate::runtime::BoxFuture;
use crate::session::{RunOptions, Session};

/// Where scripts are run.
///
/// # Example
///
/// ```
/// # #[tokio::main]
/// # async fn main() -> Result<(), wiz_script_rs::Error> {
/// use std::sync::Arc;
/// use wiz_script_rs::fake::{FakeDevice, MemorySession};
/// use wiz_script_rs::{Message, RunOptions, Serial, Target};
///
/// let bulb = FakeDevice::new(Serial::new("d073d5000001"));
/// let target = Target::new(Arc::new(MemorySession::new(vec![bulb.clone()])));
///
/// target
///     .script([Message::set_state(true)])
///     .run_all("d073d5000001", RunOptions::default())
///     .await?;
/// assert!(bulb.power());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Target {
    session: Arc<dyn Session>,
}

impl Target {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Target { session }
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Prepare `parts` to be run.
    ///
    /// Several parts run side by side, as if yielded one after another by a
    /// procedure that never waits.
    pub fn script<I>(&self, parts: I) -> ScriptRunner
    where
        I: IntoIterator,
        I::Item: Into<ScriptPart>,
    {
        let mut items = simplify(parts.into_iter().map(Into::into));
        let item: Option<Arc<dyn Runnable>> = match items.len() {
            0 => None,
            1 => items.pop(),
            _ => {
                let items = Arc::new(items);
                Some(Arc::new(
                    FromGenerator::new(move |_| Sequence {
                        items: Arc::clone(&items),
                        index: 0,
                    })
                    .with_override(ReferenceOverride::Outer),
                ))
            }
        };

        ScriptRunner {
            item,
            session: Arc::clone(&self.session),
        }
    }

    /// Shortcut for `script(parts).run(reference, options)`.
    pub fn send<I>(&self, parts: I, reference: impl Into<Reference>, options: RunOptions) -> ReplyStream
    where
        I: IntoIterator,
        I::Item: Into<ScriptPart>,
    {
        self.script(parts).run(reference, options)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target").finish_non_exhaustive()
    }
}

/// Yields each item as its own batch, without waiting in between.
struct Sequence {
    items: Arc<Vec<Arc<dyn Runnable>>>,
    index: usize,
}

impl Procedure for Sequence {
    fn resume(&mut self, _previous: Option<Completion>) -> BoxFuture<'_, Result<Option<Step>, Error>> {
        let step = self.items.get(self.index).map(|item| {
            Step::Send(vec![ScriptPart::Runnable(Arc::clone(item))])
        });
        self.index += 1;
        Box::pin(future::ready(Ok(step)))
    }
}

/// A script ready to run against a [`Target`].
#[derive(Clone)]
pub struct ScriptRunner {
    item: Option<Arc<dyn Runnable>>,
    session: Arc<dyn Session>,
}

impl ScriptRunner {
    /// Run the script against `reference`.
    ///
    /// Dropping the stream cancels whatever is still in flight.
    pub fn run(&self, reference: impl Into<Reference>, options: RunOptions) -> ReplyStream {
        self.start(Some(reference.into()), options)
    }

    /// Run the script without a reference.
    ///
    /// Only messages with a target are sent, unless `options.broadcast` is set.
    pub fn run_without_reference(&self, options: RunOptions) -> ReplyStream {
        self.start(None, options)
    }

    /// Run the script and collect every reply.
    ///
    /// If anything went wrong and there is no catcher in `options`, the
    /// replies received so far come back inside
    /// [`Error::BadRunWithResults`].
    pub async fn run_all(
        &self,
        reference: impl Into<Reference>,
        options: RunOptions,
    ) -> Result<Vec<Reply>, Error> {
        collect(self.run(reference, options)).await
    }

    fn start(&self, reference: Option<Reference>, options: RunOptions) -> ReplyStream {
        match &self.item {
            Some(item) => item.run(reference, Arc::clone(&self.session), options),
            None => {
                debug!("Running an empty script");
                stream::empty().boxed()
            }
        }
    }
}

impl fmt::Debug for ScriptRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptRunner")
            .field("empty", &self.item.is_none())
            .finish_non_exhaustive()
    }
}

async fn collect(mut replies: ReplyStream) -> Result<Vec<Reply>, Error> {
    let mut results = Vec::new();
    while let Some(item) = replies.next().await {
        match item {
            Ok(reply) => results.push(reply),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(Error::RunErrors(errors)) => {
                return Err(Error::BadRunWithResults { results, errors });
            }
            Err(err) => {
                return Err(Error::BadRunWithResults {
                    results,
                    errors: vec![err],
                });
            }
        }
    }
    Ok(results)
}
