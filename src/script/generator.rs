use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{self, Either, select};
use futures::stream::{self, Stream, StreamExt};
use log::debug;

use super::{ReplyStream, Runnable, ScriptPart, simplify};
use crate::catcher::{ErrorCatcher, ErrorScope};
use crate::errors::Error;
use crate::handle::{Completion, LifetimeHandle};
use crate::message::Reply;
use crate::queue::AsyncQueue;
use crate::reference::{Reference, find_serials};
use crate::runtime::{self, BoxFuture};
use crate::session::{RunOptions, Session};
use crate::streamer::{Producers, StreamMerger};
use crate::supervisor::TaskSupervisor;

type Result<T> = std::result::Result<T, Error>;

/// What a [`Procedure`] wants done next.
#[derive(Debug)]
pub enum Step {
    /// Run these parts as one batch.
    Send(Vec<ScriptPart>),
    /// Report an error to the run's catcher.
    Error(Error),
}

impl Step {
    pub fn send<I>(parts: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ScriptPart>,
    {
        Step::Send(parts.into_iter().map(Into::into).collect())
    }
}

/// What a procedure is built with.
#[derive(Clone)]
pub struct ProcedureArgs {
    pub reference: Option<Reference>,
    pub session: Arc<dyn Session>,
    pub options: RunOptions,
}

impl ProcedureArgs {
    /// Report an error to the run's catcher.
    pub fn add_error(&self, err: Error) {
        if let Some(catcher) = &self.options.error_catcher {
            catcher.add(err);
        }
    }
}

impl fmt::Debug for ProcedureArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureArgs")
            .field("reference", &self.reference)
            .field("options", &self.options)
            .finish()
    }
}

/// A resumable producer of batches.
///
/// Each call to [`resume`](Procedure::resume) receives the completion of the
/// batch produced by the previous call. The procedure may await it to
/// sequence work, or ignore it to let batches overlap. Returning `Ok(None)`
/// ends the procedure.
pub trait Procedure: Send {
    fn resume(&mut self, previous: Option<Completion>) -> BoxFuture<'_, Result<Option<Step>>>;

    /// Called once after the procedure ends, including when the run is
    /// cancelled. A batch returned here is only run if the run is still live.
    ///
    /// Once the run is cancelled the hook gets one second to return before it
    /// is dropped.
    fn cancel(&mut self, previous: Option<Completion>) -> BoxFuture<'_, Result<Option<Step>>> {
        let _ = previous;
        Box::pin(future::ready(Ok(None)))
    }
}

const CANCEL_GRACE: Duration = Duration::from_secs(1);

type ProcedureFactory = Arc<dyn Fn(ProcedureArgs) -> Box<dyn Procedure> + Send + Sync>;

/// Which reference the procedure sees, and which one its batches run against.
#[derive(Debug, Clone, Default)]
pub enum ReferenceOverride {
    /// The procedure sees the run's reference. Batches run without one, so
    /// only messages with a target are sent.
    #[default]
    Explicit,
    /// Both use the run's reference.
    Outer,
    /// Both use this reference instead of the run's.
    Fixed(Reference),
}

/// A runnable driven by a [`Procedure`].
///
/// Batches are dispatched as soon as the procedure yields them, and the
/// replies of every batch are forwarded as they arrive. The run is over once
/// the procedure has ended and every batch has finished.
#[derive(Clone)]
pub struct FromGenerator {
    factory: ProcedureFactory,
    reference_override: ReferenceOverride,
}

impl FromGenerator {
    pub fn new<F, P>(factory: F) -> Self
    where
        F: Fn(ProcedureArgs) -> P + Send + Sync + 'static,
        P: Procedure + 'static,
    {
        FromGenerator {
            factory: Arc::new(move |args| Box::new(factory(args)) as Box<dyn Procedure>),
            reference_override: ReferenceOverride::Explicit,
        }
    }

    pub fn with_override(mut self, reference_override: ReferenceOverride) -> Self {
        self.reference_override = reference_override;
        self
    }

    /// Run a separate procedure for every device in the reference.
    ///
    /// Devices that can't be found are reported to the catcher. The rest run
    /// concurrently, each with a reference of just that device.
    pub fn per_serial(self) -> Self {
        let inner = self.factory;
        FromGenerator::new(move |args| PerSerial {
            inner: Arc::clone(&inner),
            args,
            steps: None,
        })
        .with_override(ReferenceOverride::Outer)
    }
}

impl fmt::Debug for FromGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FromGenerator")
            .field("reference_override", &self.reference_override)
            .finish()
    }
}

impl From<FromGenerator> for ScriptPart {
    fn from(generator: FromGenerator) -> Self {
        ScriptPart::runnable(generator)
    }
}

impl Runnable for FromGenerator {
    fn run(
        &self,
        reference: Option<Reference>,
        session: Arc<dyn Session>,
        options: RunOptions,
    ) -> ReplyStream {
        let (seen, used) = match &self.reference_override {
            ReferenceOverride::Explicit => (reference, None),
            ReferenceOverride::Outer => (reference.clone(), reference),
            ReferenceOverride::Fixed(fixed) => (Some(fixed.clone()), Some(fixed.clone())),
        };

        let scope: LifetimeHandle = session.stop_handle().child();
        let errors = ErrorScope::new(options.error_catcher.as_ref());
        let catcher = errors.catcher().clone();
        let options = options.with_catcher(catcher.clone());

        let procedure = (self.factory)(ProcedureArgs {
            reference: seen,
            session: Arc::clone(&session),
            options: options.clone(),
        });

        let output = AsyncQueue::new(&scope);
        let supervisor = TaskSupervisor::new(&scope);
        let run = GeneratorRun {
            session,
            options,
            reference: used,
            catcher,
            output: output.clone(),
        };

        supervisor.add_with(move |lifetime| async move {
            run.drive(procedure, lifetime).await;
            run.output.finish();
            Ok::<(), Error>(())
        });

        let watched = scope.clone();
        let raised = stream::once(async move {
            supervisor.finish().await;
            if watched.is_cancelled() {
                None
            } else {
                errors.into_error()
            }
        })
        .filter_map(future::ready)
        .map(Err);

        let replies = output.scan((), |_, item| future::ready(item.ok())).map(Ok);

        Box::pin(CancelOnDrop {
            stream: replies.chain(raised).boxed(),
            scope,
        })
    }
}

/// Cancels the run when its consumer goes away.
struct CancelOnDrop {
    stream: ReplyStream,
    scope: LifetimeHandle,
}

impl Stream for CancelOnDrop {
    type Item = Result<Reply>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

struct GeneratorRun {
    session: Arc<dyn Session>,
    options: RunOptions,
    reference: Option<Reference>,
    catcher: ErrorCatcher,
    output: AsyncQueue<Reply>,
}

impl GeneratorRun {
    async fn drive(&self, procedure: Box<dyn Procedure>, lifetime: LifetimeHandle) {
        let mut merger: StreamMerger<(), Reply> = StreamMerger::new(&lifetime);
        let producers = merger.producers();

        let consume = self.consume(procedure, producers, &lifetime);
        let forward = async {
            while let Some(item) = merger.next().await {
                match item {
                    Ok(item) => self.output.append(item.value),
                    Err(err) => self.catcher.add(err),
                }
            }
            merger.finish().await;
        };
        futures::join!(consume, forward);
    }

    async fn consume(
        &self,
        mut procedure: Box<dyn Procedure>,
        producers: Producers<(), Reply>,
        lifetime: &LifetimeHandle,
    ) {
        let mut previous: Option<Completion> = None;
        loop {
            let step = match select(procedure.resume(previous.clone()), lifetime.done()).await {
                Either::Left((step, _)) => step,
                Either::Right(_) => break,
            };
            match step {
                Ok(Some(Step::Send(parts))) => {
                    previous = Some(self.dispatch(parts, &producers, lifetime));
                }
                Ok(Some(Step::Error(err))) => self.catcher.add(err),
                Ok(None) => break,
                Err(err) => {
                    self.catcher.add(err);
                    break;
                }
            }
        }

        let cleanup = procedure.cancel(previous);
        let step = if lifetime.is_done() {
            runtime::timeout(CANCEL_GRACE, cleanup)
                .await
                .unwrap_or_else(|_| {
                    debug!("Gave up waiting for a procedure to clean up");
                    Ok(None)
                })
        } else {
            cleanup.await
        };
        match step {
            Ok(Some(Step::Send(parts))) if !lifetime.is_done() => {
                self.dispatch(parts, &producers, lifetime);
            }
            Ok(Some(Step::Send(_))) => debug!("Dropping a final batch, the run is over"),
            Ok(Some(Step::Error(err))) | Err(err) => self.catcher.add(err),
            Ok(None) => {}
        }
        producers.no_more_producers();
    }

    /// Start a batch and return the handle that resolves once it is done.
    fn dispatch(
        &self,
        parts: Vec<ScriptPart>,
        producers: &Producers<(), Reply>,
        lifetime: &LifetimeHandle,
    ) -> Completion {
        let completion: Completion = lifetime.child();
        producers.add_stream(self.retrieve_all(parts, &completion, lifetime), ());
        completion
    }

    fn retrieve_all(
        &self,
        parts: Vec<ScriptPart>,
        completion: &Completion,
        lifetime: &LifetimeHandle,
    ) -> ReplyStream {
        let merger: StreamMerger<(), Reply> = StreamMerger::new(lifetime);
        let producers = merger.producers();
        for runnable in simplify(parts) {
            producers.add_stream(self.retrieve(runnable, completion), ());
        }
        producers.no_more_producers();

        let completion = completion.clone();
        let done = stream::once(async move {
            completion.succeed(true);
            None::<Result<Reply>>
        })
        .filter_map(future::ready);

        merger.map(|item| item.map(|item| item.value)).chain(done).boxed()
    }

    /// Run one part of a batch. Its failures mark the batch as failed.
    fn retrieve(&self, runnable: Arc<dyn Runnable>, completion: &Completion) -> ReplyStream {
        let outer = self.catcher.clone();
        let failed = completion.clone();
        let catcher = ErrorCatcher::callback(move |err| {
            failed.succeed(false);
            outer.add(err);
        });

        let options = self.options.clone().with_catcher(catcher.clone());
        runnable
            .run(self.reference.clone(), Arc::clone(&self.session), options)
            .filter_map(move |item| {
                future::ready(match item {
                    Ok(reply) => Some(Ok(reply)),
                    Err(err) => {
                        catcher.add(err);
                        None
                    }
                })
            })
            .boxed()
    }
}

/// Resolves the reference, then hands every found device its own procedure.
struct PerSerial {
    inner: ProcedureFactory,
    args: ProcedureArgs,
    steps: Option<VecDeque<Step>>,
}

impl PerSerial {
    async fn plan(&self) -> Result<VecDeque<Step>> {
        let reference = self.args.reference.clone().unwrap_or(Reference::All);
        let (found, missing) = find_serials(
            &reference,
            self.args.session.as_ref(),
            self.args.options.find_timeout,
        )
        .await?;

        let mut steps: VecDeque<Step> = missing
            .iter()
            .map(|serial| Step::Error(Error::failed_to_find(serial)))
            .collect();
        if !found.is_empty() {
            steps.push_back(Step::Send(
                found
                    .into_iter()
                    .map(|serial| {
                        ScriptPart::runnable(FromGenerator {
                            factory: Arc::clone(&self.inner),
                            reference_override: ReferenceOverride::Fixed(serial.into()),
                        })
                    })
                    .collect(),
            ));
        }
        Ok(steps)
    }
}

impl Procedure for PerSerial {
    fn resume(&mut self, _previous: Option<Completion>) -> BoxFuture<'_, Result<Option<Step>>> {
        Box::pin(async move {
            if self.steps.is_none() {
                self.steps = Some(self.plan().await?);
            }
            Ok(self.steps.as_mut().and_then(VecDeque::pop_front))
        })
    }
}
