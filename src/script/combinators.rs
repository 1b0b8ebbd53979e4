use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use super::{FromGenerator, Procedure, ProcedureArgs, ReferenceOverride, ScriptPart, Simplifiable, Step};
use crate::errors::Error;
use crate::handle::Completion;
use crate::runtime::{self, BoxFuture, Instant};

type Result<T> = std::result::Result<T, Error>;

/// Batches run one after another.
///
/// By default each device moves through the batches at its own pace. When
/// synchronized, every device waits for every other device to finish a batch
/// before the next batch starts.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use wiz_script_rs::{Message, Pipeline};
///
/// let blink = Pipeline::new()
///     .then([Message::set_state(false)])
///     .then([Message::set_state(true)])
///     .spread(Duration::from_millis(500))
///     .synchronized(true);
/// ```
#[derive(Clone)]
pub struct Pipeline {
    batches: Vec<Vec<ScriptPart>>,
    spread: Duration,
    short_circuit_on_error: bool,
    synchronized: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Pipeline {
            batches: Vec::new(),
            spread: Duration::ZERO,
            short_circuit_on_error: false,
            synchronized: false,
        }
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a batch.
    pub fn then<I>(mut self, parts: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ScriptPart>,
    {
        self.batches.push(parts.into_iter().map(Into::into).collect());
        self
    }

    /// Wait this long between batches.
    pub fn spread(mut self, spread: Duration) -> Self {
        self.spread = spread;
        self
    }

    /// Stop at the first batch with an error.
    pub fn short_circuit_on_error(mut self, short_circuit: bool) -> Self {
        self.short_circuit_on_error = short_circuit;
        self
    }

    pub fn synchronized(mut self, synchronized: bool) -> Self {
        self.synchronized = synchronized;
        self
    }

    pub fn generator(&self) -> FromGenerator {
        let batches = Arc::new(self.batches.clone());
        let spread = self.spread;
        let short_circuit_on_error = self.short_circuit_on_error;

        let generator = FromGenerator::new(move |_| PipelineSteps {
            batches: Arc::clone(&batches),
            spread,
            short_circuit_on_error,
            index: 0,
        });
        if self.synchronized {
            generator.with_override(ReferenceOverride::Outer)
        } else {
            generator.per_serial()
        }
    }
}

impl Simplifiable for Pipeline {
    fn simplified(&self) -> Vec<ScriptPart> {
        vec![ScriptPart::runnable(self.generator())]
    }
}

impl From<Pipeline> for ScriptPart {
    fn from(pipeline: Pipeline) -> Self {
        ScriptPart::simplifiable(pipeline)
    }
}

struct PipelineSteps {
    batches: Arc<Vec<Vec<ScriptPart>>>,
    spread: Duration,
    short_circuit_on_error: bool,
    index: usize,
}

impl Procedure for PipelineSteps {
    fn resume(&mut self, previous: Option<Completion>) -> BoxFuture<'_, Result<Option<Step>>> {
        Box::pin(async move {
            if let Some(previous) = previous {
                if !previous.succeeded().await && self.short_circuit_on_error {
                    debug!("Stopping pipeline after a failed batch");
                    return Ok(None);
                }
            }
            let Some(batch) = self.batches.get(self.index).cloned() else {
                return Ok(None);
            };
            if self.index > 0 && !self.spread.is_zero() {
                runtime::sleep(self.spread).await;
            }
            self.index += 1;
            Ok(Some(Step::Send(batch)))
        })
    }
}

/// Called after every loop of a [`Repeater`].
///
/// Returning [`Error::StopLoop`] ends the repeater. Any other error is
/// reported and the loop carries on.
pub type LoopHook = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Runs a batch over and over until the run is cancelled.
///
/// A loop starts once the previous one is done, and no sooner than
/// `min_loop_time` after the previous one started. Special references are
/// reset between loops so devices are found again.
#[derive(Clone)]
pub struct Repeater {
    batch: Vec<ScriptPart>,
    min_loop_time: Duration,
    on_done_loop: Option<LoopHook>,
}

impl Repeater {
    pub fn new<I>(parts: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<ScriptPart>,
    {
        Repeater {
            batch: parts.into_iter().map(Into::into).collect(),
            min_loop_time: Duration::from_secs(30),
            on_done_loop: None,
        }
    }

    pub fn min_loop_time(mut self, min_loop_time: Duration) -> Self {
        self.min_loop_time = min_loop_time;
        self
    }

    pub fn on_done_loop<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_done_loop = Some(Arc::new(move || Box::pin(hook())));
        self
    }

    pub fn generator(&self) -> FromGenerator {
        let batch = Arc::new(self.batch.clone());
        let min_loop_time = self.min_loop_time;
        let on_done_loop = self.on_done_loop.clone();

        FromGenerator::new(move |args| RepeaterSteps {
            batch: Arc::clone(&batch),
            min_loop_time,
            on_done_loop: on_done_loop.clone(),
            args,
            started: None,
        })
        .with_override(ReferenceOverride::Outer)
    }
}

impl Simplifiable for Repeater {
    fn simplified(&self) -> Vec<ScriptPart> {
        vec![ScriptPart::runnable(self.generator())]
    }
}

impl From<Repeater> for ScriptPart {
    fn from(repeater: Repeater) -> Self {
        ScriptPart::simplifiable(repeater)
    }
}

struct RepeaterSteps {
    batch: Arc<Vec<ScriptPart>>,
    min_loop_time: Duration,
    on_done_loop: Option<LoopHook>,
    args: ProcedureArgs,
    started: Option<Instant>,
}

impl Procedure for RepeaterSteps {
    fn resume(&mut self, previous: Option<Completion>) -> BoxFuture<'_, Result<Option<Step>>> {
        Box::pin(async move {
            if let Some(previous) = previous {
                previous.done().await;
                if let Some(reference) = &self.args.reference {
                    reference.reset();
                }

                if let Some(hook) = &self.on_done_loop {
                    match hook().await {
                        Ok(()) => {}
                        Err(Error::StopLoop) => {
                            debug!("Repeater asked to stop");
                            return Ok(None);
                        }
                        Err(err) => self.args.add_error(err),
                    }
                }

                if let Some(started) = self.started {
                    let elapsed = started.elapsed();
                    if elapsed < self.min_loop_time {
                        runtime::sleep(self.min_loop_time - elapsed).await;
                    }
                }
            }

            self.started = Some(Instant::now());
            Ok(Some(Step::Send(self.batch.to_vec())))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;

    use super::*;
    use crate::catcher::ErrorCatcher;
    use crate::fake::{FakeDevice, MemorySession, Request};
    use crate::message::{Message, Method, Serial};
    use crate::reference::Reference;
    use crate::script::Runnable;
    use crate::session::RunOptions;

    fn serial(n: u8) -> Serial {
        Serial::new(&format!("d073d50000{:02x}", n))
    }

    fn session(devices: &[u8]) -> Arc<MemorySession> {
        Arc::new(MemorySession::new(
            devices.iter().map(|n| FakeDevice::new(serial(*n))).collect(),
        ))
    }

    fn both() -> Option<Reference> {
        Some(vec![serial(1), serial(2)].into())
    }

    fn first(requests: &[Request], serial: &Serial, method: Method) -> Duration {
        requests
            .iter()
            .find(|r| &r.serial == serial && r.method == method)
            .map(|r| r.at)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_synchronized_pipeline_waits_for_every_device() {
        let session = session(&[1, 2]);
        session
            .device(&serial(1))
            .unwrap()
            .delay(Method::GetPilot, Duration::from_secs(2));
        let pipeline = Pipeline::new()
            .then([Message::get_pilot()])
            .then([Message::get_power()])
            .synchronized(true);

        let replies: Vec<_> = pipeline
            .generator()
            .run(both(), session.clone(), RunOptions::default())
            .collect()
            .await;
        assert_eq!(replies.len(), 4);

        let requests = session.requests();
        assert!(first(&requests, &serial(2), Method::GetPower) >= Duration::from_secs(2));
        assert!(first(&requests, &serial(1), Method::GetPower) >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsynchronized_pipeline_lets_devices_run_ahead() {
        let session = session(&[1, 2]);
        session
            .device(&serial(1))
            .unwrap()
            .delay(Method::GetPilot, Duration::from_secs(2));
        let pipeline = Pipeline::new()
            .then([Message::get_pilot()])
            .then([Message::get_power()])
            .synchronized(false);

        let replies: Vec<_> = pipeline
            .generator()
            .run(both(), session.clone(), RunOptions::default())
            .collect()
            .await;
        assert_eq!(replies.len(), 4);

        let requests = session.requests();
        assert!(first(&requests, &serial(2), Method::GetPower) < Duration::from_secs(1));
        assert!(first(&requests, &serial(1), Method::GetPower) >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spread_delays_later_batches() {
        let session = session(&[1]);
        let pipeline = Pipeline::new()
            .then([Message::set_state(true)])
            .then([Message::set_state(false)])
            .then([Message::get_pilot()])
            .spread(Duration::from_secs(1));

        let replies: Vec<_> = pipeline
            .generator()
            .run(Some(serial(1).into()), session.clone(), RunOptions::default())
            .collect()
            .await;
        assert_eq!(replies.len(), 3);

        let at: Vec<Duration> = session.requests().iter().map(|r| r.at).collect();
        assert!(at[0] < Duration::from_secs(1));
        assert!(at[1] >= Duration::from_secs(1));
        assert!(at[2] >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_circuit_stops_after_a_failure() {
        let session = session(&[1]);
        session
            .device(&serial(1))
            .unwrap()
            .reject(Method::SetPilot, "bad params");
        let catcher = ErrorCatcher::collection();
        let pipeline = Pipeline::new()
            .then([Message::set_pilot(serde_json::json!({"temp": 1}))])
            .then([Message::get_pilot()])
            .short_circuit_on_error(true);

        let replies: Vec<_> = pipeline
            .generator()
            .run(
                Some(serial(1).into()),
                session.clone(),
                RunOptions::default().with_catcher(catcher.clone()),
            )
            .collect()
            .await;

        assert!(replies.is_empty());
        assert_eq!(session.methods_sent_to(&serial(1)), vec![Method::SetPilot]);
        assert_eq!(catcher.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_carries_on_after_a_failure_by_default() {
        let session = session(&[1]);
        session
            .device(&serial(1))
            .unwrap()
            .reject(Method::SetPilot, "bad params");
        let pipeline = Pipeline::new()
            .then([Message::set_pilot(serde_json::json!({"temp": 1}))])
            .then([Message::get_pilot()]);

        let replies: Vec<_> = pipeline
            .generator()
            .run(Some(serial(1).into()), session.clone(), RunOptions::default())
            .collect()
            .await;

        assert_eq!(replies.len(), 2);
        assert!(replies[0].is_ok());
        assert_eq!(
            replies[1],
            Err(Error::RunErrors(vec![Error::rejected(
                &serial(1),
                Method::SetPilot,
                "bad params"
            )]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeater_keeps_loops_apart() {
        let session = session(&[1]);
        let loops = Arc::new(AtomicUsize::new(0));
        let counted = loops.clone();
        let repeater = Repeater::new([Message::get_pilot()])
            .min_loop_time(Duration::from_secs(3))
            .on_done_loop(move || {
                let done = counted.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if done == 3 {
                        Err(Error::StopLoop)
                    } else {
                        Ok(())
                    }
                }
            });

        let replies: Vec<_> = repeater
            .generator()
            .run(Some(serial(1).into()), session.clone(), RunOptions::default())
            .collect()
            .await;

        assert_eq!(replies.len(), 3);
        assert_eq!(loops.load(Ordering::SeqCst), 3);

        let at: Vec<Duration> = session.requests().iter().map(|r| r.at).collect();
        assert_eq!(at.len(), 3);
        assert!(at[1] - at[0] >= Duration::from_secs(3));
        assert!(at[2] - at[1] >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeater_reports_hook_errors_and_carries_on() {
        let session = session(&[1]);
        let catcher = ErrorCatcher::collection();
        let loops = Arc::new(AtomicUsize::new(0));
        let counted = loops.clone();
        let repeater = Repeater::new([Message::get_pilot()])
            .min_loop_time(Duration::ZERO)
            .on_done_loop(move || {
                let done = counted.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    match done {
                        1 => Err(Error::custom("flaky")),
                        _ => Err(Error::StopLoop),
                    }
                }
            });

        let replies: Vec<_> = repeater
            .generator()
            .run(
                Some(serial(1).into()),
                session.clone(),
                RunOptions::default().with_catcher(catcher.clone()),
            )
            .collect()
            .await;

        assert_eq!(replies.len(), 2);
        assert_eq!(catcher.errors(), vec![Error::custom("flaky")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_loops_start_again_straight_away() {
        let session = session(&[1]);
        session
            .device(&serial(1))
            .unwrap()
            .delay(Method::GetPilot, Duration::from_secs(5));
        let loops = Arc::new(AtomicUsize::new(0));
        let counted = loops.clone();
        let repeater = Repeater::new([Message::get_pilot()])
            .min_loop_time(Duration::from_secs(2))
            .on_done_loop(move || {
                let done = counted.fetch_add(1, Ordering::SeqCst) + 1;
                async move { if done == 2 { Err(Error::StopLoop) } else { Ok(()) } }
            });

        let replies: Vec<_> = repeater
            .generator()
            .run(Some(serial(1).into()), session.clone(), RunOptions::default())
            .collect()
            .await;
        assert_eq!(replies.len(), 2);

        let at: Vec<Duration> = session.requests().iter().map(|r| r.at).collect();
        assert!(at[1] - at[0] >= Duration::from_secs(5));
        assert!(at[1] - at[0] < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_the_session_cuts_the_loop_wait_short() {
        let session = session(&[1]);
        let repeater = Repeater::new([Message::get_pilot()]).min_loop_time(Duration::from_secs(60));

        let s = session.clone();
        drop(runtime::spawn(async move {
            runtime::sleep(Duration::from_secs(1)).await;
            s.stop();
        }));
        let start = runtime::Instant::now();

        let replies: Vec<_> = repeater
            .generator()
            .run(Some(serial(1).into()), session.clone(), RunOptions::default())
            .collect()
            .await;

        assert_eq!(replies.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
