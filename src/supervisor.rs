//! A supervisor that owns a dynamic set of spawned tasks.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{Either, Shared, join_all, select};
use log::debug;
use uuid::Uuid;

use crate::errors::Error;
use crate::handle::{CancellableHandle, LifetimeHandle, Outcome, Terminal};
use crate::runtime::{self, BoxFuture};

struct Entry {
    id: Uuid,
    handle: Arc<dyn Terminal>,
    joined: Shared<BoxFuture<'static, ()>>,
}

impl Entry {
    fn is_finished(&self) -> bool {
        self.joined.clone().now_or_never().is_some()
    }
}

struct Inner {
    lifetime: LifetimeHandle,
    tasks: Mutex<Vec<Entry>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

/// Owns concurrently running tasks scoped to one lifetime.
///
/// Each task runs under a handle derived from the supervisor's lifetime, so
/// cancelling that lifetime (or dropping the last clone of the supervisor)
/// cancels every task. A failing task never affects its siblings; its error is
/// only visible through the [`RunningTask`] returned when it was added.
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use wiz_script_rs::{LifetimeHandle, TaskSupervisor};
///
/// let supervisor = TaskSupervisor::new(&LifetimeHandle::new());
/// let task = supervisor.add(async { Ok(2 + 2) });
/// supervisor.finish().await;
/// assert_eq!(task.wait().await.unwrap(), 4);
/// # }
/// ```
#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

impl TaskSupervisor {
    pub fn new(parent: &LifetimeHandle) -> Self {
        TaskSupervisor {
            inner: Arc::new(Inner {
                lifetime: parent.child(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The lifetime every task of this supervisor is derived from.
    pub fn lifetime(&self) -> &LifetimeHandle {
        &self.inner.lifetime
    }

    /// Spawn `unit` as a new task.
    ///
    /// The unit is dropped at its next await point if the task is cancelled.
    pub fn add<F, T>(&self, unit: F) -> RunningTask<T>
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
        T: Clone + Send + 'static,
    {
        self.add_with(move |lifetime| async move {
            match select(Box::pin(unit), lifetime.done()).await {
                Either::Left((result, _)) => result,
                Either::Right(_) => Err(Error::Cancelled),
            }
        })
    }

    /// Spawn the unit built by `make`, handing it its own lifetime.
    ///
    /// The unit is expected to watch the lifetime and unwind by itself once it
    /// is cancelled. It is never dropped early. Tasks that already finished are
    /// forgotten here, so a long lived supervisor only tracks what is running.
    pub fn add_with<M, F, T>(&self, make: M) -> RunningTask<T>
    where
        M: FnOnce(LifetimeHandle) -> F,
        F: Future<Output = Result<T, Error>> + Send + 'static,
        T: Clone + Send + 'static,
    {
        let id = Uuid::new_v4();
        let handle: CancellableHandle<T> = self.inner.lifetime.child();
        let unit = make(handle.child());

        let resolve = handle.clone();
        let joined: BoxFuture<'static, ()> = Box::pin(runtime::spawn(async move {
            match unit.await {
                Ok(value) => {
                    resolve.succeed(value);
                }
                Err(err) if err.is_cancelled() => {
                    resolve.cancel();
                }
                Err(err) => {
                    debug!("Task {} failed: {}", id, err);
                    resolve.fail(err);
                }
            }
        }));

        let mut tasks = self.inner.tasks.lock().unwrap();
        tasks.retain(|entry| !entry.is_finished());
        tasks.push(Entry {
            id,
            handle: handle.as_terminal(),
            joined: joined.shared(),
        });
        drop(tasks);

        RunningTask { id, handle }
    }

    /// Wait until every task has finished.
    ///
    /// Tasks added while waiting, including ones added by tasks that are
    /// finishing, are waited for too.
    pub async fn finish(&self) {
        loop {
            let waiting: Vec<_> = {
                let tasks = self.inner.tasks.lock().unwrap();
                tasks
                    .iter()
                    .filter(|entry| !entry.is_finished())
                    .map(|entry| entry.joined.clone())
                    .collect()
            };
            if waiting.is_empty() {
                break;
            }
            join_all(waiting).await;
            self.clean();
        }
        self.clean();
    }

    /// Cancel every task and wait for all of them to unwind.
    pub async fn shutdown(&self) {
        self.inner.lifetime.cancel();
        self.finish().await;
    }

    /// Cancel one task by id.
    pub fn cancel(&self, id: &Uuid) -> bool {
        let tasks = self.inner.tasks.lock().unwrap();
        match tasks.iter().find(|entry| &entry.id == id) {
            Some(entry) => entry.handle.cancel(),
            None => false,
        }
    }

    /// Forget tasks that have already finished.
    pub fn clean(&self) {
        self.inner
            .tasks
            .lock()
            .unwrap()
            .retain(|entry| !entry.is_finished());
    }

    /// The number of tasks still running.
    pub fn pending(&self) -> usize {
        self.clean();
        self.inner.tasks.lock().unwrap().len()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.clean();
        self.inner
            .tasks
            .lock()
            .unwrap()
            .iter()
            .any(|entry| &entry.id == id)
    }
}

impl fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("tasks", &self.inner.tasks.lock().unwrap().len())
            .field("cancelled", &self.inner.lifetime.is_cancelled())
            .finish()
    }
}

/// A task spawned by a [`TaskSupervisor`].
#[derive(Debug, Clone)]
pub struct RunningTask<T> {
    id: Uuid,
    handle: CancellableHandle<T>,
}

impl<T: Clone + Send + 'static> RunningTask<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> &CancellableHandle<T> {
        &self.handle
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    pub async fn outcome(&self) -> Outcome<T> {
        self.handle.done().await
    }

    /// Wait for the task's own result.
    pub async fn wait(&self) -> Result<T, Error> {
        self.handle.wait().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::runtime::{Instant, sleep};

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_all_tasks() {
        let supervisor = TaskSupervisor::new(&LifetimeHandle::new());
        let count = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        for i in 1..=3u64 {
            let count = count.clone();
            supervisor.add(async move {
                sleep(Duration::from_millis(10 * i)).await;
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        supervisor.finish().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(start.elapsed() < Duration::from_millis(60));
        assert_eq!(supervisor.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_kept_on_the_task() {
        let supervisor = TaskSupervisor::new(&LifetimeHandle::new());
        let bad = supervisor.add::<_, ()>(async { Err(Error::custom("nope")) });
        let good = supervisor.add(async {
            sleep(Duration::from_millis(5)).await;
            Ok("fine")
        });

        supervisor.finish().await;
        assert_eq!(bad.wait().await, Err(Error::custom("nope")));
        assert_eq!(good.wait().await, Ok("fine"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_cancels_tasks() {
        let parent = LifetimeHandle::new();
        let supervisor = TaskSupervisor::new(&parent);
        let task = supervisor.add(async {
            sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        sleep(Duration::from_millis(1)).await;
        parent.cancel();
        supervisor.finish().await;
        assert_eq!(task.wait().await, Err(Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_lets_cooperative_tasks_unwind() {
        let supervisor = TaskSupervisor::new(&LifetimeHandle::new());
        let unwound = Arc::new(AtomicBool::new(false));

        let u = unwound.clone();
        let task = supervisor.add_with(move |lifetime| async move {
            lifetime.done().await;
            sleep(Duration::from_millis(5)).await;
            u.store(true, Ordering::SeqCst);
            Ok(7)
        });

        sleep(Duration::from_millis(1)).await;
        supervisor.shutdown().await;
        assert!(unwound.load(Ordering::SeqCst));
        assert_eq!(task.wait().await, Err(Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_successors_added_while_finishing() {
        let supervisor = TaskSupervisor::new(&LifetimeHandle::new());
        let ran = Arc::new(AtomicBool::new(false));

        let first = supervisor.add(async {
            sleep(Duration::from_millis(10)).await;
            Ok(())
        });

        let successor = supervisor.clone();
        let r = ran.clone();
        first.handle().add_done_callback(move |_| {
            successor.add(async move {
                sleep(Duration::from_millis(20)).await;
                r.store(true, Ordering::SeqCst);
                Ok(())
            });
        });

        supervisor.finish().await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(supervisor.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_and_contains() {
        let supervisor = TaskSupervisor::new(&LifetimeHandle::new());
        let quick = supervisor.add(async { Ok(()) });
        let slow = supervisor.add(async {
            sleep(Duration::from_secs(1)).await;
            Ok(())
        });

        quick.wait().await.unwrap();
        sleep(Duration::from_millis(1)).await;
        assert!(!supervisor.contains(&quick.id()));
        assert!(supervisor.contains(&slow.id()));
        assert_eq!(supervisor.pending(), 1);

        assert!(supervisor.cancel(&slow.id()));
        supervisor.finish().await;
        assert!(slow.is_done());
        assert_eq!(supervisor.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_tasks_are_not_kept() {
        let supervisor = TaskSupervisor::new(&LifetimeHandle::new());
        for i in 0..1000u32 {
            let task = supervisor.add(async move { Ok(i) });
            assert_eq!(task.wait().await, Ok(i));
        }
        assert!(supervisor.inner.tasks.lock().unwrap().len() <= 1);

        let slow = supervisor.add(async {
            sleep(Duration::from_secs(5)).await;
            Ok(0)
        });
        supervisor.add(async { Ok(1) }).wait().await.unwrap();
        supervisor.add(async { Ok(2) });
        assert!(supervisor.contains(&slow.id()));
        assert!(supervisor.inner.tasks.lock().unwrap().len() <= 2);
        supervisor.finish().await;
    }
}
