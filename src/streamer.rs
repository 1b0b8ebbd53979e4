//! Merge the output of many concurrent producers into one stream.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};

use futures::{Stream, StreamExt};

use crate::errors::Error;
use crate::handle::LifetimeHandle;
use crate::queue::AsyncQueue;
use crate::supervisor::TaskSupervisor;

/// One value from one producer, tagged with the context it was added with.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItem<C, T> {
    pub context: C,
    pub value: T,
}

type Output<C, T> = Result<StreamItem<C, T>, Error>;

#[derive(Debug, Default)]
struct Counter {
    pending: usize,
    closed: bool,
}

/// Registers producers with a [`StreamMerger`].
///
/// Clones can be moved into producers so they can add more producers while
/// the merger is already being consumed.
pub struct Producers<C, T> {
    supervisor: TaskSupervisor,
    queue: AsyncQueue<Output<C, T>>,
    counter: Arc<Mutex<Counter>>,
}

impl<C, T> Clone for Producers<C, T> {
    fn clone(&self) -> Self {
        Producers {
            supervisor: self.supervisor.clone(),
            queue: self.queue.clone(),
            counter: Arc::clone(&self.counter),
        }
    }
}

/// Marks one producer as finished when dropped, whether it completed or was
/// cancelled before it ever ran.
struct ProducerGuard<C: Send + 'static, T: Send + 'static> {
    queue: AsyncQueue<Output<C, T>>,
    counter: Arc<Mutex<Counter>>,
}

impl<C: Send + 'static, T: Send + 'static> Drop for ProducerGuard<C, T> {
    fn drop(&mut self) {
        let mut counter = self.counter.lock().unwrap();
        counter.pending -= 1;
        if counter.pending == 0 && counter.closed {
            self.queue.finish();
        }
    }
}

impl<C: Send + 'static, T: Send + 'static> Producers<C, T> {
    fn enter(&self) -> ProducerGuard<C, T> {
        self.counter.lock().unwrap().pending += 1;
        ProducerGuard {
            queue: self.queue.clone(),
            counter: Arc::clone(&self.counter),
        }
    }

    /// Add a producer with a single result.
    pub fn add_future<F>(&self, producer: F, context: C)
    where
        F: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let guard = self.enter();
        let queue = self.queue.clone();
        self.supervisor.add(async move {
            let _guard = guard;
            let result = producer.await;
            queue.append(result.map(|value| StreamItem { context, value }));
            Ok(())
        });
    }

    /// Add a producer with many results.
    ///
    /// The producer stops at its first error.
    pub fn add_stream<S>(&self, producer: S, context: C)
    where
        S: Stream<Item = Result<T, Error>> + Send + 'static,
        C: Clone,
    {
        let guard = self.enter();
        let queue = self.queue.clone();
        self.supervisor.add(async move {
            let _guard = guard;
            let mut producer = Box::pin(producer);
            while let Some(result) = producer.next().await {
                let failed = result.is_err();
                queue.append(result.map(|value| StreamItem {
                    context: context.clone(),
                    value,
                }));
                if failed {
                    break;
                }
            }
            Ok(())
        });
    }

    /// Declare that no more producers will be added.
    ///
    /// The merger ends once every producer added so far has finished.
    pub fn no_more_producers(&self) {
        let mut counter = self.counter.lock().unwrap();
        counter.closed = true;
        if counter.pending == 0 {
            self.queue.finish();
        }
    }
}

/// Merges an open ended set of producers into one stream of [`StreamItem`]s.
///
/// Items arrive in the order producers complete them, while each producer's
/// own items keep their order. The first error from any producer is yielded,
/// every other producer is cancelled and the stream ends. Cancellation of the
/// merger's lifetime ends the stream without an error.
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use futures::StreamExt;
/// use wiz_script_rs::{LifetimeHandle, StreamMerger};
///
/// let mut merger = StreamMerger::new(&LifetimeHandle::new());
/// let producers = merger.producers();
/// producers.add_future(async { Ok(1) }, "one");
/// producers.add_stream(futures::stream::iter([Ok(2), Ok(3)]), "many");
/// producers.no_more_producers();
///
/// let mut total = 0;
/// while let Some(item) = merger.next().await {
///     total += item.unwrap().value;
/// }
/// assert_eq!(total, 6);
/// # }
/// ```
pub struct StreamMerger<C, T> {
    lifetime: LifetimeHandle,
    producers: Producers<C, T>,
    queue: AsyncQueue<Output<C, T>>,
    ended: bool,
}

impl<C: Send + 'static, T: Send + 'static> StreamMerger<C, T> {
    pub fn new(parent: &LifetimeHandle) -> Self {
        let lifetime: LifetimeHandle = parent.child();
        let queue = AsyncQueue::new(&lifetime);
        StreamMerger {
            producers: Producers {
                supervisor: TaskSupervisor::new(&lifetime),
                queue: queue.clone(),
                counter: Arc::new(Mutex::new(Counter::default())),
            },
            lifetime,
            queue,
            ended: false,
        }
    }

    pub fn lifetime(&self) -> &LifetimeHandle {
        &self.lifetime
    }

    pub fn producers(&self) -> Producers<C, T> {
        self.producers.clone()
    }

    /// Wait for every producer task to unwind.
    pub async fn finish(&self) {
        self.producers.supervisor.finish().await;
    }

    /// Cancel every producer and wait for them to unwind.
    pub async fn shutdown(&self) {
        self.lifetime.cancel();
        self.finish().await;
    }
}

impl<C: Send + 'static, T: Send + 'static> Stream for StreamMerger<C, T> {
    type Item = Output<C, T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.ended {
            return Poll::Ready(None);
        }
        match ready!(this.queue.poll_next_unpin(cx)) {
            Some(Ok(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Some(Ok(Err(err))) | Some(Err(err)) => {
                this.ended = true;
                this.lifetime.cancel();
                if err.is_cancelled() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(err)))
                }
            }
            None => {
                this.ended = true;
                Poll::Ready(None)
            }
        }
    }
}

impl<C, T> Drop for StreamMerger<C, T> {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

impl<C, T> fmt::Debug for StreamMerger<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMerger")
            .field("producers", &self.producers.counter.lock().unwrap())
            .field("ended", &self.ended)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use futures::stream;

    use super::*;
    use crate::runtime::{Instant, sleep};

    async fn after<T>(ms: u64, value: T) -> Result<T, Error> {
        sleep(Duration::from_millis(ms)).await;
        Ok(value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_arrive_in_completion_order() {
        let mut merger = StreamMerger::new(&LifetimeHandle::new());
        let producers = merger.producers();
        producers.add_future(after(30, 1), "slow");
        producers.add_future(after(10, 2), "fast");
        producers.add_stream(
            stream::iter([5, 6]).then(|v| after(20, v)),
            "stream",
        );
        producers.no_more_producers();

        let mut found = Vec::new();
        while let Some(item) = merger.next().await {
            let item = item.unwrap();
            found.push((item.context, item.value));
        }
        assert_eq!(
            found,
            vec![("fast", 2), ("stream", 5), ("slow", 1), ("stream", 6)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_producers_can_add_producers() {
        let mut merger = StreamMerger::new(&LifetimeHandle::new());
        let producers = merger.producers();

        let more = producers.clone();
        producers.add_future(
            async move {
                sleep(Duration::from_millis(5)).await;
                more.add_future(after(5, 2), ());
                more.no_more_producers();
                Ok(1)
            },
            (),
        );

        let mut found = Vec::new();
        while let Some(item) = merger.next().await {
            found.push(item.unwrap().value);
        }
        assert_eq!(found, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_error_cancels_the_rest() {
        let mut merger = StreamMerger::new(&LifetimeHandle::new());
        let producers = merger.producers();
        let finished = Arc::new(AtomicBool::new(false));

        let f = finished.clone();
        producers.add_future(
            async move {
                sleep(Duration::from_secs(10)).await;
                f.store(true, Ordering::SeqCst);
                Ok(1)
            },
            (),
        );
        producers.add_future(
            async {
                sleep(Duration::from_millis(5)).await;
                Err(Error::custom("broken"))
            },
            (),
        );
        producers.no_more_producers();

        let start = Instant::now();
        assert_eq!(merger.next().await, Some(Err(Error::custom("broken"))));
        assert!(merger.next().await.is_none());
        merger.finish().await;

        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_merger_ends_silently() {
        let lifetime = LifetimeHandle::new();
        let mut merger = StreamMerger::new(&lifetime);
        let producers = merger.producers();
        producers.add_future(after(60_000, 1), ());
        producers.add_future(after(1, 2), ());
        producers.no_more_producers();

        assert_eq!(merger.next().await.unwrap().unwrap().value, 2);
        lifetime.cancel();
        assert!(merger.next().await.is_none());
        merger.finish().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_producers_ends_immediately() {
        let mut merger = StreamMerger::<(), ()>::new(&LifetimeHandle::new());
        merger.producers().no_more_producers();
        assert!(merger.next().await.is_none());
    }
}
