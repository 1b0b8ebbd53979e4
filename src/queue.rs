//! A FIFO buffer between producer tasks and one consumer.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use futures::Stream;
use futures::future::poll_fn;

use crate::errors::Error;
use crate::handle::LifetimeHandle;

struct State<T> {
    items: VecDeque<T>,
    // Appended after iteration could no longer yield them.
    late: Vec<T>,
    finished: bool,
    ended: bool,
    consumer: Option<Waker>,
    space: Vec<Waker>,
}

impl<T> State<T> {
    fn wake_all(&mut self) {
        if let Some(waker) = self.consumer.take() {
            waker.wake();
        }
        for waker in self.space.drain(..) {
            waker.wake();
        }
    }
}

/// A queue that producers append to and a single consumer iterates.
///
/// Iteration yields items in FIFO order and ends once [`finish`](Self::finish)
/// was called and the buffer is drained. If the lifetime the queue is bound to
/// is cancelled first, iteration stops straight away with one final
/// [`Error::Cancelled`] item. Items left behind can still be taken with
/// [`remaining`](Self::remaining).
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use futures::StreamExt;
/// use wiz_script_rs::{AsyncQueue, LifetimeHandle};
///
/// let queue = AsyncQueue::new(&LifetimeHandle::new());
/// queue.append(1);
/// queue.append(2);
/// queue.finish();
///
/// let items: Vec<_> = queue.clone().map(Result::unwrap).collect().await;
/// assert_eq!(items, vec![1, 2]);
/// # }
/// ```
pub struct AsyncQueue<T> {
    state: Arc<Mutex<State<T>>>,
    lifetime: LifetimeHandle,
    bound: Option<usize>,
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        AsyncQueue {
            state: Arc::clone(&self.state),
            lifetime: self.lifetime.clone(),
            bound: self.bound,
        }
    }
}

impl<T: Send + 'static> AsyncQueue<T> {
    pub fn new(lifetime: &LifetimeHandle) -> Self {
        Self::build(lifetime, None)
    }

    /// A queue that makes [`push`](Self::push) wait while `bound` items are buffered.
    pub fn bounded(lifetime: &LifetimeHandle, bound: usize) -> Self {
        Self::build(lifetime, Some(bound.max(1)))
    }

    fn build(parent: &LifetimeHandle, bound: Option<usize>) -> Self {
        let state = Arc::new(Mutex::new(State {
            items: VecDeque::new(),
            late: Vec::new(),
            finished: false,
            ended: false,
            consumer: None,
            space: Vec::new(),
        }));

        let lifetime: LifetimeHandle = parent.child();
        let weak: Weak<Mutex<State<T>>> = Arc::downgrade(&state);
        lifetime.add_done_callback(move |_| {
            if let Some(state) = weak.upgrade() {
                state.lock().unwrap().wake_all();
            }
        });

        AsyncQueue {
            state,
            lifetime,
            bound,
        }
    }

    /// Add an item without waiting.
    pub fn append(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        if state.finished || state.ended || self.lifetime.is_done() {
            state.late.push(item);
            return;
        }
        state.items.push_back(item);
        if let Some(waker) = state.consumer.take() {
            waker.wake();
        }
    }

    /// Add an item, waiting for space first if the queue is bounded.
    pub async fn push(&self, item: T) {
        if let Some(bound) = self.bound {
            poll_fn(|cx| {
                let mut state = self.state.lock().unwrap();
                if state.items.len() < bound
                    || state.finished
                    || state.ended
                    || self.lifetime.is_done()
                {
                    Poll::Ready(())
                } else {
                    state.space.push(cx.waker().clone());
                    Poll::Pending
                }
            })
            .await;
        }
        self.append(item);
    }

    /// Stop iteration once the buffered items are consumed.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.finished = true;
        state.wake_all();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take every item that was not yielded, without waiting.
    pub fn remaining(&self) -> Vec<T> {
        let mut state = self.state.lock().unwrap();
        let mut items: Vec<T> = state.items.drain(..).collect();
        items.append(&mut state.late);
        for waker in state.space.drain(..) {
            waker.wake();
        }
        items
    }
}

impl<T: Send + 'static> Stream for AsyncQueue<T> {
    type Item = Result<T, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let mut state = this.state.lock().unwrap();
        if state.ended {
            return Poll::Ready(None);
        }

        if this.lifetime.is_done() {
            state.ended = true;
            return if state.finished {
                Poll::Ready(None)
            } else {
                Poll::Ready(Some(Err(Error::Cancelled)))
            };
        }

        if let Some(item) = state.items.pop_front() {
            if let Some(waker) = state.space.pop() {
                waker.wake();
            }
            return Poll::Ready(Some(Ok(item)));
        }

        if state.finished {
            state.ended = true;
            return Poll::Ready(None);
        }

        state.consumer = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<T> fmt::Debug for AsyncQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("AsyncQueue")
            .field("buffered", &state.items.len())
            .field("finished", &state.finished)
            .field("bound", &self.bound)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::runtime::{sleep, spawn};

    #[tokio::test(start_paused = true)]
    async fn test_yields_in_order_until_finished() {
        let queue = AsyncQueue::new(&LifetimeHandle::new());
        let producer = queue.clone();
        drop(spawn(async move {
            for i in 0..5 {
                producer.append(i);
                sleep(Duration::from_millis(1)).await;
            }
            producer.finish();
        }));

        let mut consumer = queue.clone();
        let mut found = Vec::new();
        while let Some(item) = consumer.next().await {
            found.push(item.unwrap());
        }
        assert_eq!(found, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_ends_iteration_with_error() {
        let lifetime = LifetimeHandle::new();
        let mut queue = AsyncQueue::new(&lifetime);
        queue.append(1);
        queue.append(2);

        assert_eq!(queue.next().await, Some(Ok(1)));
        lifetime.cancel();
        assert_eq!(queue.next().await, Some(Err(Error::Cancelled)));
        assert_eq!(queue.next().await, None);

        queue.append(3);
        assert_eq!(queue.remaining(), vec![2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_wakes_a_waiting_consumer() {
        let lifetime = LifetimeHandle::new();
        let mut queue = AsyncQueue::<u8>::new(&lifetime);

        let l = lifetime.clone();
        drop(spawn(async move {
            sleep(Duration::from_millis(5)).await;
            l.cancel();
        }));

        assert_eq!(queue.next().await, Some(Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_finished_queue_ends_silently_when_cancelled() {
        let lifetime = LifetimeHandle::new();
        let mut queue = AsyncQueue::new(&lifetime);
        queue.append("a");
        queue.finish();
        lifetime.cancel();
        assert_eq!(queue.next().await, None);
        assert_eq!(queue.remaining(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_reentrant_after_break() {
        let mut queue = AsyncQueue::new(&LifetimeHandle::new());
        for i in 0..10 {
            queue.append(i);
        }

        let mut found = Vec::new();
        while let Some(Ok(item)) = queue.next().await {
            found.push(item);
            if item == 3 {
                break;
            }
        }
        queue.finish();
        while let Some(Ok(item)) = queue.next().await {
            found.push(item);
        }
        assert_eq!(found, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_push_waits_for_space() {
        let queue = AsyncQueue::bounded(&LifetimeHandle::new(), 2);
        let producer = queue.clone();
        let pushed = spawn(async move {
            for i in 0..3 {
                producer.push(i).await;
            }
        });

        sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.len(), 2);

        let mut consumer = queue.clone();
        assert_eq!(consumer.next().await, Some(Ok(0)));
        pushed.await;
        assert_eq!(queue.remaining(), vec![1, 2]);
    }
}
