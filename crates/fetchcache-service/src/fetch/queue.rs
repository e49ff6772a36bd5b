use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

/// Bounded-concurrency admission control for downloads.
///
/// Tickets are admitted strictly in the order [`acquire`](Self::acquire) was
/// called. A ticket issued while capacity is free goes through the same
/// enqueue-then-drain path as one issued under load, so admission order never
/// depends on how busy the queue happens to be.
#[derive(Clone)]
pub struct DispatchQueue {
    state: Arc<Mutex<QueueState>>,
}

struct QueueState {
    limit: usize,
    running: usize,
    waiting: VecDeque<oneshot::Sender<SlotPermit>>,
}

impl QueueState {
    /// Admits waiting tickets while capacity is available.
    fn drain(state: &mut QueueState, shared: &Arc<Mutex<QueueState>>) {
        while state.running < state.limit {
            let Some(ticket) = state.waiting.pop_front() else {
                break;
            };

            state.running += 1;
            if let Err(mut permit) = ticket.send(SlotPermit {
                state: Some(shared.clone()),
            }) {
                // The waiter is gone. Reclaim the slot and defuse the permit
                // so its Drop does not release a second time.
                state.running -= 1;
                permit.state = None;
            }
        }
    }
}

impl DispatchQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                limit: max_concurrent.max(1),
                running: 0,
                waiting: VecDeque::new(),
            })),
        }
    }

    /// Requests a slot, resolving once this ticket is admitted.
    ///
    /// The ticket is enqueued before this function returns; only the waiting
    /// happens in the returned future. The slot is released when the
    /// [`SlotPermit`] is dropped.
    pub fn acquire(&self) -> impl Future<Output = SlotPermit> + Send + 'static {
        let (sender, receiver) = oneshot::channel();

        let shared = self.state.clone();
        {
            let mut state = shared.lock().unwrap();
            state.waiting.push_back(sender);
            QueueState::drain(&mut state, &shared);
        }

        async move {
            // The ticket's sender lives in the queue state, and `shared`
            // keeps that state alive for as long as we wait, so the channel
            // cannot produce a receive error.
            let _shared = &shared;
            receiver.await.expect("dispatch queue state dropped")
        }
    }

    /// The number of currently admitted operations.
    pub fn running(&self) -> usize {
        self.state.lock().unwrap().running
    }

    /// The number of tickets waiting for admission.
    pub fn waiting(&self) -> usize {
        self.state.lock().unwrap().waiting.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.lock().unwrap().limit
    }
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("DispatchQueue")
            .field("limit", &state.limit)
            .field("running", &state.running)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

/// An admitted slot. Dropping it releases the slot and admits the next
/// waiting ticket, regardless of how the holding operation ended.
pub struct SlotPermit {
    state: Option<Arc<Mutex<QueueState>>>,
}

impl fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPermit").finish()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let Some(shared) = self.state.take() else {
            return;
        };

        let mut state = shared.lock().unwrap();
        state.running -= 1;
        QueueState::drain(&mut state, &shared);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;

    #[tokio::test]
    async fn test_limit_is_enforced() {
        let queue = DispatchQueue::new(3);
        assert_eq!(queue.max_concurrent(), 3);

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let queue = queue.clone();
                let active = active.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    let _permit = queue.acquire().await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.running(), 0);
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test]
    async fn test_fifo_admission_order() {
        let queue = DispatchQueue::new(1);
        let blocker = queue.acquire().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<_> = (0..5)
            .map(|i| {
                // Enqueued here, in loop order, not when the task first polls.
                let ticket = queue.acquire();
                let order = order.clone();
                tokio::spawn(async move {
                    let _permit = ticket.await;
                    order.lock().unwrap().push(i);
                })
            })
            .collect();

        assert_eq!(queue.waiting(), 5);
        drop(blocker);

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_free_slots_admit_immediately() {
        let queue = DispatchQueue::new(2);

        let first = queue.acquire().now_or_never();
        assert!(first.is_some());
        let second = queue.acquire().now_or_never();
        assert!(second.is_some());

        // Queue is full now.
        let mut third = Box::pin(queue.acquire());
        assert!(third.as_mut().now_or_never().is_none());
        assert_eq!(queue.waiting(), 1);

        drop(first);
        assert!(third.now_or_never().is_some());
    }

    #[tokio::test]
    async fn test_abandoned_ticket_does_not_leak_a_slot() {
        let queue = DispatchQueue::new(1);
        let permit = queue.acquire().now_or_never().unwrap();

        let abandoned = queue.acquire();
        drop(abandoned);

        drop(permit);
        assert_eq!(queue.running(), 0);

        assert!(queue.acquire().now_or_never().is_some());
    }
}
