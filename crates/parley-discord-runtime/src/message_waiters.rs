//! Timeout-bounded waits for a matching inbound event.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use tokio::sync::oneshot;

type Predicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

struct Waiter<E> {
    id: u64,
    predicate: Predicate<E>,
    sender: oneshot::Sender<E>,
}

/// Listeners that resolve on the first inbound event matching their
/// predicate, or give up at a deadline.
///
/// The gateway offers every event here before normal handling; an event
/// claimed by a waiter is not processed further.
pub struct MessageWaiters<E> {
    waiters: Mutex<Vec<Waiter<E>>>,
    next_id: AtomicU64,
}

impl<E> Default for MessageWaiters<E> {
    fn default() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E: Send + 'static> MessageWaiters<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Waits up to `timeout` for an event accepted by `predicate`. Returns
    /// `None` on deadline; the listener is removed either way.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> Option<E>
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Waiter {
                id,
                predicate: Box::new(predicate),
                sender,
            });

        let outcome = tokio::time::timeout(timeout, receiver).await;
        self.waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|waiter| waiter.id != id);
        match outcome {
            Ok(Ok(event)) => Some(event),
            Ok(Err(_)) | Err(_) => None,
        }
    }

    /// Hands `event` to the oldest matching listener. Returns the event back
    /// when nobody claimed it.
    pub fn offer(&self, event: E) -> Result<(), E> {
        let mut waiters = self.waiters.lock().unwrap_or_else(PoisonError::into_inner);
        let mut event = event;
        while let Some(index) = waiters.iter().position(|waiter| (waiter.predicate)(&event)) {
            let waiter = waiters.remove(index);
            match waiter.sender.send(event) {
                Ok(()) => return Ok(()),
                // The waiter timed out between matching and delivery.
                Err(returned) => event = returned,
            }
        }
        Err(event)
    }
}
