//! Bounded completion queue carrying finished dispatches back to the reactor.
//!
//! Producers are worker tasks; the single consumer is the drain cycle on the
//! reactor thread. The queue never holds more than its capacity. When it is
//! full, [`CompletionSender::push`] suspends the producing task until the
//! reactor frees a slot (the worker thread itself is not blocked and keeps
//! running other tasks), while [`CompletionSender::try_push`] rejects and
//! hands the result back. Queued results are never overwritten.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::dispatch::AppError;

/// Reference queue capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// How the application callback finished.
#[derive(Debug)]
pub enum Outcome {
    /// The response is staged in the connection's request map.
    Succeeded,
    /// The callback failed or panicked.
    Failed(AppError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// A finished dispatch: the connection (ownership returning to the reactor)
/// and how the callback ended.
#[derive(Debug)]
pub struct DispatchResult {
    connection: Connection,
    outcome: Outcome,
}

impl DispatchResult {
    pub fn new(connection: Connection, outcome: Outcome) -> Self {
        Self {
            connection,
            outcome,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn into_parts(self) -> (Connection, Outcome) {
        (self.connection, self.outcome)
    }
}

/// Rejected pushes. The result is returned so its connection is not lost.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("completion queue is full")]
    Full(DispatchResult),

    #[error("completion queue is closed")]
    Closed(DispatchResult),
}

impl QueueError {
    pub fn into_result(self) -> DispatchResult {
        match self {
            Self::Full(result) | Self::Closed(result) => result,
        }
    }
}

/// Creates a queue holding at most `capacity` results.
///
/// # Panics
///
/// Panics if `capacity` is zero. [`ServerConfig::validate`](crate::ServerConfig::validate)
/// rejects that value before a server ever builds a queue.
pub fn completion_queue(capacity: usize) -> (CompletionSender, CompletionReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (CompletionSender { tx }, CompletionReceiver { rx, capacity })
}

/// Producer half, cloned into every dispatch.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    tx: mpsc::Sender<DispatchResult>,
}

impl CompletionSender {
    /// Enqueues `result`, waiting for a free slot while the queue is full.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] once the receiver is gone (server stopped).
    pub async fn push(&self, result: DispatchResult) -> Result<(), QueueError> {
        self.tx
            .send(result)
            .await
            .map_err(|mpsc::error::SendError(result)| QueueError::Closed(result))
    }

    /// Enqueues `result` only if a slot is free right now.
    ///
    /// # Errors
    ///
    /// [`QueueError::Full`] at capacity, [`QueueError::Closed`] after the
    /// receiver is gone.
    pub fn try_push(&self, result: DispatchResult) -> Result<(), QueueError> {
        self.tx.try_send(result).map_err(|e| match e {
            mpsc::error::TrySendError::Full(result) => QueueError::Full(result),
            mpsc::error::TrySendError::Closed(result) => QueueError::Closed(result),
        })
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Slots currently taken, including ones reserved by in-progress pushes.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the reactor thread.
#[derive(Debug)]
pub struct CompletionReceiver {
    rx: mpsc::Receiver<DispatchResult>,
    capacity: usize,
}

impl CompletionReceiver {
    /// Pops the oldest result without waiting.
    pub fn try_pop(&mut self) -> Option<DispatchResult> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refuses further pushes. Results already queued can still be popped.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::connection::ConnectionId;

    fn result(id: u64) -> DispatchResult {
        DispatchResult::new(Connection::new(ConnectionId::new(id)), Outcome::Succeeded)
    }

    #[test]
    fn pops_in_insertion_order() {
        let (tx, mut rx) = completion_queue(8);
        for id in [5, 1, 3] {
            tx.try_push(result(id)).unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| rx.try_pop())
            .map(|r| r.connection().id())
            .collect();
        assert_eq!(
            order,
            vec![ConnectionId::new(5), ConnectionId::new(1), ConnectionId::new(3)]
        );
    }

    #[test]
    fn try_pop_on_empty_returns_none() {
        let (_tx, mut rx) = completion_queue(4);
        assert!(rx.try_pop().is_none());
        assert!(rx.is_empty());
    }

    #[test]
    fn producer_past_capacity_is_rejected_not_overwriting() {
        let (tx, mut rx) = completion_queue(DEFAULT_CAPACITY);
        for id in 0..DEFAULT_CAPACITY as u64 {
            tx.try_push(result(id)).unwrap();
            assert!(rx.len() <= rx.capacity());
        }
        assert_eq!(rx.len(), DEFAULT_CAPACITY);

        let rejected = tx.try_push(result(9999)).unwrap_err();
        assert!(matches!(rejected, QueueError::Full(_)));
        assert_eq!(rejected.into_result().connection().id(), ConnectionId::new(9999));
        assert_eq!(rx.len(), DEFAULT_CAPACITY);

        // The oldest entry is still the first one pushed.
        assert_eq!(rx.try_pop().unwrap().connection().id(), ConnectionId::new(0));
    }

    #[tokio::test]
    async fn push_waits_for_free_slot() {
        let (tx, mut rx) = completion_queue(1);
        tx.push(result(1)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.push(result(2))).await;
        assert!(blocked.is_err(), "push into a full queue must wait");
        assert_eq!(rx.len(), 1);

        let producer = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.push(result(3)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rx.try_pop().unwrap().connection().id(), ConnectionId::new(1));

        producer.await.unwrap().unwrap();
        assert_eq!(rx.try_pop().unwrap().connection().id(), ConnectionId::new(3));
    }

    #[tokio::test]
    async fn push_after_close_hands_result_back() {
        let (tx, mut rx) = completion_queue(2);
        rx.close();
        let err = tx.push(result(7)).await.unwrap_err();
        assert!(matches!(err, QueueError::Closed(_)));
        assert!(tx.is_closed());
    }

    #[test]
    fn sender_len_tracks_occupancy() {
        let (tx, mut rx) = completion_queue(3);
        assert!(tx.is_empty());
        tx.try_push(result(1)).unwrap();
        tx.try_push(result(2)).unwrap();
        assert_eq!(tx.len(), 2);
        rx.try_pop();
        assert_eq!(tx.len(), 1);
        assert_eq!(tx.capacity(), 3);
    }
}
