//! Handle for sending messages to a stream worker.
//!
//! The mailbox is bounded and single-consumer; the handle only ever enqueues,
//! so routing never waits on a worker.

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::StreamMessage;

/// Error type for send operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// The worker has exited and its mailbox is closed.
    WorkerStopped,
    /// The mailbox is full.
    MailboxFull,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::WorkerStopped => write!(f, "Worker has stopped"),
            SendError::MailboxFull => write!(f, "Mailbox is full"),
        }
    }
}

impl std::error::Error for SendError {}

/// Handle to one stream worker.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: mpsc::Sender<StreamMessage>,
    cancellation_token: CancellationToken,
    stream_id: String,
    max_capacity: usize,
}

impl WorkerHandle {
    pub fn new(
        stream_id: impl Into<String>,
        sender: mpsc::Sender<StreamMessage>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let max_capacity = sender.max_capacity();
        Self {
            sender,
            cancellation_token,
            stream_id: stream_id.into(),
            max_capacity,
        }
    }

    /// Enqueue without waiting.
    pub fn try_send(&self, msg: StreamMessage) -> Result<(), SendError> {
        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendError::MailboxFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendError::WorkerStopped),
        }
    }

    /// Returns `(current_available, max_capacity)`.
    pub fn mailbox_capacity(&self) -> (usize, usize) {
        (self.sender.capacity(), self.max_capacity)
    }

    /// Number of queued, unprocessed messages.
    pub fn queued(&self) -> usize {
        self.max_capacity.saturating_sub(self.sender.capacity())
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn id(&self) -> &str {
        &self.stream_id
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("stream_id", &self.stream_id)
            .field("capacity", &self.mailbox_capacity())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (WorkerHandle, mpsc::Receiver<StreamMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (WorkerHandle::new("cam1", tx, CancellationToken::new()), rx)
    }

    #[tokio::test]
    async fn test_try_send_delivers() {
        let (handle, mut rx) = handle(4);
        handle.try_send(StreamMessage::Stop).unwrap();
        assert!(matches!(rx.recv().await, Some(StreamMessage::Stop)));
    }

    #[tokio::test]
    async fn test_mailbox_full() {
        let (handle, _rx) = handle(1);
        handle.try_send(StreamMessage::Stop).unwrap();
        assert_eq!(handle.queued(), 1);
        assert_eq!(handle.try_send(StreamMessage::Stop), Err(SendError::MailboxFull));
        assert_eq!(handle.mailbox_capacity(), (0, 1));
    }

    #[tokio::test]
    async fn test_worker_stopped() {
        let (handle, rx) = handle(4);
        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(handle.try_send(StreamMessage::Stop), Err(SendError::WorkerStopped));
    }

    #[test]
    fn test_cancel() {
        let (handle, _rx) = handle(1);
        assert!(!handle.is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
