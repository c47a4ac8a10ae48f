use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// The producing end of a bounded notification queue.
///
/// Polling operations deliver what they find through a feed. Offering never
/// waits: when the consumer is behind, the batch is dropped and the next
/// poll delivers a fresher one.
#[derive(Debug)]
pub struct Feed<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> Feed<T> {
    /// Create a feed and the receiver the consumer reads from.
    pub fn channel(capacity: usize) -> (Feed<T>, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Feed { tx }, rx)
    }

    /// Hand `item` to the consumer if there is room. Returns whether it was
    /// accepted.
    pub fn offer(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("feed full, dropping notification");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
