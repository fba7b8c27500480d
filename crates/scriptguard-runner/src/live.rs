use scriptguard_core::LogMessage;
use tokio::sync::broadcast;

/// Best-effort fan-out of log lines to live viewers.
///
/// Publishing never blocks and never fails: with no subscribers the message
/// is discarded, and a subscriber that falls behind sees
/// `RecvError::Lagged` and skips ahead.
#[derive(Debug, Clone)]
pub struct LiveLog {
    tx: broadcast::Sender<LogMessage>,
}

impl LiveLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, message: LogMessage) {
        let _ = self.tx.send(message);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
