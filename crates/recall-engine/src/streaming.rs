use tokio::sync::mpsc;
use tracing::debug;

use recall_core::events::StreamEvent;

use crate::error::EngineError;

/// Buffer between a streaming run and its consumer.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Sending half of a streaming run. A failed send means the consumer is gone
/// and the run must stop.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn send(&self, event: StreamEvent) -> Result<(), EngineError> {
        self.tx.send(event).await.map_err(|e| {
            debug!(event = e.0.event_type(), "stream consumer gone");
            EngineError::Cancelled
        })
    }

    /// Resolves when the consumer drops its receiver.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Final event for a run that ended with `result`. `None` when the consumer
/// already left and nothing should be sent.
pub fn terminal_event<T>(
    result: &Result<T, EngineError>,
    done: impl FnOnce(&T) -> StreamEvent,
) -> Option<StreamEvent> {
    match result {
        Ok(outcome) => Some(done(outcome)),
        Err(EngineError::Cancelled) => None,
        Err(e) => Some(StreamEvent::Error {
            error: e.user_message(),
        }),
    }
}
