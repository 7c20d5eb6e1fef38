use tokio::sync::mpsc;

use scribe_core::events::{ToolCallMeta, TurnEvent};

use crate::error::EngineError;

/// Sending half of a turn's event stream.
///
/// The channel is bounded, so a slow client paces the turn. A closed receiver
/// means the client went away and the turn should stop.
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::Sender<TurnEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<TurnEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TurnEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub async fn send(&self, event: TurnEvent) -> Result<(), EngineError> {
        self.tx.send(event).await.map_err(|_| EngineError::Aborted)
    }

    /// Content deltas with no text are skipped.
    pub async fn content(&self, text: &str) -> Result<(), EngineError> {
        if text.is_empty() {
            return Ok(());
        }
        self.send(TurnEvent::content(text)).await
    }

    pub async fn tool_call(&self, meta: ToolCallMeta) -> Result<(), EngineError> {
        self.send(TurnEvent::ToolCallDelta(meta)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
