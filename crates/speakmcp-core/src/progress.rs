//! Progress reporting
//!
//! The agent loop emits events as it goes. Emission is fire-and-forget:
//! sinks must not block and the loop never waits on them.

use tokio::sync::mpsc;

use crate::session::types::{ProgressStep, ProgressUpdate};

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A single step was added or changed
    Step {
        session_id: String,
        step: ProgressStep,
    },
    /// Full snapshot of the run
    Update(ProgressUpdate),
}

impl ProgressEvent {
    pub fn session_id(&self) -> &str {
        match self {
            ProgressEvent::Step { session_id, .. } => session_id,
            ProgressEvent::Update(update) => &update.session_id,
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards everything
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards events over an unbounded channel
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver just means nobody is watching
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::types::{StepKind, StepStatus};

    #[tokio::test]
    async fn test_channel_sink_forwards_and_tolerates_dropped_receiver() {
        let (sink, mut rx) = ChannelProgressSink::new();
        sink.emit(ProgressEvent::Step {
            session_id: "s1".into(),
            step: ProgressStep::new("Thinking", StepStatus::InProgress, StepKind::Thinking),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), "s1");

        drop(rx);
        sink.emit(ProgressEvent::Step {
            session_id: "s1".into(),
            step: ProgressStep::new("Thinking", StepStatus::Completed, StepKind::Thinking),
        });
    }
}
