//! Advisory progress events and streaming callbacks.
//!
//! Progress events are fire-and-forget: a closed or missing receiver never affects the run.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

use super::GenerationOutcome;
use crate::error::PipelineStage;
use crate::streaming::StreamFragment;

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub request_id: Uuid,
    pub stage: PipelineStage,
    pub message: String,
    /// Rough completion in `[0, 1]`.
    pub progress: f32,
}

/// Delivered to the `generate_stream` callback.
#[derive(Debug)]
pub enum StreamEvent {
    /// A generated fragment, in arrival order.
    Fragment(StreamFragment),
    /// End of stream, carrying the finished outcome. Sent exactly once.
    End(Box<GenerationOutcome>),
}

impl StreamEvent {
    pub fn is_end(&self) -> bool {
        matches!(self, StreamEvent::End(_))
    }
}

fn stage_progress(stage: PipelineStage) -> f32 {
    match stage {
        PipelineStage::Idle => 0.0,
        PipelineStage::ContextBuilding => 0.05,
        PipelineStage::Retrieving => 0.15,
        PipelineStage::PromptAssembly => 0.25,
        PipelineStage::Generating => 0.35,
        PipelineStage::Extracting => 0.6,
        PipelineStage::Reviewing => 0.7,
        PipelineStage::RegenerationLoop => 0.75,
        PipelineStage::Optimizing => 0.85,
        PipelineStage::Persisting => 0.9,
        PipelineStage::Done | PipelineStage::Failed => 1.0,
    }
}

/// Per-request event emitter.
#[derive(Debug, Clone)]
pub(crate) struct ProgressReporter {
    request_id: Uuid,
    sink: Option<UnboundedSender<PipelineEvent>>,
}

impl ProgressReporter {
    pub(crate) fn new(sink: Option<UnboundedSender<PipelineEvent>>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            sink,
        }
    }

    pub(crate) fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub(crate) fn emit(&self, stage: PipelineStage, message: impl Into<String>) {
        let message = message.into();
        debug!(request_id = %self.request_id, stage = %stage, "{}", message);
        if let Some(sink) = &self.sink {
            let _ = sink.send(PipelineEvent {
                request_id: self.request_id,
                stage,
                message,
                progress: stage_progress(stage),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_reach_receiver() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reporter = ProgressReporter::new(Some(tx));
        reporter.emit(PipelineStage::Generating, "calling model");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.stage, PipelineStage::Generating);
        assert_eq!(event.request_id, reporter.request_id());
        assert_eq!(event.message, "calling model");
    }

    #[test]
    fn test_closed_receiver_is_ignored() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let reporter = ProgressReporter::new(Some(tx));
        reporter.emit(PipelineStage::Done, "finished");
        ProgressReporter::new(None).emit(PipelineStage::Done, "finished");
    }

    #[test]
    fn test_progress_is_monotonic_along_stages() {
        let order = [
            PipelineStage::Idle,
            PipelineStage::ContextBuilding,
            PipelineStage::Retrieving,
            PipelineStage::PromptAssembly,
            PipelineStage::Generating,
            PipelineStage::Extracting,
            PipelineStage::Reviewing,
            PipelineStage::RegenerationLoop,
            PipelineStage::Optimizing,
            PipelineStage::Persisting,
            PipelineStage::Done,
        ];
        assert!(order
            .windows(2)
            .all(|w| stage_progress(w[0]) <= stage_progress(w[1])));
    }
}
