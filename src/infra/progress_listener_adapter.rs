use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::app::ports::{ProgressEvent, ProgressListener};

/// Forwards progress events into an unbounded channel. Sending never blocks a worker;
/// events are dropped once the receiver is gone.
pub struct ChannelProgressListener {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressListener {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl ProgressListener for ChannelProgressListener {
    fn on_progress(&self, event: &ProgressEvent) {
        if self.sender.send(event.clone()).is_err() {
            debug!(batch_id = %event.batch_id, "Progress receiver dropped");
        }
    }
}

/// Logs progress every `every` records and once on completion
pub struct LoggingProgressListener {
    every: usize,
}

impl LoggingProgressListener {
    pub fn new(every: usize) -> Self {
        Self { every: every.max(1) }
    }
}

impl ProgressListener for LoggingProgressListener {
    fn on_progress(&self, event: &ProgressEvent) {
        if event.processed == event.total || (event.processed > 0 && event.processed % self.every == 0) {
            info!(
                batch_id = %event.batch_id,
                processed = event.processed,
                total = event.total,
                "Batch progress {:.1}%",
                event.percentage
            );
        }
    }
}
