use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::audio::AudioChunk;
use crate::error::RecognitionError;
use crate::recognition::pipeline::{PipelineStats, RecognitionPipeline};

/// Consume chunks until the sender side closes or `cancel` fires.
///
/// A chunk already in flight when cancellation arrives gets the configured
/// grace period to finish; after that it is dropped mid-way, which never
/// publishes a partial event because emission is the last step.
pub async fn run_listener(
    mut pipeline: RecognitionPipeline,
    mut receiver: mpsc::Receiver<AudioChunk>,
    cancel: CancellationToken,
) -> Result<PipelineStats, RecognitionError> {
    let grace = pipeline.config().shutdown_grace();
    if let Some(publisher) = pipeline.publisher() {
        publisher.publish_status("on");
    }
    info!(window_secs = pipeline.config().window_duration_secs, "listener started");

    let outcome = loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            chunk = receiver.recv() => match chunk {
                Some(chunk) => chunk,
                None => break Ok(()),
            },
        };

        let processing = pipeline.process_chunk(&chunk);
        tokio::pin!(processing);

        let finished = tokio::select! {
            result = &mut processing => Some(result),
            _ = cancel.cancelled() => None,
        };
        let result = match finished {
            Some(result) => result,
            None => match tokio::time::timeout(grace, &mut processing).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(?grace, "abandoning in-flight chunk");
                    break Ok(());
                }
            },
        };

        if let Err(err) = result {
            error!(error = %err, "stopping listener");
            break Err(err);
        }
    };

    receiver.close();
    if let Some(publisher) = pipeline.publisher() {
        publisher.publish_status("off");
    }

    let stats = pipeline.stats();
    info!(
        chunks = stats.total_chunks,
        detections = stats.detections,
        skipped = stats.skipped_silent,
        "listener stopped"
    );

    outcome.map(|()| stats)
}
