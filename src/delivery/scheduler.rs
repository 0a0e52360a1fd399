use super::{DeliveryError, Manifest};
use crate::config::DeliveryConfig;
use crate::firmware::{PatchKind, UpdatePlan};
use crate::network::{with_retry, NetworkServerGateway, RetryPolicy};
use crate::protocol::{chunk_bytes, MessageType, ProtocolFrame};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Second UPDATE_FNAME field flagging a whole-file replacement payload.
pub const FULL_REPLACE_MARKER: &str = "full";

/// Progress notifications raised while delivering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryProgress {
    /// One frame accepted by the group queue (`sent` of `total`)
    FrameQueued { sent: usize, total: usize },
    /// Group queue shrank to `remaining` items
    QueueShrunk { remaining: usize },
}

/// Every file-operation frame for `plan`, in transmission order (manifest excluded).
pub fn delivery_frames(plan: &UpdatePlan, chunk_size: usize) -> Vec<ProtocolFrame> {
    let mut frames = Vec::new();

    for path in plan.operations.deletions() {
        frames.push(ProtocolFrame::new(MessageType::DeleteFile).with_field(path.as_bytes()));
    }

    for (path, patch) in &plan.patches {
        let mut fname = ProtocolFrame::new(MessageType::UpdateFilename).with_field(path.as_bytes());
        if patch.kind == PatchKind::FullReplace {
            fname = fname.with_field(FULL_REPLACE_MARKER);
        }
        frames.push(fname);
        for chunk in chunk_bytes(&patch.compressed, chunk_size) {
            frames.push(ProtocolFrame::new(MessageType::UpdatePatch).with_field(chunk));
        }
        frames.push(ProtocolFrame::new(MessageType::UpdateChecksum).with_field(patch.checksum.as_bytes()));
    }

    frames
}

/// Pushes an update plan into one multicast group's downlink queue.
pub struct DeliveryScheduler {
    gateway: Arc<dyn NetworkServerGateway>,
    group_id: String,
    pacing: Duration,
    chunk_size: usize,
    manifest_repeats: u32,
}

impl DeliveryScheduler {
    pub fn new(
        gateway: Arc<dyn NetworkServerGateway>,
        group_id: impl Into<String>,
        config: &DeliveryConfig,
        pacing: Duration,
    ) -> Self {
        Self {
            gateway,
            group_id: group_id.into(),
            pacing,
            chunk_size: config.chunk_size,
            manifest_repeats: config.manifest_repeats,
        }
    }

    /// Enqueue every frame of `plan` followed by the repeated manifest.
    ///
    /// Each enqueue is followed by the pacing delay. Enqueue is never
    /// retried; the first failure aborts delivery.
    pub async fn deliver<F>(&self, plan: &UpdatePlan, mut on_progress: F) -> Result<Manifest, DeliveryError>
    where
        F: FnMut(DeliveryProgress) + Send,
    {
        let manifest = Manifest::from_operations(&plan.operations);
        let manifest_frame = ProtocolFrame::new(MessageType::Manifest).with_field(manifest.to_json());

        let mut frames = delivery_frames(plan, self.chunk_size);
        let repeats = usize::try_from(self.manifest_repeats).unwrap_or(usize::MAX);
        frames.extend(std::iter::repeat(manifest_frame).take(repeats));
        let total = frames.len();

        info!(
            group_id = %self.group_id,
            frames = total,
            payloads = plan.patches.len(),
            deletions = manifest.delete,
            "Starting multicast delivery"
        );

        for (index, frame) in frames.iter().enumerate() {
            self.gateway
                .enqueue(&self.group_id, &frame.encode())
                .await
                .map_err(|source| DeliveryError::Enqueue {
                    kind: frame.kind,
                    index,
                    source,
                })?;
            debug!(kind = %frame.kind, index, "Frame enqueued");
            on_progress(DeliveryProgress::FrameQueued {
                sent: index + 1,
                total,
            });
            tokio::time::sleep(self.pacing).await;
        }

        info!(group_id = %self.group_id, %total, "All frames enqueued");
        Ok(manifest)
    }

    /// Poll the group queue every `interval` until it is empty.
    ///
    /// Each poll uses `retry`; a poll whose retries are exhausted fails.
    pub async fn await_drain<F>(
        &self,
        interval: Duration,
        retry: RetryPolicy,
        mut on_progress: F,
    ) -> Result<(), DeliveryError>
    where
        F: FnMut(DeliveryProgress) + Send,
    {
        let mut last: Option<usize> = None;
        loop {
            let remaining = with_retry(retry, "queue_length", || self.gateway.queue_length(&self.group_id))
                .await
                .map_err(DeliveryError::QueueLength)?;
            if remaining == 0 {
                info!(group_id = %self.group_id, "Multicast queue drained");
                return Ok(());
            }
            if last.map_or(true, |prev| remaining < prev) {
                debug!(remaining, "Multicast queue draining");
                on_progress(DeliveryProgress::QueueShrunk { remaining });
            }
            last = Some(remaining);
            tokio::time::sleep(interval).await;
        }
    }
}
