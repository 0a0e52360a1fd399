//! Delivery Scheduler — paced multicast transmission of an update plan
//!
//! Frames go out in a fixed order: one DELETE_FILE per removed path, then for
//! each payload an UPDATE_FNAME, its UPDATE_PATCH chunks and one
//! UPDATE_CHECKSUM, and finally the MANIFEST repeated a few times. Delivery
//! is unacknowledged; completion is inferred from the group queue draining.

mod manifest;
mod scheduler;

pub use manifest::Manifest;
pub use scheduler::{delivery_frames, DeliveryProgress, DeliveryScheduler, FULL_REPLACE_MARKER};

use crate::network::GatewayError;

/// Delivery errors
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("enqueue of {kind} frame #{index} failed: {source}")]
    Enqueue {
        kind: crate::protocol::MessageType,
        index: usize,
        #[source]
        source: GatewayError,
    },
    #[error("queue length unavailable: {0}")]
    QueueLength(#[source] GatewayError),
}
