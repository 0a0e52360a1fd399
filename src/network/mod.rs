//! Network Server Gateway — multicast group lifecycle and downlink queues
//!
//! ## Architecture
//!
//! - **NetworkServerGateway**: narrow async contract the rollout consumes
//! - **ChirpStackClient**: REST implementation against the ChirpStack API
//! - **RetryPolicy**: bounded exponential backoff for idempotent reads only
//!
//! Group creation, device registration, enqueue and deletion are never
//! retried; a failure there is surfaced to the coordinator as-is.

pub mod chirpstack;
pub mod retry;

pub use chirpstack::ChirpStackClient;
pub use retry::{with_retry, RetryPolicy};

use crate::types::DevEui;
use async_trait::async_trait;

/// Keys and addressing for one multicast group, returned once on creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastGroupHandle {
    pub id: String,
    pub mc_addr: String,
    pub mc_nwk_s_key: String,
    pub mc_app_s_key: String,
}

/// Radio and naming parameters for a new multicast group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub name: String,
    pub datarate: u32,
    pub frequency_hz: u64,
    pub application_id: String,
}

/// Group state as reported by the network server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastGroupInfo {
    pub id: String,
    pub name: String,
    pub mc_addr: String,
}

/// Gateway errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Server returned status {status} for {operation}")]
    ServerError {
        operation: &'static str,
        status: reqwest::StatusCode,
    },
    #[error("Malformed response for {operation}: {detail}")]
    MalformedResponse {
        operation: &'static str,
        detail: String,
    },
    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// Backend capabilities consumed by the rollout.
///
/// The bearer credential is held by the implementation.
#[async_trait]
pub trait NetworkServerGateway: Send + Sync + 'static {
    /// Create a CLASS_C multicast group with fresh random session keys.
    async fn create_group(&self, spec: &GroupSpec) -> Result<MulticastGroupHandle, GatewayError>;

    async fn fetch_group(&self, group_id: &str) -> Result<MulticastGroupInfo, GatewayError>;

    async fn add_device(&self, device: &DevEui, group_id: &str) -> Result<(), GatewayError>;

    /// Items still waiting in the group's downlink queue.
    async fn queue_length(&self, group_id: &str) -> Result<usize, GatewayError>;

    async fn enqueue(&self, group_id: &str, payload: &[u8]) -> Result<(), GatewayError>;

    async fn delete_group(&self, group_id: &str) -> Result<(), GatewayError>;
}
