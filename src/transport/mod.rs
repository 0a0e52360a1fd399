//! Device transport — fleet-wide uplinks in, unicast commands out
//!
//! - **Inbound**: network-server integration events arrive over HTTP
//!   ([`integration`]), are unwrapped into [`Uplink`]s ([`envelope`]) and
//!   forwarded in arrival order into one bounded channel.
//! - **Outbound**: [`Transport`] sends one payload to one device; the
//!   production implementation enqueues a unicast downlink over REST
//!   ([`downlink`]).

pub mod downlink;
pub mod envelope;
pub mod integration;

pub use downlink::RestDownlinkTransport;
pub use envelope::parse_envelope;
pub use integration::{integration_router, serve_integration, IntegrationState};

use crate::types::DevEui;
use async_trait::async_trait;

/// One application payload received from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uplink {
    pub device: DevEui,
    pub payload: Vec<u8>,
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Downlink to {device} rejected with status {status}")]
    Rejected {
        device: DevEui,
        status: reqwest::StatusCode,
    },
    #[error("Malformed uplink envelope: {0}")]
    Envelope(String),
}

/// Outbound unicast channel to a single device.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_unicast(&self, device: &DevEui, payload: &[u8]) -> Result<(), TransportError>;
}
