//! Fleet Coordinator — one multicast firmware rollout, start to finish
//!
//! ## Phases
//!
//! ```text
//! INIT → AWAIT_VERSION → NEGOTIATE → PROVISION → DELIVER
//!      → AWAIT_COMPLETION → VERIFY → DONE | FAILED
//! ```
//!
//! ## Architecture
//!
//! - **FleetState**: device records plus the ordered active set, behind one lock
//! - **Watchdog**: liveness deadline reset on every transition and inbound frame
//! - **FleetCoordinator**: single control loop consuming uplinks in arrival order
//! - **Workers**: short-lived provisioning and delivery tasks reporting back
//!   over a channel; they never touch device flags
//!
//! Every fatal condition funnels through one cleanup path that stops the
//! watchdog and deletes an already-created multicast group at most once.

mod coordinator;
pub mod state;
pub mod watchdog;
mod workers;

pub use coordinator::FleetCoordinator;
pub use state::{DeviceRecord, FleetState, Verification, VersionDisagreement, VersionReply};
pub use watchdog::Watchdog;

use crate::delivery::{DeliveryError, Manifest};
use crate::firmware::{PatchError, StoreError};
use crate::network::GatewayError;
use crate::protocol::FirmwareVersion;
use crate::types::DevEui;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Rollout state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutPhase {
    Init,
    AwaitVersion,
    Negotiate,
    Provision,
    Deliver,
    AwaitCompletion,
    Verify,
    Done,
    Failed,
}

impl fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::AwaitVersion => "AWAIT_VERSION",
            Self::Negotiate => "NEGOTIATE",
            Self::Provision => "PROVISION",
            Self::Deliver => "DELIVER",
            Self::AwaitCompletion => "AWAIT_COMPLETION",
            Self::Verify => "VERIFY",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Summary of a successful rollout.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    /// Common version the fleet ran before the update; `None` when nobody needed one
    pub from_version: Option<FirmwareVersion>,
    pub target_version: FirmwareVersion,
    pub updated: Vec<DevEui>,
    /// Devices dropped because they already ran the target
    pub skipped_current: Vec<DevEui>,
    pub phases: Vec<RolloutPhase>,
    pub manifest: Option<Manifest>,
}

impl RolloutReport {
    /// True when the rollout ended without sending anything.
    pub fn nothing_to_do(&self) -> bool {
        self.updated.is_empty()
    }
}

/// Fatal rollout errors
#[derive(Debug, thiserror::Error)]
pub enum RolloutError {
    #[error("firmware store: {0}")]
    Store(#[from] StoreError),
    #[error("patch generation: {0}")]
    Patch(#[from] PatchError),
    #[error("network server: {0}")]
    Gateway(#[from] GatewayError),
    #[error("delivery: {0}")]
    Delivery(#[from] DeliveryError),
    #[error(
        "devices disagree on their current firmware; divergent: [{}]; reported: {}",
        join(.divergent),
        join_reported(.reported)
    )]
    VersionDisagreement {
        divergent: Vec<DevEui>,
        reported: BTreeMap<DevEui, FirmwareVersion>,
    },
    #[error("update failed on some devices: [{}]", join(.failed))]
    PartialFailure { failed: Vec<DevEui> },
    #[error("update failed on every device: [{}]", join(.devices))]
    AllDevicesFailed { devices: Vec<DevEui> },
    #[error("no progress before the watchdog deadline (phase {phase})")]
    WatchdogExpired { phase: RolloutPhase },
    #[error("rollout cancelled")]
    Cancelled,
    #[error("uplink channel closed")]
    UplinkClosed,
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

fn join(devices: &[DevEui]) -> String {
    devices
        .iter()
        .map(DevEui::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_reported(reported: &BTreeMap<DevEui, FirmwareVersion>) -> String {
    reported
        .iter()
        .map(|(eui, v)| format!("{eui}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}
