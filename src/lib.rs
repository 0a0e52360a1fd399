//! LoRa FOTA: multicast firmware rollouts for LoRaWAN device fleets
//!
//! Updates a fleet of constrained end devices over a ChirpStack network
//! server. The fleet first agrees on its current firmware, then one
//! multicast group carries compressed text patches and binary replacements
//! to every device at once.
//!
//! ## Architecture
//!
//! - **Fleet Coordinator**: protocol state machine and watchdog ([`fleet`])
//! - **Patch Engine**: firmware tree diffing and patch generation ([`firmware`])
//! - **Delivery Scheduler**: framed, paced multicast transmission ([`delivery`])
//! - **Network Server Gateway**: multicast group lifecycle over REST ([`network`])
//! - **Transport**: uplink integration endpoint and unicast downlinks ([`transport`])

pub mod config;
pub mod delivery;
pub mod firmware;
pub mod fleet;
pub mod network;
pub mod protocol;
pub mod transport;
pub mod types;

pub use config::RolloutConfig;
pub use fleet::{FleetCoordinator, RolloutError, RolloutPhase, RolloutReport};
pub use types::DevEui;
