//! Rollout Configuration Module
//!
//! One [`RolloutConfig`] value is built at startup and handed to every
//! component. There is no global accessor.
//!
//! ## Loading Order
//!
//! 1. Path given on the command line (`--config`)
//! 2. `LORA_FOTA_CONFIG` environment variable (path to TOML file)
//! 3. `rollout.toml` in the current working directory
//! 4. Built-in defaults
//!
//! Environment overrides (`LORA_FOTA_API_KEY`, `LORA_FOTA_SERVER_URL`,
//! `LORA_FOTA_APP_ID`, `LORA_FOTA_DEVICE_EUI`) are applied on top of whichever
//! source won, then the result is validated.

mod rollout_config;
pub mod defaults;

pub use rollout_config::*;
