//! System-wide default constants.
//!
//! Centralises the protocol timings and limits used across the rollout.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Network Server
// ============================================================================

/// Downlink datarate used for the multicast group (EU868 DR5 = SF7/125kHz).
pub const DOWNLINK_DATARATE: u32 = 5;

/// Downlink frequency used for the multicast group (Hz).
pub const DOWNLINK_FREQUENCY_HZ: u64 = 869_525_000;

/// HTTP client timeout for network server requests (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Application port used for every OTA downlink.
pub const DOWNLINK_FPORT: u8 = 1;

// ============================================================================
// Protocol Timing
// ============================================================================

/// Interval between version queries while waiting for device replies (seconds).
pub const VERSION_QUERY_INTERVAL_SECS: u64 = 8;

/// Pacing between multicast key deliveries to individual devices (seconds).
pub const KEY_PACING_SECS: u64 = 10;

/// Pacing between multicast frames, bounded by the downlink duty cycle (seconds).
pub const FRAME_PACING_SECS: u64 = 4;

/// Poll interval while waiting for the multicast queue to drain (seconds).
pub const QUEUE_POLL_INTERVAL_SECS: u64 = 1;

/// Pause between fleet agreement and starting the next worker (seconds).
pub const SETTLE_DELAY_SECS: u64 = 5;

/// Rollout watchdog deadline without a progress event (seconds).
pub const WATCHDOG_TIMEOUT_SECS: u64 = 300;

// ============================================================================
// Delivery
// ============================================================================

/// Maximum compressed patch bytes carried by one PATCH frame.
pub const PATCH_CHUNK_SIZE: usize = 200;

/// Number of times the manifest is broadcast after file operations.
pub const MANIFEST_REPEATS: u32 = 3;

// ============================================================================
// Retry
// ============================================================================

/// Attempts for idempotent network server reads (first try included).
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Delay before the second attempt; doubles on each further attempt (ms).
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// Cap on a single backoff delay (ms).
pub const RETRY_MAX_DELAY_MS: u64 = 8_000;

/// Maximum backoff exponent (2^N multiplier cap).
pub const RETRY_MAX_BACKOFF_EXPONENT: u32 = 6;

// ============================================================================
// Firmware Store
// ============================================================================

/// Default firmware store root, one sub-directory per version.
pub const FIRMWARE_DIR: &str = "firmware";

/// File names never included in a firmware diff.
pub const IGNORED_FILES: &[&str] = &[".DS_Store", "pymakr.conf"];

/// Extensions treated as binary (always fully replaced, never diffed).
pub const BINARY_EXTENSIONS: &[&str] = &[".bin", ".mpy"];

// ============================================================================
// Integration Endpoint
// ============================================================================

/// Bind address for the uplink HTTP integration endpoint.
pub const INTEGRATION_LISTEN_ADDR: &str = "0.0.0.0:8095";

/// Capacity of the uplink channel between the integration endpoint and the coordinator.
pub const UPLINK_CHANNEL_CAPACITY: usize = 256;
