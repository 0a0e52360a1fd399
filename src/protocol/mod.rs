//! OTA wire protocol shared with device firmware: frames and versions.

pub mod frame;
pub mod version;

pub use frame::{chunk_bytes, FrameError, MessageType, ProtocolFrame};
pub use version::{FirmwareVersion, VersionError};
