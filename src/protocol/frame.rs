//! OTA control/data frame codec.
//!
//! Wire layout: `$OTA,<type>,<field>,...,*`. Fields are joined by commas with
//! no escaping; PATCH frames carry raw compressed bytes in their single field,
//! so only inbound (device to server) frames are ever split back into fields.

use std::fmt;

pub const FRAME_HEADER: &[u8] = b"$OTA";
pub const FRAME_TAIL: &[u8] = b"*";
const DELIMITER: u8 = b',';

/// Bounded message vocabulary shared with the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    DeviceVersion = 0,
    UpdateInfo = 1,
    UpdateInfoReply = 2,
    MulticastKey = 3,
    Listening = 4,
    UpdateFilename = 5,
    UpdatePatch = 6,
    UpdateChecksum = 7,
    DeleteFile = 8,
    Manifest = 9,
}

impl MessageType {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::DeviceVersion,
            1 => Self::UpdateInfo,
            2 => Self::UpdateInfoReply,
            3 => Self::MulticastKey,
            4 => Self::Listening,
            5 => Self::UpdateFilename,
            6 => Self::UpdatePatch,
            7 => Self::UpdateChecksum,
            8 => Self::DeleteFile,
            9 => Self::Manifest,
            _ => return None,
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DeviceVersion => "DEVICE_VERSION",
            Self::UpdateInfo => "UPDATE_INFO",
            Self::UpdateInfoReply => "UPDATE_INFO_REPLY",
            Self::MulticastKey => "MULTICAST_KEY",
            Self::Listening => "LISTENING",
            Self::UpdateFilename => "UPDATE_FNAME",
            Self::UpdatePatch => "UPDATE_PATCH",
            Self::UpdateChecksum => "UPDATE_CHECKSUM",
            Self::DeleteFile => "DELETE_FILE",
            Self::Manifest => "MANIFEST",
        };
        f.write_str(name)
    }
}

/// Frame decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("missing $OTA header")]
    MissingHeader,
    #[error("missing or non-numeric message type")]
    BadType,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("{kind} frame is missing field #{index}")]
    MissingField { kind: MessageType, index: usize },
    #[error("field is not valid UTF-8")]
    NotText,
}

/// One OTA frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolFrame {
    pub kind: MessageType,
    pub fields: Vec<Vec<u8>>,
}

impl ProtocolFrame {
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, field: impl Into<Vec<u8>>) -> Self {
        self.fields.push(field.into());
        self
    }

    /// UPDATE_INFO: announce the target version, stamped with the send time.
    pub fn update_info(latest: &str, unix_seconds: i64) -> Self {
        Self::new(MessageType::UpdateInfo)
            .with_field(latest)
            .with_field(unix_seconds.to_string())
    }

    pub fn multicast_keys(mc_addr: &str, nwk_s_key: &str, app_s_key: &str) -> Self {
        Self::new(MessageType::MulticastKey)
            .with_field(mc_addr)
            .with_field(nwk_s_key)
            .with_field(app_s_key)
    }

    pub fn encode(&self) -> Vec<u8> {
        let payload: usize = self.fields.iter().map(|f| f.len() + 1).sum();
        let mut out = Vec::with_capacity(FRAME_HEADER.len() + 4 + payload + FRAME_TAIL.len());
        out.extend_from_slice(FRAME_HEADER);
        out.push(DELIMITER);
        out.extend_from_slice(self.kind.code().to_string().as_bytes());
        for field in &self.fields {
            out.push(DELIMITER);
            out.extend_from_slice(field);
        }
        out.push(DELIMITER);
        out.extend_from_slice(FRAME_TAIL);
        out
    }

    /// Decode a device uplink. The tail is optional; trailing whitespace is ignored.
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        let raw = trim_ascii_end(raw);
        let body = raw
            .strip_prefix(FRAME_HEADER)
            .and_then(|rest| rest.strip_prefix(&[DELIMITER]))
            .ok_or(FrameError::MissingHeader)?;
        let body = body.strip_suffix(FRAME_TAIL).unwrap_or(body);
        let body = body.strip_suffix(&[DELIMITER]).unwrap_or(body);

        let mut parts = body.split(|b| *b == DELIMITER);
        let code = parts
            .next()
            .and_then(|p| std::str::from_utf8(p).ok())
            .and_then(|p| p.trim().parse::<u8>().ok())
            .ok_or(FrameError::BadType)?;
        let kind = MessageType::from_code(code).ok_or(FrameError::UnknownType(code))?;

        Ok(Self {
            kind,
            fields: parts.map(<[u8]>::to_vec).collect(),
        })
    }

    /// Field `index` as trimmed text.
    pub fn text_field(&self, index: usize) -> Result<&str, FrameError> {
        let field = self.fields.get(index).ok_or(FrameError::MissingField {
            kind: self.kind,
            index,
        })?;
        std::str::from_utf8(field)
            .map(str::trim)
            .map_err(|_| FrameError::NotText)
    }
}

fn trim_ascii_end(mut raw: &[u8]) -> &[u8] {
    while let [rest @ .., last] = raw {
        if last.is_ascii_whitespace() || *last == 0 {
            raw = rest;
        } else {
            break;
        }
    }
    raw
}

/// Split `data` into consecutive chunks of at most `size` bytes.
///
/// Empty input yields no chunks.
pub fn chunk_bytes(data: &[u8], size: usize) -> impl Iterator<Item = &[u8]> {
    data.chunks(size.max(1))
}
