//! Network-server uplink event envelopes.
//!
//! ChirpStack v4 nests the identifier under `deviceInfo.devEui`; v3 puts it
//! at the top level as `devEUI`. Both carry the application payload as
//! base64 in `data`.

use super::{TransportError, Uplink};
use crate::types::DevEui;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UplinkEnvelope {
    device_info: Option<DeviceInfo>,
    #[serde(rename = "devEUI")]
    dev_eui: Option<String>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceInfo {
    dev_eui: String,
}

/// Extract the device identifier and decoded payload from an event body.
pub fn parse_envelope(body: &[u8]) -> Result<Uplink, TransportError> {
    let envelope: UplinkEnvelope =
        serde_json::from_slice(body).map_err(|e| TransportError::Envelope(e.to_string()))?;

    let raw_eui = envelope
        .device_info
        .map(|info| info.dev_eui)
        .or(envelope.dev_eui)
        .ok_or_else(|| TransportError::Envelope("no device identifier".to_string()))?;
    let device: DevEui = raw_eui
        .parse()
        .map_err(|e: crate::types::InvalidDevEui| TransportError::Envelope(e.to_string()))?;

    // Uplinks without application data (e.g. MAC-only) carry an empty payload.
    let payload = match envelope.data.as_deref() {
        None | Some("") => Vec::new(),
        Some(data) => BASE64
            .decode(data.trim())
            .map_err(|e| TransportError::Envelope(format!("data is not base64: {e}")))?,
    };

    Ok(Uplink { device, payload })
}
