//! Unicast downlinks through the network server's device queue.

use super::{Transport, TransportError};
use crate::config::defaults::DOWNLINK_FPORT;
use crate::config::NetworkServerConfig;
use crate::network::chirpstack::AUTH_HEADER;
use crate::types::DevEui;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceQueueBody<'a> {
    queue_item: DeviceQueueItem<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceQueueItem<'a> {
    dev_eui: &'a str,
    data: String,
    f_port: u8,
    confirmed: bool,
}

/// Sends per-device commands via `POST /api/devices/{devEui}/queue`.
#[derive(Clone)]
pub struct RestDownlinkTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RestDownlinkTransport {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(config: &NetworkServerConfig) -> Result<Self, TransportError> {
        Self::new(
            &config.url,
            &config.api_key,
            Duration::from_secs(config.http_timeout_secs),
        )
    }

    fn queue_url(&self, device: &DevEui) -> String {
        format!("{}/api/devices/{}/queue", self.base_url, device)
    }
}

#[async_trait]
impl Transport for RestDownlinkTransport {
    async fn send_unicast(&self, device: &DevEui, payload: &[u8]) -> Result<(), TransportError> {
        let body = DeviceQueueBody {
            queue_item: DeviceQueueItem {
                dev_eui: device.as_str(),
                data: BASE64.encode(payload),
                f_port: DOWNLINK_FPORT,
                confirmed: false,
            },
        };

        let resp = self
            .http
            .post(self.queue_url(device))
            .header(AUTH_HEADER, format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        match resp.status() {
            status if status.is_success() => {
                debug!(device = %device, bytes = payload.len(), "Unicast downlink queued");
                Ok(())
            }
            status => Err(TransportError::Rejected {
                device: device.clone(),
                status,
            }),
        }
    }
}
