//! ChirpStack REST client — multicast groups and their downlink queues.

use super::{GatewayError, GroupSpec, MulticastGroupHandle, MulticastGroupInfo, NetworkServerGateway};
use crate::config::defaults::DOWNLINK_FPORT;
use crate::config::NetworkServerConfig;
use crate::types::DevEui;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Header the ChirpStack REST gateway maps onto gRPC authorization metadata.
pub(crate) const AUTH_HEADER: &str = "Grpc-Metadata-Authorization";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupBody<'a> {
    multicast_group: NewGroup<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewGroup<'a> {
    id: &'a str,
    name: &'a str,
    application_id: &'a str,
    mc_addr: &'a str,
    mc_nwk_s_key: &'a str,
    mc_app_s_key: &'a str,
    group_type: &'static str,
    dr: u32,
    frequency: u64,
    f_cnt: u32,
    ping_slot_period: u32,
}

#[derive(Deserialize)]
struct CreateGroupResponse {
    id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetGroupResponse {
    multicast_group: Option<GroupBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupBody {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mc_addr: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddDeviceBody<'a> {
    dev_eui: &'a str,
    multicast_group_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueResponse {
    multicast_queue_items: Option<Vec<serde_json::Value>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueBody {
    queue_item: QueueItem,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueItem {
    data: String,
    f_cnt: u32,
    f_port: u8,
}

/// HTTP client for the ChirpStack multicast API.
#[derive(Clone)]
pub struct ChirpStackClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ChirpStackClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(config: &NetworkServerConfig) -> Result<Self, GatewayError> {
        Self::new(
            &config.url,
            &config.api_key,
            Duration::from_secs(config.http_timeout_secs),
        )
    }

    /// Get base URL for logging
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn groups_url(&self, suffix: &str) -> String {
        format!("{}/api/multicast-groups{suffix}", self.base_url)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    async fn expect_success(
        operation: &'static str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, GatewayError> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(GatewayError::ServerError { operation, status })
        }
    }
}

#[async_trait]
impl NetworkServerGateway for ChirpStackClient {
    async fn create_group(&self, spec: &GroupSpec) -> Result<MulticastGroupHandle, GatewayError> {
        let keys = GroupKeys::generate();
        let body = CreateGroupBody {
            multicast_group: NewGroup {
                id: &keys.id,
                name: &spec.name,
                application_id: &spec.application_id,
                mc_addr: &keys.mc_addr,
                mc_nwk_s_key: &keys.mc_nwk_s_key,
                mc_app_s_key: &keys.mc_app_s_key,
                group_type: "CLASS_C",
                dr: spec.datarate,
                frequency: spec.frequency_hz,
                f_cnt: 0,
                ping_slot_period: 0,
            },
        };

        let resp = self
            .http
            .post(self.groups_url(""))
            .header(AUTH_HEADER, self.bearer())
            .json(&body)
            .send()
            .await?;
        let resp = Self::expect_success("create_group", resp).await?;
        let created: CreateGroupResponse = resp.json().await?;
        let id = created.id.ok_or(GatewayError::MalformedResponse {
            operation: "create_group",
            detail: "response carries no group id".to_string(),
        })?;

        info!(group_id = %id, name = %spec.name, "Multicast group created");
        Ok(MulticastGroupHandle {
            id,
            mc_addr: keys.mc_addr,
            mc_nwk_s_key: keys.mc_nwk_s_key,
            mc_app_s_key: keys.mc_app_s_key,
        })
    }

    async fn fetch_group(&self, group_id: &str) -> Result<MulticastGroupInfo, GatewayError> {
        let resp = self
            .http
            .get(self.groups_url(&format!("/{group_id}")))
            .header(AUTH_HEADER, self.bearer())
            .header("Accept", "application/json")
            .send()
            .await?;
        let resp = Self::expect_success("fetch_group", resp).await?;
        let body: GetGroupResponse = resp.json().await?;
        let group = body.multicast_group.ok_or(GatewayError::MalformedResponse {
            operation: "fetch_group",
            detail: "missing multicastGroup".to_string(),
        })?;
        Ok(MulticastGroupInfo {
            id: if group.id.is_empty() { group_id.to_string() } else { group.id },
            name: group.name,
            mc_addr: group.mc_addr,
        })
    }

    async fn add_device(&self, device: &DevEui, group_id: &str) -> Result<(), GatewayError> {
        let body = AddDeviceBody {
            dev_eui: device.as_str(),
            multicast_group_id: group_id,
        };
        let resp = self
            .http
            .post(self.groups_url(&format!("/{group_id}/devices")))
            .header(AUTH_HEADER, self.bearer())
            .json(&body)
            .send()
            .await?;
        Self::expect_success("add_device", resp).await?;
        debug!(device = %device, group_id, "Device added to multicast group");
        Ok(())
    }

    async fn queue_length(&self, group_id: &str) -> Result<usize, GatewayError> {
        let resp = self
            .http
            .get(self.groups_url(&format!("/{group_id}/queue")))
            .header(AUTH_HEADER, self.bearer())
            .send()
            .await?;
        let resp = Self::expect_success("queue_length", resp).await?;
        let body: QueueResponse = resp.json().await?;
        body.multicast_queue_items
            .map(|items| items.len())
            .ok_or(GatewayError::MalformedResponse {
                operation: "queue_length",
                detail: "missing multicastQueueItems".to_string(),
            })
    }

    async fn enqueue(&self, group_id: &str, payload: &[u8]) -> Result<(), GatewayError> {
        let body = EnqueueBody {
            queue_item: QueueItem {
                data: BASE64.encode(payload),
                f_cnt: 0,
                f_port: DOWNLINK_FPORT,
            },
        };
        let resp = self
            .http
            .post(self.groups_url(&format!("/{group_id}/queue")))
            .header(AUTH_HEADER, self.bearer())
            .json(&body)
            .send()
            .await?;
        Self::expect_success("enqueue", resp).await?;
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> Result<(), GatewayError> {
        let resp = self
            .http
            .delete(self.groups_url(&format!("/{group_id}")))
            .header(AUTH_HEADER, self.bearer())
            .send()
            .await?;
        Self::expect_success("delete_group", resp).await?;
        info!(group_id, "Multicast group deleted");
        Ok(())
    }
}

/// Independently random identifiers and session keys for a new group.
struct GroupKeys {
    id: String,
    mc_addr: String,
    mc_nwk_s_key: String,
    mc_app_s_key: String,
}

impl GroupKeys {
    fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut random_hex = |len: usize| {
            let mut bytes = vec![0u8; len];
            rng.fill_bytes(&mut bytes);
            hex::encode(bytes)
        };
        Self {
            id: Uuid::new_v4().to_string(),
            mc_addr: random_hex(4),
            mc_nwk_s_key: random_hex(16),
            mc_app_s_key: random_hex(16),
        }
    }
}
