//! Provisioning and delivery worker tasks.
//!
//! Workers only report back through [`WorkerEvent`]; device flags stay with
//! the coordinator. The key re-send pass reads the pending-listener snapshot
//! the coordinator publishes.

use super::RolloutError;
use crate::config::DeliveryConfig;
use crate::delivery::{DeliveryProgress, DeliveryScheduler, Manifest};
use crate::firmware::{FirmwareStore, PatchEngine, StoreError};
use crate::network::{with_retry, GroupSpec, MulticastGroupHandle, NetworkServerGateway, RetryPolicy};
use crate::protocol::{FirmwareVersion, ProtocolFrame};
use crate::transport::Transport;
use crate::types::DevEui;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Worker-to-coordinator notifications.
#[derive(Debug)]
pub(super) enum WorkerEvent {
    GroupCreated(MulticastGroupHandle),
    KeysSent(DevEui),
    Delivery(DeliveryProgress),
    FramesSent(Manifest),
    QueueDrained,
    Failed(RolloutError),
}

pub(super) type EventSender = mpsc::UnboundedSender<WorkerEvent>;

fn notify(events: &EventSender, event: WorkerEvent) {
    // Receiver gone means the rollout already ended.
    let _ = events.send(event);
}

/// PROVISION: group creation, device registration, key distribution.
pub(super) struct ProvisionTask {
    pub gateway: Arc<dyn NetworkServerGateway>,
    pub transport: Arc<dyn Transport>,
    pub spec: GroupSpec,
    pub devices: Vec<DevEui>,
    pub settle: Duration,
    pub key_pacing: Duration,
    pub retry: RetryPolicy,
    pub pending_listeners: watch::Receiver<Vec<DevEui>>,
    pub events: EventSender,
}

impl ProvisionTask {
    pub(super) async fn run(self) -> Result<(), RolloutError> {
        tokio::time::sleep(self.settle).await;

        let group = self.gateway.create_group(&self.spec).await?;
        notify(&self.events, WorkerEvent::GroupCreated(group.clone()));

        let info = with_retry(self.retry, "fetch_group", || self.gateway.fetch_group(&group.id)).await?;
        debug!(group_id = %info.id, mc_addr = %info.mc_addr, name = %info.name, "Multicast group confirmed");

        for device in &self.devices {
            self.gateway.add_device(device, &group.id).await?;
        }
        info!(group_id = %group.id, devices = self.devices.len(), "Devices registered in multicast group");

        let keys = ProtocolFrame::multicast_keys(&group.mc_addr, &group.mc_nwk_s_key, &group.mc_app_s_key).encode();
        for device in &self.devices {
            self.send_keys(device, &keys).await;
        }

        let stragglers = self.pending_listeners.borrow().clone();
        if !stragglers.is_empty() {
            info!(count = stragglers.len(), "Re-sending multicast keys to devices not yet listening");
            for device in &stragglers {
                self.send_keys(device, &keys).await;
            }
        }
        Ok(())
    }

    async fn send_keys(&self, device: &DevEui, keys: &[u8]) {
        match self.transport.send_unicast(device, keys).await {
            Ok(()) => {
                debug!(device = %device, "Multicast keys sent");
                notify(&self.events, WorkerEvent::KeysSent(device.clone()));
            }
            Err(e) => warn!(device = %device, error = %e, "Failed to send multicast keys"),
        }
        tokio::time::sleep(self.key_pacing).await;
    }
}

/// DELIVER + AWAIT_COMPLETION: diff, multicast, wait for the queue to drain.
pub(super) struct DeliveryTask {
    pub gateway: Arc<dyn NetworkServerGateway>,
    pub store: FirmwareStore,
    pub engine: PatchEngine,
    pub current: FirmwareVersion,
    pub latest: FirmwareVersion,
    pub group_id: String,
    pub delivery: DeliveryConfig,
    pub settle: Duration,
    pub frame_pacing: Duration,
    pub queue_poll: Duration,
    pub retry: RetryPolicy,
    pub events: EventSender,
}

impl DeliveryTask {
    pub(super) async fn run(self) -> Result<(), RolloutError> {
        tokio::time::sleep(self.settle).await;

        let left = self.store.tree(&self.current)?;
        if left.is_none() {
            info!(version = %self.current, "No tree for the fleet's version, treating as first install");
        }
        let right = self.store.tree(&self.latest)?.ok_or_else(|| StoreError::MissingVersion {
            path: self.store.root().to_path_buf(),
            version: self.latest.to_string(),
        })?;

        let engine = self.engine.clone();
        let plan = tokio::task::spawn_blocking(move || engine.plan(left.as_deref(), &right))
            .await??;

        let scheduler = DeliveryScheduler::new(self.gateway.clone(), self.group_id.clone(), &self.delivery, self.frame_pacing);
        let events = &self.events;

        let manifest = scheduler
            .deliver(&plan, |p| notify(events, WorkerEvent::Delivery(p)))
            .await?;
        notify(events, WorkerEvent::FramesSent(manifest));

        scheduler
            .await_drain(self.queue_poll, self.retry, |p| notify(events, WorkerEvent::Delivery(p)))
            .await?;
        notify(events, WorkerEvent::QueueDrained);
        Ok(())
    }
}
