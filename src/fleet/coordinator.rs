use super::state::{FleetState, Verification, VersionReply};
use super::watchdog::Watchdog;
use super::workers::{DeliveryTask, EventSender, ProvisionTask, WorkerEvent};
use super::{RolloutError, RolloutPhase, RolloutReport};
use crate::config::RolloutConfig;
use crate::delivery::{DeliveryProgress, Manifest};
use crate::firmware::{FirmwareStore, PatchEngine};
use crate::network::{GroupSpec, MulticastGroupHandle, NetworkServerGateway};
use crate::protocol::{FirmwareVersion, MessageType, ProtocolFrame};
use crate::transport::{Transport, Uplink};
use crate::types::DevEui;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Drives one rollout against a firmware store, a network server and a
/// device transport.
pub struct FleetCoordinator {
    config: Arc<RolloutConfig>,
    store: FirmwareStore,
    engine: PatchEngine,
    gateway: Arc<dyn NetworkServerGateway>,
    transport: Arc<dyn Transport>,
}

impl FleetCoordinator {
    pub fn new(
        config: RolloutConfig,
        gateway: Arc<dyn NetworkServerGateway>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let store = FirmwareStore::new(config.firmware.store_dir.clone());
        let engine = PatchEngine::from_config(&config.firmware);
        Self {
            config: Arc::new(config),
            store,
            engine,
            gateway,
            transport,
        }
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    /// Run the rollout to a terminal phase.
    ///
    /// `uplinks` must deliver device frames in transport order. Cancelling
    /// `cancel` fails the rollout through the normal cleanup path.
    pub async fn run(
        &self,
        mut uplinks: mpsc::Receiver<Uplink>,
        cancel: CancellationToken,
    ) -> Result<RolloutReport, RolloutError> {
        let latest = self.store.latest()?;
        info!(
            target_version = %latest,
            devices = self.config.devices.eui.len(),
            store = %self.store.root().display(),
            "Starting firmware rollout"
        );

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut rollout = Rollout::new(self, latest, events_tx);

        match rollout.drive(&mut uplinks, &mut events_rx, &cancel).await {
            Ok(()) => {
                rollout.finish().await;
                let report = rollout.report().await;
                info!(
                    target_version = %report.target_version,
                    updated = report.updated.len(),
                    skipped = report.skipped_current.len(),
                    "Rollout complete"
                );
                Ok(report)
            }
            Err(e) => {
                rollout.fail(&e, &mut events_rx).await;
                Err(e)
            }
        }
    }
}

/// Outcome of handling one input.
enum Step {
    Continue,
    Finished,
}

/// Mutable bookkeeping for one `run` call.
struct Rollout<'a> {
    coordinator: &'a FleetCoordinator,
    state: Mutex<FleetState>,
    phase: RolloutPhase,
    phases: Vec<RolloutPhase>,
    watchdog: Option<Watchdog>,
    events: EventSender,
    pending_listeners: watch::Sender<Vec<DevEui>>,
    workers: Vec<JoinHandle<()>>,
    group: Option<MulticastGroupHandle>,
    group_delete_attempted: bool,
    manifest: Option<Manifest>,
}

impl<'a> Rollout<'a> {
    fn new(coordinator: &'a FleetCoordinator, latest: FirmwareVersion, events: EventSender) -> Self {
        let config = &coordinator.config;
        let state = FleetState::new(config.devices.eui.iter().cloned(), latest);
        let (pending_listeners, _) = watch::channel(Vec::new());
        Self {
            coordinator,
            state: Mutex::new(state),
            phase: RolloutPhase::Init,
            phases: vec![RolloutPhase::Init],
            watchdog: Some(Watchdog::start(config.timing.watchdog_timeout())),
            events,
            pending_listeners,
            workers: Vec::new(),
            group: None,
            group_delete_attempted: false,
            manifest: None,
        }
    }

    fn config(&self) -> &RolloutConfig {
        &self.coordinator.config
    }

    fn progress(&self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.progress();
        }
    }

    fn transition(&mut self, next: RolloutPhase) {
        info!(from = %self.phase, to = %next, "Rollout phase transition");
        self.phase = next;
        self.phases.push(next);
        self.progress();
    }

    async fn drive(
        &mut self,
        uplinks: &mut mpsc::Receiver<Uplink>,
        events: &mut mpsc::UnboundedReceiver<WorkerEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), RolloutError> {
        let expired = self
            .watchdog
            .as_ref()
            .map(Watchdog::expiry_token)
            .unwrap_or_default();

        self.transition(RolloutPhase::AwaitVersion);
        if self.state.lock().await.is_empty() {
            return Ok(());
        }

        let mut ticker = tokio::time::interval(self.config().timing.version_query_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                () = cancel.cancelled() => return Err(RolloutError::Cancelled),
                () = expired.cancelled() => return Err(RolloutError::WatchdogExpired { phase: self.phase }),
                uplink = uplinks.recv() => match uplink {
                    Some(uplink) => self.handle_uplink(uplink).await?,
                    None => return Err(RolloutError::UplinkClosed),
                },
                Some(event) = events.recv() => self.handle_event(event).await?,
                _ = ticker.tick(), if self.phase == RolloutPhase::AwaitVersion => {
                    self.query_next_device().await;
                    Step::Continue
                }
            };
            if let Step::Finished = step {
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // AWAIT_VERSION
    // ------------------------------------------------------------------

    async fn query_next_device(&self) {
        let (device, latest) = {
            let mut state = self.state.lock().await;
            let Some(device) = state.next_version_query() else {
                return;
            };
            (device, state.latest().clone())
        };
        let frame = ProtocolFrame::update_info(latest.as_str(), chrono::Utc::now().timestamp());
        match self.coordinator.transport.send_unicast(&device, &frame.encode()).await {
            Ok(()) => debug!(device = %device, "Version query sent"),
            Err(e) => warn!(device = %device, error = %e, "Version query failed"),
        }
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    async fn handle_uplink(&mut self, uplink: Uplink) -> Result<Step, RolloutError> {
        let frame = match ProtocolFrame::decode(&uplink.payload) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(device = %uplink.device, error = %e, "Ignoring undecodable uplink");
                return Ok(Step::Continue);
            }
        };
        if !self.state.lock().await.is_active(&uplink.device) {
            debug!(device = %uplink.device, kind = %frame.kind, "Ignoring frame from inactive device");
            return Ok(Step::Continue);
        }
        self.progress();

        match frame.kind {
            MessageType::UpdateInfoReply => self.on_version_reply(&uplink.device, &frame).await,
            MessageType::Listening => self.on_listening(&uplink.device).await,
            MessageType::DeviceVersion => self.on_device_version(&uplink.device, &frame).await,
            other => {
                debug!(device = %uplink.device, kind = %other, "Ignoring unexpected frame type");
                Ok(Step::Continue)
            }
        }
    }

    async fn on_version_reply(&mut self, device: &DevEui, frame: &ProtocolFrame) -> Result<Step, RolloutError> {
        if self.phase != RolloutPhase::AwaitVersion {
            debug!(device = %device, phase = %self.phase, "Late version reply ignored");
            return Ok(Step::Continue);
        }
        let Some(version) = parse_version(device, frame) else {
            return Ok(Step::Continue);
        };

        let mut state = self.state.lock().await;
        match state.record_version_reply(device, version.clone()) {
            VersionReply::AlreadyCurrent { remaining } => {
                info!(device = %device, version = %version, remaining, "Device already on target version, dropping it");
                if remaining == 0 {
                    info!("No device needs an update");
                    return Ok(Step::Finished);
                }
            }
            VersionReply::Recorded => info!(device = %device, version = %version, "Version reply received"),
            VersionReply::Repeated => debug!(device = %device, version = %version, "Repeated version reply"),
        }

        if !state.all_replied() {
            return Ok(Step::Continue);
        }
        let negotiated = state.negotiate();
        drop(state);

        self.transition(RolloutPhase::Negotiate);
        match negotiated {
            Err(disagreement) => {
                for (eui, v) in &disagreement.reported {
                    error!(device = %eui, version = %v, "Reported version");
                }
                Err(RolloutError::VersionDisagreement {
                    divergent: disagreement.divergent,
                    reported: disagreement.reported,
                })
            }
            Ok(None) => Ok(Step::Finished),
            Ok(Some(current)) => {
                info!(current = %current, "Fleet agrees on current version");
                self.start_provisioning(&current).await;
                Ok(Step::Continue)
            }
        }
    }

    async fn on_listening(&mut self, device: &DevEui) -> Result<Step, RolloutError> {
        if self.phase != RolloutPhase::Provision {
            debug!(device = %device, phase = %self.phase, "Listening confirmation outside provisioning ignored");
            return Ok(Step::Continue);
        }
        {
            let mut state = self.state.lock().await;
            if !state.mark_listening(device) {
                return Ok(Step::Continue);
            }
            let pending = state.pending_listeners();
            info!(device = %device, still_pending = pending.len(), "Device listening on multicast group");
            self.pending_listeners.send_replace(pending);
        }
        self.maybe_start_delivery().await;
        Ok(Step::Continue)
    }

    async fn on_device_version(&mut self, device: &DevEui, frame: &ProtocolFrame) -> Result<Step, RolloutError> {
        if !matches!(
            self.phase,
            RolloutPhase::Deliver | RolloutPhase::AwaitCompletion | RolloutPhase::Verify
        ) {
            debug!(device = %device, phase = %self.phase, "Device version before delivery ignored");
            return Ok(Step::Continue);
        }
        let Some(version) = parse_version(device, frame) else {
            return Ok(Step::Continue);
        };
        if self.state.lock().await.record_final_version(device, version.clone()) {
            info!(device = %device, version = %version, "Device reported post-update version");
        }
        self.try_conclude().await
    }

    // ------------------------------------------------------------------
    // Worker events
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, event: WorkerEvent) -> Result<Step, RolloutError> {
        match event {
            WorkerEvent::GroupCreated(group) => {
                info!(group_id = %group.id, mc_addr = %group.mc_addr, "Multicast group ready");
                self.group = Some(group);
                self.progress();
                self.maybe_start_delivery().await;
            }
            WorkerEvent::KeysSent(device) => {
                debug!(device = %device, "Keys delivered to transport");
                self.progress();
            }
            WorkerEvent::Delivery(DeliveryProgress::FrameQueued { sent, total }) => {
                debug!(sent, total, "Delivery progress");
                self.progress();
            }
            WorkerEvent::Delivery(DeliveryProgress::QueueShrunk { remaining }) => {
                debug!(remaining, "Queue draining");
                self.progress();
            }
            WorkerEvent::FramesSent(manifest) => {
                info!(delete = manifest.delete, update = manifest.update, new = manifest.new, "Update frames queued");
                self.manifest = Some(manifest);
                self.transition(RolloutPhase::AwaitCompletion);
            }
            WorkerEvent::QueueDrained => {
                self.delete_group().await?;
                self.transition(RolloutPhase::Verify);
                return self.try_conclude().await;
            }
            WorkerEvent::Failed(e) => return Err(e),
        }
        Ok(Step::Continue)
    }

    // ------------------------------------------------------------------
    // Phase entry
    // ------------------------------------------------------------------

    async fn start_provisioning(&mut self, current: &FirmwareVersion) {
        self.transition(RolloutPhase::Provision);

        let (devices, latest) = {
            let state = self.state.lock().await;
            (state.active().to_vec(), state.latest().clone())
        };
        self.pending_listeners.send_replace(devices.clone());

        let config = self.config();
        let ns = &config.network_server;
        let task = ProvisionTask {
            gateway: self.coordinator.gateway.clone(),
            transport: self.coordinator.transport.clone(),
            spec: GroupSpec {
                name: format!("{current}-{latest}"),
                datarate: ns.downlink_datarate,
                frequency_hz: ns.downlink_frequency_hz,
                application_id: ns.application_id.clone(),
            },
            devices,
            settle: config.timing.settle_delay(),
            key_pacing: config.timing.key_pacing(),
            retry: config.retry.policy(),
            pending_listeners: self.pending_listeners.subscribe(),
            events: self.events.clone(),
        };
        self.spawn_worker(task.run());
    }

    /// Enter DELIVER once every device listens and the group handle is known.
    async fn maybe_start_delivery(&mut self) {
        if self.phase != RolloutPhase::Provision {
            return;
        }
        let Some(group_id) = self.group.as_ref().map(|g| g.id.clone()) else {
            return;
        };
        let (current, latest) = {
            let state = self.state.lock().await;
            if !state.all_listening() {
                return;
            }
            match state.current() {
                Some(current) => (current.clone(), state.latest().clone()),
                None => return,
            }
        };

        self.transition(RolloutPhase::Deliver);
        let config = self.config();
        let task = DeliveryTask {
            gateway: self.coordinator.gateway.clone(),
            store: self.coordinator.store.clone(),
            engine: self.coordinator.engine.clone(),
            current,
            latest,
            group_id,
            delivery: config.delivery.clone(),
            settle: config.timing.settle_delay(),
            frame_pacing: config.timing.frame_pacing(),
            queue_poll: config.timing.queue_poll_interval(),
            retry: config.retry.policy(),
            events: self.events.clone(),
        };
        self.spawn_worker(task.run());
    }

    fn spawn_worker<F>(&mut self, work: F)
    where
        F: Future<Output = Result<(), RolloutError>> + Send + 'static,
    {
        let events = self.events.clone();
        self.workers.push(tokio::spawn(async move {
            if let Err(e) = work.await {
                let _ = events.send(WorkerEvent::Failed(e));
            }
        }));
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Single-attempt group deletion; never repeated, whatever the result.
    async fn delete_group(&mut self) -> Result<(), RolloutError> {
        if self.group_delete_attempted {
            return Ok(());
        }
        let Some(group) = &self.group else {
            return Ok(());
        };
        self.group_delete_attempted = true;
        self.coordinator.gateway.delete_group(&group.id).await?;
        Ok(())
    }

    async fn try_conclude(&mut self) -> Result<Step, RolloutError> {
        if self.phase != RolloutPhase::Verify {
            return Ok(Step::Continue);
        }
        let mut state = self.state.lock().await;
        if !state.all_finished() {
            return Ok(Step::Continue);
        }
        match state.verdict() {
            Verification::AllMatch => Ok(Step::Finished),
            Verification::Partial(failed) => Err(RolloutError::PartialFailure { failed }),
            Verification::AllFailed(devices) => Err(RolloutError::AllDevicesFailed { devices }),
        }
    }

    async fn stop_workers(&mut self) {
        for worker in self.workers.drain(..) {
            worker.abort();
            let _ = worker.await;
        }
    }

    async fn finish(&mut self) {
        self.stop_workers().await;
        self.transition(RolloutPhase::Done);
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop().await;
        }
    }

    /// The single failure path: stop workers and the watchdog, then delete
    /// any created group if that has not been tried yet.
    async fn fail(&mut self, err: &RolloutError, events: &mut mpsc::UnboundedReceiver<WorkerEvent>) {
        error!(phase = %self.phase, error = %err, "Rollout failed");
        self.stop_workers().await;

        // A group created just before the abort is still in the channel.
        while let Ok(event) = events.try_recv() {
            if let WorkerEvent::GroupCreated(group) = event {
                self.group = Some(group);
            }
        }

        if let Some(watchdog) = self.watchdog.take() {
            watchdog.stop().await;
        }

        if !self.group_delete_attempted {
            if let Some(group) = &self.group {
                self.group_delete_attempted = true;
                match self.coordinator.gateway.delete_group(&group.id).await {
                    Ok(()) => info!(group_id = %group.id, "Multicast group deleted during cleanup"),
                    Err(e) => warn!(group_id = %group.id, error = %e, "Multicast group cleanup failed"),
                }
            }
        }
        self.transition(RolloutPhase::Failed);
    }

    async fn report(&self) -> RolloutReport {
        let state = self.state.lock().await;
        RolloutReport {
            from_version: state.current().cloned(),
            target_version: state.latest().clone(),
            updated: if state.current().is_some() {
                state.active().to_vec()
            } else {
                Vec::new()
            },
            skipped_current: state.skipped().to_vec(),
            phases: self.phases.clone(),
            manifest: self.manifest,
        }
    }
}

fn parse_version(device: &DevEui, frame: &ProtocolFrame) -> Option<FirmwareVersion> {
    match frame.text_field(0).map(str::parse::<FirmwareVersion>) {
        Ok(Ok(version)) => Some(version),
        Ok(Err(e)) => {
            warn!(device = %device, kind = %frame.kind, error = %e, "Unparseable version");
            None
        }
        Err(e) => {
            warn!(device = %device, error = %e, "Malformed frame");
            None
        }
    }
}
