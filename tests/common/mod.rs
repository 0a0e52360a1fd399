//! Shared rollout test harness: an in-memory network server, a unicast
//! transport and a simulated device fleet wired to each other with channels.

#![allow(dead_code)]

use async_trait::async_trait;
use lora_fota::config::RolloutConfig;
use lora_fota::fleet::{FleetCoordinator, RolloutError, RolloutReport};
use lora_fota::network::{GatewayError, GroupSpec, MulticastGroupHandle, MulticastGroupInfo, NetworkServerGateway};
use lora_fota::transport::{Transport, TransportError, Uplink};
use lora_fota::DevEui;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Event log
// ============================================================================

/// Everything observable, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Unicast command sent to a device (message type)
    Unicast(DevEui, u8),
    /// Uplink emitted by a simulated device (message type)
    Uplink(DevEui, u8),
    CreateGroup(String),
    FetchGroup,
    AddDevice(DevEui),
    /// Multicast frame enqueued (message type)
    Enqueue(u8),
    QueueLength(usize),
    DeleteGroup(String),
}

pub type EventLog = Arc<Mutex<Vec<Event>>>;

pub fn count(log: &EventLog, pred: impl Fn(&Event) -> bool) -> usize {
    log.lock().unwrap().iter().filter(|e| pred(e)).count()
}

pub fn position(log: &EventLog, pred: impl Fn(&Event) -> bool) -> Option<usize> {
    log.lock().unwrap().iter().position(pred)
}

pub fn last_position(log: &EventLog, pred: impl Fn(&Event) -> bool) -> Option<usize> {
    log.lock().unwrap().iter().rposition(pred)
}

/// Message type of an encoded `$OTA,<type>,...` frame.
pub fn frame_kind(frame: &[u8]) -> u8 {
    let digits: Vec<u8> = frame
        .iter()
        .skip(5)
        .take_while(|b| b.is_ascii_digit())
        .copied()
        .collect();
    String::from_utf8(digits).unwrap().parse().unwrap()
}

/// Single payload of a multicast frame (`$OTA,<type>,<payload>,*`).
fn frame_payload(frame: &[u8]) -> Vec<u8> {
    let kind = frame_kind(frame).to_string();
    let start = 5 + kind.len() + 1;
    frame[start..frame.len() - 2].to_vec()
}

// ============================================================================
// Network server
// ============================================================================

/// Failure knobs for [`MockGateway`].
#[derive(Debug, Clone, Default)]
pub struct GatewayKnobs {
    pub fail_create: bool,
    /// Zero-based enqueue index that fails
    pub fail_enqueue_at: Option<usize>,
    /// Leading queue-length polls that fail
    pub queue_length_failures: usize,
}

pub struct MockGateway {
    log: EventLog,
    knobs: GatewayKnobs,
    multicast: mpsc::UnboundedSender<Vec<u8>>,
    queue: Mutex<usize>,
    enqueued: AtomicUsize,
    queue_polls: AtomicUsize,
}

#[async_trait]
impl NetworkServerGateway for MockGateway {
    async fn create_group(&self, spec: &GroupSpec) -> Result<MulticastGroupHandle, GatewayError> {
        if self.knobs.fail_create {
            return Err(GatewayError::Rejected("quota exceeded".into()));
        }
        self.log.lock().unwrap().push(Event::CreateGroup(spec.name.clone()));
        Ok(MulticastGroupHandle {
            id: "group-1".into(),
            mc_addr: "01ab02cd".into(),
            mc_nwk_s_key: "00112233445566778899aabbccddeeff".into(),
            mc_app_s_key: "ffeeddccbbaa99887766554433221100".into(),
        })
    }

    async fn fetch_group(&self, group_id: &str) -> Result<MulticastGroupInfo, GatewayError> {
        self.log.lock().unwrap().push(Event::FetchGroup);
        Ok(MulticastGroupInfo {
            id: group_id.to_string(),
            name: "fetched".into(),
            mc_addr: "01ab02cd".into(),
        })
    }

    async fn add_device(&self, device: &DevEui, _group_id: &str) -> Result<(), GatewayError> {
        self.log.lock().unwrap().push(Event::AddDevice(device.clone()));
        Ok(())
    }

    async fn queue_length(&self, _group_id: &str) -> Result<usize, GatewayError> {
        let poll = self.queue_polls.fetch_add(1, Ordering::SeqCst);
        if poll < self.knobs.queue_length_failures {
            return Err(GatewayError::Rejected("timeout".into()));
        }
        let mut queue = self.queue.lock().unwrap();
        let remaining = *queue;
        *queue /= 2;
        self.log.lock().unwrap().push(Event::QueueLength(remaining));
        Ok(remaining)
    }

    async fn enqueue(&self, _group_id: &str, payload: &[u8]) -> Result<(), GatewayError> {
        let index = self.enqueued.fetch_add(1, Ordering::SeqCst);
        if self.knobs.fail_enqueue_at == Some(index) {
            return Err(GatewayError::Rejected("queue full".into()));
        }
        self.log.lock().unwrap().push(Event::Enqueue(frame_kind(payload)));
        *self.queue.lock().unwrap() += 1;
        let _ = self.multicast.send(payload.to_vec());
        Ok(())
    }

    async fn delete_group(&self, group_id: &str) -> Result<(), GatewayError> {
        self.log.lock().unwrap().push(Event::DeleteGroup(group_id.to_string()));
        Ok(())
    }
}

// ============================================================================
// Unicast transport
// ============================================================================

pub struct MockTransport {
    log: EventLog,
    unicast: mpsc::UnboundedSender<(DevEui, Vec<u8>)>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_unicast(&self, device: &DevEui, payload: &[u8]) -> Result<(), TransportError> {
        self.log
            .lock()
            .unwrap()
            .push(Event::Unicast(device.clone(), frame_kind(payload)));
        let _ = self.unicast.send((device.clone(), payload.to_vec()));
        Ok(())
    }
}

// ============================================================================
// Simulated devices
// ============================================================================

/// Behaviour of one simulated end device.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub eui: DevEui,
    pub version: String,
    /// Version reported after the manifest; `None` never reports
    pub final_version: Option<String>,
    /// Version queries ignored before the first reply (`usize::MAX` = never)
    pub ignore_queries: usize,
    /// Key deliveries ignored before listening (`usize::MAX` = never)
    pub ignore_keys: usize,
}

impl SimDevice {
    pub fn new(n: u8, version: &str, final_version: &str) -> Self {
        Self {
            eui: eui(n),
            version: version.to_string(),
            final_version: Some(final_version.to_string()),
            ignore_queries: 0,
            ignore_keys: 0,
        }
    }
}

pub fn eui(n: u8) -> DevEui {
    format!("70b3d5499a0000{n:02x}").parse().unwrap()
}

/// Multicast content as the devices saw it.
#[derive(Debug, Default, Clone)]
pub struct ReceivedUpdate {
    pub deleted: Vec<String>,
    /// path -> (full replacement?, reassembled payload, checksum)
    pub files: BTreeMap<String, (bool, Vec<u8>, String)>,
    pub manifests: Vec<String>,
}

#[derive(Default)]
struct DeviceProgress {
    queries_seen: usize,
    keys_seen: usize,
    listening: bool,
    reported_final: bool,
}

async fn simulate(
    devices: Vec<SimDevice>,
    mut unicast: mpsc::UnboundedReceiver<(DevEui, Vec<u8>)>,
    mut multicast: mpsc::UnboundedReceiver<Vec<u8>>,
    uplinks: mpsc::Sender<Uplink>,
    log: EventLog,
    received: Arc<Mutex<ReceivedUpdate>>,
) {
    let by_eui: HashMap<DevEui, SimDevice> = devices.iter().map(|d| (d.eui.clone(), d.clone())).collect();
    let mut progress: HashMap<DevEui, DeviceProgress> = HashMap::new();
    let mut current_file: Option<String> = None;

    let send = |device: &DevEui, payload: String| {
        let kind = frame_kind(payload.as_bytes());
        log.lock().unwrap().push(Event::Uplink(device.clone(), kind));
        let uplinks = uplinks.clone();
        let device = device.clone();
        async move {
            let _ = uplinks
                .send(Uplink {
                    device,
                    payload: payload.into_bytes(),
                })
                .await;
        }
    };

    loop {
        tokio::select! {
            Some((device, frame)) = unicast.recv() => {
                let Some(sim) = by_eui.get(&device) else { continue };
                let state = progress.entry(device.clone()).or_default();
                match frame_kind(&frame) {
                    1 => {
                        state.queries_seen += 1;
                        if state.queries_seen > sim.ignore_queries {
                            send(&device, format!("$OTA,2,{},*", sim.version)).await;
                        }
                    }
                    3 => {
                        state.keys_seen += 1;
                        if state.keys_seen > sim.ignore_keys {
                            state.listening = true;
                            send(&device, "$OTA,4,*".to_string()).await;
                        }
                    }
                    _ => {}
                }
            }
            Some(frame) = multicast.recv() => {
                let payload = frame_payload(&frame);
                let mut rx = received.lock().unwrap().clone();
                match frame_kind(&frame) {
                    8 => rx.deleted.push(String::from_utf8(payload).unwrap()),
                    5 => {
                        let text = String::from_utf8(payload).unwrap();
                        let (path, full) = match text.strip_suffix(",full") {
                            Some(path) => (path.to_string(), true),
                            None => (text, false),
                        };
                        rx.files.insert(path.clone(), (full, Vec::new(), String::new()));
                        current_file = Some(path);
                    }
                    6 => {
                        if let Some(file) = current_file.as_ref().and_then(|p| rx.files.get_mut(p)) {
                            file.1.extend_from_slice(&payload);
                        }
                    }
                    7 => {
                        if let Some(file) = current_file.as_ref().and_then(|p| rx.files.get_mut(p)) {
                            file.2 = String::from_utf8(payload).unwrap();
                        }
                    }
                    9 => rx.manifests.push(String::from_utf8(payload).unwrap()),
                    _ => {}
                }
                let is_manifest = frame_kind(&frame) == 9;
                *received.lock().unwrap() = rx;

                if is_manifest {
                    for sim in &devices {
                        let state = progress.entry(sim.eui.clone()).or_default();
                        if state.listening && !state.reported_final {
                            if let Some(version) = &sim.final_version {
                                state.reported_final = true;
                                send(&sim.eui, format!("$OTA,0,{version},*")).await;
                            }
                        }
                    }
                }
            }
            else => break,
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub log: EventLog,
    pub received: Arc<Mutex<ReceivedUpdate>>,
    pub coordinator: FleetCoordinator,
    uplinks: Option<mpsc::Receiver<Uplink>>,
}

impl Harness {
    /// Wire a coordinator to simulated devices. Must run inside a runtime.
    pub fn new(config: RolloutConfig, devices: Vec<SimDevice>, knobs: GatewayKnobs) -> Self {
        let log: EventLog = Arc::default();
        let received: Arc<Mutex<ReceivedUpdate>> = Arc::default();
        let (unicast_tx, unicast_rx) = mpsc::unbounded_channel();
        let (multicast_tx, multicast_rx) = mpsc::unbounded_channel();
        let (uplink_tx, uplink_rx) = mpsc::channel(64);

        let gateway = Arc::new(MockGateway {
            log: log.clone(),
            knobs,
            multicast: multicast_tx,
            queue: Mutex::new(0),
            enqueued: AtomicUsize::new(0),
            queue_polls: AtomicUsize::new(0),
        });
        let transport = Arc::new(MockTransport {
            log: log.clone(),
            unicast: unicast_tx,
        });

        tokio::spawn(simulate(
            devices,
            unicast_rx,
            multicast_rx,
            uplink_tx,
            log.clone(),
            received.clone(),
        ));

        Self {
            log,
            received,
            coordinator: FleetCoordinator::new(config, gateway, transport),
            uplinks: Some(uplink_rx),
        }
    }

    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RolloutReport, RolloutError> {
        let uplinks = self.uplinks.take().expect("harness runs once");
        self.coordinator.run(uplinks, cancel).await
    }

    pub fn group_deletions(&self) -> usize {
        count(&self.log, |e| matches!(e, Event::DeleteGroup(_)))
    }

    pub fn group_creations(&self) -> usize {
        count(&self.log, |e| matches!(e, Event::CreateGroup(_)))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Build a firmware store: `versions` maps version -> [(relative path, content)].
pub fn firmware_store(root: &Path, versions: &[(&str, &[(&str, &[u8])])]) {
    for (version, files) in versions {
        let dir = root.join(version);
        std::fs::create_dir_all(&dir).unwrap();
        for (path, content) in *files {
            let file = dir.join(path);
            std::fs::create_dir_all(file.parent().unwrap()).unwrap();
            std::fs::write(file, content).unwrap();
        }
    }
}

pub fn config(store: &Path, devices: &[SimDevice]) -> RolloutConfig {
    let mut config = RolloutConfig::default();
    config.network_server.url = "http://chirpstack.test".into();
    config.network_server.api_key = "test-key".into();
    config.network_server.application_id = "app-1".into();
    config.devices.eui = devices.iter().map(|d| d.eui.clone()).collect();
    config.firmware.store_dir = store.to_path_buf();
    config.retry.base_delay_ms = 100;
    config.retry.max_delay_ms = 400;
    config
}
