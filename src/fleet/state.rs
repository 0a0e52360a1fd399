//! Fleet bookkeeping for one rollout.
//!
//! The device map and the ordered active set live together in
//! [`FleetState`] so that pruning a device that is already current removes
//! it from both in one call.

use crate::protocol::FirmwareVersion;
use crate::types::DevEui;
use std::collections::{BTreeMap, HashMap};

/// Per-device protocol progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub eui: DevEui,
    /// Version reported in UPDATE_INFO_REPLY
    pub version: Option<FirmwareVersion>,
    pub replied_version_info: bool,
    pub listening: bool,
    pub finished_update: bool,
    /// Version reported in DEVICE_VERSION after the update
    pub final_version: Option<FirmwareVersion>,
}

impl DeviceRecord {
    pub fn new(eui: DevEui) -> Self {
        Self {
            eui,
            version: None,
            replied_version_info: false,
            listening: false,
            finished_update: false,
            final_version: None,
        }
    }
}

/// Result of recording an UPDATE_INFO_REPLY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionReply {
    /// Device already runs the target and was pruned; `remaining` devices stay active
    AlreadyCurrent { remaining: usize },
    Recorded,
    /// Device had already replied; the reply is kept but changes nothing
    Repeated,
}

/// Devices whose reported version differs from the majority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDisagreement {
    pub divergent: Vec<DevEui>,
    pub reported: BTreeMap<DevEui, FirmwareVersion>,
}

/// Final verification verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    AllMatch,
    Partial(Vec<DevEui>),
    AllFailed(Vec<DevEui>),
}

/// Everything the coordinator knows about the fleet.
#[derive(Debug, Clone)]
pub struct FleetState {
    devices: HashMap<DevEui, DeviceRecord>,
    active: Vec<DevEui>,
    latest: FirmwareVersion,
    current: Option<FirmwareVersion>,
    failed: Vec<DevEui>,
    skipped: Vec<DevEui>,
    query_cursor: usize,
}

impl FleetState {
    pub fn new(devices: impl IntoIterator<Item = DevEui>, latest: FirmwareVersion) -> Self {
        let mut active = Vec::new();
        let mut map = HashMap::new();
        for eui in devices {
            if !map.contains_key(&eui) {
                map.insert(eui.clone(), DeviceRecord::new(eui.clone()));
                active.push(eui);
            }
        }
        Self {
            devices: map,
            active,
            latest,
            current: None,
            failed: Vec::new(),
            skipped: Vec::new(),
            query_cursor: 0,
        }
    }

    pub fn latest(&self) -> &FirmwareVersion {
        &self.latest
    }

    /// Negotiated common version, once unanimous.
    pub fn current(&self) -> Option<&FirmwareVersion> {
        self.current.as_ref()
    }

    pub fn active(&self) -> &[DevEui] {
        &self.active
    }

    pub fn is_active(&self, eui: &DevEui) -> bool {
        self.devices.contains_key(eui)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Devices pruned because they already ran the target.
    pub fn skipped(&self) -> &[DevEui] {
        &self.skipped
    }

    /// Devices that failed final verification.
    pub fn failed(&self) -> &[DevEui] {
        &self.failed
    }

    // ------------------------------------------------------------------
    // AWAIT_VERSION / NEGOTIATE
    // ------------------------------------------------------------------

    /// Next device still owing a version reply, cycling through the active set.
    pub fn next_version_query(&mut self) -> Option<DevEui> {
        let n = self.active.len();
        for step in 0..n {
            let idx = (self.query_cursor + step) % n;
            let eui = &self.active[idx];
            if self.devices.get(eui).is_some_and(|d| !d.replied_version_info) {
                self.query_cursor = (idx + 1) % n;
                return Some(eui.clone());
            }
        }
        None
    }

    /// Record an UPDATE_INFO_REPLY. A device reporting the target is pruned
    /// from both the map and the active set in this one call.
    pub fn record_version_reply(&mut self, eui: &DevEui, version: FirmwareVersion) -> VersionReply {
        if version == self.latest {
            self.devices.remove(eui);
            self.active.retain(|d| d != eui);
            self.skipped.push(eui.clone());
            if self.query_cursor >= self.active.len() {
                self.query_cursor = 0;
            }
            return VersionReply::AlreadyCurrent {
                remaining: self.active.len(),
            };
        }

        match self.devices.get_mut(eui) {
            Some(record) if record.replied_version_info => {
                record.version = Some(version);
                VersionReply::Repeated
            }
            Some(record) => {
                record.version = Some(version);
                record.replied_version_info = true;
                VersionReply::Recorded
            }
            None => VersionReply::Repeated,
        }
    }

    pub fn all_replied(&self) -> bool {
        self.devices.values().all(|d| d.replied_version_info)
    }

    /// Require every remaining device to report one identical version.
    ///
    /// On success the common version becomes [`current`](Self::current).
    pub fn negotiate(&mut self) -> Result<Option<FirmwareVersion>, VersionDisagreement> {
        let reported: BTreeMap<DevEui, FirmwareVersion> = self
            .devices
            .values()
            .filter_map(|d| d.version.clone().map(|v| (d.eui.clone(), v)))
            .collect();

        let mut tally: BTreeMap<&FirmwareVersion, usize> = BTreeMap::new();
        for version in reported.values() {
            *tally.entry(version).or_default() += 1;
        }

        match tally.len() {
            0 => Ok(None),
            1 => {
                let common = reported.values().next().cloned();
                self.current.clone_from(&common);
                Ok(common)
            }
            _ => {
                // Ties resolve to the highest version.
                let majority = tally
                    .iter()
                    .max_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
                    .map(|(v, _)| (*v).clone());
                let divergent = reported
                    .iter()
                    .filter(|(_, v)| Some(*v) != majority.as_ref())
                    .map(|(eui, _)| eui.clone())
                    .collect();
                Err(VersionDisagreement { divergent, reported })
            }
        }
    }

    // ------------------------------------------------------------------
    // PROVISION
    // ------------------------------------------------------------------

    /// Returns true the first time a device confirms it is listening.
    pub fn mark_listening(&mut self, eui: &DevEui) -> bool {
        match self.devices.get_mut(eui) {
            Some(record) if !record.listening => {
                record.listening = true;
                true
            }
            _ => false,
        }
    }

    pub fn all_listening(&self) -> bool {
        self.devices.values().all(|d| d.listening)
    }

    /// Active devices not yet listening, in active-set order.
    pub fn pending_listeners(&self) -> Vec<DevEui> {
        self.active
            .iter()
            .filter(|eui| self.devices.get(*eui).is_some_and(|d| !d.listening))
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // VERIFY
    // ------------------------------------------------------------------

    /// Record a post-update DEVICE_VERSION. Returns true on the first report.
    pub fn record_final_version(&mut self, eui: &DevEui, version: FirmwareVersion) -> bool {
        match self.devices.get_mut(eui) {
            Some(record) if !record.finished_update => {
                record.final_version = Some(version);
                record.finished_update = true;
                true
            }
            _ => false,
        }
    }

    pub fn all_finished(&self) -> bool {
        self.devices.values().all(|d| d.finished_update)
    }

    /// Compare every final report against the target and remember failures.
    pub fn verdict(&mut self) -> Verification {
        self.failed = self
            .active
            .iter()
            .filter(|eui| {
                self.devices
                    .get(*eui)
                    .map_or(true, |d| d.final_version.as_ref() != Some(&self.latest))
            })
            .cloned()
            .collect();

        if self.failed.is_empty() {
            Verification::AllMatch
        } else if self.failed.len() == self.active.len() {
            Verification::AllFailed(self.failed.clone())
        } else {
            Verification::Partial(self.failed.clone())
        }
    }
}
