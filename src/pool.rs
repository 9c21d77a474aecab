//! Resource pools.
//!
//! A [`ResourcePool`] owns the named, bounded set of device records built
//! from one selector config: the inventory, the per-device health flags, and
//! the per-pod allocation bookkeeping.  All three live behind a single lock
//! because the probe task, the allocation handler, and the watch handler
//! race on them.
//!
//! The pool is purely reactive: discovery and probing run only when its
//! owning server calls them.

use std::collections::HashMap;
use std::collections::HashSet;

use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::{CheckpointStore, PodDevicesEntry};
use crate::device::PciNetDevice;
use crate::error::DpError;
use crate::scanner::DeviceScanner;
use crate::sysfs::SysFs;
use crate::types::{Device, DeviceHealth, DeviceSpec, Mount, ResourceConfig, VfInfo};

/// One device allocated to a pod, with the legacy claim flag.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    /// Allocated device ID.
    pub device_id: String,
    /// Whether a downstream consumer has claimed this entry.
    pub claimed: bool,
}

#[derive(Default)]
struct PoolState {
    /// Inventory: device ID to immutable record.
    devices: HashMap<String, PciNetDevice>,
    /// Health flags, keyed like the inventory.
    health: HashMap<String, DeviceHealth>,
    /// Pod identifier to its allocated entries, in allocation order.
    allocations: HashMap<String, Vec<DeviceEntry>>,
}

impl PoolState {
    fn checkpoint_entries(&self) -> Vec<PodDevicesEntry> {
        let mut entries: Vec<PodDevicesEntry> = self
            .allocations
            .iter()
            .map(|(pod_uid, devs)| PodDevicesEntry {
                pod_uid: pod_uid.clone(),
                device_ids: devs.iter().map(|d| d.device_id.clone()).collect(),
            })
            .collect();
        entries.sort_by(|a, b| a.pod_uid.cmp(&b.pod_uid));
        entries
    }

    fn is_allocated(&self, device_id: &str) -> bool {
        self.allocations
            .values()
            .any(|devs| devs.iter().any(|d| d.device_id == device_id))
    }
}

/// A named pool of interchangeable devices built from one selector config.
pub struct ResourcePool {
    config: ResourceConfig,
    sysfs: SysFs,
    scanner: DeviceScanner,
    checkpoint: CheckpointStore,
    state: Mutex<PoolState>,
}

impl ResourcePool {
    pub fn new(config: ResourceConfig, sysfs: SysFs, checkpoint: CheckpointStore) -> Self {
        Self {
            config,
            scanner: DeviceScanner::new(sysfs.clone()),
            sysfs,
            checkpoint,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// The resource class name this pool is advertised under.
    pub fn resource_name(&self) -> &str {
        &self.config.resource_name
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Replay the checkpoint into allocation bookkeeping.
    ///
    /// Recovered entries are assumed to already be configured on the host,
    /// so they are restored as claimed, not pending.  Called once at process
    /// start, before any protocol request can be served.
    pub async fn restore(&self) {
        let entries = self.checkpoint.load().await;
        if entries.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        for entry in entries {
            info!(
                resource = %self.config.resource_name,
                pod_uid = %entry.pod_uid,
                devices = ?entry.device_ids,
                "restored allocation from checkpoint",
            );
            state.allocations.insert(
                entry.pod_uid,
                entry
                    .device_ids
                    .into_iter()
                    .map(|device_id| DeviceEntry {
                        device_id,
                        claimed: true,
                    })
                    .collect(),
            );
        }
    }

    /// Scan the host and replace the pool inventory wholesale.
    ///
    /// Devices that cannot be represented are skipped with a warning;
    /// only an outright scan failure is an error.
    #[instrument(skip(self), fields(resource = %self.config.resource_name))]
    pub async fn discover_devices(&self) -> Result<(), DpError> {
        let addrs = self.scanner.scan(&self.config.selectors)?;

        let mut devices = HashMap::new();
        let mut health = HashMap::new();
        for addr in addrs {
            match PciNetDevice::discover(&self.sysfs, &addr) {
                Ok(dev) => {
                    health.insert(addr.clone(), DeviceHealth::Healthy);
                    devices.insert(addr, dev);
                }
                Err(e) => {
                    warn!(addr, error = %e, "skipping device");
                }
            }
        }

        info!(count = devices.len(), "device discovery complete");
        let mut state = self.state.lock().await;
        state.devices = devices;
        state.health = health;
        Ok(())
    }

    /// Snapshot of the orchestrator-visible device list, sorted by ID.
    pub async fn get_devices(&self) -> Vec<Device> {
        let state = self.state.lock().await;
        let mut devices: Vec<Device> = state
            .devices
            .values()
            .map(|dev| {
                let mut api = dev.api_device();
                if let Some(h) = state.health.get(dev.pci_addr()) {
                    api.health = *h;
                }
                api
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Resolve device specs for the requested IDs.
    ///
    /// IDs absent from the inventory are skipped rather than failing the
    /// call: under concurrent rediscovery the orchestrator may request a
    /// device the pool no longer tracks, and the allocation proceeds with
    /// whatever is resolvable.  Duplicate nodes are returned once.
    pub async fn get_device_specs(&self, ids: &[String]) -> Vec<DeviceSpec> {
        let state = self.state.lock().await;
        let mut specs: Vec<DeviceSpec> = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for id in ids {
            let Some(dev) = state.devices.get(id) else {
                warn!(id, "requested device not in inventory, skipping specs");
                continue;
            };
            let mut new_specs: Vec<DeviceSpec> = dev.device_specs().to_vec();
            if self.config.selectors.is_rdma {
                if dev.rdma_spec().is_rdma() {
                    new_specs.extend_from_slice(dev.rdma_spec().device_specs());
                } else {
                    error!(
                        id,
                        "rdma is required in the configuration but the device is not an rdma device",
                    );
                }
            }
            for spec in new_specs {
                if seen.insert((spec.host_path.clone(), spec.container_path.clone())) {
                    specs.push(spec);
                }
            }
        }
        specs
    }

    /// Resolve the environment map for the requested IDs: one value keyed by
    /// resource name, the comma-joined env values of every resolvable ID.
    /// Unknown IDs are skipped, matching [`Self::get_device_specs`].
    pub async fn get_envs(&self, ids: &[String]) -> HashMap<String, String> {
        let state = self.state.lock().await;
        let vals: Vec<&str> = ids
            .iter()
            .filter_map(|id| state.devices.get(id).map(|d| d.env_val()))
            .collect();
        let mut envs = HashMap::new();
        if !vals.is_empty() {
            envs.insert(self.config.resource_name.clone(), vals.join(","));
        }
        envs
    }

    /// Bind mounts needed by any device of this pool, deduplicated.
    pub async fn get_mounts(&self) -> Vec<Mount> {
        let state = self.state.lock().await;
        let mut mounts: Vec<Mount> = Vec::new();
        for dev in state.devices.values() {
            for m in dev.mounts() {
                if !mounts.contains(m) {
                    mounts.push(m.clone());
                }
            }
        }
        mounts
    }

    /// Re-evaluate device health against a fresh scan.
    ///
    /// Returns whether any device flipped.  A failed scan leaves health
    /// untouched; the next cycle retries.
    pub async fn probe(&self) -> Result<bool, DpError> {
        let fresh: HashSet<String> = match self.scanner.scan(&self.config.selectors) {
            Ok(addrs) => addrs.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "health probe scan failed, keeping previous state");
                return Ok(false);
            }
        };

        let mut state = self.state.lock().await;
        let mut changed = false;
        let ids: Vec<String> = state.devices.keys().cloned().collect();
        for id in ids {
            let now = if fresh.contains(&id) {
                DeviceHealth::Healthy
            } else {
                DeviceHealth::Unhealthy
            };
            let prev = state.health.insert(id.clone(), now);
            if prev != Some(now) {
                info!(id, health = %now, "device health changed");
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Record an allocation of `ids` to `pod_uid` and persist it.
    ///
    /// Every requested ID must be present in the inventory, healthy, and not
    /// already allocated; otherwise the whole call fails with a typed error
    /// and neither bookkeeping nor the checkpoint changes.
    pub async fn allocate(&self, pod_uid: &str, ids: &[String]) -> Result<(), DpError> {
        let mut state = self.state.lock().await;

        for id in ids {
            if !state.devices.contains_key(id) {
                return Err(DpError::unknown_device(id.clone()));
            }
            if state.health.get(id) != Some(&DeviceHealth::Healthy) {
                return Err(DpError::unhealthy_device(id.clone()));
            }
            if state.is_allocated(id) {
                return Err(DpError::DeviceUnusable {
                    id: id.clone(),
                    reason: "already allocated to a pod".to_owned(),
                });
            }
        }

        let entries = state.allocations.entry(pod_uid.to_owned()).or_default();
        for id in ids {
            entries.push(DeviceEntry {
                device_id: id.clone(),
                claimed: false,
            });
        }

        // Persist before the allocation response is returned; roll back the
        // bookkeeping if the checkpoint cannot be written.
        let snapshot = state.checkpoint_entries();
        if let Err(e) = self.checkpoint.save(&snapshot).await {
            let entries = state.allocations.entry(pod_uid.to_owned()).or_default();
            entries.truncate(entries.len() - ids.len());
            if entries.is_empty() {
                state.allocations.remove(pod_uid);
            }
            return Err(e);
        }
        debug!(pod_uid, ?ids, "allocation recorded");
        Ok(())
    }

    /// Drop a pod's allocation record and persist the change.
    pub async fn release(&self, pod_uid: &str) -> Result<(), DpError> {
        let mut state = self.state.lock().await;
        if state.allocations.remove(pod_uid).is_none() {
            return Err(DpError::UnknownPod(pod_uid.to_owned()));
        }
        let snapshot = state.checkpoint_entries();
        self.checkpoint.save(&snapshot).await?;
        debug!(pod_uid, "allocation released");
        Ok(())
    }

    /// Legacy claim path: hand the pod's next unclaimed device to a
    /// downstream consumer and mark it claimed.
    pub async fn claim_next(&self, pod_uid: &str) -> Result<VfInfo, DpError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(entries) = state.allocations.get_mut(pod_uid) else {
            return Err(DpError::UnknownPod(pod_uid.to_owned()));
        };
        let Some(entry) = entries.iter_mut().find(|e| !e.claimed) else {
            return Err(DpError::ClaimExhausted {
                pod_uid: pod_uid.to_owned(),
                reason: "all allocated devices already claimed".to_owned(),
            });
        };
        entry.claimed = true;
        let device_id = entry.device_id.clone();
        let info = state
            .devices
            .get(&device_id)
            .map(PciNetDevice::vf_info)
            .unwrap_or(VfInfo {
                pci_addr: device_id.clone(),
                vf_id: None,
                pf_name: None,
            });
        debug!(pod_uid, device_id, "device claimed");
        Ok(info)
    }

    /// Legacy claim path: return the pod's first claimed device, unmarking
    /// it so a later claim can hand it out again.
    pub async fn release_claim(&self, pod_uid: &str) -> Result<String, DpError> {
        let mut state = self.state.lock().await;
        let Some(entries) = state.allocations.get_mut(pod_uid) else {
            return Err(DpError::UnknownPod(pod_uid.to_owned()));
        };
        let Some(entry) = entries.iter_mut().find(|e| e.claimed) else {
            return Err(DpError::ClaimExhausted {
                pod_uid: pod_uid.to_owned(),
                reason: "no claimed device found".to_owned(),
            });
        };
        entry.claimed = false;
        let device_id = entry.device_id.clone();
        debug!(pod_uid, device_id, "claim released");
        Ok(device_id)
    }

    /// Allocation entries for a pod, mainly for replay verification.
    pub async fn allocations_for(&self, pod_uid: &str) -> Option<Vec<DeviceEntry>> {
        self.state.lock().await.allocations.get(pod_uid).cloned()
    }

    /// Force a device's health flag.  Probe-internal; exposed to the rest of
    /// the crate for tests.
    pub(crate) async fn set_health(&self, id: &str, health: DeviceHealth) -> bool {
        let mut state = self.state.lock().await;
        if !state.devices.contains_key(id) {
            return false;
        }
        state.health.insert(id.to_owned(), health) != Some(health)
    }
}
