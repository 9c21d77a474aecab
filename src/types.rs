//! Core device-plugin types: devices, device specs, protocol payloads, and
//! the declarative selector configuration.
//!
//! These types form the data model shared by the protocol traits, the
//! transport layer, and the resource pool.  They are all
//! [`Serialize`]/[`Deserialize`] so they can be transmitted over the plugin
//! socket as JSON and, for the selector config, read from the per-node
//! configuration file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Well-known constants
// ---------------------------------------------------------------------------

/// Directory where plugin sockets are created and discovered by the node
/// agent.
pub const SOCK_DIR: &str = "/var/lib/kubelet/plugins_registry";

/// Suffix appended to the resource name to form the socket file name.
pub const SOCK_SUFFIX: &str = "sock";

/// Default resource-name prefix advertised to the node agent.
pub const RESOURCE_PREFIX: &str = "intel.com";

/// Plugin type reported in the registration handshake.
pub const PLUGIN_TYPE_DEVICE_PLUGIN: &str = "DevicePlugin";

/// Protocol versions this plugin speaks.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["v1alpha1", "v1beta1", "v1"];

/// Seconds between health-probe cycles.
pub const HEALTH_PROBE_INTERVAL_SECS: u64 = 20;

/// Settling delay before a registration-failure restart attempt.
pub const RESTART_SETTLE_SECS: u64 = 5;

/// Timeout for the post-`Start` self-dial handshake.
pub const DIAL_TIMEOUT_SECS: u64 = 5;

/// Prefix of every exported per-allocation environment key.
pub const ENV_VAR_PREFIX: &str = "PCIDEVICE";

// ---------------------------------------------------------------------------
// Orchestrator-visible device shape
// ---------------------------------------------------------------------------

/// Health of a single device as reported to the node agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceHealth {
    /// The device is usable and may be allocated.
    Healthy,
    /// The device disappeared or failed a probe; allocation requests for it
    /// are rejected.
    Unhealthy,
}

impl fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("Healthy"),
            Self::Unhealthy => f.write_str("Unhealthy"),
        }
    }
}

/// NUMA node reference inside a [`TopologyInfo`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NumaNode {
    /// Host NUMA node number.
    pub id: i64,
}

/// NUMA affinity of a device, when known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopologyInfo {
    /// NUMA nodes the device is attached to.
    pub nodes: Vec<NumaNode>,
}

/// One device as seen by the node agent: identity, health, and topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    /// Pool-unique identifier (the PCI address).
    pub id: String,
    /// Current health flag.
    pub health: DeviceHealth,
    /// NUMA affinity, absent when the host does not report one.
    #[serde(default)]
    pub topology: Option<TopologyInfo>,
}

// ---------------------------------------------------------------------------
// Allocation payload building blocks
// ---------------------------------------------------------------------------

/// A host device node the container must be given access to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceSpec {
    /// Path of the device node on the host.
    pub host_path: String,
    /// Path the device node should appear at inside the container.
    pub container_path: String,
    /// Cgroup permission mask, e.g. `"mrw"`.
    pub permissions: String,
}

/// A bind mount the container needs in order to use the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mount {
    /// Source path on the host.
    pub host_path: String,
    /// Target path inside the container.
    pub container_path: String,
    /// Whether the mount is read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// VF details handed to the legacy claim-protocol consumer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VfInfo {
    /// PCI address of the virtual function.
    pub pci_addr: String,
    /// Index of the VF under its physical function, when known.
    #[serde(default)]
    pub vf_id: Option<i32>,
    /// Network interface name of the owning physical function, when known.
    #[serde(default)]
    pub pf_name: Option<String>,
}

// ---------------------------------------------------------------------------
// Registration surface payloads
// ---------------------------------------------------------------------------

/// Plugin identity returned from the registration `GetInfo` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Always [`PLUGIN_TYPE_DEVICE_PLUGIN`].
    pub plugin_type: String,
    /// `<prefix>/<resourceName>`, the string the orchestrator schedules on.
    pub name: String,
    /// Absolute path of this plugin's socket.
    pub endpoint: String,
    /// Protocol versions the plugin supports.
    pub supported_versions: Vec<String>,
}

/// Registration outcome pushed by the node agent after the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationStatus {
    /// `true` when the plugin was accepted.
    pub plugin_registered: bool,
    /// Failure detail when `plugin_registered` is `false`.
    #[serde(default)]
    pub error: String,
}

// ---------------------------------------------------------------------------
// Device-plugin surface payloads
// ---------------------------------------------------------------------------

/// Options reported to the node agent before any allocation happens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevicePluginOptions {
    /// Whether `PreStartContainer` must be called before container start.
    pub pre_start_required: bool,
}

/// Device list snapshot sent on the `ListAndWatch` stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListAndWatchResponse {
    /// Every device in the pool with its current health.
    pub devices: Vec<Device>,
}

/// Allocation request for a single container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerAllocateRequest {
    /// Pod the container belongs to.
    pub pod_uid: String,
    /// Container name, for logging only.
    #[serde(default)]
    pub container_name: String,
    /// Device IDs the orchestrator picked for this container.
    pub devices_ids: Vec<String>,
}

/// Batch allocation request, one entry per container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocateRequest {
    /// Per-container requests.
    pub container_requests: Vec<ContainerAllocateRequest>,
}

/// Allocation result for a single container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerAllocateResponse {
    /// Environment variables to export in the container.
    #[serde(default)]
    pub envs: HashMap<String, String>,
    /// Bind mounts the container needs.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Device nodes the container needs.
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

/// Batch allocation response mirroring [`AllocateRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocateResponse {
    /// Per-container responses, in request order.
    pub container_responses: Vec<ContainerAllocateResponse>,
}

/// `PreStartContainer` request; acknowledged but otherwise unused.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreStartContainerRequest {
    /// Devices previously allocated to the starting container.
    #[serde(default)]
    pub devices_ids: Vec<String>,
}

/// Empty `PreStartContainer` acknowledgment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreStartContainerResponse {}

// ---------------------------------------------------------------------------
// Selector configuration
// ---------------------------------------------------------------------------

/// Declarative match criteria applied by the device scanner.
///
/// An empty list means "match anything" for that predicate; all non-empty
/// predicates must match for a device to join the pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSelectors {
    /// PCI vendor IDs, e.g. `"8086"`.
    pub vendors: Vec<String>,
    /// PCI device (product) IDs, e.g. `"154c"`.
    pub devices: Vec<String>,
    /// Kernel driver names, e.g. `"vfio-pci"`.
    pub drivers: Vec<String>,
    /// Physical-function interface names, e.g. `"enp2s0f0"`.
    pub pf_names: Vec<String>,
    /// Link types, e.g. `"ether"` or `"infiniband"`.
    pub link_types: Vec<String>,
    /// Require RDMA capability and merge RDMA device nodes into allocations.
    pub is_rdma: bool,
}

/// One resource pool definition: the advertised name plus its selectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// Resource-name prefix override; [`RESOURCE_PREFIX`] when absent.
    #[serde(default)]
    pub resource_prefix: Option<String>,
    /// Resource class name, e.g. `"sriov_net_A"`.  The orchestrator sees
    /// `<prefix>/<resourceName>`.
    pub resource_name: String,
    /// Device match criteria for this pool.
    #[serde(default)]
    pub selectors: DeviceSelectors,
}

/// Top-level shape of the per-node configuration input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfigList {
    /// One entry per resource pool.
    pub resource_list: Vec<ResourceConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_health_display() {
        assert_eq!(DeviceHealth::Healthy.to_string(), "Healthy");
        assert_eq!(DeviceHealth::Unhealthy.to_string(), "Unhealthy");
    }

    #[test]
    fn device_serde_roundtrip() {
        let dev = Device {
            id: "0000:02:00.1".into(),
            health: DeviceHealth::Healthy,
            topology: Some(TopologyInfo {
                nodes: vec![NumaNode { id: 1 }],
            }),
        };
        let json = serde_json::to_string(&dev).expect("serialize");
        let de: Device = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(de, dev);
    }

    #[test]
    fn selector_config_parses_camel_case() {
        let json = r#"{
            "resourceList": [{
                "resourceName": "sriov_net_A",
                "selectors": {
                    "vendors": ["8086"],
                    "devices": ["154c"],
                    "drivers": ["vfio-pci"],
                    "pfNames": ["enp2s0f0"],
                    "isRdma": true
                }
            }]
        }"#;
        let list: ResourceConfigList = serde_json::from_str(json).expect("parse");
        assert_eq!(list.resource_list.len(), 1);
        let rc = &list.resource_list[0];
        assert_eq!(rc.resource_name, "sriov_net_A");
        assert_eq!(rc.selectors.pf_names, vec!["enp2s0f0"]);
        assert!(rc.selectors.is_rdma);
        assert!(rc.selectors.link_types.is_empty());
    }

    #[test]
    fn selectors_default_is_wildcard() {
        let sel = DeviceSelectors::default();
        assert!(sel.vendors.is_empty());
        assert!(sel.drivers.is_empty());
        assert!(!sel.is_rdma);
    }
}
