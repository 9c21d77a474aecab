//! Driver-specific device information.
//!
//! [`InfoProvider`] is a closed set of capability variants selected by the
//! bound driver name when a device record is built: VFIO-bound devices need
//! their IOMMU-group node plus the shared control node, UIO-bound devices
//! need their `/dev/uioN` node, and kernel-netdevice-bound devices need no
//! special node at all.
//!
//! Every operation is a pure function of host state at call time, and a
//! missing optional resource yields an empty result, never an error.

use tracing::warn;

use crate::sysfs::SysFs;
use crate::types::{DeviceSpec, Mount};

/// Permission mask requested for every exposed device node.
const DEVICE_PERMISSIONS: &str = "mrw";

/// Shared VFIO control node every VFIO consumer needs.
const VFIO_CONTROL_NODE: &str = "/dev/vfio/vfio";

/// Shared RDMA connection-manager node.
const RDMA_CM_NODE: &str = "/dev/infiniband/rdma_cm";

fn spec_for(path: String) -> DeviceSpec {
    DeviceSpec {
        host_path: path.clone(),
        container_path: path,
        permissions: DEVICE_PERMISSIONS.to_owned(),
    }
}

/// Driver-keyed device-info strategy.
///
/// Constructed once per device via [`InfoProvider::for_driver`]; never
/// re-dispatched per call.
#[derive(Debug, Clone)]
pub enum InfoProvider {
    /// Devices bound to `vfio-pci`.
    Vfio(SysFs),
    /// Devices bound to a userspace-I/O driver.
    Uio(SysFs),
    /// Devices owned by an ordinary kernel network driver.
    Netdev(SysFs),
}

impl InfoProvider {
    /// Select the variant matching the bound driver name.
    pub fn for_driver(driver: &str, sysfs: SysFs) -> Self {
        match driver {
            "vfio-pci" => Self::Vfio(sysfs),
            "uio_pci_generic" | "igb_uio" => Self::Uio(sysfs),
            _ => Self::Netdev(sysfs),
        }
    }

    /// Device nodes the container must be given for this device.
    ///
    /// VFIO always includes the shared control node, even when the device
    /// itself has no IOMMU group (or no address is given at all).
    pub fn device_specs(&self, pci_addr: &str) -> Vec<DeviceSpec> {
        match self {
            Self::Vfio(sysfs) => {
                let mut specs = Vec::new();
                if !pci_addr.is_empty() {
                    if let Some(group) = sysfs.iommu_group(pci_addr) {
                        specs.push(spec_for(format!("/dev/vfio/{group}")));
                    }
                }
                specs.push(spec_for(VFIO_CONTROL_NODE.to_owned()));
                specs
            }
            Self::Uio(sysfs) => match sysfs.uio_device(pci_addr) {
                Some(uio) => vec![spec_for(format!("/dev/{uio}"))],
                None => Vec::new(),
            },
            Self::Netdev(_) => Vec::new(),
        }
    }

    /// Bind mounts the container needs; none of the current variants use any.
    pub fn mounts(&self, _pci_addr: &str) -> Vec<Mount> {
        Vec::new()
    }

    /// The opaque per-device value exported to the container's environment.
    pub fn env_val(&self, pci_addr: &str) -> String {
        pci_addr.to_owned()
    }
}

/// RDMA sub-device exposure, computed independently of the driver variant
/// and merged into allocations only when the pool's selector requires RDMA.
#[derive(Debug, Clone, Default)]
pub struct RdmaSpec {
    device_specs: Vec<DeviceSpec>,
}

impl RdmaSpec {
    /// Inspect the device's RDMA capability and collect its verbs nodes.
    pub fn discover(sysfs: &SysFs, pci_addr: &str) -> Self {
        if sysfs.rdma_devices(pci_addr).is_empty() {
            return Self::default();
        }
        let verbs = sysfs.rdma_verbs_devices(pci_addr);
        if verbs.is_empty() {
            warn!(pci_addr, "rdma-capable device exposes no verbs nodes");
            return Self::default();
        }
        let mut device_specs: Vec<DeviceSpec> = verbs
            .into_iter()
            .map(|name| spec_for(format!("/dev/infiniband/{name}")))
            .collect();
        device_specs.push(spec_for(RDMA_CM_NODE.to_owned()));
        Self { device_specs }
    }

    /// Whether the device is RDMA-capable.
    pub fn is_rdma(&self) -> bool {
        !self.device_specs.is_empty()
    }

    /// RDMA device nodes to merge into the allocation.
    pub fn device_specs(&self) -> &[DeviceSpec] {
        &self.device_specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::fake;
    use std::fs;

    #[test]
    fn vfio_specs_with_iommu_group() {
        let tmp = tempfile::tempdir().unwrap();
        fake::add_pci_device(tmp.path(), "0000:02:00.0", "8086", "154c", "020000");
        fake::add_iommu_group(tmp.path(), "0000:02:00.0", "0");

        let provider = InfoProvider::for_driver("vfio-pci", SysFs::new(tmp.path()));
        let specs = provider.device_specs("0000:02:00.0");
        let paths: Vec<&str> = specs.iter().map(|s| s.host_path.as_str()).collect();
        assert_eq!(paths, vec!["/dev/vfio/0", "/dev/vfio/vfio"]);
        for s in &specs {
            assert_eq!(s.host_path, s.container_path);
            assert_eq!(s.permissions, "mrw");
        }
    }

    #[test]
    fn vfio_specs_empty_address_returns_control_node_only() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = InfoProvider::for_driver("vfio-pci", SysFs::new(tmp.path()));
        let specs = provider.device_specs("");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].host_path, "/dev/vfio/vfio");
    }

    #[test]
    fn uio_specs() {
        let tmp = tempfile::tempdir().unwrap();
        fake::add_pci_device(tmp.path(), "0000:02:00.0", "8086", "154c", "020000");
        fs::create_dir_all(
            tmp.path()
                .join("sys/bus/pci/devices/0000:02:00.0/uio/uio2"),
        )
        .unwrap();

        let provider = InfoProvider::for_driver("igb_uio", SysFs::new(tmp.path()));
        let specs = provider.device_specs("0000:02:00.0");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].host_path, "/dev/uio2");

        // No uio node present: empty result, not an error.
        assert!(provider.device_specs("0000:ff:00.0").is_empty());
    }

    #[test]
    fn netdev_has_no_special_nodes() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = InfoProvider::for_driver("i40evf", SysFs::new(tmp.path()));
        assert!(provider.device_specs("0000:02:00.0").is_empty());
        assert!(provider.mounts("0000:02:00.0").is_empty());
    }

    #[test]
    fn env_val_is_pci_address() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = InfoProvider::for_driver("vfio-pci", SysFs::new(tmp.path()));
        assert_eq!(provider.env_val("00:02.0"), "00:02.0");
    }

    #[test]
    fn rdma_spec_discovery() {
        let tmp = tempfile::tempdir().unwrap();
        fake::add_pci_device(tmp.path(), "0000:05:00.1", "15b3", "1014", "020700");
        let dev = tmp.path().join("sys/bus/pci/devices/0000:05:00.1");
        fs::create_dir_all(dev.join("infiniband/mlx5_1")).unwrap();
        fs::create_dir_all(dev.join("infiniband_verbs/uverbs1")).unwrap();

        let sysfs = SysFs::new(tmp.path());
        let rdma = RdmaSpec::discover(&sysfs, "0000:05:00.1");
        assert!(rdma.is_rdma());
        let paths: Vec<&str> = rdma
            .device_specs()
            .iter()
            .map(|s| s.host_path.as_str())
            .collect();
        assert_eq!(paths, vec!["/dev/infiniband/uverbs1", "/dev/infiniband/rdma_cm"]);
    }

    #[test]
    fn non_rdma_device() {
        let tmp = tempfile::tempdir().unwrap();
        fake::add_pci_device(tmp.path(), "0000:02:00.1", "8086", "154c", "020000");
        let rdma = RdmaSpec::discover(&SysFs::new(tmp.path()), "0000:02:00.1");
        assert!(!rdma.is_rdma());
        assert!(rdma.device_specs().is_empty());
    }
}
