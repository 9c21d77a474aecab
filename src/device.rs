//! PCI network device records.
//!
//! A [`PciNetDevice`] aggregates everything the pool needs to know about one
//! discovered device: scanner identity, the driver-specific device-node
//! exposure computed by its [`InfoProvider`], and optional RDMA sub-device
//! info.  Records are immutable once constructed; rediscovery builds fresh
//! records instead of mutating old ones.

use crate::error::DpError;
use crate::infoprovider::{InfoProvider, RdmaSpec};
use crate::sysfs::SysFs;
use crate::types::{Device, DeviceHealth, DeviceSpec, Mount, NumaNode, TopologyInfo, VfInfo};

/// One discovered PCI network device, immutable after construction.
#[derive(Debug, Clone)]
pub struct PciNetDevice {
    pci_addr: String,
    vendor: String,
    product: String,
    subclass: String,
    driver: String,
    if_name: Option<String>,
    pf_name: Option<String>,
    vf_id: Option<i32>,
    numa_node: Option<i64>,
    link_type: Option<String>,
    device_specs: Vec<DeviceSpec>,
    mounts: Vec<Mount>,
    env: String,
    rdma: RdmaSpec,
}

impl PciNetDevice {
    /// Build a record for `pci_addr` from current host state.
    ///
    /// Errors mean the device cannot be represented at all (no bound driver,
    /// or a VF whose backing link is broken); the caller logs and skips it.
    /// Missing optional attributes are recorded as absent.
    pub fn discover(sysfs: &SysFs, pci_addr: &str) -> Result<Self, DpError> {
        let driver = sysfs.driver_name(pci_addr)?;
        let vf_id = sysfs.vf_id(pci_addr)?;

        let vendor = sysfs.vendor(pci_addr).unwrap_or_default();
        let product = sysfs.device_id(pci_addr).unwrap_or_default();
        let subclass = sysfs.subclass(pci_addr).unwrap_or_default();
        let if_name = sysfs.net_names(pci_addr).into_iter().next();
        let pf_name = sysfs.pf_name(pci_addr);
        let numa_node = sysfs.numa_node(pci_addr);
        let link_type = if_name.as_deref().and_then(|n| sysfs.link_type(n));

        let provider = InfoProvider::for_driver(&driver, sysfs.clone());
        let device_specs = provider.device_specs(pci_addr);
        let mounts = provider.mounts(pci_addr);
        let env = provider.env_val(pci_addr);
        let rdma = RdmaSpec::discover(sysfs, pci_addr);

        Ok(Self {
            pci_addr: pci_addr.to_owned(),
            vendor,
            product,
            subclass,
            driver,
            if_name,
            pf_name,
            vf_id,
            numa_node,
            link_type,
            device_specs,
            mounts,
            env,
            rdma,
        })
    }

    /// The orchestrator-visible shape of this device.  Newly discovered
    /// devices always start healthy; the pool owns later health flips.
    pub fn api_device(&self) -> Device {
        Device {
            id: self.pci_addr.clone(),
            health: DeviceHealth::Healthy,
            topology: self.numa_node.map(|id| TopologyInfo {
                nodes: vec![NumaNode { id }],
            }),
        }
    }

    /// VF details for the legacy claim protocol.
    pub fn vf_info(&self) -> VfInfo {
        VfInfo {
            pci_addr: self.pci_addr.clone(),
            vf_id: self.vf_id,
            pf_name: self.pf_name.clone(),
        }
    }

    pub fn pci_addr(&self) -> &str {
        &self.pci_addr
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn subclass(&self) -> &str {
        &self.subclass
    }

    pub fn driver(&self) -> &str {
        &self.driver
    }

    pub fn net_name(&self) -> Option<&str> {
        self.if_name.as_deref()
    }

    pub fn pf_name(&self) -> Option<&str> {
        self.pf_name.as_deref()
    }

    pub fn vf_id(&self) -> Option<i32> {
        self.vf_id
    }

    pub fn numa_node(&self) -> Option<i64> {
        self.numa_node
    }

    pub fn link_type(&self) -> Option<&str> {
        self.link_type.as_deref()
    }

    pub fn device_specs(&self) -> &[DeviceSpec] {
        &self.device_specs
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn env_val(&self) -> &str {
        &self.env
    }

    pub fn rdma_spec(&self) -> &RdmaSpec {
        &self.rdma
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::fake;
    use std::fs;

    fn vfio_vf_tree(tmp: &std::path::Path) {
        fake::add_pci_device(tmp, "0000:02:00.0", "8086", "1572", "020000");
        fake::add_net_name(tmp, "0000:02:00.0", "enp2s0f0", "1");
        fake::add_pci_device(tmp, "0000:02:02.0", "8086", "154c", "020000");
        fake::bind_driver(tmp, "0000:02:02.0", "vfio-pci");
        fake::link_vf_to_pf(tmp, "0000:02:02.0", "0000:02:00.0", 0);
        fake::add_iommu_group(tmp, "0000:02:02.0", "7");
        fs::write(
            tmp.join("sys/bus/pci/devices/0000:02:02.0/numa_node"),
            "1\n",
        )
        .unwrap();
    }

    #[test]
    fn discover_vfio_vf() {
        let tmp = tempfile::tempdir().unwrap();
        vfio_vf_tree(tmp.path());
        let sysfs = SysFs::new(tmp.path());

        let dev = PciNetDevice::discover(&sysfs, "0000:02:02.0").unwrap();
        assert_eq!(dev.pci_addr(), "0000:02:02.0");
        assert_eq!(dev.vendor(), "8086");
        assert_eq!(dev.product(), "154c");
        assert_eq!(dev.driver(), "vfio-pci");
        assert_eq!(dev.pf_name(), Some("enp2s0f0"));
        assert_eq!(dev.vf_id(), Some(0));
        assert_eq!(dev.env_val(), "0000:02:02.0");
        assert!(!dev.rdma_spec().is_rdma());

        let paths: Vec<&str> = dev
            .device_specs()
            .iter()
            .map(|s| s.host_path.as_str())
            .collect();
        assert_eq!(paths, vec!["/dev/vfio/7", "/dev/vfio/vfio"]);
    }

    #[test]
    fn api_device_carries_numa_topology() {
        let tmp = tempfile::tempdir().unwrap();
        vfio_vf_tree(tmp.path());
        let dev = PciNetDevice::discover(&SysFs::new(tmp.path()), "0000:02:02.0").unwrap();

        let api = dev.api_device();
        assert_eq!(api.id, "0000:02:02.0");
        assert_eq!(api.health, DeviceHealth::Healthy);
        assert_eq!(api.topology.unwrap().nodes[0].id, 1);
    }

    #[test]
    fn discover_unbound_device_fails() {
        let tmp = tempfile::tempdir().unwrap();
        fake::add_pci_device(tmp.path(), "0000:03:00.0", "8086", "154c", "020000");
        let err = PciNetDevice::discover(&SysFs::new(tmp.path()), "0000:03:00.0").unwrap_err();
        assert!(matches!(err, DpError::Discovery(_)));
    }
}
