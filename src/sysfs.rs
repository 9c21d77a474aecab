//! Host sysfs introspection.
//!
//! Every query is a point-in-time read keyed by PCI address; nothing is
//! cached.  All paths are resolved under a configurable root so tests can
//! point the whole crate at a fake device tree in a temporary directory.
//!
//! Missing optional attributes yield `None`/empty results rather than
//! errors; only attributes a device cannot function without (its bound
//! driver, its VF backing link) surface as errors to the caller, which
//! decides whether to skip the device.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::DpError;

/// Handle to the host's sysfs, rooted at `/` in production.
#[derive(Debug, Clone)]
pub struct SysFs {
    root: PathBuf,
}

impl Default for SysFs {
    fn default() -> Self {
        Self::new("/")
    }
}

/// Read a sysfs attribute file, trimming trailing whitespace.
fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_owned())
}

/// Strip the `0x` prefix of a sysfs hex ID such as `0x8086`.
fn strip_hex_prefix(s: &str) -> String {
    s.strip_prefix("0x").unwrap_or(s).to_owned()
}

impl SysFs {
    /// Create a handle rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory enumerating every PCI device on the host.
    pub fn pci_devices_dir(&self) -> PathBuf {
        self.root.join("sys/bus/pci/devices")
    }

    /// Sysfs directory of one PCI device.
    pub fn device_dir(&self, pci_addr: &str) -> PathBuf {
        self.pci_devices_dir().join(pci_addr)
    }

    fn net_class_dir(&self) -> PathBuf {
        self.root.join("sys/class/net")
    }

    /// PCI vendor ID without the `0x` prefix, e.g. `"8086"`.
    pub fn vendor(&self, pci_addr: &str) -> Option<String> {
        read_trimmed(&self.device_dir(pci_addr).join("vendor")).map(|s| strip_hex_prefix(&s))
    }

    /// PCI device (product) ID without the `0x` prefix, e.g. `"154c"`.
    pub fn device_id(&self, pci_addr: &str) -> Option<String> {
        read_trimmed(&self.device_dir(pci_addr).join("device")).map(|s| strip_hex_prefix(&s))
    }

    /// PCI class code, e.g. `"020000"` for an Ethernet controller.
    pub fn device_class(&self, pci_addr: &str) -> Option<String> {
        read_trimmed(&self.device_dir(pci_addr).join("class")).map(|s| strip_hex_prefix(&s))
    }

    /// PCI subclass byte extracted from the class code, e.g. `"00"`.
    pub fn subclass(&self, pci_addr: &str) -> Option<String> {
        let class = self.device_class(pci_addr)?;
        class.get(2..4).map(str::to_owned)
    }

    /// `true` when the device is a network-class (`0x02`) PCI device.
    pub fn is_net_class(&self, pci_addr: &str) -> bool {
        self.device_class(pci_addr)
            .is_some_and(|c| c.starts_with("02"))
    }

    /// Name of the kernel driver the device is bound to.
    pub fn driver_name(&self, pci_addr: &str) -> Result<String, DpError> {
        let link = self.device_dir(pci_addr).join("driver");
        let target = fs::read_link(&link)
            .map_err(|e| DpError::Discovery(format!("no driver for {pci_addr}: {e}")))?;
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| DpError::Discovery(format!("malformed driver link for {pci_addr}")))
    }

    /// Network interface names backed by the device, usually zero or one.
    pub fn net_names(&self, pci_addr: &str) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(self.device_dir(pci_addr).join("net")) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// PCI address of the physical function owning this VF, or `None` when
    /// the device is not a VF.
    pub fn pf_addr(&self, pci_addr: &str) -> Option<String> {
        let target = fs::read_link(self.device_dir(pci_addr).join("physfn")).ok()?;
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Interface name of the owning physical function, when resolvable.
    pub fn pf_name(&self, pci_addr: &str) -> Option<String> {
        let pf_addr = self.pf_addr(pci_addr)?;
        self.net_names(&pf_addr).into_iter().next()
    }

    /// Index of this VF under its physical function.
    ///
    /// Returns `Ok(None)` for devices that are not VFs at all; an error
    /// means the device claims a PF but the backing `virtfn` link cannot be
    /// resolved.
    pub fn vf_id(&self, pci_addr: &str) -> Result<Option<i32>, DpError> {
        let Some(pf_addr) = self.pf_addr(pci_addr) else {
            return Ok(None);
        };
        let pf_dir = self.device_dir(&pf_addr);
        let entries = fs::read_dir(&pf_dir)
            .map_err(|e| DpError::Discovery(format!("cannot read PF dir for {pci_addr}: {e}")))?;
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(idx) = name.strip_prefix("virtfn") else {
                continue;
            };
            let target = match fs::read_link(entry.path()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if target.file_name().map(|n| n.to_string_lossy().into_owned())
                == Some(pci_addr.to_owned())
            {
                let id = idx.parse::<i32>().map_err(|e| {
                    DpError::Discovery(format!("unparseable VF index {name} for {pci_addr}: {e}"))
                })?;
                return Ok(Some(id));
            }
        }
        Err(DpError::Discovery(format!(
            "no virtfn link back to {pci_addr} under PF {pf_addr}"
        )))
    }

    /// Host NUMA node of the device; `None` when unknown (sysfs reports -1).
    pub fn numa_node(&self, pci_addr: &str) -> Option<i64> {
        let raw = read_trimmed(&self.device_dir(pci_addr).join("numa_node"))?;
        match raw.parse::<i64>() {
            Ok(n) if n >= 0 => Some(n),
            _ => None,
        }
    }

    /// Link type of a network interface, derived from its ARP hardware type.
    pub fn link_type(&self, if_name: &str) -> Option<String> {
        let raw = read_trimmed(&self.net_class_dir().join(if_name).join("type"))?;
        // ARPHRD constants: 1 = Ethernet, 32 = InfiniBand.
        match raw.as_str() {
            "1" => Some("ether".to_owned()),
            "32" => Some("infiniband".to_owned()),
            other => Some(other.to_owned()),
        }
    }

    /// IOMMU group number of the device, when assigned to one.
    pub fn iommu_group(&self, pci_addr: &str) -> Option<String> {
        let target = fs::read_link(self.device_dir(pci_addr).join("iommu_group")).ok()?;
        target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// Name of the UIO device node backing this device, e.g. `"uio0"`.
    pub fn uio_device(&self, pci_addr: &str) -> Option<String> {
        let mut names: Vec<String> = fs::read_dir(self.device_dir(pci_addr).join("uio"))
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names.into_iter().next()
    }

    /// RDMA device names exposed by this device (empty when not RDMA-capable).
    pub fn rdma_devices(&self, pci_addr: &str) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(self.device_dir(pci_addr).join("infiniband"))
        {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    /// User-verbs character device names of this device, e.g. `"uverbs0"`.
    pub fn rdma_verbs_devices(&self, pci_addr: &str) -> Vec<String> {
        let mut names: Vec<String> =
            match fs::read_dir(self.device_dir(pci_addr).join("infiniband_verbs")) {
                Ok(entries) => entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect(),
                Err(_) => Vec::new(),
            };
        names.sort();
        names
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Helpers for building fake sysfs trees in tests.

    use std::fs;
    use std::path::Path;

    /// Create a PCI device directory with the standard identity attributes.
    pub fn add_pci_device(root: &Path, addr: &str, vendor: &str, device: &str, class: &str) {
        let dir = root.join("sys/bus/pci/devices").join(addr);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("0x{vendor}\n")).unwrap();
        fs::write(dir.join("device"), format!("0x{device}\n")).unwrap();
        fs::write(dir.join("class"), format!("0x{class}\n")).unwrap();
    }

    /// Bind a device to a driver by creating the `driver` symlink.
    pub fn bind_driver(root: &Path, addr: &str, driver: &str) {
        let drivers = root.join("sys/bus/pci/drivers").join(driver);
        fs::create_dir_all(&drivers).unwrap();
        let link = root.join("sys/bus/pci/devices").join(addr).join("driver");
        std::os::unix::fs::symlink(format!("../../../bus/pci/drivers/{driver}"), link).unwrap();
    }

    /// Attach a network interface name to a device.
    pub fn add_net_name(root: &Path, addr: &str, if_name: &str, arp_type: &str) {
        let net = root
            .join("sys/bus/pci/devices")
            .join(addr)
            .join("net")
            .join(if_name);
        fs::create_dir_all(&net).unwrap();
        let class_if = root.join("sys/class/net").join(if_name);
        fs::create_dir_all(&class_if).unwrap();
        fs::write(class_if.join("type"), format!("{arp_type}\n")).unwrap();
    }

    /// Wire a VF to its PF with the `physfn` / `virtfn<N>` symlink pair.
    pub fn link_vf_to_pf(root: &Path, vf_addr: &str, pf_addr: &str, vf_id: u32) {
        let devices = root.join("sys/bus/pci/devices");
        std::os::unix::fs::symlink(
            format!("../{pf_addr}"),
            devices.join(vf_addr).join("physfn"),
        )
        .unwrap();
        std::os::unix::fs::symlink(
            format!("../{vf_addr}"),
            devices.join(pf_addr).join(format!("virtfn{vf_id}")),
        )
        .unwrap();
    }

    /// Place a device in an IOMMU group.
    pub fn add_iommu_group(root: &Path, addr: &str, group: &str) {
        let group_dir = root.join("sys/kernel/iommu_groups").join(group);
        fs::create_dir_all(&group_dir).unwrap();
        let link = root
            .join("sys/bus/pci/devices")
            .join(addr)
            .join("iommu_group");
        std::os::unix::fs::symlink(format!("../../../../kernel/iommu_groups/{group}"), link)
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::fake;
    use super::*;
    use std::fs as stdfs;

    #[test]
    fn identity_attributes() {
        let tmp = tempfile::tempdir().unwrap();
        fake::add_pci_device(tmp.path(), "0000:02:00.1", "8086", "154c", "020000");

        let sysfs = SysFs::new(tmp.path());
        assert_eq!(sysfs.vendor("0000:02:00.1").unwrap(), "8086");
        assert_eq!(sysfs.device_id("0000:02:00.1").unwrap(), "154c");
        assert_eq!(sysfs.subclass("0000:02:00.1").unwrap(), "00");
        assert!(sysfs.is_net_class("0000:02:00.1"));
        assert!(sysfs.vendor("0000:ff:00.0").is_none());
    }

    #[test]
    fn driver_name_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        fake::add_pci_device(tmp.path(), "0000:02:00.1", "8086", "154c", "020000");
        fake::bind_driver(tmp.path(), "0000:02:00.1", "vfio-pci");

        let sysfs = SysFs::new(tmp.path());
        assert_eq!(sysfs.driver_name("0000:02:00.1").unwrap(), "vfio-pci");

        // Unbound device: an error, the caller skips it.
        fake::add_pci_device(tmp.path(), "0000:02:00.2", "8086", "154c", "020000");
        assert!(sysfs.driver_name("0000:02:00.2").is_err());
    }

    #[test]
    fn vf_pf_relationship() {
        let tmp = tempfile::tempdir().unwrap();
        fake::add_pci_device(tmp.path(), "0000:02:00.0", "8086", "1572", "020000");
        fake::add_pci_device(tmp.path(), "0000:02:02.0", "8086", "154c", "020000");
        fake::add_net_name(tmp.path(), "0000:02:00.0", "enp2s0f0", "1");
        fake::link_vf_to_pf(tmp.path(), "0000:02:02.0", "0000:02:00.0", 3);

        let sysfs = SysFs::new(tmp.path());
        assert_eq!(sysfs.pf_addr("0000:02:02.0").unwrap(), "0000:02:00.0");
        assert_eq!(sysfs.pf_name("0000:02:02.0").unwrap(), "enp2s0f0");
        assert_eq!(sysfs.vf_id("0000:02:02.0").unwrap(), Some(3));
        // The PF itself is not a VF.
        assert_eq!(sysfs.vf_id("0000:02:00.0").unwrap(), None);
    }

    #[test]
    fn vf_with_broken_backing_link_errors() {
        let tmp = tempfile::tempdir().unwrap();
        fake::add_pci_device(tmp.path(), "0000:02:00.0", "8086", "1572", "020000");
        fake::add_pci_device(tmp.path(), "0000:02:02.0", "8086", "154c", "020000");
        // physfn present, but the PF has no virtfn link back.
        std::os::unix::fs::symlink(
            "../0000:02:00.0",
            tmp.path()
                .join("sys/bus/pci/devices/0000:02:02.0/physfn"),
        )
        .unwrap();

        let sysfs = SysFs::new(tmp.path());
        assert!(sysfs.vf_id("0000:02:02.0").is_err());
    }

    #[test]
    fn numa_node_unknown_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        fake::add_pci_device(tmp.path(), "0000:02:00.1", "8086", "154c", "020000");
        let dev = tmp.path().join("sys/bus/pci/devices/0000:02:00.1");
        stdfs::write(dev.join("numa_node"), "-1\n").unwrap();

        let sysfs = SysFs::new(tmp.path());
        assert_eq!(sysfs.numa_node("0000:02:00.1"), None);

        stdfs::write(dev.join("numa_node"), "1\n").unwrap();
        assert_eq!(sysfs.numa_node("0000:02:00.1"), Some(1));
    }

    #[test]
    fn link_type_from_arp_hardware_type() {
        let tmp = tempfile::tempdir().unwrap();
        fake::add_pci_device(tmp.path(), "0000:02:00.1", "15b3", "1014", "020000");
        fake::add_net_name(tmp.path(), "0000:02:00.1", "ib0", "32");

        let sysfs = SysFs::new(tmp.path());
        assert_eq!(sysfs.link_type("ib0").unwrap(), "infiniband");
        assert!(sysfs.link_type("missing0").is_none());
    }

    #[test]
    fn iommu_group_number() {
        let tmp = tempfile::tempdir().unwrap();
        fake::add_pci_device(tmp.path(), "0000:02:00.0", "8086", "154c", "020000");
        fake::add_iommu_group(tmp.path(), "0000:02:00.0", "0");

        let sysfs = SysFs::new(tmp.path());
        assert_eq!(sysfs.iommu_group("0000:02:00.0").unwrap(), "0");
        assert!(sysfs.iommu_group("0000:ff:00.0").is_none());
    }
}
