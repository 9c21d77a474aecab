//! Selector-driven device discovery.
//!
//! The scanner walks the host's PCI device tree and returns the addresses of
//! every network-class device matching all predicates of a
//! [`DeviceSelectors`].  Enumeration failure is fatal; a device that cannot
//! be evaluated against the selectors is skipped with a warning, preferring
//! partial discovery over total failure.

use std::fs;

use tracing::warn;

use crate::error::DpError;
use crate::sysfs::SysFs;
use crate::types::DeviceSelectors;

/// Enumerates host PCI devices against declarative selectors.
#[derive(Debug, Clone)]
pub struct DeviceScanner {
    sysfs: SysFs,
}

impl DeviceScanner {
    pub fn new(sysfs: SysFs) -> Self {
        Self { sysfs }
    }

    /// Return the sorted PCI addresses of every device matching `selectors`.
    ///
    /// A host with no matching devices yields an empty set; only an
    /// unreadable device tree is an error.
    pub fn scan(&self, selectors: &DeviceSelectors) -> Result<Vec<String>, DpError> {
        let dir = self.sysfs.pci_devices_dir();
        let entries = fs::read_dir(&dir).map_err(|e| {
            DpError::Discovery(format!("cannot read {}: {e}", dir.display()))
        })?;

        let mut matched = Vec::new();
        for entry in entries {
            let entry = entry.map_err(DpError::discovery)?;
            let addr = entry.file_name().to_string_lossy().into_owned();
            if self.matches(&addr, selectors) {
                matched.push(addr);
            }
        }
        matched.sort();
        Ok(matched)
    }

    /// Evaluate all selector predicates against one device.  Empty predicate
    /// lists are wildcards.
    fn matches(&self, addr: &str, sel: &DeviceSelectors) -> bool {
        // Only network-class PCI devices are candidates.
        if !self.sysfs.is_net_class(addr) {
            return false;
        }

        if !sel.vendors.is_empty() {
            match self.sysfs.vendor(addr) {
                Some(v) if sel.vendors.contains(&v) => {}
                _ => return false,
            }
        }

        if !sel.devices.is_empty() {
            match self.sysfs.device_id(addr) {
                Some(d) if sel.devices.contains(&d) => {}
                _ => return false,
            }
        }

        if !sel.drivers.is_empty() {
            match self.sysfs.driver_name(addr) {
                Ok(d) if sel.drivers.contains(&d) => {}
                Ok(_) => return false,
                Err(e) => {
                    warn!(addr, error = %e, "skipping device without readable driver");
                    return false;
                }
            }
        }

        if !sel.pf_names.is_empty() {
            match self.sysfs.pf_name(addr) {
                Some(pf) if sel.pf_names.contains(&pf) => {}
                _ => return false,
            }
        }

        if !sel.link_types.is_empty() {
            let link = self
                .sysfs
                .net_names(addr)
                .into_iter()
                .next()
                .and_then(|n| self.sysfs.link_type(&n));
            match link {
                Some(lt) if sel.link_types.contains(&lt) => {}
                _ => return false,
            }
        }

        if sel.is_rdma && self.sysfs.rdma_devices(addr).is_empty() {
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::fake;
    use std::fs;

    fn two_vf_tree(tmp: &std::path::Path) {
        fake::add_pci_device(tmp, "0000:02:00.0", "8086", "1572", "020000");
        fake::add_net_name(tmp, "0000:02:00.0", "enp2s0f0", "1");
        fake::bind_driver(tmp, "0000:02:00.0", "i40e");

        fake::add_pci_device(tmp, "0000:02:02.0", "8086", "154c", "020000");
        fake::bind_driver(tmp, "0000:02:02.0", "vfio-pci");
        fake::link_vf_to_pf(tmp, "0000:02:02.0", "0000:02:00.0", 0);

        fake::add_pci_device(tmp, "0000:02:02.1", "8086", "154c", "020000");
        fake::bind_driver(tmp, "0000:02:02.1", "i40evf");
        fake::link_vf_to_pf(tmp, "0000:02:02.1", "0000:02:00.0", 1);
        fake::add_net_name(tmp, "0000:02:02.1", "enp2s2f1", "1");
    }

    #[test]
    fn empty_match_set_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("sys/bus/pci/devices")).unwrap();
        let scanner = DeviceScanner::new(SysFs::new(tmp.path()));

        let sel = DeviceSelectors {
            vendors: vec!["8086".into()],
            ..Default::default()
        };
        assert!(scanner.scan(&sel).unwrap().is_empty());
    }

    #[test]
    fn unreadable_device_tree_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let scanner = DeviceScanner::new(SysFs::new(tmp.path()));
        let err = scanner.scan(&DeviceSelectors::default()).unwrap_err();
        assert!(matches!(err, DpError::Discovery(_)));
    }

    #[test]
    fn driver_selector() {
        let tmp = tempfile::tempdir().unwrap();
        two_vf_tree(tmp.path());
        let scanner = DeviceScanner::new(SysFs::new(tmp.path()));

        let sel = DeviceSelectors {
            drivers: vec!["vfio-pci".into()],
            ..Default::default()
        };
        assert_eq!(scanner.scan(&sel).unwrap(), vec!["0000:02:02.0"]);
    }

    #[test]
    fn vendor_and_device_selectors() {
        let tmp = tempfile::tempdir().unwrap();
        two_vf_tree(tmp.path());
        let scanner = DeviceScanner::new(SysFs::new(tmp.path()));

        let sel = DeviceSelectors {
            vendors: vec!["8086".into()],
            devices: vec!["154c".into()],
            ..Default::default()
        };
        assert_eq!(
            scanner.scan(&sel).unwrap(),
            vec!["0000:02:02.0", "0000:02:02.1"]
        );
    }

    #[test]
    fn pf_name_selector() {
        let tmp = tempfile::tempdir().unwrap();
        two_vf_tree(tmp.path());
        let scanner = DeviceScanner::new(SysFs::new(tmp.path()));

        let sel = DeviceSelectors {
            pf_names: vec!["enp2s0f0".into()],
            ..Default::default()
        };
        // Both VFs hang off enp2s0f0; the PF itself has no physfn.
        assert_eq!(
            scanner.scan(&sel).unwrap(),
            vec!["0000:02:02.0", "0000:02:02.1"]
        );
    }

    #[test]
    fn link_type_selector() {
        let tmp = tempfile::tempdir().unwrap();
        two_vf_tree(tmp.path());
        let scanner = DeviceScanner::new(SysFs::new(tmp.path()));

        let sel = DeviceSelectors {
            link_types: vec!["ether".into()],
            ..Default::default()
        };
        // Only 0000:02:02.1 and the PF expose a netdev; the PF matches too.
        assert_eq!(
            scanner.scan(&sel).unwrap(),
            vec!["0000:02:00.0", "0000:02:02.1"]
        );
    }

    #[test]
    fn rdma_selector_excludes_non_rdma() {
        let tmp = tempfile::tempdir().unwrap();
        two_vf_tree(tmp.path());
        let scanner = DeviceScanner::new(SysFs::new(tmp.path()));

        let sel = DeviceSelectors {
            is_rdma: true,
            ..Default::default()
        };
        assert!(scanner.scan(&sel).unwrap().is_empty());

        fs::create_dir_all(
            tmp.path()
                .join("sys/bus/pci/devices/0000:02:02.0/infiniband/mlx5_0"),
        )
        .unwrap();
        assert_eq!(scanner.scan(&sel).unwrap(), vec!["0000:02:02.0"]);
    }

    #[test]
    fn non_network_class_devices_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        two_vf_tree(tmp.path());
        // A storage controller that would otherwise match the vendor.
        fake::add_pci_device(tmp.path(), "0000:04:00.0", "8086", "0953", "010802");
        let scanner = DeviceScanner::new(SysFs::new(tmp.path()));

        let sel = DeviceSelectors {
            vendors: vec!["8086".into()],
            ..Default::default()
        };
        assert!(!scanner.scan(&sel).unwrap().contains(&"0000:04:00.0".into()));
    }
}
