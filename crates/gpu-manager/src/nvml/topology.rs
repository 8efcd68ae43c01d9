use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;

use super::DeviceInfoError;
use crate::device::Topology;

/// Converts an NVML bus id into the sysfs directory name.
///
/// NVML reports an 8 digit PCI domain (`00000000:3B:00.0`) while sysfs uses
/// 4 lowercase digits (`0000:3b:00.0`).
fn sysfs_bus_id(bus_id: &str) -> Option<String> {
    let (domain, rest) = bus_id.split_once(':')?;
    let domain = match domain.len() {
        8 => &domain[4..],
        4 => domain,
        _ => return None,
    };
    if !domain.chars().all(|c| c.is_ascii_hexdigit()) || rest.is_empty() {
        return None;
    }
    Some(format!("{domain}:{rest}").to_lowercase())
}

/// Reads the NUMA node of a PCI device from `<pci_devices_root>/<bus id>/numa_node`.
///
/// A node of `-1` means the platform reports no affinity, which is treated as
/// an error like a missing file.
pub fn topology(bus_id: &str, pci_devices_root: &Path) -> Result<Topology, Report<DeviceInfoError>> {
    let context = || DeviceInfoError::Topology {
        bus_id: bus_id.to_string(),
    };

    let dir = sysfs_bus_id(bus_id)
        .ok_or_else(|| Report::new(context()).attach_printable("malformed PCI bus id"))?;
    let numa_file = pci_devices_root.join(dir).join("numa_node");

    let content = std::fs::read_to_string(&numa_file)
        .change_context_lazy(context)
        .attach_printable_lazy(|| format!("numa file: {}", numa_file.display()))?;
    let node = content.trim().parse::<i64>().change_context_lazy(context)?;
    if node < 0 {
        return Err(Report::new(context()).attach_printable(format!("numa node is {node}")));
    }

    Ok(Topology {
        numa_nodes: vec![node],
    })
}
