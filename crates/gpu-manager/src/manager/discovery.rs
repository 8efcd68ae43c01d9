use std::collections::HashMap;
use std::io;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;

use super::ManagerError;
use crate::device::Device;
use crate::device::DeviceHealth;
use crate::nvml;
use crate::nvml::DeviceInfoProvider;

const NVIDIA_DEVICE_PREFIX: &str = "nvidia";

/// Whether `name` is a raw GPU device node name, `nvidia<digits>`.
///
/// Control nodes such as `nvidiactl` and `nvidia-uvm` do not match.
pub fn is_raw_device_name(name: &str) -> bool {
    name.strip_prefix(NVIDIA_DEVICE_PREFIX)
        .is_some_and(|minor| !minor.is_empty() && minor.bytes().all(|b| b.is_ascii_digit()))
}

pub fn device_id(minor: u32) -> String {
    format!("{NVIDIA_DEVICE_PREFIX}{minor}")
}

/// Enumerates all GPUs and returns them as Healthy devices keyed by id.
///
/// Failing to read the count, a handle or a minor number fails the whole pass.
/// A failed topology lookup only drops the topology of that device.
pub fn discover(
    device_info: &dyn DeviceInfoProvider,
    pci_devices_root: &Path,
) -> Result<HashMap<String, Device>, Report<ManagerError>> {
    let count = device_info
        .device_count()
        .change_context(ManagerError::Discovery)?;

    let mut devices = HashMap::with_capacity(count as usize);
    for index in 0..count {
        let handle = device_info
            .handle_by_index(index)
            .change_context(ManagerError::Discovery)?;
        let minor = device_info
            .minor_number(handle)
            .change_context(ManagerError::Discovery)?;

        let id = device_id(minor);
        tracing::debug!("Found Nvidia GPU {id:?}");

        let topology = match device_info
            .pci_bus_id(handle)
            .and_then(|bus_id| nvml::topology(&bus_id, pci_devices_root))
        {
            Ok(topology) => Some(topology),
            Err(e) => {
                tracing::warn!("unable to get topology for device with index {index}: {e:?}");
                None
            }
        };

        devices.insert(id.clone(), Device::new(id, DeviceHealth::Healthy, topology));
    }

    Ok(devices)
}

/// Counts `nvidia<digits>` entries in the device directory.
///
/// Cheap compared to an NVML pass; only used to notice new GPUs.
pub fn count_raw_device_files(dev_directory: &Path) -> io::Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dev_directory)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_str().is_some_and(is_raw_device_name) {
            count += 1;
        }
    }
    Ok(count)
}
