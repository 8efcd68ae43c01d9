//! Virtual devices for time-sharing and MPS.
//!
//! Each physical GPU is advertised as `max_shared_clients_per_gpu` virtual
//! devices named `<physical>/vgpu<i>`. Virtual devices hold no state of their
//! own; they are rebuilt from the physical view on every listing.

use std::collections::HashMap;

use error_stack::Report;

use super::ManagerError;
use super::RejectReason;
use crate::device::Device;

const VIRTUAL_DEVICE_SEPARATOR: &str = "/vgpu";

pub fn virtual_device_id(physical_id: &str, index: u32) -> String {
    format!("{physical_id}{VIRTUAL_DEVICE_SEPARATOR}{index}")
}

/// Maps `nvidia0/vgpu3` back to `nvidia0`.
pub fn virtual_to_physical_device_id(virtual_id: &str) -> Result<&str, Report<ManagerError>> {
    let malformed = || {
        Report::new(ManagerError::AllocationRejected {
            device_id: virtual_id.to_string(),
            reason: RejectReason::MalformedVirtualId,
        })
    };

    let (physical, index) = virtual_id
        .rsplit_once(VIRTUAL_DEVICE_SEPARATOR)
        .ok_or_else(malformed)?;
    if physical.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    Ok(physical)
}

/// Expands every physical device into `clients_per_gpu` virtual devices that
/// carry the parent's current health and topology.
pub fn virtualize(
    physical: &HashMap<String, Device>,
    clients_per_gpu: u32,
) -> HashMap<String, Device> {
    physical
        .values()
        .flat_map(|device| {
            (0..clients_per_gpu).map(move |i| {
                let id = virtual_device_id(&device.id, i);
                (
                    id.clone(),
                    Device::new(id, device.health, device.topology.clone()),
                )
            })
        })
        .collect()
}
