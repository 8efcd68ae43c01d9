use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::device::Device;
use crate::device::DeviceHealth;
use crate::device::Topology;

/// Physical GPUs keyed by id (`nvidia<minor>`).
///
/// Every access takes the lock for the duration of one call only. A rebuild
/// swaps in a fully built map, so readers see either the old or the new set.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Device>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the whole registry with the result of a discovery pass.
    pub fn replace_all(&self, devices: HashMap<String, Device>) {
        *self.lock() = devices;
    }

    /// Updates the health of a registered device.
    ///
    /// `None` topology keeps the known topology. Returns `false` when the
    /// device was never discovered; such updates are dropped because entries
    /// are only created by discovery.
    pub fn set_health(&self, id: &str, health: DeviceHealth, topology: Option<Topology>) -> bool {
        let mut devices = self.lock();
        match devices.get_mut(id) {
            Some(device) => {
                device.health = health;
                if topology.is_some() {
                    device.topology = topology;
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.lock().get(id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, Device> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
