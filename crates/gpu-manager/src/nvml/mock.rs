//! In-memory [`DeviceInfoProvider`] for tests.

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use error_stack::Report;

use super::DeviceHandle;
use super::DeviceInfoError;
use super::DeviceInfoProvider;

/// A fake GPU.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub minor: u32,
    pub bus_id: String,
    pub total_memory: u64,
    /// Make `handle_by_index` fail for this device.
    pub fail_handle: bool,
    /// Make `minor_number` fail for this device.
    pub fail_minor_number: bool,
}

impl MockDevice {
    /// 80GiB device whose bus id does not exist in any PCI tree.
    pub fn new(minor: u32) -> Self {
        Self {
            minor,
            bus_id: format!("00000000:{:02x}:00.0", 0x10 + minor),
            total_memory: 80 * 1024 * 1024 * 1024,
            fail_handle: false,
            fail_minor_number: false,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<MockDevice>,
    fail_device_count: bool,
}

#[derive(Debug, Default)]
pub struct MockDeviceInfo {
    state: Mutex<MockState>,
}

impl MockDeviceInfo {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            state: Mutex::new(MockState {
                devices,
                fail_device_count: false,
            }),
        }
    }

    /// Devices with minors `0..count`.
    pub fn with_count(count: u32) -> Self {
        Self::new((0..count).map(MockDevice::new).collect())
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the enumerated devices, e.g. to simulate a hot-added GPU.
    pub fn set_devices(&self, devices: Vec<MockDevice>) {
        self.state().devices = devices;
    }

    pub fn set_device_count_failure(&self, fail: bool) {
        self.state().fail_device_count = fail;
    }

    fn get(&self, handle: DeviceHandle) -> Result<MockDevice, Report<DeviceInfoError>> {
        let index = handle.index();
        self.state()
            .devices
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Report::new(DeviceInfoError::Handle { index }))
    }
}

impl DeviceInfoProvider for MockDeviceInfo {
    fn device_count(&self) -> Result<u32, Report<DeviceInfoError>> {
        let state = self.state();
        if state.fail_device_count {
            return Err(Report::new(DeviceInfoError::DeviceCount)
                .attach_printable("mock device count failure"));
        }
        Ok(state.devices.len() as u32)
    }

    fn handle_by_index(&self, index: u32) -> Result<DeviceHandle, Report<DeviceInfoError>> {
        let handle = DeviceHandle::new(index);
        let device = self.get(handle)?;
        if device.fail_handle {
            return Err(Report::new(DeviceInfoError::Handle { index })
                .attach_printable("mock handle failure"));
        }
        Ok(handle)
    }

    fn minor_number(&self, handle: DeviceHandle) -> Result<u32, Report<DeviceInfoError>> {
        let device = self.get(handle)?;
        if device.fail_minor_number {
            return Err(Report::new(DeviceInfoError::MinorNumber {
                index: handle.index(),
            }));
        }
        Ok(device.minor)
    }

    fn pci_bus_id(&self, handle: DeviceHandle) -> Result<String, Report<DeviceInfoError>> {
        self.get(handle).map(|device| device.bus_id)
    }

    fn total_memory(&self, handle: DeviceHandle) -> Result<u64, Report<DeviceInfoError>> {
        self.get(handle).map(|device| device.total_memory)
    }
}
