//! NVIDIA Management Library (NVML) integration
//!
//! This module provides the hardware view the manager is built on:
//! - a [`DeviceInfoProvider`] seam over device enumeration
//! - the NVML backed implementation
//! - PCI topology lookup for NUMA affinity

#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod topology;

use core::error::Error;
use std::sync::Arc;

use error_stack::Report;
use nvml_wrapper::Nvml;

pub use topology::topology;

/// Errors returned by device queries.
#[derive(Debug, derive_more::Display)]
pub enum DeviceInfoError {
    #[display("failed to initialize NVML")]
    Init,
    #[display("failed to get devices count")]
    DeviceCount,
    #[display("failed to get the device handle for index {index}")]
    Handle { index: u32 },
    #[display("failed to get the minor number for device with index {index}")]
    MinorNumber { index: u32 },
    #[display("failed to get the PCI bus id for device with index {index}")]
    PciBusId { index: u32 },
    #[display("failed to get GPU memory for device with index {index}")]
    MemoryInfo { index: u32 },
    #[display("failed to resolve NUMA topology for PCI device `{bus_id}`")]
    Topology { bus_id: String },
}

impl Error for DeviceInfoError {}

/// Opaque reference to an enumerated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle {
    index: u32,
}

impl DeviceHandle {
    pub fn new(index: u32) -> Self {
        Self { index }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Hardware queries used by discovery and MPS setup.
pub trait DeviceInfoProvider: Send + Sync {
    fn device_count(&self) -> Result<u32, Report<DeviceInfoError>>;

    fn handle_by_index(&self, index: u32) -> Result<DeviceHandle, Report<DeviceInfoError>>;

    /// Minor number of the `/dev/nvidia<minor>` node.
    fn minor_number(&self, handle: DeviceHandle) -> Result<u32, Report<DeviceInfoError>>;

    /// PCI bus id as NVML reports it, e.g. `00000000:3B:00.0`.
    fn pci_bus_id(&self, handle: DeviceHandle) -> Result<String, Report<DeviceInfoError>>;

    /// Total framebuffer memory in bytes.
    fn total_memory(&self, handle: DeviceHandle) -> Result<u64, Report<DeviceInfoError>>;
}

/// [`DeviceInfoProvider`] backed by the NVML library.
pub struct NvmlDeviceInfo {
    nvml: Arc<Nvml>,
}

impl NvmlDeviceInfo {
    pub fn new(nvml: Arc<Nvml>) -> Self {
        Self { nvml }
    }

    fn device(
        &self,
        index: u32,
    ) -> Result<nvml_wrapper::Device<'_>, Report<DeviceInfoError>> {
        self.nvml.device_by_index(index).map_err(|e| {
            Report::new(DeviceInfoError::Handle { index }).attach_printable(e.to_string())
        })
    }
}

impl DeviceInfoProvider for NvmlDeviceInfo {
    fn device_count(&self) -> Result<u32, Report<DeviceInfoError>> {
        self.nvml
            .device_count()
            .map_err(|e| Report::new(DeviceInfoError::DeviceCount).attach_printable(e.to_string()))
    }

    fn handle_by_index(&self, index: u32) -> Result<DeviceHandle, Report<DeviceInfoError>> {
        self.device(index).map(|_| DeviceHandle::new(index))
    }

    fn minor_number(&self, handle: DeviceHandle) -> Result<u32, Report<DeviceInfoError>> {
        let index = handle.index();
        self.device(index)?.minor_number().map_err(|e| {
            Report::new(DeviceInfoError::MinorNumber { index }).attach_printable(e.to_string())
        })
    }

    fn pci_bus_id(&self, handle: DeviceHandle) -> Result<String, Report<DeviceInfoError>> {
        let index = handle.index();
        self.device(index)?
            .pci_info()
            .map(|info| info.bus_id)
            .map_err(|e| {
                Report::new(DeviceInfoError::PciBusId { index }).attach_printable(e.to_string())
            })
    }

    fn total_memory(&self, handle: DeviceHandle) -> Result<u64, Report<DeviceInfoError>> {
        let index = handle.index();
        self.device(index)?
            .memory_info()
            .map(|memory| memory.total)
            .map_err(|e| {
                Report::new(DeviceInfoError::MemoryInfo { index }).attach_printable(e.to_string())
            })
    }
}

/// Initializes NVML, retrying with the versioned library name when the
/// default lookup fails.
pub fn init_nvml() -> Result<Nvml, Report<DeviceInfoError>> {
    match Nvml::init() {
        Ok(nvml) => {
            tracing::info!("NVML initialized successfully");
            Ok(nvml)
        }
        Err(_) => {
            tracing::warn!("Standard NVML init failed, trying with explicit library path");
            let nvml = Nvml::builder()
                .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                .init()
                .map_err(|e| Report::new(DeviceInfoError::Init).attach_printable(e.to_string()))?;
            tracing::info!("NVML initialized with explicit library path");
            Ok(nvml)
        }
    }
}
