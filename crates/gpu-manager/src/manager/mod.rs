//! NVIDIA GPU manager
//!
//! Owns the node's device view and answers the two questions the device
//! plugin service asks: which devices to advertise, and what a container
//! needs to use a given device.

pub mod discovery;
pub mod mps;
pub mod partition;
pub mod registry;
pub mod sharing;

use core::error::Error;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::sync::broadcast;

use crate::config::GpuConfig;
use crate::config::SharingStrategy;
use crate::device::Device;
use crate::device::DeviceHealth;
use crate::device::DeviceSpec;
use crate::device::Mount;
use crate::device::Topology;
use crate::health::HealthEvent;
use crate::health::HealthNotifier;
use crate::nvml::DeviceInfoProvider;
use partition::PartitionDelegate;
use registry::DeviceRegistry;

// All NVIDIA GPUs need nvidiactl and nvidia-uvm; both exist once the driver is installed.
const NVIDIA_CTL_DEVICE: &str = "nvidiactl";
const NVIDIA_UVM_DEVICE: &str = "nvidia-uvm";
// Optional devices.
const NVIDIA_UVM_TOOLS_DEVICE: &str = "nvidia-uvm-tools";
const NVIDIA_MODESET_DEVICE: &str = "nvidia-modeset";

/// Checks that `nvidiactl` and `nvidia-uvm` exist in `dev_directory`.
pub fn check_device_paths(dev_directory: &Path) -> Result<(), Report<ManagerError>> {
    for name in [NVIDIA_CTL_DEVICE, NVIDIA_UVM_DEVICE] {
        let path = dev_directory.join(name);
        std::fs::metadata(&path)
            .change_context_lazy(|| ManagerError::MissingControlDevice { path: path.clone() })?;
    }
    Ok(())
}

/// Why an allocation request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum RejectReason {
    #[display("non-existing")]
    UnknownDevice,
    #[display("unhealthy")]
    UnhealthyDevice,
    #[display("malformed virtual")]
    MalformedVirtualId,
}

#[derive(Debug, derive_more::Display)]
pub enum ManagerError {
    #[display("failed to discover GPU devices")]
    Discovery,
    #[display("NVIDIA control device {} is missing", path.display())]
    MissingControlDevice { path: PathBuf },
    #[display("GPU partitioning is configured but no partition manager is available")]
    MissingPartitionDelegate,
    #[display("failed to start the GPU partition manager")]
    PartitionStart,
    #[display("NVIDIA MPS is not running on this node")]
    MpsUnavailable,
    #[display("failed to query total memory available per GPU")]
    MemoryQuery,
    #[display("invalid allocation request with {reason} device {device_id}")]
    AllocationRejected {
        device_id: String,
        reason: RejectReason,
    },
}

impl Error for ManagerError {}

/// Static settings of the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Where the `nvidia*` device nodes live, normally `/dev`
    pub dev_directory: PathBuf,
    pub pci_devices_root: PathBuf,
    /// Mounts added to every allocation, e.g. the driver directory
    pub mount_paths: Vec<Mount>,
    pub mps_control_bin: PathBuf,
    pub mps_pipe_directory: PathBuf,
    pub gpu_config: GpuConfig,
}

/// Which store answers listing, allocation and health queries. Fixed at
/// construction from the partition size.
enum DeviceBackend {
    Physical,
    Partitioned(Arc<dyn PartitionDelegate>),
}

pub struct GpuManager {
    config: ManagerConfig,
    device_info: Arc<dyn DeviceInfoProvider>,
    registry: DeviceRegistry,
    backend: DeviceBackend,
    health: HealthNotifier,
    default_devices: Vec<PathBuf>,
    mount_paths: Vec<Mount>,
    total_mem_per_gpu: u64,
}

impl GpuManager {
    /// Creates a manager. A partition delegate is required exactly when the
    /// config sets a partition size; it is ignored otherwise.
    pub fn new(
        config: ManagerConfig,
        device_info: Arc<dyn DeviceInfoProvider>,
        partition_delegate: Option<Arc<dyn PartitionDelegate>>,
    ) -> Result<Self, Report<ManagerError>> {
        let backend = if config.gpu_config.partitioning_enabled() {
            let delegate = partition_delegate
                .ok_or_else(|| Report::new(ManagerError::MissingPartitionDelegate))
                .attach_printable_lazy(|| {
                    format!("partition size: {}", config.gpu_config.gpu_partition_size)
                })?;
            DeviceBackend::Partitioned(delegate)
        } else {
            DeviceBackend::Physical
        };

        Ok(Self {
            mount_paths: config.mount_paths.clone(),
            config,
            device_info,
            registry: DeviceRegistry::new(),
            backend,
            health: HealthNotifier::new(),
            default_devices: Vec::new(),
            total_mem_per_gpu: 0,
        })
    }

    /// Checks that the control devices exist, i.e. that the driver is installed.
    pub fn check_device_paths(&self) -> Result<(), Report<ManagerError>> {
        check_device_paths(&self.config.dev_directory)
    }

    /// Discovers GPUs and prepares everything needed before serving.
    pub async fn start(&mut self) -> Result<(), Report<ManagerError>> {
        let dev = &self.config.dev_directory;
        self.default_devices = vec![dev.join(NVIDIA_CTL_DEVICE), dev.join(NVIDIA_UVM_DEVICE)];
        for optional in [NVIDIA_MODESET_DEVICE, NVIDIA_UVM_TOOLS_DEVICE] {
            let path = dev.join(optional);
            if path.exists() {
                self.default_devices.push(path);
            }
        }

        self.discover_gpus()?;

        if let DeviceBackend::Partitioned(delegate) = &self.backend {
            let partition_size = &self.config.gpu_config.gpu_partition_size;
            delegate
                .start(partition_size)
                .change_context(ManagerError::PartitionStart)?;
        }

        if self.config.gpu_config.sharing_strategy() == Some(SharingStrategy::Mps) {
            mps::check_mps_daemon(&self.config.mps_control_bin).await?;
            self.mount_paths.push(Mount {
                host_path: self.config.mps_pipe_directory.clone(),
                container_path: self.config.mps_pipe_directory.clone(),
                read_only: false,
            });
            self.total_mem_per_gpu = self.query_total_mem_per_gpu()?;
        }
        Ok(())
    }

    fn query_total_mem_per_gpu(&self) -> Result<u64, Report<ManagerError>> {
        let count = self
            .device_info
            .device_count()
            .change_context(ManagerError::MemoryQuery)?;
        if count == 0 {
            return Err(Report::new(ManagerError::MemoryQuery)
                .attach_printable(format!("no GPUs on node, count: {count}")));
        }
        let handle = self
            .device_info
            .handle_by_index(0)
            .change_context(ManagerError::MemoryQuery)?;
        self.device_info
            .total_memory(handle)
            .change_context(ManagerError::MemoryQuery)
    }

    /// Rebuilds the physical registry from a fresh discovery pass. On failure
    /// the previous registry stays in place.
    pub fn discover_gpus(&self) -> Result<(), Report<ManagerError>> {
        let devices = discovery::discover(
            self.device_info.as_ref(),
            &self.config.pci_devices_root,
        )?;
        tracing::info!("Discovered {} GPU device(s)", devices.len());
        self.registry.replace_all(devices);
        Ok(())
    }

    /// Whether more GPU device nodes exist than devices are registered.
    pub fn has_additional_gpus_installed(&self) -> bool {
        let registered = self.registry.len();
        match discovery::count_raw_device_files(&self.config.dev_directory) {
            Ok(count) if count > registered => {
                tracing::info!(
                    "Found {count} GPUs, while only {registered} are registered. Stopping device-plugin server."
                );
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::error!(
                    "failed to count GPU devices in {}: {e}",
                    self.config.dev_directory.display()
                );
                false
            }
        }
    }

    /// Physical GPUs, or the partitions when partitioning is enabled.
    pub fn list_physical_devices(&self) -> HashMap<String, Device> {
        match &self.backend {
            DeviceBackend::Physical => self.registry.snapshot(),
            DeviceBackend::Partitioned(delegate) => delegate.list_partition_devices(),
        }
    }

    /// Devices advertised to the kubelet.
    pub fn list_devices(&self) -> HashMap<String, Device> {
        let physical = self.list_physical_devices();
        match &self.backend {
            DeviceBackend::Physical if self.config.gpu_config.sharing_enabled() => {
                sharing::virtualize(&physical, self.config.gpu_config.max_shared_clients_per_gpu())
            }
            _ => physical,
        }
    }

    /// Device nodes needed to use `device_id`, which is a virtual id when
    /// sharing is enabled.
    pub fn device_spec(&self, device_id: &str) -> Result<Vec<DeviceSpec>, Report<ManagerError>> {
        let delegate = match &self.backend {
            DeviceBackend::Partitioned(delegate) => delegate,
            DeviceBackend::Physical => return self.physical_device_spec(device_id),
        };
        delegate.device_spec(device_id).map_err(|report| {
            let reason = match report.current_context() {
                partition::PartitionError::UnhealthyDevice { .. } => RejectReason::UnhealthyDevice,
                _ => RejectReason::UnknownDevice,
            };
            report.change_context(ManagerError::AllocationRejected {
                device_id: device_id.to_string(),
                reason,
            })
        })
    }

    fn physical_device_spec(&self, device_id: &str) -> Result<Vec<DeviceSpec>, Report<ManagerError>> {
        let physical_id = if self.config.gpu_config.sharing_enabled() {
            sharing::virtual_to_physical_device_id(device_id)?
        } else {
            device_id
        };

        let reject = |reason| {
            Report::new(ManagerError::AllocationRejected {
                device_id: physical_id.to_string(),
                reason,
            })
        };
        let device = self
            .registry
            .get(physical_id)
            .ok_or_else(|| reject(RejectReason::UnknownDevice))?;
        if device.health != DeviceHealth::Healthy {
            return Err(reject(RejectReason::UnhealthyDevice));
        }

        Ok(vec![DeviceSpec::read_write_mknod(
            self.config.dev_directory.join(physical_id),
        )])
    }

    /// MPS limits for a container requesting `num_devices_requested` devices.
    /// Empty unless the sharing strategy is MPS.
    pub fn envs(&self, num_devices_requested: usize) -> HashMap<String, String> {
        match self.config.gpu_config.sharing_strategy() {
            Some(SharingStrategy::Mps) => mps::mps_envs(
                num_devices_requested as u64,
                self.config.gpu_config.max_shared_clients_per_gpu(),
                self.total_mem_per_gpu,
            ),
            _ => HashMap::new(),
        }
    }

    /// Records a health change reported by a health monitor and notifies
    /// ListAndWatch streams.
    pub fn set_device_health(&self, name: &str, health: DeviceHealth, topology: Option<Topology>) {
        match &self.backend {
            DeviceBackend::Physical => {
                if !self.registry.set_health(name, health, topology) {
                    tracing::warn!("health update for unknown device {name} ignored");
                    return;
                }
            }
            DeviceBackend::Partitioned(delegate) => {
                delegate.set_device_health(name, health, topology)
            }
        }
        tracing::info!("device {name} is now {health}");
        self.health.publish(HealthEvent {
            device_id: name.to_string(),
            health,
        });
    }

    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.health.subscribe()
    }

    /// Ends health reporting; open subscriptions finish.
    pub fn close_health(&self) {
        self.health.close();
    }

    /// Number of GPUs found by the last discovery pass.
    pub fn registered_gpu_count(&self) -> usize {
        self.registry.len()
    }

    pub fn default_devices(&self) -> &[PathBuf] {
        &self.default_devices
    }

    pub fn mount_paths(&self) -> &[Mount] {
        &self.mount_paths
    }

    pub fn health_critical_xid(&self) -> &[u32] {
        &self.config.gpu_config.health_critical_xid
    }
}
