use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use error_stack::Report;
use utils::version;

use crate::config::gpu::parse_health_critical_xid;
use crate::config::gpu::ConfigError;
use crate::config::gpu::GpuConfig;
use crate::config::gpu::SharingStrategy;
use crate::device::Mount;
use crate::manager::ManagerConfig;
use crate::plugin::RetryPolicy;
use crate::plugin::SupervisorConfig;

/// NVIDIA GPU device plugin for Kubernetes
#[derive(Parser, Clone, Debug)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct PluginArgs {
    #[arg(
        long,
        env = "PLUGIN_DIRECTORY",
        default_value = "/device-plugin",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the kubelet registration socket and the plugin endpoint"
    )]
    pub plugin_directory: PathBuf,

    #[arg(
        long,
        default_value = "kubelet.sock",
        help = "File name of the kubelet registration socket inside the plugin directory"
    )]
    pub kubelet_endpoint: String,

    #[arg(
        long,
        default_value = "nvidiaGPU.sock",
        help = "File name of the socket this plugin serves on inside the plugin directory"
    )]
    pub plugin_endpoint: String,

    #[arg(
        long,
        env = "RESOURCE_NAME",
        default_value = "nvidia.com/gpu",
        help = "Extended resource name advertised to the kubelet"
    )]
    pub resource_name: String,

    #[arg(
        long,
        default_value = "/dev",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the nvidia device nodes"
    )]
    pub dev_directory: PathBuf,

    #[arg(
        long,
        default_value = "/sys/bus/pci/devices",
        value_hint = clap::ValueHint::DirPath,
        help = "Root of the PCI device tree used to look up NUMA affinity"
    )]
    pub pci_devices_root: PathBuf,

    #[arg(
        long,
        default_value = "/home/kubernetes/bin/nvidia",
        value_hint = clap::ValueHint::DirPath,
        help = "Host path of the installed NVIDIA driver libraries and binaries"
    )]
    pub host_path: PathBuf,

    #[arg(
        long,
        default_value = "/usr/local/nvidia",
        help = "Path the NVIDIA driver directory is mounted at inside containers"
    )]
    pub container_path: PathBuf,

    #[arg(
        long,
        env = "GPU_CONFIG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "JSON GPU config file, e.g. /etc/nvidia/gpu_config.json; flags below override it"
    )]
    pub gpu_config: Option<PathBuf>,

    #[arg(long, env = "GPU_PARTITION_SIZE", help = "MIG partition size, e.g. 1g.5gb")]
    pub gpu_partition_size: Option<String>,

    #[arg(
        long,
        help = "Deprecated: number of time-shared clients per GPU, implies time-sharing"
    )]
    pub max_time_shared_clients_per_gpu: Option<u32>,

    #[arg(long, help = "GPU sharing strategy, either 'time-sharing' or 'mps'")]
    pub gpu_sharing_strategy: Option<SharingStrategy>,

    #[arg(long, help = "Maximum number of containers sharing one GPU")]
    pub max_shared_clients_per_gpu: Option<u32>,

    #[arg(
        long,
        env = "XID_CONFIG",
        help = "Comma separated XID codes that mark a GPU unhealthy, e.g. '48,79'"
    )]
    pub xid_config: Option<String>,

    #[arg(
        long,
        default_value = "/usr/local/nvidia/bin/nvidia-cuda-mps-control",
        value_hint = clap::ValueHint::FilePath,
        help = "MPS control binary used to check the MPS daemon"
    )]
    pub mps_control_bin: PathBuf,

    #[arg(
        long,
        default_value = "/tmp/nvidia-mps",
        value_hint = clap::ValueHint::DirPath,
        help = "MPS pipe directory mounted into MPS clients"
    )]
    pub mps_pipe_directory: PathBuf,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds between checks for the NVIDIA control device nodes at startup"
    )]
    pub device_paths_check_interval_secs: u64,

    #[arg(
        long,
        default_value = "1000",
        help = "Milliseconds between checks that the plugin endpoint still exists"
    )]
    pub endpoint_check_interval_ms: u64,

    #[arg(
        long,
        default_value = "10",
        help = "Seconds between checks for newly installed GPUs"
    )]
    pub device_check_interval_secs: u64,

    #[arg(
        long,
        default_value = "10",
        help = "Rediscovery attempts after new GPUs are detected, 0 retries forever"
    )]
    pub rediscovery_max_attempts: u32,
}

impl PluginArgs {
    /// Builds the validated GPU config: file first, then flag overrides, then
    /// the `XID_CONFIG` list.
    pub fn gpu_config(&self) -> Result<GpuConfig, Report<ConfigError>> {
        let mut config = match &self.gpu_config {
            Some(path) => GpuConfig::from_file(path)?,
            None => GpuConfig::default(),
        };

        if let Some(size) = &self.gpu_partition_size {
            config.gpu_partition_size = size.clone();
        }
        if let Some(count) = self.max_time_shared_clients_per_gpu {
            config.max_time_shared_clients_per_gpu = count;
        }
        if let Some(strategy) = self.gpu_sharing_strategy {
            config.gpu_sharing_config.gpu_sharing_strategy = Some(strategy);
        }
        if let Some(count) = self.max_shared_clients_per_gpu {
            config.gpu_sharing_config.max_shared_clients_per_gpu = count;
        }
        match &self.xid_config {
            Some(xids) => {
                tracing::info!("Detect HealthCriticalXid: {xids}");
                config.health_critical_xid = parse_health_critical_xid(xids)?;
            }
            None if config.health_critical_xid.is_empty() => {
                tracing::info!("There is no Xid config specified");
            }
            None => {}
        }

        config.add_defaults_and_validate()?;
        Ok(config)
    }

    pub fn manager_config(&self, gpu_config: GpuConfig) -> ManagerConfig {
        ManagerConfig {
            dev_directory: self.dev_directory.clone(),
            pci_devices_root: self.pci_devices_root.clone(),
            mount_paths: vec![Mount {
                host_path: self.host_path.clone(),
                container_path: self.container_path.clone(),
                read_only: true,
            }],
            mps_control_bin: self.mps_control_bin.clone(),
            mps_pipe_directory: self.mps_pipe_directory.clone(),
            gpu_config,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            plugin_directory: self.plugin_directory.clone(),
            kubelet_endpoint: self.kubelet_endpoint.clone(),
            plugin_endpoint: self.plugin_endpoint.clone(),
            resource_name: self.resource_name.clone(),
            endpoint_check_interval: Duration::from_millis(self.endpoint_check_interval_ms),
            device_check_interval: Duration::from_secs(self.device_check_interval_secs),
            readiness_poll_interval: Duration::from_secs(1),
            rediscovery: RetryPolicy {
                max_attempts: self.rediscovery_max_attempts,
                ..RetryPolicy::default()
            },
        }
    }
}
