//! Kubelet device plugin
//!
//! - [`service`]: the DevicePlugin gRPC service backed by the [`GpuManager`](crate::manager::GpuManager)
//! - [`registration`]: unix socket clients for the kubelet and our own endpoint
//! - [`watcher`]: filesystem events of the device plugin directory
//! - [`supervisor`]: the serve, register, drain and restart loop

pub mod registration;
pub mod service;
pub mod supervisor;
pub mod watcher;

use core::error::Error;
use std::path::PathBuf;

pub use service::DevicePluginService;
pub use supervisor::DrainReason;
pub use supervisor::RetryPolicy;
pub use supervisor::Supervisor;
pub use supervisor::SupervisorConfig;
pub use supervisor::SupervisorHandle;
pub use supervisor::SupervisorState;

#[derive(Debug, derive_more::Display)]
pub enum PluginError {
    #[display("failed to listen on device plugin endpoint {}", path.display())]
    Listen { path: PathBuf },
    #[display("failed to connect to {}", path.display())]
    Connect { path: PathBuf },
    #[display("failed to register with kubelet at {}", path.display())]
    Registration { path: PathBuf },
    #[display("failed to watch {}", path.display())]
    Watch { path: PathBuf },
    #[display("failed to rediscover GPUs after {attempts} attempt(s)")]
    Rediscovery { attempts: u32 },
    #[display("failed to remove {}", path.display())]
    Cleanup { path: PathBuf },
    #[display("device plugin supervisor task failed")]
    Supervisor,
}

impl Error for PluginError {}
