//! Seam to a GPU partition (MIG) manager.
//!
//! When a partition size is configured the partition manager owns the whole
//! device view: listing, allocation and health all go through it and the
//! physical registry is only kept for new-GPU detection.

use core::error::Error;
use std::collections::HashMap;

use error_stack::Report;

use crate::device::Device;
use crate::device::DeviceHealth;
use crate::device::DeviceSpec;
use crate::device::Topology;

#[derive(Debug, derive_more::Display)]
pub enum PartitionError {
    #[display("failed to create GPU partitions of size {partition_size}")]
    Start { partition_size: String },
    #[display("partition device {device_id} is not available")]
    UnknownDevice { device_id: String },
    #[display("partition device {device_id} is unhealthy")]
    UnhealthyDevice { device_id: String },
}

impl Error for PartitionError {}

pub trait PartitionDelegate: Send + Sync {
    /// Creates the partitions and discovers their device nodes.
    fn start(&self, partition_size: &str) -> Result<(), Report<PartitionError>>;

    fn list_partition_devices(&self) -> HashMap<String, Device>;

    /// Device nodes a container needs to use partition `device_id`.
    fn device_spec(&self, device_id: &str) -> Result<Vec<DeviceSpec>, Report<PartitionError>>;

    fn set_device_health(&self, name: &str, health: DeviceHealth, topology: Option<Topology>);
}
