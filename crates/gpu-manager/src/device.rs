//! Device model shared by the manager and the device plugin service.

use std::collections::HashMap;
use std::path::PathBuf;

use deviceplugin_api::v1beta1 as api;

/// Health of a physical, partition or virtual device as reported to the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub enum DeviceHealth {
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
    #[display("Unknown")]
    Unknown,
}

/// NUMA placement of a device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Topology {
    pub numa_nodes: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// e.g. `nvidia0`, `nvidia0/vgpu3` or a partition name
    pub id: String,
    pub health: DeviceHealth,
    pub topology: Option<Topology>,
}

impl Device {
    pub fn new(id: impl Into<String>, health: DeviceHealth, topology: Option<Topology>) -> Self {
        Self {
            id: id.into(),
            health,
            topology,
        }
    }
}

/// Device node passed into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    /// cgroup permissions, a combination of `m`, `r` and `w`
    pub permissions: String,
}

impl DeviceSpec {
    /// Read, write and mknod access to the same path on host and container.
    pub fn read_write_mknod(path: PathBuf) -> Self {
        Self {
            host_path: path.clone(),
            container_path: path,
            permissions: "mrw".to_string(),
        }
    }
}

/// Host directory mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: PathBuf,
    pub read_only: bool,
}

impl From<&Device> for api::Device {
    fn from(device: &Device) -> Self {
        api::Device {
            id: device.id.clone(),
            health: device.health.to_string(),
            topology: device.topology.as_ref().map(|t| api::TopologyInfo {
                nodes: t
                    .numa_nodes
                    .iter()
                    .map(|id| api::NumaNode { id: *id })
                    .collect(),
            }),
        }
    }
}

impl From<DeviceSpec> for api::DeviceSpec {
    fn from(spec: DeviceSpec) -> Self {
        api::DeviceSpec {
            container_path: spec.container_path.to_string_lossy().into_owned(),
            host_path: spec.host_path.to_string_lossy().into_owned(),
            permissions: spec.permissions,
        }
    }
}

impl From<&Mount> for api::Mount {
    fn from(mount: &Mount) -> Self {
        api::Mount {
            container_path: mount.container_path.to_string_lossy().into_owned(),
            host_path: mount.host_path.to_string_lossy().into_owned(),
            read_only: mount.read_only,
        }
    }
}

/// Converts a device map into the wire list, ordered by id so that repeated
/// ListAndWatch responses are stable.
pub fn to_api_devices(devices: &HashMap<String, Device>) -> Vec<api::Device> {
    let mut list: Vec<api::Device> = devices.values().map(api::Device::from).collect();
    list.sort_by(|a, b| a.id.cmp(&b.id));
    list
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn health_strings_match_kubelet_constants() {
        assert_eq!(
            DeviceHealth::Healthy.to_string(),
            deviceplugin_api::HEALTHY
        );
        assert_eq!(
            DeviceHealth::Unhealthy.to_string(),
            deviceplugin_api::UNHEALTHY
        );
    }

    #[test]
    fn api_devices_are_sorted_and_carry_topology() {
        let mut devices = HashMap::new();
        devices.insert(
            "nvidia1".to_string(),
            Device::new("nvidia1", DeviceHealth::Unhealthy, None),
        );
        devices.insert(
            "nvidia0".to_string(),
            Device::new(
                "nvidia0",
                DeviceHealth::Healthy,
                Some(Topology {
                    numa_nodes: vec![1],
                }),
            ),
        );

        let list = to_api_devices(&devices);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, "nvidia0");
        assert_eq!(list[0].health, "Healthy");
        assert_eq!(
            list[0].topology,
            Some(api::TopologyInfo {
                nodes: vec![api::NumaNode { id: 1 }]
            })
        );
        assert_eq!(list[1].id, "nvidia1");
        assert_eq!(list[1].health, "Unhealthy");
        assert_eq!(list[1].topology, None);
    }
}
