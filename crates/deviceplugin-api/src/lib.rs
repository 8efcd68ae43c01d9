//! Kubelet device plugin API (v1beta1)
//!
//! Generated gRPC bindings for the two services of the device plugin protocol:
//! - `Registration`, served by the kubelet, called once by a plugin to announce itself
//! - `DevicePlugin`, served by the plugin on its own unix socket
#![allow(clippy::doc_markdown)]

pub mod v1beta1 {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

/// API version sent in every registration request.
pub const VERSION: &str = "v1beta1";

/// Health value of a device that can be allocated.
pub const HEALTHY: &str = "Healthy";

/// Health value of a device that must not be allocated.
pub const UNHEALTHY: &str = "Unhealthy";

pub use v1beta1::device_plugin_client::DevicePluginClient;
pub use v1beta1::device_plugin_server::{DevicePlugin, DevicePluginServer};
pub use v1beta1::registration_client::RegistrationClient;
pub use v1beta1::registration_server::{Registration, RegistrationServer};
