//! NVIDIA GPU device plugin for the kubelet.
//!
//! Discovers the node's GPUs through NVML, advertises them (or time-shared,
//! MPS or partitioned views of them) over the device plugin API and keeps
//! the kubelet registration alive across plugin socket removals, kubelet
//! restarts and hot-added GPUs.

pub mod config;
pub mod device;
pub mod health;
pub mod manager;
pub mod nvml;
pub mod plugin;
