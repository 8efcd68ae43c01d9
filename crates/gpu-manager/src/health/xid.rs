//! Critical XID monitor.
//!
//! Listens for NVML critical XID events and marks the affected GPU Unhealthy
//! when its XID is one of the configured health-critical codes.

use core::error::Error;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use nvml_wrapper::bitmasks::event::EventTypes;
use nvml_wrapper::enums::event::XidError;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::device::DeviceHealth;
use crate::manager::discovery::device_id;
use crate::manager::GpuManager;

/// How long one NVML wait blocks before the stop signal is checked again.
const EVENT_WAIT_TIMEOUT_MS: u32 = 5000;
const WAIT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, derive_more::Display)]
pub enum XidMonitorError {
    #[display("failed to create NVML event set")]
    EventSet,
    #[display("failed to enumerate GPUs for XID monitoring")]
    Devices,
    #[display("failed to register critical XID events for device with index {index}")]
    Register { index: u32 },
    #[display("XID monitor thread panicked")]
    Join,
}

impl Error for XidMonitorError {}

/// Whether an XID event payload names one of the `critical` codes.
///
/// An unknown XID or a missing payload is never critical.
pub fn is_critical_xid(xid: Option<&XidError>, critical: &[u32]) -> bool {
    match xid {
        Some(XidError::Value(xid)) => critical.iter().any(|code| u64::from(*code) == *xid),
        Some(XidError::Unknown) | None => false,
    }
}

pub struct XidMonitor {
    nvml: Arc<Nvml>,
    manager: Arc<GpuManager>,
    critical_xid: Vec<u32>,
}

impl XidMonitor {
    pub fn new(nvml: Arc<Nvml>, manager: Arc<GpuManager>) -> Self {
        let critical_xid = manager.health_critical_xid().to_vec();
        Self {
            nvml,
            manager,
            critical_xid,
        }
    }

    /// Runs the monitor on a blocking thread until `token` is cancelled.
    pub fn spawn(
        self,
        token: CancellationToken,
    ) -> JoinHandle<Result<(), Report<XidMonitorError>>> {
        tokio::task::spawn_blocking(move || self.run(&token))
    }

    fn run(&self, token: &CancellationToken) -> Result<(), Report<XidMonitorError>> {
        let mut set = self.nvml.create_event_set().map_err(|e| {
            Report::new(XidMonitorError::EventSet).attach_printable(e.to_string())
        })?;

        let count = self
            .nvml
            .device_count()
            .map_err(|e| Report::new(XidMonitorError::Devices).attach_printable(e.to_string()))?;
        for index in 0..count {
            let device = self.nvml.device_by_index(index).map_err(|e| {
                Report::new(XidMonitorError::Devices).attach_printable(e.to_string())
            })?;
            let supported = device
                .supported_event_types()
                .is_ok_and(|types| types.contains(EventTypes::CRITICAL_XID_ERROR));
            if !supported {
                tracing::warn!(
                    "device with index {index} does not support critical XID events, skipping health monitoring"
                );
                continue;
            }
            set = device
                .register_events(EventTypes::CRITICAL_XID_ERROR, set)
                .map_err(|e| {
                    Report::new(XidMonitorError::Register { index })
                        .attach_printable(format!("{e:?}"))
                })?;
        }

        tracing::info!(
            "monitoring {count} GPU(s) for critical XIDs {:?}",
            self.critical_xid
        );

        while !token.is_cancelled() {
            match set.wait(EVENT_WAIT_TIMEOUT_MS) {
                Ok(event) => {
                    if !event.event_type.contains(EventTypes::CRITICAL_XID_ERROR) {
                        continue;
                    }
                    if !is_critical_xid(event.event_data.as_ref(), &self.critical_xid) {
                        tracing::info!("ignoring non-critical XID {:?}", event.event_data);
                        continue;
                    }
                    match event.device.minor_number() {
                        Ok(minor) => {
                            let id = device_id(minor);
                            tracing::error!(
                                "critical XID {:?} on {id}, marking it unhealthy",
                                event.event_data
                            );
                            self.manager
                                .set_device_health(&id, DeviceHealth::Unhealthy, None);
                        }
                        Err(e) => {
                            tracing::error!("critical XID on a device without minor number: {e}")
                        }
                    }
                }
                Err(NvmlError::Timeout) => {}
                Err(e) => {
                    tracing::warn!("failed to wait for NVML events: {e}");
                    std::thread::sleep(WAIT_ERROR_BACKOFF);
                }
            }
        }

        tracing::info!("XID monitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_codes_match() {
        let critical = [48, 79];
        assert!(is_critical_xid(Some(&XidError::Value(48)), &critical));
        assert!(is_critical_xid(Some(&XidError::Value(79)), &critical));
    }

    #[test]
    fn other_codes_and_missing_payload_do_not_match() {
        let critical = [48];
        assert!(!is_critical_xid(Some(&XidError::Value(13)), &critical));
        assert!(!is_critical_xid(None, &critical));
        assert!(!is_critical_xid(Some(&XidError::Value(48)), &[]));
    }

    #[test]
    fn unknown_xid_is_not_critical() {
        // NVML reports XID 999 as Unknown.
        assert!(!is_critical_xid(Some(&XidError::Unknown), &[48, 999]));
    }
}
