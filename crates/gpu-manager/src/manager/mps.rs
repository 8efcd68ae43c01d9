//! NVIDIA MPS support: the control daemon preflight and per-container limits.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::ManagerError;

pub const MPS_THREAD_LIMIT_ENV: &str = "CUDA_MPS_ACTIVE_THREAD_PERCENTAGE";
pub const MPS_MEM_LIMIT_ENV: &str = "CUDA_MPS_PINNED_DEVICE_MEM_LIMIT";

const MPS_ACTIVE_THREAD_CMD: &str = "get_default_active_thread_percentage";

/// Limits for a container asking for `num_devices_requested` of the
/// `max_shared_clients` virtual devices of one GPU.
///
/// The memory limit is keyed by device `0` because an MPS client only ever
/// sees the GPU it landed on, at local index 0. Multiply before dividing in
/// both formulas, otherwise the integer results drift.
pub fn mps_envs(
    num_devices_requested: u64,
    max_shared_clients: u32,
    total_mem_per_gpu: u64,
) -> HashMap<String, String> {
    let max_shared_clients = u64::from(max_shared_clients);
    if max_shared_clients == 0 {
        return HashMap::new();
    }

    let active_thread_limit = num_devices_requested * 100 / max_shared_clients;
    let memory_limit_bytes = num_devices_requested * total_mem_per_gpu / max_shared_clients;

    HashMap::from([
        (
            MPS_THREAD_LIMIT_ENV.to_string(),
            active_thread_limit.to_string(),
        ),
        (
            MPS_MEM_LIMIT_ENV.to_string(),
            format!("0={}M", memory_limit_bytes / (1024 * 1024)),
        ),
    ])
}

/// Checks that the MPS control daemon answers on this node.
///
/// Runs the control binary, writes a query to its stdin and waits for it to
/// exit. Returns the daemon's answer (the default active thread percentage).
pub async fn check_mps_daemon(control_bin: &Path) -> Result<String, Report<ManagerError>> {
    let mut child = Command::new(control_bin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .change_context(ManagerError::MpsUnavailable)
        .attach_printable_lazy(|| {
            format!(
                "failed to start NVIDIA MPS health check command {}",
                control_bin.display()
            )
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(MPS_ACTIVE_THREAD_CMD.as_bytes())
            .await
            .change_context(ManagerError::MpsUnavailable)?;
        // dropping stdin closes the pipe so the control binary sees EOF
    }

    let output = child
        .wait_with_output()
        .await
        .change_context(ManagerError::MpsUnavailable)?;
    if !output.status.success() {
        return Err(Report::new(ManagerError::MpsUnavailable)
            .attach_printable(format!("failed to health check NVIDIA MPS: {}", output.status)));
    }

    let answer = String::from_utf8_lossy(&output.stdout).trim().to_string();
    tracing::info!("MPS is healthy, active thread percentage = {answer}");
    Ok(answer)
}
