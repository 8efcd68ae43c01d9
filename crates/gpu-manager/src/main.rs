use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use clap::Parser;
use error_stack::Report;
use gpu_manager::config::PluginArgs;
use gpu_manager::health::xid::XidMonitor;
use gpu_manager::manager;
use gpu_manager::manager::GpuManager;
use gpu_manager::nvml;
use gpu_manager::nvml::NvmlDeviceInfo;
use gpu_manager::plugin::Supervisor;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

fn report<C>(report: Report<C>) -> anyhow::Error {
    anyhow!("{report:?}")
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let args = PluginArgs::parse();
    let _guard = logging::init(std::env::var_os(logging::LOG_PATH_ENV_VAR));

    tracing::info!("Starting GPU device plugin {}", &**version::VERSION);

    let gpu_config = args.gpu_config().map_err(report)?;
    tracing::info!("Using GPU config: {gpu_config:?}");

    // the driver may still be installing
    let check_interval = Duration::from_secs(args.device_paths_check_interval_secs);
    while let Err(e) = manager::check_device_paths(&args.dev_directory) {
        tracing::warn!("NVIDIA devices not ready, retrying in {check_interval:?}: {e:?}");
        tokio::time::sleep(check_interval).await;
    }

    let nvml = Arc::new(nvml::init_nvml().map_err(report)?);
    let mut gpu_manager = GpuManager::new(
        args.manager_config(gpu_config),
        Arc::new(NvmlDeviceInfo::new(nvml.clone())),
        None,
    )
    .map_err(report)?;
    gpu_manager.start().await.map_err(report)?;
    let gpu_manager = Arc::new(gpu_manager);

    let monitor_token = CancellationToken::new();
    if gpu_manager.health_critical_xid().is_empty() {
        tracing::info!("No health critical XIDs configured, XID monitoring disabled");
    } else {
        let monitor = XidMonitor::new(nvml, gpu_manager.clone()).spawn(monitor_token.clone());
        tokio::spawn(async move {
            match monitor.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("XID monitor failed: {e:?}"),
                Err(e) => tracing::error!("XID monitor task failed: {e}"),
            }
        });
    }

    let mut supervisor = Supervisor::new(args.supervisor_config(), gpu_manager)
        .spawn()
        .map_err(report)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let result = tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
            Ok(())
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
            Ok(())
        }
        result = supervisor.finished() => result,
    };

    monitor_token.cancel();
    let stopped = supervisor.stop().await;
    result.and(stopped).map_err(report)
}
