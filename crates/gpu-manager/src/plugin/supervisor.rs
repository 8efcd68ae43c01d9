//! Device plugin server lifecycle.
//!
//! One serving cycle binds the plugin endpoint, serves the DevicePlugin
//! service, registers with the kubelet and then waits for the first drain
//! trigger. Draining stops that cycle's server and the loop starts over with
//! a fresh socket. Only registration and rediscovery failures end the loop
//! with an error.

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use deviceplugin_api::DevicePluginServer;
use error_stack::Report;
use error_stack::ResultExt;
use notify::Event;
use notify::RecommendedWatcher;
use tokio::net::UnixListener;
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::registration;
use super::service::DevicePluginService;
use super::watcher;
use super::PluginError;
use crate::manager::GpuManager;

const STATE_QUEUE_CAPACITY: usize = 16;

/// Why a serving cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DrainReason {
    #[display("plugin endpoint removed")]
    EndpointRemoved,
    #[display("new GPUs detected")]
    NewDevicesDetected,
    #[display("kubelet restarted")]
    NodeAgentRestarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SupervisorState {
    Initializing,
    Listening,
    Registering,
    Serving,
    #[display("Draining({_0})")]
    Draining(DrainReason),
    Stopped,
}

/// Retries of GPU rediscovery after new devices were detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 0 retries forever
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Directory shared with the kubelet, e.g. `/var/lib/kubelet/device-plugins`
    pub plugin_directory: PathBuf,
    /// File name of the kubelet registration socket
    pub kubelet_endpoint: String,
    /// File name of our own socket
    pub plugin_endpoint: String,
    pub resource_name: String,
    pub endpoint_check_interval: Duration,
    pub device_check_interval: Duration,
    pub readiness_poll_interval: Duration,
    pub rediscovery: RetryPolicy,
}

impl SupervisorConfig {
    pub fn endpoint_path(&self) -> PathBuf {
        self.plugin_directory.join(&self.plugin_endpoint)
    }

    pub fn kubelet_socket_path(&self) -> PathBuf {
        self.plugin_directory.join(&self.kubelet_endpoint)
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    manager: Arc<GpuManager>,
    state_tx: broadcast::Sender<SupervisorState>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, manager: Arc<GpuManager>) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_QUEUE_CAPACITY);
        Self {
            config,
            manager,
            state_tx,
        }
    }

    /// Follows state transitions from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SupervisorState) {
        debug!("device plugin supervisor is {state}");
        // nobody listening is fine
        let _ = self.state_tx.send(state);
    }

    /// Watches the plugin directory and runs the loop on its own task.
    pub fn spawn(self) -> Result<SupervisorHandle, Report<PluginError>> {
        let (tx, rx) = mpsc::channel(watcher::WATCH_EVENT_BUFFER);
        let fs_watcher = watcher::watch_directory(&self.config.plugin_directory, tx)?;
        let mut handle = self.spawn_with_events(rx);
        handle._watcher = Some(fs_watcher);
        Ok(handle)
    }

    /// Runs the loop on its own task with filesystem events from `events`.
    pub fn spawn_with_events(
        self,
        events: mpsc::Receiver<notify::Result<Event>>,
    ) -> SupervisorHandle {
        let stop = CancellationToken::new();
        let endpoint_path = self.config.endpoint_path();
        let manager = self.manager.clone();
        let task = {
            let stop = stop.clone();
            tokio::spawn(async move { self.run(events, stop).await })
        };
        SupervisorHandle {
            stop,
            task: Some(task),
            endpoint_path,
            manager,
            _watcher: None,
        }
    }

    /// Serves cycles until `stop` is cancelled.
    #[tracing::instrument(skip_all, fields(endpoint = %self.config.plugin_endpoint))]
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<notify::Result<Event>>,
        stop: CancellationToken,
    ) -> Result<(), Report<PluginError>> {
        let endpoint = self.config.endpoint_path();
        let kubelet_socket = self.config.kubelet_socket_path();
        let register = kubelet_socket.exists();
        if register {
            info!("found {}, will register with kubelet", kubelet_socket.display());
        } else {
            info!("no kubelet socket at {}, serving without registration", kubelet_socket.display());
        }

        while !stop.is_cancelled() {
            self.set_state(SupervisorState::Initializing);
            let cycle = stop.child_token();

            remove_socket(&endpoint)?;
            let listener = UnixListener::bind(&endpoint).change_context_lazy(|| {
                PluginError::Listen {
                    path: endpoint.clone(),
                }
            })?;
            info!("starting device plugin server at {}", endpoint.display());
            self.set_state(SupervisorState::Listening);
            let server = self.serve(listener, cycle.clone());

            if register {
                self.set_state(SupervisorState::Registering);
                let ready = select! {
                    _ = stop.cancelled() => false,
                    _ = registration::wait_for_server_ready(
                        endpoint.clone(),
                        self.config.readiness_poll_interval,
                    ) => true,
                };
                if !ready {
                    shutdown_server(cycle, server, &endpoint).await;
                    break;
                }
                if let Err(e) = registration::register_with_kubelet(
                    &kubelet_socket,
                    &self.config.plugin_endpoint,
                    &self.config.resource_name,
                )
                .await
                {
                    shutdown_server(cycle, server, &endpoint).await;
                    self.set_state(SupervisorState::Stopped);
                    return Err(e);
                }
            }

            self.set_state(SupervisorState::Serving);
            let reason = self
                .wait_for_drain(&endpoint, &kubelet_socket, &mut events, &stop)
                .await;
            if let Some(reason) = reason {
                info!("stopping device plugin server: {reason}");
                self.set_state(SupervisorState::Draining(reason));
            }
            shutdown_server(cycle, server, &endpoint).await;

            match reason {
                None => break,
                Some(DrainReason::NewDevicesDetected) => {
                    if let Err(e) = self.rediscover(&stop).await {
                        self.set_state(SupervisorState::Stopped);
                        return Err(e);
                    }
                }
                Some(_) => {}
            }
        }

        info!("device plugin supervisor stopped");
        self.set_state(SupervisorState::Stopped);
        Ok(())
    }

    fn serve(
        &self,
        listener: UnixListener,
        cycle: CancellationToken,
    ) -> JoinHandle<Result<(), tonic::transport::Error>> {
        let service = DevicePluginService::new(self.manager.clone(), cycle.clone());
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    cycle.cancelled().await;
                    info!("shutting down gRPC server");
                })
                .await
        })
    }

    /// Returns the first drain trigger, or `None` when stopped.
    async fn wait_for_drain(
        &self,
        endpoint: &Path,
        kubelet_socket: &Path,
        events: &mut mpsc::Receiver<notify::Result<Event>>,
        stop: &CancellationToken,
    ) -> Option<DrainReason> {
        let mut endpoint_check = interval(self.config.endpoint_check_interval);
        endpoint_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut device_check = interval(self.config.device_check_interval);
        device_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut events_open = true;

        loop {
            select! {
                _ = stop.cancelled() => return None,
                _ = endpoint_check.tick() => {
                    if let Err(e) = std::fs::symlink_metadata(endpoint) {
                        info!("{}: {e}", endpoint.display());
                        return Some(DrainReason::EndpointRemoved);
                    }
                }
                _ = device_check.tick() => {
                    if self.manager.has_additional_gpus_installed() {
                        return Some(DrainReason::NewDevicesDetected);
                    }
                }
                event = events.recv(), if events_open => match event {
                    Some(Ok(event)) => {
                        if watcher::is_socket_created(&event, kubelet_socket) {
                            info!("{} recreated", kubelet_socket.display());
                            return Some(DrainReason::NodeAgentRestarted);
                        }
                    }
                    Some(Err(e)) => error!("inotify: {e}"),
                    None => {
                        warn!("filesystem events closed, kubelet restarts will go unnoticed");
                        events_open = false;
                    }
                },
            }
        }
    }

    /// Rebuilds the registry after new GPUs showed up, backing off between
    /// failed attempts. Returns early when stopped.
    async fn rediscover(&self, stop: &CancellationToken) -> Result<(), Report<PluginError>> {
        let policy = &self.config.rediscovery;
        let mut backoff = policy.initial_backoff;
        let mut attempts = 0;

        loop {
            attempts += 1;
            let Err(e) = self.manager.discover_gpus() else {
                return Ok(());
            };
            if policy.exhausted(attempts) {
                return Err(e.change_context(PluginError::Rediscovery { attempts }));
            }
            warn!("GPU rediscovery attempt {attempts} failed, retrying in {backoff:?}: {e:?}");

            select! {
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = policy.next_backoff(backoff);
        }
    }
}

/// Ends the cycle and removes its socket once the server has stopped.
async fn shutdown_server(
    cycle: CancellationToken,
    server: JoinHandle<Result<(), tonic::transport::Error>>,
    endpoint: &Path,
) {
    cycle.cancel();
    match server.await {
        Ok(Ok(())) => debug!("device plugin server stopped"),
        Ok(Err(e)) => error!("device plugin server stopped serving: {e}"),
        Err(e) => error!("device plugin server task failed: {e}"),
    }
    if let Err(e) = remove_socket(endpoint) {
        warn!("{e:?}");
    }
}

fn remove_socket(path: &Path) -> Result<(), Report<PluginError>> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Report::new(e).change_context(PluginError::Cleanup {
            path: path.to_path_buf(),
        })),
    }
}

/// A running supervisor.
pub struct SupervisorHandle {
    stop: CancellationToken,
    task: Option<JoinHandle<Result<(), Report<PluginError>>>>,
    endpoint_path: PathBuf,
    manager: Arc<GpuManager>,
    _watcher: Option<RecommendedWatcher>,
}

impl SupervisorHandle {
    /// Waits for the loop to end on its own, which only happens on a fatal
    /// error. Pending forever once the loop has been joined.
    pub async fn finished(&mut self) -> Result<(), Report<PluginError>> {
        match self.task.as_mut() {
            Some(task) => {
                let result = join(task).await;
                self.task = None;
                result
            }
            None => std::future::pending().await,
        }
    }

    /// Stops the loop, waits for it, removes the endpoint file and closes
    /// health reporting.
    pub async fn stop(mut self) -> Result<(), Report<PluginError>> {
        info!("removing device plugin socket {}", self.endpoint_path.display());
        self.stop.cancel();
        let result = match self.task.take() {
            Some(task) => join(task).await,
            None => Ok(()),
        };
        let cleanup = remove_socket(&self.endpoint_path);
        self.manager.close_health();
        result.and(cleanup)
    }
}

async fn join(
    task: impl std::future::Future<
        Output = Result<Result<(), Report<PluginError>>, tokio::task::JoinError>,
    >,
) -> Result<(), Report<PluginError>> {
    task.await.map_err(|e| {
        Report::new(PluginError::Supervisor).attach_printable(e.to_string())
    })?
}
