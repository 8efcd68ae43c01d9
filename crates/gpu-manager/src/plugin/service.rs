use std::pin::Pin;
use std::sync::Arc;

use deviceplugin_api::v1beta1 as api;
use deviceplugin_api::DevicePlugin;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::device;
use crate::device::DeviceSpec;
use crate::manager::GpuManager;

const LIST_AND_WATCH_BUFFER: usize = 4;

/// Options advertised on registration and by GetDevicePluginOptions.
pub fn plugin_options() -> api::DevicePluginOptions {
    api::DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: false,
    }
}

/// DevicePlugin service of one serving cycle. Cancelling the cycle token ends
/// every open ListAndWatch stream.
pub struct DevicePluginService {
    manager: Arc<GpuManager>,
    cancellation_token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(manager: Arc<GpuManager>, cancellation_token: CancellationToken) -> Self {
        Self {
            manager,
            cancellation_token,
        }
    }

    fn device_list(manager: &GpuManager) -> api::ListAndWatchResponse {
        api::ListAndWatchResponse {
            devices: device::to_api_devices(&manager.list_devices()),
        }
    }

    fn container_response(
        &self,
        request: &api::ContainerAllocateRequest,
    ) -> Result<api::ContainerAllocateResponse, Status> {
        let mut devices = Vec::new();
        for id in &request.devices_ids {
            let specs = self.manager.device_spec(id).map_err(|e| {
                error!("rejecting allocation: {e:?}");
                Status::invalid_argument(e.current_context().to_string())
            })?;
            devices.extend(specs.into_iter().map(api::DeviceSpec::from));
        }
        devices.extend(
            self.manager
                .default_devices()
                .iter()
                .map(|path| DeviceSpec::read_write_mknod(path.clone()).into()),
        );

        Ok(api::ContainerAllocateResponse {
            envs: self.manager.envs(request.devices_ids.len()),
            mounts: self
                .manager
                .mount_paths()
                .iter()
                .map(api::Mount::from)
                .collect(),
            devices,
            annotations: Default::default(),
            cdi_devices: Vec::new(),
        })
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<api::Empty>,
    ) -> TonicResult<Response<api::DevicePluginOptions>> {
        Ok(Response::new(plugin_options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<api::ListAndWatchResponse, Status>> + Send>>;

    /// Sends the device list on open and again after every health change.
    async fn list_and_watch(
        &self,
        _request: Request<api::Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("ListAndWatch stream opened");

        let (tx, rx) = mpsc::channel(LIST_AND_WATCH_BUFFER);
        let manager = self.manager.clone();
        let cancellation_token = self.cancellation_token.clone();
        // subscribe before the first send so no change falls in between
        let mut health = manager.subscribe_health();

        tokio::spawn(async move {
            if tx.send(Ok(Self::device_list(&manager))).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = tx.closed() => break,
                    event = health.recv() => match event {
                        Ok(event) => debug!("device {} is {}, resending device list", event.device_id, event.health),
                        Err(RecvError::Lagged(missed)) => {
                            warn!("missed {missed} health updates, resending full device list");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
                if tx.send(Ok(Self::device_list(&manager))).await.is_err() {
                    break;
                }
            }
            info!("ListAndWatch stream closed");
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<api::PreferredAllocationRequest>,
    ) -> TonicResult<Response<api::PreferredAllocationResponse>> {
        debug!("getting preferred allocation: {:?}", request.into_inner());
        Ok(Response::new(api::PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    async fn allocate(
        &self,
        request: Request<api::AllocateRequest>,
    ) -> TonicResult<Response<api::AllocateResponse>> {
        let request = request.into_inner();
        let container_responses = request
            .container_requests
            .iter()
            .map(|container| {
                info!("allocating devices {:?}", container.devices_ids);
                self.container_response(container)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Response::new(api::AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<api::PreStartContainerRequest>,
    ) -> TonicResult<Response<api::PreStartContainerResponse>> {
        Ok(Response::new(api::PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;
    use test_log::test;
    use tokio_stream::StreamExt;
    use tonic::Code;

    use super::*;
    use crate::config::GpuConfig;
    use crate::config::GpuSharingConfig;
    use crate::config::SharingStrategy;
    use crate::device::DeviceHealth;
    use crate::device::Mount;
    use crate::manager::mps;
    use crate::manager::ManagerConfig;
    use crate::nvml::mock::MockDeviceInfo;

    async fn service(gpus: u32, gpu_config: GpuConfig) -> (TempDir, Arc<GpuManager>, DevicePluginService, CancellationToken) {
        let dev = TempDir::new().expect("should create temp dir");
        for name in ["nvidiactl", "nvidia-uvm"] {
            std::fs::write(dev.path().join(name), "").expect("should create control device");
        }
        let config = ManagerConfig {
            dev_directory: dev.path().to_path_buf(),
            pci_devices_root: dev.path().join("pci"),
            mount_paths: vec![Mount {
                host_path: PathBuf::from("/home/kubernetes/bin/nvidia"),
                container_path: PathBuf::from("/usr/local/nvidia"),
                read_only: true,
            }],
            mps_control_bin: PathBuf::from("cat"),
            mps_pipe_directory: PathBuf::from("/tmp/nvidia-mps"),
            gpu_config,
        };
        let mut manager = GpuManager::new(config, Arc::new(MockDeviceInfo::with_count(gpus)), None)
            .expect("should create manager");
        manager.start().await.expect("manager should start");
        let manager = Arc::new(manager);
        let token = CancellationToken::new();
        let service = DevicePluginService::new(manager.clone(), token.clone());
        (dev, manager, service, token)
    }

    fn allocate_request(ids: &[&str]) -> Request<api::AllocateRequest> {
        Request::new(api::AllocateRequest {
            container_requests: vec![api::ContainerAllocateRequest {
                devices_ids: ids.iter().map(|id| id.to_string()).collect(),
            }],
        })
    }

    #[test(tokio::test)]
    async fn allocate_returns_device_defaults_and_mounts() {
        let (dev, _manager, service, _token) = service(2, GpuConfig::default()).await;

        let response = service
            .allocate(allocate_request(&["nvidia1"]))
            .await
            .expect("allocation should succeed")
            .into_inner();

        assert_eq!(response.container_responses.len(), 1);
        let container = &response.container_responses[0];
        let host_paths: Vec<_> = container.devices.iter().map(|d| d.host_path.clone()).collect();
        let path = |name: &str| dev.path().join(name).to_string_lossy().into_owned();
        assert_eq!(
            host_paths,
            vec![path("nvidia1"), path("nvidiactl"), path("nvidia-uvm")]
        );
        assert!(container.devices.iter().all(|d| d.permissions == "mrw"));
        assert_eq!(
            container.mounts,
            vec![api::Mount {
                container_path: "/usr/local/nvidia".to_string(),
                host_path: "/home/kubernetes/bin/nvidia".to_string(),
                read_only: true,
            }]
        );
        assert!(container.envs.is_empty());
    }

    #[test(tokio::test)]
    async fn allocate_rejects_unknown_device() {
        let (_dev, _manager, service, _token) = service(1, GpuConfig::default()).await;

        let status = service
            .allocate(allocate_request(&["nvidia0", "nvidia7"]))
            .await
            .expect_err("unknown device should be rejected");
        assert_eq!(status.code(), Code::InvalidArgument);

        // the service keeps working after a rejection
        service
            .allocate(allocate_request(&["nvidia0"]))
            .await
            .expect("valid allocation should succeed");
    }

    #[test(tokio::test)]
    async fn allocate_under_mps_sets_limits() {
        let gpu_config = GpuConfig {
            gpu_sharing_config: GpuSharingConfig {
                gpu_sharing_strategy: Some(SharingStrategy::Mps),
                max_shared_clients_per_gpu: 10,
            },
            ..Default::default()
        };
        let (_dev, _manager, service, _token) = service(1, gpu_config).await;

        let response = service
            .allocate(allocate_request(&["nvidia0/vgpu0", "nvidia0/vgpu1"]))
            .await
            .expect("allocation should succeed")
            .into_inner();

        let container = &response.container_responses[0];
        assert_eq!(container.envs[mps::MPS_THREAD_LIMIT_ENV], "20");
        assert_eq!(container.envs[mps::MPS_MEM_LIMIT_ENV], "0=16384M");
        assert!(container
            .mounts
            .iter()
            .any(|m| m.host_path == "/tmp/nvidia-mps" && !m.read_only));
    }

    #[test(tokio::test)]
    async fn list_and_watch_resends_after_health_change() {
        let (_dev, manager, service, token) = service(2, GpuConfig::default()).await;

        let mut stream = service
            .list_and_watch(Request::new(api::Empty {}))
            .await
            .expect("stream should open")
            .into_inner();

        let initial = stream
            .next()
            .await
            .expect("initial list")
            .expect("initial list should be ok");
        assert_eq!(initial.devices.len(), 2);
        assert!(initial.devices.iter().all(|d| d.health == deviceplugin_api::HEALTHY));

        manager.set_device_health("nvidia1", DeviceHealth::Unhealthy, None);

        let updated = stream
            .next()
            .await
            .expect("updated list")
            .expect("updated list should be ok");
        assert_eq!(updated.devices[0].id, "nvidia0");
        assert_eq!(updated.devices[0].health, deviceplugin_api::HEALTHY);
        assert_eq!(updated.devices[1].id, "nvidia1");
        assert_eq!(updated.devices[1].health, deviceplugin_api::UNHEALTHY);

        token.cancel();
        assert!(stream.next().await.is_none());
    }

    #[test(tokio::test)]
    async fn list_and_watch_ends_when_health_reporting_closes() {
        let (_dev, manager, service, _token) = service(1, GpuConfig::default()).await;

        let mut stream = service
            .list_and_watch(Request::new(api::Empty {}))
            .await
            .expect("stream should open")
            .into_inner();
        stream.next().await.expect("initial list").expect("ok");

        manager.close_health();
        assert!(stream.next().await.is_none());
    }

    #[test(tokio::test)]
    async fn options_and_no_op_calls() {
        let (_dev, _manager, service, _token) = service(1, GpuConfig::default()).await;

        let options = service
            .get_device_plugin_options(Request::new(api::Empty {}))
            .await
            .expect("options")
            .into_inner();
        assert_eq!(options, plugin_options());

        let preferred = service
            .get_preferred_allocation(Request::new(api::PreferredAllocationRequest {
                container_requests: vec![],
            }))
            .await
            .expect("preferred allocation")
            .into_inner();
        assert!(preferred.container_responses.is_empty());

        service
            .pre_start_container(Request::new(api::PreStartContainerRequest {
                devices_ids: vec!["nvidia0".to_string()],
            }))
            .await
            .expect("pre-start should succeed");
    }
}
