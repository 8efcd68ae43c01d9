use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use deviceplugin_api::v1beta1 as api;
use deviceplugin_api::DevicePluginClient;
use deviceplugin_api::RegistrationClient;
use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tower::service_fn;
use tracing::debug;
use tracing::info;

use super::service::plugin_options;
use super::PluginError;

/// Opens a gRPC channel over the unix socket at `socket_path`.
pub async fn create_uds_channel(socket_path: &Path) -> Result<Channel, Report<PluginError>> {
    let path = socket_path.to_path_buf();

    // The URL is a placeholder, the connector always dials the socket
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { UnixStream::connect(path).await.map(TokioIo::new) }
        }))
        .await
        .change_context_lazy(|| PluginError::Connect {
            path: socket_path.to_path_buf(),
        })
}

/// Announces `endpoint` (a file name in the device plugin directory) to the
/// kubelet listening on `kubelet_socket`.
#[tracing::instrument]
pub async fn register_with_kubelet(
    kubelet_socket: &Path,
    endpoint: &str,
    resource_name: &str,
) -> Result<(), Report<PluginError>> {
    let error = || PluginError::Registration {
        path: kubelet_socket.to_path_buf(),
    };

    let channel = create_uds_channel(kubelet_socket)
        .await
        .change_context_lazy(error)?;
    let mut client = RegistrationClient::new(channel);

    let request = api::RegisterRequest {
        version: deviceplugin_api::VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(plugin_options()),
    };
    client
        .register(Request::new(request))
        .await
        .map_err(|status| Report::new(error()).attach_printable(status.to_string()))?;

    info!("registered {resource_name} device plugin with kubelet");
    Ok(())
}

/// Waits until the device plugin served at `endpoint_path` answers
/// GetDevicePluginOptions, retrying every `interval`.
pub async fn wait_for_server_ready(endpoint_path: PathBuf, interval: Duration) {
    loop {
        match probe(&endpoint_path).await {
            Ok(()) => {
                info!("device plugin server is serving at {}", endpoint_path.display());
                return;
            }
            Err(e) => debug!("device plugin server not ready yet: {e:?}"),
        }
        tokio::time::sleep(interval).await;
    }
}

async fn probe(endpoint_path: &Path) -> Result<(), Report<PluginError>> {
    let channel = create_uds_channel(endpoint_path).await?;
    DevicePluginClient::new(channel)
        .get_device_plugin_options(Request::new(api::Empty {}))
        .await
        .map_err(|status| {
            Report::new(PluginError::Connect {
                path: endpoint_path.to_path_buf(),
            })
            .attach_printable(status.to_string())
        })?;
    Ok(())
}
