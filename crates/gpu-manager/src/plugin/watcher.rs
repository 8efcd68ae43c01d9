use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::PluginError;

/// Buffered filesystem events between the notify thread and the supervisor.
pub const WATCH_EVENT_BUFFER: usize = 64;

/// Watches `directory` (non-recursively) and forwards events to `tx`. Events
/// are dropped with a warning when the receiver falls behind. The watch lasts
/// as long as the returned watcher lives.
pub fn watch_directory(
    directory: &Path,
    tx: mpsc::Sender<notify::Result<Event>>,
) -> Result<RecommendedWatcher, Report<PluginError>> {
    let error = || PluginError::Watch {
        path: directory.to_path_buf(),
    };

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match tx.try_send(res) {
            Ok(()) => {}
            Err(TrySendError::Full(res)) => {
                tracing::warn!("filesystem event queue full, dropping {res:?}")
            }
            Err(TrySendError::Closed(_)) => {}
        },
        Config::default(),
    )
    .change_context_lazy(error)?;

    watcher
        .watch(directory, RecursiveMode::NonRecursive)
        .change_context_lazy(error)?;
    tracing::info!("watching {} for kubelet restarts", directory.display());
    Ok(watcher)
}

/// Whether `event` is the (re)creation of the kubelet registration socket.
pub fn is_socket_created(event: &Event, socket_path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name().is_some() && path.file_name() == socket_path.file_name())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use notify::event::CreateKind;
    use notify::event::RemoveKind;
    use tempfile::TempDir;
    use test_log::test;

    use super::*;

    #[test]
    fn only_kubelet_socket_creation_matches() {
        let kubelet = Path::new("/device-plugin/kubelet.sock");
        let create = |path: &str| {
            Event::new(EventKind::Create(CreateKind::Any)).add_path(PathBuf::from(path))
        };

        assert!(is_socket_created(&create("/device-plugin/kubelet.sock"), kubelet));
        assert!(!is_socket_created(&create("/device-plugin/nvidiaGPU.sock"), kubelet));
        assert!(!is_socket_created(
            &Event::new(EventKind::Remove(RemoveKind::Any))
                .add_path(PathBuf::from("/device-plugin/kubelet.sock")),
            kubelet
        ));
    }

    #[test(tokio::test)]
    async fn forwards_create_events() {
        let dir = TempDir::new().expect("should create temp dir");
        let (tx, mut rx) = mpsc::channel(WATCH_EVENT_BUFFER);
        let _watcher = watch_directory(dir.path(), tx).expect("should watch");

        let socket = dir.path().join("kubelet.sock");
        std::fs::write(&socket, "").expect("should create file");

        let matched = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = rx.recv().await {
                if event.is_ok_and(|event| is_socket_created(&event, &socket)) {
                    return true;
                }
            }
            false
        })
        .await
        .expect("should see the create event in time");
        assert!(matched);
    }
}
