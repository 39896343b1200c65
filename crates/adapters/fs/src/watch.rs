//! Bridge from `notify` callbacks to a tokio channel.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::FsError;

/// Watch `dir` and forward every created, modified or removed path.
///
/// The watcher stops when the returned handle is dropped.
pub(crate) fn watch(
    dir: &Path,
    mode: RecursiveMode,
) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<PathBuf>), FsError> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                for path in event.paths {
                    let _ = sender.send(path);
                }
            }
        }
        Err(err) => tracing::warn!(%err, "filesystem watch error"),
    })
    .map_err(FsError::Watch)?;
    watcher.watch(dir, mode).map_err(FsError::Watch)?;
    tracing::info!(dir = %dir.display(), "watching directory");
    Ok((watcher, receiver))
}
