//! Config directory watcher.
//!
//! Every `*.json` file in the config directory describes one item. The
//! watcher rescans the directory on a fixed interval and whenever the
//! filesystem reports a change, reconciles the result against the previous
//! scan and forwards the differences to the item registry.
//!
//! A file that stops parsing keeps contributing its last valid config, so a
//! half-written edit never deletes a live item.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::RecursiveMode;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use itemhub_app::item_registry::ItemRegistry;
use itemhub_app::reconcile::{ConfigChange, ConfigSet, reconcile};
use itemhub_domain::config::ItemConfig;

use crate::error::FsError;
use crate::watch::watch;

const CONFIG_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWatcherSettings {
    pub dir: PathBuf,
    pub scan_interval: Duration,
}

impl ConfigWatcherSettings {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            scan_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct ScanState {
    /// Last valid config of every file still present.
    files: BTreeMap<PathBuf, ItemConfig>,
    current: ConfigSet,
}

pub struct ConfigWatcher {
    settings: ConfigWatcherSettings,
    registry: Arc<ItemRegistry>,
    state: Mutex<ScanState>,
    configs: ArcSwap<ConfigSet>,
}

impl ConfigWatcher {
    #[must_use]
    pub fn new(settings: ConfigWatcherSettings, registry: Arc<ItemRegistry>) -> Self {
        Self {
            settings,
            registry,
            state: Mutex::new(ScanState::default()),
            configs: ArcSwap::from_pointee(ConfigSet::new()),
        }
    }

    /// The config store as of the last completed scan.
    #[must_use]
    pub fn configs(&self) -> Arc<ConfigSet> {
        self.configs.load_full()
    }

    /// Scan once, apply the differences and return them.
    ///
    /// # Errors
    ///
    /// Fails only when the directory itself cannot be listed; unreadable or
    /// invalid files are logged and skipped.
    #[tracing::instrument(skip(self), fields(dir = %self.settings.dir.display()))]
    pub async fn scan(&self) -> Result<Vec<ConfigChange>, FsError> {
        let paths = list_configs(&self.settings.dir).await?;
        let mut state = self.state.lock().await;

        state.files.retain(|path, _| paths.contains(path));
        for path in &paths {
            match read_config(path).await {
                Some(config) => {
                    state.files.insert(path.clone(), config);
                }
                None if state.files.contains_key(path) => {
                    tracing::warn!(path = %path.display(), "invalid config, keeping previous version");
                }
                None => {
                    tracing::debug!(path = %path.display(), "config ignored");
                }
            }
        }

        let next = collect(&state.files);
        let changes = reconcile(&state.current, &next);
        state.current = next.clone();
        self.configs.store(Arc::new(next));
        drop(state);

        if !changes.is_empty() {
            tracing::info!(changes = changes.len(), "config directory changed");
            self.registry.apply(changes.clone()).await;
        }
        Ok(changes)
    }

    /// Scan at startup, then on every interval tick and filesystem change,
    /// until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let (_watcher, mut changes) =
            match watch(&self.settings.dir, RecursiveMode::NonRecursive) {
                Ok((watcher, changes)) => (Some(watcher), Some(changes)),
                Err(err) => {
                    tracing::warn!(%err, "config watch unavailable, relying on periodic scans");
                    (None, None)
                }
            };

        let mut interval = tokio::time::interval(self.settings.scan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
                Some(path) = recv(&mut changes) => {
                    tracing::trace!(path = %path.display(), "config change detected");
                }
            }
            if let Err(err) = self.scan().await {
                tracing::warn!(%err, "config scan failed");
            }
        }
        tracing::debug!("config watcher stopped");
    }
}

async fn recv(
    receiver: &mut Option<tokio::sync::mpsc::UnboundedReceiver<PathBuf>>,
) -> Option<PathBuf> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn list_configs(dir: &Path) -> Result<Vec<PathBuf>, FsError> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(FsError::io(dir))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(FsError::io(dir))? {
        let path = entry.path();
        let is_config = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(CONFIG_EXTENSION));
        let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
        if is_config && is_file {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

async fn read_config(path: &Path) -> Option<ItemConfig> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!(%err, path = %path.display(), "failed to read config");
            return None;
        }
    };
    let document = match serde_json::from_str(&text) {
        Ok(document) => document,
        Err(err) => {
            tracing::warn!(%err, path = %path.display(), "failed to parse config");
            return None;
        }
    };
    ItemConfig::from_document(document)
}

/// Build the config set; on duplicate ids the first file in path order wins.
fn collect(files: &BTreeMap<PathBuf, ItemConfig>) -> ConfigSet {
    let mut set = ConfigSet::new();
    for (path, config) in files {
        if set.contains_key(&config.item_id) {
            tracing::warn!(
                path = %path.display(),
                item_id = %config.item_id,
                "duplicate item id, config ignored"
            );
            continue;
        }
        set.insert(config.item_id.clone(), config.clone());
    }
    set
}
