//! Plugin module loader.
//!
//! The modules directory holds one sub-directory per bundle. A bundle is
//! present while it contains at least one library file accepted by the
//! [`ModuleRuntime`]. Filesystem events are debounced per bundle; once a
//! bundle has settled its files are copied to a fresh staging directory,
//! loaded from there, and the locators they expose are registered.
//!
//! Unloading is best-effort. The loader only keeps weak references to the
//! module anchors; after unregistering a bundle's locators it polls those
//! references a bounded number of times. A module still referenced after
//! the last try is a zombie: its surviving locators are registered again,
//! and updates of the bundle are rejected until a later attempt reclaims it.
//! A module nothing else references is handed to
//! [`ModuleRuntime::release`] before its anchor goes away.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use notify::RecursiveMode;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use itemhub_app::item_registry::ItemRegistry;
use itemhub_app::ports::{HubContext, LoadedModule, Locator, ModuleRuntime};
use itemhub_domain::id::{ItemType, ModuleId};

use crate::error::FsError;
use crate::watch::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLoaderSettings {
    pub modules_dir: PathBuf,
    /// Where bundles are copied before loading. Must not live inside
    /// `modules_dir`.
    pub staging_dir: PathBuf,
    /// Quiet period after the last event before a bundle is processed.
    pub settle_delay: Duration,
    pub unload_tries: u32,
    /// Base wait between reclamation checks; try `n` waits `n` times this.
    pub unload_interval: Duration,
}

impl ModuleLoaderSettings {
    #[must_use]
    pub fn new(modules_dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            modules_dir: modules_dir.into(),
            staging_dir: staging_dir.into(),
            settle_delay: Duration::from_millis(5_000),
            unload_tries: 8,
            unload_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Resident,
    PendingUnload,
    Reclaimed,
    Zombie,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resident => f.write_str("resident"),
            Self::PendingUnload => f.write_str("pending_unload"),
            Self::Reclaimed => f.write_str("reclaimed"),
            Self::Zombie => f.write_str("zombie"),
        }
    }
}

/// Inventory line for one bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub bundle: String,
    pub load_id: ModuleId,
    pub status: ModuleStatus,
    pub item_types: Vec<ItemType>,
}

/// File name to (size, modification time), for every regular file.
type Fingerprint = BTreeMap<String, (u64, Option<SystemTime>)>;

type Anchor = Weak<dyn Any + Send + Sync>;

struct ModuleEntry {
    load_id: ModuleId,
    fingerprint: Fingerprint,
    item_types: Vec<ItemType>,
    anchors: Vec<Anchor>,
    staging: PathBuf,
    status: ModuleStatus,
}

impl ModuleEntry {
    fn info(&self, bundle: &str) -> ModuleInfo {
        ModuleInfo {
            bundle: bundle.to_string(),
            load_id: self.load_id,
            status: self.status,
            item_types: self.item_types.clone(),
        }
    }
}

fn is_reclaimed(anchors: &[Anchor]) -> bool {
    anchors.iter().all(|anchor| anchor.strong_count() == 0)
}

pub struct ModuleLoader {
    settings: ModuleLoaderSettings,
    runtime: Arc<dyn ModuleRuntime>,
    registry: Arc<ItemRegistry>,
    context: HubContext,
    table: Mutex<BTreeMap<String, ModuleEntry>>,
    inventory: std::sync::Mutex<Vec<ModuleInfo>>,
}

impl ModuleLoader {
    #[must_use]
    pub fn new(
        settings: ModuleLoaderSettings,
        runtime: Arc<dyn ModuleRuntime>,
        registry: Arc<ItemRegistry>,
        context: HubContext,
    ) -> Self {
        Self {
            settings,
            runtime,
            registry,
            context,
            table: Mutex::new(BTreeMap::new()),
            inventory: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Every bundle currently known, loaded or zombie.
    #[must_use]
    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.inventory
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Process every bundle on disk and every known bundle that vanished.
    ///
    /// # Errors
    ///
    /// Fails only when the modules directory cannot be listed. Individual
    /// bundle failures are logged.
    pub async fn scan(&self, cancel: &CancellationToken) -> Result<(), FsError> {
        let dir = &self.settings.modules_dir;
        let mut bundles: Vec<String> = self.table.lock().await.keys().cloned().collect();
        let mut entries = tokio::fs::read_dir(dir).await.map_err(FsError::io(dir))?;
        while let Some(entry) = entries.next_entry().await.map_err(FsError::io(dir))? {
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                if !bundles.iter().any(|b| b == name) {
                    bundles.push(name.to_string());
                }
            }
        }
        bundles.sort();
        for bundle in bundles {
            if let Err(err) = self.process(&bundle, cancel).await {
                tracing::warn!(%err, %bundle, "bundle skipped");
            }
        }
        Ok(())
    }

    /// Bring one bundle in line with the files on disk: load it, reload it
    /// when its files changed, or unload it when it disappeared.
    ///
    /// # Errors
    ///
    /// Returns [`FsError::Zombie`] when the previous version could not be
    /// reclaimed and [`FsError::NoLocator`] when the new version exposes no
    /// locator; other load failures are reported as I/O or domain errors.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn process(&self, bundle: &str, cancel: &CancellationToken) -> Result<(), FsError> {
        let mut table = self.table.lock().await;
        let source = self.settings.modules_dir.join(bundle);
        let fingerprint = self.fingerprint(&source).await?;

        if let Some(entry) = table.get(bundle) {
            if entry.status != ModuleStatus::Zombie && entry.fingerprint == fingerprint {
                tracing::debug!("bundle unchanged");
                return Ok(());
            }
            self.unload(&mut table, bundle, cancel).await?;
        }

        if fingerprint.is_empty() {
            self.publish(&table);
            return Ok(());
        }
        let entry = self.load(bundle, &source, fingerprint).await?;
        tracing::info!(load_id = %entry.load_id, item_types = entry.item_types.len(), "bundle loaded");
        table.insert(bundle.to_string(), entry);
        self.publish(&table);
        Ok(())
    }

    /// Initial scan, then react to filesystem events until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        if let Err(err) = self.scan(&cancel).await {
            tracing::warn!(%err, "initial module scan failed");
        }
        let root = tokio::fs::canonicalize(&self.settings.modules_dir)
            .await
            .unwrap_or_else(|_| self.settings.modules_dir.clone());
        let events = match watch(&root, RecursiveMode::Recursive) {
            Ok((watcher, events)) => Some((watcher, events)),
            Err(err) => {
                tracing::warn!(%err, "module watch unavailable, bundles load at startup only");
                None
            }
        };
        if let Some((_watcher, events)) = events {
            self.run_events(&root, events, cancel).await;
        } else {
            cancel.cancelled().await;
        }
        tracing::debug!("module loader stopped");
    }

    /// Debounce changed paths per bundle and process each bundle once it
    /// has been quiet for the settle delay.
    async fn run_events(
        &self,
        root: &Path,
        mut events: mpsc::UnboundedReceiver<PathBuf>,
        cancel: CancellationToken,
    ) {
        let mut pending: HashMap<String, Instant> = HashMap::new();
        let mut open = true;
        loop {
            let next = pending.values().min().copied();
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                path = events.recv(), if open => match path {
                    Some(path) => {
                        if let Some(bundle) = bundle_of(root, &path) {
                            pending.insert(bundle, Instant::now() + self.settings.settle_delay);
                        }
                    }
                    None => open = false,
                },
                () = sleep_until(next) => {
                    let now = Instant::now();
                    let due: Vec<String> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(bundle, _)| bundle.clone())
                        .collect();
                    for bundle in due {
                        pending.remove(&bundle);
                        if let Err(err) = self.process(&bundle, &cancel).await {
                            tracing::warn!(%err, %bundle, "bundle skipped");
                        }
                    }
                }
            }
        }
    }

    async fn load(
        &self,
        bundle: &str,
        source: &Path,
        fingerprint: Fingerprint,
    ) -> Result<ModuleEntry, FsError> {
        let load_id = ModuleId::new();
        let staging = self
            .settings
            .staging_dir
            .join(bundle)
            .join(load_id.to_string());
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(FsError::io(&staging))?;

        let modules = match self.load_staged(source, &staging, &fingerprint).await {
            Ok(modules) => modules,
            Err(err) => {
                remove_staging(&staging).await;
                return Err(err);
            }
        };

        let anchors: Vec<Anchor> = modules.iter().map(|m| Arc::downgrade(&m.anchor)).collect();
        let mut item_types = Vec::new();
        for module in modules {
            for locator in module.locators {
                let item_type = locator.item_type().clone();
                match self.registry.register_locator(locator).await {
                    Ok(()) => item_types.push(item_type),
                    Err(err) => tracing::warn!(%err, %item_type, "locator rejected"),
                }
            }
        }
        if item_types.is_empty() {
            remove_staging(&staging).await;
            return Err(FsError::NoLocator {
                bundle: bundle.to_string(),
            });
        }
        Ok(ModuleEntry {
            load_id,
            fingerprint,
            item_types,
            anchors,
            staging,
            status: ModuleStatus::Resident,
        })
    }

    /// Copy the bundle to its staging directory and load every library.
    /// Any failing library fails the whole bundle.
    async fn load_staged(
        &self,
        source: &Path,
        staging: &Path,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<LoadedModule>, FsError> {
        for name in fingerprint.keys() {
            let from = source.join(name);
            tokio::fs::copy(&from, staging.join(name))
                .await
                .map_err(FsError::io(&from))?;
        }
        let mut modules = Vec::new();
        for name in fingerprint.keys() {
            let path = staging.join(name);
            if !self.runtime.accepts(&path) {
                continue;
            }
            let module = self.runtime.load(&path, self.context.clone()).await?;
            tracing::debug!(file = %name, locators = module.locators.len(), "library loaded");
            modules.push(module);
        }
        Ok(modules)
    }

    async fn unload(
        &self,
        table: &mut BTreeMap<String, ModuleEntry>,
        bundle: &str,
        cancel: &CancellationToken,
    ) -> Result<(), FsError> {
        let Some(entry) = table.get_mut(bundle) else {
            return Ok(());
        };
        let load_id = entry.load_id;
        let item_types = entry.item_types.clone();
        entry.status = ModuleStatus::PendingUnload;

        // held until the module is idle so the runtime gets to stop it
        let held: Vec<Arc<dyn Any + Send + Sync>> =
            entry.anchors.iter().filter_map(Weak::upgrade).collect();
        let anchors = entry.anchors.clone();
        self.publish(table);

        let mut detached: Vec<Weak<dyn Locator>> = Vec::with_capacity(item_types.len());
        for item_type in &item_types {
            if let Some(locator) = self.registry.unregister_locator(item_type).await {
                detached.push(Arc::downgrade(&locator));
            }
        }

        if self.reclaim(held, &anchors, cancel).await {
            if let Some(mut entry) = table.remove(bundle) {
                entry.status = ModuleStatus::Reclaimed;
                tracing::info!(%load_id, status = %entry.status, "module unloaded");
                remove_staging(&entry.staging).await;
            }
            self.publish(table);
            return Ok(());
        }

        tracing::warn!(%load_id, "zombie module, still resident after unload");
        let mut restored = Vec::new();
        for locator in detached.iter().filter_map(Weak::upgrade) {
            let item_type = locator.item_type().clone();
            match self.registry.register_locator(locator).await {
                Ok(()) => restored.push(item_type),
                Err(err) => tracing::warn!(%err, %item_type, "zombie locator not restored"),
            }
        }
        if let Some(entry) = table.get_mut(bundle) {
            entry.status = ModuleStatus::Zombie;
            entry.item_types = restored;
        }
        self.publish(table);
        Err(FsError::Zombie {
            bundle: bundle.to_string(),
        })
    }

    /// Wait with a growing delay between tries until the loader holds the
    /// last reference to every anchor, then let the runtime stop them.
    async fn reclaim(
        &self,
        held: Vec<Arc<dyn Any + Send + Sync>>,
        anchors: &[Anchor],
        cancel: &CancellationToken,
    ) -> bool {
        let idle = |held: &[Arc<dyn Any + Send + Sync>]| held.iter().all(|a| Arc::strong_count(a) == 1);
        let mut attempt = 0;
        while !idle(&held) {
            attempt += 1;
            if attempt > self.settings.unload_tries {
                return false;
            }
            let delay = self.settings.unload_interval * attempt;
            tracing::debug!(attempt, delay_ms = delay.as_millis(), "module still resident");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(delay) => {}
            }
        }
        for anchor in held {
            self.runtime.release(anchor).await;
        }
        is_reclaimed(anchors)
    }

    /// Unload every bundle, letting the runtime stop each module.
    pub async fn shutdown(&self) {
        let cancel = CancellationToken::new();
        let mut table = self.table.lock().await;
        let bundles: Vec<String> = table.keys().cloned().collect();
        for bundle in bundles {
            if let Err(err) = self.unload(&mut table, &bundle, &cancel).await {
                tracing::warn!(%err, %bundle, "module not reclaimed at shutdown");
            }
        }
    }

    /// Empty when the bundle is absent or has no library file.
    async fn fingerprint(&self, dir: &Path) -> Result<Fingerprint, FsError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Fingerprint::new());
            }
            Err(err) => return Err(FsError::io(dir)(err)),
        };
        let mut fingerprint = Fingerprint::new();
        let mut has_library = false;
        while let Some(entry) = entries.next_entry().await.map_err(FsError::io(dir))? {
            let metadata = entry.metadata().await.map_err(FsError::io(entry.path()))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            has_library |= self.runtime.accepts(&entry.path());
            fingerprint.insert(name, (metadata.len(), metadata.modified().ok()));
        }
        if !has_library {
            fingerprint.clear();
        }
        Ok(fingerprint)
    }

    fn publish(&self, table: &BTreeMap<String, ModuleEntry>) {
        let inventory = table
            .iter()
            .map(|(bundle, entry)| entry.info(bundle))
            .collect();
        *self
            .inventory
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = inventory;
    }
}

/// Name of the bundle a changed path belongs to.
fn bundle_of(root: &Path, path: &Path) -> Option<String> {
    match path.strip_prefix(root).ok()?.components().next()? {
        Component::Normal(name) => name.to_str().map(str::to_string),
        _ => None,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn remove_staging(staging: &Path) {
    if let Err(err) = tokio::fs::remove_dir_all(staging).await {
        tracing::warn!(%err, staging = %staging.display(), "failed to remove staging directory");
    }
}
