//! # itemhubd — itemhub daemon
//!
//! Composition root that wires all adapters together and runs the hub.
//!
//! ## Responsibilities
//! - Load configuration (config file, env vars)
//! - Install the tracing subscriber
//! - Build the hub and register the compiled-in locators
//! - Start the config watcher and the plugin module loader
//! - Handle graceful shutdown on ctrl-c: cancel, join, stop plugins, dispose
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer — no domain logic belongs here.

mod config;

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use itemhub_adapter_fs::config_watcher::ConfigWatcher;
use itemhub_adapter_fs::module_loader::ModuleLoader;
use itemhub_adapter_plugin_process::ProcessRuntime;
use itemhub_app::hub::Hub;
use itemhub_app::ports::ModuleRuntime;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;

    let filter = EnvFilter::try_new(&config.logging.filter)
        .with_context(|| format!("invalid log filter {:?}", config.logging.filter))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for dir in [&config.modules.dir, &config.modules.staging_dir, &config.configs.dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let hub = Hub::new(config.hub_settings(), config.tracking_rules());
    let context = hub.context();
    hub.registry()
        .start(itemhub_adapter_virtual::locators(&context, config.watchdog()))
        .await;

    let cancel = CancellationToken::new();
    let mut tasks = hub.spawn(&cancel);

    let watcher = Arc::new(ConfigWatcher::new(
        config.config_watcher_settings(),
        Arc::clone(hub.registry()),
    ));
    tasks.push(spawn_loop(&cancel, {
        let watcher = Arc::clone(&watcher);
        move |cancel| async move { watcher.run(cancel).await }
    }));

    let runtime: Arc<dyn ModuleRuntime> = Arc::new(ProcessRuntime::new(config.process_settings()));
    let loader = Arc::new(ModuleLoader::new(
        config.module_loader_settings(),
        runtime,
        Arc::clone(hub.registry()),
        context,
    ));
    tasks.push(spawn_loop(&cancel, {
        let loader = Arc::clone(&loader);
        move |cancel| async move { loader.run(cancel).await }
    }));

    tracing::info!(
        modules = %config.modules.dir.display(),
        configs = %config.configs.dir.display(),
        "itemhubd running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    cancel.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(%err, "background task ended abnormally");
        }
    }
    loader.shutdown().await;
    for module in loader.modules() {
        tracing::warn!(bundle = %module.bundle, status = %module.status, "module left at shutdown");
    }
    hub.shutdown().await;
    Ok(())
}

fn spawn_loop<F, Fut>(cancel: &CancellationToken, run: F) -> JoinHandle<()>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(run(cancel.clone()))
}
