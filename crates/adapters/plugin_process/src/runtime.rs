//! Subprocess [`ModuleRuntime`]: every library file is an executable
//! speaking the JSON-lines protocol on its stdin/stdout.
//!
//! The module anchor is the [`PluginProcess`]. Remote locators and items hold
//! it strongly; the notification pump only holds weak locators, so the
//! process is dropped, and the child killed, once the loader lets go of the
//! last locator.

use std::any::Any;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use itemhub_app::ports::{HubContext, Item, LoadedModule, Locator, ModuleRuntime};
use itemhub_app::watchdog::WatchdogSettings;
use itemhub_domain::error::HubError;
use itemhub_domain::event::StateChangedEvent;

use crate::channel::PluginChannel;
use crate::error::PluginError;
use crate::locator::RemoteLocator;
use crate::protocol::{Hello, Notification, PROTOCOL_VERSION, Request};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProcessSettings {
    /// File extensions treated as plugin executables.
    pub extensions: Vec<String>,
    pub request_timeout: Duration,
    /// Watchdog of every remote item.
    pub watchdog: WatchdogSettings,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            extensions: vec!["plugin".to_string()],
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            watchdog: WatchdogSettings::default(),
        }
    }
}

/// One running plugin.
pub struct PluginProcess {
    name: String,
    channel: PluginChannel,
    child: Mutex<Option<Child>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PluginProcess {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn request(&self, request: &Request) -> Result<serde_json::Value, PluginError> {
        self.channel.request(request).await
    }

    pub(crate) async fn call<T: DeserializeOwned>(&self, request: &Request) -> Result<T, PluginError> {
        self.channel.call(request).await
    }

    /// Ask the plugin to stop and wait for its exit, each step bounded by
    /// `timeout`. A plugin still running afterwards is killed.
    pub async fn shutdown(&self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.request(&Request::Shutdown)).await {
            Ok(Ok(_)) => tracing::debug!(plugin = %self.name, "plugin acknowledged shutdown"),
            Ok(Err(err)) => tracing::debug!(%err, plugin = %self.name, "plugin shutdown request failed"),
            Err(_) => tracing::warn!(plugin = %self.name, "plugin did not acknowledge shutdown"),
        }
        let child = self
            .child
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(mut child) = child else {
            return;
        };
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(plugin = %self.name, %status, "plugin process exited"),
            Ok(Err(err)) => tracing::warn!(%err, plugin = %self.name, "failed to wait for plugin process"),
            Err(_) => {
                tracing::warn!(plugin = %self.name, "plugin process still running, killing it");
                if let Err(err) = child.start_kill() {
                    tracing::debug!(%err, plugin = %self.name, "plugin process already gone");
                }
            }
        }
    }

    fn set_pump(&self, pump: JoinHandle<()>) {
        *self
            .pump
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(pump);
    }
}

#[cfg(test)]
impl PluginProcess {
    /// Process without a child, talking over the given streams.
    pub(crate) fn over<R, W>(name: &str, reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (channel, _notifications) =
            PluginChannel::open(name, reader, writer, DEFAULT_REQUEST_TIMEOUT);
        Arc::new(Self {
            name: name.to_string(),
            channel,
            child: Mutex::new(None),
            pump: Mutex::new(None),
        })
    }
}

impl Drop for PluginProcess {
    fn drop(&mut self) {
        let pump = self
            .pump
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
        let child = self
            .child
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(child) = child.as_mut() {
            if let Err(err) = child.start_kill() {
                tracing::debug!(%err, plugin = %self.name, "plugin process already gone");
            }
        }
        tracing::info!(plugin = %self.name, "plugin process released");
    }
}

impl std::fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcess")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

pub struct ProcessRuntime {
    settings: ProcessSettings,
}

impl ProcessRuntime {
    #[must_use]
    pub fn new(settings: ProcessSettings) -> Self {
        Self { settings }
    }

    /// Handshake with a plugin already wired to `reader`/`writer` and build
    /// its locators.
    ///
    /// # Errors
    ///
    /// Returns an error when the handshake fails or the plugin announces
    /// no locator.
    pub async fn connect<R, W>(
        &self,
        name: impl Into<String>,
        reader: R,
        writer: W,
        child: Option<Child>,
        context: HubContext,
    ) -> Result<LoadedModule, PluginError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.into();
        let (channel, notifications) =
            PluginChannel::open(name.clone(), reader, writer, self.settings.request_timeout);
        let process = Arc::new(PluginProcess {
            name: name.clone(),
            channel,
            child: Mutex::new(child),
            pump: Mutex::new(None),
        });

        let hello: Hello = process
            .call(&Request::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;
        if hello.locators.is_empty() {
            return Err(PluginError::NoLocator);
        }

        let locators: Vec<Arc<RemoteLocator>> = hello
            .locators
            .into_iter()
            .map(|spec| {
                Arc::new(RemoteLocator::new(
                    spec,
                    Arc::clone(&process),
                    self.settings.watchdog,
                ))
            })
            .collect();
        let weak = locators.iter().map(Arc::downgrade).collect();
        process.set_pump(tokio::spawn(pump(name.clone(), notifications, weak, context)));

        tracing::info!(
            plugin = %name,
            locators = locators.len(),
            "plugin connected"
        );
        Ok(LoadedModule {
            locators: locators
                .into_iter()
                .map(|locator| locator as Arc<dyn Locator>)
                .collect(),
            anchor: process,
        })
    }
}

#[async_trait]
impl ModuleRuntime for ProcessRuntime {
    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.settings.extensions.iter().any(|e| e == ext))
    }

    #[tracing::instrument(skip(self, context))]
    async fn load(&self, path: &Path, context: HubContext) -> Result<LoadedModule, HubError> {
        let mut command = tokio::process::Command::new(path);
        if let Some(dir) = path.parent() {
            command.current_dir(dir);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(PluginError::Spawn)?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PluginError::Closed.into());
        };

        let name = path.file_name().map_or_else(
            || path.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        );
        tracing::debug!(plugin = %name, pid = ?child.id(), "plugin process started");
        Ok(self
            .connect(name, stdout, stdin, Some(child), context)
            .await?)
    }

    async fn release(&self, anchor: Arc<dyn Any + Send + Sync>) {
        match anchor.downcast::<PluginProcess>() {
            Ok(process) => process.shutdown(self.settings.request_timeout).await,
            Err(other) => drop(other),
        }
    }
}

async fn pump(
    name: String,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    locators: Vec<Weak<RemoteLocator>>,
    context: HubContext,
) {
    while let Some(notification) = notifications.recv().await {
        match notification {
            Notification::Log { level, message } => log(&name, &level, &message),
            Notification::ItemAdded { item_type, item_id } => {
                match live(&locators).find(|l| l.item_type() == &item_type) {
                    Some(locator) => locator.discovered(item_id),
                    None => tracing::warn!(plugin = %name, %item_type, "item added for unknown locator"),
                }
            }
            Notification::ItemDeleted { item_type, item_id } => {
                if let Some(locator) = live(&locators).find(|l| l.item_type() == &item_type) {
                    locator.vanished(item_id);
                }
            }
            Notification::Notify {
                item_id,
                parameter,
                value,
            } => {
                let Some(item) = live(&locators).find_map(|l| l.find(&item_id)) else {
                    tracing::debug!(plugin = %name, %item_id, "notify for unknown item dropped");
                    continue;
                };
                item.heartbeat();
                let item_type = item.item_type().clone();
                let event = match context.get_value(item_id.as_str(), &parameter) {
                    Some(old) => StateChangedEvent::updated(item_type, item_id, parameter, old, value),
                    None => StateChangedEvent::added(item_type, item_id, parameter, value),
                };
                context.notify_subscribers(event);
            }
        }
    }
    tracing::debug!(plugin = %name, "plugin notifications closed");
}

fn live(locators: &[Weak<RemoteLocator>]) -> impl Iterator<Item = Arc<RemoteLocator>> + '_ {
    locators.iter().filter_map(Weak::upgrade)
}

fn log(plugin: &str, level: &str, message: &str) {
    match level {
        "error" => tracing::error!(plugin, "{message}"),
        "warn" | "warning" => tracing::warn!(plugin, "{message}"),
        "debug" => tracing::debug!(plugin, "{message}"),
        "trace" => tracing::trace!(plugin, "{message}"),
        _ => tracing::info!(plugin, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};

    use itemhub_app::hub::{Hub, HubSettings};
    use itemhub_app::notification_bus::ChannelSubscriber;
    use itemhub_app::ports::Subscriber;
    use itemhub_domain::config::ItemConfig;
    use itemhub_domain::event::EventType;
    use itemhub_domain::id::ItemId;
    use itemhub_domain::state::ConnectionStatus;
    use itemhub_domain::tracking::TrackingRules;
    use itemhub_domain::value::Value;

    use super::*;
    use crate::channel::tests::fake_plugin;

    fn lamp_plugin(request: &serde_json::Value) -> Option<serde_json::Value> {
        let result = match request["op"].as_str()? {
            "hello" => serde_json::json!({"locators": [{"item_type": "lamp", "immediate_init": true}]}),
            "get_state" => serde_json::json!({
                "connection_status": "Unknown",
                "parameters": {"on": true}
            }),
            "set_value" if request["value"] != serde_json::json!(true) => {
                return Some(serde_json::json!({"id": request["id"], "error": "lamp only turns on"}));
            }
            _ => serde_json::Value::Null,
        };
        Some(serde_json::json!({"id": request["id"], "result": result}))
    }

    async fn write_line(out: &mut DuplexStream, message: serde_json::Value) {
        let mut line = message.to_string();
        line.push('\n');
        out.write_all(line.as_bytes()).await.unwrap();
    }

    /// Plugin that answers the handshake and then leaves the test in charge
    /// of its output.
    async fn connect_scripted(context: HubContext) -> (LoadedModule, DuplexStream) {
        let (host_out, plugin_in) = duplex(64 * 1024);
        let (mut plugin_out, host_in) = duplex(64 * 1024);
        let runtime = ProcessRuntime::new(ProcessSettings::default());
        let plugin = async move {
            let mut lines = BufReader::new(plugin_in).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let hello: serde_json::Value = serde_json::from_str(&line).unwrap();
            write_line(
                &mut plugin_out,
                serde_json::json!({"id": hello["id"], "result": {"locators": [{"item_type": "lamp"}]}}),
            )
            .await;
            // keep the plugin's input open for the rest of the test
            tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });
            plugin_out
        };
        let (module, plugin_out) = tokio::join!(
            runtime.connect("scripted", host_in, host_out, None, context),
            plugin
        );
        (module.unwrap(), plugin_out)
    }

    async fn settle_until(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never met");
    }

    #[tokio::test]
    async fn should_build_locators_from_handshake() {
        let (reader, writer, _plugin) = fake_plugin(lamp_plugin);
        let runtime = ProcessRuntime::new(ProcessSettings::default());

        let module = runtime
            .connect("lamps", reader, writer, None, HubContext::detached())
            .await
            .unwrap();

        assert_eq!(module.locators.len(), 1);
        assert_eq!(module.locators[0].item_type().as_str(), "lamp");
        assert!(module.locators[0].immediate_init());
    }

    #[tokio::test]
    async fn should_reject_plugin_without_locator() {
        let (reader, writer, _plugin) = fake_plugin(|request| {
            Some(serde_json::json!({"id": request["id"], "result": {"locators": []}}))
        });
        let runtime = ProcessRuntime::new(ProcessSettings::default());

        let err = runtime
            .connect("empty", reader, writer, None, HubContext::detached())
            .await
            .unwrap_err();

        assert!(matches!(err, PluginError::NoLocator));
    }

    #[tokio::test]
    async fn should_proxy_items_to_plugin() {
        let (reader, writer, _plugin) = fake_plugin(lamp_plugin);
        let runtime = ProcessRuntime::new(ProcessSettings::default());
        let module = runtime
            .connect("lamps", reader, writer, None, HubContext::detached())
            .await
            .unwrap();
        let locator = &module.locators[0];

        locator
            .config_added(ItemConfig::new("kitchen", "lamp"))
            .await
            .unwrap();
        let items = locator.items();
        let item = items[0].as_gettable().unwrap();
        let state = item.get_state().await.unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(state.get("on"), Some(&Value::Bool(true)));
        assert_eq!(state.connection_status, ConnectionStatus::Stable);
    }

    #[tokio::test]
    async fn should_surface_plugin_refusal_as_device_error() {
        let (reader, writer, _plugin) = fake_plugin(lamp_plugin);
        let runtime = ProcessRuntime::new(ProcessSettings::default());
        let module = runtime
            .connect("lamps", reader, writer, None, HubContext::detached())
            .await
            .unwrap();
        let locator = &module.locators[0];
        locator
            .config_added(ItemConfig::new("kitchen", "lamp"))
            .await
            .unwrap();

        let items = locator.items();
        let err = items[0]
            .as_settable()
            .unwrap()
            .set_value("on", Value::Bool(false))
            .await
            .unwrap_err();

        assert!(matches!(err, HubError::Device(source) if source.to_string() == "lamp only turns on"));
    }

    #[tokio::test]
    async fn should_forget_item_on_config_deleted() {
        let (reader, writer, _plugin) = fake_plugin(lamp_plugin);
        let runtime = ProcessRuntime::new(ProcessSettings::default());
        let module = runtime
            .connect("lamps", reader, writer, None, HubContext::detached())
            .await
            .unwrap();
        let locator = &module.locators[0];
        locator
            .config_added(ItemConfig::new("kitchen", "lamp"))
            .await
            .unwrap();

        locator
            .config_deleted(&ItemId::from("kitchen"))
            .await
            .unwrap();

        assert!(locator.items().is_empty());
    }

    #[tokio::test]
    async fn should_track_items_discovered_by_plugin() {
        let (module, mut plugin_out) = connect_scripted(HubContext::detached()).await;
        let locator = Arc::clone(&module.locators[0]);

        write_line(
            &mut plugin_out,
            serde_json::json!({"event": "item_added", "item_type": "lamp", "item_id": "hall"}),
        )
        .await;
        settle_until(|| locator.items().len() == 1).await;
        write_line(
            &mut plugin_out,
            serde_json::json!({"event": "item_deleted", "item_type": "lamp", "item_id": "hall"}),
        )
        .await;
        settle_until(|| locator.items().is_empty()).await;
    }

    #[tokio::test]
    async fn should_publish_plugin_notifications() {
        let hub = Hub::new(HubSettings::default(), TrackingRules::default());
        let channel = Arc::new(ChannelSubscriber::new("test", 16));
        let subscriber: Arc<dyn Subscriber> = channel.clone();
        hub.register_subscriber(&subscriber);
        let mut events = channel.subscribe();
        let (_module, mut plugin_out) = connect_scripted(hub.context()).await;

        write_line(
            &mut plugin_out,
            serde_json::json!({"event": "item_added", "item_type": "lamp", "item_id": "hall"}),
        )
        .await;
        write_line(
            &mut plugin_out,
            serde_json::json!({"event": "notify", "item_id": "hall", "parameter": "on", "value": true}),
        )
        .await;
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.event_type, EventType::Added);
        assert_eq!(event.item_id.as_str(), "hall");
        assert_eq!(event.new_value, Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn should_release_process_with_last_locator() {
        let (reader, writer, _plugin) = fake_plugin(lamp_plugin);
        let runtime = ProcessRuntime::new(ProcessSettings::default());
        let module = runtime
            .connect("lamps", reader, writer, None, HubContext::detached())
            .await
            .unwrap();
        let anchor = Arc::downgrade(&module.anchor);

        drop(module);

        assert!(anchor.upgrade().is_none());
    }

    #[tokio::test]
    async fn should_send_shutdown_when_released() {
        let ops = Arc::new(Mutex::new(Vec::new()));
        let (reader, writer, _plugin) = fake_plugin({
            let ops = Arc::clone(&ops);
            move |request| {
                ops.lock()
                    .unwrap()
                    .push(request["op"].as_str().unwrap_or_default().to_string());
                lamp_plugin(request)
            }
        });
        let runtime = ProcessRuntime::new(ProcessSettings::default());
        let LoadedModule { locators, anchor } = runtime
            .connect("lamps", reader, writer, None, HubContext::detached())
            .await
            .unwrap();
        drop(locators);

        runtime.release(anchor).await;

        assert_eq!(*ops.lock().unwrap(), vec!["hello", "shutdown"]);
    }

    #[tokio::test]
    async fn should_bound_release_of_silent_plugin() {
        let (reader, writer, _plugin) = fake_plugin(|request| match request["op"].as_str() {
            Some("hello") => lamp_plugin(request),
            _ => None,
        });
        let runtime = ProcessRuntime::new(ProcessSettings {
            request_timeout: Duration::from_millis(50),
            ..ProcessSettings::default()
        });
        let LoadedModule { locators, anchor } = runtime
            .connect("lamps", reader, writer, None, HubContext::detached())
            .await
            .unwrap();
        drop(locators);

        let released = tokio::time::timeout(Duration::from_secs(2), runtime.release(anchor)).await;

        assert!(released.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn should_let_plugin_exit_on_shutdown() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.plugin");
        let marker = dir.path().join("stopped");
        std::fs::write(
            &path,
            format!(
                "#!/bin/sh\n\
                 read line\n\
                 echo '{{\"id\":1,\"result\":{{\"locators\":[{{\"item_type\":\"echo\"}}]}}}}'\n\
                 read line\n\
                 echo '{{\"id\":2,\"result\":null}}'\n\
                 touch '{}'\n",
                marker.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let runtime = ProcessRuntime::new(ProcessSettings::default());
        let LoadedModule { locators, anchor } =
            runtime.load(&path, HubContext::detached()).await.unwrap();
        drop(locators);

        runtime.release(anchor).await;

        assert!(marker.exists());
    }

    #[test]
    fn should_accept_configured_extensions_only() {
        let runtime = ProcessRuntime::new(ProcessSettings::default());

        assert!(runtime.accepts(&PathBuf::from("/modules/lamps/lamps.plugin")));
        assert!(!runtime.accepts(&PathBuf::from("/modules/lamps/readme.txt")));
        assert!(!runtime.accepts(&PathBuf::from("/modules/lamps/plugin")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn should_spawn_executable_plugin() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.plugin");
        std::fs::write(
            &path,
            "#!/bin/sh\n\
             read line\n\
             echo '{\"id\":1,\"result\":{\"locators\":[{\"item_type\":\"echo\"}]}}'\n\
             cat > /dev/null\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let runtime = ProcessRuntime::new(ProcessSettings::default());

        let module = runtime.load(&path, HubContext::detached()).await.unwrap();

        assert_eq!(module.locators[0].item_type().as_str(), "echo");
    }
}
