//! Request/response correlation over a pair of byte streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::PluginError;
use crate::protocol::{Envelope, Incoming, Notification, Request, Response};

#[derive(Default)]
struct Waiters {
    by_id: HashMap<u64, oneshot::Sender<Response>>,
    closed: bool,
}

#[derive(Default)]
struct Pending {
    waiters: Mutex<Waiters>,
}

impl Pending {
    fn lock(&self) -> std::sync::MutexGuard<'_, Waiters> {
        self.waiters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn register(&self, id: u64) -> Result<oneshot::Receiver<Response>, PluginError> {
        let mut waiters = self.lock();
        if waiters.closed {
            return Err(PluginError::Closed);
        }
        let (sender, receiver) = oneshot::channel();
        waiters.by_id.insert(id, sender);
        Ok(receiver)
    }

    fn take(&self, id: u64) -> Option<oneshot::Sender<Response>> {
        self.lock().by_id.remove(&id)
    }

    /// Fail every outstanding request and refuse new ones.
    fn close(&self) {
        let mut waiters = self.lock();
        waiters.closed = true;
        waiters.by_id.clear();
    }
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct PluginChannel {
    name: String,
    writer: tokio::sync::Mutex<Writer>,
    pending: Arc<Pending>,
    next_id: AtomicU64,
    timeout: Duration,
    reader: JoinHandle<()>,
}

impl PluginChannel {
    /// Start reading `reader` in the background. Unsolicited plugin
    /// messages come out of the returned receiver, which closes once the
    /// plugin's output ends.
    pub fn open<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.into();
        let pending = Arc::new(Pending::default());
        let (sender, receiver) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(
            name.clone(),
            reader,
            Arc::clone(&pending),
            sender,
        ));
        let channel = Self {
            name,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            timeout,
            reader,
        };
        (channel, receiver)
    }

    /// Send a request and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Timeout`] when no answer arrives in time,
    /// [`PluginError::Closed`] once the plugin is gone and
    /// [`PluginError::Remote`] when the plugin answers with an error.
    pub async fn request(&self, request: &Request) -> Result<serde_json::Value, PluginError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_string(&Envelope { id, request }).map_err(PluginError::Encode)?;
        line.push('\n');

        let receiver = self.pending.register(id)?;
        if let Err(err) = self.write(line.as_bytes()).await {
            self.pending.take(id);
            return Err(err);
        }

        let response = match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(PluginError::Closed),
            Err(_) => {
                self.pending.take(id);
                tracing::warn!(plugin = %self.name, op = request.op(), id, "plugin request timed out");
                return Err(PluginError::Timeout { op: request.op() });
            }
        };
        match response.error {
            Some(message) => Err(PluginError::Remote(message)),
            None => Ok(response.result),
        }
    }

    /// [`request`](Self::request), decoding the result.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request), plus [`PluginError::Decode`].
    pub async fn call<T: DeserializeOwned>(&self, request: &Request) -> Result<T, PluginError> {
        let result = self.request(request).await?;
        serde_json::from_value(result).map_err(PluginError::Decode)
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), PluginError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await.map_err(PluginError::Io)?;
        writer.flush().await.map_err(PluginError::Io)
    }
}

impl Drop for PluginChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    name: String,
    reader: R,
    pending: Arc<Pending>,
    notifications: mpsc::UnboundedSender<Notification>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%err, plugin = %name, "failed to read plugin output");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Incoming>(&line) {
            Ok(Incoming::Response(response)) => match pending.take(response.id) {
                Some(waiter) => {
                    let _ = waiter.send(response);
                }
                None => tracing::debug!(plugin = %name, id = response.id, "late plugin response dropped"),
            },
            Ok(Incoming::Notification(notification)) => {
                let _ = notifications.send(notification);
            }
            Err(err) => tracing::warn!(%err, plugin = %name, "malformed plugin message"),
        }
    }
    pending.close();
    tracing::debug!(plugin = %name, "plugin output closed");
}
