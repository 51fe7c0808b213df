//! Client builder and dial lifecycle.
//!
//! The [`ClientBuilder`] provides a fluent API for configuring handlers
//! and building the client. The [`Client`] manages the lifecycle:
//! 1. Poll until the server's well-known name exists
//! 2. Receive the private name over the handshake
//! 3. Connect to the private name and open the connection
//! 4. Signal `connected`; later `disconnected` when the connection closes
//!
//! # Example
//!
//! ```ignore
//! use pipeplex::codec::TextCodec;
//! use pipeplex::Client;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::builder("demo", TextCodec)
//!         .on_message(|_, msg: &String| {
//!             println!("server says {}", msg);
//!             Ok(())
//!         })
//!         .start();
//!
//!     if client.wait_for_connection_ms(1000).await {
//!         client.push_message("hi".to_string());
//!     }
//!     client.stop().await;
//! }
//! ```

pub(crate) mod dialer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::connection::{Connection, ConnectionConfig, ConnectionObserver};
use crate::error::PipeplexError;
use crate::handler::{HandlerRegistry, HandlerResult};
use crate::worker::BackgroundWorker;

pub use dialer::{DialConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_POLL_INTERVAL};

/// Default bound on waiting for loops to exit during stop.
pub const DEFAULT_CLIENT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Completion signals observed by the wait methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DialStatus {
    connected: bool,
    disconnected: bool,
    stopped: bool,
}

impl DialStatus {
    const STOPPED: Self = Self {
        connected: false,
        disconnected: false,
        stopped: true,
    };
    const STARTED: Self = Self {
        connected: false,
        disconnected: false,
        stopped: false,
    };
}

struct ClientShared<C: Codec> {
    server_name: String,
    name: Option<String>,
    codec: Arc<C>,
    handlers: HandlerRegistry<C>,
    dial: DialConfig,
    connection_config: ConnectionConfig,
    auto_reconnect: bool,
    stop_timeout: Duration,
    running: AtomicBool,
    status: watch::Sender<DialStatus>,
    connection: Mutex<Option<Arc<Connection<C>>>>,
    /// Guards `running` transitions together with the worker slot.
    dialer: Mutex<Option<BackgroundWorker>>,
}

impl<C: Codec> ClientShared<C> {
    fn connection_slot(&self) -> MutexGuard<'_, Option<Arc<Connection<C>>>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dialer_slot(&self) -> MutexGuard<'_, Option<BackgroundWorker>> {
        self.dialer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn spawn_dial<C: Codec>(shared: &Arc<ClientShared<C>>) -> BackgroundWorker {
    let task_shared = shared.clone();
    BackgroundWorker::spawn(format!("dial-{}", shared.server_name), move |cancel| {
        dial_loop(task_shared, cancel)
    })
}

async fn dial_loop<C: Codec>(
    shared: Arc<ClientShared<C>>,
    cancel: CancellationToken,
) -> crate::Result<()> {
    loop {
        let (stream, private_name) =
            match dialer::dial(&shared.server_name, &shared.dial, &cancel).await {
                Ok(dialed) => dialed,
                Err(PipeplexError::Cancelled) => return Ok(()),
                Err(e) => {
                    tracing::warn!(pipe = %shared.server_name, error = %e, "dial attempt failed");
                    shared.handlers.emit_error(None, &e);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(shared.dial.poll_interval) => continue,
                    }
                }
            };

        let id = connection_id(&private_name);
        let name = shared
            .name
            .clone()
            .unwrap_or_else(|| format!("Client {}", id));
        let observer = Arc::new(ClientObserver {
            shared: Arc::downgrade(&shared),
        });
        let conn = Connection::new(
            id,
            name,
            shared.codec.clone(),
            shared.connection_config.clone(),
            observer,
        );

        if cancel.is_cancelled() {
            return Ok(());
        }
        *shared.connection_slot() = Some(conn.clone());
        conn.open(stream)?;

        tracing::debug!(conn_id = id, pipe = %private_name, "connected to server");
        shared.status.send_modify(|s| {
            s.connected = true;
            s.disconnected = false;
        });
        shared.handlers.emit_connected(&conn);
        return Ok(());
    }
}

/// Sequence number carried in the `{name}_{seq}` suffix, or 0 if absent.
fn connection_id(private_name: &str) -> u64 {
    match private_name.rsplit_once('_').and_then(|(_, seq)| seq.parse().ok()) {
        Some(id) => id,
        None => {
            tracing::warn!(pipe = %private_name, "private name has no sequence suffix, using id 0");
            0
        }
    }
}

struct ClientObserver<C: Codec> {
    shared: Weak<ClientShared<C>>,
}

impl<C: Codec> ConnectionObserver<C> for ClientObserver<C> {
    fn on_message(&self, conn: &Arc<Connection<C>>, message: C::Item) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handlers.emit_message(conn, &message);
        }
    }

    fn on_error(&self, conn: &Arc<Connection<C>>, error: PipeplexError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handlers.emit_error(Some(conn), &error);
        }
    }

    fn on_closed(&self, conn: &Arc<Connection<C>>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        {
            let mut slot = shared.connection_slot();
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, conn)) {
                *slot = None;
            }
        }
        shared.status.send_modify(|s| {
            s.connected = false;
            s.disconnected = true;
        });
        tracing::debug!(conn_id = conn.id(), "disconnected from server");
        shared.handlers.emit_disconnected(Some(conn));

        if shared.auto_reconnect {
            let mut slot = shared.dialer_slot();
            if shared.running.load(Ordering::Acquire) {
                tracing::debug!(pipe = %shared.server_name, "reconnecting");
                *slot = Some(spawn_dial(&shared));
            }
        }
    }
}

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder<C: Codec> {
    server_name: String,
    name: Option<String>,
    codec: C,
    handlers: HandlerRegistry<C>,
    dial: DialConfig,
    connection_config: ConnectionConfig,
    auto_reconnect: bool,
    stop_timeout: Duration,
}

impl<C: Codec> ClientBuilder<C> {
    /// Create a builder for a client of the server at `server_name`.
    pub fn new(server_name: impl Into<String>, codec: C) -> Self {
        Self {
            server_name: server_name.into(),
            name: None,
            codec,
            handlers: HandlerRegistry::new(),
            dial: DialConfig::default(),
            connection_config: ConnectionConfig::default(),
            auto_reconnect: false,
            stop_timeout: DEFAULT_CLIENT_STOP_TIMEOUT,
        }
    }

    /// Display name of the client-side connection.
    ///
    /// Default: `"Client {id}"`
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Register a connected handler.
    pub fn on_connected<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<Connection<C>>) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.on_connected(handler);
        self
    }

    /// Register a message handler.
    pub fn on_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Arc<Connection<C>>, &C::Item) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.on_message(handler);
        self
    }

    /// Register a disconnected handler.
    pub fn on_disconnected<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&Arc<Connection<C>>>) -> HandlerResult + Send + Sync + 'static,
    {
        self.handlers.on_disconnected(handler);
        self
    }

    /// Register an error handler.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&Arc<Connection<C>>>, &PipeplexError) + Send + Sync + 'static,
    {
        self.handlers.on_error(handler);
        self
    }

    /// Replace all handlers with a prepared registry.
    pub fn handlers(mut self, handlers: HandlerRegistry<C>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Replace the dial timing.
    pub fn dial_config(mut self, config: DialConfig) -> Self {
        self.dial = config;
        self
    }

    /// Set the existence polling interval.
    ///
    /// Default: 10 milliseconds
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.dial.poll_interval = interval;
        self
    }

    /// Set the bound on connecting to the private name.
    ///
    /// Default: 1 second
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.dial.connect_timeout = timeout;
        self
    }

    /// Set the configuration applied to the connection.
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    /// Dial again after the server closes the connection.
    ///
    /// Default: off
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the bound on waiting for loops during stop.
    ///
    /// Default: 2 seconds
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Build the client without starting it.
    pub fn build(self) -> Client<C> {
        let (status, _) = watch::channel(DialStatus::STOPPED);
        Client {
            shared: Arc::new(ClientShared {
                server_name: self.server_name,
                name: self.name,
                codec: Arc::new(self.codec),
                handlers: self.handlers,
                dial: self.dial,
                connection_config: self.connection_config,
                auto_reconnect: self.auto_reconnect,
                stop_timeout: self.stop_timeout,
                running: AtomicBool::new(false),
                status,
                connection: Mutex::new(None),
                dialer: Mutex::new(None),
            }),
        }
    }

    /// Build and start the client.
    pub fn start(self) -> Client<C> {
        let client = self.build();
        client.start();
        client
    }
}

/// A pipe client holding at most one connection.
pub struct Client<C: Codec> {
    shared: Arc<ClientShared<C>>,
}

impl<C: Codec> Client<C> {
    /// Create a new client builder.
    pub fn builder(server_name: impl Into<String>, codec: C) -> ClientBuilder<C> {
        ClientBuilder::new(server_name, codec)
    }

    /// Well-known name of the server this client dials.
    pub fn server_name(&self) -> &str {
        &self.shared.server_name
    }

    /// Configured display name, if any.
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// Spawn the dial loop. Does nothing if already started.
    pub fn start(&self) {
        let mut slot = self.shared.dialer_slot();
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.status.send_replace(DialStatus::STARTED);
        *slot = Some(spawn_dial(&self.shared));
        tracing::debug!(pipe = %self.shared.server_name, "client started");
    }

    /// Cancel dialing and close the connection.
    pub async fn stop(&self) {
        let worker = {
            let mut slot = self.shared.dialer_slot();
            if !self.shared.running.swap(false, Ordering::AcqRel) {
                return;
            }
            slot.take()
        };

        if let Some(worker) = worker {
            worker.stop(self.shared.stop_timeout).await;
        }
        let conn = self.shared.connection_slot().take();
        if let Some(conn) = conn {
            if !conn.shutdown(self.shared.stop_timeout).await {
                tracing::warn!(conn_id = conn.id(), "connection loops aborted");
            }
        }
        self.shared.status.send_modify(|s| {
            s.connected = false;
            s.stopped = true;
        });
        tracing::debug!(pipe = %self.shared.server_name, "client stopped");
    }

    /// The current connection, if connected.
    pub fn connection(&self) -> Option<Arc<Connection<C>>> {
        self.shared.connection_slot().clone()
    }

    /// True while a connection is open.
    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|c| c.is_connected())
    }

    /// Queue a message to the server. A silent no-op while not connected.
    pub fn push_message(&self, message: C::Item) {
        if let Some(conn) = self.connection() {
            conn.push_message(message);
        }
    }

    async fn wait_status(
        &self,
        timeout: Option<Duration>,
        done: impl Fn(&DialStatus) -> bool,
    ) -> bool {
        let mut rx = self.shared.status.subscribe();
        let wait = rx.wait_for(|s| done(s) || s.stopped);
        let reached = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(Ok(status)) => done(&*status),
                _ => false,
            },
            None => match wait.await {
                Ok(status) => done(&*status),
                Err(_) => false,
            },
        };
        reached
    }

    /// Wait until connected. Returns `false` if the client is stopped first.
    pub async fn wait_for_connection(&self) -> bool {
        self.wait_status(None, |s| s.connected).await
    }

    /// Wait up to `millis` milliseconds for a connection.
    pub async fn wait_for_connection_ms(&self, millis: u64) -> bool {
        self.wait_for_connection_timeout(Duration::from_millis(millis))
            .await
    }

    /// Wait up to `timeout` for a connection.
    pub async fn wait_for_connection_timeout(&self, timeout: Duration) -> bool {
        self.wait_status(Some(timeout), |s| s.connected).await
    }

    /// Wait until the connection closes. Returns `false` if the client is
    /// stopped without having been disconnected.
    pub async fn wait_for_disconnection(&self) -> bool {
        self.wait_status(None, |s| s.disconnected).await
    }

    /// Wait up to `millis` milliseconds for the connection to close.
    pub async fn wait_for_disconnection_ms(&self, millis: u64) -> bool {
        self.wait_for_disconnection_timeout(Duration::from_millis(millis))
            .await
    }

    /// Wait up to `timeout` for the connection to close.
    pub async fn wait_for_disconnection_timeout(&self, timeout: Duration) -> bool {
        self.wait_status(Some(timeout), |s| s.disconnected).await
    }
}

impl<C: Codec> Drop for Client<C> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.shared.dialer_slot().take() {
            worker.cancel();
        }
        let conn = self.shared.connection_slot().take();
        if let Some(conn) = conn {
            conn.close();
        }
    }
}

impl<C: Codec> std::fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_name", &self.shared.server_name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TextCodec;

    #[test]
    fn test_connection_id_from_private_name() {
        assert_eq!(connection_id("chat_room_12"), 12);
        assert_eq!(connection_id("chat_1"), 1);
        assert_eq!(connection_id("chat"), 0);
        assert_eq!(connection_id("chat_x"), 0);
    }

    #[tokio::test]
    async fn test_wait_before_start_returns_false() {
        let client = Client::builder("pipeplex-never-started", TextCodec).build();
        assert!(!client.wait_for_connection().await);
        assert!(!client.wait_for_disconnection_ms(10).await);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_server() {
        let name = format!("pipeplex-client-absent-{}", std::process::id());
        let client = Client::builder(name, TextCodec).start();

        assert!(!client.wait_for_connection_ms(50).await);
        assert!(!client.is_connected());
        // Not connected yet: dropped silently.
        client.push_message("ignored".into());

        client.stop().await;
        assert!(!client.wait_for_connection().await);
    }

    #[tokio::test]
    async fn test_stop_releases_pending_wait() {
        let name = format!("pipeplex-client-stopwait-{}", std::process::id());
        let client = Arc::new(Client::builder(name, TextCodec).start());

        let waiter = client.clone();
        let wait = tokio::spawn(async move { waiter.wait_for_connection().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.stop().await;

        assert!(!wait.await.unwrap());
    }

    #[test]
    fn test_builder_defaults() {
        let client = Client::builder("x", TextCodec).name("worker").build();
        assert_eq!(client.server_name(), "x");
        assert_eq!(client.name(), Some("worker"));
        assert!(!client.is_connected());
    }
}
