//! Multi-client server over a single-client pipe primitive.
//!
//! The [`ServerBuilder`] collects the codec, handlers and configuration.
//! The [`Server`] manages the lifecycle:
//! 1. Bind the well-known name
//! 2. Accept, hand out a private name, accept again on it (see `acceptor`)
//! 3. Register the connection and run its loops
//! 4. On stop, unblock the accept loop and close every connection
//!
//! # Example
//!
//! ```ignore
//! use pipeplex::codec::TextCodec;
//! use pipeplex::Server;
//!
//! #[tokio::main]
//! async fn main() -> pipeplex::Result<()> {
//!     let server = Server::builder("demo", TextCodec)
//!         .on_message(|conn, msg: &String| {
//!             conn.push_message(msg.to_uppercase());
//!             Ok(())
//!         })
//!         .start()?;
//!
//!     server.push_message("hello".to_string());
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

mod acceptor;
mod registry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::client::dialer::{self, DialConfig};
use crate::codec::Codec;
use crate::connection::{Connection, ConnectionConfig, ConnectionObserver};
use crate::error::{PipeplexError, Result};
use crate::handler::{HandlerRegistry, HandlerResult};
use crate::transport::{ListenOptions, PipeListener};
use crate::worker::BackgroundWorker;

use registry::ConnectionRegistry;

/// Default bound on the self-dial issued by [`ShutdownStrategy::SelfDial`].
pub const DEFAULT_SELF_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on waiting for loops to exit during stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on each handshake step.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pause after a failed accept on the well-known name.
pub const DEFAULT_ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// How `stop()` unblocks the accept loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownStrategy {
    /// Race the accept against a cancellation token.
    #[default]
    Cancel,
    /// Treat the accept as uninterruptible and wake it by dialing the
    /// server's own well-known name.
    SelfDial,
}

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Default: [`ShutdownStrategy::Cancel`]
    pub shutdown: ShutdownStrategy,
    /// Default: 2 seconds
    pub self_dial_timeout: Duration,
    /// Default: 2 seconds
    pub stop_timeout: Duration,
    /// Bound on sending the private name and on the private accept.
    /// Default: 5 seconds
    pub handshake_timeout: Duration,
    /// Default: 10 milliseconds
    pub accept_retry_delay: Duration,
    /// Passed through to every listener the server binds.
    pub listen: ListenOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown: ShutdownStrategy::default(),
            self_dial_timeout: DEFAULT_SELF_DIAL_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            accept_retry_delay: DEFAULT_ACCEPT_RETRY_DELAY,
            listen: ListenOptions::default(),
        }
    }
}

/// State shared by the server handle, the accept loop and connection observers.
pub(crate) struct Shared<C: Codec> {
    name: String,
    codec: Arc<C>,
    handlers: HandlerRegistry<C>,
    config: ServerConfig,
    connection_config: ConnectionConfig,
    registry: ConnectionRegistry<C>,
    running: AtomicBool,
    /// Accept attempts so far; never reset, so ids stay unique across restarts.
    sequence: AtomicU64,
}

/// Routes connection events to the registry and the user's handlers.
pub(crate) struct ServerObserver<C: Codec> {
    shared: Weak<Shared<C>>,
}

impl<C: Codec> ConnectionObserver<C> for ServerObserver<C> {
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
        if let Some(shared) = self.shared.upgrade() {
            shared.registry.remove(conn.id());
            tracing::debug!(conn_id = conn.id(), "client disconnected");
            shared.handlers.emit_disconnected(Some(conn));
        }
    }
}

/// Builder for configuring and creating a [`Server`].
pub struct ServerBuilder<C: Codec> {
    name: String,
    codec: C,
    handlers: HandlerRegistry<C>,
    config: ServerConfig,
    connection_config: ConnectionConfig,
}

impl<C: Codec> ServerBuilder<C> {
    /// Create a builder for a server on the well-known `name`.
    pub fn new(name: impl Into<String>, codec: C) -> Self {
        Self {
            name: name.into(),
            codec,
            handlers: HandlerRegistry::new(),
            config: ServerConfig::default(),
            connection_config: ConnectionConfig::default(),
        }
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

    /// Replace the server configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the shutdown strategy.
    ///
    /// Default: [`ShutdownStrategy::Cancel`]
    pub fn shutdown(mut self, strategy: ShutdownStrategy) -> Self {
        self.config.shutdown = strategy;
        self
    }

    /// Set the access-control options passed to every listener.
    pub fn listen_options(mut self, options: ListenOptions) -> Self {
        self.config.listen = options;
        self
    }

    /// Set the configuration applied to each accepted connection.
    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.connection_config = config;
        self
    }

    /// Build the server without starting it.
    pub fn build(self) -> Server<C> {
        Server {
            shared: Arc::new(Shared {
                name: self.name,
                codec: Arc::new(self.codec),
                handlers: self.handlers,
                config: self.config,
                connection_config: self.connection_config,
                registry: ConnectionRegistry::new(),
                running: AtomicBool::new(false),
                sequence: AtomicU64::new(0),
            }),
            acceptor: Mutex::new(None),
        }
    }

    /// Build and start the server.
    pub fn start(self) -> Result<Server<C>> {
        let server = self.build();
        server.start()?;
        Ok(server)
    }
}

/// A running (or startable) pipe server.
pub struct Server<C: Codec> {
    shared: Arc<Shared<C>>,
    acceptor: Mutex<Option<BackgroundWorker>>,
}

impl<C: Codec> Server<C> {
    /// Create a new server builder.
    pub fn builder(name: impl Into<String>, codec: C) -> ServerBuilder<C> {
        ServerBuilder::new(name, codec)
    }

    /// Well-known name clients dial.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// True between `start()` and `stop()`.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Bind the well-known name and spawn the accept loop.
    ///
    /// Bind failures are returned here. Calling `start` on a running server
    /// does nothing.
    pub fn start(&self) -> Result<()> {
        let mut slot = self
            .acceptor
            .lock()
            .map_err(|_| PipeplexError::Protocol("server state poisoned".into()))?;
        if slot.is_some() {
            tracing::debug!(pipe = %self.shared.name, "server already running");
            return Ok(());
        }

        let listener = PipeListener::bind(&self.shared.name, &self.shared.config.listen)?;
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        *slot = Some(BackgroundWorker::spawn(
            format!("accept-{}", self.shared.name),
            move |cancel| acceptor::accept_loop(shared, listener, cancel),
        ));
        tracing::debug!(pipe = %self.shared.name, "server started");
        Ok(())
    }

    /// Stop accepting and close every connection.
    ///
    /// Returns after the accept loop has exited and every registered
    /// connection has reached `Closed`. Calling `stop` on a stopped server
    /// does nothing.
    pub async fn stop(&self) {
        let worker = match self.acceptor.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(worker) = worker else {
            return;
        };

        tracing::debug!(pipe = %self.shared.name, strategy = ?self.shared.config.shutdown, "stopping server");
        self.shared.running.store(false, Ordering::Release);
        let config = &self.shared.config;

        if config.shutdown == ShutdownStrategy::SelfDial {
            let name = self.shared.name.clone();
            let dial_config = DialConfig {
                connect_timeout: config.self_dial_timeout,
                ..DialConfig::default()
            };
            let self_dial = BackgroundWorker::spawn("self-dial", move |cancel| async move {
                // Either outcome is fine: the accept loop woke up or a real
                // client got there first.
                if let Err(e) = dialer::dial(&name, &dial_config, &cancel).await {
                    tracing::debug!(pipe = %name, error = %e, "self-dial ended");
                }
                Ok(())
            });
            self_dial.wait(config.self_dial_timeout).await;
            self.close_all().await;
            if !self_dial.stop(config.self_dial_timeout).await {
                tracing::debug!("self-dial did not finish in time");
            }
        }

        if !worker.stop(config.stop_timeout).await {
            tracing::warn!(pipe = %self.shared.name, "accept loop aborted");
        }
        self.close_all().await;
        tracing::debug!(pipe = %self.shared.name, "server stopped");
    }

    /// Close every registered connection and wait for its loops, bounded.
    async fn close_all(&self) {
        let connections = self.shared.registry.drain();
        for conn in &connections {
            conn.close();
        }
        let deadline = Instant::now() + self.shared.config.stop_timeout;
        for conn in &connections {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !conn.shutdown(remaining).await {
                tracing::warn!(conn_id = conn.id(), "connection loops aborted");
            }
        }
    }

    /// Snapshot of the live connections in id order.
    pub fn connections(&self) -> Vec<Arc<Connection<C>>> {
        self.shared.registry.snapshot()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Look up a live connection by id.
    pub fn get(&self, id: u64) -> Option<Arc<Connection<C>>> {
        self.shared.registry.get(id)
    }
}

impl<C: Codec> Server<C>
where
    C::Item: Clone,
{
    /// Broadcast to every live connection. Returns how many accepted it.
    pub fn push_message(&self, message: C::Item) -> usize {
        self.shared.registry.broadcast(&message)
    }

    /// Send to connection `id`; a no-op if it is not registered.
    pub fn push_message_to(&self, id: u64, message: C::Item) -> usize {
        self.shared.registry.push_to(id, &message)
    }

    /// Send to each listed id that is registered.
    pub fn push_message_to_ids(&self, ids: &[u64], message: C::Item) -> usize {
        self.shared.registry.push_to_ids(ids, &message)
    }

    /// Send to the first connection (lowest id) with the given name.
    pub fn push_message_to_name(&self, name: &str, message: C::Item) -> usize {
        self.shared.registry.push_to_name(name, &message)
    }

    /// Send to the first connection matching each listed name.
    pub fn push_message_to_names<S: AsRef<str>>(&self, names: &[S], message: C::Item) -> usize {
        self.shared.registry.push_to_names(names, &message)
    }
}

impl<C: Codec> Drop for Server<C> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.acceptor.lock() {
            if let Some(worker) = slot.take() {
                self.shared.running.store(false, Ordering::Release);
                worker.abort();
            }
        }
        for conn in self.shared.registry.drain() {
            conn.close();
        }
    }
}

impl<C: Codec> std::fmt::Debug for Server<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.shared.name)
            .field("running", &self.is_running())
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TextCodec;
    use std::sync::atomic::AtomicUsize;

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "pipeplex-server-{}-{}-{}",
            tag,
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[tokio::test]
    async fn test_start_binds_and_stop_releases() {
        let name = unique_name("lifecycle");
        let server = Server::builder(name.clone(), TextCodec).build();
        assert!(!server.is_running());

        server.start().unwrap();
        assert!(server.is_running());
        assert!(crate::transport::exists(&name));

        server.stop().await;
        assert!(!server.is_running());
        assert!(!crate::transport::exists(&name));
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let server = Server::builder(unique_name("twice"), TextCodec)
            .start()
            .unwrap();
        server.start().unwrap();
        assert!(server.is_running());
        server.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_self_dial_unblocks_accept() {
        let server = Server::builder(unique_name("selfdial"), TextCodec)
            .shutdown(ShutdownStrategy::SelfDial)
            .start()
            .unwrap();

        let stopped = tokio::time::timeout(Duration::from_secs(5), server.stop()).await;
        assert!(stopped.is_ok());
        assert!(!server.is_running());
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_handshake_via_dialer() {
        let name = unique_name("handshake");
        let server = Server::builder(name.clone(), TextCodec).start().unwrap();

        let (_stream, private) =
            dialer::dial(&name, &DialConfig::default(), &tokio_util::sync::CancellationToken::new())
                .await
                .unwrap();
        assert_eq!(private, format!("{}_1", name));

        for _ in 0..100 {
            if server.connection_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let conn = server.get(1).unwrap();
        assert_eq!(conn.name(), "Client 1");

        server.stop().await;
        assert_eq!(conn.state(), crate::connection::ConnectionState::Closed);
    }
}
