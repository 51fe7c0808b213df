//! One live session over a private pipe.
//!
//! A [`Connection`] owns the framed stream for one peer and runs two loops
//! against it: a receive loop that decodes inbound frames and a send loop
//! (the dedicated writer from [`crate::writer`]) that drains the outbound
//! queue. Both loops are [`BackgroundWorker`]s driven by child tokens of the
//! connection's own token.
//!
//! # Lifecycle
//!
//! ```text
//! Opening ──open()──► Open ──close() / EOF / transport error──► Closing ──► Closed
//! ```
//!
//! The transition to `Closing` is a compare-and-swap, so of the concurrent
//! close triggers exactly one runs teardown and exactly one disconnect
//! notification fires.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::error::{PipeplexError, Result};
use crate::protocol::{FrameReader, FramedChannel, DEFAULT_MAX_FRAME_SIZE};
use crate::worker::BackgroundWorker;
use crate::writer::{writer_channel, writer_loop, WriterHandle, WriterQueue};

/// What the receive loop does with a frame that fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeErrorPolicy {
    /// Report the error and continue with the next frame.
    #[default]
    Skip,
    /// Report the error and close the connection.
    Close,
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest accepted frame payload, in bytes.
    pub max_frame_size: u32,
    /// Outbound queue limit. `None` keeps the queue unbounded.
    pub max_pending_messages: Option<usize>,
    /// Handling of undecodable inbound frames.
    pub decode_error_policy: DecodeErrorPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_pending_messages: None,
            decode_error_policy: DecodeErrorPolicy::Skip,
        }
    }
}

impl ConnectionConfig {
    /// Set the maximum frame size.
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Bound the outbound queue; overflowing messages are dropped.
    pub fn max_pending_messages(mut self, limit: usize) -> Self {
        self.max_pending_messages = Some(limit);
        self
    }

    /// Set the decode error policy.
    pub fn decode_error_policy(mut self, policy: DecodeErrorPolicy) -> Self {
        self.decode_error_policy = policy;
        self
    }
}

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Opening = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Opening,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Receives the events of a connection's loops.
///
/// Implemented by the server (registry bookkeeping) and the client (dial
/// status); both forward to the user's handlers.
pub(crate) trait ConnectionObserver<C: Codec>: Send + Sync + 'static {
    fn on_message(&self, conn: &Arc<Connection<C>>, message: C::Item);
    fn on_error(&self, conn: &Arc<Connection<C>>, error: PipeplexError);
    fn on_closed(&self, conn: &Arc<Connection<C>>);
}

#[cfg(test)]
struct Detached;

#[cfg(test)]
impl<C: Codec> ConnectionObserver<C> for Detached {
    fn on_message(&self, _: &Arc<Connection<C>>, _: C::Item) {}
    fn on_error(&self, _: &Arc<Connection<C>>, _: PipeplexError) {}
    fn on_closed(&self, _: &Arc<Connection<C>>) {}
}

/// A bidirectional typed session with one peer.
pub struct Connection<C: Codec> {
    id: u64,
    name: RwLock<String>,
    state: AtomicU8,
    codec: Arc<C>,
    config: ConnectionConfig,
    writer: WriterHandle<C::Item>,
    queue: Mutex<Option<WriterQueue<C::Item>>>,
    cancel: CancellationToken,
    observer: Arc<dyn ConnectionObserver<C>>,
    workers: Mutex<Vec<Arc<BackgroundWorker>>>,
}

impl<C: Codec> Connection<C> {
    pub(crate) fn new(
        id: u64,
        name: String,
        codec: Arc<C>,
        config: ConnectionConfig,
        observer: Arc<dyn ConnectionObserver<C>>,
    ) -> Arc<Self> {
        let (writer, queue) = writer_channel(config.max_pending_messages);
        Arc::new(Self {
            id,
            name: RwLock::new(name),
            state: AtomicU8::new(ConnectionState::Opening as u8),
            codec,
            config,
            writer,
            queue: Mutex::new(Some(queue)),
            cancel: CancellationToken::new(),
            observer,
            workers: Mutex::new(Vec::new()),
        })
    }

    /// A connection with no loops and no observer, used in unit tests.
    #[cfg(test)]
    pub(crate) fn detached(id: u64, codec: Arc<C>, config: ConnectionConfig) -> Arc<Self> {
        Self::new(id, format!("Client {}", id), codec, config, Arc::new(Detached))
    }

    /// Start the receive and send loops over `stream`.
    ///
    /// Fails with `ConnectionClosed` if the connection was closed or already
    /// opened; the stream is dropped in that case.
    pub(crate) fn open<S>(self: &Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let queue = match self.queue.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let queue = queue.ok_or(PipeplexError::ConnectionClosed)?;

        let opened = self.state.compare_exchange(
            ConnectionState::Opening as u8,
            ConnectionState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if opened.is_err() {
            return Err(PipeplexError::ConnectionClosed);
        }

        let channel = FramedChannel::with_max_frame_size(
            stream,
            self.codec.clone(),
            self.config.max_frame_size,
        );
        let (reader, writer) = channel.into_split();

        let conn = self.clone();
        let receiver = BackgroundWorker::spawn_with_token(
            format!("conn-{}-recv", self.id),
            self.cancel.child_token(),
            move |cancel| conn.receive_loop(reader, cancel),
        );

        let conn = self.clone();
        let sender = BackgroundWorker::spawn_with_token(
            format!("conn-{}-send", self.id),
            self.cancel.child_token(),
            move |cancel| async move {
                let notify = conn.clone();
                let result = writer_loop(queue, writer, cancel, move |e| {
                    notify.observer.on_error(&notify, e)
                })
                .await;
                if let Err(e) = result {
                    if !conn.is_closing() {
                        tracing::error!(conn_id = conn.id, error = %e, "send loop failed");
                        conn.observer.on_error(&conn, e);
                    }
                    conn.close();
                }
                Ok(())
            },
        );

        if let Ok(mut workers) = self.workers.lock() {
            workers.push(Arc::new(receiver));
            workers.push(Arc::new(sender));
        }

        tracing::debug!(conn_id = self.id, "connection open");
        Ok(())
    }

    async fn receive_loop<R>(
        self: Arc<Self>,
        mut reader: FrameReader<R, C>,
        cancel: CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = reader.receive() => r,
            };

            match result {
                Ok(Some(message)) => self.observer.on_message(&self, message),
                Ok(None) => {
                    tracing::debug!(conn_id = self.id, "peer closed the stream");
                    break;
                }
                Err(e) if self.is_closing() => {
                    tracing::debug!(conn_id = self.id, error = %e, "receive ended during close");
                    break;
                }
                Err(e)
                    if e.is_serialization()
                        && self.config.decode_error_policy == DecodeErrorPolicy::Skip =>
                {
                    tracing::warn!(conn_id = self.id, error = %e, "skipping undecodable message");
                    self.observer.on_error(&self, e);
                }
                Err(e) => {
                    tracing::debug!(conn_id = self.id, error = %e, "receive loop failed");
                    self.observer.on_error(&self, e);
                    break;
                }
            }
        }

        self.close();
        Ok(())
    }

    /// Server-assigned identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Display name; not unique.
    pub fn name(&self) -> String {
        match self.name.read() {
            Ok(name) => name.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the display name.
    pub fn set_name(&self, name: impl Into<String>) {
        let name = name.into();
        match self.name.write() {
            Ok(mut slot) => *slot = name,
            Err(poisoned) => *poisoned.into_inner() = name,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while the connection is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn is_closing(&self) -> bool {
        self.state.load(Ordering::Acquire) >= ConnectionState::Closing as u8
    }

    /// Messages queued but not yet written.
    pub fn pending_messages(&self) -> usize {
        self.writer.pending_count()
    }

    /// True while the outbound queue limit is reached.
    pub fn is_backpressure_active(&self) -> bool {
        self.writer.is_backpressure_active()
    }

    /// Queue a message for the send loop and return immediately.
    ///
    /// After close this is a no-op. When the outbound queue limit is reached
    /// the message is dropped and a `QueueFull` error notification fires.
    pub fn push_message(self: &Arc<Self>, message: C::Item) {
        if let Err(e) = self.enqueue(message) {
            self.report(e);
        }
    }

    /// Queue without notifying; only `QueueFull` is returned as an error.
    pub(crate) fn enqueue(&self, message: C::Item) -> Result<()> {
        if self.is_closing() {
            return Ok(());
        }
        match self.writer.push(message) {
            Ok(()) => Ok(()),
            Err(PipeplexError::QueueFull) => {
                tracing::warn!(
                    conn_id = self.id,
                    pending = self.writer.pending_count(),
                    "outbound queue full, dropping message"
                );
                Err(PipeplexError::QueueFull)
            }
            Err(e) => {
                tracing::debug!(conn_id = self.id, error = %e, "push after close");
                Ok(())
            }
        }
    }

    /// Raise an error notification for this connection.
    pub(crate) fn report(self: &Arc<Self>, error: PipeplexError) {
        self.observer.on_error(self, error);
    }

    /// Close the connection. Idempotent; teardown and the disconnect
    /// notification happen exactly once.
    pub fn close(self: &Arc<Self>) {
        let won = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < ConnectionState::Closing as u8).then_some(ConnectionState::Closing as u8)
            })
            .is_ok();
        if !won {
            return;
        }

        tracing::debug!(conn_id = self.id, "closing connection");
        self.cancel.cancel();
        if let Ok(mut slot) = self.queue.lock() {
            slot.take();
        }
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.observer.on_closed(self);
    }

    /// Wait up to `timeout` for both loops to exit. Returns `true` if they did.
    ///
    /// Must not be called from inside a message handler of this connection.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let workers: Vec<Arc<BackgroundWorker>> = match self.workers.lock() {
            Ok(workers) => workers.clone(),
            Err(_) => return false,
        };
        let deadline = Instant::now() + timeout;
        let mut all = true;
        for worker in workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !worker.wait(remaining).await {
                all = false;
            }
        }
        all
    }

    /// Cancel the loops, wait up to `timeout`, then abort any still running.
    pub(crate) async fn shutdown(self: &Arc<Self>, timeout: Duration) -> bool {
        self.close();
        if self.wait_closed(timeout).await {
            return true;
        }
        if let Ok(workers) = self.workers.lock() {
            for worker in workers.iter() {
                worker.abort();
            }
        }
        false
    }
}

impl<C: Codec> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}
