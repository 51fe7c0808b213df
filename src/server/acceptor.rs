//! Server half of the rendezvous handshake and the accept loop.
//!
//! Per iteration:
//!
//! ```text
//! Listening ──accept(well-known)──► Handshaking ──send private name──► PrivateAccept
//!     ▲                                                                    │
//!     └──────────── Registered ◄──── insert + open + connected ◄───────────┘
//! ```
//!
//! Any failing step emits an error and a disconnect with no connection, and
//! the loop continues with the next client.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{ServerObserver, ShutdownStrategy, Shared};
use crate::codec::{Codec, TextCodec};
use crate::connection::Connection;
use crate::error::{PipeplexError, Result};
use crate::protocol::FramedChannel;
use crate::transport::{PipeListener, PipeStream};

pub(crate) async fn accept_loop<C: Codec>(
    shared: Arc<Shared<C>>,
    listener: PipeListener,
    cancel: CancellationToken,
) -> Result<()> {
    // With SelfDial the well-known accept is treated as uninterruptible and
    // only a client connection wakes it.
    let cancellable = shared.config.shutdown == ShutdownStrategy::Cancel;

    loop {
        if cancel.is_cancelled() || !shared.running.load(Ordering::Acquire) {
            break;
        }

        let accepted = if cancellable {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                r = listener.accept() => r,
            }
        } else {
            listener.accept().await
        };

        let seq = shared.sequence.fetch_add(1, Ordering::AcqRel) + 1;

        if !shared.running.load(Ordering::Acquire) {
            tracing::debug!(seq, "server stopping, dropping accepted stream");
            break;
        }

        let handshake = match accepted {
            Ok(stream) => stream,
            Err(e) => {
                failed(&shared, seq, e);
                // Keep a persistent accept failure from spinning.
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.accept_retry_delay) => {}
                }
                continue;
            }
        };

        let private_name = format!("{}_{}", shared.name, seq);
        match rendezvous(&shared, handshake, &private_name, &cancel).await {
            Ok(stream) => {
                if let Err(e) = register(&shared, seq, &private_name, stream) {
                    if matches!(e, PipeplexError::Cancelled) {
                        break;
                    }
                    failed(&shared, seq, e);
                }
            }
            Err(PipeplexError::Cancelled) => break,
            Err(e) => failed(&shared, seq, e),
        }
    }

    tracing::debug!(pipe = %shared.name, "accept loop exited");
    Ok(())
}

/// Hand the client its private name and accept it there.
async fn rendezvous<C: Codec>(
    shared: &Shared<C>,
    handshake: PipeStream,
    private_name: &str,
    cancel: &CancellationToken,
) -> Result<PipeStream> {
    // Bound before the name is revealed so the client never races the bind.
    let private = PipeListener::bind(private_name, &shared.config.listen)?;
    let timeout = shared.config.handshake_timeout;

    let send = async {
        let mut channel = FramedChannel::new(handshake, Arc::new(TextCodec));
        channel.send(&private_name.to_string()).await?;
        channel.drain().await?;
        channel.close().await
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PipeplexError::Cancelled),
        r = tokio::time::timeout(timeout, send) => {
            r.map_err(|_| PipeplexError::Timeout("handshake send"))??
        }
    }
    tracing::debug!(pipe = private_name, "private pipe name sent");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipeplexError::Cancelled),
        r = tokio::time::timeout(timeout, private.accept()) => {
            r.map_err(|_| PipeplexError::Timeout("private accept"))?
        }
    }
}

fn register<C: Codec>(
    shared: &Arc<Shared<C>>,
    id: u64,
    private_name: &str,
    stream: PipeStream,
) -> Result<()> {
    if !shared.running.load(Ordering::Acquire) {
        return Err(PipeplexError::Cancelled);
    }

    let observer = Arc::new(ServerObserver {
        shared: Arc::downgrade(shared),
    });
    let conn = Connection::new(
        id,
        format!("Client {}", id),
        shared.codec.clone(),
        shared.connection_config.clone(),
        observer,
    );

    shared.registry.insert(conn.clone());
    if let Err(e) = conn.open(stream) {
        shared.registry.remove(id);
        return Err(e);
    }

    tracing::debug!(conn_id = id, pipe = private_name, "client connected");
    shared.handlers.emit_connected(&conn);
    Ok(())
}

fn failed<C: Codec>(shared: &Shared<C>, seq: u64, error: PipeplexError) {
    tracing::warn!(seq, error = %error, "client accept failed");
    shared.handlers.emit_error(None, &error);
    shared.handlers.emit_disconnected(None);
}
