//! Client half of the rendezvous handshake.
//!
//! ```text
//! poll exists(name) ──► connect(name) ──► receive private name ──► close
//!                                                  │
//!                      connect_timeout(private) ◄──┘
//! ```
//!
//! Every wait races the cancellation token. A connect call that is already
//! in flight is bounded by its own timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::codec::TextCodec;
use crate::error::{PipeplexError, Result};
use crate::protocol::FramedChannel;
use crate::transport::{self, PipeStream};

/// Default interval between existence probes of the well-known name.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default bound on connecting to the private name.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Handshake frames only carry a pipe name.
const HANDSHAKE_MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Timing of the client dial sequence.
#[derive(Debug, Clone)]
pub struct DialConfig {
    /// Interval between existence probes of the well-known name.
    pub poll_interval: Duration,
    /// Bound on connecting to the private name.
    pub connect_timeout: Duration,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Run the handshake against `name` and return the private stream and its name.
///
/// Polls until the server exists; returns `Cancelled` once `cancel` fires.
pub(crate) async fn dial(
    name: &str,
    config: &DialConfig,
    cancel: &CancellationToken,
) -> Result<(PipeStream, String)> {
    let handshake = wait_and_connect(name, config, cancel).await?;

    let mut channel = FramedChannel::with_max_frame_size(
        handshake,
        Arc::new(TextCodec),
        HANDSHAKE_MAX_FRAME_SIZE,
    );
    let received = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PipeplexError::Cancelled),
        r = channel.receive() => r?,
    };
    let private_name = received.ok_or_else(|| {
        PipeplexError::Protocol("handshake closed before the private name arrived".into())
    })?;
    // The server already tore down its side; a failed shutdown is expected.
    let _ = channel.close().await;
    tracing::debug!(pipe = %private_name, "received private pipe name");

    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PipeplexError::Cancelled),
        r = PipeStream::connect_timeout(&private_name, config.connect_timeout, config.poll_interval) => r?,
    };
    Ok((stream, private_name))
}

async fn wait_and_connect(
    name: &str,
    config: &DialConfig,
    cancel: &CancellationToken,
) -> Result<PipeStream> {
    loop {
        if cancel.is_cancelled() {
            return Err(PipeplexError::Cancelled);
        }
        if transport::exists(name) {
            match PipeStream::connect(name).await {
                Ok(stream) => return Ok(stream),
                Err(PipeplexError::Io(e)) if transport::is_not_ready(&e) => {
                    tracing::trace!(pipe = name, error = %e, "server not ready");
                }
                Err(e) => return Err(e),
            }
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipeplexError::Cancelled),
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }
}
