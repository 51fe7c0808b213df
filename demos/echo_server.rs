//! Echo server: replies to every message and announces joins to everyone.
//!
//! ```text
//! RUST_LOG=pipeplex=debug cargo run --example echo_server -- demo
//! ```

use std::sync::{Arc, Weak};

use pipeplex::codec::TextCodec;
use pipeplex::Server;
use tokio::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> pipeplex::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let name = std::env::args().nth(1).unwrap_or_else(|| "demo".to_string());

    // Handlers need the server to broadcast; it exists only after build.
    let handle: Arc<OnceCell<Weak<Server<TextCodec>>>> = Arc::new(OnceCell::new());
    let joined = handle.clone();

    let server = Arc::new(
        Server::builder(name.clone(), TextCodec)
            .on_connected(move |conn| {
                tracing::info!(conn_id = conn.id(), "client joined");
                if let Some(server) = joined.get().and_then(Weak::upgrade) {
                    server.push_message(format!("{} joined", conn.name()));
                }
                Ok(())
            })
            .on_message(|conn, msg| {
                tracing::info!(conn_id = conn.id(), %msg, "received");
                conn.push_message(format!("echo: {}", msg));
                Ok(())
            })
            .on_disconnected(|conn| {
                match conn {
                    Some(conn) => tracing::info!(conn_id = conn.id(), "client left"),
                    None => tracing::warn!("handshake attempt failed"),
                }
                Ok(())
            })
            .on_error(|conn, err| {
                tracing::warn!(conn_id = ?conn.map(|c| c.id()), error = %err, "server error");
            })
            .build(),
    );
    let _ = handle.set(Arc::downgrade(&server));

    server.start()?;
    tracing::info!(pipe = %name, "echo server listening, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    server.stop().await;
    Ok(())
}
