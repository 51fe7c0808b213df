//! # pipeplex
//!
//! Multi-client typed messaging over local pipes.
//!
//! A local pipe listener (Unix domain socket, Windows named pipe) is bound
//! to a well-known name. `pipeplex` turns it into a session service: every
//! client that dials the well-known name is handed a private pipe over a
//! short rendezvous handshake and then talks to the server on that private
//! pipe, so any number of clients hold independent bidirectional sessions.
//!
//! ## Architecture
//!
//! - **Rendezvous** (well-known pipe): one UTF-8 frame carrying `{name}_{seq}`
//! - **Data** (private pipe): length-prefixed frames with a pluggable [`codec::Codec`]
//! - **Connection**: one receive loop and one dedicated writer per session
//! - **Registry**: broadcast and addressed delivery by id or name
//!
//! ## Example
//!
//! ```ignore
//! use pipeplex::codec::TextCodec;
//! use pipeplex::{Client, Server};
//!
//! #[tokio::main]
//! async fn main() -> pipeplex::Result<()> {
//!     let server = Server::builder("demo", TextCodec)
//!         .on_message(|conn, msg| {
//!             conn.push_message(format!("echo: {}", msg));
//!             Ok(())
//!         })
//!         .start()?;
//!
//!     let client = Client::builder("demo", TextCodec)
//!         .on_message(|_, msg| {
//!             println!("{}", msg);
//!             Ok(())
//!         })
//!         .start();
//!
//!     client.wait_for_connection().await;
//!     client.push_message("hello".to_string());
//!
//!     client.stop().await;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod worker;

mod backpressure;
mod writer;

pub use client::{Client, ClientBuilder, DialConfig};
pub use connection::{Connection, ConnectionConfig, ConnectionState, DecodeErrorPolicy};
pub use error::{ErrorKind, PipeplexError, Result};
pub use handler::{HandlerRegistry, HandlerResult};
pub use server::{Server, ServerBuilder, ServerConfig, ShutdownStrategy};
pub use worker::{BackgroundWorker, WorkerState};
