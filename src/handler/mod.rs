//! Handler module - notification registration and isolated dispatch.
//!
//! Provides [`HandlerRegistry`], which holds the connected, message,
//! disconnected and error handlers of a server or client.
//!
//! # Example
//!
//! ```
//! use pipeplex::codec::TextCodec;
//! use pipeplex::handler::HandlerRegistry;
//!
//! let mut handlers = HandlerRegistry::<TextCodec>::new();
//!
//! // Echo every message back to its sender
//! handlers.on_message(|conn, msg| {
//!     conn.push_message(msg.clone());
//!     Ok(())
//! });
//!
//! handlers.on_error(|conn, err| {
//!     eprintln!("connection {:?}: {}", conn.map(|c| c.id()), err);
//! });
//! ```

mod registry;

pub use registry::{HandlerRegistry, HandlerResult};
