//! Registry of notification handlers.
//!
//! Handlers are registered up front (through the server/client builders)
//! and then shared read-only by every loop. Any number of handlers may be
//! registered per notification kind; they run in registration order.
//!
//! A handler that returns `Err` or panics never takes down the loop that
//! invoked it: the fault is converted into [`PipeplexError::Handler`],
//! logged, and delivered to the error handlers. Faults inside error
//! handlers are only logged.
//!
//! # Example
//!
//! ```
//! use pipeplex::codec::TextCodec;
//! use pipeplex::handler::HandlerRegistry;
//!
//! let mut handlers = HandlerRegistry::<TextCodec>::new();
//! handlers.on_message(|conn, msg| {
//!     println!("{} says {}", conn.name(), msg);
//!     Ok(())
//! });
//! assert_eq!(handlers.len(), 1);
//! ```

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::codec::Codec;
use crate::connection::Connection;
use crate::error::{PipeplexError, Result};

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

type ConnectedFn<C> = dyn Fn(&Arc<Connection<C>>) -> HandlerResult + Send + Sync;
type MessageFn<C> =
    dyn Fn(&Arc<Connection<C>>, &<C as Codec>::Item) -> HandlerResult + Send + Sync;
type DisconnectedFn<C> = dyn Fn(Option<&Arc<Connection<C>>>) -> HandlerResult + Send + Sync;
type ErrorFn<C> = dyn Fn(Option<&Arc<Connection<C>>>, &PipeplexError) + Send + Sync;

/// Handlers for connection lifecycle and message notifications.
pub struct HandlerRegistry<C: Codec> {
    connected: Vec<Box<ConnectedFn<C>>>,
    message: Vec<Box<MessageFn<C>>>,
    disconnected: Vec<Box<DisconnectedFn<C>>>,
    error: Vec<Box<ErrorFn<C>>>,
}

impl<C: Codec> HandlerRegistry<C> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            connected: Vec::new(),
            message: Vec::new(),
            disconnected: Vec::new(),
            error: Vec::new(),
        }
    }

    /// Register a handler fired once a connection is open.
    pub fn on_connected<F>(&mut self, handler: F)
    where
        F: Fn(&Arc<Connection<C>>) -> HandlerResult + Send + Sync + 'static,
    {
        self.connected.push(Box::new(handler));
    }

    /// Register a handler fired for every decoded message.
    pub fn on_message<F>(&mut self, handler: F)
    where
        F: Fn(&Arc<Connection<C>>, &C::Item) -> HandlerResult + Send + Sync + 'static,
    {
        self.message.push(Box::new(handler));
    }

    /// Register a handler fired exactly once per closed connection.
    ///
    /// The server also fires it with `None` after a failed handshake attempt.
    pub fn on_disconnected<F>(&mut self, handler: F)
    where
        F: Fn(Option<&Arc<Connection<C>>>) -> HandlerResult + Send + Sync + 'static,
    {
        self.disconnected.push(Box::new(handler));
    }

    /// Register a handler for transport, protocol, serialization and handler faults.
    pub fn on_error<F>(&mut self, handler: F)
    where
        F: Fn(Option<&Arc<Connection<C>>>, &PipeplexError) + Send + Sync + 'static,
    {
        self.error.push(Box::new(handler));
    }

    /// Total number of registered handlers.
    pub fn len(&self) -> usize {
        self.connected.len() + self.message.len() + self.disconnected.len() + self.error.len()
    }

    /// True if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn emit_connected(&self, conn: &Arc<Connection<C>>) {
        for handler in &self.connected {
            if let Some(err) = invoke("connected", || handler(conn)) {
                self.emit_error(Some(conn), &err);
            }
        }
    }

    pub(crate) fn emit_message(&self, conn: &Arc<Connection<C>>, message: &C::Item) {
        for handler in &self.message {
            if let Some(err) = invoke("message", || handler(conn, message)) {
                self.emit_error(Some(conn), &err);
            }
        }
    }

    pub(crate) fn emit_disconnected(&self, conn: Option<&Arc<Connection<C>>>) {
        for handler in &self.disconnected {
            if let Some(err) = invoke("disconnected", || handler(conn)) {
                self.emit_error(conn, &err);
            }
        }
    }

    pub(crate) fn emit_error(&self, conn: Option<&Arc<Connection<C>>>, error: &PipeplexError) {
        for handler in &self.error {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(conn, error))) {
                tracing::warn!(
                    panic = %panic_message(panic.as_ref()),
                    "error handler panicked"
                );
            }
        }
    }
}

impl<C: Codec> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one handler, converting `Err` and panics into a handler error.
fn invoke<F>(kind: &'static str, f: F) -> Option<PipeplexError>
where
    F: FnOnce() -> HandlerResult,
{
    let err = match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => return None,
        Ok(Err(e)) => PipeplexError::Handler(format!("{} handler failed: {}", kind, e)),
        Err(panic) => PipeplexError::Handler(format!(
            "{} handler panicked: {}",
            kind,
            panic_message(panic.as_ref())
        )),
    };
    tracing::warn!(error = %err, "notification handler fault");
    Some(err)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TextCodec;
    use crate::connection::ConnectionConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn detached() -> Arc<Connection<TextCodec>> {
        Connection::detached(7, Arc::new(TextCodec), ConnectionConfig::default())
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handlers = HandlerRegistry::<TextCodec>::new();
        for i in 0..3 {
            let order = order.clone();
            handlers.on_message(move |_, msg| {
                order.lock().unwrap().push(format!("{}:{}", i, msg));
                Ok(())
            });
        }

        handlers.emit_message(&detached(), &"hi".to_string());

        assert_eq!(*order.lock().unwrap(), vec!["0:hi", "1:hi", "2:hi"]);
    }

    #[test]
    fn test_err_result_routed_to_error_handlers() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let mut handlers = HandlerRegistry::<TextCodec>::new();
        handlers.on_connected(|_| Err(PipeplexError::Protocol("nope".into())));
        let sink = errors.clone();
        handlers.on_error(move |conn, err| {
            sink.lock()
                .unwrap()
                .push((conn.map(|c| c.id()), err.to_string()));
        });

        handlers.emit_connected(&detached());

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, Some(7));
        assert!(errors[0].1.contains("connected handler failed"));
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let calls = Arc::new(AtomicUsize::new(0));
        let faults = Arc::new(AtomicUsize::new(0));
        let mut handlers = HandlerRegistry::<TextCodec>::new();
        handlers.on_message(|_, _| panic!("handler exploded"));
        let counter = calls.clone();
        handlers.on_message(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let fault_counter = faults.clone();
        handlers.on_error(move |_, err| {
            assert!(err.to_string().contains("handler exploded"));
            fault_counter.fetch_add(1, Ordering::SeqCst);
        });

        handlers.emit_message(&detached(), &"x".to_string());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(faults.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_error_handler_is_contained() {
        let mut handlers = HandlerRegistry::<TextCodec>::new();
        handlers.on_error(|_, _| panic!("error handler exploded"));
        handlers.on_disconnected(|_| Err(PipeplexError::ConnectionClosed));

        // Must not unwind into the caller.
        handlers.emit_disconnected(None);
        handlers.emit_error(None, &PipeplexError::QueueFull);
    }

    #[test]
    fn test_len() {
        let mut handlers = HandlerRegistry::<TextCodec>::new();
        assert!(handlers.is_empty());
        handlers.on_connected(|_| Ok(()));
        handlers.on_disconnected(|_| Ok(()));
        handlers.on_error(|_, _| {});
        assert_eq!(handlers.len(), 3);
    }
}
