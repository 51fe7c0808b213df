//! Live server-side connections keyed by id.
//!
//! One lock covers both membership changes and delivery iteration, so a
//! broadcast never observes a half-removed entry. Queue-full notifications
//! raised during delivery are collected and fired after the lock is
//! released, so handlers may call back into the server.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::codec::Codec;
use crate::connection::Connection;
use crate::error::PipeplexError;

type Map<C> = BTreeMap<u64, Arc<Connection<C>>>;

pub(crate) struct ConnectionRegistry<C: Codec> {
    inner: Mutex<Map<C>>,
}

impl<C: Codec> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Map<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, conn: Arc<Connection<C>>) {
        self.lock().insert(conn.id(), conn);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Connection<C>>> {
        self.lock().remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection<C>>> {
        self.lock().get(&id).cloned()
    }

    /// Connections in id order.
    pub fn snapshot(&self) -> Vec<Arc<Connection<C>>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Remove every entry and return them; the caller closes them unlocked.
    pub fn drain(&self) -> Vec<Arc<Connection<C>>> {
        std::mem::take(&mut *self.lock()).into_values().collect()
    }
}

impl<C: Codec> ConnectionRegistry<C>
where
    C::Item: Clone,
{
    /// Queue `message` on every connection.
    pub fn broadcast(&self, message: &C::Item) -> usize {
        let mut delivery = Delivery::new();
        let map = self.lock();
        for conn in map.values() {
            delivery.push(conn, message);
        }
        drop(map);
        delivery.finish()
    }

    /// Queue `message` on connection `id`, if registered.
    pub fn push_to(&self, id: u64, message: &C::Item) -> usize {
        self.push_to_ids(&[id], message)
    }

    pub fn push_to_ids(&self, ids: &[u64], message: &C::Item) -> usize {
        let mut delivery = Delivery::new();
        let map = self.lock();
        for id in ids {
            if let Some(conn) = map.get(id) {
                delivery.push(conn, message);
            }
        }
        drop(map);
        delivery.finish()
    }

    /// Queue `message` on the lowest-id connection named `name`.
    pub fn push_to_name(&self, name: &str, message: &C::Item) -> usize {
        self.push_to_names(&[name], message)
    }

    /// First match per name, in id order.
    pub fn push_to_names<S: AsRef<str>>(&self, names: &[S], message: &C::Item) -> usize {
        let mut delivery = Delivery::new();
        let map = self.lock();
        for name in names {
            let name = name.as_ref();
            if let Some(conn) = map.values().find(|c| c.name() == name) {
                delivery.push(conn, message);
            }
        }
        drop(map);
        delivery.finish()
    }
}

/// Outcome of one delivery pass.
struct Delivery<C: Codec> {
    delivered: usize,
    overflowed: Vec<Arc<Connection<C>>>,
}

impl<C: Codec> Delivery<C>
where
    C::Item: Clone,
{
    fn new() -> Self {
        Self {
            delivered: 0,
            overflowed: Vec::new(),
        }
    }

    fn push(&mut self, conn: &Arc<Connection<C>>, message: &C::Item) {
        match conn.enqueue(message.clone()) {
            Ok(()) => self.delivered += 1,
            Err(_) => self.overflowed.push(conn.clone()),
        }
    }

    /// Fire deferred notifications. Must run after the registry lock is released.
    fn finish(self) -> usize {
        for conn in self.overflowed {
            conn.report(PipeplexError::QueueFull);
        }
        self.delivered
    }
}
