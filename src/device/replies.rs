//! Correlation of device replies with the requests that asked for them
//!
//! A forwarded request takes a correlation id in `1..=127`, sends it to the
//! device, and parks a callback here. The device's REPLY frame carries the
//! id back; the first matching reply removes the entry and runs the
//! callback. Ids are handed out by a wrapping counter that skips ids still
//! in use.

use crate::error::CommandError;
use crate::net::{Arg, NetAddress};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const MIN_ID: u8 = 1;
pub const MAX_ID: u8 = 127;

/// Turns the raw device value into the reply arguments
pub type Postprocess = Box<dyn FnOnce(u16) -> Vec<Arg> + Send>;

/// Where the final network reply goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRoute {
    /// Method name echoed in the reply (`smoothing`)
    pub method: String,
    /// Original request path, used for error reports
    pub path: String,
    pub address: NetAddress,
    /// The caller's own correlation id
    pub caller_id: i32,
}

pub struct PendingReply {
    pub route: ReplyRoute,
    pub postprocess: Postprocess,
    pub issued: Instant,
}

#[derive(Default)]
struct Inner {
    last: u8,
    pending: HashMap<u8, PendingReply>,
}

#[derive(Default)]
pub struct ReplyRegistry {
    inner: Mutex<Inner>,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a callback and return its correlation id
    pub fn register(&self, route: ReplyRoute, postprocess: Postprocess) -> Result<u8, CommandError> {
        let mut inner = self.inner.lock();
        let span = (MAX_ID - MIN_ID + 1) as usize;
        if inner.pending.len() >= span {
            return Err(CommandError::RegistryFull(inner.pending.len()));
        }

        let mut id = inner.last;
        loop {
            id = if id >= MAX_ID { MIN_ID } else { id + 1 };
            if !inner.pending.contains_key(&id) {
                break;
            }
        }
        inner.last = id;
        inner.pending.insert(
            id,
            PendingReply {
                route,
                postprocess,
                issued: Instant::now(),
            },
        );
        tracing::trace!("registered reply id {}", id);
        Ok(id)
    }

    /// Remove and return the entry for a device reply
    pub fn resolve(&self, id: u8) -> Result<PendingReply, CommandError> {
        self.inner
            .lock()
            .pending
            .remove(&id)
            .ok_or(CommandError::UnknownCorrelationId(id))
    }

    /// Drop a pending entry without running it
    pub fn cancel(&self, id: u8) -> Option<PendingReply> {
        self.inner.lock().pending.remove(&id)
    }

    /// Remove entries older than `timeout`
    pub fn expire(&self, timeout: Duration) -> Vec<(u8, PendingReply)> {
        let mut inner = self.inner.lock();
        let expired: Vec<u8> = inner
            .pending
            .iter()
            .filter(|(_, p)| p.issued.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| inner.pending.remove(&id).map(|p| (id, p)))
            .collect()
    }

    /// Remove every pending entry (the device went away)
    pub fn drain(&self) -> Vec<(u8, PendingReply)> {
        self.inner.lock().pending.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> ReplyRoute {
        ReplyRoute {
            method: "smoothing".into(),
            path: "/smoothing/get".into(),
            address: NetAddress::new("localhost", 9000),
            caller_id: 7,
        }
    }

    fn identity() -> Postprocess {
        Box::new(|v| vec![Arg::Int(v as i32)])
    }

    #[test]
    fn test_ids_increase_and_wrap() {
        let registry = ReplyRegistry::new();
        let first = registry.register(route(), identity()).unwrap();
        assert_eq!(first, 1);
        assert_eq!(registry.register(route(), identity()).unwrap(), 2);

        registry.resolve(1).unwrap();
        registry.resolve(2).unwrap();
        for _ in 3..=MAX_ID {
            let id = registry.register(route(), identity()).unwrap();
            registry.cancel(id);
        }
        assert_eq!(registry.register(route(), identity()).unwrap(), 1);
    }

    #[test]
    fn test_pending_ids_are_skipped() {
        let registry = ReplyRegistry::new();
        let held = registry.register(route(), identity()).unwrap();
        for _ in 0..200 {
            let id = registry.register(route(), identity()).unwrap();
            assert_ne!(id, held);
            assert!((MIN_ID..=MAX_ID).contains(&id));
            registry.cancel(id);
        }
        assert_eq!(registry.len(), 1);
        assert!(registry.resolve(held).is_ok());
    }

    #[test]
    fn test_resolve_once() {
        let registry = ReplyRegistry::new();
        let id = registry.register(route(), identity()).unwrap();
        let pending = registry.resolve(id).unwrap();
        assert_eq!((pending.postprocess)(42), vec![Arg::Int(42)]);
        assert_eq!(pending.route.caller_id, 7);
        assert_eq!(
            registry.resolve(id).err(),
            Some(CommandError::UnknownCorrelationId(id))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_full_registry() {
        let registry = ReplyRegistry::new();
        for _ in MIN_ID..=MAX_ID {
            registry.register(route(), identity()).unwrap();
        }
        assert!(matches!(
            registry.register(route(), identity()),
            Err(CommandError::RegistryFull(127))
        ));
    }

    #[test]
    fn test_expire() {
        let registry = ReplyRegistry::new();
        let id = registry.register(route(), identity()).unwrap();
        assert!(registry.expire(Duration::from_secs(60)).is_empty());
        let expired = registry.expire(Duration::ZERO);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, id);
        assert!(registry.is_empty());
    }
}
