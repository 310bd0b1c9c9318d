//! In-process transport
//!
//! Messages injected through [`MemoryTransport::inject`] are delivered to
//! the engine as if they came from the network; everything the engine sends
//! is recorded and can be inspected with [`MemoryTransport::sent`].

use super::{Arg, Incoming, NetAddress, NetMessage, NetTransport};
use crate::error::Result;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::time::Duration;

pub struct MemoryTransport {
    inbound_tx: Sender<Incoming>,
    inbound_rx: Receiver<Incoming>,
    sent: Mutex<Vec<(NetAddress, NetMessage)>>,
    prepared: Mutex<Vec<NetAddress>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        Self {
            inbound_tx,
            inbound_rx,
            sent: Mutex::new(Vec::new()),
            prepared: Mutex::new(Vec::new()),
        }
    }

    /// Queue a message as if `source` had sent it
    pub fn inject(&self, source: NetAddress, path: &str, args: Vec<Arg>) {
        let _ = self.inbound_tx.send(Incoming {
            message: NetMessage::new(path, args),
            source,
        });
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<(NetAddress, NetMessage)> {
        self.sent.lock().clone()
    }

    /// Messages sent to a given path
    pub fn sent_to_path(&self, path: &str) -> Vec<(NetAddress, NetMessage)> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, msg)| msg.path == path)
            .cloned()
            .collect()
    }

    /// Every address handed to `prepare`, in order
    pub fn prepared(&self) -> Vec<NetAddress> {
        self.prepared.lock().clone()
    }

    /// Drain the record of sent messages
    pub fn take_sent(&self) -> Vec<(NetAddress, NetMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl NetTransport for MemoryTransport {
    fn send(&self, to: &NetAddress, message: &NetMessage) -> Result<()> {
        self.sent.lock().push((to.clone(), message.clone()));
        Ok(())
    }

    fn prepare(&self, targets: &[NetAddress]) {
        self.prepared.lock().extend(targets.iter().cloned());
    }

    fn recv_timeout(&self, timeout: Duration) -> Result<Option<Incoming>> {
        if timeout.is_zero() {
            return Ok(self.inbound_rx.try_recv().ok());
        }
        match self.inbound_rx.recv_timeout(timeout) {
            Ok(incoming) => Ok(Some(incoming)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_and_record() {
        let transport = MemoryTransport::new();
        let src = NetAddress::new("localhost", 9000);
        transport.inject(src.clone(), "/calibrate", vec![]);

        let got = transport.recv_timeout(Duration::ZERO).unwrap().unwrap();
        assert_eq!(got.message.path, "/calibrate");
        assert_eq!(got.source, src);
        assert!(transport.recv_timeout(Duration::ZERO).unwrap().is_none());

        transport
            .send(&src, &NetMessage::new("/status", vec![Arg::from("CONNECTED")]))
            .unwrap();
        assert_eq!(transport.sent_to_path("/status").len(), 1);
        assert_eq!(transport.take_sent().len(), 1);
        assert!(transport.sent().is_empty());
    }
}
