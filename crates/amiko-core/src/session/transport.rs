//! The transport boundary.
//!
//! Routing and peer discovery live outside the engine. The session only
//! needs four capabilities from whatever carries its frames: seed the
//! routing layer, push a frame toward a public key, pull the next inbound
//! frame, and report whether any path to the wider network exists.
//!
//! [`MemoryHub`] provides a loopback implementation wiring several sessions
//! together inside one process; the integration tests and the demo binary
//! run on it.

use crate::crypto::PublicKey;
use crate::error::Result;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

/// What the session requires from the routing/transport layer.
///
/// Frames are already sealed when they reach `send`; the transport never
/// sees plaintext.
pub trait Transport {
    /// Seed the routing layer with a known peer.
    fn bootstrap(&mut self, host: &str, port: u16, public_key: &PublicKey) -> Result<()>;

    /// Queue a frame toward the peer owning `to`. Undeliverable frames may
    /// be dropped; delivery is best-effort.
    fn send(&mut self, to: &PublicKey, frame: &[u8]) -> Result<()>;

    /// Pull the next inbound frame, if any.
    fn recv(&mut self) -> Option<Vec<u8>>;

    /// Whether any live path to the wider network exists.
    fn is_connected(&self) -> bool;
}

type Mailboxes = Rc<RefCell<HashMap<PublicKey, VecDeque<Vec<u8>>>>>;

/// In-process message hub connecting [`MemoryTransport`] endpoints.
#[derive(Clone, Default)]
pub struct MemoryHub {
    mailboxes: Mailboxes,
}

impl MemoryHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint for `local`. Frames sent to this key from other
    /// endpoints on the same hub become receivable here.
    pub fn attach(&self, local: PublicKey) -> MemoryTransport {
        self.mailboxes.borrow_mut().entry(local).or_default();
        MemoryTransport {
            mailboxes: Rc::clone(&self.mailboxes),
            local,
            bootstrapped: false,
        }
    }
}

/// Loopback transport endpoint; see [`MemoryHub`].
pub struct MemoryTransport {
    mailboxes: Mailboxes,
    local: PublicKey,
    bootstrapped: bool,
}

impl Transport for MemoryTransport {
    fn bootstrap(&mut self, _host: &str, _port: u16, _public_key: &PublicKey) -> Result<()> {
        self.bootstrapped = true;
        Ok(())
    }

    fn send(&mut self, to: &PublicKey, frame: &[u8]) -> Result<()> {
        // Unattached keys model unreachable peers: the frame is dropped.
        if let Some(mailbox) = self.mailboxes.borrow_mut().get_mut(to) {
            mailbox.push_back(frame.to_vec());
        }
        Ok(())
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        self.mailboxes
            .borrow_mut()
            .get_mut(&self.local)
            .and_then(VecDeque::pop_front)
    }

    fn is_connected(&self) -> bool {
        self.bootstrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_frames_route_between_endpoints() {
        let hub = MemoryHub::new();
        let a = KeyPair::generate().public();
        let b = KeyPair::generate().public();

        let mut ta = hub.attach(a);
        let mut tb = hub.attach(b);

        ta.send(&b, b"frame one").expect("send");
        ta.send(&b, b"frame two").expect("send");

        assert_eq!(tb.recv().as_deref(), Some(b"frame one".as_ref()));
        assert_eq!(tb.recv().as_deref(), Some(b"frame two".as_ref()));
        assert_eq!(tb.recv(), None);
        assert_eq!(ta.recv(), None);
    }

    #[test]
    fn test_unattached_peer_drops_frames() {
        let hub = MemoryHub::new();
        let a = KeyPair::generate().public();
        let ghost = KeyPair::generate().public();

        let mut ta = hub.attach(a);
        ta.send(&ghost, b"into the void").expect("send is best-effort");
        assert_eq!(ta.recv(), None);
    }

    #[test]
    fn test_connected_after_bootstrap() {
        let hub = MemoryHub::new();
        let a = KeyPair::generate().public();
        let mut ta = hub.attach(a);

        assert!(!ta.is_connected());
        ta.bootstrap("node.example.org", 33445, &KeyPair::generate().public())
            .expect("bootstrap");
        assert!(ta.is_connected());
    }
}
