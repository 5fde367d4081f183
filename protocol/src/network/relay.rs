//! # Relay Selection
//!
//! When the direct broker endpoint cannot be reached (NAT, firewall, broker
//! outage), the connection manager asks a [`RelaySelector`] for alternative
//! endpoints and tries them in the order returned. The first one that
//! accepts the handshake wins.
//!
//! The default [`RelayDirectory`] combines two sources:
//!
//! 1. Relays from configuration, in configured order.
//! 2. Relays learned at runtime from presence announcements of peers that
//!    advertise the `relay` capability together with a relay hint.

use parking_lot::RwLock;
use tracing::debug;

use super::transport::Endpoint;

/// Strategy for picking relay endpoints after a failed direct connect.
pub trait RelaySelector: Send + Sync {
    /// Candidate relays to try, best first. `failed` is the endpoint that
    /// could not be reached and is never returned.
    fn candidates(&self, failed: &Endpoint) -> Vec<Endpoint>;
}

/// Never relays. Useful when the broker must be reached directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRelay;

impl RelaySelector for NoRelay {
    fn candidates(&self, _failed: &Endpoint) -> Vec<Endpoint> {
        Vec::new()
    }
}

/// Configured relays followed by learned ones, first reachable wins.
#[derive(Debug, Default)]
pub struct RelayDirectory {
    configured: Vec<Endpoint>,
    learned: RwLock<Vec<Endpoint>>,
}

/// Upper bound on learned relays kept around.
const MAX_LEARNED_RELAYS: usize = 32;

impl RelayDirectory {
    pub fn new(configured: Vec<Endpoint>) -> Self {
        Self {
            configured,
            learned: RwLock::new(Vec::new()),
        }
    }

    /// Records a relay advertised by a peer. Most recent first.
    pub fn learn(&self, endpoint: Endpoint) {
        if self.configured.contains(&endpoint) {
            return;
        }
        let mut learned = self.learned.write();
        learned.retain(|e| e != &endpoint);
        debug!(relay = %endpoint, "learned relay endpoint");
        learned.insert(0, endpoint);
        learned.truncate(MAX_LEARNED_RELAYS);
    }

    pub fn learned(&self) -> Vec<Endpoint> {
        self.learned.read().clone()
    }
}

impl RelaySelector for RelayDirectory {
    fn candidates(&self, failed: &Endpoint) -> Vec<Endpoint> {
        let learned = self.learned.read();
        let mut out: Vec<Endpoint> = Vec::with_capacity(self.configured.len() + learned.len());
        for endpoint in self.configured.iter().chain(learned.iter()) {
            if endpoint != failed && !out.contains(endpoint) {
                out.push(endpoint.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(s: &str) -> Endpoint {
        Endpoint::parse(s).unwrap()
    }

    #[test]
    fn configured_first_then_learned() {
        let dir = RelayDirectory::new(vec![ep("nats://r1:4222"), ep("nats://r2:4222")]);
        dir.learn(ep("nats://learned-a:4222"));
        dir.learn(ep("nats://learned-b:4222"));
        let c = dir.candidates(&ep("nats://broker:4222"));
        let names: Vec<String> = c.iter().map(|e| e.host().to_string()).collect();
        assert_eq!(names, vec!["r1", "r2", "learned-b", "learned-a"]);
    }

    #[test]
    fn failed_endpoint_and_duplicates_skipped() {
        let dir = RelayDirectory::new(vec![ep("nats://r1:4222")]);
        dir.learn(ep("nats://r1:4222"));
        dir.learn(ep("nats://r3:4222"));
        dir.learn(ep("nats://r3:4222"));
        let c = dir.candidates(&ep("nats://r1:4222"));
        assert_eq!(c, vec![ep("nats://r3:4222")]);
        assert_eq!(dir.learned().len(), 1);
    }

    #[test]
    fn no_relay_is_empty() {
        assert!(NoRelay.candidates(&ep("nats://x:1")).is_empty());
    }
}
