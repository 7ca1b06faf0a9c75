//! Cached verdicts on whether a peer can be dialed directly.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// How a peer was, or will be, reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connectivity {
    Direct,
    Relay,
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Relay => f.write_str("relay"),
        }
    }
}

/// Probe results, trusted for `ttl` after they were recorded.
pub struct ConnectivityCache {
    entries: HashMap<String, (Connectivity, Instant)>,
    ttl: Duration,
}

impl ConnectivityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Cached verdict for `peer_id`, dropping it if older than the ttl.
    pub fn get(&mut self, peer_id: &str, now: Instant) -> Option<Connectivity> {
        let (verdict, recorded) = *self.entries.get(peer_id)?;
        if now.saturating_duration_since(recorded) > self.ttl {
            self.entries.remove(peer_id);
            return None;
        }
        Some(verdict)
    }

    pub fn record(&mut self, peer_id: &str, verdict: Connectivity, now: Instant) {
        self.entries.insert(peer_id.to_string(), (verdict, now));
    }

    pub fn forget(&mut self, peer_id: &str) {
        self.entries.remove(peer_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
