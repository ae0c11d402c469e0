//! Echo-suppression ledger.
//!
//! When an adapter forwards remote text into a session, that text soon
//! reappears in the transcript as a user message. The ledger remembers
//! recent outbound fingerprints so the echo is dropped instead of being
//! posted back to its own origin. Bounded FIFO with a TTL: an entry that
//! never matches is eventually evicted, and a post-eviction miss costs one
//! duplicate post at worst.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_CAPACITY: usize = 64;
const DEFAULT_TTL: Duration = Duration::from_secs(120);

struct LedgerEntry {
    fingerprint: String,
    inserted_at: Instant,
}

pub struct EchoLedger {
    capacity: usize,
    ttl: Duration,
    entries: VecDeque<LedgerEntry>,
}

impl Default for EchoLedger {
    fn default() -> Self {
        Self::with_limits(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl EchoLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: VecDeque::new(),
        }
    }

    /// Record outbound text. The oldest entry falls off past capacity.
    pub fn insert(&mut self, text: &str) {
        self.prune();
        self.entries.push_back(LedgerEntry {
            fingerprint: text.trim().to_string(),
            inserted_at: Instant::now(),
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Match incoming text against the ledger. A hit removes exactly one
    /// entry and returns `true` — the caller drops the message.
    pub fn consume(&mut self, text: &str) -> bool {
        self.prune();
        let fingerprint = text.trim();
        match self
            .entries
            .iter()
            .position(|e| e.fingerprint == fingerprint)
        {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|e| e.inserted_at.elapsed() < ttl);
    }
}
