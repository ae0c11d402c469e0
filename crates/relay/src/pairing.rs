//! Device-code pairing.
//!
//! A workstation without a credential asks for a short code, shows it to
//! the user, and polls. An already-authenticated viewer verifies the code,
//! which binds a freshly minted workstation credential to it; the next
//! poll hands the credential over exactly once. Codes expire after ten
//! minutes; the store evicts expired entries on every request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

/// Unambiguous code alphabet (no 0/O, 1/I/L).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;

pub const PAIRING_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Not verified yet — keep polling.
    Pending,
    /// Verified; the credential is released exactly once.
    Ready(String),
    /// Unknown, expired, or already claimed.
    Gone,
}

struct PendingCode {
    created_at: Instant,
    credential: Option<String>,
}

pub struct PairingStore {
    ttl: Duration,
    codes: Mutex<HashMap<String, PendingCode>>,
}

impl Default for PairingStore {
    fn default() -> Self {
        Self::with_ttl(PAIRING_TTL)
    }
}

impl PairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            codes: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Start a pairing attempt; returns the code the user must verify.
    pub fn begin(&self) -> String {
        let mut codes = self.codes.lock().expect("pairing lock");
        Self::evict_expired(&mut codes, self.ttl);

        let mut rng = rand::thread_rng();
        loop {
            let code: String = (0..CODE_LEN)
                .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
                .collect();
            if codes.contains_key(&code) {
                continue;
            }
            codes.insert(
                code.clone(),
                PendingCode {
                    created_at: Instant::now(),
                    credential: None,
                },
            );
            return code;
        }
    }

    /// Whether a code is still waiting for verification.
    pub fn is_pending(&self, code: &str) -> bool {
        let mut codes = self.codes.lock().expect("pairing lock");
        Self::evict_expired(&mut codes, self.ttl);
        codes
            .get(code)
            .is_some_and(|pending| pending.credential.is_none())
    }

    /// Attach a credential to a pending code. Returns `false` when the code
    /// is unknown, expired, or already verified.
    pub fn verify(&self, code: &str, credential: String) -> bool {
        let mut codes = self.codes.lock().expect("pairing lock");
        Self::evict_expired(&mut codes, self.ttl);
        match codes.get_mut(code) {
            Some(pending) if pending.credential.is_none() => {
                pending.credential = Some(credential);
                true
            }
            _ => false,
        }
    }

    /// Poll a code. A `Ready` result consumes the entry, so a later poll
    /// reports `Gone`.
    pub fn poll(&self, code: &str) -> PollOutcome {
        let mut codes = self.codes.lock().expect("pairing lock");
        Self::evict_expired(&mut codes, self.ttl);
        match codes.get(code) {
            None => PollOutcome::Gone,
            Some(pending) if pending.credential.is_none() => PollOutcome::Pending,
            Some(_) => {
                let pending = codes.remove(code).expect("entry present");
                PollOutcome::Ready(pending.credential.expect("credential present"))
            }
        }
    }

    fn evict_expired(codes: &mut HashMap<String, PendingCode>, ttl: Duration) {
        codes.retain(|_, pending| pending.created_at.elapsed() < ttl);
    }
}
