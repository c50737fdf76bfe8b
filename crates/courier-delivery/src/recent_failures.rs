//! Short-lived memory of failures that are certain to repeat.
//!
//! Prekey fetches are strictly rate limited, so a fetch that will fail again
//! (changed identity awaiting approval, a device publishing bad signatures,
//! an account the relay just told us does not exist) is skipped while the
//! failure is fresh. Nothing here is persisted.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::{millis, Clock};
use crate::config::SenderConfig;
use crate::ids::ServiceId;

struct InvalidSignatureEntry {
    first_seen_ms: u64,
    count: u32,
}

#[derive(Default)]
struct FailureLog {
    untrusted_identities: HashMap<ServiceId, u64>,
    invalid_signatures: HashMap<ServiceId, InvalidSignatureEntry>,
    nonexistent_accounts: HashMap<ServiceId, u64>,
}

pub struct RecentFailures {
    clock: Arc<dyn Clock>,
    untrusted_identity_window_ms: u64,
    invalid_signature_window_ms: u64,
    invalid_signature_threshold: u32,
    nonexistent_account_ttl_ms: u64,
    log: Mutex<FailureLog>,
}

impl RecentFailures {
    pub fn new(clock: Arc<dyn Clock>, config: &SenderConfig) -> Self {
        Self {
            clock,
            untrusted_identity_window_ms: millis(config.untrusted_identity_window),
            invalid_signature_window_ms: millis(config.invalid_signature_window),
            invalid_signature_threshold: config.invalid_signature_threshold,
            nonexistent_account_ttl_ms: millis(config.nonexistent_account_ttl),
            log: Mutex::new(FailureLog::default()),
        }
    }

    pub fn record_untrusted_identity(&self, recipient: &ServiceId) {
        let now = self.clock.now_ms();
        self.log
            .lock()
            .untrusted_identities
            .insert(recipient.clone(), now);
    }

    pub fn has_recent_untrusted_identity(&self, recipient: &ServiceId) -> bool {
        let now = self.clock.now_ms();
        let mut log = self.log.lock();
        match log.untrusted_identities.get(recipient) {
            Some(seen) if now.saturating_sub(*seen) < self.untrusted_identity_window_ms => true,
            Some(_) => {
                log.untrusted_identities.remove(recipient);
                false
            }
            None => false,
        }
    }

    /// Forget an untrusted identity once the user has approved the new key.
    pub fn clear_untrusted_identity(&self, recipient: &ServiceId) {
        self.log.lock().untrusted_identities.remove(recipient);
    }

    pub fn record_invalid_signature(&self, recipient: &ServiceId) {
        let now = self.clock.now_ms();
        let window = self.invalid_signature_window_ms;
        let mut log = self.log.lock();
        let entry = log
            .invalid_signatures
            .entry(recipient.clone())
            .or_insert(InvalidSignatureEntry {
                first_seen_ms: now,
                count: 0,
            });
        if now.saturating_sub(entry.first_seen_ms) >= window {
            entry.first_seen_ms = now;
            entry.count = 0;
        }
        entry.count += 1;
    }

    /// Whether enough invalid signatures were seen recently that another
    /// prekey fetch would be wasted.
    pub fn will_likely_have_invalid_signature(&self, recipient: &ServiceId) -> bool {
        let now = self.clock.now_ms();
        let mut log = self.log.lock();
        let Some(entry) = log.invalid_signatures.get(recipient) else {
            return false;
        };
        if now.saturating_sub(entry.first_seen_ms) >= self.invalid_signature_window_ms {
            log.invalid_signatures.remove(recipient);
            return false;
        }
        entry.count >= self.invalid_signature_threshold
    }

    pub fn record_nonexistent_account(&self, recipient: &ServiceId) {
        let now = self.clock.now_ms();
        self.log
            .lock()
            .nonexistent_accounts
            .insert(recipient.clone(), now);
    }

    pub fn is_known_nonexistent(&self, recipient: &ServiceId) -> bool {
        let now = self.clock.now_ms();
        let mut log = self.log.lock();
        match log.nonexistent_accounts.get(recipient) {
            Some(seen) if now.saturating_sub(*seen) < self.nonexistent_account_ttl_ms => true,
            Some(_) => {
                log.nonexistent_accounts.remove(recipient);
                false
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for RecentFailures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.log.lock();
        f.debug_struct("RecentFailures")
            .field("untrusted_identities", &log.untrusted_identities.len())
            .field("invalid_signatures", &log.invalid_signatures.len())
            .field("nonexistent_accounts", &log.nonexistent_accounts.len())
            .finish()
    }
}
