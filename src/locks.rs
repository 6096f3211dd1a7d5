//! Per-validator mutual exclusion
//!
//! Mutations touching one public key are serialized; different keys proceed
//! in parallel.

use crate::crypto::PublicKey;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

/// Lock table keyed by public key
#[derive(Default)]
pub struct PubkeyLocks {
    held: Mutex<HashSet<PublicKey>>,
    released: Condvar,
}

/// Held while a public key is locked
pub struct PubkeyGuard<'a> {
    locks: &'a PubkeyLocks,
    pubkey: PublicKey,
}

impl PubkeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `pubkey` is exclusively held by the caller
    pub fn lock(&self, pubkey: &PublicKey) -> PubkeyGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(pubkey) {
            self.released.wait(&mut held);
        }
        held.insert(*pubkey);

        PubkeyGuard {
            locks: self,
            pubkey: *pubkey,
        }
    }

    /// Number of keys currently locked
    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PubkeyGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.pubkey);
        self.locks.released.notify_all();
    }
}
