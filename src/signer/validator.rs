//! Validator signer service
//!
//! Signs block proposals and attestations for active keys, refusing anything
//! the slashing protection store considers unsafe.

use crate::crypto::{PublicKey, Root, Signature};
use crate::errors::Result;
use crate::keystore::KeyStore;
use crate::slashing::{Safe, SlashingProtectionStore};
use std::sync::Arc;
use tracing::{debug, info};

/// Validator signer service
pub struct ValidatorSigner {
    key_store: Arc<KeyStore>,
    slashing: Arc<SlashingProtectionStore>,
}

impl ValidatorSigner {
    /// Create a new validator signer
    pub fn new(key_store: Arc<KeyStore>, slashing: Arc<SlashingProtectionStore>) -> Self {
        Self {
            key_store,
            slashing,
        }
    }

    /// Sign a block proposal's signing root at `slot`
    pub fn sign_block(
        &self,
        pubkey: &PublicKey,
        slot: u64,
        signing_root: Root,
    ) -> Result<Signature> {
        // The key cannot be removed while the closure runs, so the recorded
        // history and the signature belong to the same activation.
        self.key_store.with_secret(pubkey, |secret| {
            let safe = self
                .slashing
                .check_and_insert_block(pubkey, slot, signing_root)?;
            if safe == Safe::SameData {
                debug!("Re-signing identical block: key={}, slot={}", pubkey, slot);
            }
            let signature = secret.sign(signing_root.as_bytes());
            info!("Signed block: key={}, slot={}", pubkey, slot);
            Ok(signature)
        })
    }

    /// Sign an attestation's signing root for (`source_epoch`, `target_epoch`)
    pub fn sign_attestation(
        &self,
        pubkey: &PublicKey,
        source_epoch: u64,
        target_epoch: u64,
        signing_root: Root,
    ) -> Result<Signature> {
        self.key_store.with_secret(pubkey, |secret| {
            let safe = self.slashing.check_and_insert_attestation(
                pubkey,
                source_epoch,
                target_epoch,
                signing_root,
            )?;
            if safe == Safe::SameData {
                debug!(
                    "Re-signing identical attestation: key={}, target={}",
                    pubkey, target_epoch
                );
            }
            let signature = secret.sign(signing_root.as_bytes());
            debug!(
                "Signed attestation: key={}, source={}, target={}",
                pubkey, source_epoch, target_epoch
            );
            Ok(signature)
        })
    }
}
