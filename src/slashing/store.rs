//! Slashing protection store
//!
//! One record per validator, kept in memory and mirrored to one document each.
//! Records only ever grow. Every mutation of a record happens under that
//! record's lock and is written to disk before the in-memory copy changes.

use crate::crypto::{PublicKey, Root};
use crate::errors::{KeyManagerError, Result};
use crate::persistence::Persistence;
use crate::slashing::interchange::{
    Interchange, InterchangeData, SignedAttestation, SignedBlock,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Document holding store-wide metadata
const METADATA_DOC: &str = "metadata";

#[derive(Debug, Serialize, Deserialize)]
struct StoreMetadata {
    genesis_validators_root: Root,
}

/// Result of a successful slashing check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Safe {
    /// New message; it has been recorded
    Valid,
    /// Identical to a message already signed
    SameData,
}

/// Signing history of one validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionRecord {
    pub pubkey: PublicKey,
    pub signed_blocks: BTreeSet<SignedBlock>,
    pub signed_attestations: BTreeSet<SignedAttestation>,
}

impl ProtectionRecord {
    fn empty(pubkey: PublicKey) -> Self {
        Self {
            pubkey,
            signed_blocks: BTreeSet::new(),
            signed_attestations: BTreeSet::new(),
        }
    }

    fn from_data(data: InterchangeData) -> Self {
        Self {
            pubkey: data.pubkey,
            signed_blocks: data.signed_blocks.into_iter().collect(),
            signed_attestations: data.signed_attestations.into_iter().collect(),
        }
    }

    fn to_data(&self) -> InterchangeData {
        InterchangeData {
            pubkey: self.pubkey,
            signed_blocks: self.signed_blocks.iter().cloned().collect(),
            signed_attestations: self.signed_attestations.iter().cloned().collect(),
        }
    }

    fn union(&mut self, data: &InterchangeData) {
        self.signed_blocks.extend(data.signed_blocks.iter().cloned());
        self.signed_attestations
            .extend(data.signed_attestations.iter().cloned());
    }

    fn min_slot(&self) -> Option<u64> {
        self.signed_blocks.iter().map(|b| b.slot).min()
    }

    fn min_source(&self) -> Option<u64> {
        self.signed_attestations.iter().map(|a| a.source_epoch).min()
    }

    fn min_target(&self) -> Option<u64> {
        self.signed_attestations.iter().map(|a| a.target_epoch).min()
    }

    fn check_block(&self, slot: u64, signing_root: Root) -> Result<Safe> {
        let same_slot: Vec<_> = self
            .signed_blocks
            .iter()
            .filter(|b| b.slot == slot)
            .collect();

        if !same_slot.is_empty() {
            if same_slot
                .iter()
                .all(|b| b.signing_root == Some(signing_root))
            {
                return Ok(Safe::SameData);
            }
            return Err(KeyManagerError::SlashableBlock(format!(
                "{} already signed a different block at slot {}",
                self.pubkey, slot
            )));
        }

        if let Some(min) = self.min_slot() {
            if slot <= min {
                return Err(KeyManagerError::SlashableBlock(format!(
                    "slot {} is not above the lowest recorded slot {} for {}",
                    slot, min, self.pubkey
                )));
            }
        }

        Ok(Safe::Valid)
    }

    fn check_attestation(&self, source: u64, target: u64, signing_root: Root) -> Result<Safe> {
        if source > target {
            return Err(KeyManagerError::SlashableAttestation(format!(
                "source {} is after target {}",
                source, target
            )));
        }

        let same_target: Vec<_> = self
            .signed_attestations
            .iter()
            .filter(|a| a.target_epoch == target)
            .collect();

        if !same_target.is_empty() {
            if same_target
                .iter()
                .all(|a| a.source_epoch == source && a.signing_root == Some(signing_root))
            {
                return Ok(Safe::SameData);
            }
            return Err(KeyManagerError::SlashableAttestation(format!(
                "{} already voted for target epoch {}",
                self.pubkey, target
            )));
        }

        for prev in &self.signed_attestations {
            if prev.source_epoch < source && target < prev.target_epoch {
                return Err(KeyManagerError::SlashableAttestation(format!(
                    "({}, {}) is surrounded by ({}, {})",
                    source, target, prev.source_epoch, prev.target_epoch
                )));
            }
            if source < prev.source_epoch && prev.target_epoch < target {
                return Err(KeyManagerError::SlashableAttestation(format!(
                    "({}, {}) surrounds ({}, {})",
                    source, target, prev.source_epoch, prev.target_epoch
                )));
            }
        }

        if let Some(min) = self.min_source() {
            if source < min {
                return Err(KeyManagerError::SlashableAttestation(format!(
                    "source {} is below the lowest recorded source {}",
                    source, min
                )));
            }
        }
        if let Some(min) = self.min_target() {
            if target <= min {
                return Err(KeyManagerError::SlashableAttestation(format!(
                    "target {} is not above the lowest recorded target {}",
                    target, min
                )));
            }
        }

        Ok(Safe::Valid)
    }
}

/// Per-validator cell. `None` until the record has been written once.
type RecordCell = Arc<Mutex<Option<ProtectionRecord>>>;

/// Durable per-validator signing history
pub struct SlashingProtectionStore {
    persistence: Arc<dyn Persistence>,
    genesis_validators_root: Root,
    records: RwLock<HashMap<PublicKey, RecordCell>>,
}

impl SlashingProtectionStore {
    /// Open the store for `genesis_validators_root`, loading every record.
    ///
    /// Fails if the store was created for a different chain.
    pub fn open(persistence: Arc<dyn Persistence>, genesis_validators_root: Root) -> Result<Self> {
        match persistence.get(METADATA_DOC)? {
            Some(bytes) => {
                let metadata: StoreMetadata = serde_json::from_slice(&bytes)?;
                if metadata.genesis_validators_root != genesis_validators_root {
                    return Err(KeyManagerError::GenesisRootMismatch {
                        expected: metadata.genesis_validators_root.to_hex(),
                        found: genesis_validators_root.to_hex(),
                    });
                }
            }
            None => {
                let metadata = StoreMetadata {
                    genesis_validators_root,
                };
                persistence.put(METADATA_DOC, &serde_json::to_vec_pretty(&metadata)?)?;
                info!(
                    "Initialized slashing protection for genesis root {}",
                    genesis_validators_root
                );
            }
        }

        let mut records = HashMap::new();
        for name in persistence.list()? {
            if name == METADATA_DOC {
                continue;
            }
            let Some(bytes) = persistence.get(&name)? else {
                continue;
            };
            let data: InterchangeData = serde_json::from_slice(&bytes)?;
            if data.pubkey.file_stem() != name {
                warn!("Slashing record {} is stored under the wrong name", data.pubkey);
            }
            let record = ProtectionRecord::from_data(data);
            records.insert(record.pubkey, Arc::new(Mutex::new(Some(record))));
        }

        info!("Loaded {} slashing protection records", records.len());

        Ok(Self {
            persistence,
            genesis_validators_root,
            records: RwLock::new(records),
        })
    }

    pub fn genesis_validators_root(&self) -> Root {
        self.genesis_validators_root
    }

    pub fn has_record(&self, pubkey: &PublicKey) -> bool {
        self.existing_cell(pubkey)
            .map_or(false, |cell| cell.lock().is_some())
    }

    /// Ensure a (possibly empty) record exists for `pubkey`
    pub fn register(&self, pubkey: &PublicKey) -> Result<()> {
        self.update(pubkey, |_| Ok(()))
    }

    /// Union `pubkey`'s slice of `interchange` into its record, creating the
    /// record if needed. Entries for other keys are ignored.
    pub fn merge_for(&self, pubkey: &PublicKey, interchange: &Interchange) -> Result<()> {
        self.check_genesis(interchange)?;
        self.update(pubkey, |record| {
            for data in interchange.entries_for(pubkey) {
                record.union(data);
            }
            Ok(())
        })
    }

    /// Merge every record in `interchange`
    pub fn import_interchange(&self, interchange: &Interchange) -> Result<()> {
        self.check_genesis(interchange)?;

        let mut seen = HashSet::new();
        for data in &interchange.data {
            if seen.insert(data.pubkey) {
                self.merge_for(&data.pubkey, interchange)?;
            }
        }

        debug!("Imported slashing protection for {} keys", seen.len());
        Ok(())
    }

    /// Parse and merge a serialized interchange document
    pub fn import_record(&self, json: &str) -> Result<()> {
        let interchange = Interchange::from_json(json)?;
        self.import_interchange(&interchange)
    }

    /// Interchange document for one key, if it has a record
    pub fn export_record(&self, pubkey: &PublicKey) -> Option<Interchange> {
        if !self.has_record(pubkey) {
            return None;
        }
        Some(self.export(std::slice::from_ref(pubkey)))
    }

    /// Interchange document for the listed keys that have records, in
    /// first-seen order without duplicates
    pub fn export(&self, pubkeys: &[PublicKey]) -> Interchange {
        let mut interchange = Interchange::new(self.genesis_validators_root);
        let mut seen = HashSet::new();

        for pubkey in pubkeys {
            if !seen.insert(*pubkey) {
                continue;
            }
            if let Some(cell) = self.existing_cell(pubkey) {
                if let Some(record) = cell.lock().as_ref() {
                    interchange.data.push(record.to_data());
                }
            }
        }

        interchange
    }

    /// Record a block proposal unless it could be slashable
    pub fn check_and_insert_block(
        &self,
        pubkey: &PublicKey,
        slot: u64,
        signing_root: Root,
    ) -> Result<Safe> {
        self.update(pubkey, |record| {
            let safe = record.check_block(slot, signing_root)?;
            if safe == Safe::Valid {
                record.signed_blocks.insert(SignedBlock {
                    slot,
                    signing_root: Some(signing_root),
                });
            }
            Ok(safe)
        })
    }

    /// Record an attestation unless it could be slashable
    pub fn check_and_insert_attestation(
        &self,
        pubkey: &PublicKey,
        source_epoch: u64,
        target_epoch: u64,
        signing_root: Root,
    ) -> Result<Safe> {
        self.update(pubkey, |record| {
            let safe = record.check_attestation(source_epoch, target_epoch, signing_root)?;
            if safe == Safe::Valid {
                record.signed_attestations.insert(SignedAttestation {
                    source_epoch,
                    target_epoch,
                    signing_root: Some(signing_root),
                });
            }
            Ok(safe)
        })
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records
            .read()
            .values()
            .filter(|cell| cell.lock().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_genesis(&self, interchange: &Interchange) -> Result<()> {
        let found = interchange.genesis_validators_root();
        if found != self.genesis_validators_root {
            return Err(KeyManagerError::GenesisRootMismatch {
                expected: self.genesis_validators_root.to_hex(),
                found: found.to_hex(),
            });
        }
        Ok(())
    }

    fn existing_cell(&self, pubkey: &PublicKey) -> Option<RecordCell> {
        self.records.read().get(pubkey).cloned()
    }

    fn cell(&self, pubkey: &PublicKey) -> RecordCell {
        if let Some(cell) = self.existing_cell(pubkey) {
            return cell;
        }
        self.records
            .write()
            .entry(*pubkey)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Apply `f` to a copy of the record, persist the copy if it changed,
    /// then publish it
    fn update<T>(
        &self,
        pubkey: &PublicKey,
        f: impl FnOnce(&mut ProtectionRecord) -> Result<T>,
    ) -> Result<T> {
        let cell = self.cell(pubkey);
        let mut current = cell.lock();

        let mut updated = current
            .clone()
            .unwrap_or_else(|| ProtectionRecord::empty(*pubkey));
        let out = f(&mut updated)?;

        if current.as_ref() != Some(&updated) {
            let bytes = serde_json::to_vec_pretty(&updated.to_data())?;
            self.persistence.put(&pubkey.file_stem(), &bytes)?;
            *current = Some(updated);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretHandle;
    use crate::persistence::testing::FaultyStore;
    use crate::persistence::FileStore;
    use tempfile::tempdir;

    fn pk(seed: u8) -> PublicKey {
        SecretHandle::from_seed(&[seed; 32]).unwrap().public_key()
    }

    fn genesis() -> Root {
        Root::new([7u8; 32])
    }

    fn root(byte: u8) -> Root {
        Root::new([byte; 32])
    }

    fn interchange_with(entries: Vec<InterchangeData>) -> Interchange {
        let mut interchange = Interchange::new(genesis());
        interchange.data = entries;
        interchange
    }

    fn blocks(pubkey: PublicKey, slots: &[u64]) -> InterchangeData {
        InterchangeData {
            pubkey,
            signed_blocks: slots
                .iter()
                .map(|&slot| SignedBlock {
                    slot,
                    signing_root: None,
                })
                .collect(),
            signed_attestations: vec![],
        }
    }

    fn open_memory() -> SlashingProtectionStore {
        SlashingProtectionStore::open(Arc::new(FaultyStore::new()), genesis()).unwrap()
    }

    #[test]
    fn test_merge_is_union_and_idempotent() {
        let store = open_memory();
        let a = pk(1);

        store
            .merge_for(&a, &interchange_with(vec![blocks(a, &[5, 3])]))
            .unwrap();
        store
            .merge_for(&a, &interchange_with(vec![blocks(a, &[3, 9])]))
            .unwrap();
        let first = store.export_record(&a).unwrap();
        store
            .merge_for(&a, &interchange_with(vec![blocks(a, &[9])]))
            .unwrap();
        let second = store.export_record(&a).unwrap();

        assert_eq!(first, second);
        let slots: Vec<_> = first.data[0].signed_blocks.iter().map(|b| b.slot).collect();
        assert_eq!(slots, vec![3, 5, 9]);
    }

    #[test]
    fn test_merge_ignores_other_keys() {
        let store = open_memory();
        let (a, b) = (pk(1), pk(2));

        store
            .merge_for(&a, &interchange_with(vec![blocks(b, &[1])]))
            .unwrap();
        assert!(store.has_record(&a));
        assert!(!store.has_record(&b));
        assert!(store.export_record(&a).unwrap().data[0]
            .signed_blocks
            .is_empty());
    }

    #[test]
    fn test_genesis_mismatch() {
        let store = open_memory();
        let mut other = Interchange::new(Root::new([9u8; 32]));
        other.data.push(blocks(pk(1), &[1]));

        assert!(matches!(
            store.import_interchange(&other),
            Err(KeyManagerError::GenesisRootMismatch { .. })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_import_record_from_json() {
        let store = open_memory();
        let (a, b) = (pk(1), pk(2));

        assert!(matches!(
            store.import_record("{\"metadata\": 5"),
            Err(KeyManagerError::Parse(_))
        ));

        let mut foreign = Interchange::new(Root::new([9u8; 32]));
        foreign.data.push(blocks(a, &[1]));
        assert!(matches!(
            store.import_record(&foreign.to_json().unwrap()),
            Err(KeyManagerError::GenesisRootMismatch { .. })
        ));
        assert!(store.is_empty());

        let doc = interchange_with(vec![blocks(a, &[4, 2]), blocks(b, &[7]), blocks(a, &[6])])
            .to_json()
            .unwrap();
        store.import_record(&doc).unwrap();
        let first = store.export(&[a, b]);
        store.import_record(&doc).unwrap();
        assert_eq!(store.export(&[a, b]), first);

        let slots: Vec<_> = first.data[0].signed_blocks.iter().map(|b| b.slot).collect();
        assert_eq!(slots, vec![2, 4, 6]);
        assert_eq!(first.data[1].pubkey, b);
    }

    #[test]
    fn test_reopen_with_other_genesis_fails() {
        let dir = tempdir().unwrap();
        let files: Arc<dyn Persistence> = Arc::new(FileStore::open(dir.path()).unwrap());
        SlashingProtectionStore::open(files.clone(), genesis()).unwrap();

        assert!(matches!(
            SlashingProtectionStore::open(files, root(1)),
            Err(KeyManagerError::GenesisRootMismatch { .. })
        ));
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let a = pk(3);
        {
            let files = Arc::new(FileStore::open(dir.path()).unwrap());
            let store = SlashingProtectionStore::open(files, genesis()).unwrap();
            store
                .import_interchange(&interchange_with(vec![blocks(a, &[10, 11])]))
                .unwrap();
        }

        let files = Arc::new(FileStore::open(dir.path()).unwrap());
        let store = SlashingProtectionStore::open(files, genesis()).unwrap();
        assert!(store.has_record(&a));
        assert_eq!(store.export_record(&a).unwrap().data[0].signed_blocks.len(), 2);
    }

    #[test]
    fn test_failed_write_creates_no_record() {
        let faulty = Arc::new(FaultyStore::new());
        let store = SlashingProtectionStore::open(faulty.clone(), genesis()).unwrap();
        faulty.set_fail_puts(true);

        assert!(store.register(&pk(4)).is_err());
        assert!(!store.has_record(&pk(4)));
        assert!(store.export(&[pk(4)]).is_empty());
    }

    #[test]
    fn test_export_dedups_in_order() {
        let store = open_memory();
        let (a, b, c) = (pk(1), pk(2), pk(3));
        store.register(&a).unwrap();
        store.register(&b).unwrap();

        let export = store.export(&[b, c, a, b]);
        let keys: Vec<_> = export.data.iter().map(|d| d.pubkey).collect();
        assert_eq!(keys, vec![b, a]);
        assert_eq!(export.genesis_validators_root(), genesis());
    }

    #[test]
    fn test_block_rules() {
        let store = open_memory();
        let a = pk(1);

        assert_eq!(store.check_and_insert_block(&a, 10, root(1)).unwrap(), Safe::Valid);
        assert_eq!(
            store.check_and_insert_block(&a, 10, root(1)).unwrap(),
            Safe::SameData
        );
        assert!(matches!(
            store.check_and_insert_block(&a, 10, root(2)),
            Err(KeyManagerError::SlashableBlock(_))
        ));
        assert!(matches!(
            store.check_and_insert_block(&a, 9, root(3)),
            Err(KeyManagerError::SlashableBlock(_))
        ));
        assert_eq!(store.check_and_insert_block(&a, 11, root(4)).unwrap(), Safe::Valid);
    }

    #[test]
    fn test_imported_block_without_root_blocks_resign() {
        let store = open_memory();
        let a = pk(1);
        store
            .merge_for(&a, &interchange_with(vec![blocks(a, &[20])]))
            .unwrap();

        assert!(store.check_and_insert_block(&a, 20, root(1)).is_err());
        assert!(store.check_and_insert_block(&a, 21, root(1)).is_ok());
    }

    #[test]
    fn test_attestation_rules() {
        let store = open_memory();
        let a = pk(1);

        assert_eq!(
            store.check_and_insert_attestation(&a, 2, 5, root(1)).unwrap(),
            Safe::Valid
        );
        assert_eq!(
            store.check_and_insert_attestation(&a, 2, 5, root(1)).unwrap(),
            Safe::SameData
        );
        // double vote
        assert!(store.check_and_insert_attestation(&a, 2, 5, root(2)).is_err());
        // surrounding
        assert!(store.check_and_insert_attestation(&a, 1, 6, root(3)).is_err());
        // surrounded
        assert!(store.check_and_insert_attestation(&a, 3, 4, root(3)).is_err());
        // below the target watermark
        assert!(store.check_and_insert_attestation(&a, 2, 4, root(3)).is_err());
        // below the source watermark
        assert!(store.check_and_insert_attestation(&a, 1, 7, root(3)).is_err());

        assert_eq!(
            store.check_and_insert_attestation(&a, 5, 6, root(4)).unwrap(),
            Safe::Valid
        );
    }

    #[test]
    fn test_concurrent_appends_all_land() {
        let store = Arc::new(open_memory());
        let a = pk(1);
        store.register(&a).unwrap();

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25u64 {
                        let slot = 1 + t * 100 + i;
                        let _ = store.check_and_insert_block(&a, slot, root(1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Slots below the running minimum may be refused, but nothing accepted is lost
        let record = store.export_record(&a).unwrap();
        let slots: BTreeSet<_> = record.data[0].signed_blocks.iter().map(|b| b.slot).collect();
        assert_eq!(slots.len(), record.data[0].signed_blocks.len());
        assert!(!slots.is_empty());
    }
}
