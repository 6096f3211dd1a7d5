//! Slashing protection
//!
//! Keeps the signing history of every validator this node has held a key for,
//! including keys that have since been deleted.

pub mod interchange;
pub mod store;

pub use interchange::{
    Interchange, InterchangeData, InterchangeMetadata, SignedAttestation, SignedBlock,
    INTERCHANGE_FORMAT_VERSION,
};
pub use store::{ProtectionRecord, Safe, SlashingProtectionStore};
