//! EIP-3076 slashing protection interchange format

use crate::crypto::{PublicKey, Root};
use crate::errors::{KeyManagerError, Result};
use serde::{Deserialize, Serialize};

/// The only interchange version this node reads or writes
pub const INTERCHANGE_FORMAT_VERSION: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interchange {
    pub metadata: InterchangeMetadata,
    pub data: Vec<InterchangeData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterchangeMetadata {
    #[serde(with = "quoted_u64")]
    pub interchange_format_version: u64,
    pub genesis_validators_root: Root,
}

/// Signing history of one validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterchangeData {
    pub pubkey: PublicKey,
    #[serde(default)]
    pub signed_blocks: Vec<SignedBlock>,
    #[serde(default)]
    pub signed_attestations: Vec<SignedAttestation>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignedBlock {
    #[serde(with = "quoted_u64")]
    pub slot: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_root: Option<Root>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SignedAttestation {
    #[serde(with = "quoted_u64")]
    pub source_epoch: u64,
    #[serde(with = "quoted_u64")]
    pub target_epoch: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_root: Option<Root>,
}

impl Interchange {
    /// Empty document for `genesis_validators_root`
    pub fn new(genesis_validators_root: Root) -> Self {
        Self {
            metadata: InterchangeMetadata {
                interchange_format_version: INTERCHANGE_FORMAT_VERSION,
                genesis_validators_root,
            },
            data: Vec::new(),
        }
    }

    /// Parse and validate a document. Any failure is a `Parse` error.
    pub fn from_json(json: &str) -> Result<Self> {
        let interchange: Interchange = serde_json::from_str(json)
            .map_err(|e| KeyManagerError::Parse(e.to_string()))?;

        if interchange.metadata.interchange_format_version != INTERCHANGE_FORMAT_VERSION {
            return Err(KeyManagerError::Parse(format!(
                "unsupported interchange_format_version {}, expected {}",
                interchange.metadata.interchange_format_version, INTERCHANGE_FORMAT_VERSION
            )));
        }

        for entry in &interchange.data {
            if let Some(att) = entry
                .signed_attestations
                .iter()
                .find(|a| a.source_epoch > a.target_epoch)
            {
                return Err(KeyManagerError::Parse(format!(
                    "attestation for {} has source {} after target {}",
                    entry.pubkey, att.source_epoch, att.target_epoch
                )));
            }
        }

        Ok(interchange)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn genesis_validators_root(&self) -> Root {
        self.metadata.genesis_validators_root
    }

    /// All entries for `pubkey`. The format allows a key to appear more than once.
    pub fn entries_for<'a>(
        &'a self,
        pubkey: &'a PublicKey,
    ) -> impl Iterator<Item = &'a InterchangeData> + 'a {
        self.data.iter().filter(move |d| &d.pubkey == pubkey)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Integers carried as decimal strings. Bare JSON numbers are accepted on input.
pub(crate) mod quoted_u64 {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        struct QuotedU64;

        impl<'de> Visitor<'de> for QuotedU64 {
            type Value = u64;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal string or unsigned integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
                Ok(v)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
                v.parse().map_err(|_| E::custom(format!("invalid integer {:?}", v)))
            }
        }

        deserializer.deserialize_any(QuotedU64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretHandle;

    const ROOT: &str = "0x04700007fabc8282644aed6d1c7c9e21d38a03a0c4ba193f3afe428824b3a673";

    fn pubkey() -> PublicKey {
        SecretHandle::from_seed(&[1u8; 32]).unwrap().public_key()
    }

    #[test]
    fn test_parse_minimal_document() {
        let json = format!(
            r#"{{
                "metadata": {{"interchange_format_version": "5", "genesis_validators_root": "{}"}},
                "data": [{{
                    "pubkey": "{}",
                    "signed_blocks": [{{"slot": "81952", "signing_root": "{}"}}, {{"slot": 81951}}],
                    "signed_attestations": [{{"source_epoch": "2290", "target_epoch": "3007"}}]
                }}]
            }}"#,
            ROOT,
            pubkey(),
            ROOT
        );

        let interchange = Interchange::from_json(&json).unwrap();
        assert_eq!(interchange.genesis_validators_root().to_hex(), ROOT);
        let entry = &interchange.data[0];
        assert_eq!(entry.signed_blocks[0].slot, 81952);
        assert!(entry.signed_blocks[0].signing_root.is_some());
        assert_eq!(entry.signed_blocks[1].slot, 81951);
        assert_eq!(entry.signed_attestations[0].target_epoch, 3007);
    }

    #[test]
    fn test_slots_serialize_as_strings() {
        let mut interchange = Interchange::new(Root::from_hex(ROOT).unwrap());
        interchange.data.push(InterchangeData {
            pubkey: pubkey(),
            signed_blocks: vec![SignedBlock {
                slot: 7,
                signing_root: None,
            }],
            signed_attestations: vec![],
        });

        let value: serde_json::Value =
            serde_json::from_str(&interchange.to_json().unwrap()).unwrap();
        assert_eq!(value["metadata"]["interchange_format_version"], "5");
        assert_eq!(value["data"][0]["signed_blocks"][0]["slot"], "7");
        assert!(value["data"][0]["signed_blocks"][0].get("signing_root").is_none());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            Interchange::from_json("not json"),
            Err(KeyManagerError::Parse(_))
        ));

        let wrong_version = format!(
            r#"{{"metadata": {{"interchange_format_version": "4", "genesis_validators_root": "{}"}}, "data": []}}"#,
            ROOT
        );
        assert!(matches!(
            Interchange::from_json(&wrong_version),
            Err(KeyManagerError::Parse(_))
        ));

        let bad_pubkey = format!(
            r#"{{"metadata": {{"interchange_format_version": "5", "genesis_validators_root": "{}"}},
                "data": [{{"pubkey": "0x1234", "signed_blocks": [], "signed_attestations": []}}]}}"#,
            ROOT
        );
        assert!(Interchange::from_json(&bad_pubkey).is_err());
    }

    #[test]
    fn test_rejects_inverted_attestation() {
        let json = format!(
            r#"{{"metadata": {{"interchange_format_version": "5", "genesis_validators_root": "{}"}},
                "data": [{{"pubkey": "{}", "signed_blocks": [],
                    "signed_attestations": [{{"source_epoch": "10", "target_epoch": "9"}}]}}]}}"#,
            ROOT,
            pubkey()
        );
        assert!(matches!(
            Interchange::from_json(&json),
            Err(KeyManagerError::Parse(_))
        ));
    }
}
