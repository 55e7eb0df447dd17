//! Representation records
//!
//! In-memory shape of a stored representation: either a fulltext backed by a
//! single string, or an ordered chain of delta chunks against another
//! representation. Persisted through the reps table as bincode.

use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};

/// Length of a content digest in bytes.
pub const MD5_DIGEST_SIZE: usize = 16;

/// MD5 of the empty string.
pub const EMPTY_MD5: [u8; MD5_DIGEST_SIZE] = [
    0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec, 0xf8, 0x42,
    0x7e,
];

/// All-zero sentinel digest: not yet computed, accepts any comparison.
pub const ZERO_MD5: [u8; MD5_DIGEST_SIZE] = [0; MD5_DIGEST_SIZE];

/// Compare two digests, treating the all-zero sentinel on either side as a
/// match.
pub fn digests_match(a: &[u8; MD5_DIGEST_SIZE], b: &[u8; MD5_DIGEST_SIZE]) -> bool {
    *a == ZERO_MD5 || *b == ZERO_MD5 || a == b
}

/// Key of a byte string in the strings table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StringKey(String);

/// Key of a representation record in the reps table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepKey(String);

/// Identifier of the transaction that owns a mutable representation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(String);

macro_rules! key_impls {
    ($name:ident) => {
        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

key_impls!(StringKey);
key_impls!(RepKey);
key_impls!(TxnId);

/// One link of a delta representation's chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaChunk {
    /// Byte offset into the reconstructed fulltext where this chunk begins
    pub offset: u64,
    /// Number of fulltext bytes this chunk represents
    pub size: u64,
    /// Wire-format version of the stored diff
    pub version: u8,
    /// Strings-table key holding this chunk's serialized diff payload
    pub string_key: StringKey,
    /// The source representation this chunk deltas against
    pub rep_key: RepKey,
    /// Digest recorded when the chunk was written (informational)
    pub checksum: [u8; MD5_DIGEST_SIZE],
}

/// Contents of a representation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RepContents {
    /// The whole content lives in one string
    Fulltext { string_key: StringKey },
    /// The content is a chain of delta windows against another rep
    Delta { chunks: Vec<DeltaChunk> },
}

/// A representation record as persisted in the reps table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    /// Owning transaction, if the rep is still mutable
    pub txn_id: Option<TxnId>,
    /// MD5 of the full reconstructed content, or the zero sentinel
    pub checksum: [u8; MD5_DIGEST_SIZE],
    pub contents: RepContents,
}

impl Representation {
    /// Build a fulltext representation referencing `string_key`.
    ///
    /// With a `txn_id` the rep is mutable under that transaction. Without a
    /// `checksum` the rep carries the zero sentinel.
    pub fn fulltext(
        string_key: StringKey,
        txn_id: Option<TxnId>,
        checksum: Option<[u8; MD5_DIGEST_SIZE]>,
    ) -> Self {
        Self {
            txn_id,
            checksum: checksum.unwrap_or(ZERO_MD5),
            contents: RepContents::Fulltext { string_key },
        }
    }

    /// True iff the rep is mutable under `txn_id`.
    pub fn is_mutable(&self, txn_id: &TxnId) -> bool {
        self.txn_id.as_ref() == Some(txn_id)
    }

    pub fn is_fulltext(&self) -> bool {
        matches!(self.contents, RepContents::Fulltext { .. })
    }

    /// The string keys owned by a delta rep's chunks, in chain order.
    ///
    /// Errors with `General` when called on a fulltext rep.
    pub fn delta_string_keys(&self) -> Result<Vec<StringKey>> {
        match &self.contents {
            RepContents::Delta { chunks } => {
                Ok(chunks.iter().map(|c| c.string_key.clone()).collect())
            }
            RepContents::Fulltext { .. } => Err(FsError::General(
                "representation is not of kind `delta`".to_string(),
            )),
        }
    }

    /// Serialize to the persisted record format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from the persisted record format.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
