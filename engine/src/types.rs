//! Shared data types for the threshold engine: member indices, operator
//! addresses, session seeds and key shares.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// One-based index of a member within a signing group.
///
/// Valid values are in `[1, group_size]`. Index `0` never appears on the
/// wire; the ledger rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberIndex(pub u8);

impl MemberIndex {
    /// Raw index value.
    pub fn get(&self) -> u8 {
        self.0
    }

    /// Index as a zero-based position into the ordered operator list.
    pub fn position(&self) -> usize {
        (self.0 as usize).saturating_sub(1)
    }

    /// True if the index is inside `[1, group_size]`.
    pub fn is_in_range(&self, group_size: usize) -> bool {
        self.0 >= 1 && (self.0 as usize) <= group_size
    }
}

impl fmt::Display for MemberIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chain address of an operator, as delivered by group selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorAddress(pub String);

impl fmt::Display for OperatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Seed of one DKG session. Identifies the session together with its
/// start block; also scopes the broadcast channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DkgSeed(pub [u8; 32]);

impl DkgSeed {
    /// Hex form used for channel names and session ids.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DkgSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

/// A signature produced by an operator key over a result hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(pub Vec<u8>);

/// Digest signed during result publication.
pub type ResultHash = [u8; 32];

/// Opaque private key share produced by the DKG executor.
///
/// Never serialized and never logged; wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare(pub Vec<u8>);

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyShare(<redacted>)")
    }
}
