//! DKG result data and the ledger-side verification rules, mirrored
//! locally so a submission can be checked before it is ever sent.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::chain::{BlockHeight, Signing};
use crate::config::{ChainConfig, GROUP_PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use crate::dkg::state;
use crate::error::ResultValidationError;
use crate::types::{MemberIndex, OperatorAddress, ResultHash, Signature};

/// Shareable outcome of a completed DKG protocol. Holds no key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgResult {
    /// Public key of the generated group; fixed-size on the wire.
    pub group_public_key: Vec<u8>,
    /// Operators originally selected for the session, ordered; position
    /// `i` corresponds to member index `i + 1`.
    pub members: Vec<OperatorAddress>,
    /// Member indices excluded from the result for inactivity or
    /// disqualification during protocol execution.
    pub misbehaved_members: Vec<MemberIndex>,
}

impl DkgResult {
    /// Member indices that completed the protocol honestly.
    pub fn operating_member_indexes(&self) -> Vec<MemberIndex> {
        (1..=self.members.len() as u8)
            .map(MemberIndex)
            .filter(|index| !self.misbehaved_members.contains(index))
            .collect()
    }

    /// Digest every supporting signature commits to. Binds the group key,
    /// the misbehaved set and the session start block.
    pub fn hash(&self, start_block: BlockHeight) -> ResultHash {
        let mut hasher = Sha256::new();
        hasher.update(&self.group_public_key);
        for index in &self.misbehaved_members {
            hasher.update([index.get()]);
        }
        hasher.update(start_block.to_be_bytes());
        hasher.finalize().into()
    }
}

/// Wire form of a result submission.
///
/// Signatures and signing indices travel as parallel lists, exactly as the
/// ledger receives them, so verification can detect duplicated indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgResultSubmission {
    pub submitter_member_index: MemberIndex,
    pub result: DkgResult,
    pub signing_member_indices: Vec<MemberIndex>,
    pub signatures: Vec<Signature>,
}

/// Re-check of a submission against the group contract rules.
///
/// The ledger performs exactly these checks on-chain; the local mirror is
/// used by the fake chain in tests and lets a submitter reject its own
/// malformed submission before paying for a doomed transaction.
pub fn validate_result_submission(
    submission: &DkgResultSubmission,
    submitter_address: &OperatorAddress,
    start_block: BlockHeight,
    now: BlockHeight,
    config: &ChainConfig,
    signing: &dyn Signing,
) -> Result<(), ResultValidationError> {
    let result = &submission.result;
    let submitter = submission.submitter_member_index;

    if submitter.get() == 0 {
        return Err(ResultValidationError::ZeroSubmitterIndex);
    }
    if !submitter.is_in_range(result.members.len()) || !submitter.is_in_range(config.group_size) {
        return Err(ResultValidationError::IndexOutOfRange(submitter));
    }
    if &result.members[submitter.position()] != submitter_address {
        return Err(ResultValidationError::SubmitterMismatch(submitter));
    }

    if now > state::session_timeout_block(start_block, config) {
        return Err(ResultValidationError::PastSessionTimeout(now));
    }
    if now < state::submission_window_opens(start_block, submitter, config) {
        return Err(ResultValidationError::NotYetEligible {
            member: submitter,
            block: now,
        });
    }

    if result.group_public_key.len() != GROUP_PUBLIC_KEY_LENGTH {
        return Err(ResultValidationError::MalformedGroupPublicKey {
            expected: GROUP_PUBLIC_KEY_LENGTH,
            actual: result.group_public_key.len(),
        });
    }

    let max_misbehaved = config.group_size - config.signature_threshold();
    if result.misbehaved_members.len() > max_misbehaved {
        return Err(ResultValidationError::TooManyMisbehaved {
            actual: result.misbehaved_members.len(),
            max: max_misbehaved,
        });
    }

    if submission.signatures.len() != submission.signing_member_indices.len() {
        return Err(ResultValidationError::SignatureIndexMismatch);
    }
    let signature_count = submission.signatures.len();
    if signature_count < config.signature_threshold() || signature_count > config.group_size {
        return Err(ResultValidationError::SignatureCountOutOfBounds {
            actual: signature_count,
            min: config.signature_threshold(),
            max: config.group_size,
        });
    }

    let mut seen = BTreeSet::new();
    for index in &submission.signing_member_indices {
        if !index.is_in_range(result.members.len()) || !index.is_in_range(config.group_size) {
            return Err(ResultValidationError::IndexOutOfRange(*index));
        }
        if !seen.insert(*index) {
            return Err(ResultValidationError::DuplicateSigningIndex(*index));
        }
    }

    let digest = result.hash(start_block);
    for (index, signature) in submission
        .signing_member_indices
        .iter()
        .zip(&submission.signatures)
    {
        if signature.0.len() != SIGNATURE_LENGTH {
            return Err(ResultValidationError::MalformedSignature(*index));
        }
        let recovered = signing
            .recover_address(&digest, signature)
            .map_err(|_| ResultValidationError::MalformedSignature(*index))?;
        if recovered != result.members[index.position()] {
            return Err(ResultValidationError::SignatureMismatch(*index));
        }
    }

    Ok(())
}
