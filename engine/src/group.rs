//! Group membership checks and final signing group resolution.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::chain::Signing;
use crate::config::ChainConfig;
use crate::error::GroupError;
use crate::net::SenderFilter;
use crate::types::{MemberIndex, OperatorAddress};

/// Authenticates broadcast senders against the operators selected for a
/// session. Installed as a channel filter so spam and impersonation are
/// dropped at the transport boundary, before any protocol logic runs.
pub struct MembershipValidator {
    /// Operator address to all member indices it was selected for. One
    /// operator can hold multiple positions in a group.
    positions: HashMap<OperatorAddress, Vec<MemberIndex>>,
    signing: Arc<dyn Signing>,
}

impl MembershipValidator {
    /// Builds a validator from the ordered operator list; position `i`
    /// corresponds to member index `i + 1`.
    pub fn new(operators: &[OperatorAddress], signing: Arc<dyn Signing>) -> Self {
        let mut positions: HashMap<OperatorAddress, Vec<MemberIndex>> = HashMap::new();
        for (position, operator) in operators.iter().enumerate() {
            positions
                .entry(operator.clone())
                .or_default()
                .push(MemberIndex(position as u8 + 1));
        }
        Self { positions, signing }
    }

    /// True if the sender public key belongs to a selected operator.
    pub fn is_in_group(&self, sender_public_key: &[u8]) -> bool {
        let address = self.signing.public_key_to_address(sender_public_key);
        self.positions.contains_key(&address)
    }

    /// True if the public key belongs to the operator that actually holds
    /// the claimed member index. Guards against a legitimate member
    /// impersonating another member's position.
    pub fn is_valid_membership(&self, member_index: MemberIndex, public_key: &[u8]) -> bool {
        let address = self.signing.public_key_to_address(public_key);
        self.positions
            .get(&address)
            .is_some_and(|indices| indices.contains(&member_index))
    }

    /// Channel filter form of [`Self::is_in_group`].
    pub fn filter(self: &Arc<Self>) -> SenderFilter {
        let validator = Arc::clone(self);
        Arc::new(move |public_key| validator.is_in_group(public_key))
    }
}

/// Resolves the definitive signing group once DKG has completed.
///
/// The original candidate list may shrink: misbehaving, disqualified or
/// inactive members are removed. The final group keeps the relative order
/// of the surviving operators and remaps their member indices to be
/// 1-based and contiguous.
pub fn final_signing_group(
    selected_operators: &[OperatorAddress],
    operating_member_indexes: &[MemberIndex],
    config: &ChainConfig,
) -> Result<(Vec<OperatorAddress>, BTreeMap<MemberIndex, MemberIndex>), GroupError> {
    let operating: BTreeSet<MemberIndex> = operating_member_indexes.iter().copied().collect();

    for index in &operating {
        if !index.is_in_range(selected_operators.len()) {
            return Err(GroupError::OperatingIndexOutOfRange(*index));
        }
    }

    if operating.len() < config.group_quorum() {
        return Err(GroupError::QuorumNotReached {
            required: config.group_quorum(),
            actual: operating.len(),
        });
    }

    let mut final_operators = Vec::with_capacity(operating.len());
    let mut index_remap = BTreeMap::new();
    for (final_position, original_index) in operating.iter().enumerate() {
        final_operators.push(selected_operators[original_index.position()].clone());
        index_remap.insert(*original_index, MemberIndex(final_position as u8 + 1));
    }

    Ok((final_operators, index_remap))
}
