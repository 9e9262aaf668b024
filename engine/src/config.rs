//! Chain parameters shared by every protocol component.

/// Length in bytes of a single result-hash signature on the wire.
pub const SIGNATURE_LENGTH: usize = 65;

/// Length in bytes of a group public key on the wire.
pub const GROUP_PUBLIC_KEY_LENGTH: usize = 128;

/// Parameters of the on-chain group contract, mirrored locally.
///
/// Block-denominated durations: correctness of the protocol is defined in
/// ledger time, never wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    /// Size of a signing group.
    pub group_size: usize,
    /// Minimum number of honest members required for the group to function.
    pub group_threshold: usize,
    /// Duration in blocks of the off-chain key generation window.
    pub key_generation_window: u64,
    /// Per-member stagger in blocks between result submission windows.
    pub submission_delay_step: u64,
    /// Duration in blocks of the challenge period after a result submission.
    pub result_challenge_period: u64,
}

impl ChainConfig {
    /// Production parameters of the group contract.
    pub fn mainnet() -> Self {
        Self {
            group_size: 64,
            group_threshold: 33,
            key_generation_window: 150,
            submission_delay_step: 10,
            result_challenge_period: 11_520,
        }
    }

    /// Maximum number of members allowed to misbehave during the protocol.
    pub fn dishonest_threshold(&self) -> usize {
        self.group_size - self.group_threshold
    }

    /// Number of result-hash signatures the ledger requires on a submission.
    ///
    /// The threshold plus half of the remainder, rounded up: a submitted
    /// result must be supported by a clear majority of the non-threshold
    /// members as well.
    pub fn signature_threshold(&self) -> usize {
        let remainder = self.group_size - self.group_threshold;
        self.group_threshold + remainder.div_ceil(2)
    }

    /// Quorum required of the operating member set for the final signing
    /// group to be viable.
    pub fn group_quorum(&self) -> usize {
        self.group_threshold
    }
}
