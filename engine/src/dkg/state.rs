//! Pure model of the on-chain DKG state machine.
//!
//! The phase is never stored anywhere, on-chain or locally. It is always
//! recomputed from `(start_block, submitted_result_block, now)` so that no
//! two observers of the same ledger can ever hold diverging phase values.

use crate::chain::BlockHeight;
use crate::config::ChainConfig;
use crate::types::MemberIndex;

/// Phase of a DKG session as defined by the group contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DkgPhase {
    /// No session active.
    Idle,
    /// Fixed-duration off-chain computation window.
    KeyGeneration,
    /// Computation window elapsed; submissions accepted, gated by the
    /// per-member eligibility delay.
    AwaitingResult,
    /// A result was submitted and awaits approval or challenge.
    Challenge,
}

/// Computes the session phase at block `now`.
///
/// Pure, total and monotonic in `now`; the only regression is
/// `Challenge -> AwaitingResult`, reached when a successful challenge
/// clears `submitted_result_block`.
pub fn phase(
    start_block: Option<BlockHeight>,
    submitted_result_block: Option<BlockHeight>,
    now: BlockHeight,
    config: &ChainConfig,
) -> DkgPhase {
    let Some(start_block) = start_block else {
        return DkgPhase::Idle;
    };

    if let Some(submitted) = submitted_result_block {
        if now <= submitted + config.result_challenge_period {
            return DkgPhase::Challenge;
        }
        // Unchallenged past the period: the result stands, session over.
        return DkgPhase::Idle;
    }

    if now < start_block {
        return DkgPhase::Idle;
    }

    if now < start_block + config.key_generation_window {
        return DkgPhase::KeyGeneration;
    }

    DkgPhase::AwaitingResult
}

/// First block at which the given member may submit a result.
///
/// Each member gets its own delay slot, opening one step after the
/// previous member's. This guarantees liveness (every honest member
/// eventually gets a window) without simultaneous colliding submissions.
pub fn submission_window_opens(
    start_block: BlockHeight,
    member_index: MemberIndex,
    config: &ChainConfig,
) -> BlockHeight {
    start_block
        + config.key_generation_window
        + (member_index.get() as u64 - 1) * config.submission_delay_step
}

/// Last block at which any submission is accepted; the block at which the
/// highest member index becomes eligible.
pub fn session_timeout_block(start_block: BlockHeight, config: &ChainConfig) -> BlockHeight {
    start_block
        + config.key_generation_window
        + (config.group_size as u64 - 1) * config.submission_delay_step
}

/// True iff the session is awaiting a result and the timeout block has
/// passed.
pub fn has_timed_out(
    start_block: BlockHeight,
    submitted_result_block: Option<BlockHeight>,
    now: BlockHeight,
    config: &ChainConfig,
) -> bool {
    phase(Some(start_block), submitted_result_block, now, config) == DkgPhase::AwaitingResult
        && now > session_timeout_block(start_block, config)
}
