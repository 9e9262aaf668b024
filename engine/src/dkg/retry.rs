//! Retry loop driving repeated DKG attempts for one controlled member.
//!
//! Attempts within one loop are strictly sequential: attempt `n + 1` never
//! starts before attempt `n` concluded. Failures stay inside the loop;
//! only the session-level timeout escapes it as an error.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::{cancel_on_block, BlockCounter, BlockHeight};
use crate::config::ChainConfig;
use crate::dkg::{state, DkgOutput};
use crate::error::{DkgAttemptError, DkgError};
use crate::types::{DkgSeed, MemberIndex};

/// Blocks an attempt may run before its deadline cancels it.
pub const ATTEMPT_MAX_BLOCK_DURATION: u64 = 100;

/// Back-off in blocks between a failed attempt and the next one.
pub const ATTEMPT_BACKOFF_BLOCKS: u64 = 5;

/// Parameters of a single attempt, created only by the retry loop.
#[derive(Debug, Clone)]
pub struct DkgAttempt {
    /// Sequential attempt number, starting at 1.
    pub number: u64,
    pub start_block: BlockHeight,
    /// Members excluded from this attempt. Grows monotonically: once
    /// excluded, an index is never re-included within the session.
    pub excluded_members: BTreeSet<MemberIndex>,
}

/// Drives attempts against the DKG executor until a result is produced,
/// the session times out, or an external stop signal arrives.
pub struct DkgRetryLoop {
    seed: DkgSeed,
    session_start_block: BlockHeight,
    member_index: MemberIndex,
    config: ChainConfig,
    block_counter: Arc<dyn BlockCounter>,
    excluded_members: BTreeSet<MemberIndex>,
    attempt_counter: u64,
}

impl DkgRetryLoop {
    pub fn new(
        seed: DkgSeed,
        session_start_block: BlockHeight,
        member_index: MemberIndex,
        config: ChainConfig,
        block_counter: Arc<dyn BlockCounter>,
    ) -> Self {
        Self {
            seed,
            session_start_block,
            member_index,
            config,
            block_counter,
            excluded_members: BTreeSet::new(),
            attempt_counter: 0,
        }
    }

    /// Runs attempts until one succeeds, returning its output.
    ///
    /// Returns `Ok(None)` when `cancel` fires: a stop signal means another
    /// member already produced a result, which is not a failure. Returns
    /// [`DkgError::SessionTimedOut`] when the session-level timeout
    /// elapses before any attempt succeeds.
    pub async fn start<F, Fut>(
        &mut self,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> Result<Option<DkgOutput>, DkgError>
    where
        F: FnMut(DkgAttempt, CancellationToken) -> Fut,
        Fut: Future<Output = Result<DkgOutput, DkgAttemptError>>,
    {
        let mut next_attempt_block = self.session_start_block;

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            self.block_counter
                .wait_for_block_height(cancel, next_attempt_block)
                .await?;
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let now = self.block_counter.current_block().await?;
            if state::has_timed_out(self.session_start_block, None, now, &self.config) {
                warn!(
                    seed = %self.seed,
                    member = %self.member_index,
                    block = now,
                    "DKG session timed out before an attempt succeeded",
                );
                return Err(DkgError::SessionTimedOut);
            }

            self.attempt_counter += 1;
            let attempt = DkgAttempt {
                number: self.attempt_counter,
                start_block: next_attempt_block.max(now),
                excluded_members: self.excluded_members.clone(),
            };

            // Attempt deadline tracked in block height, not wall-clock.
            let attempt_cancel = cancel_on_block(
                cancel,
                Arc::clone(&self.block_counter),
                attempt.start_block + ATTEMPT_MAX_BLOCK_DURATION,
            );

            let failure_block = attempt.start_block;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                outcome = attempt_fn(attempt, attempt_cancel) => outcome,
            };

            match outcome {
                Ok(output) => return Ok(Some(output)),
                Err(error) => {
                    if cancel.is_cancelled() {
                        return Ok(None);
                    }

                    info!(
                        seed = %self.seed,
                        member = %self.member_index,
                        attempt = self.attempt_counter,
                        %error,
                        "dkg attempt failed; retrying",
                    );

                    if let DkgAttemptError::MembersInactive { inactive } = &error {
                        self.exclude_members(inactive);
                    }

                    let observed = self.block_counter.current_block().await?;
                    next_attempt_block = observed.max(failure_block) + ATTEMPT_BACKOFF_BLOCKS;
                }
            }
        }
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.attempt_counter
    }

    /// Permanently excludes the blamed indices for the rest of the
    /// session. The local member's own index is never excluded; doing so
    /// would silently end this task while other members still count on it.
    fn exclude_members(&mut self, blamed: &[MemberIndex]) {
        for index in blamed {
            if *index == self.member_index {
                warn!(
                    seed = %self.seed,
                    member = %self.member_index,
                    "attempt blamed the local member index; not excluding self",
                );
                continue;
            }
            self.excluded_members.insert(*index);
        }
    }
}
