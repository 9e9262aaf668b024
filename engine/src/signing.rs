//! Threshold signing against an already-formed wallet group.
//!
//! Structurally mirrors the DKG retry loop: attempt, exclude
//! non-responders, retry - but post-formation and with a bounded number
//! of attempts. Failure is terminal and reported to the caller.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::{cancel_on_block, BlockCounter};
use crate::config::ChainConfig;
use crate::error::{SigningAttemptError, SigningError};
use crate::group::MembershipValidator;
use crate::latch::ProtocolLatch;
use crate::net::BroadcastChannel;
use crate::registry::Signer;
use crate::types::MemberIndex;

/// Blocks a signing attempt may run before its deadline cancels it.
pub const SIGNING_ATTEMPT_MAX_BLOCK_DURATION: u64 = 30;

/// Back-off in blocks between failed signing attempts.
pub const SIGNING_ATTEMPT_BACKOFF_BLOCKS: u64 = 2;

/// Default bound on signing attempts per controlled signer.
pub const DEFAULT_SIGNING_ATTEMPTS_LIMIT: u64 = 5;

/// A complete signature produced by the signing group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSignature(pub Vec<u8>);

/// Opaque cryptographic capability computing one threshold-signing
/// attempt for one controlled signer.
#[async_trait]
pub trait SigningExecutor: Send + Sync {
    async fn sign(
        &self,
        cancel: &CancellationToken,
        message: &[u8],
        signer: &Signer,
        session_id: &str,
        excluded_members: &BTreeSet<MemberIndex>,
        channel: Arc<dyn BroadcastChannel>,
        validator: Arc<MembershipValidator>,
    ) -> Result<GroupSignature, SigningAttemptError>;
}

/// Manages the signers this node controls within one wallet and runs
/// threshold signing operations with them.
pub struct SigningGroupController {
    pub(crate) signers: Vec<Signer>,
    pub(crate) broadcast_channel: Arc<dyn BroadcastChannel>,
    pub(crate) membership_validator: Arc<MembershipValidator>,
    pub(crate) chain_config: ChainConfig,
    pub(crate) block_counter: Arc<dyn BlockCounter>,
    pub(crate) executor: Arc<dyn SigningExecutor>,
    pub(crate) latch: Arc<ProtocolLatch>,
    pub(crate) signing_attempts_limit: u64,
}

impl SigningGroupController {
    /// Signs the message with the wallet group. Each controlled signer
    /// runs its own attempt loop; the first complete signature wins.
    pub async fn sign(
        &self,
        cancel: &CancellationToken,
        message: &[u8],
    ) -> Result<GroupSignature, SigningError> {
        if self.signers.is_empty() {
            return Err(SigningError::NoSignersControlled);
        }

        // Once one signer task holds a signature the others stop.
        let race = cancel.child_token();
        let mut tasks = JoinSet::new();

        for signer in self.signers.clone() {
            let loop_cancel = race.clone();
            let message = message.to_vec();
            let channel = Arc::clone(&self.broadcast_channel);
            let validator = Arc::clone(&self.membership_validator);
            let block_counter = Arc::clone(&self.block_counter);
            let executor = Arc::clone(&self.executor);
            let latch = Arc::clone(&self.latch);
            let config = self.chain_config.clone();
            let attempts_limit = self.signing_attempts_limit;

            tasks.spawn(async move {
                let _guard = latch.acquire();
                signer_attempt_loop(
                    &loop_cancel,
                    &message,
                    &signer,
                    channel,
                    validator,
                    block_counter,
                    executor,
                    &config,
                    attempts_limit,
                )
                .await
            });
        }

        let mut last_error = SigningError::AttemptsExhausted {
            attempts: self.signing_attempts_limit,
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(signature)) => {
                    race.cancel();
                    return Ok(signature);
                }
                Ok(Err(error)) => {
                    warn!(%error, "signer task failed to produce a signature");
                    last_error = error;
                }
                Err(join_error) => {
                    warn!(%join_error, "signer task panicked");
                }
            }
        }

        Err(last_error)
    }
}

/// Bounded attempt loop for one controlled signer.
#[allow(clippy::too_many_arguments)]
async fn signer_attempt_loop(
    cancel: &CancellationToken,
    message: &[u8],
    signer: &Signer,
    channel: Arc<dyn BroadcastChannel>,
    validator: Arc<MembershipValidator>,
    block_counter: Arc<dyn BlockCounter>,
    executor: Arc<dyn SigningExecutor>,
    config: &ChainConfig,
    attempts_limit: u64,
) -> Result<GroupSignature, SigningError> {
    let message_digest = hex::encode(Sha256::digest(message));
    let mut excluded_members: BTreeSet<MemberIndex> = BTreeSet::new();

    for attempt in 1..=attempts_limit {
        if cancel.is_cancelled() {
            return Err(SigningError::Cancelled);
        }

        let now = block_counter.current_block().await?;
        let attempt_cancel = cancel_on_block(
            cancel,
            Arc::clone(&block_counter),
            now + SIGNING_ATTEMPT_MAX_BLOCK_DURATION,
        );

        // Session ids are scoped to the message and attempt so messages
        // from a failed attempt cannot leak into the next one.
        let session_id = format!("{message_digest}-{attempt}");

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(SigningError::Cancelled),
            outcome = executor.sign(
                &attempt_cancel,
                message,
                signer,
                &session_id,
                &excluded_members,
                Arc::clone(&channel),
                Arc::clone(&validator),
            ) => outcome,
        };

        match outcome {
            Ok(signature) => {
                info!(
                    signer = %signer,
                    attempt,
                    "threshold signature produced",
                );
                return Ok(signature);
            }
            Err(error) => {
                if cancel.is_cancelled() {
                    return Err(SigningError::Cancelled);
                }

                info!(signer = %signer, attempt, %error, "signing attempt failed");

                if let SigningAttemptError::MembersInactive { inactive } = &error {
                    for index in inactive {
                        if *index == signer.signing_group_member_index {
                            continue;
                        }
                        // Blame from the executor is untrusted input.
                        if !index.is_in_range(signer.signing_group_operators.len()) {
                            warn!(
                                signer = %signer,
                                index = %index,
                                "blamed index outside the signing group; ignoring",
                            );
                            continue;
                        }
                        excluded_members.insert(*index);
                    }
                }

                if attempt < attempts_limit {
                    let observed = block_counter.current_block().await?;
                    block_counter
                        .wait_for_block_height(
                            cancel,
                            observed + SIGNING_ATTEMPT_BACKOFF_BLOCKS,
                        )
                        .await?;
                }

                // Quorum unreachable: every attempt from here on would run
                // below the signing threshold.
                let reachable = signer.signing_group_operators.len() - excluded_members.len();
                if reachable < config.group_threshold {
                    warn!(
                        signer = %signer,
                        excluded = excluded_members.len(),
                        "excluded too many members to reach the signing threshold",
                    );
                    break;
                }
            }
        }
    }

    Err(SigningError::AttemptsExhausted {
        attempts: attempts_limit,
    })
}
