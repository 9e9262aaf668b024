//! Result publication: broadcasting supporting signatures, submitting the
//! aggregated result to the ledger, and resolving a member's fate when a
//! competing submission wins the race.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{BlockHeight, Chain, DkgResultSubmittedEvent};
use crate::dkg::result::{DkgResult, DkgResultSubmission};
use crate::dkg::state;
use crate::error::{ChainError, PublicationError, ResultValidationError};
use crate::group::MembershipValidator;
use crate::net::{BroadcastChannel, ProtocolMessage, ResultHashSignatureMessage};
use crate::types::{DkgSeed, MemberIndex, Signature};

/// Publishes the result held by one member.
///
/// Broadcasts the member's own signature over the result hash, collects
/// signatures from other members until the signature threshold is met,
/// then waits for the member's eligibility window and submits - unless a
/// competing submission is observed first, which counts as success here
/// and is reconciled by the caller through final group resolution.
///
/// `cancel` carries the publication deadline
/// (`group_size * submission_delay_step` blocks).
#[allow(clippy::too_many_arguments)]
pub async fn publish_result(
    cancel: &CancellationToken,
    seed: &DkgSeed,
    start_block: BlockHeight,
    member_index: MemberIndex,
    result: &DkgResult,
    chain: Arc<dyn Chain>,
    channel: Arc<dyn BroadcastChannel>,
    validator: Arc<MembershipValidator>,
) -> Result<(), PublicationError> {
    let signatures = collect_result_signatures(
        cancel,
        seed,
        start_block,
        member_index,
        result,
        Arc::clone(&chain),
        Arc::clone(&channel),
        validator,
    )
    .await?;

    submit_result(
        cancel,
        seed,
        start_block,
        member_index,
        result,
        signatures,
        chain,
    )
    .await
}

/// Broadcasts the local supporting signature and gathers signatures from
/// the other members until the signature threshold is reached.
#[allow(clippy::too_many_arguments)]
async fn collect_result_signatures(
    cancel: &CancellationToken,
    seed: &DkgSeed,
    start_block: BlockHeight,
    member_index: MemberIndex,
    result: &DkgResult,
    chain: Arc<dyn Chain>,
    channel: Arc<dyn BroadcastChannel>,
    validator: Arc<MembershipValidator>,
) -> Result<BTreeMap<MemberIndex, Signature>, PublicationError> {
    let config = chain.get_config().clone();
    let signing = chain.signing();
    let digest = result.hash(start_block);
    let required = config.signature_threshold();

    // Subscribe before broadcasting so no peer signature can be missed.
    let mut receiver = channel.subscribe();

    let own_signature = signing.sign(&digest)?;
    let mut signatures = BTreeMap::from([(member_index, own_signature.clone())]);

    channel
        .publish(ProtocolMessage::ResultHashSignature(
            ResultHashSignatureMessage {
                session_seed: seed.to_hex(),
                sender_index: member_index,
                result_hash: digest,
                signature: own_signature,
                public_key: signing.public_key(),
            },
        ))
        .await?;

    while signatures.len() < required {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(PublicationError::TooFewSignatures {
                    actual: signatures.len(),
                    required,
                });
            }
            received = receiver.recv() => match received {
                Ok(envelope) => envelope,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "signature collection lagged behind the channel");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(PublicationError::Net(crate::error::NetError::ChannelClosed));
                }
            },
        };

        let ProtocolMessage::ResultHashSignature(message) = envelope.message else {
            continue;
        };
        if message.session_seed != seed.to_hex() || message.sender_index == member_index {
            continue;
        }
        if message.result_hash != digest {
            debug!(
                sender = %message.sender_index,
                "supporting signature over a different result hash; ignoring",
            );
            continue;
        }
        // The public key embedded in the message must be the one the
        // transport authenticated, and must hold the claimed index.
        if message.public_key != envelope.sender_public_key {
            warn!(sender = %message.sender_index, "sender key mismatch; dropping signature");
            continue;
        }
        if !validator.is_valid_membership(message.sender_index, &message.public_key) {
            warn!(
                sender = %message.sender_index,
                "signature from a key that does not hold the claimed index",
            );
            continue;
        }
        match signing.recover_address(&digest, &message.signature) {
            Ok(recovered) if recovered == result.members[message.sender_index.position()] => {}
            _ => {
                warn!(sender = %message.sender_index, "invalid supporting signature; dropping");
                continue;
            }
        }

        signatures.entry(message.sender_index).or_insert(message.signature);
    }

    info!(
        seed = %seed,
        member = %member_index,
        collected = signatures.len(),
        "collected supporting signatures over the result hash",
    );

    Ok(signatures)
}

/// Waits for the member's eligibility window and submits the aggregated
/// result, unless another member's submission is observed first.
async fn submit_result(
    cancel: &CancellationToken,
    seed: &DkgSeed,
    start_block: BlockHeight,
    member_index: MemberIndex,
    result: &DkgResult,
    signatures: BTreeMap<MemberIndex, Signature>,
    chain: Arc<dyn Chain>,
) -> Result<(), PublicationError> {
    let config = chain.get_config().clone();
    let block_counter = chain.block_counter();

    let window_opens = state::submission_window_opens(start_block, member_index, &config);
    block_counter
        .wait_for_block_height(cancel, window_opens)
        .await?;

    if chain.submitted_result_block(seed).await?.is_some() {
        info!(
            seed = %seed,
            member = %member_index,
            "result already submitted by another member",
        );
        return Ok(());
    }

    if cancel.is_cancelled() {
        // Deadline elapsed with no submission attempted and nothing
        // observed on the ledger.
        return Err(PublicationError::DeadlineExceeded);
    }

    let (signing_member_indices, signatures): (Vec<_>, Vec<_>) =
        signatures.into_iter().unzip();
    let submission = DkgResultSubmission {
        submitter_member_index: member_index,
        result: result.clone(),
        signing_member_indices,
        signatures,
    };

    match chain.submit_dkg_result(seed, &submission).await {
        Ok(()) => {
            info!(seed = %seed, member = %member_index, "submitted DKG result");
            Ok(())
        }
        Err(ChainError::SubmissionRejected(ResultValidationError::AlreadySubmitted)) => {
            // Lost the race between the ledger read and our transaction.
            info!(seed = %seed, member = %member_index, "another submission won the race");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}

/// Resolves the member's final-group fate after a failed publication.
///
/// Races the result-submitted event subscription against the publication
/// deadline. A matching competing result decides membership through its
/// operating member set; a mismatched one, or no event at all, leaves the
/// fate undecided and is surfaced as an error.
///
/// Known ambiguity, kept as in the source protocol: a winning event
/// arriving after the local deadline but before ledger finality leaves a
/// legitimately operating member with `FateUndecided`.
pub async fn decide_member_fate(
    cancel: &CancellationToken,
    member_index: MemberIndex,
    result: &DkgResult,
    start_block: BlockHeight,
    mut events: broadcast::Receiver<DkgResultSubmittedEvent>,
) -> Result<Vec<MemberIndex>, PublicationError> {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(PublicationError::FateUndecided),
            received = events.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "fate decision lagged behind the event stream");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(PublicationError::FateUndecided);
                }
            },
        };

        if event.result_hash != result.hash(start_block) {
            // The group accepted a result this member does not recognize;
            // its membership cannot be decided from it.
            return Err(PublicationError::ResultMismatch);
        }

        let operating = event.submission.result.operating_member_indexes();
        info!(
            member = %member_index,
            ?operating,
            "member fate decided from a competing submission",
        );
        return Ok(operating);
    }
}
