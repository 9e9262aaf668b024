//! Node driver: joins DKG sessions when the local operator is eligible
//! and builds signing group controllers for formed wallets.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chain::{cancel_on_block, BlockHeight, Chain};
use crate::config::ChainConfig;
use crate::deduplicator::Deduplicator;
use crate::dkg::publish::{decide_member_fate, publish_result};
use crate::dkg::retry::DkgRetryLoop;
use crate::dkg::{attempt_session_id, DkgExecutor};
use crate::dkg::state;
use crate::group::{final_signing_group, MembershipValidator};
use crate::latch::ProtocolLatch;
use crate::net::{cancel_on_stop_signal, schedule_stop_pill, BroadcastChannel, NetProvider};
use crate::registry::{Signer, SignerStore, WalletRegistry};
use crate::signing::{SigningExecutor, SigningGroupController, DEFAULT_SIGNING_ATTEMPTS_LIMIT};
use crate::types::{DkgSeed, MemberIndex, OperatorAddress};
use crate::PROTOCOL_NAME;

/// Safety-net ceiling on one DKG protocol task. A stuck session must not
/// hold the latch forever.
const DKG_PROTOCOL_CEILING: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Delay before the winning member broadcasts the stop pill. Other
/// members can be very close to producing the result themselves.
const STOP_PILL_DELAY: Duration = Duration::from_secs(60);

/// Current state of a protocol node.
pub struct Node {
    chain: Arc<dyn Chain>,
    net_provider: Arc<dyn NetProvider>,
    wallet_registry: Arc<WalletRegistry>,
    dkg_executor: Arc<dyn DkgExecutor>,
    signing_executor: Arc<dyn SigningExecutor>,
    protocol_latch: Arc<ProtocolLatch>,
}

impl Node {
    pub fn new(
        chain: Arc<dyn Chain>,
        net_provider: Arc<dyn NetProvider>,
        signer_store: Arc<dyn SignerStore>,
        dkg_executor: Arc<dyn DkgExecutor>,
        signing_executor: Arc<dyn SigningExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            chain,
            net_provider,
            wallet_registry: Arc::new(WalletRegistry::new(signer_store)),
            dkg_executor,
            signing_executor,
            protocol_latch: ProtocolLatch::new(),
        })
    }

    pub fn wallet_registry(&self) -> &Arc<WalletRegistry> {
        &self.wallet_registry
    }

    pub fn protocol_latch(&self) -> &Arc<ProtocolLatch> {
        &self.protocol_latch
    }

    /// Undergoes the distributed key generation if the local operator is
    /// eligible for the group generated by the seed. Spawns one task per
    /// controlled member index; the returned handles complete when the
    /// member tasks settle.
    pub async fn join_dkg_if_eligible(
        self: &Arc<Self>,
        seed: DkgSeed,
        start_block: BlockHeight,
    ) -> Vec<JoinHandle<()>> {
        info!(%seed, "checking eligibility for DKG");

        let selected_operators = match self.chain.select_group(&seed).await {
            Ok(operators) => operators,
            Err(error) => {
                warn!(%seed, %error, "selecting group not possible");
                return Vec::new();
            }
        };

        let config = self.chain.get_config().clone();
        if selected_operators.len() > config.group_size {
            error!(
                %seed,
                selected = selected_operators.len(),
                "group size larger than supported",
            );
            return Vec::new();
        }

        let signing = self.chain.signing();
        let operator_address = signing.address();

        let controlled_indices: Vec<MemberIndex> = selected_operators
            .iter()
            .enumerate()
            .filter(|(_, operator)| **operator == operator_address)
            .map(|(position, _)| MemberIndex(position as u8 + 1))
            .collect();

        if controlled_indices.is_empty() {
            info!(%seed, "not eligible for DKG");
            return Vec::new();
        }

        info!(
            %seed,
            members = controlled_indices.len(),
            "joining DKG and controlling group members",
        );

        let channel_name = format!("{}-{}", PROTOCOL_NAME, seed.to_hex());
        let channel = match self.net_provider.broadcast_channel_for(&channel_name) {
            Ok(channel) => channel,
            Err(error) => {
                error!(%seed, %error, "failed to get broadcast channel");
                return Vec::new();
            }
        };

        let validator = Arc::new(MembershipValidator::new(&selected_operators, signing));
        if let Err(error) = channel.set_filter(validator.filter()) {
            error!(
                channel = channel.name(),
                %error,
                "could not set filter for channel",
            );
        }

        let mut handles = Vec::with_capacity(controlled_indices.len());
        for member_index in controlled_indices {
            let node = Arc::clone(self);
            let selected = selected_operators.clone();
            let channel = Arc::clone(&channel);
            let validator = Arc::clone(&validator);
            let config = config.clone();

            handles.push(tokio::spawn(async move {
                node.run_member_dkg(
                    seed,
                    start_block,
                    member_index,
                    selected,
                    channel,
                    validator,
                    config,
                )
                .await;
            }));
        }

        handles
    }

    /// One member's full DKG protocol path: retry loop, publication,
    /// final group resolution and signer registration.
    #[allow(clippy::too_many_arguments)]
    async fn run_member_dkg(
        self: Arc<Self>,
        seed: DkgSeed,
        start_block: BlockHeight,
        member_index: MemberIndex,
        selected_operators: Vec<OperatorAddress>,
        channel: Arc<dyn BroadcastChannel>,
        validator: Arc<MembershipValidator>,
        config: ChainConfig,
    ) {
        let _latch_guard = self.protocol_latch.acquire();

        let loop_cancel = CancellationToken::new();
        let ceiling = loop_cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ceiling.cancelled() => {}
                _ = tokio::time::sleep(DKG_PROTOCOL_CEILING) => ceiling.cancel(),
            }
        });
        cancel_on_stop_signal(loop_cancel.clone(), Arc::clone(&channel), seed.to_hex());

        let block_counter = self.chain.block_counter();
        let mut retry_loop = DkgRetryLoop::new(
            seed,
            start_block,
            member_index,
            config.clone(),
            Arc::clone(&block_counter),
        );

        let executor = Arc::clone(&self.dkg_executor);
        let attempt_channel = Arc::clone(&channel);
        let attempt_validator = Arc::clone(&validator);
        let attempt_config = config.clone();

        let outcome = retry_loop
            .start(&loop_cancel, move |attempt, attempt_cancel| {
                let executor = Arc::clone(&executor);
                let channel = Arc::clone(&attempt_channel);
                let validator = Arc::clone(&attempt_validator);
                let config = attempt_config.clone();
                async move {
                    let session_id = attempt_session_id(&seed, attempt.number);
                    info!(
                        %seed,
                        member = %member_index,
                        attempt = attempt.number,
                        attempt_start_block = attempt.start_block,
                        participating = config.group_size - attempt.excluded_members.len(),
                        "scheduled dkg attempt",
                    );
                    executor
                        .execute(
                            &attempt_cancel,
                            &seed,
                            &session_id,
                            member_index,
                            config.group_size,
                            config.dishonest_threshold(),
                            &attempt.excluded_members,
                            channel,
                            validator,
                        )
                        .await
                }
            })
            .await;

        let output = match outcome {
            Ok(Some(output)) => output,
            Ok(None) => {
                info!(%seed, member = %member_index, "dkg retry loop received stop signal");
                return;
            }
            Err(error) => {
                error!(%seed, member = %member_index, %error, "failed to execute dkg");
                return;
            }
        };

        // Let still-racing members terminate early. Best-effort; the task
        // dies with the loop token if a pill from someone else lands first.
        schedule_stop_pill(
            loop_cancel.clone(),
            Arc::clone(&channel),
            seed.to_hex(),
            retry_loop.attempts(),
            STOP_PILL_DELAY,
        );

        let mut operating_member_indexes = output.result.operating_member_indexes();

        // Subscribe before publication so a competing submission cannot
        // slip between a failed publication and the fate decision.
        let result_events = self.chain.on_dkg_result_submitted();

        let publication_deadline = state::submission_window_opens(
            start_block,
            MemberIndex(config.group_size as u8),
            &config,
        ) + config.submission_delay_step;
        let publication_cancel = cancel_on_block(
            &CancellationToken::new(),
            Arc::clone(&block_counter),
            publication_deadline,
        );

        let published = publish_result(
            &publication_cancel,
            &seed,
            start_block,
            member_index,
            &output.result,
            Arc::clone(&self.chain),
            Arc::clone(&channel),
            Arc::clone(&validator),
        )
        .await;

        if let Err(error) = published {
            // Either our result is not supported by the group majority or
            // the chain interaction failed. Observe the chain for the
            // result published by any other member and decide whether we
            // stay in the final group.
            warn!(
                %seed,
                member = %member_index,
                %error,
                "DKG result publication process failed",
            );

            operating_member_indexes = match decide_member_fate(
                &publication_cancel,
                member_index,
                &output.result,
                start_block,
                result_events,
            )
            .await
            {
                Ok(operating) => operating,
                Err(error) => {
                    error!(
                        %seed,
                        member = %member_index,
                        %error,
                        "failed to handle DKG result publishing failure",
                    );
                    return;
                }
            };
        }

        // The final signing group may differ from the group selected by
        // the sortition protocol; resolve it from the members that
        // behaved correctly, and remap this member's index.
        let (final_operators, index_remap) = match final_signing_group(
            &selected_operators,
            &operating_member_indexes,
            &config,
        ) {
            Ok(resolved) => resolved,
            Err(error) => {
                error!(
                    %seed,
                    member = %member_index,
                    %error,
                    "failed to resolve final signing group",
                );
                return;
            }
        };

        let Some(final_member_index) = index_remap.get(&member_index).copied() else {
            // Not part of the operating set: no final role, no signer.
            info!(
                %seed,
                member = %member_index,
                "member has no position in the final signing group",
            );
            return;
        };

        let signer = Signer {
            wallet_public_key: output.result.group_public_key.clone(),
            signing_group_operators: final_operators,
            signing_group_member_index: final_member_index,
            private_key_share: output.private_key_share.clone(),
        };

        match self.wallet_registry.register_signer(signer) {
            Ok(()) => info!(%seed, member = %member_index, "registered signer"),
            Err(error) => error!(%seed, member = %member_index, %error, "failed to register signer"),
        }
    }

    /// Creates a controller managing the signers controlled by this node
    /// that are part of the given wallet.
    pub fn create_signing_group_controller(
        &self,
        wallet_public_key: &[u8],
    ) -> Result<SigningGroupController, crate::error::SigningError> {
        let signers = self.wallet_registry.get_signers(wallet_public_key);
        if signers.is_empty() {
            return Err(crate::error::SigningError::NoSignersControlled);
        }

        // All signers belong to one wallet; take the group from the first.
        let signing_group_operators = signers[0].signing_group_operators.clone();

        let channel_name = format!("{}-{}", PROTOCOL_NAME, hex::encode(wallet_public_key));
        let channel = self.net_provider.broadcast_channel_for(&channel_name)?;

        let validator = Arc::new(MembershipValidator::new(
            &signing_group_operators,
            self.chain.signing(),
        ));
        channel.set_filter(validator.filter())?;

        info!(
            wallet = %hex::encode(wallet_public_key),
            signers = signers.len(),
            "signing group controller created",
        );

        Ok(SigningGroupController {
            signers,
            broadcast_channel: channel,
            membership_validator: validator,
            chain_config: self.chain.get_config().clone(),
            block_counter: self.chain.block_counter(),
            executor: Arc::clone(&self.signing_executor),
            latch: Arc::clone(&self.protocol_latch),
            signing_attempts_limit: DEFAULT_SIGNING_ATTEMPTS_LIMIT,
        })
    }
}

/// Wires chain events into the node: every first-seen DKG-started event
/// triggers an eligibility check. Returns the listener task handle.
pub fn initialize(node: Arc<Node>) -> JoinHandle<()> {
    let mut events = node.chain.on_dkg_started();
    let deduplicator = Deduplicator::new();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if !deduplicator.notify_dkg_started(&event.seed) {
                        warn!(
                            seed = %event.seed,
                            start_block = event.block_number,
                            "DKG started event has already been processed",
                        );
                        continue;
                    }

                    info!(
                        seed = %event.seed,
                        start_block = event.block_number,
                        "DKG started",
                    );

                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        node.join_dkg_if_eligible(event.seed, event.block_number)
                            .await;
                    });
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "DKG started listener lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}
