//! Ledger surface consumed by the protocol, expressed as traits so the
//! coordination logic can run against a real client or a deterministic fake.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::ChainConfig;
use crate::dkg::result::DkgResultSubmission;
use crate::error::ChainError;
use crate::types::{DkgSeed, OperatorAddress, ResultHash, Signature};

/// Block height on the replicated ledger.
pub type BlockHeight = u64;

/// Emitted when the group contract starts a new DKG session.
#[derive(Debug, Clone)]
pub struct DkgStartedEvent {
    pub seed: DkgSeed,
    pub block_number: BlockHeight,
}

/// Emitted when a result submission passes ledger-side verification.
#[derive(Debug, Clone)]
pub struct DkgResultSubmittedEvent {
    pub submission: DkgResultSubmission,
    pub result_hash: ResultHash,
    pub block_number: BlockHeight,
}

/// Block height source and waiter.
#[async_trait]
pub trait BlockCounter: Send + Sync {
    async fn current_block(&self) -> Result<BlockHeight, ChainError>;

    /// Resolves when the chain reaches `height` or `cancel` fires,
    /// whichever comes first.
    async fn wait_for_block_height(
        &self,
        cancel: &CancellationToken,
        height: BlockHeight,
    ) -> Result<(), ChainError>;
}

/// Operator key operations backing membership checks and result signing.
pub trait Signing: Send + Sync {
    /// Public key of the local operator.
    fn public_key(&self) -> Vec<u8>;

    /// Address of the local operator.
    fn address(&self) -> OperatorAddress;

    /// Address corresponding to the given operator public key.
    fn public_key_to_address(&self, public_key: &[u8]) -> OperatorAddress;

    /// Sign the digest with the local operator key.
    fn sign(&self, digest: &ResultHash) -> Result<Signature, ChainError>;

    /// Recover the signer address from a digest and signature.
    fn recover_address(
        &self,
        digest: &ResultHash,
        signature: &Signature,
    ) -> Result<OperatorAddress, ChainError>;
}

/// The group contract surface.
#[async_trait]
pub trait Chain: Send + Sync {
    fn get_config(&self) -> &ChainConfig;

    fn signing(&self) -> Arc<dyn Signing>;

    fn block_counter(&self) -> Arc<dyn BlockCounter>;

    /// Operators selected for the session identified by `seed`, ordered;
    /// position `i` corresponds to member index `i + 1`.
    async fn select_group(&self, seed: &DkgSeed) -> Result<Vec<OperatorAddress>, ChainError>;

    /// Submit the aggregated result. The ledger re-verifies eligibility,
    /// thresholds and every supporting signature; the first valid
    /// submission wins.
    async fn submit_dkg_result(
        &self,
        seed: &DkgSeed,
        submission: &DkgResultSubmission,
    ) -> Result<(), ChainError>;

    /// Block at which a result was submitted for the session, if any.
    async fn submitted_result_block(
        &self,
        seed: &DkgSeed,
    ) -> Result<Option<BlockHeight>, ChainError>;

    fn on_dkg_started(&self) -> broadcast::Receiver<DkgStartedEvent>;

    fn on_dkg_result_submitted(&self) -> broadcast::Receiver<DkgResultSubmittedEvent>;
}

/// Returns a child token that is cancelled when the chain reaches `block`
/// or when `parent` is cancelled, whichever comes first.
pub fn cancel_on_block(
    parent: &CancellationToken,
    block_counter: Arc<dyn BlockCounter>,
    block: BlockHeight,
) -> CancellationToken {
    let token = parent.child_token();
    let watcher = token.clone();
    let parent = parent.clone();
    tokio::spawn(async move {
        if let Err(error) = block_counter.wait_for_block_height(&parent, block).await {
            tracing::warn!(%block, %error, "failed waiting for block; cancelling early");
        }
        watcher.cancel();
    });
    token
}
