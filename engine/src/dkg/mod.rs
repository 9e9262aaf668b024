//! Coordination of the distributed key generation protocol: eligibility,
//! retries, result publication and final group resolution. The key
//! generation math itself lives behind [`DkgExecutor`].

pub mod publish;
pub mod result;
pub mod retry;
pub mod state;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::DkgAttemptError;
use crate::group::MembershipValidator;
use crate::net::BroadcastChannel;
use crate::types::{DkgSeed, KeyShare, MemberIndex};

pub use result::{DkgResult, DkgResultSubmission};

/// Everything a successful DKG attempt produces: the shareable result and
/// the local member's private key share.
#[derive(Debug, Clone)]
pub struct DkgOutput {
    pub result: DkgResult,
    pub private_key_share: KeyShare,
}

/// Opaque cryptographic capability computing one DKG attempt.
///
/// The coordination logic never looks inside: tests drive it with a
/// deterministic fake producing canned results and failures.
#[async_trait]
pub trait DkgExecutor: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        cancel: &CancellationToken,
        seed: &DkgSeed,
        session_id: &str,
        member_index: MemberIndex,
        group_size: usize,
        dishonest_threshold: usize,
        excluded_members: &BTreeSet<MemberIndex>,
        channel: Arc<dyn BroadcastChannel>,
        validator: Arc<MembershipValidator>,
    ) -> Result<DkgOutput, DkgAttemptError>;
}

/// Session id for one attempt. Must differ between attempts so protocol
/// messages of a failed attempt cannot leak into the next one.
pub fn attempt_session_id(seed: &DkgSeed, attempt_number: u64) -> String {
    format!("{}-{}", seed.to_hex(), attempt_number)
}
