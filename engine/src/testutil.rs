//! Deterministic fakes shared by the unit and flow tests: a hash-based
//! signing scheme, a ticking block counter, an in-memory broadcast bus and
//! a fake group contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::chain::{
    BlockCounter, BlockHeight, Chain, DkgResultSubmittedEvent, DkgStartedEvent, Signing,
};
use crate::config::{ChainConfig, GROUP_PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use crate::dkg::result::validate_result_submission;
use crate::dkg::{DkgExecutor, DkgOutput, DkgResult, DkgResultSubmission};
use crate::error::{ChainError, DkgAttemptError, NetError, SigningAttemptError};
use crate::group::MembershipValidator;
use crate::net::{
    marshal, unmarshal, BroadcastChannel, Envelope, NetProvider, ProtocolMessage, SenderFilter,
};
use crate::registry::Signer;
use crate::signing::{GroupSignature, SigningExecutor};
use crate::types::{DkgSeed, MemberIndex, OperatorAddress, ResultHash, Signature};

/// Small parameters keeping test sessions short: 4 members, threshold 2,
/// signature threshold 3.
pub fn test_config() -> ChainConfig {
    ChainConfig {
        group_size: 4,
        group_threshold: 2,
        key_generation_window: 50,
        submission_delay_step: 10,
        result_challenge_period: 100,
    }
}

/// Deterministic stand-in for the operator key scheme.
///
/// A signature is `address || digest || sha256(address || digest)[..13]`,
/// padded to the production signature length. Recovery re-derives the
/// trailer, so corrupting any byte of a signature breaks it.
#[derive(Clone)]
pub struct TestSigning {
    public_key: Vec<u8>,
}

impl TestSigning {
    pub fn new(name: &str) -> Self {
        let half: [u8; 32] = Sha256::digest(name.as_bytes()).into();
        let other: [u8; 32] = Sha256::digest(half).into();
        let mut public_key = half.to_vec();
        public_key.extend_from_slice(&other);
        Self { public_key }
    }

    fn address_bytes(&self) -> [u8; 20] {
        let digest = Sha256::digest(&self.public_key);
        digest[..20].try_into().unwrap()
    }
}

impl Signing for TestSigning {
    fn public_key(&self) -> Vec<u8> {
        self.public_key.clone()
    }

    fn address(&self) -> OperatorAddress {
        self.public_key_to_address(&self.public_key)
    }

    fn public_key_to_address(&self, public_key: &[u8]) -> OperatorAddress {
        let digest = Sha256::digest(public_key);
        OperatorAddress(format!("0x{}", hex::encode(&digest[..20])))
    }

    fn sign(&self, digest: &ResultHash) -> Result<Signature, ChainError> {
        let address = self.address_bytes();
        let mut bytes = Vec::with_capacity(SIGNATURE_LENGTH);
        bytes.extend_from_slice(&address);
        bytes.extend_from_slice(digest);
        let trailer = Sha256::new()
            .chain_update(address)
            .chain_update(digest)
            .finalize();
        bytes.extend_from_slice(&trailer[..SIGNATURE_LENGTH - bytes.len()]);
        Ok(Signature(bytes))
    }

    fn recover_address(
        &self,
        digest: &ResultHash,
        signature: &Signature,
    ) -> Result<OperatorAddress, ChainError> {
        let bytes = &signature.0;
        if bytes.len() != SIGNATURE_LENGTH {
            return Err(ChainError::Client("malformed signature length".into()));
        }
        let (address, rest) = bytes.split_at(20);
        let (embedded_digest, trailer) = rest.split_at(32);
        if embedded_digest != digest {
            return Err(ChainError::Client("signature over a different digest".into()));
        }
        let expected = Sha256::new()
            .chain_update(address)
            .chain_update(embedded_digest)
            .finalize();
        if trailer != &expected[..trailer.len()] {
            return Err(ChainError::Client("signature trailer mismatch".into()));
        }
        Ok(OperatorAddress(format!("0x{}", hex::encode(address))))
    }
}

/// A group of distinct test operators with their keys, sized to pair with
/// [`test_config`].
pub struct TestGroup {
    signers: Vec<TestSigning>,
}

pub fn test_group(size: usize) -> TestGroup {
    TestGroup {
        signers: (1..=size)
            .map(|i| TestSigning::new(&format!("member-{i}")))
            .collect(),
    }
}

impl TestGroup {
    pub fn address(&self, index: MemberIndex) -> OperatorAddress {
        self.signers[index.position()].address()
    }

    pub fn signing(&self, index: MemberIndex) -> &TestSigning {
        &self.signers[index.position()]
    }

    pub fn operators(&self) -> Vec<OperatorAddress> {
        self.signers.iter().map(|s| s.address()).collect()
    }

    pub fn result(&self, start_block: BlockHeight, misbehaved: &[MemberIndex]) -> DkgResult {
        DkgResult {
            group_public_key: group_public_key_for(start_block),
            members: self.operators(),
            misbehaved_members: misbehaved.to_vec(),
        }
    }

    /// A submission carrying exactly the required number of valid
    /// supporting signatures, from the lowest member indices up.
    pub fn signed_submission(
        &self,
        submitter: MemberIndex,
        start_block: BlockHeight,
        misbehaved: &[MemberIndex],
    ) -> DkgResultSubmission {
        let result = self.result(start_block, misbehaved);
        let digest = result.hash(start_block);
        let required = test_config()
            .signature_threshold()
            .min(self.signers.len());

        let mut signing_member_indices = Vec::with_capacity(required);
        let mut signatures = Vec::with_capacity(required);
        for (position, signer) in self.signers.iter().take(required).enumerate() {
            signing_member_indices.push(MemberIndex(position as u8 + 1));
            signatures.push(signer.sign(&digest).unwrap());
        }

        DkgResultSubmission {
            submitter_member_index: submitter,
            result,
            signing_member_indices,
            signatures,
        }
    }
}

/// Deterministic group public key of the right wire length, varying with
/// the session start block.
fn group_public_key_for(start_block: BlockHeight) -> Vec<u8> {
    let mut key = Vec::with_capacity(GROUP_PUBLIC_KEY_LENGTH);
    let mut block: [u8; 32] = Sha256::digest(start_block.to_be_bytes()).into();
    while key.len() < GROUP_PUBLIC_KEY_LENGTH {
        key.extend_from_slice(&block);
        block = Sha256::digest(block).into();
    }
    key.truncate(GROUP_PUBLIC_KEY_LENGTH);
    key
}

/// Block counter advancing on a wall-clock tick. One test millisecond per
/// block keeps whole sessions within fractions of a second.
pub struct FakeBlockCounter {
    height: watch::Sender<BlockHeight>,
}

impl FakeBlockCounter {
    pub fn ticking(start: BlockHeight, interval_ms: u64) -> Arc<Self> {
        let (height, _) = watch::channel(start);
        let counter = Arc::new(Self { height });
        let weak = Arc::downgrade(&counter);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                let Some(counter) = weak.upgrade() else { return };
                counter.height.send_modify(|h| *h += 1);
            }
        });
        counter
    }

    /// Jump the chain forward. Never moves backwards.
    pub fn set_block(&self, height: BlockHeight) {
        self.height.send_modify(|h| *h = (*h).max(height));
    }
}

#[async_trait]
impl BlockCounter for FakeBlockCounter {
    async fn current_block(&self) -> Result<BlockHeight, ChainError> {
        Ok(*self.height.borrow())
    }

    async fn wait_for_block_height(
        &self,
        cancel: &CancellationToken,
        height: BlockHeight,
    ) -> Result<(), ChainError> {
        let mut receiver = self.height.subscribe();
        loop {
            if *receiver.borrow_and_update() >= height {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = receiver.changed() => {
                    if changed.is_err() {
                        return Err(ChainError::SubscriptionClosed);
                    }
                }
            }
        }
    }
}

/// Shared in-memory message bus. Providers attached to the same bus see
/// each other's traffic, one per simulated node.
pub struct LocalBus {
    topics: Mutex<HashMap<String, broadcast::Sender<Envelope>>>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
        })
    }

    fn topic(&self, name: &str) -> broadcast::Sender<Envelope> {
        self.topics
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }
}

/// In-memory [`NetProvider`] with a fixed transport identity.
pub struct LocalNetProvider {
    bus: Arc<LocalBus>,
    identity: Vec<u8>,
}

impl LocalNetProvider {
    pub fn new() -> Self {
        Self::on_bus(LocalBus::new(), b"local-test-operator".to_vec())
    }

    pub fn on_bus(bus: Arc<LocalBus>, identity: Vec<u8>) -> Self {
        Self { bus, identity }
    }
}

impl NetProvider for LocalNetProvider {
    fn broadcast_channel_for(&self, name: &str) -> Result<Arc<dyn BroadcastChannel>, NetError> {
        let ingress = self.bus.topic(name);
        Ok(Arc::new(LocalChannel::attach(
            name.to_string(),
            ingress,
            self.identity.clone(),
        )))
    }
}

/// One node's view of a bus topic. A forwarding task applies the sender
/// filter before messages reach subscribers, like a real transport would.
struct LocalChannel {
    name: String,
    identity: Vec<u8>,
    ingress: broadcast::Sender<Envelope>,
    delivery: broadcast::Sender<Envelope>,
    filter: Arc<Mutex<Option<SenderFilter>>>,
}

impl LocalChannel {
    fn attach(name: String, ingress: broadcast::Sender<Envelope>, identity: Vec<u8>) -> Self {
        let (delivery, _) = broadcast::channel(1024);
        let filter: Arc<Mutex<Option<SenderFilter>>> = Arc::new(Mutex::new(None));

        let mut source = ingress.subscribe();
        let sink = delivery.clone();
        let task_filter = Arc::clone(&filter);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(envelope) => {
                        let passes = task_filter
                            .lock()
                            .unwrap()
                            .as_ref()
                            .map_or(true, |f| f(&envelope.sender_public_key));
                        if passes {
                            let _ = sink.send(envelope);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Self {
            name,
            identity,
            ingress,
            delivery,
            filter,
        }
    }
}

#[async_trait]
impl BroadcastChannel for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, message: ProtocolMessage) -> Result<(), NetError> {
        // Round-trip through the wire codec so tests exercise it.
        let bytes = marshal(&message)?;
        let message =
            unmarshal(&bytes).ok_or_else(|| NetError::PublishFailed("codec round-trip".into()))?;
        let _ = self.ingress.send(Envelope {
            sender_public_key: self.identity.clone(),
            message,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.delivery.subscribe()
    }

    fn set_filter(&self, filter: SenderFilter) -> Result<(), NetError> {
        *self.filter.lock().unwrap() = Some(filter);
        Ok(())
    }
}

struct FakeSession {
    operators: Vec<OperatorAddress>,
    start_block: BlockHeight,
    submitted_block: Option<BlockHeight>,
}

/// In-memory group contract enforcing the real submission rules.
pub struct FakeChain {
    config: ChainConfig,
    signing: Arc<TestSigning>,
    block_counter: Arc<FakeBlockCounter>,
    sessions: Mutex<HashMap<DkgSeed, FakeSession>>,
    refuse_submissions: AtomicBool,
    dkg_started: broadcast::Sender<DkgStartedEvent>,
    result_submitted: broadcast::Sender<DkgResultSubmittedEvent>,
}

impl FakeChain {
    pub fn new(
        config: ChainConfig,
        signing: TestSigning,
        block_counter: Arc<FakeBlockCounter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            signing: Arc::new(signing),
            block_counter,
            sessions: Mutex::new(HashMap::new()),
            refuse_submissions: AtomicBool::new(false),
            dkg_started: broadcast::channel(16).0,
            result_submitted: broadcast::channel(16).0,
        })
    }

    pub fn add_session(
        &self,
        seed: DkgSeed,
        operators: Vec<OperatorAddress>,
        start_block: BlockHeight,
    ) {
        self.sessions.lock().unwrap().insert(
            seed,
            FakeSession {
                operators,
                start_block,
                submitted_block: None,
            },
        );
    }

    /// Announce a registered session to DKG-started subscribers.
    pub fn start_dkg(&self, seed: DkgSeed) {
        let start_block = self.sessions.lock().unwrap()[&seed].start_block;
        let _ = self.dkg_started.send(DkgStartedEvent {
            seed,
            block_number: start_block,
        });
    }

    /// Make every subsequent submission fail at the client level.
    pub fn refuse_submissions(&self) {
        self.refuse_submissions.store(true, Ordering::SeqCst);
    }

    /// Record a submission as if a remote member had won the race, and
    /// notify subscribers.
    pub fn inject_result_submitted(&self, seed: DkgSeed, submission: DkgResultSubmission) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&seed).unwrap();
        let now = *self.block_counter.height.borrow();
        session.submitted_block = Some(now);
        let result_hash = submission.result.hash(session.start_block);
        let _ = self.result_submitted.send(DkgResultSubmittedEvent {
            submission,
            result_hash,
            block_number: now,
        });
    }
}

#[async_trait]
impl Chain for FakeChain {
    fn get_config(&self) -> &ChainConfig {
        &self.config
    }

    fn signing(&self) -> Arc<dyn Signing> {
        Arc::clone(&self.signing) as Arc<dyn Signing>
    }

    fn block_counter(&self) -> Arc<dyn BlockCounter> {
        Arc::clone(&self.block_counter) as Arc<dyn BlockCounter>
    }

    async fn select_group(&self, seed: &DkgSeed) -> Result<Vec<OperatorAddress>, ChainError> {
        self.sessions
            .lock()
            .unwrap()
            .get(seed)
            .map(|session| session.operators.clone())
            .ok_or_else(|| ChainError::Client("unknown session seed".into()))
    }

    async fn submit_dkg_result(
        &self,
        seed: &DkgSeed,
        submission: &DkgResultSubmission,
    ) -> Result<(), ChainError> {
        if self.refuse_submissions.load(Ordering::SeqCst) {
            return Err(ChainError::Client("submission refused".into()));
        }

        let now = self.block_counter.current_block().await?;
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .get_mut(seed)
            .ok_or_else(|| ChainError::Client("unknown session seed".into()))?;

        if session.submitted_block.is_some() {
            return Err(crate::error::ResultValidationError::AlreadySubmitted.into());
        }

        validate_result_submission(
            submission,
            &self.signing.address(),
            session.start_block,
            now,
            &self.config,
            self.signing.as_ref(),
        )?;

        session.submitted_block = Some(now);
        let _ = self.result_submitted.send(DkgResultSubmittedEvent {
            submission: submission.clone(),
            result_hash: submission.result.hash(session.start_block),
            block_number: now,
        });
        Ok(())
    }

    async fn submitted_result_block(
        &self,
        seed: &DkgSeed,
    ) -> Result<Option<BlockHeight>, ChainError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(seed)
            .and_then(|session| session.submitted_block))
    }

    fn on_dkg_started(&self) -> broadcast::Receiver<DkgStartedEvent> {
        self.dkg_started.subscribe()
    }

    fn on_dkg_result_submitted(&self) -> broadcast::Receiver<DkgResultSubmittedEvent> {
        self.result_submitted.subscribe()
    }
}

/// Executor returning a canned output on every attempt.
pub struct FakeDkgExecutor {
    output: DkgOutput,
}

impl FakeDkgExecutor {
    pub fn succeeding(output: DkgOutput) -> Arc<Self> {
        Arc::new(Self { output })
    }
}

#[async_trait]
impl DkgExecutor for FakeDkgExecutor {
    async fn execute(
        &self,
        _cancel: &CancellationToken,
        _seed: &DkgSeed,
        _session_id: &str,
        _member_index: MemberIndex,
        _group_size: usize,
        _dishonest_threshold: usize,
        _excluded_members: &std::collections::BTreeSet<MemberIndex>,
        _channel: Arc<dyn BroadcastChannel>,
        _validator: Arc<MembershipValidator>,
    ) -> Result<DkgOutput, DkgAttemptError> {
        Ok(self.output.clone())
    }
}

/// Executor returning a canned signature on every attempt.
pub struct FakeSigningExecutor {
    signature: GroupSignature,
}

impl FakeSigningExecutor {
    pub fn succeeding(signature: GroupSignature) -> Arc<Self> {
        Arc::new(Self { signature })
    }
}

#[async_trait]
impl SigningExecutor for FakeSigningExecutor {
    async fn sign(
        &self,
        _cancel: &CancellationToken,
        _message: &[u8],
        _signer: &Signer,
        _session_id: &str,
        _excluded_members: &std::collections::BTreeSet<MemberIndex>,
        _channel: Arc<dyn BroadcastChannel>,
        _validator: Arc<MembershipValidator>,
    ) -> Result<GroupSignature, SigningAttemptError> {
        Ok(self.signature.clone())
    }
}
