//! Centralized engine error types.

use thiserror::Error;

use crate::types::MemberIndex;

/// Broadcast transport failure.
#[derive(Error, Debug)]
pub enum NetError {
    /// The channel no longer delivers or accepts messages.
    #[error("broadcast channel closed")]
    ChannelClosed,
    /// Message could not be handed to the transport.
    #[error("publish failed: {0}")]
    PublishFailed(String),
    /// Sender filter could not be installed.
    #[error("could not set channel filter: {0}")]
    FilterRejected(String),
}

/// Ledger interaction failure.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Underlying client failure.
    #[error("chain client error: {0}")]
    Client(String),
    /// The ledger rejected a result submission during verification.
    #[error("result submission rejected: {0}")]
    SubmissionRejected(#[from] ResultValidationError),
    /// Event subscription dropped before the protocol finished with it.
    #[error("chain event subscription closed")]
    SubscriptionClosed,
}

/// Reasons the ledger (or its local mirror) rejects a result submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResultValidationError {
    #[error("submitter member index is zero")]
    ZeroSubmitterIndex,
    #[error("member index {0} out of range")]
    IndexOutOfRange(MemberIndex),
    #[error("submitter address does not match member {0}")]
    SubmitterMismatch(MemberIndex),
    #[error("member {member} not yet eligible at block {block}")]
    NotYetEligible { member: MemberIndex, block: u64 },
    #[error("submission at block {0} is past the session timeout")]
    PastSessionTimeout(u64),
    #[error("result already submitted for this session")]
    AlreadySubmitted,
    #[error("malformed group public key: expected {expected} bytes, got {actual}")]
    MalformedGroupPublicKey { expected: usize, actual: usize },
    #[error("too many misbehaved members: {actual} > {max}")]
    TooManyMisbehaved { actual: usize, max: usize },
    #[error("signature count {actual} outside [{min}, {max}]")]
    SignatureCountOutOfBounds { actual: usize, min: usize, max: usize },
    #[error("signature and signing index counts differ")]
    SignatureIndexMismatch,
    #[error("duplicate signing member index {0}")]
    DuplicateSigningIndex(MemberIndex),
    #[error("malformed signature from member {0}")]
    MalformedSignature(MemberIndex),
    #[error("signature from member {0} does not recover to its address")]
    SignatureMismatch(MemberIndex),
}

/// Failure of a single DKG attempt. Stays inside the retry loop unless the
/// session-level timeout is reached.
#[derive(Error, Debug)]
pub enum DkgAttemptError {
    /// The executor could not complete the protocol; the listed members
    /// failed to produce valid partial contributions.
    #[error("attempt failed; inactive members: {inactive:?}")]
    MembersInactive { inactive: Vec<MemberIndex> },
    /// The executor failed for a reason with nobody to blame.
    #[error("attempt failed: {0}")]
    ExecutionFailed(String),
    /// The attempt deadline elapsed or the session was cancelled.
    #[error("attempt cancelled")]
    Cancelled,
}

/// Terminal DKG failure surfaced past the retry loop boundary.
#[derive(Error, Debug)]
pub enum DkgError {
    /// Nobody produced a result before the session-level timeout. Distinct
    /// from an individual member's failure.
    #[error("DKG session timed out without a result")]
    SessionTimedOut,
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Result publication failure for one member.
#[derive(Error, Debug)]
pub enum PublicationError {
    /// Deadline elapsed with no local submission and no competing result.
    #[error("publication deadline elapsed without a submitted result")]
    DeadlineExceeded,
    /// Not enough supporting signatures were collected in time.
    #[error("collected {actual} supporting signatures, need {required}")]
    TooFewSignatures { actual: usize, required: usize },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Net(#[from] NetError),
    /// A competing result was observed but does not match the locally held
    /// one, so this member cannot determine its fate from it.
    #[error("submitted result does not match the locally computed result")]
    ResultMismatch,
    /// No competing result arrived before the deadline; the member's fate
    /// in the final group cannot be determined.
    #[error("could not determine member fate before the publication deadline")]
    FateUndecided,
}

/// Final signing group resolution failure.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GroupError {
    #[error("operating member count {actual} below group quorum {required}")]
    QuorumNotReached { required: usize, actual: usize },
    #[error("operating member index {0} out of selected group range")]
    OperatingIndexOutOfRange(MemberIndex),
}

/// Wallet registry failure.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("signer store error: {0}")]
    Store(String),
}

/// Failure of a single signing attempt. Stays inside the signing loop
/// until the attempt limit is reached.
#[derive(Error, Debug)]
pub enum SigningAttemptError {
    /// The listed members failed to respond with valid partial signatures.
    #[error("signing attempt failed; inactive members: {inactive:?}")]
    MembersInactive { inactive: Vec<MemberIndex> },
    #[error("signing attempt failed: {0}")]
    ExecutionFailed(String),
    #[error("signing attempt cancelled")]
    Cancelled,
}

/// Threshold signing failure, terminal for the caller.
#[derive(Error, Debug)]
pub enum SigningError {
    #[error("node controls no signers of the requested wallet")]
    NoSignersControlled,
    #[error("signing failed after {attempts} attempts")]
    AttemptsExhausted { attempts: u64 },
    #[error("signing cancelled")]
    Cancelled,
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Net(#[from] NetError),
}
