//! Broadcast transport consumed by the protocol: named channels with
//! sender filtering and typed messages, plus the stop-pill mechanism that
//! lets the first finished member terminate the others early.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::NetError;
use crate::types::{MemberIndex, ResultHash, Signature};

/// Supporting signature over a result hash, broadcast during publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultHashSignatureMessage {
    pub session_seed: String,
    pub sender_index: MemberIndex,
    pub result_hash: ResultHash,
    pub signature: Signature,
    pub public_key: Vec<u8>,
}

/// Sent by a member that already holds a result so still-racing members
/// stop their attempts. Best-effort; never required for correctness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopPillMessage {
    pub session_seed: String,
    pub attempt: u64,
}

/// Every message type exchanged on a protocol channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    ResultHashSignature(ResultHashSignatureMessage),
    StopPill(StopPillMessage),
}

/// A message together with its transport-level sender identity.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender_public_key: Vec<u8>,
    pub message: ProtocolMessage,
}

/// Predicate applied to sender public keys before delivery.
pub type SenderFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Wire codec for protocol messages.
pub fn marshal(message: &ProtocolMessage) -> Result<Vec<u8>, NetError> {
    bincode::serialize(message).map_err(|e| NetError::PublishFailed(e.to_string()))
}

/// Inverse of [`marshal`]. Malformed payloads are dropped by transports.
pub fn unmarshal(bytes: &[u8]) -> Option<ProtocolMessage> {
    bincode::deserialize(bytes).ok()
}

/// A named, filtered pub/sub topic scoped to one session or signing group.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, message: ProtocolMessage) -> Result<(), NetError>;

    /// New subscription delivering messages that passed the sender filter.
    fn subscribe(&self) -> broadcast::Receiver<Envelope>;

    /// Install the sender filter. Messages from senders rejected by the
    /// filter never reach protocol logic.
    fn set_filter(&self, filter: SenderFilter) -> Result<(), NetError>;
}

/// Factory for broadcast channels.
pub trait NetProvider: Send + Sync {
    fn broadcast_channel_for(&self, name: &str) -> Result<Arc<dyn BroadcastChannel>, NetError>;
}

/// Cancels `cancel` when a stop pill for `session_seed` arrives on the
/// channel. Runs until the pill, the channel closing, or `cancel` itself.
pub fn cancel_on_stop_signal(
    cancel: CancellationToken,
    channel: Arc<dyn BroadcastChannel>,
    session_seed: String,
) {
    let mut receiver = channel.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = receiver.recv() => match received {
                    Ok(envelope) => {
                        if let ProtocolMessage::StopPill(pill) = envelope.message {
                            if pill.session_seed == session_seed {
                                tracing::debug!(
                                    session = %session_seed,
                                    attempt = pill.attempt,
                                    "stop pill received",
                                );
                                cancel.cancel();
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "stop signal watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    });
}

/// Broadcast a stop pill for the given session and attempt.
pub async fn send_stop_pill(
    channel: &dyn BroadcastChannel,
    session_seed: &str,
    attempt: u64,
) -> Result<(), NetError> {
    channel
        .publish(ProtocolMessage::StopPill(StopPillMessage {
            session_seed: session_seed.to_string(),
            attempt,
        }))
        .await
}

/// Schedule a stop pill to be sent after `delay`, as an independently
/// cancellable background task. The delay leaves room for members that are
/// close to producing the result themselves.
pub fn schedule_stop_pill(
    cancel: CancellationToken,
    channel: Arc<dyn BroadcastChannel>,
    session_seed: String,
    attempt: u64,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                if let Err(error) = send_stop_pill(channel.as_ref(), &session_seed, attempt).await {
                    tracing::error!(session = %session_seed, %error, "could not send the stop pill");
                }
            }
        }
    })
}
