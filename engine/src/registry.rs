//! Durable mapping from a wallet's group public key to the signers this
//! node controls within that wallet.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::RegistryError;
use crate::types::{KeyShare, MemberIndex, OperatorAddress};

/// Local artifact of a completed group formation: one controlled member's
/// share of the wallet key, together with the final signing group.
#[derive(Clone)]
pub struct Signer {
    /// Public key of the wallet this signer belongs to.
    pub wallet_public_key: Vec<u8>,
    /// Operators of the final signing group, ordered by final index.
    pub signing_group_operators: Vec<OperatorAddress>,
    /// This signer's index within the final signing group.
    pub signing_group_member_index: MemberIndex,
    /// This signer's share of the wallet private key.
    pub private_key_share: KeyShare,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("wallet_public_key", &hex::encode(&self.wallet_public_key))
            .field("signing_group_member_index", &self.signing_group_member_index)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "signer of wallet [0x{}] with index [{}]",
            hex::encode(&self.wallet_public_key),
            self.signing_group_member_index
        )
    }
}

/// Opaque persistence seam for key material. The registry hands every
/// newly registered signer to the store; how and where it lands is not
/// this crate's concern.
pub trait SignerStore: Send + Sync {
    fn save(&self, signer: &Signer) -> Result<(), RegistryError>;
}

/// Store that keeps signers in memory only. Default for tests and for
/// hosts that manage persistence elsewhere.
#[derive(Default)]
pub struct MemorySignerStore {
    saved: Mutex<Vec<Signer>>,
}

impl MemorySignerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved_count(&self) -> usize {
        self.saved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl SignerStore for MemorySignerStore {
    fn save(&self, signer: &Signer) -> Result<(), RegistryError> {
        self.saved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(signer.clone());
        Ok(())
    }
}

/// Registry of all signers controlled by this node, keyed by wallet
/// public key. The only state shared across member tasks within a node;
/// writes are append-only behind the mutex.
pub struct WalletRegistry {
    wallets: Mutex<HashMap<String, Vec<Signer>>>,
    store: Arc<dyn SignerStore>,
}

impl WalletRegistry {
    pub fn new(store: Arc<dyn SignerStore>) -> Self {
        Self {
            wallets: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Registers a signer under its wallet public key.
    ///
    /// Registering the same `(wallet, member index)` pair twice is
    /// idempotent: retried publication paths reaching the same terminal
    /// state must not fail, and the registry keeps exactly one entry.
    pub fn register_signer(&self, signer: Signer) -> Result<(), RegistryError> {
        let mut wallets = self
            .wallets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let key = hex::encode(&signer.wallet_public_key);
        let signers = wallets.entry(key).or_default();

        let duplicate = signers
            .iter()
            .any(|existing| existing.signing_group_member_index == signer.signing_group_member_index);
        if duplicate {
            debug!(%signer, "signer already registered; ignoring duplicate");
            return Ok(());
        }

        self.store.save(&signer)?;
        info!(%signer, "registered signer");
        signers.push(signer);
        Ok(())
    }

    /// All signers this node controls for the given wallet. Empty if the
    /// node controls none; never an error.
    pub fn get_signers(&self, wallet_public_key: &[u8]) -> Vec<Signer> {
        let wallets = self
            .wallets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        wallets
            .get(&hex::encode(wallet_public_key))
            .cloned()
            .unwrap_or_default()
    }
}
