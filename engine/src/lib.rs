//! Coordination engine for threshold-ECDSA signing groups.
//!
//! Drives group formation end to end against a replicated ledger: reacting
//! to DKG-started events, running the retry loop for every controlled
//! member, publishing the agreed result, resolving the final signing group
//! and registering the resulting signers. The cryptographic protocols
//! themselves sit behind the [`dkg::DkgExecutor`] and
//! [`signing::SigningExecutor`] seams; everything here is coordination,
//! defined in ledger time rather than wall-clock time.

pub mod chain;
pub mod config;
pub mod deduplicator;
pub mod dkg;
pub mod error;
pub mod group;
pub mod latch;
pub mod logging;
pub mod net;
pub mod node;
pub mod registry;
pub mod signing;
pub mod types;

#[cfg(test)]
mod testutil;

#[cfg(test)]
mod tests;

/// Protocol identifier prefixed to every broadcast channel name.
pub const PROTOCOL_NAME: &str = "tecdsa";
