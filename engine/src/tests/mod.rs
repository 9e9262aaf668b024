//! End-to-end flow tests running the node against the deterministic
//! fakes: in-memory chain, in-memory broadcast bus, canned executors.
