//! Test helpers for the block harness: an in-process node that speaks enough of the
//! Bitcoin P2P protocol to accept or reject the harness's submissions.

/// A fake target node with a minimal block and transaction validator.
pub mod mock_node;

pub use mock_node::MockNode;
