//! The block harness connects to Bitcoin nodes as a P2P peer, feeds them blocks that each
//! carry one consensus-invalid transaction and verifies that every node refuses them.
//! The harness builds its own chain on top of the node's tip to obtain mature coinbase
//! outputs to spend from.

/// This module contains the signing seam used to authorize spends of the harness's own
/// outputs.
pub mod authorization;
/// This module contains the registry of invalid transaction templates and the reaction
/// each one is expected to provoke.
pub mod bad_tx;
/// This module contains the builder for solved blocks on top of the tracked chain.
pub mod block_factory;
/// This module contains the read-only view of the target's chain.
pub mod chain_query;
/// This module contains the tracker of blocks created during a run, keyed by alias.
pub mod chainstate;
mod cli;
/// This module contains the configuration struct used to start a run.
pub mod config;
/// This module contains code that is used to manage a single connection to a
/// BTC node.
pub mod connection;
/// This module runs independent scenarios against several targets.
pub mod fanout;
/// This module contains the slog setup.
pub mod logger;
/// This module contains the invalid-block run itself.
pub mod scenario;
/// This module sends blocks and transactions and checks the target's reaction.
pub mod submission;

/// A block's position in the chain, the genesis block being at height 0.
pub type BlockHeight = u32;

pub use cli::{Cli, CliError};
pub use config::Config;
pub use fanout::{run_target, run_targets};
pub use scenario::{RunReport, ScenarioError};
