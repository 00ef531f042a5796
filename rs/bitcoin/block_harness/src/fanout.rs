//! Runs the scenario against several targets at once. Targets share nothing: each one
//! gets its own tracker, key, factory and connection.
use crate::{
    authorization::KeySigner,
    block_factory::BlockFactory,
    chain_query::{ChainQuery, RpcChainQuery},
    chainstate::{ChainState, SpendableOutput},
    config::{Config, TargetConfig},
    scenario::{InvalidBlockScenario, RunReport, ScenarioConfig, ScenarioError},
    submission::{Submitter, SubmitterSettings},
};
use futures::future::join_all;
use slog::{error, info, o, Logger};

/// Splits a shared pool of source outputs into `parts` disjoint sets, round-robin, so that
/// no two targets are handed the same output.
pub fn partition_spendable(
    outputs: Vec<SpendableOutput>,
    parts: usize,
) -> Vec<Vec<SpendableOutput>> {
    if parts == 0 {
        return vec![];
    }
    let mut partitions = vec![vec![]; parts];
    for (i, output) in outputs.into_iter().enumerate() {
        partitions[i % parts].push(output);
    }
    partitions
}

/// Runs the scenario against `target`, whose chain is read through its JSON-RPC interface.
pub async fn run_target(
    config: &Config,
    target: &TargetConfig,
    logger: Logger,
) -> Result<RunReport, ScenarioError> {
    let query = RpcChainQuery::new(target)?;
    run_target_with(config, target.p2p_endpoint(config.port()), query, logger).await
}

/// Runs the scenario against the node at `p2p_address`, reading its chain through `query`.
/// The tracker is anchored at the node's current tip.
pub async fn run_target_with<Q: ChainQuery>(
    config: &Config,
    p2p_address: String,
    query: Q,
    logger: Logger,
) -> Result<RunReport, ScenarioError> {
    let tip = query.best_block_hash()?;
    let anchor = query.block_header(&tip)?;
    let height = query.block_height(&tip)?;
    info!(
        logger,
        "Target {} is at height {} ({})", p2p_address, height, tip
    );
    let state = ChainState::with_anchor(anchor, height);

    let signer = KeySigner::generate();
    let factory = BlockFactory::new(
        config.chain_params(),
        signer.p2pk_script(),
        Box::new(signer),
        logger.clone(),
    );
    let settings = SubmitterSettings {
        address: p2p_address,
        magic: config.magic()?,
        handshake_timeout: config.handshake_timeout(),
        strict_reject_reason: config.strict_reject_reason,
    };
    let submitter = Submitter::connect(settings, query, logger.clone())
        .await
        .map_err(ScenarioError::Connect)?;

    InvalidBlockScenario::new(
        state,
        factory,
        submitter,
        ScenarioConfig::from(config),
        logger,
    )
    .run()
    .await
}

/// Runs one independent scenario per configured target, concurrently. Results are
/// returned in the order of `config.targets`, keyed by the target's P2P address.
pub async fn run_targets(
    config: &Config,
    logger: &Logger,
) -> Vec<(String, Result<RunReport, ScenarioError>)> {
    let runs = config.targets.iter().cloned().map(|target| {
        let config = config.clone();
        let logger = logger.new(o!("target" => target.p2p_address.clone()));
        tokio::spawn(async move {
            let result = run_target(&config, &target, logger.clone()).await;
            if let Err(err) = &result {
                error!(logger, "Run against {} failed: {}", target.p2p_address, err);
            }
            (target.p2p_address, result)
        })
    });
    join_all(runs)
        .await
        .into_iter()
        .zip(config.targets.iter())
        .map(|(joined, target)| match joined {
            Ok(result) => result,
            Err(err) => (
                target.p2p_address.clone(),
                Err(ScenarioError::Aborted(err.to_string())),
            ),
        })
        .collect()
}
