//! The invalid-block run: funds the harness on the target's chain, then submits one block
//! per consensus-invalid transaction template and checks that every one of them is
//! refused.
use crate::{
    bad_tx::BadTxTemplate,
    block_factory::{BlockFactory, BlockFactoryError, NextBlock},
    chain_query::{ChainQuery, QueryError},
    chainstate::{Alias, ChainState, ChainStateError, SpendableOutput},
    config::{Config, ConfigError},
    submission::{Expectation, Observed, SubmitError, Submitter},
};
use bitcoin::{Block, ScriptBuf};
use slog::{info, warn, Logger};
use std::time::Duration;
use thiserror::Error;

/// Valid for a block at height 120, and for any block while BIP34 is not yet active.
pub const DUPLICATE_COINBASE_SCRIPT_SIG: [u8; 2] = [0x01, 0x78];

/// The alias of the last valid block, which every invalid block is built on.
const SPEND_TIP: u64 = 2;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    BlockFactory(#[from] BlockFactoryError),
    #[error(transparent)]
    ChainState(#[from] ChainStateError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Failed to connect to the target: {0}")]
    Connect(SubmitError),
    /// A block the rest of the run depends on was not accepted.
    #[error("Setup block {alias} was not accepted: {source}")]
    Setup {
        alias: Alias,
        #[source]
        source: SubmitError,
    },
    #[error("Run aborted: {0}")]
    Aborted(String),
    #[error("At least {needed} spendable outputs are needed, only {collected} are collected")]
    NotEnoughSpendableOutputs { needed: usize, collected: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScenarioConfig {
    pub maturity_buffer_blocks: u32,
    pub spendable_outputs_to_collect: usize,
    /// The wait for the reaction to one invalid submission.
    pub submit_timeout: Duration,
    /// The wait for the setup blocks to be accepted.
    pub sync_timeout: Duration,
    pub mempool_checks: bool,
}

impl From<&Config> for ScenarioConfig {
    fn from(config: &Config) -> Self {
        Self {
            maturity_buffer_blocks: config.maturity_buffer_blocks,
            spendable_outputs_to_collect: config.spendable_outputs_to_collect,
            submit_timeout: config.submit_timeout(),
            sync_timeout: config.sync_timeout(),
            mempool_checks: config.mempool_checks,
        }
    }
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// How a submission was made.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    /// A valid block the run builds on.
    Setup,
    /// A block carrying a bad transaction.
    InvalidBlock,
    /// A bad transaction relayed on its own.
    Relay,
}

#[derive(Debug)]
pub struct StepReport {
    pub alias: Alias,
    pub kind: StepKind,
    pub violation: Option<BadTxTemplate>,
    pub outcome: Result<Observed, SubmitError>,
}

impl StepReport {
    pub fn passed(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    /// The P2P address of the node under test.
    pub target: String,
    pub steps: Vec<StepReport>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.steps.iter().all(StepReport::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|step| !step.passed())
    }
}

/// One run against one target. Owns the target's tracker, block factory and connection.
pub struct InvalidBlockScenario<Q> {
    state: ChainState,
    factory: BlockFactory,
    submitter: Submitter<Q>,
    config: ScenarioConfig,
    logger: Logger,
}

impl<Q: ChainQuery> InvalidBlockScenario<Q> {
    pub fn new(
        state: ChainState,
        factory: BlockFactory,
        submitter: Submitter<Q>,
        config: ScenarioConfig,
        logger: Logger,
    ) -> Self {
        Self {
            state,
            factory,
            submitter,
            config,
            logger,
        }
    }

    pub fn state(&self) -> &ChainState {
        &self.state
    }

    pub fn submitter(&self) -> &Submitter<Q> {
        &self.submitter
    }

    /// Runs all steps. Setup failures abort the run; failures of the invalid submissions
    /// are recorded in the report.
    pub async fn run(&mut self) -> Result<RunReport, ScenarioError> {
        let mut report = RunReport {
            target: self.submitter.address().to_string(),
            steps: vec![],
        };

        // A block whose coinbase carries a fixed script, so that a later block could
        // duplicate its coinbase.
        let dup_cb = Alias::from("dup_cb");
        self.factory
            .next_block(&mut self.state, dup_cb.clone(), NextBlock::new())?;
        let block = self.factory.update_block_with(&mut self.state, dup_cb.clone(), |block| {
            block.txdata[0].input[0].script_sig =
                ScriptBuf::from_bytes(DUPLICATE_COINBASE_SCRIPT_SIG.to_vec());
        })?;
        report.steps.push(self.submit_setup(dup_cb, vec![block]).await?);

        let b0 = self
            .factory
            .next_block(&mut self.state, 0u64, NextBlock::new())?;
        self.state.save_tip_spendable()?;
        report.steps.push(self.submit_setup(0u64.into(), vec![b0]).await?);

        // Let the first spendable coinbase mature.
        let mut buffer = vec![];
        for i in 0..self.config.maturity_buffer_blocks {
            buffer.push(self.factory.next_block(
                &mut self.state,
                format!("maturitybuffer.{}", i),
                NextBlock::new(),
            )?);
            self.state.save_tip_spendable()?;
        }
        if let Some(last) = self.state.tip_alias().cloned() {
            if !buffer.is_empty() {
                report.steps.push(self.submit_setup(last, buffer).await?);
            }
        }

        // Three outputs are spent or attempted below.
        let wanted = self.config.spendable_outputs_to_collect;
        let queued = self.state.spendable_len();
        if wanted < 3 || queued < wanted {
            return Err(ScenarioError::NotEnoughSpendableOutputs {
                needed: wanted.max(3),
                collected: queued.min(wanted),
            });
        }
        let mut out = vec![];
        for _ in 0..wanted {
            out.push(self.state.pop_spendable()?);
        }

        let b1 = self.factory.next_block(
            &mut self.state,
            1u64,
            NextBlock::new().spending(out[0].clone()),
        )?;
        self.state.save_tip_spendable()?;
        let b2 = self.factory.next_block(
            &mut self.state,
            SPEND_TIP,
            NextBlock::new().spending(out[1].clone()),
        )?;
        self.state.save_tip_spendable()?;
        report
            .steps
            .push(self.submit_setup(SPEND_TIP.into(), vec![b1, b2]).await?);

        // Never actually spent: every block trying to spend it is invalid.
        let attempt_spend = out[2].clone();
        for template in BadTxTemplate::iter() {
            if template.expected().valid_in_block {
                continue;
            }
            let step = self.run_invalid_block(template, &attempt_spend).await?;
            report.steps.push(step);
            self.state.move_tip(SPEND_TIP)?;
        }

        if self.config.mempool_checks {
            for template in BadTxTemplate::iter() {
                let step = self.run_relay(template, &attempt_spend).await?;
                report.steps.push(step);
            }
        }

        let failed = report.failures().count();
        info!(
            self.logger,
            "Finished run against {}: {} steps, {} failed",
            report.target,
            report.steps.len(),
            failed
        );
        Ok(report)
    }

    /// Builds `for_invalid.<template>` on the current tip, injects the template's
    /// transaction and submits the block, expecting the target to refuse it and
    /// disconnect.
    pub async fn run_invalid_block(
        &mut self,
        template: BadTxTemplate,
        spend: &SpendableOutput,
    ) -> Result<StepReport, ScenarioError> {
        info!(self.logger, "Reject block with invalid tx: {}", template);
        let alias = Alias::from(format!("for_invalid.{}", template));
        let bad = template.instantiate(spend);
        self.factory
            .next_block(&mut self.state, alias.clone(), NextBlock::new())?;
        let tx = bad.authorized_tx(&self.factory)?;
        let block = self
            .factory
            .update_block(&mut self.state, alias.clone(), vec![tx])?;

        let expectation =
            Expectation::rejected(bad.expected().block_reason(), true, self.config.submit_timeout);
        let outcome = self.submitter.submit_block(&block, &expectation).await;
        Ok(self.step(alias, StepKind::InvalidBlock, Some(template), outcome))
    }

    /// Relays the template's transaction on its own and checks the mempool verdict.
    pub async fn run_relay(
        &mut self,
        template: BadTxTemplate,
        spend: &SpendableOutput,
    ) -> Result<StepReport, ScenarioError> {
        info!(self.logger, "Reject relayed tx: {}", template);
        let bad = template.instantiate(spend);
        let tx = bad.authorized_tx(&self.factory)?;
        let expected = bad.expected();
        let expectation = Expectation::rejected(
            expected.reject_reason,
            expected.expect_disconnect,
            self.config.submit_timeout,
        );
        let outcome = self.submitter.submit_transaction(&tx, &expectation).await;
        Ok(self.step(
            Alias::from(format!("relay.{}", template)),
            StepKind::Relay,
            Some(template),
            outcome,
        ))
    }

    async fn submit_setup(
        &mut self,
        alias: Alias,
        blocks: Vec<Block>,
    ) -> Result<StepReport, ScenarioError> {
        let expectation = Expectation::accepted(self.config.sync_timeout);
        match self.submitter.submit_blocks(&blocks, &expectation).await {
            Ok(observed) => Ok(self.step(alias, StepKind::Setup, None, Ok(observed))),
            Err(source) => Err(ScenarioError::Setup { alias, source }),
        }
    }

    fn step(
        &self,
        alias: Alias,
        kind: StepKind,
        violation: Option<BadTxTemplate>,
        outcome: Result<Observed, SubmitError>,
    ) -> StepReport {
        if let Err(err) = &outcome {
            warn!(
                self.logger,
                "Step {} ({}) failed: {}",
                alias,
                violation.map(|t| t.name()).unwrap_or("setup"),
                err
            );
        }
        StepReport {
            alias,
            kind,
            violation,
            outcome,
        }
    }
}
