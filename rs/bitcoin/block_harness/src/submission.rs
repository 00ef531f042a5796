//! Sends blocks and transactions to the node under test and checks the node's reaction
//! against a declared [Expectation]. This is the harness's test oracle.
use crate::{
    chain_query::{ChainQuery, QueryError},
    connection::{ConnectionError, PeerConnection, RejectNotice},
};
use bitcoin::{
    hashes::{sha256d, Hash},
    p2p::Magic,
    Block, BlockHash, Transaction,
};
use slog::{error, info, warn, Logger};
use std::{fmt, time::Duration};
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// How often the target's chain view is polled while waiting for a tip change.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The reaction a submission is expected to trigger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expectation {
    /// For blocks: the tip advances to the (last) submitted block. For transactions: the
    /// transaction enters the mempool. When `false`, the tip must stay where it was.
    pub accepted: bool,
    /// The reject reason the target must report, if any.
    pub reject_reason: Option<String>,
    /// Whether the target must close the connection.
    pub disconnect: bool,
    /// Upper bound on the wait for each observable.
    pub timeout: Duration,
}

impl Expectation {
    pub fn accepted(timeout: Duration) -> Self {
        Self {
            accepted: true,
            reject_reason: None,
            disconnect: false,
            timeout,
        }
    }

    pub fn rejected(reject_reason: Option<&str>, disconnect: bool, timeout: Duration) -> Self {
        Self {
            accepted: false,
            reject_reason: reject_reason.map(str::to_string),
            disconnect,
            timeout,
        }
    }
}

/// What the target actually did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Observed {
    /// The target's best block after the submission settled.
    pub tip: BlockHash,
    /// Whether the submission was taken: the tip reached the block, or the transaction is
    /// in the mempool.
    pub accepted: bool,
    pub reject_reason: Option<String>,
    pub connected: bool,
}

/// A submission whose outcome differs from its expectation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    /// What was submitted, e.g. `block 3f2a...`.
    pub subject: String,
    pub expected: Expectation,
    pub observed: Observed,
    pub detail: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} (expected {:?}, observed {:?})",
            self.subject, self.detail, self.expected, self.observed
        )
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Verification failed for {0}")]
    VerificationMismatch(Box<Mismatch>),
    /// The peer went away while no disconnect was expected.
    #[error("Connection lost unexpectedly: {0}")]
    ConnectionLost(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("Nothing to submit")]
    NothingToSubmit,
}

/// Where and how the submitter connects.
#[derive(Clone, Debug)]
pub struct SubmitterSettings {
    /// `host:port` of the target's P2P endpoint.
    pub address: String,
    pub magic: Magic,
    pub handshake_timeout: Duration,
    /// When `true`, an expected reject reason must actually be reported. Otherwise a
    /// missing reject notice is tolerated and only a different reason fails the step.
    pub strict_reject_reason: bool,
}

/// Submits to a single target over one connection, re-established as needed.
pub struct Submitter<Q> {
    settings: SubmitterSettings,
    connection: Option<PeerConnection>,
    query: Q,
    logger: Logger,
}

enum Subject<'a> {
    Blocks(&'a [Block]),
    Transaction(&'a Transaction),
}

impl Subject<'_> {
    fn describe(&self) -> String {
        match self {
            Subject::Blocks([block]) => format!("block {}", block.block_hash()),
            Subject::Blocks(blocks) => match blocks.last() {
                Some(last) => format!("{} blocks ending in {}", blocks.len(), last.block_hash()),
                None => "no blocks".to_string(),
            },
            Subject::Transaction(tx) => format!("transaction {}", tx.compute_txid()),
        }
    }

    /// The hash a reject notice refers to when it is about this subject.
    fn reject_hash(&self) -> Option<sha256d::Hash> {
        match self {
            Subject::Blocks(blocks) => blocks
                .last()
                .map(|block| sha256d::Hash::from_byte_array(block.block_hash().to_byte_array())),
            Subject::Transaction(tx) => Some(sha256d::Hash::from_byte_array(
                tx.compute_txid().to_byte_array(),
            )),
        }
    }
}

impl<Q: ChainQuery> Submitter<Q> {
    /// Connects to the target and returns a submitter ready for use.
    pub async fn connect(
        settings: SubmitterSettings,
        query: Q,
        logger: Logger,
    ) -> Result<Self, SubmitError> {
        let mut submitter = Self {
            settings,
            connection: None,
            query,
            logger,
        };
        submitter.reconnect().await?;
        Ok(submitter)
    }

    /// The P2P address of the target.
    pub fn address(&self) -> &str {
        &self.settings.address
    }

    pub fn query(&self) -> &Q {
        &self.query
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .map(PeerConnection::is_connected)
            .unwrap_or(false)
    }

    /// Drops the current connection, if any, and performs a fresh handshake.
    pub async fn reconnect(&mut self) -> Result<(), SubmitError> {
        if let Some(old) = self.connection.take() {
            old.disconnect().await;
        }
        let connection = PeerConnection::connect(
            &self.settings.address,
            self.settings.magic,
            self.settings.handshake_timeout,
            self.logger.clone(),
        )
        .await?;
        self.connection = Some(connection);
        Ok(())
    }

    /// Submits a single block.
    pub async fn submit_block(
        &mut self,
        block: &Block,
        expectation: &Expectation,
    ) -> Result<Observed, SubmitError> {
        self.submit_blocks(std::slice::from_ref(block), expectation)
            .await
    }

    /// Sends `blocks` in order and verifies the outcome against the last one.
    pub async fn submit_blocks(
        &mut self,
        blocks: &[Block],
        expectation: &Expectation,
    ) -> Result<Observed, SubmitError> {
        if blocks.is_empty() {
            return Err(SubmitError::NothingToSubmit);
        }
        self.submit_with_retry(Subject::Blocks(blocks), expectation)
            .await
    }

    /// Relays a transaction on its own and verifies the outcome through the mempool.
    pub async fn submit_transaction(
        &mut self,
        tx: &Transaction,
        expectation: &Expectation,
    ) -> Result<Observed, SubmitError> {
        self.submit_with_retry(Subject::Transaction(tx), expectation)
            .await
    }

    async fn submit_with_retry(
        &mut self,
        subject: Subject<'_>,
        expectation: &Expectation,
    ) -> Result<Observed, SubmitError> {
        match self.submit_once(&subject, expectation).await {
            Err(SubmitError::ConnectionLost(reason)) => {
                warn!(
                    self.logger,
                    "Lost connection to {} while submitting {}: {}. Retrying once.",
                    self.settings.address,
                    subject.describe(),
                    reason
                );
                self.reconnect().await?;
                self.submit_once(&subject, expectation).await
            }
            result => result,
        }
    }

    async fn submit_once(
        &mut self,
        subject: &Subject<'_>,
        expectation: &Expectation,
    ) -> Result<Observed, SubmitError> {
        if !self.is_connected() {
            self.reconnect().await?;
        }
        let connection = match &self.connection {
            Some(connection) => connection,
            None => return Err(SubmitError::ConnectionLost(self.settings.address.clone())),
        };
        let tip_before = self.query.best_block_hash()?;
        let rejects_before = connection.reject_count();

        info!(
            self.logger,
            "Submitting {} to {}",
            subject.describe(),
            self.settings.address
        );
        let sent = match subject {
            Subject::Blocks(blocks) => {
                let mut sent = Ok(());
                for block in blocks.iter() {
                    sent = connection.send_block(block).await;
                    if sent.is_err() {
                        break;
                    }
                }
                sent
            }
            Subject::Transaction(tx) => connection.send_transaction(tx).await,
        };
        if let Err(err) = sent {
            if !expectation.disconnect {
                return Err(SubmitError::ConnectionLost(err.to_string()));
            }
        }

        if expectation.disconnect {
            connection.wait_for_disconnect(expectation.timeout).await;
        } else {
            match connection.sync_with_ping(expectation.timeout).await {
                Ok(()) | Err(ConnectionError::PingTimeout(_)) => {}
                Err(err) => return Err(SubmitError::ConnectionLost(err.to_string())),
            }
        }

        let (tip, accepted) = match subject {
            Subject::Blocks(blocks) => {
                let target = blocks
                    .last()
                    .map(Block::block_hash)
                    .ok_or(SubmitError::NothingToSubmit)?;
                let tip = if expectation.accepted {
                    self.poll_tip(expectation.timeout, |tip| *tip == target)
                        .await?
                } else {
                    self.query.best_block_hash()?
                };
                (tip, tip == target)
            }
            Subject::Transaction(tx) => {
                let txid = tx.compute_txid();
                let in_mempool = if expectation.accepted {
                    self.poll_mempool(expectation.timeout, &txid).await?
                } else {
                    self.query.mempool_contains(&txid)?
                };
                (self.query.best_block_hash()?, in_mempool)
            }
        };
        let observed = Observed {
            tip,
            accepted,
            reject_reason: pick_reject(
                &connection.rejects_since(rejects_before),
                subject.reject_hash(),
            ),
            connected: connection.is_connected(),
        };

        let check_tip = matches!(subject, Subject::Blocks(_)).then_some(tip_before);
        let result = match check(
            expectation,
            &observed,
            check_tip,
            self.settings.strict_reject_reason,
        ) {
            Some(detail) => {
                let mismatch = Mismatch {
                    subject: subject.describe(),
                    expected: expectation.clone(),
                    observed: observed.clone(),
                    detail,
                };
                warn!(self.logger, "Verification failed: {}", mismatch);
                Err(SubmitError::VerificationMismatch(Box::new(mismatch)))
            }
            None => {
                info!(
                    self.logger,
                    "{} behaved as expected (tip {}, reject reason {:?})",
                    subject.describe(),
                    observed.tip,
                    observed.reject_reason
                );
                Ok(observed.clone())
            }
        };

        if !observed.connected {
            if let Err(err) = self.reconnect().await {
                error!(
                    self.logger,
                    "Failed to reconnect to {}: {}", self.settings.address, err
                );
                self.connection = None;
            }
        }
        result
    }

    async fn poll_tip(
        &self,
        wait: Duration,
        done: impl Fn(&BlockHash) -> bool,
    ) -> Result<BlockHash, SubmitError> {
        let deadline = Instant::now() + wait;
        loop {
            let tip = self.query.best_block_hash()?;
            if done(&tip) || Instant::now() >= deadline {
                return Ok(tip);
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn poll_mempool(
        &self,
        wait: Duration,
        txid: &bitcoin::Txid,
    ) -> Result<bool, SubmitError> {
        let deadline = Instant::now() + wait;
        loop {
            let found = self.query.mempool_contains(txid)?;
            if found || Instant::now() >= deadline {
                return Ok(found);
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

/// The reason of the reject notice about `hash`, or of the first notice when none refers
/// to it.
fn pick_reject(notices: &[RejectNotice], hash: Option<sha256d::Hash>) -> Option<String> {
    notices
        .iter()
        .find(|notice| Some(notice.hash) == hash)
        .or_else(|| notices.first())
        .map(|notice| notice.reason.clone())
}

/// Compares an observation with its expectation. `tip_before` is the tip prior to a block
/// submission, which a rejected block must leave in place. Returns a description of the
/// first difference.
fn check(
    expected: &Expectation,
    observed: &Observed,
    tip_before: Option<BlockHash>,
    strict_reject_reason: bool,
) -> Option<String> {
    if expected.accepted && !observed.accepted {
        return Some("submission was not accepted".to_string());
    }
    if !expected.accepted {
        if observed.accepted {
            return Some("submission was accepted".to_string());
        }
        if let Some(before) = tip_before {
            if observed.tip != before {
                return Some(format!("tip moved from {} to {}", before, observed.tip));
            }
        }
    }
    match (&expected.reject_reason, &observed.reject_reason) {
        (Some(want), Some(got)) if want != got => {
            return Some(format!("reject reason {:?}, wanted {:?}", got, want));
        }
        (Some(want), None) if strict_reject_reason => {
            return Some(format!("no reject notice, wanted {:?}", want));
        }
        (None, Some(got)) if expected.accepted => {
            return Some(format!("unexpected reject reason {:?}", got));
        }
        _ => {}
    }
    if expected.disconnect && observed.connected {
        return Some("peer stayed connected".to_string());
    }
    if !expected.disconnect && !observed.connected {
        return Some("peer disconnected".to_string());
    }
    None
}
