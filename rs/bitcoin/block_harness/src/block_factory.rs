//! Builds blocks on top of the tracked tip and re-mines blocks after their transaction
//! list has been edited.
use crate::{
    authorization::{authorize_input, AuthorizationError, SpendAuthorizer},
    chainstate::{Alias, ChainState, ChainStateError, SpendableOutput},
    BlockHeight,
};
use bitcoin::{
    absolute::LockTime,
    block::{Header, Version},
    hashes::Hash,
    opcodes::OP_TRUE,
    script::Builder,
    transaction, Amount, Block, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction, TxIn,
    TxMerkleNode, TxOut, Witness,
};
use slog::{debug, Logger};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// The value every harness spend leaves in its single output.
pub const SPEND_OUTPUT_VALUE: Amount = Amount::from_sat(1);

/// The block version used unless a caller overrides it.
pub const DEFAULT_BLOCK_VERSION: i32 = 4;

/// The initial block subsidy before any halving.
const INITIAL_SUBSIDY: Amount = Amount::from_sat(50 * 100_000_000);

#[derive(Debug, Error)]
pub enum BlockFactoryError {
    #[error(transparent)]
    ChainState(#[from] ChainStateError),
    /// The nonce search gave up before finding a header below the target.
    #[error("No valid nonce found for block {alias} after {iterations} attempts")]
    ProofOfWorkFailed { alias: Alias, iterations: u64 },
    #[error("Failed to authorize spend: {0}")]
    Authorization(#[from] AuthorizationError),
    #[error("Output {outpoint} holds {available}, which cannot cover a {required} spend")]
    InsufficientValue {
        outpoint: OutPoint,
        available: Amount,
        required: Amount,
    },
    #[error("Output {0} does not exist")]
    UnknownOutput(OutPoint),
    #[error("Coinbase value of the block at height {height} overflows")]
    CoinbaseValueOverflow { height: BlockHeight },
}

/// Consensus parameters the factory mines against.
#[derive(Clone, Debug)]
pub struct ChainParams {
    /// Compact difficulty target written into every header.
    pub bits: CompactTarget,
    /// Number of blocks between two subsidy halvings.
    pub subsidy_halving_interval: u32,
    /// Upper bound on the nonce search for one header.
    pub max_nonce_iterations: u64,
}

impl ChainParams {
    /// Parameters of a regression test network.
    pub fn regtest() -> Self {
        Self {
            bits: CompactTarget::from_consensus(0x207fffff),
            subsidy_halving_interval: 150,
            max_nonce_iterations: u32::MAX as u64,
        }
    }

    /// The block subsidy at the given height.
    pub fn subsidy(&self, height: BlockHeight) -> Amount {
        let halvings = height / self.subsidy_halving_interval.max(1);
        if halvings >= 64 {
            return Amount::ZERO;
        }
        Amount::from_sat(INITIAL_SUBSIDY.to_sat() >> halvings)
    }
}

/// Describes the next block to build. Created with [NextBlock::new] and refined with
/// the builder methods.
#[derive(Clone, Debug)]
pub struct NextBlock {
    spend: Option<SpendableOutput>,
    additional_coinbase_value: Amount,
    script: ScriptBuf,
    coinbase_script: Option<ScriptBuf>,
    version: Version,
}

impl Default for NextBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl NextBlock {
    pub fn new() -> Self {
        Self {
            spend: None,
            additional_coinbase_value: Amount::ZERO,
            script: Builder::new().push_opcode(OP_TRUE).into_script(),
            coinbase_script: None,
            version: Version::from_consensus(DEFAULT_BLOCK_VERSION),
        }
    }

    /// Includes one transaction spending `output`.
    pub fn spending(mut self, output: SpendableOutput) -> Self {
        self.spend = Some(output);
        self
    }

    /// Adds `value` on top of the coinbase subsidy.
    pub fn with_additional_coinbase_value(mut self, value: Amount) -> Self {
        self.additional_coinbase_value = value;
        self
    }

    /// Sets the output script of the spending transaction.
    pub fn with_script(mut self, script: ScriptBuf) -> Self {
        self.script = script;
        self
    }

    /// Pays the coinbase to `script` instead of the factory's default recipient.
    pub fn with_coinbase_recipient(mut self, script: ScriptBuf) -> Self {
        self.coinbase_script = Some(script);
        self
    }

    pub fn with_version(mut self, version: i32) -> Self {
        self.version = Version::from_consensus(version);
        self
    }
}

/// Produces blocks extending the tracked tip and registers them with the
/// [ChainState](ChainState).
pub struct BlockFactory {
    params: ChainParams,
    coinbase_script: ScriptBuf,
    authorizer: Box<dyn SpendAuthorizer>,
    logger: Logger,
}

impl BlockFactory {
    pub fn new(
        params: ChainParams,
        coinbase_script: ScriptBuf,
        authorizer: Box<dyn SpendAuthorizer>,
        logger: Logger,
    ) -> Self {
        Self {
            params,
            coinbase_script,
            authorizer,
            logger,
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Builds, mines and registers a block on top of the current tip. The new block
    /// becomes the tip.
    pub fn next_block(
        &self,
        state: &mut ChainState,
        alias: impl Into<Alias>,
        next: NextBlock,
    ) -> Result<Block, BlockFactoryError> {
        let alias = alias.into();
        let parent = state.tip_header();
        let height = state.tip_height() + 1;
        let time = if state.tip_is_anchor() {
            parent.time.max(unix_now()) + 1
        } else {
            parent.time + 1
        };

        let recipient = next
            .coinbase_script
            .clone()
            .unwrap_or_else(|| self.coinbase_script.clone());
        // Registration grows the count, so siblings never share a coinbase.
        let extra_nonce = state.known_hashes() as i64;
        let mut coinbase = self.create_coinbase(
            height,
            extra_nonce,
            recipient,
            next.additional_coinbase_value,
        )?;
        let mut txdata = vec![];
        if let Some(spend) = &next.spend {
            let available = spend_txout(spend)?.value;
            let fee = available.checked_sub(SPEND_OUTPUT_VALUE).ok_or(
                BlockFactoryError::InsufficientValue {
                    outpoint: spend.outpoint(),
                    available,
                    required: SPEND_OUTPUT_VALUE,
                },
            )?;
            coinbase.output[0].value = coinbase.output[0]
                .value
                .checked_add(fee)
                .ok_or(BlockFactoryError::CoinbaseValueOverflow { height })?;
            let tx = self.create_and_sign_tx(spend, SPEND_OUTPUT_VALUE, next.script.clone())?;
            txdata.push(tx);
        }
        txdata.insert(0, coinbase);

        let mut block = Block {
            header: Header {
                version: next.version,
                prev_blockhash: parent.block_hash(),
                merkle_root: TxMerkleNode::all_zeros(),
                time,
                bits: self.params.bits,
                nonce: 0,
            },
            txdata,
        };
        self.solve(&alias, &mut block)?;
        state.register(alias.clone(), block.clone())?;
        debug!(
            self.logger,
            "Built block {} ({}) at height {} with {} transactions",
            alias,
            block.block_hash(),
            height,
            block.txdata.len()
        );
        Ok(block)
    }

    /// Appends `transactions` to the block registered under `alias`, re-mines it and
    /// moves the tracker's bookkeeping to the new hash.
    pub fn update_block(
        &self,
        state: &mut ChainState,
        alias: impl Into<Alias>,
        transactions: Vec<Transaction>,
    ) -> Result<Block, BlockFactoryError> {
        self.update_block_with(state, alias, |block| block.txdata.extend(transactions))
    }

    /// Applies an arbitrary edit to the block registered under `alias`, then recomputes
    /// the merkle root, re-mines the header and rebinds the alias.
    pub fn update_block_with(
        &self,
        state: &mut ChainState,
        alias: impl Into<Alias>,
        edit: impl FnOnce(&mut Block),
    ) -> Result<Block, BlockFactoryError> {
        let alias = alias.into();
        let mut block = state
            .get(&alias)
            .cloned()
            .ok_or_else(|| ChainStateError::UnknownAlias(alias.clone()))?;
        let old_hash = block.block_hash();
        edit(&mut block);
        self.solve(&alias, &mut block)?;
        state.rebind(alias.clone(), block.clone())?;
        debug!(
            self.logger,
            "Updated block {}: {} -> {}",
            alias,
            old_hash,
            block.block_hash()
        );
        Ok(block)
    }

    /// Builds a coinbase for `height` paying the subsidy plus `extra` to `recipient`.
    pub fn create_coinbase(
        &self,
        height: BlockHeight,
        extra_nonce: i64,
        recipient: ScriptBuf,
        extra: Amount,
    ) -> Result<Transaction, BlockFactoryError> {
        let value = self
            .params
            .subsidy(height)
            .checked_add(extra)
            .ok_or(BlockFactoryError::CoinbaseValueOverflow { height })?;
        Ok(Transaction {
            version: transaction::Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: coinbase_script_sig(height, extra_nonce),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value,
                script_pubkey: recipient,
            }],
        })
    }

    /// Signs input 0 of `tx`, which is assumed to spend `spend`.
    pub fn sign_tx(
        &self,
        tx: &mut Transaction,
        spend: &SpendableOutput,
    ) -> Result<(), BlockFactoryError> {
        authorize_input(self.authorizer.as_ref(), tx, 0, spend_txout(spend)?)?;
        Ok(())
    }

    fn create_and_sign_tx(
        &self,
        spend: &SpendableOutput,
        value: Amount,
        script: ScriptBuf,
    ) -> Result<Transaction, BlockFactoryError> {
        let mut tx = create_tx(spend, value, script);
        self.sign_tx(&mut tx, spend)?;
        Ok(tx)
    }

    /// Recomputes the merkle root and searches a nonce satisfying the header target.
    fn solve(&self, alias: &Alias, block: &mut Block) -> Result<(), BlockFactoryError> {
        if let Some(root) = block.compute_merkle_root() {
            block.header.merkle_root = root;
        }
        solve_header(&mut block.header, self.params.max_nonce_iterations).map_err(|iterations| {
            BlockFactoryError::ProofOfWorkFailed {
                alias: alias.clone(),
                iterations,
            }
        })
    }
}

/// Searches the nonce space from zero. Returns the number of attempts when no nonce within
/// `max_iterations` satisfies the target.
pub fn solve_header(header: &mut Header, max_iterations: u64) -> Result<(), u64> {
    let target = header.target();
    let limit = max_iterations.min(u32::MAX as u64 + 1);
    for nonce in 0..limit {
        header.nonce = nonce as u32;
        if header.validate_pow(target).is_ok() {
            return Ok(());
        }
    }
    Err(limit)
}

/// A transaction with one input spending `spend` and one output of `value` locked by
/// `script`. The input is left unauthorized.
pub fn create_tx(spend: &SpendableOutput, value: Amount, script: ScriptBuf) -> Transaction {
    Transaction {
        version: transaction::Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: spend.outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey: script,
        }],
    }
}

/// The BIP34 height commitment followed by `extra_nonce`. The nonce also keeps the script
/// at the two byte minimum for heights that encode as a single opcode.
pub fn coinbase_script_sig(height: BlockHeight, extra_nonce: i64) -> ScriptBuf {
    Builder::new()
        .push_int(height as i64)
        .push_int(extra_nonce)
        .into_script()
}

fn spend_txout(spend: &SpendableOutput) -> Result<&TxOut, BlockFactoryError> {
    spend
        .txout()
        .ok_or_else(|| BlockFactoryError::UnknownOutput(spend.outpoint()))
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::authorization::KeySigner;
    use crate::logger::no_op_logger;
    use assert_matches::assert_matches;
    use bitcoin::{
        blockdata::constants::genesis_block,
        consensus::{deserialize, serialize},
        Network,
    };
    use proptest::prelude::*;

    pub fn test_factory() -> BlockFactory {
        let signer = KeySigner::from_secret_bytes(&[42; 32]).unwrap();
        BlockFactory::new(
            ChainParams::regtest(),
            signer.p2pk_script(),
            Box::new(signer),
            no_op_logger(),
        )
    }

    fn regtest_state() -> ChainState {
        ChainState::new(genesis_block(Network::Regtest).header)
    }

    #[test]
    fn test_subsidy_halves() {
        let params = ChainParams::regtest();
        assert_eq!(params.subsidy(1), Amount::from_btc(50.0).unwrap());
        assert_eq!(params.subsidy(150), Amount::from_btc(25.0).unwrap());
        assert_eq!(params.subsidy(150 * 64), Amount::ZERO);
    }

    #[test]
    fn test_coinbase_script_sig_starts_with_height() {
        assert_eq!(coinbase_script_sig(1, 0).as_bytes(), &[0x51, 0x00]);
        assert_eq!(coinbase_script_sig(16, 1).as_bytes(), &[0x60, 0x51]);
        assert_eq!(coinbase_script_sig(17, 3).as_bytes(), &[0x01, 0x11, 0x53]);
        assert_eq!(
            coinbase_script_sig(300, 17).as_bytes(),
            &[0x02, 0x2c, 0x01, 0x01, 0x11]
        );
    }

    #[test]
    fn test_next_block_extends_tip_and_satisfies_target() {
        let factory = test_factory();
        let mut state = regtest_state();
        let genesis = state.tip_header();

        let b0 = factory.next_block(&mut state, 0u64, NextBlock::new()).unwrap();
        assert_eq!(b0.header.prev_blockhash, genesis.block_hash());
        assert!(b0.header.time > genesis.time);
        assert!(b0.check_merkle_root());
        assert!(b0.header.validate_pow(b0.header.target()).is_ok());
        assert_eq!(b0.header.version, Version::from_consensus(4));
        assert_eq!(b0.txdata.len(), 1);
        assert!(b0.txdata[0].is_coinbase());
        assert_eq!(b0.txdata[0].output[0].value, Amount::from_btc(50.0).unwrap());

        let b1 = factory
            .next_block(
                &mut state,
                1u64,
                NextBlock::new()
                    .with_version(2)
                    .with_additional_coinbase_value(Amount::from_sat(5)),
            )
            .unwrap();
        assert_eq!(b1.header.prev_blockhash, b0.block_hash());
        assert_eq!(b1.header.time, b0.header.time + 1);
        assert_eq!(b1.header.version, Version::from_consensus(2));
        assert_eq!(
            b1.txdata[0].output[0].value,
            Amount::from_btc(50.0).unwrap() + Amount::from_sat(5)
        );
        assert_eq!(state.tip_hash(), b1.block_hash());
        assert_eq!(state.height_of(&b1.block_hash()), Some(2));
    }

    #[test]
    fn test_spend_routes_all_but_one_satoshi_to_coinbase() {
        let factory = test_factory();
        let mut state = regtest_state();
        let b0 = factory.next_block(&mut state, 0u64, NextBlock::new()).unwrap();
        state.push_spendable(&b0).unwrap();
        let out = state.pop_spendable().unwrap();

        let b1 = factory
            .next_block(&mut state, 1u64, NextBlock::new().spending(out.clone()))
            .unwrap();
        assert_eq!(b1.txdata.len(), 2);
        let spend_tx = &b1.txdata[1];
        assert_eq!(spend_tx.input[0].previous_output, out.outpoint());
        assert!(!spend_tx.input[0].script_sig.is_empty());
        assert_eq!(spend_tx.output[0].value, SPEND_OUTPUT_VALUE);
        assert_eq!(
            spend_tx.output[0].script_pubkey,
            Builder::new().push_opcode(OP_TRUE).into_script()
        );
        assert_eq!(
            b1.txdata[0].output[0].value,
            Amount::from_btc(100.0).unwrap() - SPEND_OUTPUT_VALUE
        );
    }

    #[test]
    fn test_spend_of_anyone_can_spend_output_is_left_unsigned() {
        let factory = test_factory();
        let mut state = regtest_state();
        let b0 = factory
            .next_block(
                &mut state,
                0u64,
                NextBlock::new()
                    .with_coinbase_recipient(Builder::new().push_opcode(OP_TRUE).into_script()),
            )
            .unwrap();
        state.push_spendable(&b0).unwrap();
        let out = state.pop_spendable().unwrap();
        let b1 = factory
            .next_block(&mut state, 1u64, NextBlock::new().spending(out))
            .unwrap();
        assert!(b1.txdata[1].input[0].script_sig.is_empty());
    }

    #[test]
    fn test_update_block_keeps_height_and_coinbase() {
        let factory = test_factory();
        let mut state = regtest_state();
        let b0 = factory.next_block(&mut state, 0u64, NextBlock::new()).unwrap();
        state.push_spendable(&b0).unwrap();
        let out = state.pop_spendable().unwrap();
        let b1 = factory.next_block(&mut state, 1u64, NextBlock::new()).unwrap();
        let old_hash = b1.block_hash();

        let extra = create_tx(&out, Amount::from_sat(10), ScriptBuf::new());
        let updated = factory
            .update_block(&mut state, 1u64, vec![extra.clone()])
            .unwrap();

        assert_ne!(updated.block_hash(), old_hash);
        assert_eq!(updated.txdata[0], b1.txdata[0]);
        assert_eq!(updated.txdata[1], extra);
        assert!(updated.check_merkle_root());
        assert!(updated.header.validate_pow(updated.header.target()).is_ok());
        assert_eq!(state.height_of(&old_hash), None);
        assert_eq!(state.height_of(&updated.block_hash()), Some(2));
        assert_eq!(state.tip_hash(), updated.block_hash());
    }

    #[test]
    fn test_sibling_blocks_are_distinct_and_reorg_onto_earlier_block() {
        let factory = test_factory();
        let mut state = regtest_state();
        factory.next_block(&mut state, "a", NextBlock::new()).unwrap();
        let b = factory.next_block(&mut state, "b", NextBlock::new()).unwrap();
        let c = factory.next_block(&mut state, "c", NextBlock::new()).unwrap();

        state.move_tip("b").unwrap();
        let d = factory.next_block(&mut state, "d", NextBlock::new()).unwrap();
        assert_eq!(d.header.prev_blockhash, b.block_hash());
        assert_eq!(d.header.time, c.header.time);
        assert_ne!(d.block_hash(), c.block_hash());
        assert_eq!(state.tip_hash(), d.block_hash());
        assert_eq!(
            state.height_of(&d.block_hash()),
            state.height_of(&c.block_hash())
        );
        assert_eq!(state.get(&Alias::from("c")), Some(&c));

        // A second sibling with identical options is distinct as well.
        state.move_tip("b").unwrap();
        let e = factory.next_block(&mut state, "e", NextBlock::new()).unwrap();
        assert_ne!(e.block_hash(), d.block_hash());
    }

    #[test]
    fn test_coinbase_value_overflow_is_an_error() {
        let factory = test_factory();
        let mut state = regtest_state();
        assert_matches!(
            factory.next_block(
                &mut state,
                "rich",
                NextBlock::new().with_additional_coinbase_value(Amount::from_sat(u64::MAX)),
            ),
            Err(BlockFactoryError::CoinbaseValueOverflow { height: 1 })
        );
        assert!(state.tip_is_anchor());

        let b0 = factory.next_block(&mut state, 0u64, NextBlock::new()).unwrap();
        let out = SpendableOutput::coinbase_of(&b0).unwrap();
        let extra = Amount::from_sat(u64::MAX) - Amount::from_btc(50.0).unwrap();
        assert_matches!(
            factory.next_block(
                &mut state,
                "rich_spend",
                NextBlock::new()
                    .spending(out)
                    .with_additional_coinbase_value(extra),
            ),
            Err(BlockFactoryError::CoinbaseValueOverflow { height: 2 })
        );
        assert_eq!(state.tip_hash(), b0.block_hash());
    }

    #[test]
    fn test_spend_of_missing_output_is_an_error() {
        let factory = test_factory();
        let mut state = regtest_state();
        let b0 = factory.next_block(&mut state, 0u64, NextBlock::new()).unwrap();
        let mut out = SpendableOutput::coinbase_of(&b0).unwrap();
        out.vout = 3;
        let outpoint = out.outpoint();
        assert_matches!(
            factory.next_block(&mut state, 1u64, NextBlock::new().spending(out)),
            Err(BlockFactoryError::UnknownOutput(missing)) if missing == outpoint
        );
    }

    #[test]
    fn test_update_unknown_alias_fails() {
        let factory = test_factory();
        let mut state = regtest_state();
        assert_matches!(
            factory.update_block(&mut state, "nope", vec![]),
            Err(BlockFactoryError::ChainState(ChainStateError::UnknownAlias(_)))
        );
    }

    #[test]
    fn test_nonce_search_is_capped() {
        let factory = BlockFactory::new(
            ChainParams {
                // A target no header can reach in a single attempt.
                bits: CompactTarget::from_consensus(0x1d00ffff),
                max_nonce_iterations: 1,
                ..ChainParams::regtest()
            },
            ScriptBuf::new(),
            Box::new(KeySigner::from_secret_bytes(&[1; 32]).unwrap()),
            no_op_logger(),
        );
        let mut state = regtest_state();
        assert_matches!(
            factory.next_block(&mut state, "hard", NextBlock::new()),
            Err(BlockFactoryError::ProofOfWorkFailed { iterations: 1, .. })
        );
        assert!(state.tip_is_anchor());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_serialized_blocks_keep_their_hash(blocks in 1usize..6, spends in 0usize..3) {
            let factory = test_factory();
            let mut state = regtest_state();
            let mut built = vec![];
            for i in 0..blocks {
                let next = if i > 0 && i <= spends && state.spendable_len() > 0 {
                    NextBlock::new().spending(state.pop_spendable().unwrap())
                } else {
                    NextBlock::new()
                };
                let block = factory.next_block(&mut state, i as u64, next).unwrap();
                state.push_spendable(&block).unwrap();
                built.push(block);
            }
            for block in built {
                let decoded: Block = deserialize(&serialize(&block)).unwrap();
                prop_assert_eq!(decoded.block_hash(), block.block_hash());
            }
        }
    }
}
