//! The module keeps track of the chain the harness is building: which block each alias
//! currently names, the height of every known block hash, the current tip and the queue
//! of coinbase outputs that later blocks may spend.
use crate::BlockHeight;
use bitcoin::{block::Header, Amount, Block, BlockHash, OutPoint, Transaction, TxOut};
use hashlink::LinkedHashMap;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
};
use thiserror::Error;

/// A caller-chosen label identifying one block across later mutations.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Alias {
    /// A free-form name, e.g. `for_invalid.InputMissing`.
    Name(String),
    /// A sequence number, e.g. block `2`.
    Seq(u64),
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Alias::Name(name) => write!(f, "{}", name),
            Alias::Seq(seq) => write!(f, "{}", seq),
        }
    }
}

impl From<&str> for Alias {
    fn from(name: &str) -> Self {
        Alias::Name(name.to_string())
    }
}

impl From<String> for Alias {
    fn from(name: String) -> Self {
        Alias::Name(name)
    }
}

impl From<u64> for Alias {
    fn from(seq: u64) -> Self {
        Alias::Seq(seq)
    }
}

impl From<&Alias> for Alias {
    fn from(alias: &Alias) -> Self {
        alias.clone()
    }
}

/// A coinbase output that a later block may consume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpendableOutput {
    /// The transaction holding the output.
    pub tx: Transaction,
    /// The index of the output within `tx`.
    pub vout: u32,
}

impl SpendableOutput {
    /// Returns the primary (first) output of the given block's coinbase.
    pub fn coinbase_of(block: &Block) -> Option<Self> {
        block.txdata.first().map(|tx| SpendableOutput {
            tx: tx.clone(),
            vout: 0,
        })
    }

    /// The outpoint a spending input has to reference.
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.tx.compute_txid(), self.vout)
    }

    /// The output being spent, or `None` if `vout` is out of range.
    pub fn txout(&self) -> Option<&TxOut> {
        self.tx.output.get(self.vout as usize)
    }

    /// The total value carried by the transaction's outputs.
    pub fn available(&self) -> Amount {
        self.tx.output.iter().map(|out| out.value).sum()
    }
}

/// Errors the tracker reports. All of them leave the tracker unchanged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChainStateError {
    /// The block declares a previous hash the tracker has never seen.
    #[error("Block {block} registered as {alias} extends unknown parent {parent}")]
    UnknownParent {
        alias: Alias,
        block: BlockHash,
        parent: BlockHash,
    },
    #[error("No block is registered under alias {0}")]
    UnknownAlias(Alias),
    #[error("Block {0} is not known to the tracker")]
    UnknownBlock(BlockHash),
    #[error("Alias {0} is already registered")]
    AliasInUse(Alias),
    #[error("Block {0} is already registered")]
    DuplicateBlock(BlockHash),
    /// Mutating a block with registered children would orphan them.
    #[error("Block registered as {0} already has registered children")]
    HasDescendants(Alias),
    #[error("No spendable outputs are left in the queue")]
    QueueEmpty,
    #[error("Output {0} has already been queued for spending")]
    AlreadyQueued(OutPoint),
}

/// The stateful ledger of the chain under construction.
///
/// Blocks are stored by alias; a second index maps the current hash of every aliased
/// block back to its alias. Both tables and the height map are updated together, so a
/// mutated block never leaves a stale hash behind.
pub struct ChainState {
    /// The block the tracker starts from (genesis or the target's tip at start-up).
    anchor: Header,
    blocks: LinkedHashMap<Alias, Block>,
    aliases: HashMap<BlockHash, Alias>,
    heights: HashMap<BlockHash, BlockHeight>,
    tip: BlockHash,
    spendable: VecDeque<SpendableOutput>,
    /// Every outpoint ever queued, so that no output is handed out twice.
    queued: HashSet<OutPoint>,
}

impl ChainState {
    /// Creates a tracker whose only known block is the genesis block at height 0.
    pub fn new(genesis: Header) -> Self {
        Self::with_anchor(genesis, 0)
    }

    /// Creates a tracker anchored at an arbitrary known block, e.g. the target's tip when
    /// the target's chain is not fresh.
    pub fn with_anchor(anchor: Header, height: BlockHeight) -> Self {
        let anchor_hash = anchor.block_hash();
        let mut heights = HashMap::new();
        heights.insert(anchor_hash, height);
        Self {
            anchor,
            blocks: LinkedHashMap::new(),
            aliases: HashMap::new(),
            heights,
            tip: anchor_hash,
            spendable: VecDeque::new(),
            queued: HashSet::new(),
        }
    }

    /// Inserts `block` under `alias` at its parent's height plus one and makes it the tip.
    pub fn register(
        &mut self,
        alias: impl Into<Alias>,
        block: Block,
    ) -> Result<BlockHeight, ChainStateError> {
        let alias = alias.into();
        let block_hash = block.block_hash();
        if self.blocks.contains_key(&alias) {
            return Err(ChainStateError::AliasInUse(alias));
        }
        if self.heights.contains_key(&block_hash) {
            return Err(ChainStateError::DuplicateBlock(block_hash));
        }
        let parent = block.header.prev_blockhash;
        let height = match self.heights.get(&parent) {
            Some(parent_height) => parent_height + 1,
            None => {
                return Err(ChainStateError::UnknownParent {
                    alias,
                    block: block_hash,
                    parent,
                })
            }
        };

        self.heights.insert(block_hash, height);
        self.aliases.insert(block_hash, alias.clone());
        self.blocks.insert(alias, block);
        self.tip = block_hash;
        Ok(height)
    }

    /// Replaces the block registered under `alias` with its mutated version. The height
    /// entry moves from the old hash to the new one and the old entry is removed. The tip
    /// follows the block if it pointed at the old hash.
    pub fn rebind(
        &mut self,
        alias: impl Into<Alias>,
        block: Block,
    ) -> Result<BlockHeight, ChainStateError> {
        let alias = alias.into();
        let old_hash = match self.blocks.get(&alias) {
            Some(old) => old.block_hash(),
            None => return Err(ChainStateError::UnknownAlias(alias)),
        };
        let new_hash = block.block_hash();
        if new_hash != old_hash && self.heights.contains_key(&new_hash) {
            return Err(ChainStateError::DuplicateBlock(new_hash));
        }
        if !self.heights.contains_key(&block.header.prev_blockhash) {
            return Err(ChainStateError::UnknownParent {
                alias,
                block: new_hash,
                parent: block.header.prev_blockhash,
            });
        }
        if new_hash != old_hash
            && self
                .blocks
                .values()
                .any(|other| other.header.prev_blockhash == old_hash)
        {
            return Err(ChainStateError::HasDescendants(alias));
        }

        let height = self
            .heights
            .remove(&old_hash)
            .ok_or(ChainStateError::UnknownBlock(old_hash))?;
        self.aliases.remove(&old_hash);
        self.heights.insert(new_hash, height);
        self.aliases.insert(new_hash, alias.clone());
        if let Some(slot) = self.blocks.get_mut(&alias) {
            *slot = block;
        }
        if self.tip == old_hash {
            self.tip = new_hash;
        }
        Ok(height)
    }

    /// Points the tip back at an already registered block, so that the next block is
    /// built on top of it.
    pub fn move_tip(&mut self, alias: impl Into<Alias>) -> Result<(), ChainStateError> {
        let alias = alias.into();
        match self.blocks.get(&alias) {
            Some(block) => {
                self.tip = block.block_hash();
                Ok(())
            }
            None => Err(ChainStateError::UnknownAlias(alias)),
        }
    }

    /// Appends the primary coinbase output of `block` to the spendable queue.
    pub fn push_spendable(&mut self, block: &Block) -> Result<(), ChainStateError> {
        let block_hash = block.block_hash();
        if !self.aliases.contains_key(&block_hash) {
            return Err(ChainStateError::UnknownBlock(block_hash));
        }
        let output =
            SpendableOutput::coinbase_of(block).ok_or(ChainStateError::UnknownBlock(block_hash))?;
        let outpoint = output.outpoint();
        if !self.queued.insert(outpoint) {
            return Err(ChainStateError::AlreadyQueued(outpoint));
        }
        self.spendable.push_back(output);
        Ok(())
    }

    /// Queues the coinbase output of the current tip.
    pub fn save_tip_spendable(&mut self) -> Result<(), ChainStateError> {
        let alias = self
            .tip_alias()
            .cloned()
            .ok_or(ChainStateError::UnknownBlock(self.tip))?;
        let block = self
            .blocks
            .get(&alias)
            .cloned()
            .ok_or(ChainStateError::UnknownAlias(alias))?;
        self.push_spendable(&block)
    }

    /// Removes and returns the oldest queued output.
    pub fn pop_spendable(&mut self) -> Result<SpendableOutput, ChainStateError> {
        self.spendable.pop_front().ok_or(ChainStateError::QueueEmpty)
    }

    /// The number of outputs that can still be popped.
    pub fn spendable_len(&self) -> usize {
        self.spendable.len()
    }

    /// Returns the block currently registered under `alias`.
    pub fn get(&self, alias: &Alias) -> Option<&Block> {
        self.blocks.get(alias)
    }

    /// Returns the height of a known block hash.
    pub fn height_of(&self, hash: &BlockHash) -> Option<BlockHeight> {
        self.heights.get(hash).copied()
    }

    /// Returns the alias a block hash is currently registered under.
    pub fn alias_of(&self, hash: &BlockHash) -> Option<&Alias> {
        self.aliases.get(hash)
    }

    /// The hash of the block the tracker was anchored at.
    pub fn anchor_hash(&self) -> BlockHash {
        self.anchor.block_hash()
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.tip
    }

    pub fn tip_alias(&self) -> Option<&Alias> {
        self.aliases.get(&self.tip)
    }

    /// The header of the current tip; the anchor's header while no block is registered
    /// on top of it.
    pub fn tip_header(&self) -> Header {
        self.tip_alias()
            .and_then(|alias| self.blocks.get(alias))
            .map(|block| block.header)
            .unwrap_or(self.anchor)
    }

    pub fn tip_height(&self) -> BlockHeight {
        // The tip is always a key of `heights`.
        self.heights.get(&self.tip).copied().unwrap_or_default()
    }

    /// Whether the tip is still the anchor.
    pub fn tip_is_anchor(&self) -> bool {
        self.tip == self.anchor_hash()
    }

    /// All aliases in registration order.
    pub fn aliases(&self) -> impl Iterator<Item = &Alias> {
        self.blocks.keys()
    }

    /// The number of block hashes with a recorded height, the anchor included.
    pub fn known_hashes(&self) -> usize {
        self.heights.len()
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use assert_matches::assert_matches;
    use bitcoin::{
        absolute::LockTime, blockdata::constants::genesis_block, hashes::Hash, transaction,
        CompactTarget, Network, ScriptBuf, Sequence, TxIn, TxMerkleNode, Witness,
    };

    /// Builds an unsolved block with a unique coinbase on top of `prev`.
    pub fn block_on(prev: &Header, tag: u8) -> Block {
        let coinbase = Transaction {
            version: transaction::Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(vec![0x01, tag, prev.time.to_le_bytes()[0]]),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_btc(50.0).unwrap(),
                script_pubkey: ScriptBuf::new(),
            }],
        };
        let mut block = Block {
            header: Header {
                version: bitcoin::block::Version::from_consensus(4),
                prev_blockhash: prev.block_hash(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: prev.time + 1,
                bits: CompactTarget::from_consensus(0x207fffff),
                nonce: 0,
            },
            txdata: vec![coinbase],
        };
        block.header.merkle_root = block.compute_merkle_root().unwrap();
        block
    }

    fn genesis() -> Header {
        genesis_block(Network::Regtest).header
    }

    #[test]
    fn test_register_assigns_parent_height_plus_one() {
        let mut state = ChainState::new(genesis());
        let mut prev = genesis();
        for i in 0..5u64 {
            let block = block_on(&prev, i as u8);
            let height = state.register(i, block.clone()).unwrap();
            assert_eq!(height, i as u32 + 1);
            assert_eq!(
                state.height_of(&block.block_hash()),
                state.height_of(&prev.block_hash()).map(|h| h + 1)
            );
            assert_eq!(state.tip_hash(), block.block_hash());
            prev = block.header;
        }
        assert_eq!(state.tip_height(), 5);
        assert_eq!(
            state.aliases().cloned().collect::<Vec<_>>(),
            (0..5u64).map(Alias::from).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_txout_out_of_range_is_none() {
        let block = block_on(&genesis(), 0);
        let mut output = SpendableOutput::coinbase_of(&block).unwrap();
        assert_eq!(output.txout(), Some(&block.txdata[0].output[0]));
        output.vout = 1;
        assert_eq!(output.txout(), None);
    }

    #[test]
    fn test_register_rejects_unknown_parent() {
        let mut state = ChainState::new(genesis());
        let detached = block_on(&block_on(&genesis(), 1).header, 2);
        assert_matches!(
            state.register("detached", detached),
            Err(ChainStateError::UnknownParent { .. })
        );
        assert!(state.tip_is_anchor());
        assert_eq!(state.known_hashes(), 1);
    }

    #[test]
    fn test_register_rejects_reused_alias_and_duplicate_block() {
        let mut state = ChainState::new(genesis());
        let block = block_on(&genesis(), 1);
        state.register("a", block.clone()).unwrap();
        assert_matches!(
            state.register("a", block_on(&genesis(), 2)),
            Err(ChainStateError::AliasInUse(_))
        );
        assert_matches!(
            state.register("b", block),
            Err(ChainStateError::DuplicateBlock(_))
        );
    }

    #[test]
    fn test_rebind_migrates_height_to_new_hash() {
        let mut state = ChainState::new(genesis());
        let b1 = block_on(&genesis(), 1);
        state.register(1u64, b1.clone()).unwrap();
        let b2 = block_on(&b1.header, 2);
        state.register(2u64, b2.clone()).unwrap();

        let mut mutated = b2.clone();
        mutated.header.nonce += 1;
        let height = state.rebind(2u64, mutated.clone()).unwrap();

        assert_eq!(height, 2);
        assert_eq!(state.height_of(&b2.block_hash()), None);
        assert_eq!(state.height_of(&mutated.block_hash()), Some(2));
        assert_eq!(state.alias_of(&mutated.block_hash()), Some(&Alias::Seq(2)));
        assert_eq!(state.alias_of(&b2.block_hash()), None);
        assert_eq!(state.tip_hash(), mutated.block_hash());
        assert_eq!(state.known_hashes(), 3);
    }

    #[test]
    fn test_rebind_of_non_tip_keeps_tip() {
        let mut state = ChainState::new(genesis());
        let b1 = block_on(&genesis(), 1);
        state.register(1u64, b1.clone()).unwrap();
        let side = block_on(&genesis(), 9);
        state.register("side", side.clone()).unwrap();
        state.move_tip(1u64).unwrap();

        let mut mutated = side;
        mutated.header.nonce += 7;
        state.rebind("side", mutated).unwrap();
        assert_eq!(state.tip_hash(), b1.block_hash());
    }

    #[test]
    fn test_rebind_requires_known_alias_and_no_children() {
        let mut state = ChainState::new(genesis());
        assert_matches!(
            state.rebind("missing", block_on(&genesis(), 1)),
            Err(ChainStateError::UnknownAlias(_))
        );

        let b1 = block_on(&genesis(), 1);
        state.register(1u64, b1.clone()).unwrap();
        state.register(2u64, block_on(&b1.header, 2)).unwrap();
        let mut mutated = b1.clone();
        mutated.header.nonce += 1;
        assert_matches!(
            state.rebind(1u64, mutated),
            Err(ChainStateError::HasDescendants(_))
        );
        assert_eq!(state.height_of(&b1.block_hash()), Some(1));
    }

    #[test]
    fn test_move_tip_simulates_reorg() {
        let mut state = ChainState::new(genesis());
        let a = block_on(&genesis(), 1);
        state.register("A", a.clone()).unwrap();
        let b = block_on(&a.header, 2);
        state.register("B", b.clone()).unwrap();
        let c = block_on(&b.header, 3);
        state.register("C", c.clone()).unwrap();

        state.move_tip("B").unwrap();
        let d = block_on(&state.tip_header(), 4);
        state.register("D", d.clone()).unwrap();

        assert_eq!(state.tip_hash(), d.block_hash());
        assert_eq!(
            state.height_of(&d.block_hash()),
            state.height_of(&c.block_hash())
        );
        assert_eq!(state.get(&"C".into()), Some(&c));
        assert_matches!(
            state.move_tip("E"),
            Err(ChainStateError::UnknownAlias(_))
        );
    }

    #[test]
    fn test_spendable_queue_is_fifo_and_bounded() {
        let mut state = ChainState::new(genesis());
        let mut prev = genesis();
        let mut expected = vec![];
        for i in 0..10u64 {
            let block = block_on(&prev, i as u8);
            state.register(i, block.clone()).unwrap();
            state.save_tip_spendable().unwrap();
            expected.push(block.txdata[0].compute_txid());
            prev = block.header;
        }
        assert_eq!(state.spendable_len(), 10);

        let mut seen = HashSet::new();
        for txid in expected {
            let out = state.pop_spendable().unwrap();
            assert_eq!(out.outpoint().txid, txid);
            assert!(seen.insert(out.outpoint()));
        }
        assert_eq!(state.pop_spendable(), Err(ChainStateError::QueueEmpty));
    }

    #[test]
    fn test_output_cannot_be_queued_twice() {
        let mut state = ChainState::new(genesis());
        let block = block_on(&genesis(), 1);
        state.register(1u64, block.clone()).unwrap();
        state.push_spendable(&block).unwrap();
        state.pop_spendable().unwrap();
        assert_matches!(
            state.push_spendable(&block),
            Err(ChainStateError::AlreadyQueued(_))
        );
        assert_matches!(
            state.push_spendable(&block_on(&genesis(), 2)),
            Err(ChainStateError::UnknownBlock(_))
        );
    }

    #[test]
    fn test_anchor_height_is_respected() {
        let anchor = genesis();
        let mut state = ChainState::with_anchor(anchor, 200);
        assert_eq!(state.tip_height(), 200);
        assert_matches!(
            state.save_tip_spendable(),
            Err(ChainStateError::UnknownBlock(_))
        );
        let height = state.register("next", block_on(&anchor, 1)).unwrap();
        assert_eq!(height, 201);
    }
}
