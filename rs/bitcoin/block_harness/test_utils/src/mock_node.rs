use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    io,
    net::SocketAddr,
    sync::Arc,
};

use bitcoin::{
    absolute::LockTime,
    block::Header,
    blockdata::constants::genesis_block,
    consensus::{
        deserialize,
        encode::{self, Decodable, VarInt},
        serialize,
    },
    hashes::{sha256d, Hash},
    io::Cursor,
    p2p::{
        message::{NetworkMessage, RawNetworkMessage},
        message_network::{Reject, RejectReason},
        Magic, ServiceFlags,
    },
    script::Builder,
    transaction, Amount, Block, BlockHash, Network, OutPoint, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

const MINIMUM_PROTOCOL_VERSION: u32 = 70001;
const COINBASE_MATURITY: u32 = 100;
const MIN_STANDARD_TX_NONWITNESS_SIZE: usize = 65;
/// Height from which coinbases must commit to their height.
const BIP34_HEIGHT: u32 = 2;
const MESSAGE_HEADER_SIZE: usize = 24;

#[derive(Clone)]
struct Coin {
    output: TxOut,
    height: u32,
    is_coinbase: bool,
}

type CoinView = HashMap<OutPoint, Coin>;

/// Why a block or transaction was refused, and whether the peer is punished for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Rejection {
    reason: &'static str,
    disconnect: bool,
}

impl Rejection {
    fn new(reason: &'static str, disconnect: bool) -> Self {
        Self { reason, disconnect }
    }
}

struct MockChain {
    network: Network,
    headers: HashMap<BlockHash, (Header, u32)>,
    blocks: HashMap<BlockHash, Block>,
    /// The unspent outputs after each accepted block.
    views: HashMap<BlockHash, Arc<CoinView>>,
    invalid: HashMap<BlockHash, &'static str>,
    tip: BlockHash,
    mempool: HashMap<Txid, Transaction>,
    send_rejects: bool,
    drop_on_block: bool,
    connections: usize,
}

impl MockChain {
    fn new(network: Network) -> Self {
        let genesis = genesis_block(network);
        let hash = genesis.block_hash();
        Self {
            network,
            headers: HashMap::from([(hash, (genesis.header, 0))]),
            blocks: HashMap::from([(hash, genesis)]),
            // The genesis coinbase is not spendable.
            views: HashMap::from([(hash, Arc::new(CoinView::new()))]),
            invalid: HashMap::new(),
            tip: hash,
            mempool: HashMap::new(),
            send_rejects: true,
            drop_on_block: false,
            connections: 0,
        }
    }

    fn tip_height(&self) -> u32 {
        self.headers.get(&self.tip).map(|(_, h)| *h).unwrap_or(0)
    }

    fn subsidy(&self, height: u32) -> Amount {
        let interval = match self.network {
            Network::Regtest => 150,
            _ => 210_000,
        };
        let halvings = height / interval;
        if halvings >= 64 {
            return Amount::ZERO;
        }
        Amount::from_sat((50 * 100_000_000) >> halvings)
    }

    fn process_block(&mut self, block: Block) -> Result<(), Rejection> {
        let hash = block.block_hash();
        if self.headers.contains_key(&hash) {
            return Ok(());
        }
        if let Some(reason) = self.invalid.get(&hash) {
            return Err(Rejection::new(*reason, true));
        }
        let height = match self.headers.get(&block.header.prev_blockhash) {
            Some((_, parent_height)) => parent_height + 1,
            None => return Err(Rejection::new("prev-blk-not-found", false)),
        };

        let view = match check_block(&block).and_then(|()| self.connect_block(&block, height)) {
            Ok(view) => view,
            Err(reason) => {
                self.invalid.insert(hash, reason);
                return Err(Rejection::new(reason, true));
            }
        };

        for tx in block.txdata.iter() {
            self.mempool.remove(&tx.compute_txid());
        }
        self.headers.insert(hash, (block.header, height));
        self.views.insert(hash, Arc::new(view));
        self.blocks.insert(hash, block);
        // First seen wins between blocks at the same height.
        if height > self.tip_height() {
            self.tip = hash;
        }
        Ok(())
    }

    /// Applies the block to its parent's unspent outputs.
    fn connect_block(&self, block: &Block, height: u32) -> Result<CoinView, &'static str> {
        let coinbase = &block.txdata[0];
        if height >= BIP34_HEIGHT {
            let expected = Builder::new().push_int(height as i64).into_script();
            if !coinbase.input[0]
                .script_sig
                .as_bytes()
                .starts_with(expected.as_bytes())
            {
                return Err("bad-cb-height");
            }
        }

        let mut view = self
            .views
            .get(&block.header.prev_blockhash)
            .map(|view| (**view).clone())
            .unwrap_or_default();
        let mut fees = Amount::ZERO;
        for tx in block.txdata.iter().skip(1) {
            fees += spend_inputs(&mut view, tx, height)?;
            add_outputs(&mut view, tx, height, false);
        }
        let reward: Amount = coinbase.output.iter().map(|out| out.value).sum();
        if reward > self.subsidy(height) + fees {
            return Err("bad-cb-amount");
        }
        add_outputs(&mut view, coinbase, height, true);
        Ok(view)
    }

    fn process_transaction(&mut self, tx: Transaction) -> Result<(), Rejection> {
        check_transaction(&tx).map_err(|reason| Rejection::new(reason, true))?;
        if tx.is_coinbase() {
            return Err(Rejection::new("coinbase", true));
        }
        if tx.base_size() < MIN_STANDARD_TX_NONWITNESS_SIZE {
            return Err(Rejection::new("tx-size-small", false));
        }
        let txid = tx.compute_txid();
        if self.mempool.contains_key(&txid) {
            return Ok(());
        }
        let mut view = self
            .views
            .get(&self.tip)
            .map(|view| (**view).clone())
            .unwrap_or_default();
        // Orphans are dropped silently.
        if tx
            .input
            .iter()
            .any(|input| !view.contains_key(&input.previous_output))
        {
            return Ok(());
        }
        spend_inputs(&mut view, &tx, self.tip_height() + 1).map_err(|reason| {
            Rejection::new(reason, reason != "bad-txns-premature-spend-of-coinbase")
        })?;
        self.mempool.insert(txid, tx);
        Ok(())
    }
}

/// Context free block checks, in the order a full node runs them.
fn check_block(block: &Block) -> Result<(), &'static str> {
    if block.header.validate_pow(block.header.target()).is_err() {
        return Err("high-hash");
    }
    if !block.check_merkle_root() {
        return Err("bad-txnmrklroot");
    }
    match block.txdata.first() {
        Some(tx) if tx.is_coinbase() => {}
        _ => return Err("bad-cb-missing"),
    }
    if block.txdata.iter().skip(1).any(Transaction::is_coinbase) {
        return Err("bad-cb-multiple");
    }
    for tx in block.txdata.iter() {
        check_transaction(tx)?;
    }
    Ok(())
}

/// Context free transaction checks, in the order a full node runs them.
fn check_transaction(tx: &Transaction) -> Result<(), &'static str> {
    if tx.input.is_empty() {
        return Err("bad-txns-vin-empty");
    }
    if tx.output.is_empty() {
        return Err("bad-txns-vout-empty");
    }
    let max_money = Amount::MAX_MONEY.to_sat();
    let mut total: u64 = 0;
    for output in tx.output.iter() {
        let value = output.value.to_sat();
        // Values are signed on the wire.
        if (value as i64) < 0 {
            return Err("bad-txns-vout-negative");
        }
        if value > max_money {
            return Err("bad-txns-vout-toolarge");
        }
        total += value;
        if total > max_money {
            return Err("bad-txns-txouttotal-toolarge");
        }
    }
    let mut seen = HashSet::new();
    if !tx.input.iter().all(|input| seen.insert(input.previous_output)) {
        return Err("bad-txns-inputs-duplicate");
    }
    if tx.is_coinbase() {
        if !(2..=100).contains(&tx.input[0].script_sig.len()) {
            return Err("bad-cb-length");
        }
    } else if tx.input.iter().any(|input| input.previous_output.is_null()) {
        return Err("bad-txns-prevout-null");
    }
    Ok(())
}

/// Removes the coins `tx` spends from `view` and returns the fee it pays.
fn spend_inputs(
    view: &mut CoinView,
    tx: &Transaction,
    height: u32,
) -> Result<Amount, &'static str> {
    let mut value_in = Amount::ZERO;
    for input in tx.input.iter() {
        let coin = view
            .remove(&input.previous_output)
            .ok_or("bad-txns-inputs-missingorspent")?;
        if coin.is_coinbase && height - coin.height < COINBASE_MATURITY {
            return Err("bad-txns-premature-spend-of-coinbase");
        }
        value_in += coin.output.value;
    }
    let value_out: Amount = tx.output.iter().map(|out| out.value).sum();
    value_in
        .checked_sub(value_out)
        .ok_or("bad-txns-in-belowout")
}

fn add_outputs(view: &mut CoinView, tx: &Transaction, height: u32, is_coinbase: bool) {
    let txid = tx.compute_txid();
    for (vout, output) in tx.output.iter().enumerate() {
        view.insert(
            OutPoint::new(txid, vout as u32),
            Coin {
                output: output.clone(),
                height,
                is_coinbase,
            },
        );
    }
}

/// Decodes a transaction the way a full node does: an empty input list followed by a
/// zero flag byte is a transaction without inputs and outputs, not a witness marker.
fn decode_transaction(reader: &mut Cursor<&[u8]>) -> Result<Transaction, encode::Error> {
    let version = transaction::Version::consensus_decode(reader)?;
    let mut input = Vec::<TxIn>::consensus_decode(reader)?;
    let mut output = vec![];
    if input.is_empty() {
        let flags = u8::consensus_decode(reader)?;
        if flags != 0 {
            input = Vec::<TxIn>::consensus_decode(reader)?;
            output = Vec::<TxOut>::consensus_decode(reader)?;
            if flags & 1 == 1 {
                for txin in input.iter_mut() {
                    txin.witness = Witness::consensus_decode(reader)?;
                }
            }
        }
    } else {
        output = Vec::<TxOut>::consensus_decode(reader)?;
    }
    let lock_time = LockTime::consensus_decode(reader)?;
    Ok(Transaction {
        version,
        lock_time,
        input,
        output,
    })
}

fn decode_block(payload: &[u8]) -> Result<Block, encode::Error> {
    let mut reader = Cursor::new(payload);
    let header = Header::consensus_decode(&mut reader)?;
    let count = VarInt::consensus_decode(&mut reader)?.0;
    let mut txdata = vec![];
    for _ in 0..count {
        txdata.push(decode_transaction(&mut reader)?);
    }
    Ok(Block { header, txdata })
}

struct Frame {
    magic: Magic,
    command: String,
    payload: Vec<u8>,
    raw: Vec<u8>,
}

/// Splits the next complete message off `data`. Returns `None` while it is incomplete.
fn next_frame(data: &[u8]) -> Result<Option<(Frame, usize)>, String> {
    if data.len() < MESSAGE_HEADER_SIZE {
        return Ok(None);
    }
    let length = u32::from_le_bytes([data[16], data[17], data[18], data[19]]) as usize;
    let total = MESSAGE_HEADER_SIZE + length;
    if data.len() < total {
        return Ok(None);
    }
    let payload = data[MESSAGE_HEADER_SIZE..total].to_vec();
    let checksum = sha256d::Hash::hash(&payload).to_byte_array();
    if checksum[..4] != data[20..24] {
        return Err("invalid checksum".to_string());
    }
    let frame = Frame {
        magic: Magic::from_bytes([data[0], data[1], data[2], data[3]]),
        command: String::from_utf8_lossy(&data[4..16])
            .trim_end_matches('\0')
            .to_string(),
        payload,
        raw: data[..total].to_vec(),
    };
    Ok(Some((frame, total)))
}

async fn write_network_message(
    socket: &mut TcpStream,
    magic: Magic,
    payload: NetworkMessage,
) -> io::Result<()> {
    let serialized = serialize(&RawNetworkMessage::new(magic, payload));
    socket.write_all(&serialized).await?;
    socket.flush().await?;
    Ok(())
}

enum Flow {
    Continue,
    Close,
}

async fn respond(
    socket: &mut TcpStream,
    magic: Magic,
    command: &'static str,
    hash: sha256d::Hash,
    result: Result<(), Rejection>,
    send_rejects: bool,
) -> io::Result<Flow> {
    let rejection = match result {
        Ok(()) => return Ok(Flow::Continue),
        Err(rejection) => rejection,
    };
    if send_rejects {
        let reject = Reject {
            message: Cow::Borrowed(command),
            ccode: if rejection.disconnect {
                RejectReason::Invalid
            } else {
                RejectReason::NonStandard
            },
            reason: Cow::Borrowed(rejection.reason),
            hash,
        };
        write_network_message(socket, magic, NetworkMessage::Reject(reject)).await?;
    }
    Ok(match rejection.disconnect {
        true => Flow::Close,
        false => Flow::Continue,
    })
}

async fn handle_frame(
    socket: &mut TcpStream,
    frame: Frame,
    chain: &Mutex<MockChain>,
    magic: Magic,
) -> io::Result<Flow> {
    match frame.command.as_str() {
        "block" => {
            if chain.lock().drop_on_block {
                return Ok(Flow::Close);
            }
            let block = match decode_block(&frame.payload) {
                Ok(block) => block,
                Err(_) => return Ok(Flow::Close),
            };
            let hash = sha256d::Hash::from_byte_array(block.block_hash().to_byte_array());
            let (result, send_rejects) = {
                let mut chain = chain.lock();
                (chain.process_block(block), chain.send_rejects)
            };
            respond(socket, magic, "block", hash, result, send_rejects).await
        }
        "tx" => {
            let tx = match decode_transaction(&mut Cursor::new(frame.payload.as_slice())) {
                Ok(tx) => tx,
                Err(_) => return Ok(Flow::Close),
            };
            let hash = sha256d::Hash::from_byte_array(tx.compute_txid().to_byte_array());
            let (result, send_rejects) = {
                let mut chain = chain.lock();
                (chain.process_transaction(tx), chain.send_rejects)
            };
            respond(socket, magic, "tx", hash, result, send_rejects).await
        }
        _ => {
            let raw: RawNetworkMessage = match deserialize(&frame.raw) {
                Ok(raw) => raw,
                Err(_) => return Ok(Flow::Close),
            };
            match raw.into_payload() {
                NetworkMessage::Version(version) => {
                    if version.version < MINIMUM_PROTOCOL_VERSION {
                        return Ok(Flow::Close);
                    }
                    let mut reply = version;
                    reply.services.add(ServiceFlags::NETWORK);
                    write_network_message(socket, magic, NetworkMessage::Version(reply)).await?;
                    write_network_message(socket, magic, NetworkMessage::Verack).await?;
                }
                NetworkMessage::Ping(nonce) => {
                    write_network_message(socket, magic, NetworkMessage::Pong(nonce)).await?;
                }
                NetworkMessage::GetAddr => {
                    write_network_message(socket, magic, NetworkMessage::Addr(vec![])).await?;
                }
                NetworkMessage::GetHeaders(_) => {
                    write_network_message(socket, magic, NetworkMessage::Headers(vec![])).await?;
                }
                _ => {}
            }
            Ok(Flow::Continue)
        }
    }
}

async fn handle_connection(mut socket: TcpStream, chain: Arc<Mutex<MockChain>>, magic: Magic) {
    let mut unparsed = vec![];
    let mut buf = vec![0; 64 * 1024];
    loop {
        let bytes_read = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(bytes_read) => bytes_read,
        };
        unparsed.extend_from_slice(&buf[..bytes_read]);

        loop {
            let (frame, consumed) = match next_frame(&unparsed) {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => return,
            };
            unparsed.drain(..consumed);
            if frame.magic != magic {
                return;
            }
            match handle_frame(&mut socket, frame, &chain, magic).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) | Err(_) => {
                    let _ = socket.shutdown().await;
                    return;
                }
            }
        }
    }
}

async fn serve(listener: TcpListener, chain: Arc<Mutex<MockChain>>, magic: Magic) {
    while let Ok((socket, _)) = listener.accept().await {
        chain.lock().connections += 1;
        tokio::spawn(handle_connection(socket, chain.clone(), magic));
    }
}

/// A node listening on a local port. It validates what it receives with a reduced rule
/// set, answers with reject messages and disconnects misbehaving peers. Scripts are not
/// executed.
pub struct MockNode {
    address: SocketAddr,
    chain: Arc<Mutex<MockChain>>,
    server: JoinHandle<()>,
}

impl MockNode {
    /// Starts a node on `127.0.0.1` with an ephemeral port. Its chain holds only the
    /// genesis block of `network`.
    pub async fn spawn(network: Network) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let chain = Arc::new(Mutex::new(MockChain::new(network)));
        let server = tokio::spawn(serve(listener, chain.clone(), network.magic()));
        Self {
            address,
            chain,
            server,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn best_block_hash(&self) -> BlockHash {
        self.chain.lock().tip
    }

    pub fn tip_height(&self) -> u32 {
        self.chain.lock().tip_height()
    }

    pub fn height(&self, hash: &BlockHash) -> Option<u32> {
        self.chain.lock().headers.get(hash).map(|(_, height)| *height)
    }

    pub fn header(&self, hash: &BlockHash) -> Option<Header> {
        self.chain.lock().headers.get(hash).map(|(header, _)| *header)
    }

    pub fn block(&self, hash: &BlockHash) -> Option<Block> {
        self.chain.lock().blocks.get(hash).cloned()
    }

    pub fn mempool_contains(&self, txid: &Txid) -> bool {
        self.chain.lock().mempool.contains_key(txid)
    }

    /// The reason a block was rejected with, if it was.
    pub fn rejection_of(&self, hash: &BlockHash) -> Option<&'static str> {
        self.chain.lock().invalid.get(hash).copied()
    }

    /// The number of connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.chain.lock().connections
    }

    /// Newer nodes no longer send reject messages. Turning them off imitates those.
    pub fn set_send_rejects(&self, send_rejects: bool) {
        self.chain.lock().send_rejects = send_rejects;
    }

    /// Closes every connection that delivers a block, before the block is processed.
    pub fn set_drop_on_block(&self, drop_on_block: bool) {
        self.chain.lock().drop_on_block = drop_on_block;
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.server.abort();
    }
}
