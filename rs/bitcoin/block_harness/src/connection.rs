//! A single P2P connection to the node under test. The connection performs the version
//! handshake, answers the peer's keep-alive and data requests, and records what the peer
//! tells the harness so that submissions can be verified against it.
use bitcoin::{
    consensus::{deserialize_partial, encode, encode::VarInt, serialize},
    hashes::{sha256d, Hash},
    io::ErrorKind as EncodeErrorKind,
    p2p::{
        message::{NetworkMessage, RawNetworkMessage},
        message_blockdata::Inventory,
        message_network::{RejectReason, VersionMessage},
        Address, Magic, ServiceFlags,
    },
    Block, BlockHash, Transaction, Txid,
};
use parking_lot::Mutex;
use slog::{debug, info, trace, warn, Logger};
use std::{
    collections::{HashMap, HashSet},
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        lookup_host,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex as AsyncMutex,
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};

const USER_AGENT: &str = "/block-harness:0.1.0/";

/// How often waiting operations re-check the peer state.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

const READ_BUFFER_SIZE: usize = 64 * 1024;

const COMMAND_SIZE: usize = 12;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error on connection to {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to resolve {0}")]
    Resolution(String),
    #[error("Handshake with {0} did not complete in time")]
    HandshakeTimeout(String),
    #[error("Peer {0} closed the connection")]
    Disconnected(String),
    #[error("Peer {0} did not answer a ping in time")]
    PingTimeout(String),
    #[error("Failed to decode a message from {address}: {reason}")]
    Decode { address: String, reason: String },
}

/// A reject message received from the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RejectNotice {
    /// The command of the rejected message, e.g. `block` or `tx`.
    pub message: String,
    pub code: RejectReason,
    /// The reason in the peer's own vocabulary, e.g. `bad-txns-vin-empty`.
    pub reason: String,
    /// Hash of the rejected object.
    pub hash: sha256d::Hash,
}

/// Everything the reader task learns from the peer.
#[derive(Default)]
struct PeerState {
    connected: bool,
    version_received: bool,
    verack_received: bool,
    rejects: Vec<RejectNotice>,
    pongs: HashSet<u64>,
    decode_error: Option<String>,
    /// Objects the harness announced, served when the peer asks for them.
    blocks: HashMap<BlockHash, Block>,
    transactions: HashMap<Txid, Transaction>,
}

/// An established connection. Dropping it stops the reader task.
pub struct PeerConnection {
    address: String,
    magic: Magic,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    state: Arc<Mutex<PeerState>>,
    reader: JoinHandle<()>,
    logger: Logger,
}

impl PeerConnection {
    /// Opens a TCP connection to `address` and completes the version handshake.
    pub async fn connect(
        address: &str,
        magic: Magic,
        handshake_timeout: Duration,
        logger: Logger,
    ) -> Result<Self, ConnectionError> {
        let remote = lookup_host(address)
            .await
            .map_err(|_| ConnectionError::Resolution(address.to_string()))?
            .next()
            .ok_or_else(|| ConnectionError::Resolution(address.to_string()))?;
        let stream = timeout(handshake_timeout, TcpStream::connect(remote))
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout(address.to_string()))?
            .map_err(|source| ConnectionError::Io {
                address: address.to_string(),
                source,
            })?;
        let (reader, writer) = stream.into_split();
        let writer = Arc::new(AsyncMutex::new(writer));
        let state = Arc::new(Mutex::new(PeerState {
            connected: true,
            ..PeerState::default()
        }));
        let reader = tokio::spawn(read_loop(
            reader,
            writer.clone(),
            state.clone(),
            magic,
            address.to_string(),
            logger.clone(),
        ));
        let connection = Self {
            address: address.to_string(),
            magic,
            writer,
            state,
            reader,
            logger,
        };

        connection
            .send_message(NetworkMessage::Version(version_message(remote)))
            .await?;
        connection
            .wait_until(handshake_timeout, |state| {
                (state.version_received && state.verack_received) || !state.connected
            })
            .await;
        if !connection.is_connected() {
            return Err(connection.disconnect_error());
        }
        let handshake_done = {
            let state = connection.state.lock();
            state.version_received && state.verack_received
        };
        if !handshake_done {
            return Err(ConnectionError::HandshakeTimeout(address.to_string()));
        }
        debug!(connection.logger, "Connected to {}", address);
        Ok(connection)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub async fn send_message(&self, payload: NetworkMessage) -> Result<(), ConnectionError> {
        self.send_frame(message_frame(self.magic, payload)).await
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(self.disconnect_error());
        }
        let mut writer = self.writer.lock().await;
        write_frame(&mut writer, &frame)
            .await
            .map_err(|source| ConnectionError::Io {
                address: self.address.clone(),
                source,
            })
    }

    /// Sends the block unsolicited and keeps it around for a later `getdata`.
    pub async fn send_block(&self, block: &Block) -> Result<(), ConnectionError> {
        self.state
            .lock()
            .blocks
            .insert(block.block_hash(), block.clone());
        self.send_frame(block_frame(self.magic, block)).await
    }

    /// Relays the transaction and keeps it around for a later `getdata`.
    pub async fn send_transaction(&self, tx: &Transaction) -> Result<(), ConnectionError> {
        self.state
            .lock()
            .transactions
            .insert(tx.compute_txid(), tx.clone());
        self.send_frame(tx_frame(self.magic, tx)).await
    }

    /// The number of reject messages received so far.
    pub fn reject_count(&self) -> usize {
        self.state.lock().rejects.len()
    }

    /// The reject messages received after the first `count` ones.
    pub fn rejects_since(&self, count: usize) -> Vec<RejectNotice> {
        self.state
            .lock()
            .rejects
            .iter()
            .skip(count)
            .cloned()
            .collect()
    }

    /// Sends a ping and waits for the matching pong. Since the peer processes messages
    /// in order, everything sent before has been handled once this returns.
    pub async fn sync_with_ping(&self, wait: Duration) -> Result<(), ConnectionError> {
        let nonce: u64 = rand::random();
        self.send_message(NetworkMessage::Ping(nonce)).await?;
        let answered = self
            .wait_until(wait, |state| state.pongs.contains(&nonce) || !state.connected)
            .await;
        match (answered, self.is_connected()) {
            (true, true) => {
                self.state.lock().pongs.remove(&nonce);
                Ok(())
            }
            (_, false) => Err(self.disconnect_error()),
            (false, true) => Err(ConnectionError::PingTimeout(self.address.clone())),
        }
    }

    /// Waits until the peer closes the connection. Returns `false` if it is still open
    /// when `wait` elapses.
    pub async fn wait_for_disconnect(&self, wait: Duration) -> bool {
        self.wait_until(wait, |state| !state.connected).await
    }

    async fn wait_until(&self, wait: Duration, predicate: impl Fn(&PeerState) -> bool) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if predicate(&self.state.lock()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Closes the connection from our side.
    pub async fn disconnect(self) {
        let _ = self.writer.lock().await.shutdown().await;
        self.state.lock().connected = false;
        self.reader.abort();
        debug!(self.logger, "Disconnected from {}", self.address);
    }

    fn disconnect_error(&self) -> ConnectionError {
        match self.state.lock().decode_error.clone() {
            Some(reason) => ConnectionError::Decode {
                address: self.address.clone(),
                reason,
            },
            None => ConnectionError::Disconnected(self.address.clone()),
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

fn message_frame(magic: Magic, payload: NetworkMessage) -> Vec<u8> {
    serialize(&RawNetworkMessage::new(magic, payload))
}

/// Writes `tx` without the segwit marker unless it carries witness data. An input-less
/// transaction would otherwise be written with the marker and fail to decode on the
/// receiving node before its rules are checked.
fn legacy_encode(tx: &Transaction) -> Vec<u8> {
    if tx.input.iter().any(|input| !input.witness.is_empty()) {
        return serialize(tx);
    }
    let mut encoded = serialize(&tx.version);
    encoded.extend(serialize(&tx.input));
    encoded.extend(serialize(&tx.output));
    encoded.extend(serialize(&tx.lock_time));
    encoded
}

/// Frames an already encoded payload: magic, zero padded command, length, checksum.
fn raw_frame(magic: Magic, command: &str, payload: &[u8]) -> Vec<u8> {
    let mut name = [0u8; COMMAND_SIZE];
    for (slot, byte) in name.iter_mut().zip(command.bytes()) {
        *slot = byte;
    }
    let checksum = sha256d::Hash::hash(payload).to_byte_array();
    let mut frame = Vec::with_capacity(24 + payload.len());
    frame.extend_from_slice(&magic.to_bytes());
    frame.extend_from_slice(&name);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum[..4]);
    frame.extend_from_slice(payload);
    frame
}

fn block_frame(magic: Magic, block: &Block) -> Vec<u8> {
    let mut payload = serialize(&block.header);
    payload.extend(serialize(&VarInt(block.txdata.len() as u64)));
    for tx in block.txdata.iter() {
        payload.extend(legacy_encode(tx));
    }
    raw_frame(magic, "block", &payload)
}

fn tx_frame(magic: Magic, tx: &Transaction) -> Vec<u8> {
    raw_frame(magic, "tx", &legacy_encode(tx))
}

fn version_message(remote: SocketAddr) -> VersionMessage {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    let local = SocketAddr::from(([0, 0, 0, 0], 0));
    VersionMessage::new(
        ServiceFlags::NONE,
        timestamp,
        Address::new(&remote, ServiceFlags::NETWORK),
        Address::new(&local, ServiceFlags::NONE),
        rand::random(),
        USER_AGENT.to_string(),
        0,
    )
}

/// Reads messages until the peer closes the connection or sends something undecodable.
async fn read_loop(
    mut reader: OwnedReadHalf,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    state: Arc<Mutex<PeerState>>,
    magic: Magic,
    address: String,
    logger: Logger,
) {
    let mut unparsed = vec![];
    let mut buf = vec![0; READ_BUFFER_SIZE];
    'read: loop {
        let bytes_read = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(bytes_read) => bytes_read,
            Err(err) => {
                debug!(logger, "Read from {} failed: {}", address, err);
                break;
            }
        };
        unparsed.extend_from_slice(&buf[..bytes_read]);

        while !unparsed.is_empty() {
            match deserialize_partial::<RawNetworkMessage>(&unparsed) {
                Ok((raw, consumed)) => {
                    unparsed.drain(..consumed);
                    if *raw.magic() != magic {
                        state.lock().decode_error =
                            Some(format!("unexpected magic {}", raw.magic()));
                        break 'read;
                    }
                    let response =
                        handle_message(raw.into_payload(), magic, &state, &address, &logger);
                    for frame in response {
                        let mut writer = writer.lock().await;
                        if let Err(err) = write_frame(&mut writer, &frame).await {
                            debug!(logger, "Write to {} failed: {}", address, err);
                            break 'read;
                        }
                    }
                }
                // Received incomplete message
                Err(encode::Error::Io(ref err)) if err.kind() == EncodeErrorKind::UnexpectedEof => {
                    break
                }
                Err(err) => {
                    warn!(logger, "Undecodable message from {}: {}", address, err);
                    state.lock().decode_error = Some(err.to_string());
                    break 'read;
                }
            }
        }
    }
    state.lock().connected = false;
    debug!(logger, "Connection to {} closed", address);
}

/// Records what `payload` tells about the peer and returns the framed answers.
fn handle_message(
    payload: NetworkMessage,
    magic: Magic,
    state: &Mutex<PeerState>,
    address: &str,
    logger: &Logger,
) -> Vec<Vec<u8>> {
    let mut state = state.lock();
    let replies = match payload {
        NetworkMessage::Version(version) => {
            trace!(logger, "Peer {} runs {}", address, version.user_agent);
            state.version_received = true;
            vec![NetworkMessage::Verack]
        }
        NetworkMessage::Verack => {
            state.verack_received = true;
            vec![]
        }
        NetworkMessage::Ping(nonce) => vec![NetworkMessage::Pong(nonce)],
        NetworkMessage::Pong(nonce) => {
            state.pongs.insert(nonce);
            vec![]
        }
        NetworkMessage::GetHeaders(_) => vec![NetworkMessage::Headers(vec![])],
        NetworkMessage::GetData(inventory) => {
            let mut frames = vec![];
            let mut not_found = vec![];
            for inv in inventory {
                match inv {
                    Inventory::Block(hash) | Inventory::WitnessBlock(hash) => {
                        match state.blocks.get(&hash) {
                            Some(block) => frames.push(block_frame(magic, block)),
                            None => not_found.push(inv),
                        }
                    }
                    Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                        match state.transactions.get(&txid) {
                            Some(tx) => frames.push(tx_frame(magic, tx)),
                            None => not_found.push(inv),
                        }
                    }
                    other => not_found.push(other),
                }
            }
            if !not_found.is_empty() {
                frames.push(message_frame(magic, NetworkMessage::NotFound(not_found)));
            }
            return frames;
        }
        NetworkMessage::Reject(reject) => {
            let notice = RejectNotice {
                message: reject.message.to_string(),
                code: reject.ccode,
                reason: reject.reason.to_string(),
                hash: reject.hash,
            };
            info!(
                logger,
                "Peer {} rejected {} {}: {}", address, notice.message, notice.hash, notice.reason
            );
            state.rejects.push(notice);
            vec![]
        }
        other => {
            trace!(logger, "Ignoring {} from {}", other.cmd(), address);
            vec![]
        }
    };
    replies
        .into_iter()
        .map(|reply| message_frame(magic, reply))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::logger::no_op_logger;
    use assert_matches::assert_matches;
    use bitcoin::{
        hashes::Hash,
        p2p::message_network::Reject,
        Network,
    };
    use std::borrow::Cow;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Accepts a single connection, answers the handshake, then plays `script`.
    async fn one_shot_peer<F, Fut>(script: F) -> String
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            script(socket).await;
        });
        address
    }

    async fn send(socket: &mut TcpStream, payload: NetworkMessage) {
        let serialized = serialize(&RawNetworkMessage::new(Network::Regtest.magic(), payload));
        socket.write_all(&serialized).await.unwrap();
    }

    async fn handshake(socket: &mut TcpStream) {
        let remote = socket.peer_addr().unwrap();
        send(socket, NetworkMessage::Version(version_message(remote))).await;
        send(socket, NetworkMessage::Verack).await;
    }

    #[tokio::test]
    async fn test_handshake_and_ping() {
        let address = one_shot_peer(|mut socket| async move {
            handshake(&mut socket).await;
            let mut unparsed = vec![];
            let mut buf = vec![0; 1024];
            loop {
                let read = socket.read(&mut buf).await.unwrap();
                if read == 0 {
                    return;
                }
                unparsed.extend_from_slice(&buf[..read]);
                while let Ok((raw, consumed)) =
                    deserialize_partial::<RawNetworkMessage>(&unparsed)
                {
                    unparsed.drain(..consumed);
                    if let NetworkMessage::Ping(nonce) = raw.payload() {
                        send(&mut socket, NetworkMessage::Pong(*nonce)).await;
                    }
                }
            }
        })
        .await;

        let connection =
            PeerConnection::connect(&address, Network::Regtest.magic(), TIMEOUT, no_op_logger())
                .await
                .unwrap();
        assert!(connection.is_connected());
        connection.sync_with_ping(TIMEOUT).await.unwrap();
        assert_eq!(connection.reject_count(), 0);
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let address = one_shot_peer(|socket| async move {
            sleep(Duration::from_secs(10)).await;
            drop(socket);
        })
        .await;
        let result = PeerConnection::connect(
            &address,
            Network::Regtest.magic(),
            Duration::from_millis(200),
            no_op_logger(),
        )
        .await;
        assert_matches!(result.err(), Some(ConnectionError::HandshakeTimeout(_)));
    }

    #[tokio::test]
    async fn test_unresolvable_address() {
        let result = PeerConnection::connect(
            "host.invalid:18444",
            Network::Regtest.magic(),
            TIMEOUT,
            no_op_logger(),
        )
        .await;
        assert_matches!(result.err(), Some(ConnectionError::Resolution(_)));
    }

    #[tokio::test]
    async fn test_reject_is_recorded_and_disconnect_observed() {
        let address = one_shot_peer(|mut socket| async move {
            handshake(&mut socket).await;
            send(
                &mut socket,
                NetworkMessage::Reject(Reject {
                    message: Cow::Borrowed("block"),
                    ccode: RejectReason::Invalid,
                    reason: Cow::Borrowed("bad-txns-vin-empty"),
                    hash: sha256d::Hash::all_zeros(),
                }),
            )
            .await;
            sleep(Duration::from_millis(100)).await;
            drop(socket);
        })
        .await;

        let connection =
            PeerConnection::connect(&address, Network::Regtest.magic(), TIMEOUT, no_op_logger())
                .await
                .unwrap();
        assert!(connection.wait_for_disconnect(TIMEOUT).await);
        let rejects = connection.rejects_since(0);
        assert_eq!(rejects.len(), 1);
        assert_eq!(rejects[0].message, "block");
        assert_eq!(rejects[0].reason, "bad-txns-vin-empty");
        assert!(connection.rejects_since(1).is_empty());
        assert_matches!(
            connection.sync_with_ping(TIMEOUT).await,
            Err(ConnectionError::Disconnected(_))
        );
    }

    #[tokio::test]
    async fn test_wrong_magic_is_a_decode_error() {
        let address = one_shot_peer(|mut socket| async move {
            let payload = NetworkMessage::Verack;
            let serialized = serialize(&RawNetworkMessage::new(Network::Bitcoin.magic(), payload));
            socket.write_all(&serialized).await.unwrap();
            sleep(Duration::from_secs(1)).await;
        })
        .await;
        let result =
            PeerConnection::connect(&address, Network::Regtest.magic(), TIMEOUT, no_op_logger())
                .await;
        assert_matches!(result.err(), Some(ConnectionError::Decode { .. }));
    }

    #[test]
    fn test_input_less_transaction_has_no_segwit_marker() {
        let blank = Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        assert_eq!(legacy_encode(&blank), vec![1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        // The default encoding would carry the marker and flag bytes.
        assert_eq!(serialize(&blank).len(), 12);
    }

    #[test]
    fn test_frames_match_default_encoding_for_standard_blocks() {
        let magic = Network::Regtest.magic();
        let genesis = bitcoin::blockdata::constants::genesis_block(Network::Regtest);
        assert_eq!(
            block_frame(magic, &genesis),
            serialize(&RawNetworkMessage::new(magic, NetworkMessage::Block(genesis.clone())))
        );
        assert_eq!(
            tx_frame(magic, &genesis.txdata[0]),
            serialize(&RawNetworkMessage::new(
                magic,
                NetworkMessage::Tx(genesis.txdata[0].clone())
            ))
        );
        let (decoded, consumed) =
            deserialize_partial::<RawNetworkMessage>(&block_frame(magic, &genesis)).unwrap();
        assert_eq!(consumed, block_frame(magic, &genesis).len());
        assert_matches!(decoded.payload(), NetworkMessage::Block(block) => {
            assert_eq!(block.block_hash(), genesis.block_hash());
        });
    }

    #[test]
    fn test_input_less_transaction_frame_carries_legacy_payload() {
        let magic = Network::Regtest.magic();
        let blank = Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        let frame = tx_frame(magic, &blank);
        assert_eq!(frame.len(), 24 + 10);
        assert_eq!(&frame[..4], &magic.to_bytes());
        assert_eq!(&frame[4..16], b"tx\0\0\0\0\0\0\0\0\0\0");
        assert_eq!(&frame[16..20], &10u32.to_le_bytes());
        assert_eq!(
            &frame[20..24],
            &sha256d::Hash::hash(&frame[24..]).to_byte_array()[..4]
        );
        assert_eq!(&frame[24..], &[1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    }
}
