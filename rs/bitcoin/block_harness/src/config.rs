use crate::{block_factory::ChainParams, logger::LoggerConfig};
use bitcoin::{
    consensus::encode::serialize,
    hashes::{sha256d, Hash},
    p2p::Magic,
    CompactTarget, Network,
};
use serde::{Deserialize, Serialize};
use std::{net::IpAddr, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Signet challenge is not valid hex: {0}")]
    InvalidSignetChallenge(#[from] hex::FromHexError),
}

/// A node under test: where to send blocks and where to ask about its chain.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TargetConfig {
    /// `host[:port]` of the node's P2P endpoint. A missing port defaults from the network.
    pub p2p_address: String,
    /// URL of the node's JSON-RPC interface.
    pub rpc_url: String,
    #[serde(default)]
    pub rpc_user: Option<String>,
    #[serde(default)]
    pub rpc_password: Option<String>,
    /// Takes precedence over user and password when set.
    #[serde(default)]
    pub rpc_cookie_file: Option<PathBuf>,
}

impl TargetConfig {
    /// The P2P address with `default_port` filled in when none is given.
    pub fn p2p_endpoint(&self, default_port: u16) -> String {
        let address = self.p2p_address.trim();
        if let Ok(ip) = address.parse::<IpAddr>() {
            return std::net::SocketAddr::new(ip, default_port).to_string();
        }
        match address.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => address.to_string(),
            _ => format!("{}:{}", address, default_port),
        }
    }
}

/// This struct contains the configuration options of a harness run.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// The type of Bitcoin network the targets run (e.g. Regtest, Signet, etc.).
    #[serde(default = "default_network")]
    pub network: Network,
    /// Hex encoded challenge script of a custom signet. Determines the wire magic.
    #[serde(default)]
    pub signet_challenge: Option<String>,
    /// The nodes under test. Each one gets an independent run.
    pub targets: Vec<TargetConfig>,
    /// Compact difficulty target of the blocks the harness mines.
    #[serde(default = "default_pow_bits")]
    pub pow_bits: u32,
    /// Upper bound on the nonce search for a single header.
    #[serde(default = "default_max_nonce_iterations")]
    pub max_nonce_iterations: u64,
    /// Blocks between subsidy halvings. Derived from the network when unset.
    #[serde(default)]
    pub subsidy_halving_interval: Option<u32>,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// How long a single submission waits for the target's reaction.
    #[serde(default = "default_submit_timeout_secs")]
    pub submit_timeout_secs: u64,
    /// How long the submission of the funding blocks may take to settle.
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,
    /// Blocks mined on top of the first spendable coinbase before spending it.
    #[serde(default = "default_maturity_buffer_blocks")]
    pub maturity_buffer_blocks: u32,
    #[serde(default = "default_spendable_outputs_to_collect")]
    pub spendable_outputs_to_collect: usize,
    /// When `true`, a step expecting a reject reason fails if the target sends none.
    #[serde(default = "default_strict_reject_reason")]
    pub strict_reject_reason: bool,
    /// Also relay every template's transaction on its own and check the mempool verdict.
    #[serde(default)]
    pub mempool_checks: bool,
    /// Logger config.
    #[serde(default)]
    pub logger: LoggerConfig,
}

fn default_network() -> Network {
    Network::Regtest
}

fn default_pow_bits() -> u32 {
    0x207fffff
}

fn default_max_nonce_iterations() -> u64 {
    u32::MAX as u64
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_submit_timeout_secs() -> u64 {
    2
}

fn default_sync_timeout_secs() -> u64 {
    60
}

fn default_maturity_buffer_blocks() -> u32 {
    99
}

fn default_spendable_outputs_to_collect() -> usize {
    33
}

fn default_strict_reject_reason() -> bool {
    true
}

impl Config {
    /// This function returns the port to use based on the Bitcoin network provided.
    pub fn port(&self) -> u16 {
        match self.network {
            Network::Bitcoin => 8333,
            Network::Testnet => 18333,
            Network::Signet => 38333,
            Network::Regtest => 18444,
            _ => 8333,
        }
    }

    /// The message start bytes of the network. A custom signet derives them from the
    /// double SHA-256 of its length-prefixed challenge script.
    pub fn magic(&self) -> Result<Magic, ConfigError> {
        match (&self.network, &self.signet_challenge) {
            (Network::Signet, Some(challenge)) => {
                let challenge = hex::decode(challenge)?;
                let digest = sha256d::Hash::hash(&serialize(&challenge));
                let bytes = digest.to_byte_array();
                Ok(Magic::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            (network, _) => Ok(network.magic()),
        }
    }

    pub fn subsidy_halving_interval(&self) -> u32 {
        self.subsidy_halving_interval
            .unwrap_or(match self.network {
                Network::Regtest => 150,
                _ => 210_000,
            })
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams {
            bits: CompactTarget::from_consensus(self.pow_bits),
            subsidy_halving_interval: self.subsidy_halving_interval(),
            max_nonce_iterations: self.max_nonce_iterations,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: default_network(),
            signet_challenge: None,
            targets: vec![],
            pow_bits: default_pow_bits(),
            max_nonce_iterations: default_max_nonce_iterations(),
            subsidy_halving_interval: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            submit_timeout_secs: default_submit_timeout_secs(),
            sync_timeout_secs: default_sync_timeout_secs(),
            maturity_buffer_blocks: default_maturity_buffer_blocks(),
            spendable_outputs_to_collect: default_spendable_outputs_to_collect(),
            strict_reject_reason: default_strict_reject_reason(),
            mempool_checks: false,
            logger: LoggerConfig::default(),
        }
    }
}
