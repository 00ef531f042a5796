//! Read-only access to the chain view of the node under test.
use crate::{config::TargetConfig, BlockHeight};
use bitcoin::{block::Header, Block, BlockHash, Txid};
use bitcoincore_rpc::{Auth, Client, RpcApi};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("RPC request failed: {0}")]
    Rpc(#[from] bitcoincore_rpc::Error),
    #[error("Block {0} is unknown to the target")]
    NotFound(BlockHash),
    #[error("Chain query unavailable: {0}")]
    Unavailable(String),
}

/// The questions the harness asks the target about its chain. Implementations must not
/// simulate answers; they report what the target itself believes.
pub trait ChainQuery: Send + Sync {
    fn best_block_hash(&self) -> Result<BlockHash, QueryError>;

    fn block_header(&self, hash: &BlockHash) -> Result<Header, QueryError>;

    fn block_height(&self, hash: &BlockHash) -> Result<BlockHeight, QueryError>;

    fn block(&self, hash: &BlockHash) -> Result<Block, QueryError>;

    /// Whether the transaction currently sits in the target's mempool.
    fn mempool_contains(&self, txid: &Txid) -> Result<bool, QueryError>;
}

/// Queries a node over its JSON-RPC interface.
pub struct RpcChainQuery {
    client: Client,
}

impl RpcChainQuery {
    pub fn new(target: &TargetConfig) -> Result<Self, QueryError> {
        let auth = match (&target.rpc_cookie_file, &target.rpc_user, &target.rpc_password) {
            (Some(cookie), _, _) => Auth::CookieFile(cookie.clone()),
            (None, Some(user), Some(password)) => Auth::UserPass(user.clone(), password.clone()),
            (None, Some(user), None) => Auth::UserPass(user.clone(), String::new()),
            (None, None, _) => Auth::None,
        };
        let client = Client::new(&target.rpc_url, auth)?;
        Ok(Self { client })
    }
}

impl ChainQuery for RpcChainQuery {
    fn best_block_hash(&self) -> Result<BlockHash, QueryError> {
        Ok(self.client.get_best_block_hash()?)
    }

    fn block_header(&self, hash: &BlockHash) -> Result<Header, QueryError> {
        Ok(self.client.get_block_header(hash)?)
    }

    fn block_height(&self, hash: &BlockHash) -> Result<BlockHeight, QueryError> {
        let info = self.client.get_block_header_info(hash)?;
        BlockHeight::try_from(info.height)
            .map_err(|_| QueryError::Unavailable(format!("height {} out of range", info.height)))
    }

    fn block(&self, hash: &BlockHash) -> Result<Block, QueryError> {
        Ok(self.client.get_block(hash)?)
    }

    fn mempool_contains(&self, txid: &Txid) -> Result<bool, QueryError> {
        Ok(self.client.get_raw_mempool()?.contains(txid))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    fn target() -> TargetConfig {
        TargetConfig {
            p2p_address: "127.0.0.1".to_string(),
            rpc_url: "http://127.0.0.1:18443".to_string(),
            rpc_user: None,
            rpc_password: None,
            rpc_cookie_file: None,
        }
    }

    #[test]
    fn test_client_without_credentials_is_created() {
        assert!(RpcChainQuery::new(&target()).is_ok());
        let with_password = TargetConfig {
            rpc_user: Some("user".to_string()),
            rpc_password: Some("password".to_string()),
            ..target()
        };
        assert!(RpcChainQuery::new(&with_password).is_ok());
    }

    #[test]
    fn test_missing_cookie_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let with_cookie = TargetConfig {
            rpc_cookie_file: Some(dir.path().join(".cookie")),
            ..target()
        };
        assert_matches!(
            RpcChainQuery::new(&with_cookie).err(),
            Some(QueryError::Rpc(_))
        );
    }
}
