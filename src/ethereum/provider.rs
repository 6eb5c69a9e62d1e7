use crate::config::{Config, NetworkConfig};
use alloy::{
    network::{EthereumWallet, ReceiptResponse},
    primitives::{Address, Bytes, TxHash, U64},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
    transports::http::{Client, Http},
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::str::FromStr;

use super::{utils, BlockSummary, ReceiptSummary, TransactionSummary};

/// The chain operations discovery and transaction tracking depend on.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64>;

    /// Block header data plus the hashes of its transactions.
    async fn block(&self, number: u64) -> Result<Option<BlockSummary>>;

    async fn transaction(&self, hash: TxHash) -> Result<Option<TransactionSummary>>;

    async fn receipt(&self, hash: TxHash) -> Result<Option<ReceiptSummary>>;

    /// Nonce for the next transaction from `address`, counting pending ones.
    async fn transaction_count(&self, address: Address) -> Result<u64>;

    /// `eth_call` against the latest block.
    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes>;

    /// Address transactions are signed with, if a key is configured.
    fn signer_address(&self) -> Option<Address>;

    /// Signs and broadcasts; resolves once the node has accepted the transaction.
    async fn send_transaction(&self, request: TransactionRequest) -> Result<TxHash>;
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    number: U64,
    timestamp: U64,
    #[serde(default)]
    transactions: Vec<TxHash>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: TxHash,
    from: Address,
    to: Option<Address>,
    block_number: Option<U64>,
}

/// [`ChainClient`] backed by an alloy HTTP provider.
#[derive(Debug)]
pub struct RpcChainClient {
    provider: RootProvider<Http<Client>>,
    network: NetworkConfig,
    signer: Option<PrivateKeySigner>,
}

impl RpcChainClient {
    pub fn new(network: NetworkConfig, signer: Option<PrivateKeySigner>) -> Result<Self> {
        let provider = Self::create_provider(&network)?;

        Ok(Self {
            provider,
            network,
            signer,
        })
    }

    /// Connect to `network` (or the default one), picking up the signing key
    /// from the environment variable named in the security settings.
    pub fn from_config(config: &Config, network: Option<&str>) -> Result<Self> {
        let network_config = config.network(network)?;

        let signer = match std::env::var(&config.security.private_key_env) {
            Ok(key) => Some(parse_private_key(&key)?),
            Err(_) => {
                tracing::warn!(
                    "{} is not set; write operations will be unavailable",
                    config.security.private_key_env
                );
                None
            }
        };

        Self::new(network_config.clone(), signer)
    }

    fn create_provider(network_config: &NetworkConfig) -> Result<RootProvider<Http<Client>>> {
        let url = network_config
            .rpc_url
            .parse()
            .map_err(|e| anyhow!("Invalid RPC URL '{}': {}", network_config.rpc_url, e))?;
        let provider = ProviderBuilder::new().on_http(url);

        Ok(provider)
    }

    pub async fn check_connection(&self) -> bool {
        match self.provider.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Connection check failed for {}: {}", self.network.rpc_url, e);
                false
            }
        }
    }
}

fn parse_private_key(key: &str) -> Result<PrivateKeySigner> {
    let key = key.trim();
    let key = key.strip_prefix("0x").unwrap_or(key);
    PrivateKeySigner::from_str(key).map_err(|e| anyhow!("Invalid private key: {}", e))
}

fn rpc_error(context: &str, error: impl std::fmt::Display) -> anyhow::Error {
    anyhow!("{}: {}", context, utils::interpret_rpc_error(&error.to_string()))
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn block_number(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| rpc_error("Failed to fetch block number", e))
    }

    async fn block(&self, number: u64) -> Result<Option<BlockSummary>> {
        // Hashes only; each transaction is fetched individually afterwards.
        let block: Option<RpcBlock> = self
            .provider
            .raw_request("eth_getBlockByNumber".into(), (U64::from(number), false))
            .await
            .map_err(|e| rpc_error(&format!("Failed to fetch block {}", number), e))?;

        Ok(block.map(|block| BlockSummary {
            number: block.number.to::<u64>(),
            timestamp: block.timestamp.to::<u64>(),
            transactions: block.transactions,
        }))
    }

    async fn transaction(&self, hash: TxHash) -> Result<Option<TransactionSummary>> {
        let tx: Option<RpcTransaction> = self
            .provider
            .raw_request("eth_getTransactionByHash".into(), (hash,))
            .await
            .map_err(|e| rpc_error(&format!("Failed to fetch transaction 0x{:x}", hash), e))?;

        Ok(tx.map(|tx| TransactionSummary {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            block_number: tx.block_number.map(|n| n.to::<u64>()),
        }))
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<ReceiptSummary>> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| rpc_error(&format!("Failed to fetch receipt 0x{:x}", hash), e))?;

        Ok(receipt.map(|receipt| ReceiptSummary {
            status: receipt.status(),
            contract_address: receipt.contract_address(),
            block_number: receipt.block_number(),
        }))
    }

    async fn transaction_count(&self, address: Address) -> Result<u64> {
        self.provider
            .get_transaction_count(address)
            .pending()
            .await
            .map_err(|e| rpc_error(&format!("Failed to fetch nonce of {}", address), e))
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
        let call_request = TransactionRequest::default().to(to).input(input.into());

        self.provider
            .call(&call_request)
            .await
            .map_err(|e| rpc_error(&format!("Call to {} failed", to), e))
    }

    fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(|signer| signer.address())
    }

    async fn send_transaction(&self, request: TransactionRequest) -> Result<TxHash> {
        let signer = self
            .signer
            .clone()
            .ok_or_else(|| anyhow!("No signing key configured; cannot send transactions"))?;

        let url = self
            .network
            .rpc_url
            .parse()
            .map_err(|e| anyhow!("Invalid RPC URL '{}': {}", self.network.rpc_url, e))?;

        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(url);

        let pending = provider
            .send_transaction(request)
            .await
            .map_err(|e| rpc_error("Failed to send transaction", e))?;

        let tx_hash = *pending.tx_hash();
        tracing::info!("Transaction accepted with hash: 0x{:x}", tx_hash);
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_private_key_accepts_prefix() {
        let key = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
        let with_prefix = parse_private_key(key).unwrap();
        let without_prefix = parse_private_key(&key[2..]).unwrap();
        assert_eq!(with_prefix.address(), without_prefix.address());
        assert!(parse_private_key("not a key").is_err());
    }

    #[test]
    fn test_rpc_block_deserialization() {
        let json = serde_json::json!({
            "number": "0x10",
            "timestamp": "0x64",
            "hash": "0x0000000000000000000000000000000000000000000000000000000000000001",
            "transactions": [
                "0x00000000000000000000000000000000000000000000000000000000000000aa"
            ]
        });

        let block: RpcBlock = serde_json::from_value(json).unwrap();
        assert_eq!(block.number.to::<u64>(), 16);
        assert_eq!(block.timestamp.to::<u64>(), 100);
        assert_eq!(block.transactions, vec![TxHash::with_last_byte(0xaa)]);
    }

    #[test]
    fn test_rpc_creation_transaction_has_no_recipient() {
        let json = serde_json::json!({
            "hash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
            "from": "0x742d35cc6435c9c1c72c5e7b18bab7e1db7a5d6e",
            "to": null,
            "blockNumber": "0x10",
            "nonce": "0x0"
        });

        let tx: RpcTransaction = serde_json::from_value(json).unwrap();
        assert!(tx.to.is_none());
        assert_eq!(tx.block_number.map(|n| n.to::<u64>()), Some(16));
    }

    #[test]
    fn test_from_config_rejects_unknown_network() {
        let config = Config::default();
        assert!(RpcChainClient::from_config(&config, Some("nowhere")).is_err());
    }
}
