pub mod abi;
pub mod provider;
pub mod utils;

use alloy::primitives::{Address, TxHash, U256};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Stored in place of a transaction hash for tokens imported by address.
pub const UNKNOWN_TRANSACTION: &str = "N/A";

const MAX_NAME_LEN: usize = 50;
const MAX_SYMBOL_LEN: usize = 10;
const MAX_DESCRIPTION_LEN: usize = 500;
const MAX_DECIMALS: u8 = 18;

/// Human-readable token metadata. Supplies are decimal strings already
/// divided by `10^decimals`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenData {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub initial_supply: String,
    pub max_supply: String,
    #[serde(default)]
    pub logo: String,
    #[serde(default)]
    pub description: String,
}

impl TokenData {
    /// Checks the constraints a deploy request must satisfy before anything
    /// is sent to the tracking service or the chain.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(anyhow!("Token name is required"));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(anyhow!(
                "Token name must be at most {} characters",
                MAX_NAME_LEN
            ));
        }

        let symbol = self.symbol.trim();
        if symbol.is_empty() {
            return Err(anyhow!("Token symbol is required"));
        }
        if symbol.chars().count() > MAX_SYMBOL_LEN {
            return Err(anyhow!(
                "Token symbol must be at most {} characters",
                MAX_SYMBOL_LEN
            ));
        }

        if self.decimals > MAX_DECIMALS {
            return Err(anyhow!(
                "Decimals must be between 0 and {}, got {}",
                MAX_DECIMALS,
                self.decimals
            ));
        }

        let initial = utils::scale_up(&self.initial_supply, self.decimals)
            .map_err(|e| anyhow!("Invalid initial supply: {}", e))?;
        let max = utils::scale_up(&self.max_supply, self.decimals)
            .map_err(|e| anyhow!("Invalid max supply: {}", e))?;

        if initial.is_zero() {
            return Err(anyhow!("Initial supply must be greater than 0"));
        }
        if max.is_zero() {
            return Err(anyhow!("Max supply must be greater than 0"));
        }
        if max < initial {
            return Err(anyhow!(
                "Max supply ({}) must be greater than or equal to initial supply ({})",
                self.max_supply,
                self.initial_supply
            ));
        }

        if !self.logo.is_empty() && reqwest::Url::parse(&self.logo).is_err() {
            return Err(anyhow!("Logo must be a valid URL: '{}'", self.logo));
        }

        if self.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(anyhow!(
                "Description must be at most {} characters",
                MAX_DESCRIPTION_LEN
            ));
        }

        Ok(())
    }

    /// Raw on-chain amounts for `(initial_supply, max_supply)`.
    pub fn raw_supplies(&self) -> Result<(U256, U256)> {
        Ok((
            utils::scale_up(&self.initial_supply, self.decimals)?,
            utils::scale_up(&self.max_supply, self.decimals)?,
        ))
    }
}

/// A token recovered from the chain or recorded after a deployment. The
/// contract address is the unique key within the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredToken {
    pub contract_address: Address,
    #[serde(with = "tx_hash_or_unknown")]
    pub transaction_hash: Option<TxHash>,
    pub token_data: TokenData,
    /// Milliseconds since the epoch.
    #[serde(default)]
    pub timestamp: i64,
}

/// A contract-creation transaction sent by the scanned wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCreationCandidate {
    pub hash: TxHash,
    pub block_number: u64,
    pub contract_address: Address,
    /// Block time in milliseconds since the epoch.
    pub timestamp: i64,
}

/// Highest block already folded into discovery for a wallet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanCheckpoint {
    pub last_scanned_block: u64,
}

impl ScanCheckpoint {
    pub fn is_set(&self) -> bool {
        self.last_scanned_block > 0
    }

    /// Moves the checkpoint forward; never backwards.
    pub fn advance(&mut self, block: u64) {
        self.last_scanned_block = self.last_scanned_block.max(block);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub number: u64,
    /// Seconds since the epoch, as reported by the chain.
    pub timestamp: u64,
    pub transactions: Vec<TxHash>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionSummary {
    pub hash: TxHash,
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub block_number: Option<u64>,
}

impl TransactionSummary {
    pub fn is_creation_from(&self, wallet: Address) -> bool {
        self.to.is_none() && self.from == wallet
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptSummary {
    pub status: bool,
    pub contract_address: Option<Address>,
    pub block_number: Option<u64>,
}

mod tx_hash_or_unknown {
    use super::UNKNOWN_TRANSACTION;
    use alloy::primitives::TxHash;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(hash: &Option<TxHash>, serializer: S) -> Result<S::Ok, S::Error> {
        match hash {
            Some(hash) => serializer.serialize_str(&format!("0x{:x}", hash)),
            None => serializer.serialize_str(UNKNOWN_TRANSACTION),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<TxHash>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw.is_empty() || raw == UNKNOWN_TRANSACTION {
            return Ok(None);
        }
        TxHash::from_str(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}
