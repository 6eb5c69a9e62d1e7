use alloy::primitives::Address;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, warn};

use crate::ethereum::DiscoveredToken;

/// Persistence for the deployed-token history.
///
/// Implementations report failures through `Result`; callers decide whether
/// a failure is fatal. Discovery and the transaction ledger treat every store
/// error as non-fatal and only log it.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<DiscoveredToken>>;

    async fn save_all(&self, tokens: &[DiscoveredToken]) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// How a rediscovered address interacts with the cached record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Cached records are never touched by a rescan.
    #[default]
    FirstSeenWins,
    /// Token metadata is replaced; transaction hash and timestamp are kept.
    RefreshMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub tokens: Vec<DiscoveredToken>,
    pub added: usize,
    pub refreshed: usize,
}

/// Merge `incoming` into `cached`, keyed by contract address.
///
/// Cached order is preserved and new addresses are appended in the order
/// they arrive. The result never holds two records for one address, even
/// when `incoming` itself contains duplicates.
pub fn merge_tokens(
    cached: &[DiscoveredToken],
    incoming: &[DiscoveredToken],
    policy: MergePolicy,
) -> MergeOutcome {
    let mut tokens: Vec<DiscoveredToken> = Vec::with_capacity(cached.len() + incoming.len());
    let mut index: HashMap<Address, usize> = HashMap::new();

    for token in cached {
        match index.get(&token.contract_address) {
            // Tolerate an already-corrupt cache: first record wins.
            Some(_) => continue,
            None => {
                index.insert(token.contract_address, tokens.len());
                tokens.push(token.clone());
            }
        }
    }

    let mut added = 0;
    let mut refreshed = 0;

    for token in incoming {
        match index.get(&token.contract_address) {
            Some(&position) => {
                if policy == MergePolicy::RefreshMetadata
                    && tokens[position].token_data != token.token_data
                {
                    tokens[position].token_data = token.token_data.clone();
                    refreshed += 1;
                }
            }
            None => {
                index.insert(token.contract_address, tokens.len());
                tokens.push(token.clone());
                added += 1;
            }
        }
    }

    MergeOutcome {
        tokens,
        added,
        refreshed,
    }
}

/// JSON array of [`DiscoveredToken`] on disk, one file per installation.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<DiscoveredToken>> {
        if !self.path.exists() {
            debug!("No token cache at {:?} yet", self.path);
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| anyhow!("Failed to read token cache {:?}: {}", self.path, e))?;

        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse token cache {:?}: {}", self.path, e))
    }

    async fn save_all(&self, tokens: &[DiscoveredToken]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| anyhow!("Failed to create cache directory {:?}: {}", parent, e))?;
            }
        }

        let content = serde_json::to_string_pretty(tokens)
            .map_err(|e| anyhow!("Failed to serialize token cache: {}", e))?;

        // Write-then-rename so a crash never leaves a truncated cache behind.
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, content)
            .await
            .map_err(|e| anyhow!("Failed to write token cache {:?}: {}", tmp_path, e))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| anyhow!("Failed to replace token cache {:?}: {}", self.path, e))?;

        debug!("Saved {} tokens to {:?}", tokens.len(), self.path);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!("Failed to clear token cache {:?}: {}", self.path, e)),
        }
    }
}

/// Load the cache, treating any failure as an empty history.
pub async fn load_or_empty(store: &dyn TokenStore) -> Vec<DiscoveredToken> {
    match store.load_all().await {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!("Token cache unavailable, starting from an empty history: {}", e);
            Vec::new()
        }
    }
}

/// Persist the cache, logging instead of failing.
pub async fn save_or_warn(store: &dyn TokenStore, tokens: &[DiscoveredToken]) -> bool {
    match store.save_all(tokens).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to persist {} tokens: {}", tokens.len(), e);
            false
        }
    }
}
