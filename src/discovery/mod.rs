pub mod extractor;
pub mod scanner;

use alloy::primitives::Address;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::ethereum::provider::ChainClient;
use crate::ethereum::{utils, ContractCreationCandidate, DiscoveredToken, ScanCheckpoint};
use crate::store::{self, merge_tokens, MergePolicy, TokenStore};

pub use extractor::TokenExtractor;
pub use scanner::{ContractCreationScanner, ScanProgress};

/// Which blocks of each batch the scanner inspects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    #[default]
    EveryBlock,
    /// Only the last block of every batch. Fast, but misses deployments in
    /// the other `batch_size - 1` blocks.
    SampleBatchEnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySettings {
    pub batch_size: u64,
    pub recent_window: u64,
    pub incremental_window: u64,
    pub scan_mode: ScanMode,
    pub merge_policy: MergePolicy,
    pub transaction_concurrency: usize,
    pub extraction_concurrency: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            recent_window: 1000,
            incremental_window: 100,
            scan_mode: ScanMode::EveryBlock,
            merge_policy: MergePolicy::FirstSeenWins,
            transaction_concurrency: 8,
            extraction_concurrency: 4,
        }
    }
}

/// Result of an explicit block-range scan.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub start_block: u64,
    pub end_block: u64,
    pub candidates: usize,
    pub discovered: Vec<DiscoveredToken>,
    pub added: usize,
    pub tokens: Vec<DiscoveredToken>,
}

/// Recovers a wallet's deployed tokens from chain history and keeps the
/// local cache in step with what was found.
pub struct TokenDiscovery {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn TokenStore>,
    scanner: ContractCreationScanner,
    extractor: TokenExtractor,
    settings: DiscoverySettings,
    checkpoints: HashMap<Address, ScanCheckpoint>,
}

impl TokenDiscovery {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn TokenStore>,
        settings: DiscoverySettings,
    ) -> Self {
        let scanner = ContractCreationScanner::new(chain.clone(), &settings);
        let extractor = TokenExtractor::new(chain.clone(), settings.extraction_concurrency);

        Self {
            chain,
            store,
            scanner,
            extractor,
            settings,
            checkpoints: HashMap::new(),
        }
    }

    pub async fn cached_tokens(&self) -> Vec<DiscoveredToken> {
        store::load_or_empty(self.store.as_ref()).await
    }

    pub fn checkpoint(&self, wallet: Address) -> ScanCheckpoint {
        self.checkpoints.get(&wallet).copied().unwrap_or_default()
    }

    /// Scan the recent window (plus an incremental window from the last
    /// checkpoint) and merge what was found into the cache.
    ///
    /// Never returns less than the cache held before the call: any failure
    /// falls back to the cached list. An unreadable cache is never written.
    pub async fn discover_tokens(&mut self, wallet: Address) -> Vec<DiscoveredToken> {
        match self.run_discovery(wallet).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Discovery for {} failed, keeping cached tokens: {}", wallet, e);
                self.cached_tokens().await
            }
        }
    }

    async fn load_for_update(&self) -> Result<Vec<DiscoveredToken>> {
        self.store
            .load_all()
            .await
            .map_err(|e| anyhow!("Token cache unreadable, leaving it untouched: {}", e))
    }

    async fn run_discovery(&mut self, wallet: Address) -> Result<Vec<DiscoveredToken>> {
        let cached = self.load_for_update().await?;
        let height = self.chain.block_number().await?;
        let prior = self.checkpoint(wallet);

        let start = height.saturating_sub(self.settings.recent_window);
        let candidates = self
            .scanner
            .find_contract_creations(wallet, start, height)
            .await;
        let mut tokens = self.absorb(wallet, &cached, candidates).await;

        if prior.is_set() {
            let inc_start = prior.last_scanned_block;
            let inc_end = inc_start
                .saturating_add(self.settings.incremental_window)
                .min(height);
            info!(
                "Incremental scan for {} from checkpoint {}..={}",
                wallet, inc_start, inc_end
            );
            let candidates = self
                .scanner
                .find_contract_creations(wallet, inc_start, inc_end)
                .await;
            tokens = self.absorb(wallet, &tokens, candidates).await;
        }

        Ok(tokens)
    }

    /// Extract, merge, persist and advance the checkpoint. Returns the merged list.
    async fn absorb(
        &mut self,
        wallet: Address,
        cached: &[DiscoveredToken],
        candidates: Vec<ContractCreationCandidate>,
    ) -> Vec<DiscoveredToken> {
        let highest = candidates.iter().map(|c| c.block_number).max();
        let found = self.extractor.extract_all(candidates).await;
        self.merge_and_save(wallet, cached, &found, highest).await.0
    }

    async fn merge_and_save(
        &mut self,
        wallet: Address,
        cached: &[DiscoveredToken],
        found: &[DiscoveredToken],
        highest_candidate: Option<u64>,
    ) -> (Vec<DiscoveredToken>, usize) {
        let outcome = merge_tokens(cached, found, self.settings.merge_policy);

        if outcome.added > 0 || outcome.refreshed > 0 {
            info!(
                "Discovered {} new and {} refreshed tokens for {}",
                outcome.added, outcome.refreshed, wallet
            );
            store::save_or_warn(self.store.as_ref(), &outcome.tokens).await;
        }

        if let Some(block) = highest_candidate {
            self.checkpoints.entry(wallet).or_default().advance(block);
        }

        (outcome.tokens, outcome.added)
    }

    /// Scan an explicit range, bypassing the recent/incremental windows.
    /// `end_block` is clamped to the chain height when it can be read.
    pub async fn scan_range<F>(
        &mut self,
        wallet: Address,
        start_block: u64,
        end_block: u64,
        on_progress: F,
    ) -> Result<ScanReport>
    where
        F: FnMut(ScanProgress) + Send,
    {
        let end_block = match self.chain.block_number().await {
            Ok(height) => end_block.min(height),
            Err(e) => {
                warn!("Could not read chain height, scanning as requested: {}", e);
                end_block
            }
        };

        let cached = self.load_for_update().await?;
        let candidates = self
            .scanner
            .find_contract_creations_with_progress(wallet, start_block, end_block, on_progress)
            .await;
        let candidate_count = candidates.len();
        let highest = candidates.iter().map(|c| c.block_number).max();

        let discovered = self.extractor.extract_all(candidates).await;
        let (tokens, added) = self
            .merge_and_save(wallet, &cached, &discovered, highest)
            .await;

        Ok(ScanReport {
            start_block,
            end_block,
            candidates: candidate_count,
            discovered,
            added,
            tokens,
        })
    }

    /// Add a token by address alone. The record carries no transaction hash.
    /// Returns the cached record and whether it was newly added.
    pub async fn import_token(&mut self, address: Address) -> Result<(DiscoveredToken, bool)> {
        let token_data = self.extractor.probe(address).await.map_err(|e| {
            anyhow!(
                "Contract {} does not implement the expected token interface: {}",
                address,
                e
            )
        })?;

        // Imports record what the chain reports, even if inconsistent.
        if let (Ok(initial), Ok(max)) = (
            utils::scale_up(&token_data.initial_supply, token_data.decimals),
            utils::scale_up(&token_data.max_supply, token_data.decimals),
        ) {
            if initial > max {
                warn!(
                    "Imported token {} has supply {} above its max supply {}",
                    address, token_data.initial_supply, token_data.max_supply
                );
            }
        }

        let imported = DiscoveredToken {
            contract_address: address,
            transaction_hash: None,
            token_data,
            timestamp: utils::now_millis(),
        };

        let cached = self.load_for_update().await?;
        let outcome = merge_tokens(&cached, &[imported], self.settings.merge_policy);
        let added = outcome.added > 0;

        if added || outcome.refreshed > 0 {
            store::save_or_warn(self.store.as_ref(), &outcome.tokens).await;
        } else {
            info!("{} is already in the token history", address);
        }

        let token = outcome
            .tokens
            .into_iter()
            .find(|t| t.contract_address == address)
            .ok_or_else(|| anyhow!("Imported token {} missing after merge", address))?;

        Ok((token, added))
    }

    /// Forget every cached token and all checkpoints.
    pub async fn clear_history(&mut self) -> Result<()> {
        self.store.clear().await?;
        self.checkpoints.clear();
        info!("Cleared token history");
        Ok(())
    }
}
