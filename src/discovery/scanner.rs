use alloy::primitives::{Address, TxHash};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{DiscoverySettings, ScanMode};
use crate::ethereum::provider::ChainClient;
use crate::ethereum::ContractCreationCandidate;

/// Blocks covered so far out of the requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanProgress {
    pub current: u64,
    pub total: u64,
    pub found: usize,
}

/// Walks block ranges looking for contracts a wallet created.
///
/// Every RPC failure is logged at `debug!` and the affected block or
/// transaction skipped, so a scan always returns whatever it could recover.
pub struct ContractCreationScanner {
    chain: Arc<dyn ChainClient>,
    batch_size: u64,
    scan_mode: ScanMode,
    concurrency: usize,
}

impl ContractCreationScanner {
    pub fn new(chain: Arc<dyn ChainClient>, settings: &DiscoverySettings) -> Self {
        Self {
            chain,
            batch_size: settings.batch_size.max(1),
            scan_mode: settings.scan_mode,
            concurrency: settings.transaction_concurrency.max(1),
        }
    }

    pub async fn find_contract_creations(
        &self,
        wallet: Address,
        start_block: u64,
        end_block: u64,
    ) -> Vec<ContractCreationCandidate> {
        self.find_contract_creations_with_progress(wallet, start_block, end_block, |_| {})
            .await
    }

    /// Scan `[start_block, end_block]` inclusive, reporting progress after
    /// each batch. An inverted range yields nothing.
    pub async fn find_contract_creations_with_progress<F>(
        &self,
        wallet: Address,
        start_block: u64,
        end_block: u64,
        mut on_progress: F,
    ) -> Vec<ContractCreationCandidate>
    where
        F: FnMut(ScanProgress) + Send,
    {
        if start_block > end_block {
            debug!("Empty scan range {}..={}", start_block, end_block);
            return Vec::new();
        }

        let total = end_block - start_block + 1;
        let mut found: HashMap<Address, ContractCreationCandidate> = HashMap::new();
        let mut batch_start = start_block;

        info!(
            "Scanning blocks {}..={} for contracts created by {} ({:?})",
            start_block, end_block, wallet, self.scan_mode
        );

        loop {
            let batch_end = batch_start
                .saturating_add(self.batch_size - 1)
                .min(end_block);

            let blocks = match self.scan_mode {
                ScanMode::EveryBlock => batch_start..=batch_end,
                ScanMode::SampleBatchEnd => batch_end..=batch_end,
            };

            for number in blocks {
                for candidate in self.scan_block(wallet, number).await {
                    // Keep the earliest sighting of an address.
                    found
                        .entry(candidate.contract_address)
                        .and_modify(|existing| {
                            if candidate.block_number < existing.block_number {
                                *existing = candidate.clone();
                            }
                        })
                        .or_insert(candidate);
                }
            }

            on_progress(ScanProgress {
                current: batch_end - start_block + 1,
                total,
                found: found.len(),
            });

            if batch_end == end_block {
                break;
            }
            batch_start = batch_end + 1;
        }

        let mut candidates: Vec<ContractCreationCandidate> = found.into_values().collect();
        candidates.sort_by(|a, b| {
            a.block_number
                .cmp(&b.block_number)
                .then_with(|| a.hash.cmp(&b.hash))
        });

        info!("Found {} contract creations by {}", candidates.len(), wallet);
        candidates
    }

    async fn scan_block(&self, wallet: Address, number: u64) -> Vec<ContractCreationCandidate> {
        let block = match self.chain.block(number).await {
            Ok(Some(block)) => block,
            Ok(None) => {
                debug!("Block {} not found, skipping", number);
                return Vec::new();
            }
            Err(e) => {
                debug!("Skipping block {}: {}", number, e);
                return Vec::new();
            }
        };

        let timestamp = i64::try_from(block.timestamp)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);

        stream::iter(block.transactions)
            .map(|hash| self.inspect_transaction(wallet, hash, number, timestamp))
            .buffer_unordered(self.concurrency)
            .filter_map(|candidate| async move { candidate })
            .collect()
            .await
    }

    async fn inspect_transaction(
        &self,
        wallet: Address,
        hash: TxHash,
        block_number: u64,
        timestamp: i64,
    ) -> Option<ContractCreationCandidate> {
        let tx = match self.chain.transaction(hash).await {
            Ok(Some(tx)) => tx,
            Ok(None) => return None,
            Err(e) => {
                debug!("Skipping transaction 0x{:x}: {}", hash, e);
                return None;
            }
        };

        if !tx.is_creation_from(wallet) {
            return None;
        }

        let receipt = match self.chain.receipt(hash).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => {
                debug!("No receipt yet for creation 0x{:x}", hash);
                return None;
            }
            Err(e) => {
                debug!("Skipping receipt of 0x{:x}: {}", hash, e);
                return None;
            }
        };

        let contract_address = receipt.contract_address?;

        Some(ContractCreationCandidate {
            hash,
            block_number: tx.block_number.unwrap_or(block_number),
            contract_address,
            timestamp,
        })
    }
}
