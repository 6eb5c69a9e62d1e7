use alloy::primitives::{Address, TxHash};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ethereum::{DiscoveredToken, TokenData};
use crate::store::{self, TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Deploy,
    Mint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Accepted by the node, not yet seen in a block.
    Pending,
    /// Shown as successful before the receipt arrived.
    Provisional,
    Confirmed,
    Reverted,
    /// Polling gave up before a receipt was seen.
    Abandoned,
}

/// What the caller sees for one submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub hash: TxHash,
    pub kind: ActionKind,
    pub status: TransactionStatus,
    /// Deployed (or predicted) contract for deploys, the token for mints.
    pub contract_address: Address,
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub submitted_at: i64,
}

impl LedgerEntry {
    pub fn is_final(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::Confirmed | TransactionStatus::Reverted
        )
    }

    fn cache_record(&self) -> Option<DiscoveredToken> {
        match (self.kind, &self.token) {
            (ActionKind::Deploy, Some(token)) => Some(DiscoveredToken {
                contract_address: self.contract_address,
                transaction_hash: Some(self.hash),
                token_data: token.clone(),
                timestamp: self.submitted_at,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalization {
    /// The transaction hash is known; assume success.
    Provisional,
    /// A successful receipt was observed.
    Confirmed {
        contract_address: Option<Address>,
        block_number: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeResult {
    pub entry: LedgerEntry,
    /// This call moved the entry to `Confirmed`.
    pub newly_confirmed: bool,
    /// This call changed nothing.
    pub no_op: bool,
}

#[derive(Default)]
struct LedgerState {
    entries: HashMap<TxHash, LedgerEntry>,
    finalized: HashSet<TxHash>,
}

/// Finalize-once sink keyed by transaction hash.
///
/// Both the provisional path and the receipt poller report here. Whichever
/// arrives first writes the token cache; the other either upgrades the
/// status in place or does nothing, so running both in any order ends in
/// the same state.
pub struct TransactionLedger {
    store: Arc<dyn TokenStore>,
    state: Mutex<LedgerState>,
}

impl TransactionLedger {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self {
            store,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Track a freshly submitted transaction. Re-registering a hash keeps
    /// the existing entry.
    pub async fn register(&self, entry: LedgerEntry) {
        let mut state = self.state.lock().await;
        state.entries.entry(entry.hash).or_insert(entry);
    }

    pub async fn entry(&self, hash: TxHash) -> Option<LedgerEntry> {
        self.state.lock().await.entries.get(&hash).cloned()
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> =
            self.state.lock().await.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.submitted_at);
        entries
    }

    pub async fn finalize(&self, hash: TxHash, finalization: Finalization) -> Option<FinalizeResult> {
        let mut state = self.state.lock().await;

        let Some(current) = state.entries.get(&hash).cloned() else {
            warn!("Finalization for unknown transaction 0x{:x}", hash);
            return None;
        };

        let first = !state.finalized.contains(&hash);
        let mut updated = current.clone();

        match finalization {
            Finalization::Provisional => {
                if !first {
                    debug!("0x{:x} already finalized; provisional result ignored", hash);
                    return Some(FinalizeResult {
                        entry: current,
                        newly_confirmed: false,
                        no_op: true,
                    });
                }
                updated.status = TransactionStatus::Provisional;
            }
            Finalization::Confirmed {
                contract_address,
                block_number,
            } => {
                if current.is_final() {
                    return Some(FinalizeResult {
                        entry: current,
                        newly_confirmed: false,
                        no_op: true,
                    });
                }
                updated.status = TransactionStatus::Confirmed;
                updated.block_number = block_number.or(current.block_number);
                if current.kind == ActionKind::Deploy {
                    if let Some(address) = contract_address {
                        updated.contract_address = address;
                    }
                }
            }
        }

        state.finalized.insert(hash);
        state.entries.insert(hash, updated.clone());

        let address_changed = updated.contract_address != current.contract_address;
        if first || address_changed {
            if let Some(record) = updated.cache_record() {
                self.write_cache(record).await;
            }
        }

        if address_changed {
            info!(
                "0x{:x} created {} (predicted {})",
                hash, updated.contract_address, current.contract_address
            );
        }

        let newly_confirmed = updated.status == TransactionStatus::Confirmed
            && current.status != TransactionStatus::Confirmed;

        Some(FinalizeResult {
            entry: updated,
            newly_confirmed,
            no_op: false,
        })
    }

    /// Record a failed receipt. A deploy's provisional cache entry is removed.
    pub async fn mark_reverted(&self, hash: TxHash, block_number: Option<u64>) -> Option<LedgerEntry> {
        let mut state = self.state.lock().await;
        let entry = state.entries.get_mut(&hash)?;

        if entry.is_final() {
            return Some(entry.clone());
        }

        entry.status = TransactionStatus::Reverted;
        entry.block_number = block_number;
        let entry = entry.clone();
        state.finalized.insert(hash);

        if entry.kind == ActionKind::Deploy {
            self.remove_from_cache(hash).await;
        }

        warn!("Transaction 0x{:x} reverted", hash);
        Some(entry)
    }

    /// Polling stopped without a receipt. Any provisional cache entry stays,
    /// since the transaction may still be mined.
    pub async fn abandon(&self, hash: TxHash) -> Option<LedgerEntry> {
        let mut state = self.state.lock().await;
        let entry = state.entries.get_mut(&hash)?;

        if !entry.is_final() {
            entry.status = TransactionStatus::Abandoned;
        }
        Some(entry.clone())
    }

    /// `None` when the cache cannot be read; saving over it would lose history.
    async fn load_for_update(&self) -> Option<Vec<DiscoveredToken>> {
        match self.store.load_all().await {
            Ok(tokens) => Some(tokens),
            Err(e) => {
                warn!("Token cache unreadable, skipping update: {}", e);
                None
            }
        }
    }

    async fn write_cache(&self, record: DiscoveredToken) {
        let Some(mut tokens) = self.load_for_update().await else {
            return;
        };

        if tokens.iter().any(|t| *t == record) {
            return;
        }

        // One record per creating transaction and per address.
        tokens.retain(|t| {
            t.transaction_hash != record.transaction_hash
                && t.contract_address != record.contract_address
        });
        tokens.push(record);
        store::save_or_warn(self.store.as_ref(), &tokens).await;
    }

    async fn remove_from_cache(&self, hash: TxHash) {
        let Some(mut tokens) = self.load_for_update().await else {
            return;
        };
        let before = tokens.len();
        tokens.retain(|t| t.transaction_hash != Some(hash));
        if tokens.len() != before {
            store::save_or_warn(self.store.as_ref(), &tokens).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStore;

    fn token() -> TokenData {
        TokenData {
            name: "Test".to_string(),
            symbol: "TST".to_string(),
            decimals: 18,
            initial_supply: "1000000".to_string(),
            max_supply: "10000000".to_string(),
            logo: String::new(),
            description: String::new(),
        }
    }

    fn deploy_entry(predicted: Address) -> LedgerEntry {
        LedgerEntry {
            hash: TxHash::with_last_byte(0x11),
            kind: ActionKind::Deploy,
            status: TransactionStatus::Pending,
            contract_address: predicted,
            block_number: None,
            token: Some(token()),
            session_id: Some("session".to_string()),
            submitted_at: 1_000,
        }
    }

    fn confirmed(address: Address) -> Finalization {
        Finalization::Confirmed {
            contract_address: Some(address),
            block_number: Some(42),
        }
    }

    async fn run(order: &[Finalization], predicted: Address) -> (LedgerEntry, Vec<DiscoveredToken>, usize) {
        let store = Arc::new(MemoryStore::default());
        let ledger = TransactionLedger::new(store.clone());
        ledger.register(deploy_entry(predicted)).await;

        let mut confirmations = 0;
        for finalization in order {
            let result = ledger
                .finalize(TxHash::with_last_byte(0x11), *finalization)
                .await
                .unwrap();
            if result.newly_confirmed {
                confirmations += 1;
            }
        }

        let entry = ledger.entry(TxHash::with_last_byte(0x11)).await.unwrap();
        (entry, store.tokens(), confirmations)
    }

    #[tokio::test]
    async fn test_finalization_is_order_independent() {
        let actual = Address::with_last_byte(0xcc);

        for predicted in [actual, Address::with_last_byte(0xdd)] {
            let provisional_first =
                run(&[Finalization::Provisional, confirmed(actual)], predicted).await;
            let confirmation_first =
                run(&[confirmed(actual), Finalization::Provisional], predicted).await;

            assert_eq!(provisional_first, confirmation_first);

            let (entry, tokens, confirmations) = provisional_first;
            assert_eq!(entry.status, TransactionStatus::Confirmed);
            assert_eq!(entry.contract_address, actual);
            assert_eq!(tokens.len(), 1);
            assert_eq!(tokens[0].contract_address, actual);
            assert_eq!(tokens[0].transaction_hash, Some(TxHash::with_last_byte(0x11)));
            assert_eq!(confirmations, 1);
        }
    }

    #[tokio::test]
    async fn test_repeated_finalization_is_a_no_op() {
        let actual = Address::with_last_byte(0xcc);
        let (entry, tokens, confirmations) = run(
            &[
                Finalization::Provisional,
                Finalization::Provisional,
                confirmed(actual),
                confirmed(actual),
            ],
            actual,
        )
        .await;

        assert_eq!(entry.status, TransactionStatus::Confirmed);
        assert_eq!(tokens.len(), 1);
        assert_eq!(confirmations, 1);
    }

    #[tokio::test]
    async fn test_revert_removes_provisional_record() {
        let store = Arc::new(MemoryStore::default());
        let ledger = TransactionLedger::new(store.clone());
        let hash = TxHash::with_last_byte(0x11);
        ledger.register(deploy_entry(Address::with_last_byte(0xcc))).await;

        ledger.finalize(hash, Finalization::Provisional).await.unwrap();
        assert_eq!(store.tokens().len(), 1);

        let entry = ledger.mark_reverted(hash, Some(9)).await.unwrap();
        assert_eq!(entry.status, TransactionStatus::Reverted);
        assert!(store.tokens().is_empty());

        // A late confirmation cannot resurrect it.
        let result = ledger
            .finalize(hash, confirmed(Address::with_last_byte(0xcc)))
            .await
            .unwrap();
        assert!(result.no_op);
        assert!(store.tokens().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_cache_is_left_alone() {
        let history: Vec<DiscoveredToken> = (1..=3)
            .map(|byte| DiscoveredToken {
                contract_address: Address::with_last_byte(byte),
                transaction_hash: Some(TxHash::with_last_byte(byte)),
                token_data: token(),
                timestamp: byte as i64,
            })
            .collect();
        let store = Arc::new(MemoryStore::with_tokens(history.clone()));
        store.fail_loads(true);

        let ledger = TransactionLedger::new(store.clone());
        let hash = TxHash::with_last_byte(0x11);
        ledger.register(deploy_entry(Address::with_last_byte(0xcc))).await;

        // The ledger still moves on; only the cache write is skipped.
        let result = ledger.finalize(hash, Finalization::Provisional).await.unwrap();
        assert_eq!(result.entry.status, TransactionStatus::Provisional);
        let result = ledger
            .finalize(hash, confirmed(Address::with_last_byte(0xdd)))
            .await
            .unwrap();
        assert!(result.newly_confirmed);

        assert_eq!(store.save_count(), 0);
        assert_eq!(store.tokens(), history);
    }

    #[tokio::test]
    async fn test_revert_with_unreadable_cache_keeps_history() {
        let store = Arc::new(MemoryStore::default());
        let ledger = TransactionLedger::new(store.clone());
        let hash = TxHash::with_last_byte(0x11);
        ledger.register(deploy_entry(Address::with_last_byte(0xcc))).await;
        ledger.finalize(hash, Finalization::Provisional).await.unwrap();

        store.fail_loads(true);
        let entry = ledger.mark_reverted(hash, Some(9)).await.unwrap();
        assert_eq!(entry.status, TransactionStatus::Reverted);
        assert_eq!(store.tokens().len(), 1);
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_mint_never_touches_cache() {
        let store = Arc::new(MemoryStore::default());
        let ledger = TransactionLedger::new(store.clone());
        let hash = TxHash::with_last_byte(0x22);
        ledger
            .register(LedgerEntry {
                hash,
                kind: ActionKind::Mint,
                status: TransactionStatus::Pending,
                contract_address: Address::with_last_byte(0xcc),
                block_number: None,
                token: None,
                session_id: None,
                submitted_at: 5,
            })
            .await;

        ledger.finalize(hash, Finalization::Provisional).await.unwrap();
        let result = ledger
            .finalize(
                hash,
                Finalization::Confirmed {
                    contract_address: None,
                    block_number: Some(3),
                },
            )
            .await
            .unwrap();

        assert!(result.newly_confirmed);
        assert_eq!(result.entry.contract_address, Address::with_last_byte(0xcc));
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_abandon_keeps_cache_and_unknown_hash_is_ignored() {
        let store = Arc::new(MemoryStore::default());
        let ledger = TransactionLedger::new(store.clone());
        let hash = TxHash::with_last_byte(0x11);
        ledger.register(deploy_entry(Address::with_last_byte(0xcc))).await;
        ledger.finalize(hash, Finalization::Provisional).await.unwrap();

        let entry = ledger.abandon(hash).await.unwrap();
        assert_eq!(entry.status, TransactionStatus::Abandoned);
        assert_eq!(store.tokens().len(), 1);

        assert!(ledger
            .finalize(TxHash::with_last_byte(0x99), Finalization::Provisional)
            .await
            .is_none());
    }
}
