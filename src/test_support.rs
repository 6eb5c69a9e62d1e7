//! In-memory collaborators for unit tests.

use alloy::{
    primitives::{Address, Bytes, TxHash, U256},
    rpc::types::TransactionRequest,
    sol_types::{sol_data, SolCall, SolType, SolValue},
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::ethereum::abi::ICustomToken;
use crate::ethereum::provider::ChainClient;
use crate::ethereum::{BlockSummary, DiscoveredToken, ReceiptSummary, TransactionSummary};
use crate::store::TokenStore;
use crate::tracking::{CompleteInteraction, InteractionTracker, StartAck, StartInteraction};

#[derive(Debug, Clone)]
pub struct MockToken {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: U256,
    pub cap: U256,
    pub logo: String,
    pub description: String,
}

impl MockToken {
    /// Token with whole-unit supplies at `decimals`.
    pub fn new(name: &str, symbol: &str, decimals: u8, total: u64, cap: u64) -> Self {
        let scale = U256::from(10u64).pow(U256::from(decimals));
        Self {
            name: name.to_string(),
            symbol: symbol.to_string(),
            decimals,
            total_supply: U256::from(total) * scale,
            cap: U256::from(cap) * scale,
            logo: String::new(),
            description: String::new(),
        }
    }
}

#[derive(Default)]
struct ChainState {
    height: u64,
    blocks: HashMap<u64, BlockSummary>,
    transactions: HashMap<TxHash, TransactionSummary>,
    receipts: HashMap<TxHash, ReceiptSummary>,
    tokens: HashMap<Address, MockToken>,
    failing_blocks: HashSet<u64>,
    failing_transactions: HashSet<TxHash>,
    failing_calls: HashSet<(Address, [u8; 4])>,
    fail_block_number: bool,
    nonces: HashMap<Address, u64>,
    signer: Option<Address>,
    queued_hashes: VecDeque<TxHash>,
    send_error: Option<String>,
    sent: Vec<TransactionRequest>,
    receipt_queries: usize,
}

/// Scriptable chain: blocks, transactions, receipts and token contracts.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(height: u64) -> Self {
        let chain = Self::default();
        chain.state.lock().unwrap().height = height;
        chain
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().unwrap().height = height;
    }

    fn push_transaction(&self, block: u64, tx: TransactionSummary) {
        let mut state = self.state.lock().unwrap();
        let entry = state.blocks.entry(block).or_insert_with(|| BlockSummary {
            number: block,
            timestamp: 1_700_000_000 + block,
            transactions: Vec::new(),
        });
        entry.transactions.push(tx.hash);
        state.transactions.insert(tx.hash, tx);
    }

    /// A mined contract creation by `from` that produced `contract`.
    pub fn add_creation(&self, block: u64, hash: TxHash, from: Address, contract: Address) {
        self.push_transaction(
            block,
            TransactionSummary {
                hash,
                from,
                to: None,
                block_number: Some(block),
            },
        );
        self.set_receipt(
            hash,
            ReceiptSummary {
                status: true,
                contract_address: Some(contract),
                block_number: Some(block),
            },
        );
    }

    /// A mined plain call from `from` to `to`.
    pub fn add_call(&self, block: u64, hash: TxHash, from: Address, to: Address) {
        self.push_transaction(
            block,
            TransactionSummary {
                hash,
                from,
                to: Some(to),
                block_number: Some(block),
            },
        );
        self.set_receipt(
            hash,
            ReceiptSummary {
                status: true,
                contract_address: None,
                block_number: Some(block),
            },
        );
    }

    pub fn set_receipt(&self, hash: TxHash, receipt: ReceiptSummary) {
        self.state.lock().unwrap().receipts.insert(hash, receipt);
    }

    pub fn add_token(&self, address: Address, token: MockToken) {
        self.state.lock().unwrap().tokens.insert(address, token);
    }

    pub fn fail_block(&self, number: u64) {
        self.state.lock().unwrap().failing_blocks.insert(number);
    }

    pub fn fail_transaction(&self, hash: TxHash) {
        self.state.lock().unwrap().failing_transactions.insert(hash);
    }

    pub fn fail_call(&self, address: Address, selector: [u8; 4]) {
        self.state
            .lock()
            .unwrap()
            .failing_calls
            .insert((address, selector));
    }

    pub fn fail_block_number(&self) {
        self.state.lock().unwrap().fail_block_number = true;
    }

    pub fn with_signer(self, signer: Address, nonce: u64) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.signer = Some(signer);
            state.nonces.insert(signer, nonce);
        }
        self
    }

    /// Hash returned by the next `send_transaction`.
    pub fn queue_hash(&self, hash: TxHash) {
        self.state.lock().unwrap().queued_hashes.push_back(hash);
    }

    pub fn fail_sends(&self, message: &str) {
        self.state.lock().unwrap().send_error = Some(message.to_string());
    }

    pub fn sent(&self) -> Vec<TransactionRequest> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn receipt_queries(&self) -> usize {
        self.state.lock().unwrap().receipt_queries
    }
}

fn encode_read(token: &MockToken, selector: [u8; 4]) -> Option<Vec<u8>> {
    let encoded = if selector == ICustomToken::nameCall::SELECTOR {
        (token.name.clone(),).abi_encode_params()
    } else if selector == ICustomToken::symbolCall::SELECTOR {
        (token.symbol.clone(),).abi_encode_params()
    } else if selector == ICustomToken::decimalsCall::SELECTOR {
        sol_data::Uint::<8>::abi_encode(&token.decimals)
    } else if selector == ICustomToken::totalSupplyCall::SELECTOR {
        (token.total_supply,).abi_encode_params()
    } else if selector == ICustomToken::capCall::SELECTOR {
        (token.cap,).abi_encode_params()
    } else if selector == ICustomToken::logoUrlCall::SELECTOR {
        (token.logo.clone(),).abi_encode_params()
    } else if selector == ICustomToken::descriptionCall::SELECTOR {
        (token.description.clone(),).abi_encode_params()
    } else {
        return None;
    };
    Some(encoded)
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_number(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        if state.fail_block_number {
            return Err(anyhow!("connection refused"));
        }
        Ok(state.height)
    }

    async fn block(&self, number: u64) -> Result<Option<BlockSummary>> {
        let state = self.state.lock().unwrap();
        if state.failing_blocks.contains(&number) {
            return Err(anyhow!("block {} unavailable", number));
        }
        Ok(state.blocks.get(&number).cloned())
    }

    async fn transaction(&self, hash: TxHash) -> Result<Option<TransactionSummary>> {
        let state = self.state.lock().unwrap();
        if state.failing_transactions.contains(&hash) {
            return Err(anyhow!("transaction 0x{:x} unavailable", hash));
        }
        Ok(state.transactions.get(&hash).cloned())
    }

    async fn receipt(&self, hash: TxHash) -> Result<Option<ReceiptSummary>> {
        let mut state = self.state.lock().unwrap();
        state.receipt_queries += 1;
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn transaction_count(&self, address: Address) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nonces
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
        let state = self.state.lock().unwrap();
        if input.len() < 4 {
            return Err(anyhow!("execution reverted"));
        }
        let mut selector = [0u8; 4];
        selector.copy_from_slice(&input[..4]);

        if state.failing_calls.contains(&(to, selector)) {
            return Err(anyhow!("execution reverted"));
        }

        state
            .tokens
            .get(&to)
            .and_then(|token| encode_read(token, selector))
            .map(Bytes::from)
            .ok_or_else(|| anyhow!("execution reverted"))
    }

    fn signer_address(&self) -> Option<Address> {
        self.state.lock().unwrap().signer
    }

    async fn send_transaction(&self, request: TransactionRequest) -> Result<TxHash> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = &state.send_error {
            return Err(anyhow!("{}", message));
        }
        let hash = state
            .queued_hashes
            .pop_front()
            .unwrap_or_else(|| TxHash::with_last_byte(state.sent.len() as u8 + 1));
        state.sent.push(request);
        if let Some(signer) = state.signer {
            *state.nonces.entry(signer).or_insert(0) += 1;
        }
        Ok(hash)
    }
}

/// Token cache held in memory, with switchable failures.
#[derive(Default)]
pub struct MemoryStore {
    tokens: Mutex<Vec<DiscoveredToken>>,
    fail_loads: Mutex<bool>,
    fail_saves: Mutex<bool>,
    saves: Mutex<usize>,
}

impl MemoryStore {
    pub fn with_tokens(tokens: Vec<DiscoveredToken>) -> Self {
        let store = Self::default();
        *store.tokens.lock().unwrap() = tokens;
        store
    }

    pub fn tokens(&self) -> Vec<DiscoveredToken> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn fail_loads(&self, fail: bool) {
        *self.fail_loads.lock().unwrap() = fail;
    }

    pub fn fail_saves(&self, fail: bool) {
        *self.fail_saves.lock().unwrap() = fail;
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<DiscoveredToken>> {
        if *self.fail_loads.lock().unwrap() {
            return Err(anyhow!("storage unavailable"));
        }
        Ok(self.tokens())
    }

    async fn save_all(&self, tokens: &[DiscoveredToken]) -> Result<()> {
        if *self.fail_saves.lock().unwrap() {
            return Err(anyhow!("quota exceeded"));
        }
        *self.tokens.lock().unwrap() = tokens.to_vec();
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.tokens.lock().unwrap().clear();
        Ok(())
    }
}

/// Tracker that records every call; `start` can be made to fail.
#[derive(Default)]
pub struct RecordingTracker {
    fail_start: bool,
    starts: Mutex<Vec<StartInteraction>>,
    completes: Mutex<Vec<CompleteInteraction>>,
}

impl RecordingTracker {
    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    pub fn completes(&self) -> Vec<CompleteInteraction> {
        self.completes.lock().unwrap().clone()
    }

    pub fn starts(&self) -> Vec<StartInteraction> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl InteractionTracker for RecordingTracker {
    async fn start(&self, request: &StartInteraction) -> Result<StartAck> {
        self.starts.lock().unwrap().push(request.clone());
        if self.fail_start {
            return Err(anyhow!("Tracking API returned 500 Internal Server Error for start"));
        }
        Ok(StartAck {
            ok: true,
            interaction_id: Some("interaction-1".to_string()),
        })
    }

    async fn complete(&self, request: &CompleteInteraction) -> Result<()> {
        self.completes.lock().unwrap().push(request.clone());
        Ok(())
    }
}
