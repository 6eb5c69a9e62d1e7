pub mod ledger;

use alloy::{
    network::TransactionBuilder,
    primitives::{Address, Bytes, TxHash},
    rpc::types::TransactionRequest,
    sol_types::SolCall,
};
use anyhow::{anyhow, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GasConfig;
use crate::ethereum::abi::{self, ICustomToken};
use crate::ethereum::provider::ChainClient;
use crate::ethereum::{utils, TokenData};
use crate::store::{self, TokenStore};
use crate::tracking::{self, CompleteInteraction, InteractionTracker, StartInteraction};

pub use ledger::{
    ActionKind, Finalization, LedgerEntry, TransactionLedger, TransactionStatus,
};

#[derive(Debug, Clone)]
pub struct MintRequest {
    pub contract_address: Address,
    /// Human-readable amount, scaled by the token's decimals before sending.
    pub amount: String,
    /// Defaults to the signer.
    pub recipient: Option<Address>,
}

#[derive(Debug, Clone)]
pub enum TokenAction {
    Deploy(TokenData),
    Mint(MintRequest),
}

/// How a receipt poll ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Confirmed {
        contract_address: Address,
        block_number: Option<u64>,
    },
    Reverted {
        block_number: Option<u64>,
    },
    GaveUp {
        attempts: u32,
    },
    Cancelled,
    ShutDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Settled(PollOutcome),
    /// The soft timeout fired; polling continues in the background.
    StillPending { message: String },
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub network: String,
    pub chain_id: u64,
    pub gas: GasConfig,
    pub poll_interval: Duration,
    pub max_poll_attempts: Option<u32>,
    /// Creation code of the token contract; deploys fail without it.
    pub bytecode: Option<Bytes>,
}

/// Handle to one submitted transaction and its receipt poll.
///
/// Dropping the handle detaches it: polling carries on until the receipt
/// arrives, attempts run out or the coordinator shuts down.
pub struct Submission {
    hash: TxHash,
    provisional: LedgerEntry,
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<PollOutcome>>,
    outcome: Option<PollOutcome>,
}

impl Submission {
    pub fn hash(&self) -> TxHash {
        self.hash
    }

    /// Ledger entry as it stood right after submission.
    pub fn provisional(&self) -> &LedgerEntry {
        &self.provisional
    }

    /// Wait up to `soft_timeout` for the poll to finish. Timing out never
    /// cancels the poll.
    pub async fn wait(&mut self, soft_timeout: Duration) -> WaitOutcome {
        if let Some(outcome) = &self.outcome {
            return WaitOutcome::Settled(outcome.clone());
        }

        let Some(handle) = self.handle.as_mut() else {
            return WaitOutcome::Settled(PollOutcome::Cancelled);
        };

        match timeout(soft_timeout, handle).await {
            Ok(joined) => {
                let outcome = joined.unwrap_or_else(|e| {
                    error!("Receipt poll for 0x{:x} failed: {}", self.hash, e);
                    PollOutcome::Cancelled
                });
                self.handle = None;
                self.outcome = Some(outcome.clone());
                WaitOutcome::Settled(outcome)
            }
            Err(_) => WaitOutcome::StillPending {
                message: format!(
                    "Transaction 0x{:x} is still pending after {}s. Check your wallet or the explorer; it may still be confirmed.",
                    self.hash,
                    soft_timeout.as_secs()
                ),
            },
        }
    }

    /// The poll task has ended, whether or not anyone waited for it.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop polling. The transaction itself cannot be withdrawn.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }
}

/// Everything a poll task needs, detached from the coordinator so that
/// dropping the coordinator is observable from the task.
struct PollContext {
    chain: Arc<dyn ChainClient>,
    ledger: Arc<TransactionLedger>,
    tracker: Option<Arc<dyn InteractionTracker>>,
    wallet: Address,
    hash: TxHash,
    poll_interval: Duration,
    max_attempts: Option<u32>,
    shutdown: watch::Receiver<bool>,
    cancel: watch::Receiver<bool>,
}

/// Submits deploy and mint transactions and tracks them to a receipt.
pub struct TransactionCoordinator {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn TokenStore>,
    tracker: Option<Arc<dyn InteractionTracker>>,
    ledger: Arc<TransactionLedger>,
    settings: CoordinatorSettings,
    shutdown: watch::Sender<bool>,
    /// Held from nonce lookup until the node accepts the transaction.
    send_lock: Mutex<()>,
}

impl TransactionCoordinator {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn TokenStore>,
        tracker: Option<Arc<dyn InteractionTracker>>,
        settings: CoordinatorSettings,
    ) -> Self {
        let ledger = Arc::new(TransactionLedger::new(store.clone()));
        let (shutdown, _) = watch::channel(false);

        Self {
            chain,
            store,
            tracker,
            ledger,
            settings,
            shutdown,
            send_lock: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    pub fn signer_address(&self) -> Option<Address> {
        self.chain.signer_address()
    }

    /// Submit `action` and start polling for its receipt. Returns as soon as
    /// the node has accepted the transaction.
    pub async fn submit_and_track(&self, action: TokenAction) -> Result<Submission> {
        let sender = self
            .chain
            .signer_address()
            .ok_or_else(|| anyhow!("No signing key configured; set the private key environment variable"))?;

        match action {
            TokenAction::Deploy(token) => self.submit_deploy(sender, token).await,
            TokenAction::Mint(request) => self.submit_mint(sender, request).await,
        }
    }

    async fn submit_deploy(&self, sender: Address, token: TokenData) -> Result<Submission> {
        token.validate()?;
        let bytecode = self
            .settings
            .bytecode
            .as_ref()
            .ok_or_else(|| anyhow!("No token artifact configured; set transactions.token_artifact"))?;
        let (initial_supply, max_supply) = token.raw_supplies()?;

        let session_id = self.start_session(sender, &token).await;

        let send_guard = self.send_lock.lock().await;
        let nonce = self.chain.transaction_count(sender).await?;
        let predicted = sender.create(nonce);

        let mut request = TransactionRequest::default()
            .from(sender)
            .with_deploy_code(abi::encode_deployment(bytecode, &token, initial_supply, max_supply))
            .with_nonce(nonce)
            .with_gas_limit(self.settings.gas.deploy_gas_limit);
        if let Some(gas_price) = self.settings.gas.gas_price {
            request = request.with_gas_price(gas_price as u128);
        }

        info!(
            "Deploying {} ({}) from {} with nonce {}",
            token.name, token.symbol, sender, nonce
        );
        let hash = self.chain.send_transaction(request).await?;
        drop(send_guard);

        let entry = LedgerEntry {
            hash,
            kind: ActionKind::Deploy,
            status: TransactionStatus::Pending,
            contract_address: predicted,
            block_number: None,
            token: Some(token),
            session_id: Some(session_id),
            submitted_at: utils::now_millis(),
        };

        self.track(sender, entry).await
    }

    async fn submit_mint(&self, sender: Address, request: MintRequest) -> Result<Submission> {
        let decimals = self.token_decimals(request.contract_address).await?;
        let amount = utils::scale_up(&request.amount, decimals)?;
        if amount.is_zero() {
            return Err(anyhow!("Mint amount must be greater than 0"));
        }
        let recipient = request.recipient.unwrap_or(sender);

        let input = ICustomToken::mintCall {
            to: recipient,
            amount,
        }
        .abi_encode();

        let mut tx = TransactionRequest::default()
            .from(sender)
            .to(request.contract_address)
            .input(Bytes::from(input).into())
            .with_gas_limit(self.settings.gas.mint_gas_limit);
        if let Some(gas_price) = self.settings.gas.gas_price {
            tx = tx.with_gas_price(gas_price as u128);
        }

        info!(
            "Minting {} of {} to {}",
            request.amount, request.contract_address, recipient
        );
        let hash = {
            let _send_guard = self.send_lock.lock().await;
            self.chain.send_transaction(tx).await?
        };

        let entry = LedgerEntry {
            hash,
            kind: ActionKind::Mint,
            status: TransactionStatus::Pending,
            contract_address: request.contract_address,
            block_number: None,
            token: None,
            session_id: None,
            submitted_at: utils::now_millis(),
        };

        self.track(sender, entry).await
    }

    /// Register, start the poll, then report the provisional result. The
    /// poll may win the race; the ledger makes the loser a no-op.
    async fn track(&self, wallet: Address, entry: LedgerEntry) -> Result<Submission> {
        let hash = entry.hash;
        self.ledger.register(entry).await;

        let (cancel, cancel_rx) = watch::channel(false);
        let context = PollContext {
            chain: self.chain.clone(),
            ledger: self.ledger.clone(),
            tracker: self.tracker.clone(),
            wallet,
            hash,
            poll_interval: self.settings.poll_interval,
            max_attempts: self.settings.max_poll_attempts,
            shutdown: self.shutdown.subscribe(),
            cancel: cancel_rx,
        };
        let handle = tokio::spawn(poll_receipt(context));

        let provisional = self
            .ledger
            .finalize(hash, Finalization::Provisional)
            .await
            .map(|result| result.entry)
            .ok_or_else(|| anyhow!("Transaction 0x{:x} missing from ledger", hash))?;

        Ok(Submission {
            hash,
            provisional,
            cancel,
            handle: Some(handle),
            outcome: None,
        })
    }

    /// Always best-effort: the session id is generated locally, so a failed
    /// start still leaves something to correlate with.
    async fn start_session(&self, wallet: Address, token: &TokenData) -> String {
        let session_id = Uuid::new_v4().to_string();

        if let Some(tracker) = &self.tracker {
            let request = StartInteraction {
                wallet_address: tracking::wallet_key(wallet),
                session_id: session_id.clone(),
                metadata: Some(json!({
                    "network": self.settings.network,
                    "chainId": self.settings.chain_id,
                    "tokenName": token.name,
                    "tokenSymbol": token.symbol,
                })),
            };

            match tracker.start(&request).await {
                Ok(ack) => debug!(
                    "Tracking session {} started (ok: {}, interaction: {:?})",
                    session_id, ack.ok, ack.interaction_id
                ),
                Err(e) => warn!("Tracking start failed, continuing without it: {}", e),
            }
        }

        session_id
    }

    async fn token_decimals(&self, address: Address) -> Result<u8> {
        let cached = store::load_or_empty(self.store.as_ref()).await;
        if let Some(token) = cached.iter().find(|t| t.contract_address == address) {
            return Ok(token.token_data.decimals);
        }

        let output = self
            .chain
            .call(address, ICustomToken::decimalsCall {}.abi_encode().into())
            .await
            .map_err(|e| anyhow!("Failed to read decimals of {}: {}", address, e))?;

        ICustomToken::decimalsCall::abi_decode_returns(&output, true)
            .map(|decoded| decoded._0)
            .map_err(|e| anyhow!("{} does not look like a token: {}", address, e))
    }

    /// Stop every outstanding poll.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for TransactionCoordinator {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

async fn poll_receipt(mut ctx: PollContext) -> PollOutcome {
    let mut ticker = interval(ctx.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts: u32 = 0;
    // A dropped Submission detaches instead of cancelling.
    let mut cancel_attached = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = ctx.shutdown.changed() => {
                if changed.is_err() || *ctx.shutdown.borrow() {
                    debug!("Receipt poll for 0x{:x} stopped by shutdown", ctx.hash);
                    return PollOutcome::ShutDown;
                }
                continue;
            }
            changed = ctx.cancel.changed(), if cancel_attached => {
                match changed {
                    Ok(()) if *ctx.cancel.borrow() => {
                        info!("Receipt poll for 0x{:x} cancelled", ctx.hash);
                        return PollOutcome::Cancelled;
                    }
                    Ok(()) => {}
                    Err(_) => cancel_attached = false,
                }
                continue;
            }
        }

        attempts += 1;
        match ctx.chain.receipt(ctx.hash).await {
            Ok(Some(receipt)) if receipt.status => return confirm(&ctx, receipt.contract_address, receipt.block_number).await,
            Ok(Some(receipt)) => {
                ctx.ledger.mark_reverted(ctx.hash, receipt.block_number).await;
                return PollOutcome::Reverted {
                    block_number: receipt.block_number,
                };
            }
            Ok(None) => {}
            Err(e) => debug!("Receipt fetch for 0x{:x} failed: {}", ctx.hash, e),
        }

        if let Some(max) = ctx.max_attempts {
            if attempts >= max {
                warn!(
                    "Giving up on 0x{:x} after {} receipt checks",
                    ctx.hash, attempts
                );
                ctx.ledger.abandon(ctx.hash).await;
                return PollOutcome::GaveUp { attempts };
            }
        }
    }
}

async fn confirm(
    ctx: &PollContext,
    contract_address: Option<Address>,
    block_number: Option<u64>,
) -> PollOutcome {
    let Some(result) = ctx
        .ledger
        .finalize(
            ctx.hash,
            Finalization::Confirmed {
                contract_address,
                block_number,
            },
        )
        .await
    else {
        return PollOutcome::Cancelled;
    };

    let entry = result.entry;
    info!(
        "Transaction 0x{:x} confirmed in block {:?}",
        ctx.hash, entry.block_number
    );

    if result.newly_confirmed && entry.kind == ActionKind::Deploy {
        complete_session(ctx, &entry).await;
    }

    PollOutcome::Confirmed {
        contract_address: entry.contract_address,
        block_number: entry.block_number,
    }
}

async fn complete_session(ctx: &PollContext, entry: &LedgerEntry) {
    let (Some(tracker), Some(session_id), Some(token)) =
        (&ctx.tracker, &entry.session_id, &entry.token)
    else {
        return;
    };

    let request = CompleteInteraction {
        wallet_address: tracking::wallet_key(ctx.wallet),
        session_id: session_id.clone(),
        has_minted: true,
        contract_address: Some(entry.contract_address.to_string()),
        transaction_hash: Some(tracking::hash_key(entry.hash)),
        token_name: Some(token.name.clone()),
        token_symbol: Some(token.symbol.clone()),
        total_supply: Some(token.initial_supply.clone()),
        metadata: Some(json!({
            "decimals": token.decimals,
            "maxSupply": token.max_supply,
            "logo": token.logo,
            "description": token.description,
        })),
    };

    if let Err(e) = tracker.complete(&request).await {
        warn!("Tracking complete failed for session {}: {}", session_id, e);
    }
}
