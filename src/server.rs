use alloy::primitives::{Address, Bytes, TxHash};
use anyhow::{anyhow, Result};
use rmcp::{
    model::{ServerCapabilities, ServerInfo},
    tool,
    transport::stdio,
    ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::{
    config::{Config, NetworkConfig},
    coordinator::{
        CoordinatorSettings, LedgerEntry, MintRequest, PollOutcome, Submission, TokenAction,
        TransactionCoordinator, WaitOutcome,
    },
    discovery::TokenDiscovery,
    ethereum::{
        abi,
        provider::{ChainClient, RpcChainClient},
        utils, DiscoveredToken, TokenData,
    },
    store::{self, JsonFileStore, TokenStore},
    tracking::{HttpTracker, InteractionTracker},
};

#[derive(Clone)]
pub struct TokenForgeServer {
    discovery: Arc<Mutex<TokenDiscovery>>,
    store: Arc<dyn TokenStore>,
    coordinator: Arc<TransactionCoordinator>,
    /// Submissions still polling after the tool call returned.
    pending: Arc<Mutex<HashMap<TxHash, Submission>>>,
    summaries: Option<HttpTracker>,
    network: Arc<NetworkConfig>,
    config: Arc<Config>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct WalletRequest {
    /// Defaults to the configured signer.
    wallet_address: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct ScanRangeRequest {
    wallet_address: Option<String>,
    start_block: u64,
    end_block: u64,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct ImportTokenRequest {
    contract_address: String,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct DeployTokenRequest {
    name: String,
    symbol: String,
    decimals: u8,
    initial_supply: String,
    max_supply: String,
    logo: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct MintTokensRequest {
    contract_address: String,
    amount: String,
    recipient: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct TransactionStatusRequest {
    transaction_hash: String,
}

impl TokenForgeServer {
    pub async fn new(config: Config) -> Result<Self> {
        let network = config.network(None)?.clone();
        let chain = Arc::new(RpcChainClient::from_config(&config, None)?);
        if !chain.check_connection().await {
            warn!(
                "RPC endpoint {} is not reachable yet; tools will retry on use",
                network.rpc_url
            );
        }

        let cache_path = config.storage.resolved_cache_path();
        info!("Token history stored at {:?}", cache_path);
        let store: Arc<dyn TokenStore> = Arc::new(JsonFileStore::new(cache_path));

        let summaries = match &config.tracking.base_url {
            Some(url) => Some(HttpTracker::new(
                url,
                Duration::from_secs(config.tracking.timeout_secs),
            )?),
            None => {
                info!("No tracking API configured; interactions will not be recorded");
                None
            }
        };

        let bytecode = match &config.transactions.token_artifact {
            Some(path) => match abi::load_bytecode(path).await {
                Ok(code) => Some(code),
                Err(e) => {
                    warn!("Token deployment unavailable: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(Self::assemble(config, network, chain, store, summaries, bytecode))
    }

    fn assemble(
        config: Config,
        network: NetworkConfig,
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn TokenStore>,
        summaries: Option<HttpTracker>,
        bytecode: Option<Bytes>,
    ) -> Self {
        let tracker = summaries
            .clone()
            .map(|tracker| Arc::new(tracker) as Arc<dyn InteractionTracker>);

        let discovery = TokenDiscovery::new(chain.clone(), store.clone(), config.discovery.settings());
        let coordinator = TransactionCoordinator::new(
            chain,
            store.clone(),
            tracker,
            CoordinatorSettings {
                network: config.default_network.clone(),
                chain_id: network.chain_id,
                gas: network.gas.clone(),
                poll_interval: config.transactions.poll_interval(),
                max_poll_attempts: config.transactions.max_poll_attempts,
                bytecode,
            },
        );

        Self {
            discovery: Arc::new(Mutex::new(discovery)),
            store,
            coordinator: Arc::new(coordinator),
            pending: Arc::new(Mutex::new(HashMap::new())),
            summaries,
            network: Arc::new(network),
            config: Arc::new(config),
        }
    }

    pub async fn run(&self) -> Result<()> {
        info!("Starting Token Forge server");

        let service = self.clone().serve(stdio()).await?;

        info!("Token Forge server started successfully");
        let _ = service.waiting().await;
        self.coordinator.shutdown();
        Ok(())
    }

    fn resolve_wallet(&self, wallet: Option<&str>) -> Result<Address> {
        match wallet {
            Some(wallet) => utils::validate_address(wallet),
            None => self.coordinator.signer_address().ok_or_else(|| {
                anyhow!("No wallet_address given and no signing key is configured")
            }),
        }
    }

    fn writes_allowed(&self) -> Result<()> {
        if self.config.security.allow_write_operations {
            Ok(())
        } else {
            Err(anyhow!(
                "Write operations are disabled. Use --allow-writes flag to enable deploying and minting."
            ))
        }
    }

    fn token_json(&self, token: &DiscoveredToken) -> Value {
        let address = token.contract_address.to_string();
        let mut value = json!(token);
        value["explorerUrl"] = json!(self.network.address_url(&address));
        value
    }

    fn entry_json(&self, entry: &LedgerEntry) -> Value {
        let hash = format!("0x{:x}", entry.hash);
        let mut value = json!(entry);
        value["explorer"] = json!({
            "address": self.network.address_url(&entry.contract_address.to_string()),
            "transaction": self.network.transaction_url(&hash),
        });
        value
    }

    async fn submit(&self, action: TokenAction) -> Result<Value> {
        self.writes_allowed()?;

        let mut submission = self.coordinator.submit_and_track(action).await?;
        let outcome = submission
            .wait(self.config.transactions.soft_timeout())
            .await;

        // The poll may have moved the entry on since the provisional result.
        let entry = self
            .coordinator
            .ledger()
            .entry(submission.hash())
            .await
            .unwrap_or_else(|| submission.provisional().clone());

        let mut response = self.entry_json(&entry);
        response["outcome"] = outcome_json(&outcome);

        if let WaitOutcome::StillPending { .. } = outcome {
            let mut pending = self.pending.lock().await;
            pending.retain(|_, submission| !submission.is_finished());
            pending.insert(submission.hash(), submission);
        }

        Ok(response)
    }
}

fn parse_hash(hash: &str) -> Result<TxHash> {
    TxHash::from_str(hash.trim()).map_err(|e| anyhow!("Invalid transaction hash '{}': {}", hash, e))
}

fn outcome_json(outcome: &WaitOutcome) -> Value {
    match outcome {
        WaitOutcome::StillPending { message } => json!({ "state": "pending", "message": message }),
        WaitOutcome::Settled(PollOutcome::Confirmed {
            contract_address,
            block_number,
        }) => json!({
            "state": "confirmed",
            "contractAddress": contract_address.to_string(),
            "blockNumber": block_number,
        }),
        WaitOutcome::Settled(PollOutcome::Reverted { block_number }) => json!({
            "state": "reverted",
            "blockNumber": block_number,
            "message": "The transaction was mined but reverted. Nothing was retried.",
        }),
        WaitOutcome::Settled(PollOutcome::GaveUp { attempts }) => json!({
            "state": "unknown",
            "message": format!("No receipt after {} checks. Check your wallet or the explorer.", attempts),
        }),
        WaitOutcome::Settled(PollOutcome::Cancelled | PollOutcome::ShutDown) => {
            json!({ "state": "stopped" })
        }
    }
}

fn to_response(result: Result<Value>, action: &str) -> String {
    match result {
        Ok(value) => serde_json::to_string_pretty(&value)
            .unwrap_or_else(|_| format!("Failed to serialize {} result", action)),
        Err(e) => {
            error!("Failed to {}: {}", action, e);
            format!("Error: {}", e)
        }
    }
}

#[tool(tool_box)]
impl TokenForgeServer {
    #[tool(description = "List tokens in the local deployment history")]
    async fn list_tokens(&self) -> String {
        let tokens = store::load_or_empty(self.store.as_ref()).await;

        let result = Ok(json!({
            "count": tokens.len(),
            "tokens": tokens.iter().map(|t| self.token_json(t)).collect::<Vec<_>>(),
        }));
        to_response(result, "list tokens")
    }

    #[tool(description = "Recover tokens a wallet deployed by scanning recent blocks and merging them into the history")]
    async fn discover_tokens(&self, #[tool(aggr)] request: WalletRequest) -> String {
        let result = async {
            let wallet = self.resolve_wallet(request.wallet_address.as_deref())?;
            let mut discovery = self.discovery.lock().await;
            let tokens = discovery.discover_tokens(wallet).await;
            let checkpoint = discovery.checkpoint(wallet);

            Ok::<_, anyhow::Error>(json!({
                "wallet": wallet.to_string(),
                "lastScannedBlock": checkpoint.last_scanned_block,
                "count": tokens.len(),
                "tokens": tokens.iter().map(|t| self.token_json(t)).collect::<Vec<_>>(),
            }))
        }
        .await;

        to_response(result, "discover tokens")
    }

    #[tool(description = "Scan an explicit block range for tokens deployed by a wallet")]
    async fn scan_block_range(&self, #[tool(aggr)] request: ScanRangeRequest) -> String {
        let result = async {
            let wallet = self.resolve_wallet(request.wallet_address.as_deref())?;
            let mut discovery = self.discovery.lock().await;

            let report = discovery
                .scan_range(wallet, request.start_block, request.end_block, |progress| {
                    info!(
                        "Scanned {}/{} blocks, {} contracts found",
                        progress.current, progress.total, progress.found
                    );
                })
                .await?;

            Ok::<_, anyhow::Error>(json!({
                "wallet": wallet.to_string(),
                "startBlock": report.start_block,
                "endBlock": report.end_block,
                "contractsFound": report.candidates,
                "tokensFound": report.discovered.iter().map(|t| self.token_json(t)).collect::<Vec<_>>(),
                "added": report.added,
                "totalTokens": report.tokens.len(),
            }))
        }
        .await;

        to_response(result, "scan block range")
    }

    #[tool(description = "Add a token to the history by contract address")]
    async fn import_token(&self, #[tool(aggr)] request: ImportTokenRequest) -> String {
        let result = async {
            let address = utils::validate_address(&request.contract_address)?;
            let mut discovery = self.discovery.lock().await;
            let (token, added) = discovery.import_token(address).await?;

            let mut value = self.token_json(&token);
            value["added"] = json!(added);
            Ok::<_, anyhow::Error>(value)
        }
        .await;

        to_response(result, "import token")
    }

    #[tool(description = "Deploy a new capped, mintable ERC-20 token")]
    async fn deploy_token(&self, #[tool(aggr)] request: DeployTokenRequest) -> String {
        let token = TokenData {
            name: request.name,
            symbol: request.symbol,
            decimals: request.decimals,
            initial_supply: request.initial_supply,
            max_supply: request.max_supply,
            logo: request.logo.unwrap_or_default(),
            description: request.description.unwrap_or_default(),
        };

        to_response(self.submit(TokenAction::Deploy(token)).await, "deploy token")
    }

    #[tool(description = "Mint additional tokens up to the token's max supply")]
    async fn mint_tokens(&self, #[tool(aggr)] request: MintTokensRequest) -> String {
        let result = async {
            let contract_address = utils::validate_address(&request.contract_address)?;
            let recipient = request
                .recipient
                .as_deref()
                .map(utils::validate_address)
                .transpose()?;

            self.submit(TokenAction::Mint(MintRequest {
                contract_address,
                amount: request.amount,
                recipient,
            }))
            .await
        }
        .await;

        to_response(result, "mint tokens")
    }

    #[tool(description = "Show the tracked state of a deploy or mint transaction")]
    async fn transaction_status(&self, #[tool(aggr)] request: TransactionStatusRequest) -> String {
        let result = async {
            let hash = parse_hash(&request.transaction_hash)?;

            let entry = self
                .coordinator
                .ledger()
                .entry(hash)
                .await
                .ok_or_else(|| anyhow!("Transaction 0x{:x} was not submitted by this server", hash))?;

            Ok::<_, anyhow::Error>(self.entry_json(&entry))
        }
        .await;

        to_response(result, "get transaction status")
    }

    #[tool(description = "List every deploy and mint submitted since the server started")]
    async fn list_transactions(&self) -> String {
        let entries = self.coordinator.ledger().entries().await;

        let result = Ok(json!({
            "count": entries.len(),
            "transactions": entries.iter().map(|e| self.entry_json(e)).collect::<Vec<_>>(),
        }));
        to_response(result, "list transactions")
    }

    #[tool(description = "Stop polling for the receipt of a pending transaction. The transaction itself stays on the network")]
    async fn stop_tracking(&self, #[tool(aggr)] request: TransactionStatusRequest) -> String {
        let result = async {
            let hash = parse_hash(&request.transaction_hash)?;
            let submission = self
                .pending
                .lock()
                .await
                .remove(&hash)
                .ok_or_else(|| anyhow!("Transaction 0x{:x} is not being tracked", hash))?;
            submission.cancel();

            let entry = self
                .coordinator
                .ledger()
                .entry(hash)
                .await
                .unwrap_or_else(|| submission.provisional().clone());
            let mut value = self.entry_json(&entry);
            value["tracking"] = json!("stopped");
            Ok::<_, anyhow::Error>(value)
        }
        .await;

        to_response(result, "stop tracking")
    }

    #[tool(description = "Clear the local token history")]
    async fn clear_history(&self) -> String {
        let result = async {
            let mut discovery = self.discovery.lock().await;
            discovery.clear_history().await?;
            Ok::<_, anyhow::Error>(json!({ "cleared": true }))
        }
        .await;

        to_response(result, "clear history")
    }

    #[tool(description = "Summarize recorded deploy sessions for a wallet from the tracking API")]
    async fn wallet_summary(&self, #[tool(aggr)] request: WalletRequest) -> String {
        let result = async {
            let tracker = self
                .summaries
                .as_ref()
                .ok_or_else(|| anyhow!("No tracking API configured; set tracking.base_url or TRACKING_API_URL"))?;
            let wallet = self.resolve_wallet(request.wallet_address.as_deref())?;
            let summary = tracker.wallet_summary(wallet).await?;
            Ok::<_, anyhow::Error>(json!(summary))
        }
        .await;

        to_response(result, "fetch wallet summary")
    }
}

#[tool(tool_box)]
impl ServerHandler for TokenForgeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some("Deploys and mints capped ERC-20 tokens, and recovers a wallet's previously deployed tokens by scanning chain history into a local token history.".into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
