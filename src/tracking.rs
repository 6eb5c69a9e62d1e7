use alloy::primitives::{Address, TxHash};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// The interactions API that records deploy attempts per wallet session.
///
/// Tracking is observability only; callers log failures and carry on.
#[async_trait]
pub trait InteractionTracker: Send + Sync {
    async fn start(&self, request: &StartInteraction) -> Result<StartAck>;

    /// Fails when the server has no session for `(wallet, session_id)`.
    async fn complete(&self, request: &CompleteInteraction) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartInteraction {
    pub wallet_address: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAck {
    #[serde(default)]
    pub ok: bool,
    pub interaction_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteInteraction {
    pub wallet_address: String,
    pub session_id: String,
    pub has_minted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_supply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WalletSummary {
    pub wallet: String,
    pub total_sessions: u64,
    pub total_completed: u64,
    pub total_minted: u64,
    pub distinct_minted_tokens: u64,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    pub tokens: Vec<MintedTokenSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MintedTokenSummary {
    pub contract_address: Option<String>,
    pub token_name: Option<String>,
    pub token_symbol: Option<String>,
    pub total_supply: Option<String>,
    pub mints: u64,
    pub last_tx: Option<String>,
    pub last_mint_at: Option<String>,
}

/// The server stores wallets lowercased; send them that way.
pub fn wallet_key(wallet: Address) -> String {
    format!("0x{}", hex::encode(wallet.as_slice()))
}

pub fn hash_key(hash: TxHash) -> String {
    format!("0x{:x}", hash)
}

/// REST client for `{base}/start`, `{base}/complete` and `{base}/wallet/summary`.
#[derive(Debug, Clone)]
pub struct HttpTracker {
    client: Client,
    base_url: String,
}

impl HttpTracker {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build tracking HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    pub async fn wallet_summary(&self, wallet: Address) -> Result<WalletSummary> {
        let url = self.endpoint("wallet/summary");
        let response = self
            .client
            .get(&url)
            .query(&[("wallet", wallet_key(wallet))])
            .send()
            .await
            .map_err(|e| anyhow!("Failed to reach tracking API: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "Tracking API returned {} for wallet summary",
                response.status()
            ));
        }

        response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse wallet summary: {}", e))
    }
}

#[async_trait]
impl InteractionTracker for HttpTracker {
    async fn start(&self, request: &StartInteraction) -> Result<StartAck> {
        let url = self.endpoint("start");
        debug!("Starting interaction {} for {}", request.session_id, request.wallet_address);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to reach tracking API: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow!("Tracking API returned {} for start", response.status()));
        }

        response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse start response: {}", e))
    }

    async fn complete(&self, request: &CompleteInteraction) -> Result<()> {
        let url = self.endpoint("complete");
        debug!("Completing interaction {} for {}", request.session_id, request.wallet_address);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to reach tracking API: {}", e))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(anyhow!(
                "No interaction session {} for wallet {}",
                request.session_id,
                request.wallet_address
            )),
            status => Err(anyhow!("Tracking API returned {} for complete", status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves a single canned HTTP response and returns the raw request.
    async fn one_shot_server(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/api/interactions", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });

        (base, handle)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        raw.len() >= header_end + 4 + content_length
    }

    #[test]
    fn test_complete_payload_shape() {
        let request = CompleteInteraction {
            wallet_address: wallet_key(Address::with_last_byte(0xaa)),
            session_id: "s-1".to_string(),
            has_minted: true,
            contract_address: Some("0xccc".to_string()),
            transaction_hash: None,
            token_name: Some("Test".to_string()),
            token_symbol: None,
            total_supply: None,
            metadata: None,
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["hasMinted"], true);
        assert_eq!(json["contractAddress"], "0xccc");
        assert_eq!(json["walletAddress"], "0x00000000000000000000000000000000000000aa");
        assert!(json.get("transactionHash").is_none());
    }

    #[test]
    fn test_wallet_summary_parses_partial_response() {
        let summary: WalletSummary = serde_json::from_value(serde_json::json!({
            "wallet": "0xabc",
            "totalSessions": 3,
            "totalMinted": 1,
            "tokens": [{"contractAddress": "0xccc", "mints": 1}]
        }))
        .unwrap();

        assert_eq!(summary.total_sessions, 3);
        assert_eq!(summary.total_completed, 0);
        assert_eq!(summary.tokens[0].mints, 1);
    }

    #[tokio::test]
    async fn test_start_posts_session() {
        let body = r#"{"ok":true,"interactionId":"abc123"}"#;
        let response: &'static str = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let (base, server) = one_shot_server(response).await;

        let tracker = HttpTracker::new(&base, Duration::from_secs(5)).unwrap();
        let ack = tracker
            .start(&StartInteraction {
                wallet_address: "0xaaa".to_string(),
                session_id: "session-1".to_string(),
                metadata: None,
            })
            .await
            .unwrap();

        assert!(ack.ok);
        assert_eq!(ack.interaction_id.as_deref(), Some("abc123"));

        let raw_request = server.await.unwrap();
        assert!(raw_request.starts_with("POST /api/interactions/start"));
        assert!(raw_request.contains("\"sessionId\":\"session-1\""));
    }

    #[tokio::test]
    async fn test_complete_without_session_is_an_error() {
        let (base, _server) = one_shot_server(
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;

        let tracker = HttpTracker::new(&base, Duration::from_secs(5)).unwrap();
        let result = tracker
            .complete(&CompleteInteraction {
                wallet_address: "0xaaa".to_string(),
                session_id: "missing".to_string(),
                has_minted: true,
                contract_address: None,
                transaction_hash: None,
                token_name: None,
                token_symbol: None,
                total_supply: None,
                metadata: None,
            })
            .await;

        let err = result.unwrap_err().to_string();
        assert!(err.contains("No interaction session missing"));
    }
}
