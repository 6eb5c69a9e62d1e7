use alloy::{
    primitives::Address,
    sol_types::SolCall,
};
use anyhow::{anyhow, Result};
use futures::future;
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::ethereum::abi::ICustomToken;
use crate::ethereum::provider::ChainClient;
use crate::ethereum::{utils, ContractCreationCandidate, DiscoveredToken, TokenData};

/// One step of an extraction run. `token` is set when the candidate that just
/// finished turned out to be a token.
#[derive(Debug, Clone)]
pub struct ExtractionProgress {
    pub current: usize,
    pub total: usize,
    pub found: usize,
    pub token: Option<DiscoveredToken>,
}

/// Classifies candidate contracts by probing the token interface.
pub struct TokenExtractor {
    chain: Arc<dyn ChainClient>,
    concurrency: usize,
}

impl TokenExtractor {
    pub fn new(chain: Arc<dyn ChainClient>, concurrency: usize) -> Self {
        Self {
            chain,
            concurrency: concurrency.max(1),
        }
    }

    /// Lazily probe every candidate, yielding one progress snapshot per
    /// finished probe. Completion order is not input order.
    pub fn extract(
        &self,
        candidates: Vec<ContractCreationCandidate>,
    ) -> impl Stream<Item = ExtractionProgress> + Send + '_ {
        let total = candidates.len();

        stream::iter(candidates)
            .map(move |candidate| async move {
                match self.probe(candidate.contract_address).await {
                    Ok(token_data) => Some(DiscoveredToken {
                        contract_address: candidate.contract_address,
                        transaction_hash: Some(candidate.hash),
                        token_data,
                        timestamp: candidate.timestamp,
                    }),
                    Err(e) => {
                        debug!("{} is not a token: {}", candidate.contract_address, e);
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .enumerate()
            .scan(0usize, move |found, (index, token)| {
                if token.is_some() {
                    *found += 1;
                }
                future::ready(Some(ExtractionProgress {
                    current: index + 1,
                    total,
                    found: *found,
                    token,
                }))
            })
    }

    /// Drain [`extract`](Self::extract) and keep only the tokens.
    pub async fn extract_all(
        &self,
        candidates: Vec<ContractCreationCandidate>,
    ) -> Vec<DiscoveredToken> {
        self.extract(candidates)
            .filter_map(|progress| future::ready(progress.token))
            .collect()
            .await
    }

    /// Read the full token interface from `address`. Fails if any single
    /// read fails.
    pub async fn probe(&self, address: Address) -> Result<TokenData> {
        let (name, symbol, decimals, total_supply, cap, logo, description) = tokio::try_join!(
            self.read(address, ICustomToken::nameCall {}),
            self.read(address, ICustomToken::symbolCall {}),
            self.read(address, ICustomToken::decimalsCall {}),
            self.read(address, ICustomToken::totalSupplyCall {}),
            self.read(address, ICustomToken::capCall {}),
            self.read(address, ICustomToken::logoUrlCall {}),
            self.read(address, ICustomToken::descriptionCall {}),
        )?;

        let decimals = decimals._0;
        let token = TokenData {
            name: name._0,
            symbol: symbol._0,
            decimals,
            initial_supply: utils::scale_down(total_supply._0, decimals)?,
            max_supply: utils::scale_down(cap._0, decimals)?,
            logo: logo._0,
            description: description._0,
        };

        if total_supply._0 > cap._0 {
            warn!(
                "{} reports a total supply above its cap ({} > {})",
                address, token.initial_supply, token.max_supply
            );
        }

        Ok(token)
    }

    async fn read<C>(&self, address: Address, call: C) -> Result<C::Return>
    where
        C: SolCall + Send + Sync,
    {
        let output = self
            .chain
            .call(address, call.abi_encode().into())
            .await
            .map_err(|e| anyhow!("{} failed on {}: {}", C::SIGNATURE, address, e))?;

        C::abi_decode_returns(&output, true)
            .map_err(|e| anyhow!("Failed to decode {} from {}: {}", C::SIGNATURE, address, e))
    }
}
