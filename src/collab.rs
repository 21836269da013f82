//! External collaborator interfaces
//!
//! The pipeline consumes the social network, the reply channel, and the
//! chain executor through these traits. Everything arriving from them is
//! untrusted and gets validated by the parser and the guard.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use tracing::info;

use crate::error::Result;
use crate::model::TradeDirection;

/// A mention as delivered by the social network, before any validation
#[derive(Debug, Clone)]
pub struct IncomingMention {
    pub external_id: String,
    pub author_id: String,
    pub author_handle: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Trade instruction handed to the chain executor
#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub direction: TradeDirection,
    pub token: String,
    pub amount_sol: Option<f64>,
    pub amount_tokens: Option<f64>,
}

/// Withdrawal instruction handed to the chain executor
#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    pub destination: String,
    pub amount_sol: f64,
}

/// Confirmation signal for a broadcast transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Pending,
    Failed,
}

/// Ordered source of inbound mentions for one bot
#[async_trait]
pub trait MentionSource: Send + Sync {
    /// Fetch mentions newer than the given external id, in delivery order
    async fn poll(&self, bot_handle: &str, since_id: Option<&str>)
        -> Result<Vec<IncomingMention>>;
}

/// Outbound reply channel
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Post a reply; returns the created reply's external id
    async fn send_reply(&self, in_reply_to: &str, text: &str) -> Result<String>;
}

/// DEX swap / on-chain transfer executor
#[async_trait]
pub trait ChainExecutor: Send + Sync {
    async fn submit_trade(&self, signer: &Keypair, request: &TradeRequest) -> Result<String>;
    async fn submit_withdrawal(
        &self,
        signer: &Keypair,
        request: &WithdrawalRequest,
    ) -> Result<String>;
    async fn confirmation(&self, tx_hash: &str) -> Result<Confirmation>;
}

/// Executor that fabricates deterministic tx hashes instead of broadcasting
///
/// Used by `start --dry-run` and anywhere a real chain integration is not
/// wired up yet.
pub struct DryRunExecutor;

fn fake_tx_hash(tag: &str, signer: &Keypair, detail: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    hasher.update(signer.pubkey().as_ref());
    hasher.update(detail);
    bs58::encode(hasher.finalize()).into_string()
}

#[async_trait]
impl ChainExecutor for DryRunExecutor {
    async fn submit_trade(&self, signer: &Keypair, request: &TradeRequest) -> Result<String> {
        let tx_hash = fake_tx_hash("trade", signer, &request.token);
        info!(
            direction = request.direction.as_str(),
            token = %request.token,
            tx_hash = %tx_hash,
            "DRY-RUN trade, nothing broadcast"
        );
        Ok(tx_hash)
    }

    async fn submit_withdrawal(
        &self,
        signer: &Keypair,
        request: &WithdrawalRequest,
    ) -> Result<String> {
        let tx_hash = fake_tx_hash("withdrawal", signer, &request.destination);
        info!(
            destination = %request.destination,
            amount_sol = request.amount_sol,
            tx_hash = %tx_hash,
            "DRY-RUN withdrawal, nothing broadcast"
        );
        Ok(tx_hash)
    }

    async fn confirmation(&self, _tx_hash: &str) -> Result<Confirmation> {
        Ok(Confirmation::Confirmed)
    }
}

/// Mention source that never yields anything
///
/// Stands in until a real social integration is configured; keeps the
/// orchestrator loop runnable end to end.
pub struct NullMentionSource;

#[async_trait]
impl MentionSource for NullMentionSource {
    async fn poll(
        &self,
        _bot_handle: &str,
        _since_id: Option<&str>,
    ) -> Result<Vec<IncomingMention>> {
        Ok(Vec::new())
    }
}

/// Reply sink that logs instead of posting
pub struct LogReplySink;

#[async_trait]
impl ReplySink for LogReplySink {
    async fn send_reply(&self, in_reply_to: &str, text: &str) -> Result<String> {
        info!(in_reply_to, text, "reply (log sink)");
        Ok(format!("log-{}", in_reply_to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_hashes_are_deterministic() {
        let executor = DryRunExecutor;
        let signer = Keypair::new();
        let request = TradeRequest {
            direction: TradeDirection::Buy,
            token: "So11111111111111111111111111111111111111112".into(),
            amount_sol: Some(1.0),
            amount_tokens: None,
        };

        let a = executor.submit_trade(&signer, &request).await.unwrap();
        let b = executor.submit_trade(&signer, &request).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(
            executor.confirmation(&a).await.unwrap(),
            Confirmation::Confirmed
        );
    }
}
