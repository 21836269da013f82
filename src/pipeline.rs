//! Mention pipeline orchestrator
//!
//! One logical worker per bot pulls mentions in delivery order and drives
//! each through parse -> authorize -> execute -> reply -> terminal mark.
//! Workers share no mutable state; the store is the serialization point and
//! the mention claim is the idempotency gate. A crash between execution and
//! the terminal mark is recoverable by replay: the duplicate claim routes to
//! the already-created trade/withdrawal row and only the reply is re-run.

use std::sync::Arc;
use std::time::Duration;

use backoff::future::retry;
use backoff::ExponentialBackoff;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{authorize, Decision};
use crate::collab::{IncomingMention, MentionSource, ReplySink};
use crate::command::{self, Command};
use crate::config::PipelineConfig;
use crate::engine::{ExecutionEngine, Outcome};
use crate::error::{Error, Result};
use crate::model::{ActionSource, Bot, Mention, ReplyStatus};
use crate::store::{NewMention, SqliteStore};
use crate::audit::AuditLog;

/// Deterministic idempotency key for the trade/withdrawal row created by a
/// mention, derived from the mention's external id
pub fn idempotency_key(external_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"mention:");
    hasher.update(external_id.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Top-level orchestrator
pub struct MentionPipeline {
    store: SqliteStore,
    engine: Arc<ExecutionEngine>,
    source: Arc<dyn MentionSource>,
    replies: Arc<dyn ReplySink>,
    audit: AuditLog,
    config: PipelineConfig,
}

impl MentionPipeline {
    pub fn new(
        store: SqliteStore,
        engine: Arc<ExecutionEngine>,
        source: Arc<dyn MentionSource>,
        replies: Arc<dyn ReplySink>,
        audit: AuditLog,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            engine,
            source,
            replies,
            audit,
            config,
        }
    }

    /// Spawn one worker per currently-active bot and run until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let bots = self.store.list_active_bots().await?;
        info!("Starting mention workers for {} active bot(s)", bots.len());

        let mut handles = Vec::with_capacity(bots.len());
        for bot in bots {
            let pipeline = Arc::clone(&self);
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pipeline.run_bot_worker(bot.id, token).await;
            }));
        }

        shutdown.cancelled().await;
        for handle in handles {
            let _ = handle.await;
        }
        info!("Mention pipeline stopped");
        Ok(())
    }

    /// Per-bot worker: poll, then process mentions strictly one at a time
    async fn run_bot_worker(&self, bot_id: String, shutdown: CancellationToken) {
        let mut last_seen: Option<String> = None;

        loop {
            // Reload so status/commander changes take effect next cycle
            let bot = match self.store.get_bot(&bot_id).await {
                Ok(bot) => bot,
                Err(Error::BotNotFound(_)) => {
                    info!(bot_id, "bot deleted, stopping worker");
                    return;
                }
                Err(e) => {
                    warn!(bot_id, "store error loading bot: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
                    }
                    continue;
                }
            };

            let mentions = match self.source.poll(&bot.name, last_seen.as_deref()).await {
                Ok(mentions) => mentions,
                Err(e) => {
                    warn!(bot = %bot.name, "mention poll failed: {}", e);
                    Vec::new()
                }
            };

            for mention in &mentions {
                if shutdown.is_cancelled() {
                    return;
                }
                match self.process_mention(&bot, mention).await {
                    Ok(()) => last_seen = Some(mention.external_id.clone()),
                    Err(e) => {
                        // Store/vault errors abort this mention; the next
                        // poll cycle retries it.
                        if e.is_vault_failure() {
                            error!(bot = %bot.name, "VAULT FAILURE, paging-worthy: {}", e);
                        } else {
                            warn!(bot = %bot.name, "mention processing aborted: {}", e);
                        }
                        break;
                    }
                }
            }

            let interval = if bot.poll_interval_secs > 0 {
                bot.poll_interval_secs
            } else {
                self.config.poll_interval_secs
            };
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(Duration::from_secs(interval)) => {}
            }
        }
    }

    /// Process one mention end to end
    pub async fn process_mention(&self, bot: &Bot, incoming: &IncomingMention) -> Result<()> {
        let mention = match self
            .store
            .claim_mention(NewMention {
                bot_id: bot.id.clone(),
                external_id: incoming.external_id.clone(),
                author_id: incoming.author_id.clone(),
                author_handle: incoming.author_handle.clone(),
                text: incoming.text.clone(),
            })
            .await
        {
            Ok(mention) => mention,
            Err(Error::DuplicateMention(external_id)) => {
                return self.replay_mention(bot, &external_id).await;
            }
            Err(e) => return Err(e),
        };

        let cmd = command::parse(&mention.text);
        self.store.record_parsed_command(&mention.id, &cmd).await?;
        debug!(
            bot = %bot.name,
            external_id = %mention.external_id,
            command = cmd.type_name(),
            "mention parsed"
        );

        self.dispatch(bot, &mention, &cmd).await
    }

    /// Redelivery or crash replay of an already-claimed mention
    ///
    /// Terminal mentions are a pure no-op; a mention still pending is pushed
    /// through the normal path again, where the engine's idempotency key
    /// lookup prevents re-execution.
    async fn replay_mention(&self, bot: &Bot, external_id: &str) -> Result<()> {
        let Some(mention) = self.store.mention_by_external_id(external_id).await? else {
            return Err(Error::Store(format!(
                "duplicate mention vanished: {}",
                external_id
            )));
        };

        if mention.reply_status.is_terminal() {
            self.audit
                .append(
                    Some(&bot.id),
                    "mention_duplicate",
                    json!({ "external_id": external_id }),
                    ActionSource::Mention,
                )
                .await?;
            debug!(external_id, "duplicate delivery of settled mention, no-op");
            return Ok(());
        }

        info!(external_id, "resuming interrupted mention");
        // Parse is pure, so re-parsing the stored text is deterministic.
        let cmd = command::parse(&mention.text);
        self.dispatch(bot, &mention, &cmd).await
    }

    async fn dispatch(&self, bot: &Bot, mention: &Mention, cmd: &Command) -> Result<()> {
        match authorize(bot, &mention.author_handle, cmd) {
            Decision::Reject { reason } => self.handle_reject(bot, mention, &reason).await,
            Decision::FastPath => self.handle_status_query(bot, mention).await,
            Decision::Admit(exec) => {
                let key = idempotency_key(&mention.external_id);
                let outcome = self
                    .engine
                    .execute(bot, &exec, Some(&key), ActionSource::Mention)
                    .await?;
                self.finish_with_reply(bot, mention, &reply_for_outcome(&outcome), true)
                    .await
            }
        }
    }

    async fn handle_reject(&self, bot: &Bot, mention: &Mention, reason: &str) -> Result<()> {
        self.audit
            .append(
                Some(&bot.id),
                "command_rejected",
                json!({
                    "external_id": mention.external_id,
                    "author": mention.author_handle,
                    "reason": reason,
                }),
                ActionSource::Mention,
            )
            .await?;

        let text = reply_for_rejection(reason);
        let reply_id = self.send_reply_with_retry(&mention.external_id, &text).await;
        // A rejection is a failed outcome for the mention regardless of
        // whether the explanatory reply got through.
        self.store
            .resolve_mention_reply(&mention.id, ReplyStatus::Failed, &text, reply_id.as_deref())
            .await?;
        Ok(())
    }

    /// Side-effect-free status reply; never touches the engine
    async fn handle_status_query(&self, bot: &Bot, mention: &Mention) -> Result<()> {
        let wallet = self.store.wallet_for_bot(&bot.id).await?;
        let recent = self.store.recent_trades(&bot.id, 5).await?;
        let confirmed = recent
            .iter()
            .filter(|t| t.status == crate::model::ExecStatus::Confirmed)
            .count();
        let text = format!(
            "Wallet {} | status: {} | {} of last {} trades confirmed",
            wallet.address,
            bot.status.as_str(),
            confirmed,
            recent.len()
        );
        self.finish_with_reply(bot, mention, &text, true).await
    }

    /// Send the terminal reply and settle the mention's reply outcome
    async fn finish_with_reply(
        &self,
        bot: &Bot,
        mention: &Mention,
        text: &str,
        audit_reply: bool,
    ) -> Result<()> {
        let reply_id = self.send_reply_with_retry(&mention.external_id, text).await;
        let status = if reply_id.is_some() {
            ReplyStatus::Sent
        } else {
            ReplyStatus::Failed
        };
        self.store
            .resolve_mention_reply(&mention.id, status, text, reply_id.as_deref())
            .await?;

        if audit_reply {
            self.audit
                .append(
                    Some(&bot.id),
                    if status == ReplyStatus::Sent {
                        "reply_sent"
                    } else {
                        "reply_failed"
                    },
                    json!({ "external_id": mention.external_id }),
                    ActionSource::Mention,
                )
                .await?;
        }
        Ok(())
    }

    /// Reply delivery with bounded exponential backoff; returns the reply id
    /// on success, None once the budget is spent
    async fn send_reply_with_retry(&self, in_reply_to: &str, text: &str) -> Option<String> {
        let max_elapsed = self.config.reply_retry_base_ms
            * (1u64 << self.config.reply_attempts.min(10));
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.reply_retry_base_ms),
            max_elapsed_time: Some(Duration::from_millis(max_elapsed)),
            ..Default::default()
        };

        let result = retry(policy, || async {
            match self.replies.send_reply(in_reply_to, text).await {
                Ok(reply_id) => Ok(reply_id),
                Err(e) if e.is_retryable() => {
                    warn!(in_reply_to, "retryable reply failure: {}", e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await;

        match result {
            Ok(reply_id) => Some(reply_id),
            Err(e) => {
                warn!(in_reply_to, "reply delivery gave up: {}", e);
                None
            }
        }
    }
}

fn reply_for_outcome(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Success { tx_hash } => format!("Done. Transaction: {}", tx_hash),
        Outcome::Failure { reason } => format!("Could not complete that: {}", reason),
    }
}

fn reply_for_rejection(reason: &str) -> String {
    if reason == "not authorized" {
        "Sorry, only my commander can ask me to do that.".to_string()
    } else {
        format!("Can't do that: {}", reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_is_deterministic() {
        let a = idempotency_key("ext-42");
        let b = idempotency_key("ext-42");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, idempotency_key("ext-43"));
    }

    #[test]
    fn test_rejection_reply_texts() {
        assert!(reply_for_rejection("not authorized").contains("commander"));
        assert!(reply_for_rejection("bot is paused").contains("bot is paused"));
    }

    #[test]
    fn test_outcome_reply_texts() {
        let ok = reply_for_outcome(&Outcome::Success {
            tx_hash: "abc".into(),
        });
        assert!(ok.contains("abc"));
        let bad = reply_for_outcome(&Outcome::Failure {
            reason: "confirmation timeout".into(),
        });
        assert!(bad.contains("confirmation timeout"));
    }
}
