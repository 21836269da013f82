//! Execution engine for admitted commands
//!
//! Drives a trade or withdrawal through `pending -> submitting ->
//! confirmed|failed` with bounded retries for transient failures. The signing
//! key is decrypted only for the duration of one submission and the plaintext
//! is zeroed when the scope ends. Every transition and every attempt writes
//! an audit entry.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::auth::ExecCommand;
use crate::collab::{ChainExecutor, Confirmation, TradeRequest, WithdrawalRequest};
use crate::command::TradeAmount;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::model::{ActionSource, Bot, ExecStatus, Trade, Withdrawal};
use crate::store::{NewTrade, NewWithdrawal, OpKind, SqliteStore};
use crate::vault::CredentialVault;

/// Terminal outcome of one command execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { tx_hash: String },
    Failure { reason: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// The operation row the engine is driving
enum OpRow {
    Trade(Trade),
    Withdrawal(Withdrawal),
}

impl OpRow {
    fn kind(&self) -> OpKind {
        match self {
            OpRow::Trade(_) => OpKind::Trade,
            OpRow::Withdrawal(_) => OpKind::Withdrawal,
        }
    }

    fn id(&self) -> &str {
        match self {
            OpRow::Trade(t) => &t.id,
            OpRow::Withdrawal(w) => &w.id,
        }
    }

    fn status(&self) -> ExecStatus {
        match self {
            OpRow::Trade(t) => t.status,
            OpRow::Withdrawal(w) => w.status,
        }
    }

    fn terminal_outcome(&self) -> Option<Outcome> {
        let (status, tx_hash, error) = match self {
            OpRow::Trade(t) => (t.status, &t.tx_hash, &t.error),
            OpRow::Withdrawal(w) => (w.status, &w.tx_hash, &w.error),
        };
        match status {
            ExecStatus::Confirmed => Some(Outcome::Success {
                tx_hash: tx_hash.clone().unwrap_or_default(),
            }),
            ExecStatus::Failed => Some(Outcome::Failure {
                reason: error.clone().unwrap_or_else(|| "failed".into()),
            }),
            _ => None,
        }
    }
}

/// Executes admitted commands against the chain collaborator
pub struct ExecutionEngine {
    store: SqliteStore,
    vault: Arc<CredentialVault>,
    executor: Arc<dyn ChainExecutor>,
    audit: AuditLog,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        store: SqliteStore,
        vault: Arc<CredentialVault>,
        executor: Arc<dyn ChainExecutor>,
        audit: AuditLog,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            vault,
            executor,
            audit,
            config,
        }
    }

    /// Drive a command to a terminal outcome
    ///
    /// With an idempotency key, replays are detected against the existing
    /// row: a terminal row returns its recorded outcome without touching the
    /// chain, a row caught mid-submission is resolved to failed (never
    /// silently to confirmed), and a row that never left `pending` is
    /// resumed.
    pub async fn execute(
        &self,
        bot: &Bot,
        command: &ExecCommand,
        idempotency_key: Option<&str>,
        source: ActionSource,
    ) -> Result<Outcome> {
        let row = match self.find_existing(command, idempotency_key).await? {
            Some(existing) => {
                if let Some(outcome) = existing.terminal_outcome() {
                    info!(
                        op = existing.kind().entity(),
                        id = existing.id(),
                        "replay of completed command, skipping execution"
                    );
                    return Ok(outcome);
                }
                if existing.status() == ExecStatus::Submitting {
                    // May already be broadcast; resolving to confirmed here
                    // would risk double submission on the next command.
                    let reason = "interrupted before confirmation";
                    self.fail_op(existing.kind(), existing.id(), bot, reason, source)
                        .await?;
                    return Ok(Outcome::Failure {
                        reason: reason.into(),
                    });
                }
                existing
            }
            None => self.create_row(bot, command, idempotency_key, source).await?,
        };

        self.run_attempts(bot, command, row, source).await
    }

    async fn find_existing(
        &self,
        command: &ExecCommand,
        idempotency_key: Option<&str>,
    ) -> Result<Option<OpRow>> {
        let Some(key) = idempotency_key else {
            return Ok(None);
        };
        match command {
            ExecCommand::Trade { .. } => Ok(self
                .store
                .find_trade_by_idempotency_key(key)
                .await?
                .map(OpRow::Trade)),
            ExecCommand::Withdraw { .. } => Ok(self
                .store
                .find_withdrawal_by_idempotency_key(key)
                .await?
                .map(OpRow::Withdrawal)),
        }
    }

    async fn create_row(
        &self,
        bot: &Bot,
        command: &ExecCommand,
        idempotency_key: Option<&str>,
        source: ActionSource,
    ) -> Result<OpRow> {
        let row = match command {
            ExecCommand::Trade {
                direction,
                token,
                amount,
            } => {
                let (amount_sol, amount_tokens) = match amount {
                    TradeAmount::Sol(v) => (Some(*v), None),
                    TradeAmount::Tokens(v) => (None, Some(*v)),
                };
                let trade = self
                    .store
                    .insert_trade(NewTrade {
                        bot_id: bot.id.clone(),
                        idempotency_key: idempotency_key.map(str::to_string),
                        direction: *direction,
                        token: token.clone(),
                        amount_sol,
                        amount_tokens,
                        source,
                    })
                    .await?;
                OpRow::Trade(trade)
            }
            ExecCommand::Withdraw {
                destination,
                amount_sol,
            } => {
                let withdrawal = self
                    .store
                    .insert_withdrawal(NewWithdrawal {
                        bot_id: bot.id.clone(),
                        idempotency_key: idempotency_key.map(str::to_string),
                        destination: destination.clone(),
                        amount_sol: *amount_sol,
                        source,
                    })
                    .await?;
                OpRow::Withdrawal(withdrawal)
            }
        };

        self.audit
            .append(
                Some(&bot.id),
                &format!("{}_created", row.kind().entity()),
                json!({ "id": row.id() }),
                source,
            )
            .await?;
        Ok(row)
    }

    /// Bounded attempt loop: transient errors retry with quadratic backoff,
    /// fatal errors terminate immediately, vault and store errors propagate
    /// to the orchestrator untouched.
    async fn run_attempts(
        &self,
        bot: &Bot,
        command: &ExecCommand,
        row: OpRow,
        source: ActionSource,
    ) -> Result<Outcome> {
        let kind = row.kind();
        let op_id = row.id().to_string();
        let wallet = self.store.wallet_for_bot(&bot.id).await?;

        for attempt in 1..=self.config.max_attempts {
            // Decrypt before entering `submitting`, so a vault failure on the
            // first attempt leaves the row resumable.
            let signing_key = match self.vault.decrypt_signing_key(&wallet.encrypted_key) {
                Ok(key) => key,
                Err(e) => {
                    error!(bot = %bot.name, "vault failure during signing: {}", e);
                    return Err(e);
                }
            };

            self.store
                .transition_op(kind, &op_id, ExecStatus::Submitting, None, None)
                .await?;
            self.audit
                .append(
                    Some(&bot.id),
                    &format!("{}_submitting", kind.entity()),
                    json!({ "id": op_id, "attempt": attempt }),
                    source,
                )
                .await?;

            let submitted = match command {
                ExecCommand::Trade {
                    direction,
                    token,
                    amount,
                } => {
                    let (amount_sol, amount_tokens) = match amount {
                        TradeAmount::Sol(v) => (Some(*v), None),
                        TradeAmount::Tokens(v) => (None, Some(*v)),
                    };
                    let request = TradeRequest {
                        direction: *direction,
                        token: token.clone(),
                        amount_sol,
                        amount_tokens,
                    };
                    self.executor
                        .submit_trade(signing_key.keypair(), &request)
                        .await
                }
                ExecCommand::Withdraw {
                    destination,
                    amount_sol,
                } => {
                    let request = WithdrawalRequest {
                        destination: destination.clone(),
                        amount_sol: *amount_sol,
                    };
                    self.executor
                        .submit_withdrawal(signing_key.keypair(), &request)
                        .await
                }
            };
            // Plaintext key bytes are zeroed here, on every path.
            drop(signing_key);

            match submitted {
                Ok(tx_hash) => {
                    return self
                        .await_confirmation(bot, kind, &op_id, &tx_hash, source)
                        .await;
                }
                Err(e) if e.is_vault_failure() => return Err(e),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    warn!(
                        op = kind.entity(),
                        id = %op_id,
                        attempt,
                        "transient submission failure: {}",
                        e
                    );
                    self.audit
                        .append(
                            Some(&bot.id),
                            &format!("{}_attempt_failed", kind.entity()),
                            json!({ "id": op_id, "attempt": attempt, "error": e.to_string() }),
                            source,
                        )
                        .await?;
                    // 1s, 4s, 9s for the default base delay
                    let delay = self.config.retry_base_delay_ms * (attempt as u64).pow(2);
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(e) if e.is_retryable() => {
                    let reason = format!("retries exhausted: {}", e);
                    self.audit
                        .append(
                            Some(&bot.id),
                            &format!("{}_attempt_failed", kind.entity()),
                            json!({ "id": op_id, "attempt": attempt, "error": e.to_string() }),
                            source,
                        )
                        .await?;
                    self.fail_op(kind, &op_id, bot, &reason, source).await?;
                    return Ok(Outcome::Failure { reason });
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.fail_op(kind, &op_id, bot, &reason, source).await?;
                    return Ok(Outcome::Failure { reason });
                }
            }
        }

        // Loop always returns from the final attempt.
        Err(Error::Internal("attempt loop exited without outcome".into()))
    }

    /// Poll the collaborator's confirmation signal until confirmed, failed,
    /// or the configured timeout; a timeout ends as failed, reconciliation is
    /// the caller's job, never a re-broadcast.
    async fn await_confirmation(
        &self,
        bot: &Bot,
        kind: OpKind,
        op_id: &str,
        tx_hash: &str,
        source: ActionSource,
    ) -> Result<Outcome> {
        let deadline =
            Instant::now() + Duration::from_millis(self.config.confirmation_timeout_ms);
        let poll = Duration::from_millis(self.config.confirmation_poll_ms);

        loop {
            match self.executor.confirmation(tx_hash).await {
                Ok(Confirmation::Confirmed) => {
                    self.store
                        .transition_op(kind, op_id, ExecStatus::Confirmed, Some(tx_hash), None)
                        .await?;
                    self.audit
                        .append(
                            Some(&bot.id),
                            &format!("{}_confirmed", kind.entity()),
                            json!({ "id": op_id, "tx_hash": tx_hash }),
                            source,
                        )
                        .await?;
                    info!(op = kind.entity(), id = %op_id, tx_hash, "confirmed");
                    return Ok(Outcome::Success {
                        tx_hash: tx_hash.to_string(),
                    });
                }
                Ok(Confirmation::Failed) => {
                    let reason = "transaction failed on-chain".to_string();
                    self.store
                        .transition_op(
                            kind,
                            op_id,
                            ExecStatus::Failed,
                            Some(tx_hash),
                            Some(&reason),
                        )
                        .await?;
                    self.audit
                        .append(
                            Some(&bot.id),
                            &format!("{}_failed", kind.entity()),
                            json!({ "id": op_id, "tx_hash": tx_hash, "reason": reason }),
                            source,
                        )
                        .await?;
                    return Ok(Outcome::Failure { reason });
                }
                Ok(Confirmation::Pending) => {}
                Err(e) if e.is_retryable() => {
                    warn!(tx_hash, "confirmation poll failed, will retry: {}", e);
                }
                Err(e) => return Err(e),
            }

            if Instant::now() + poll > deadline {
                let reason = "confirmation timeout".to_string();
                self.store
                    .transition_op(kind, op_id, ExecStatus::Failed, Some(tx_hash), Some(&reason))
                    .await?;
                self.audit
                    .append(
                        Some(&bot.id),
                        &format!("{}_failed", kind.entity()),
                        json!({ "id": op_id, "tx_hash": tx_hash, "reason": reason }),
                        source,
                    )
                    .await?;
                return Ok(Outcome::Failure { reason });
            }
            sleep(poll).await;
        }
    }

    async fn fail_op(
        &self,
        kind: OpKind,
        op_id: &str,
        bot: &Bot,
        reason: &str,
        source: ActionSource,
    ) -> Result<()> {
        self.store
            .transition_op(kind, op_id, ExecStatus::Failed, None, Some(reason))
            .await?;
        self.audit
            .append(
                Some(&bot.id),
                &format!("{}_failed", kind.entity()),
                json!({ "id": op_id, "reason": reason }),
                source,
            )
            .await?;
        Ok(())
    }

    /// Watchdog pass: resolve rows stuck in `submitting` past the timeout
    ///
    /// Run on startup (and on demand via the CLI). Stuck rows are resolved to
    /// failed, never to confirmed.
    pub async fn reconcile_stuck(&self) -> Result<usize> {
        let cutoff =
            chrono::Utc::now() - chrono::Duration::seconds(self.config.stuck_submitting_secs);
        let mut resolved = 0;

        for kind in [OpKind::Trade, OpKind::Withdrawal] {
            for (op_id, bot_id) in self.store.stuck_submitting(kind, cutoff).await? {
                let reason = "stuck in submitting past timeout";
                self.store
                    .transition_op(kind, &op_id, ExecStatus::Failed, None, Some(reason))
                    .await?;
                self.audit
                    .append(
                        Some(&bot_id),
                        "reconcile_stuck",
                        json!({ "op": kind.entity(), "id": op_id, "reason": reason }),
                        ActionSource::System,
                    )
                    .await?;
                warn!(op = kind.entity(), id = %op_id, "reconciled stuck row to failed");
                resolved += 1;
            }
        }
        Ok(resolved)
    }
}
