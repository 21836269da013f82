//! Domain entities persisted by the store
//!
//! Status fields are stored as their snake_case string forms; transitions
//! into `confirmed`/`failed` are one-way and enforced by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bot lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Paused,
    Active,
    Suspended,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Paused => "paused",
            BotStatus::Active => "active",
            BotStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "paused" => Ok(BotStatus::Paused),
            "active" => Ok(BotStatus::Active),
            "suspended" => Ok(BotStatus::Suspended),
            other => Err(Error::Store(format!("unknown bot status: {}", other))),
        }
    }
}

/// One autonomous agent
#[derive(Debug, Clone)]
pub struct Bot {
    pub id: String,
    pub name: String,
    pub personality: String,
    /// Social handle allowed to issue financial commands via mentions
    pub commander_handle: String,
    pub post_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub status: BotStatus,
    pub created_at: DateTime<Utc>,
}

/// Custodial wallet, exactly one per bot
#[derive(Debug, Clone)]
pub struct Wallet {
    pub id: String,
    pub bot_id: String,
    /// Public address, safe to expose
    pub address: String,
    /// AEAD envelope (`enc:v1:<nonce>:<ciphertext>`), never decrypted to rest-storage
    pub encrypted_key: String,
    pub created_at: DateTime<Utc>,
}

/// Linked social account, at most one per bot
#[derive(Debug, Clone)]
pub struct SocialAccount {
    pub id: String,
    pub bot_id: String,
    pub external_user_id: String,
    pub handle: String,
    pub encrypted_access_token: String,
    pub encrypted_refresh_token: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Reply outcome of a mention, transitions exactly once from pending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Pending,
    Sent,
    Failed,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Pending => "pending",
            ReplyStatus::Sent => "sent",
            ReplyStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ReplyStatus::Pending),
            "sent" => Ok(ReplyStatus::Sent),
            "failed" => Ok(ReplyStatus::Failed),
            other => Err(Error::Store(format!("unknown reply status: {}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReplyStatus::Pending)
    }
}

/// Inbound mention addressed to a bot. The external id is the idempotency key.
#[derive(Debug, Clone)]
pub struct Mention {
    pub id: String,
    pub bot_id: String,
    pub external_id: String,
    pub author_id: String,
    pub author_handle: String,
    pub text: String,
    pub is_command: bool,
    pub command_type: Option<String>,
    /// Parsed command, validated once at parse time and stored as JSON
    pub command_json: Option<String>,
    pub reply_status: ReplyStatus,
    pub reply_text: Option<String>,
    pub reply_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Execution status of a trade or withdrawal
///
/// `submitting` is internal to the engine; `confirmed` and `failed` are
/// terminal and never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Pending,
    Submitting,
    Confirmed,
    Failed,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Pending => "pending",
            ExecStatus::Submitting => "submitting",
            ExecStatus::Confirmed => "confirmed",
            ExecStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ExecStatus::Pending),
            "submitting" => Ok(ExecStatus::Submitting),
            "confirmed" => Ok(ExecStatus::Confirmed),
            "failed" => Ok(ExecStatus::Failed),
            other => Err(Error::Store(format!("unknown exec status: {}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecStatus::Confirmed | ExecStatus::Failed)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Buy => "buy",
            TradeDirection::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "buy" => Ok(TradeDirection::Buy),
            "sell" => Ok(TradeDirection::Sell),
            other => Err(Error::Store(format!("unknown trade direction: {}", other))),
        }
    }
}

/// What triggered an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSource {
    Dashboard,
    Mention,
    System,
}

impl ActionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionSource::Dashboard => "dashboard",
            ActionSource::Mention => "mention",
            ActionSource::System => "system",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "dashboard" => Ok(ActionSource::Dashboard),
            "mention" => Ok(ActionSource::Mention),
            "system" => Ok(ActionSource::System),
            other => Err(Error::Store(format!("unknown action source: {}", other))),
        }
    }
}

/// One execution attempt of a buy/sell command
///
/// Exactly one of `amount_sol`/`amount_tokens` is set (parse-time and
/// schema-level invariant).
#[derive(Debug, Clone)]
pub struct Trade {
    pub id: String,
    pub bot_id: String,
    /// Derived from the triggering mention's external id; None for dashboard trades
    pub idempotency_key: Option<String>,
    pub direction: TradeDirection,
    pub token: String,
    pub amount_sol: Option<f64>,
    pub amount_tokens: Option<f64>,
    pub tx_hash: Option<String>,
    pub source: ActionSource,
    pub status: ExecStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One execution attempt of a withdrawal command
#[derive(Debug, Clone)]
pub struct Withdrawal {
    pub id: String,
    pub bot_id: String,
    pub idempotency_key: Option<String>,
    pub destination: String,
    pub amount_sol: f64,
    pub tx_hash: Option<String>,
    pub source: ActionSource,
    pub status: ExecStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An outbound post authored by the agent itself
#[derive(Debug, Clone)]
pub struct Post {
    pub id: String,
    pub bot_id: String,
    pub text: String,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub bot_id: Option<String>,
    pub action: String,
    pub details: serde_json::Value,
    pub source: ActionSource,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for s in [
            ExecStatus::Pending,
            ExecStatus::Submitting,
            ExecStatus::Confirmed,
            ExecStatus::Failed,
        ] {
            assert_eq!(ExecStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(ExecStatus::parse("exploded").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ExecStatus::Confirmed.is_terminal());
        assert!(ExecStatus::Failed.is_terminal());
        assert!(!ExecStatus::Submitting.is_terminal());
        assert!(ReplyStatus::Sent.is_terminal());
        assert!(!ReplyStatus::Pending.is_terminal());
    }
}
