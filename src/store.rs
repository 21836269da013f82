//! SQLite-backed relational store
//!
//! The store is the serialization point of the whole pipeline: the
//! "already processed?" check on a mention's external id is an atomic
//! INSERT guarded by a unique constraint, and Trade/Withdrawal status
//! updates are guarded so terminal rows can never be resurrected.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::command::Command;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::model::{
    ActionSource, Bot, BotStatus, ExecStatus, Mention, Post, ReplyStatus, SocialAccount, Trade,
    TradeDirection, Wallet, Withdrawal,
};

/// Which operation table a status transition targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Trade,
    Withdrawal,
}

impl OpKind {
    fn table(&self) -> &'static str {
        match self {
            OpKind::Trade => "trades",
            OpKind::Withdrawal => "withdrawals",
        }
    }

    pub fn entity(&self) -> &'static str {
        match self {
            OpKind::Trade => "trade",
            OpKind::Withdrawal => "withdrawal",
        }
    }
}

/// Parameters for creating a bot
#[derive(Debug, Clone)]
pub struct NewBot {
    pub name: String,
    pub personality: String,
    pub commander_handle: String,
    pub post_interval_secs: u64,
    pub poll_interval_secs: u64,
}

/// Parameters for claiming an inbound mention
#[derive(Debug, Clone)]
pub struct NewMention {
    pub bot_id: String,
    pub external_id: String,
    pub author_id: String,
    pub author_handle: String,
    pub text: String,
}

/// Parameters for creating a trade row
#[derive(Debug, Clone)]
pub struct NewTrade {
    pub bot_id: String,
    pub idempotency_key: Option<String>,
    pub direction: TradeDirection,
    pub token: String,
    pub amount_sol: Option<f64>,
    pub amount_tokens: Option<f64>,
    pub source: ActionSource,
}

/// Parameters for creating a withdrawal row
#[derive(Debug, Clone)]
pub struct NewWithdrawal {
    pub bot_id: String,
    pub idempotency_key: Option<String>,
    pub destination: String,
    pub amount_sol: f64,
    pub source: ActionSource,
}

/// Fixed-width UTC timestamp so string comparison matches time order
pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("bad timestamp {:?}: {}", s, e)))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// SQLite store shared by all pipeline components
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at the configured path
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(opts)
            .await?;

        set_db_file_permissions(&config.db_path);

        let store = Self { pool };
        store.migrate().await?;
        info!("Store ready at {}", config.db_path);
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema setup
    async fn migrate(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                personality TEXT NOT NULL DEFAULT '',
                commander_handle TEXT NOT NULL,
                post_interval_secs INTEGER NOT NULL,
                poll_interval_secs INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'paused',
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS wallets (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL UNIQUE REFERENCES bots(id),
                address TEXT NOT NULL,
                encrypted_key TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS social_accounts (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL UNIQUE REFERENCES bots(id),
                external_user_id TEXT NOT NULL,
                handle TEXT NOT NULL,
                encrypted_access_token TEXT NOT NULL,
                encrypted_refresh_token TEXT NOT NULL,
                token_expires_at TEXT,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS mentions (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id),
                external_id TEXT NOT NULL UNIQUE,
                author_id TEXT NOT NULL,
                author_handle TEXT NOT NULL,
                text TEXT NOT NULL,
                is_command INTEGER NOT NULL DEFAULT 0,
                command_type TEXT,
                command_json TEXT,
                reply_status TEXT NOT NULL DEFAULT 'pending',
                reply_text TEXT,
                reply_id TEXT,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id),
                idempotency_key TEXT UNIQUE,
                direction TEXT NOT NULL,
                token TEXT NOT NULL,
                amount_sol REAL,
                amount_tokens REAL,
                tx_hash TEXT,
                source TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK ((amount_sol IS NULL) <> (amount_tokens IS NULL))
            )",
            "CREATE TABLE IF NOT EXISTS withdrawals (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id),
                idempotency_key TEXT UNIQUE,
                destination TEXT NOT NULL,
                amount_sol REAL NOT NULL,
                tx_hash TEXT,
                source TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS posts (
                id TEXT PRIMARY KEY,
                bot_id TEXT NOT NULL REFERENCES bots(id),
                text TEXT NOT NULL,
                external_id TEXT,
                created_at TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT,
                action TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT '{}',
                source TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_mentions_bot ON mentions(bot_id)",
            "CREATE INDEX IF NOT EXISTS idx_trades_bot ON trades(bot_id)",
            "CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)",
            "CREATE INDEX IF NOT EXISTS idx_withdrawals_status ON withdrawals(status)",
            "CREATE INDEX IF NOT EXISTS idx_audit_bot ON audit_log(bot_id)",
            "CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ===== Bots =====

    /// Create a bot together with its wallet, atomically
    pub async fn create_bot(
        &self,
        new: NewBot,
        wallet_address: &str,
        encrypted_key: &str,
    ) -> Result<(Bot, Wallet)> {
        let bot_id = Uuid::new_v4().to_string();
        let wallet_id = Uuid::new_v4().to_string();
        let now = now_str();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO bots (id, name, personality, commander_handle,
                post_interval_secs, poll_interval_secs, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, 'paused', ?)",
        )
        .bind(&bot_id)
        .bind(&new.name)
        .bind(&new.personality)
        .bind(&new.commander_handle)
        .bind(new.post_interval_secs as i64)
        .bind(new.poll_interval_secs as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Store(format!("bot name already taken: {}", new.name))
            } else {
                e.into()
            }
        })?;

        sqlx::query(
            "INSERT INTO wallets (id, bot_id, address, encrypted_key, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&wallet_id)
        .bind(&bot_id)
        .bind(wallet_address)
        .bind(encrypted_key)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let bot = self.get_bot(&bot_id).await?;
        let wallet = self.wallet_for_bot(&bot_id).await?;
        Ok((bot, wallet))
    }

    pub async fn get_bot(&self, id: &str) -> Result<Bot> {
        let row = sqlx::query("SELECT * FROM bots WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::BotNotFound(id.to_string()))?;
        bot_from_row(&row)
    }

    pub async fn get_bot_by_name(&self, name: &str) -> Result<Bot> {
        let row = sqlx::query("SELECT * FROM bots WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::BotNotFound(name.to_string()))?;
        bot_from_row(&row)
    }

    pub async fn list_bots(&self) -> Result<Vec<Bot>> {
        let rows = sqlx::query("SELECT * FROM bots ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(bot_from_row).collect()
    }

    pub async fn list_active_bots(&self) -> Result<Vec<Bot>> {
        let rows = sqlx::query("SELECT * FROM bots WHERE status = 'active' ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(bot_from_row).collect()
    }

    pub async fn set_bot_status(&self, id: &str, status: BotStatus) -> Result<()> {
        let result = sqlx::query("UPDATE bots SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::BotNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete a bot and everything it owns in one all-or-nothing transaction
    ///
    /// Ordered: audit rows, posts, mentions, withdrawals, trades, social
    /// account, wallet, bot.
    pub async fn delete_bot_cascade(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for sql in [
            "DELETE FROM audit_log WHERE bot_id = ?",
            "DELETE FROM posts WHERE bot_id = ?",
            "DELETE FROM mentions WHERE bot_id = ?",
            "DELETE FROM withdrawals WHERE bot_id = ?",
            "DELETE FROM trades WHERE bot_id = ?",
            "DELETE FROM social_accounts WHERE bot_id = ?",
            "DELETE FROM wallets WHERE bot_id = ?",
        ] {
            sqlx::query(sql).bind(id).execute(&mut *tx).await?;
        }

        let result = sqlx::query("DELETE FROM bots WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::BotNotFound(id.to_string()));
        }

        tx.commit().await?;
        warn!("Deleted bot {} and all owned entities", id);
        Ok(())
    }

    // ===== Wallets and social accounts =====

    pub async fn wallet_for_bot(&self, bot_id: &str) -> Result<Wallet> {
        let row = sqlx::query("SELECT * FROM wallets WHERE bot_id = ?")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::WalletNotFound(bot_id.to_string()))?;
        wallet_from_row(&row)
    }

    /// Create or refresh the bot's linked social account (at most one per bot)
    pub async fn link_social_account(
        &self,
        bot_id: &str,
        external_user_id: &str,
        handle: &str,
        encrypted_access_token: &str,
        encrypted_refresh_token: &str,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO social_accounts
                (id, bot_id, external_user_id, handle,
                 encrypted_access_token, encrypted_refresh_token,
                 token_expires_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(bot_id) DO UPDATE SET
                external_user_id = excluded.external_user_id,
                handle = excluded.handle,
                encrypted_access_token = excluded.encrypted_access_token,
                encrypted_refresh_token = excluded.encrypted_refresh_token,
                token_expires_at = excluded.token_expires_at,
                updated_at = excluded.updated_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(bot_id)
        .bind(external_user_id)
        .bind(handle)
        .bind(encrypted_access_token)
        .bind(encrypted_refresh_token)
        .bind(token_expires_at.map(format_ts))
        .bind(now_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn social_account_for_bot(&self, bot_id: &str) -> Result<Option<SocialAccount>> {
        let row = sqlx::query("SELECT * FROM social_accounts WHERE bot_id = ?")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(social_account_from_row).transpose()
    }

    // ===== Mentions =====

    /// Atomically claim a mention by its external id
    ///
    /// A second delivery of the same id hits the unique constraint and maps
    /// to `DuplicateMention`; this is the race-free idempotency gate.
    pub async fn claim_mention(&self, new: NewMention) -> Result<Mention> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO mentions
                (id, bot_id, external_id, author_id, author_handle, text, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.bot_id)
        .bind(&new.external_id)
        .bind(&new.author_id)
        .bind(&new.author_handle)
        .bind(&new.text)
        .bind(now_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::DuplicateMention(new.external_id.clone())
            } else {
                e.into()
            }
        })?;
        self.get_mention(&id).await
    }

    pub async fn get_mention(&self, id: &str) -> Result<Mention> {
        let row = sqlx::query("SELECT * FROM mentions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::Store(format!("mention not found: {}", id)))?;
        mention_from_row(&row)
    }

    pub async fn mention_by_external_id(&self, external_id: &str) -> Result<Option<Mention>> {
        let row = sqlx::query("SELECT * FROM mentions WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(mention_from_row).transpose()
    }

    /// Record the parse result on the claimed mention
    pub async fn record_parsed_command(&self, mention_id: &str, command: &Command) -> Result<()> {
        sqlx::query(
            "UPDATE mentions SET is_command = ?, command_type = ?, command_json = ?
             WHERE id = ?",
        )
        .bind(command.is_executable() as i64)
        .bind(command.type_name())
        .bind(serde_json::to_string(command)?)
        .bind(mention_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move a mention's reply outcome from pending to a terminal value
    ///
    /// Returns false (without touching the row) if the outcome is already
    /// terminal, so replaying a processed mention stays a no-op.
    pub async fn resolve_mention_reply(
        &self,
        mention_id: &str,
        status: ReplyStatus,
        reply_text: &str,
        reply_id: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let result = sqlx::query(
            "UPDATE mentions SET reply_status = ?, reply_text = ?, reply_id = ?
             WHERE id = ? AND reply_status = 'pending'",
        )
        .bind(status.as_str())
        .bind(reply_text)
        .bind(reply_id)
        .bind(mention_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ===== Trades and withdrawals =====

    pub async fn insert_trade(&self, new: NewTrade) -> Result<Trade> {
        let id = Uuid::new_v4().to_string();
        let now = now_str();
        sqlx::query(
            "INSERT INTO trades
                (id, bot_id, idempotency_key, direction, token,
                 amount_sol, amount_tokens, source, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&id)
        .bind(&new.bot_id)
        .bind(&new.idempotency_key)
        .bind(new.direction.as_str())
        .bind(&new.token)
        .bind(new.amount_sol)
        .bind(new.amount_tokens)
        .bind(new.source.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::DuplicateMention(new.idempotency_key.clone().unwrap_or_default())
            } else {
                e.into()
            }
        })?;
        self.get_trade(&id).await
    }

    pub async fn insert_withdrawal(&self, new: NewWithdrawal) -> Result<Withdrawal> {
        let id = Uuid::new_v4().to_string();
        let now = now_str();
        sqlx::query(
            "INSERT INTO withdrawals
                (id, bot_id, idempotency_key, destination, amount_sol,
                 source, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
        )
        .bind(&id)
        .bind(&new.bot_id)
        .bind(&new.idempotency_key)
        .bind(&new.destination)
        .bind(new.amount_sol)
        .bind(new.source.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::DuplicateMention(new.idempotency_key.clone().unwrap_or_default())
            } else {
                e.into()
            }
        })?;
        self.get_withdrawal(&id).await
    }

    pub async fn get_trade(&self, id: &str) -> Result<Trade> {
        let row = sqlx::query("SELECT * FROM trades WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::Store(format!("trade not found: {}", id)))?;
        trade_from_row(&row)
    }

    pub async fn get_withdrawal(&self, id: &str) -> Result<Withdrawal> {
        let row = sqlx::query("SELECT * FROM withdrawals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::Store(format!("withdrawal not found: {}", id)))?;
        withdrawal_from_row(&row)
    }

    pub async fn find_trade_by_idempotency_key(&self, key: &str) -> Result<Option<Trade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(trade_from_row).transpose()
    }

    pub async fn find_withdrawal_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Withdrawal>> {
        let row = sqlx::query("SELECT * FROM withdrawals WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(withdrawal_from_row).transpose()
    }

    pub async fn recent_trades(&self, bot_id: &str, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE bot_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(bot_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trade_from_row).collect()
    }

    /// One-way status transition for a trade or withdrawal
    ///
    /// Terminal rows are never mutated: the UPDATE is guarded and a zero-row
    /// result surfaces as `TerminalStatus` rather than silently succeeding.
    pub async fn transition_op(
        &self,
        kind: OpKind,
        id: &str,
        to: ExecStatus,
        tx_hash: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = ?, tx_hash = COALESCE(?, tx_hash),
                error = ?, updated_at = ?
             WHERE id = ? AND status NOT IN ('confirmed', 'failed')",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(tx_hash)
            .bind(error)
            .bind(now_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::TerminalStatus {
                entity: kind.entity(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Rows stuck in `submitting` since before the cutoff
    ///
    /// Returned as (id, bot_id) pairs for the watchdog to resolve to failed.
    pub async fn stuck_submitting(
        &self,
        kind: OpKind,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>> {
        let sql = format!(
            "SELECT id, bot_id FROM {} WHERE status = 'submitting' AND updated_at < ?",
            kind.table()
        );
        let rows = sqlx::query(&sql)
            .bind(format_ts(cutoff))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get::<String, _>("id")?,
                    row.try_get::<String, _>("bot_id")?,
                ))
            })
            .collect()
    }

    // ===== Posts =====

    pub async fn insert_post(
        &self,
        bot_id: &str,
        text: &str,
        external_id: Option<&str>,
    ) -> Result<Post> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO posts (id, bot_id, text, external_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(bot_id)
        .bind(text)
        .bind(external_id)
        .bind(now_str())
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT * FROM posts WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        post_from_row(&row)
    }

    pub async fn posts_for_bot(&self, bot_id: &str) -> Result<Vec<Post>> {
        let rows = sqlx::query("SELECT * FROM posts WHERE bot_id = ? ORDER BY created_at")
            .bind(bot_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(post_from_row).collect()
    }
}

/// Set restrictive file permissions (0600) on the database and WAL files.
fn set_db_file_permissions(db_path: &str) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::Permissions::from_mode(0o600);
        for path in [
            db_path.to_string(),
            format!("{}-wal", db_path),
            format!("{}-shm", db_path),
        ] {
            if std::path::Path::new(&path).exists() {
                if let Err(e) = std::fs::set_permissions(&path, mode.clone()) {
                    warn!("Failed to set permissions on {}: {}", path, e);
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = db_path;
    }
}

// ===== Row mapping =====

fn bot_from_row(row: &SqliteRow) -> Result<Bot> {
    Ok(Bot {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        personality: row.try_get("personality")?,
        commander_handle: row.try_get("commander_handle")?,
        post_interval_secs: row.try_get::<i64, _>("post_interval_secs")? as u64,
        poll_interval_secs: row.try_get::<i64, _>("poll_interval_secs")? as u64,
        status: BotStatus::parse(&row.try_get::<String, _>("status")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn wallet_from_row(row: &SqliteRow) -> Result<Wallet> {
    Ok(Wallet {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        address: row.try_get("address")?,
        encrypted_key: row.try_get("encrypted_key")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn social_account_from_row(row: &SqliteRow) -> Result<SocialAccount> {
    let expires: Option<String> = row.try_get("token_expires_at")?;
    Ok(SocialAccount {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        external_user_id: row.try_get("external_user_id")?,
        handle: row.try_get("handle")?,
        encrypted_access_token: row.try_get("encrypted_access_token")?,
        encrypted_refresh_token: row.try_get("encrypted_refresh_token")?,
        token_expires_at: expires.as_deref().map(parse_ts).transpose()?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn mention_from_row(row: &SqliteRow) -> Result<Mention> {
    Ok(Mention {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        external_id: row.try_get("external_id")?,
        author_id: row.try_get("author_id")?,
        author_handle: row.try_get("author_handle")?,
        text: row.try_get("text")?,
        is_command: row.try_get::<i64, _>("is_command")? != 0,
        command_type: row.try_get("command_type")?,
        command_json: row.try_get("command_json")?,
        reply_status: ReplyStatus::parse(&row.try_get::<String, _>("reply_status")?)?,
        reply_text: row.try_get("reply_text")?,
        reply_id: row.try_get("reply_id")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn trade_from_row(row: &SqliteRow) -> Result<Trade> {
    Ok(Trade {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        direction: TradeDirection::parse(&row.try_get::<String, _>("direction")?)?,
        token: row.try_get("token")?,
        amount_sol: row.try_get("amount_sol")?,
        amount_tokens: row.try_get("amount_tokens")?,
        tx_hash: row.try_get("tx_hash")?,
        source: ActionSource::parse(&row.try_get::<String, _>("source")?)?,
        status: ExecStatus::parse(&row.try_get::<String, _>("status")?)?,
        error: row.try_get("error")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn withdrawal_from_row(row: &SqliteRow) -> Result<Withdrawal> {
    Ok(Withdrawal {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        destination: row.try_get("destination")?,
        amount_sol: row.try_get("amount_sol")?,
        tx_hash: row.try_get("tx_hash")?,
        source: ActionSource::parse(&row.try_get::<String, _>("source")?)?,
        status: ExecStatus::parse(&row.try_get::<String, _>("status")?)?,
        error: row.try_get("error")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn post_from_row(row: &SqliteRow) -> Result<Post> {
    Ok(Post {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        text: row.try_get("text")?,
        external_id: row.try_get("external_id")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_store(dir: &std::path::Path) -> SqliteStore {
        let config = StoreConfig {
            db_path: dir.join("test.db").to_string_lossy().into_owned(),
            max_connections: 2,
        };
        SqliteStore::connect(&config).await.unwrap()
    }

    async fn seed_bot(store: &SqliteStore) -> Bot {
        let (bot, _wallet) = store
            .create_bot(
                NewBot {
                    name: "seedbot".into(),
                    personality: "dry".into(),
                    commander_handle: "commander".into(),
                    post_interval_secs: 3600,
                    poll_interval_secs: 60,
                },
                "4wTV1YmiEkRvAtNtsSGPtUrqRYQMe5SKy2uB4Jjaxnjf",
                "enc:v1:AAAA:BBBB",
            )
            .await
            .unwrap();
        bot
    }

    #[tokio::test]
    async fn test_create_bot_with_wallet() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let bot = seed_bot(&store).await;

        assert_eq!(bot.status, BotStatus::Paused);
        let wallet = store.wallet_for_bot(&bot.id).await.unwrap();
        assert_eq!(wallet.bot_id, bot.id);
        assert!(wallet.encrypted_key.starts_with("enc:v1:"));
    }

    #[tokio::test]
    async fn test_one_wallet_per_bot() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let bot = seed_bot(&store).await;

        let dup = sqlx::query(
            "INSERT INTO wallets (id, bot_id, address, encrypted_key, created_at)
             VALUES ('w2', ?, 'addr', 'enc', ?)",
        )
        .bind(&bot.id)
        .bind(now_str())
        .execute(store.pool())
        .await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_mention_claim_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let bot = seed_bot(&store).await;

        let new = NewMention {
            bot_id: bot.id.clone(),
            external_id: "ext-123".into(),
            author_id: "u1".into(),
            author_handle: "commander".into(),
            text: "status".into(),
        };

        store.claim_mention(new.clone()).await.unwrap();
        match store.claim_mention(new).await {
            Err(Error::DuplicateMention(id)) => assert_eq!(id, "ext-123"),
            other => panic!("expected DuplicateMention, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_trade_status_is_immutable() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let bot = seed_bot(&store).await;

        let trade = store
            .insert_trade(NewTrade {
                bot_id: bot.id.clone(),
                idempotency_key: Some("k1".into()),
                direction: TradeDirection::Buy,
                token: "So11111111111111111111111111111111111111112".into(),
                amount_sol: Some(1.0),
                amount_tokens: None,
                source: ActionSource::Mention,
            })
            .await
            .unwrap();

        store
            .transition_op(OpKind::Trade, &trade.id, ExecStatus::Submitting, None, None)
            .await
            .unwrap();
        store
            .transition_op(
                OpKind::Trade,
                &trade.id,
                ExecStatus::Confirmed,
                Some("txhash"),
                None,
            )
            .await
            .unwrap();

        // Any further transition must fail and leave the row untouched
        let result = store
            .transition_op(
                OpKind::Trade,
                &trade.id,
                ExecStatus::Failed,
                None,
                Some("nope"),
            )
            .await;
        assert!(matches!(result, Err(Error::TerminalStatus { .. })));

        let reloaded = store.get_trade(&trade.id).await.unwrap();
        assert_eq!(reloaded.status, ExecStatus::Confirmed);
        assert_eq!(reloaded.tx_hash.as_deref(), Some("txhash"));
    }

    #[tokio::test]
    async fn test_trade_amount_exclusivity_enforced() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let bot = seed_bot(&store).await;

        let both = store
            .insert_trade(NewTrade {
                bot_id: bot.id.clone(),
                idempotency_key: None,
                direction: TradeDirection::Buy,
                token: "So11111111111111111111111111111111111111112".into(),
                amount_sol: Some(1.0),
                amount_tokens: Some(100.0),
                source: ActionSource::Dashboard,
            })
            .await;
        assert!(both.is_err());
    }

    #[tokio::test]
    async fn test_mention_reply_resolves_once() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let bot = seed_bot(&store).await;

        let mention = store
            .claim_mention(NewMention {
                bot_id: bot.id.clone(),
                external_id: "ext-9".into(),
                author_id: "u1".into(),
                author_handle: "commander".into(),
                text: "status".into(),
            })
            .await
            .unwrap();

        let first = store
            .resolve_mention_reply(&mention.id, ReplyStatus::Sent, "done", Some("r1"))
            .await
            .unwrap();
        assert!(first);

        let second = store
            .resolve_mention_reply(&mention.id, ReplyStatus::Failed, "other", None)
            .await
            .unwrap();
        assert!(!second);

        let reloaded = store.get_mention(&mention.id).await.unwrap();
        assert_eq!(reloaded.reply_status, ReplyStatus::Sent);
        assert_eq!(reloaded.reply_text.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_cascade_delete_is_total() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let bot = seed_bot(&store).await;

        store
            .claim_mention(NewMention {
                bot_id: bot.id.clone(),
                external_id: "ext-1".into(),
                author_id: "u1".into(),
                author_handle: "commander".into(),
                text: "hi".into(),
            })
            .await
            .unwrap();
        store
            .insert_trade(NewTrade {
                bot_id: bot.id.clone(),
                idempotency_key: None,
                direction: TradeDirection::Buy,
                token: "So11111111111111111111111111111111111111112".into(),
                amount_sol: Some(0.5),
                amount_tokens: None,
                source: ActionSource::Dashboard,
            })
            .await
            .unwrap();
        store.insert_post(&bot.id, "gm", None).await.unwrap();

        store.delete_bot_cascade(&bot.id).await.unwrap();

        assert!(matches!(
            store.get_bot(&bot.id).await,
            Err(Error::BotNotFound(_))
        ));
        assert!(matches!(
            store.wallet_for_bot(&bot.id).await,
            Err(Error::WalletNotFound(_))
        ));
        assert!(store
            .mention_by_external_id("ext-1")
            .await
            .unwrap()
            .is_none());
        assert!(store.recent_trades(&bot.id, 10).await.unwrap().is_empty());
        assert!(store.posts_for_bot(&bot.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stuck_submitting_scan() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let bot = seed_bot(&store).await;

        let w = store
            .insert_withdrawal(NewWithdrawal {
                bot_id: bot.id.clone(),
                idempotency_key: Some("k-w".into()),
                destination: "4wTV1YmiEkRvAtNtsSGPtUrqRYQMe5SKy2uB4Jjaxnjf".into(),
                amount_sol: 0.25,
                source: ActionSource::Mention,
            })
            .await
            .unwrap();
        store
            .transition_op(OpKind::Withdrawal, &w.id, ExecStatus::Submitting, None, None)
            .await
            .unwrap();

        // A cutoff in the future catches the row; one in the past does not
        let future = Utc::now() + chrono::Duration::seconds(60);
        let past = Utc::now() - chrono::Duration::seconds(60);
        assert_eq!(
            store
                .stuck_submitting(OpKind::Withdrawal, future)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(store
            .stuck_submitting(OpKind::Withdrawal, past)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_social_account_upsert_keeps_one_row() {
        let dir = tempdir().unwrap();
        let store = test_store(dir.path()).await;
        let bot = seed_bot(&store).await;

        store
            .link_social_account(&bot.id, "x-1", "agent_bot", "enc:a", "enc:r", None)
            .await
            .unwrap();
        store
            .link_social_account(&bot.id, "x-1", "agent_bot_v2", "enc:a2", "enc:r2", None)
            .await
            .unwrap();

        let account = store
            .social_account_for_bot(&bot.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.handle, "agent_bot_v2");
    }
}
