//! Append-only audit log
//!
//! The system of record for dispute resolution: every state transition of a
//! trade, withdrawal, or mention, and every authorization rejection, lands
//! here. There is no update or delete operation; rows only leave the table
//! when a bot's cascade delete removes the whole account.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::debug;

use crate::error::Result;
use crate::model::{ActionSource, AuditEntry};
use crate::store::{format_ts, now_str, parse_ts, SqliteStore};

/// Append-only writer and query surface over the audit table
#[derive(Clone)]
pub struct AuditLog {
    store: SqliteStore,
}

impl AuditLog {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Durably append one entry
    pub async fn append(
        &self,
        bot_id: Option<&str>,
        action: &str,
        details: serde_json::Value,
        source: ActionSource,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (bot_id, action, details, source, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(bot_id)
        .bind(action)
        .bind(details.to_string())
        .bind(source.as_str())
        .bind(now_str())
        .execute(self.store.pool())
        .await?;
        debug!(action, source = source.as_str(), "audit entry appended");
        Ok(())
    }

    /// Entries for one bot, newest first
    pub async fn for_bot(&self, bot_id: &str, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM audit_log WHERE bot_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(bot_id)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Entries in a time range, oldest first
    pub async fn in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM audit_log WHERE created_at >= ? AND created_at < ? ORDER BY id",
        )
        .bind(format_ts(from))
        .bind(format_ts(to))
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Entries by action name, newest first
    pub async fn by_action(&self, action: &str, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM audit_log WHERE action = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(action)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry> {
    let details: String = row.try_get("details")?;
    Ok(AuditEntry {
        id: row.try_get("id")?,
        bot_id: row.try_get("bot_id")?,
        action: row.try_get("action")?,
        details: serde_json::from_str(&details)?,
        source: ActionSource::parse(&row.try_get::<String, _>("source")?)?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use serde_json::json;
    use tempfile::tempdir;

    async fn test_log(dir: &std::path::Path) -> AuditLog {
        let config = StoreConfig {
            db_path: dir.join("audit.db").to_string_lossy().into_owned(),
            max_connections: 2,
        };
        AuditLog::new(SqliteStore::connect(&config).await.unwrap())
    }

    #[tokio::test]
    async fn test_append_and_query_by_bot() {
        let dir = tempdir().unwrap();
        let log = test_log(dir.path()).await;

        log.append(
            Some("bot-1"),
            "command_rejected",
            json!({"reason": "not authorized"}),
            ActionSource::Mention,
        )
        .await
        .unwrap();
        log.append(Some("bot-2"), "trade_confirmed", json!({}), ActionSource::System)
            .await
            .unwrap();

        let entries = log.for_bot("bot-1", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "command_rejected");
        assert_eq!(entries[0].details["reason"], "not authorized");
        assert_eq!(entries[0].source, ActionSource::Mention);
    }

    #[tokio::test]
    async fn test_query_by_action_and_range() {
        let dir = tempdir().unwrap();
        let log = test_log(dir.path()).await;

        for i in 0..3 {
            log.append(
                Some("bot-1"),
                "trade_submitting",
                json!({"attempt": i}),
                ActionSource::Mention,
            )
            .await
            .unwrap();
        }

        let by_action = log.by_action("trade_submitting", 10).await.unwrap();
        assert_eq!(by_action.len(), 3);

        let now = Utc::now();
        let ranged = log
            .in_range(now - chrono::Duration::minutes(1), now + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(ranged.len(), 3);
        // Oldest first
        assert_eq!(ranged[0].details["attempt"], 0);
    }
}
