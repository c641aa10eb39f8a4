//! SQLite store for conversations, messages, remembered facts, the cloud
//! cost ledger and the audit log.
//!
//! One connection behind a mutex; every call is a short synchronous
//! statement. Timestamps are RFC 3339 UTC strings so range filters compare
//! lexicographically.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, SecondsFormat, TimeZone, Utc};
use os_llm::{ChatMessage, CostEntry, CostLedger, LlmError, Role};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

pub const HISTORY_LIMIT: usize = 10;
pub const MEMORY_CONTEXT_LIMIT: usize = 5;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id          TEXT PRIMARY KEY,
    channel     TEXT NOT NULL,
    sender_id   TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    metadata    TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    role            TEXT NOT NULL CHECK(role IN ('user', 'assistant', 'system')),
    content         TEXT NOT NULL,
    channel         TEXT,
    created_at      TEXT NOT NULL,
    metadata        TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_messages_conv ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_messages_time ON messages(created_at);

CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    content,
    content_rowid='id',
    content='messages'
);

CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
END;

CREATE TABLE IF NOT EXISTS memories (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT NOT NULL,
    content     TEXT NOT NULL,
    category    TEXT NOT NULL DEFAULT 'general',
    created_at  TEXT NOT NULL,
    metadata    TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_memories_user ON memories(user_id);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    content,
    content_rowid='id',
    content='memories'
);

CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, content) VALUES (new.id, new.content);
END;

CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, content) VALUES ('delete', old.id, old.content);
END;

CREATE TABLE IF NOT EXISTS cost_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    provider      TEXT NOT NULL,
    model         TEXT NOT NULL,
    input_tokens  INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cost_usd      REAL NOT NULL DEFAULT 0.0,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cost_time ON cost_log(created_at);

CREATE TABLE IF NOT EXISTS audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT NOT NULL,
    action      TEXT NOT NULL,
    detail      TEXT,
    tier        INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_log(user_id);
CREATE INDEX IF NOT EXISTS idx_audit_time ON audit_log(created_at);
";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageHit {
    pub id: i64,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryRecord {
    pub id: i64,
    pub user_id: String,
    pub content: String,
    pub category: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub user_id: String,
    pub action: String,
    pub detail: Option<String>,
    pub tier: u8,
    pub created_at: String,
}

/// Month-to-date spend for one provider/model pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub provider: String,
    pub model: String,
    pub calls: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
}

/// What the pipeline hands a skill: recent turns plus relevant facts.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub history: Vec<ChatMessage>,
    pub memories: Vec<String>,
}

pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enable WAL journal")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory database")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enable foreign keys")?;
        conn.execute_batch(SCHEMA).context("apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(f(&conn)?)
    }

    pub fn get_or_create_conversation(
        &self,
        conversation_id: &str,
        channel: &str,
        sender_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = timestamp(now);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, channel, sender_id, started_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
                params![conversation_id, channel, sender_id, now],
            )
        })
        .context("upsert conversation")?;
        Ok(())
    }

    pub fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        channel: Option<&str>,
        metadata: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let metadata = metadata_json(metadata);
        let now = timestamp(now);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (conversation_id, role, content, channel, created_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![conversation_id, role.as_str(), content, channel, now, metadata],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .context("insert message")
    }

    /// The last `limit` messages, oldest first.
    pub fn conversation_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT role, content FROM messages
                     WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![conversation_id, limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .context("load conversation history")?;

        let mut history: Vec<ChatMessage> = rows
            .into_iter()
            .filter_map(|(role, content)| match role.parse::<Role>() {
                Ok(role) => Some(ChatMessage { role, content }),
                Err(e) => {
                    tracing::warn!(%e, %role, "skipping message with unknown role");
                    None
                }
            })
            .collect();
        history.reverse();
        Ok(history)
    }

    pub fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<MessageHit>> {
        let Some(query) = fts_query(query) else {
            return Ok(Vec::new());
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.role, m.content, m.created_at
                 FROM messages_fts fts
                 JOIN messages m ON fts.rowid = m.id
                 WHERE messages_fts MATCH ?1
                 ORDER BY rank LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![query, limit as i64], |row| {
                Ok(MessageHit {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?;
            rows.collect()
        })
        .context("search messages")
    }

    pub fn add_memory(
        &self,
        user_id: &str,
        content: &str,
        category: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let now = timestamp(now);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO memories (user_id, content, category, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![user_id, content, category, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .context("insert memory")
    }

    /// Newest first.
    pub fn memories(
        &self,
        user_id: &str,
        category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, content, category, created_at FROM memories
                 WHERE user_id = ?1 AND (?2 IS NULL OR category = ?2)
                 ORDER BY id DESC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![user_id, category, limit as i64], map_memory)?;
            rows.collect()
        })
        .context("list memories")
    }

    pub fn search_memories(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let Some(query) = fts_query(query) else {
            return Ok(Vec::new());
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.user_id, m.content, m.category, m.created_at
                 FROM memories_fts fts
                 JOIN memories m ON fts.rowid = m.id
                 WHERE memories_fts MATCH ?1 AND m.user_id = ?2
                 ORDER BY rank LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![query, user_id, limit as i64], map_memory)?;
            rows.collect()
        })
        .context("search memories")
    }

    /// Deletes the user's memories matching `query`; returns how many went.
    pub fn forget_memories(&self, user_id: &str, query: &str) -> Result<usize> {
        let Some(query) = fts_query(query) else {
            return Ok(0);
        };
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM memories WHERE user_id = ?1 AND id IN (
                     SELECT rowid FROM memories_fts WHERE memories_fts MATCH ?2
                 )",
                params![user_id, query],
            )
        })
        .context("forget memories")
    }

    pub fn log_cost(&self, entry: &CostEntry) -> Result<()> {
        let created_at = timestamp(entry.created_at);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cost_log (provider, model, input_tokens, output_tokens, cost_usd, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.provider.as_str(),
                    entry.model,
                    entry.input_tokens,
                    entry.output_tokens,
                    entry.cost_usd,
                    created_at,
                ],
            )
        })
        .context("insert cost entry")?;
        Ok(())
    }

    /// Spend in the calendar month (UTC) containing `now`.
    pub fn monthly_cost(&self, now: DateTime<Utc>) -> Result<f64> {
        let start = month_start(now)?;
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(cost_usd), 0.0) FROM cost_log WHERE created_at >= ?1",
                params![timestamp(start)],
                |row| row.get(0),
            )
        })
        .context("sum monthly cost")
    }

    pub fn cost_breakdown(&self, now: DateTime<Utc>) -> Result<Vec<CostBreakdown>> {
        let start = month_start(now)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT provider, model, COUNT(*), SUM(input_tokens), SUM(output_tokens), SUM(cost_usd)
                 FROM cost_log WHERE created_at >= ?1
                 GROUP BY provider, model ORDER BY SUM(cost_usd) DESC",
            )?;
            let rows = stmt.query_map(params![timestamp(start)], |row| {
                Ok(CostBreakdown {
                    provider: row.get(0)?,
                    model: row.get(1)?,
                    calls: row.get(2)?,
                    input_tokens: row.get(3)?,
                    output_tokens: row.get(4)?,
                    cost_usd: row.get(5)?,
                })
            })?;
            rows.collect()
        })
        .context("load cost breakdown")
    }

    pub fn log_audit(
        &self,
        user_id: &str,
        action: &str,
        detail: Option<&str>,
        tier: u8,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let now = timestamp(now);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_log (user_id, action, detail, tier, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, action, detail, tier, now],
            )
        })
        .context("insert audit entry")?;
        Ok(())
    }

    /// Audit entries from the last `hours`, newest first. `action_like` is a
    /// SQL LIKE pattern over the action column.
    pub fn recent_audit(
        &self,
        hours: i64,
        action_like: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AuditEntry>> {
        let since = timestamp(now - chrono::Duration::hours(hours));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, action, detail, tier, created_at FROM audit_log
                 WHERE created_at >= ?1 AND (?2 IS NULL OR action LIKE ?2)
                 ORDER BY id DESC",
            )?;
            let rows = stmt.query_map(params![since, action_like], |row| {
                Ok(AuditEntry {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    action: row.get(2)?,
                    detail: row.get(3)?,
                    tier: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?;
            rows.collect()
        })
        .context("load audit entries")
    }

    pub fn has_conversation(&self, conversation_id: &str) -> Result<bool> {
        let row = self
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT 1 FROM conversations WHERE id = ?1",
                    params![conversation_id],
                    |_| Ok(()),
                )
                .optional()
            })
            .context("look up conversation")?;
        Ok(row.is_some())
    }

    /// Recent turns of the conversation and up to five facts matching
    /// `query` for this sender.
    pub fn context_for(
        &self,
        conversation_id: &str,
        sender_id: &str,
        query: &str,
    ) -> Result<ConversationContext> {
        let history = self.conversation_history(conversation_id, HISTORY_LIMIT)?;
        let memories = self
            .search_memories(sender_id, query, MEMORY_CONTEXT_LIMIT)?
            .into_iter()
            .map(|m| m.content)
            .collect();
        Ok(ConversationContext { history, memories })
    }
}

impl CostLedger for MemoryStore {
    fn append(&self, entry: &CostEntry) -> os_llm::Result<()> {
        self.log_cost(entry)
            .map_err(|e| LlmError::Ledger(format!("{e:#}")))
    }

    fn month_total(&self, now: DateTime<Utc>) -> os_llm::Result<f64> {
        self.monthly_cost(now)
            .map_err(|e| LlmError::Ledger(format!("{e:#}")))
    }
}

/// Stable id for a channel/sender pair: 16 hex chars of SHA-256.
pub fn build_conversation_id(channel: &str, sender_id: &str) -> String {
    let digest = Sha256::digest(format!("{channel}:{sender_id}").as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn month_start(now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .context("compute start of month")
}

fn metadata_json(value: &serde_json::Value) -> String {
    if value.is_null() {
        "{}".to_string()
    } else {
        value.to_string()
    }
}

/// Quotes each word so user text cannot inject FTS5 query syntax. Words are
/// OR-ed so partial matches still rank.
fn fts_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = raw
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 1)
        .map(|w| format!("\"{}\"", w.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn map_memory(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    Ok(MemoryRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content: row.get(2)?,
        category: row.get(3)?,
        created_at: row.get(4)?,
    })
}
