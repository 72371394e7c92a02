use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// Narrow contract the autonomous tasks use for long-term knowledge:
/// facts learned once are deduplicated per scope.
pub trait KnowledgeStore: Send + Sync {
    /// Store a fact. Returns true if the fact was newly learned,
    /// false if it was already known for this scope.
    fn record_fact(&self, scope_id: i64, fact: &str, category: &str) -> Result<bool>;

    /// All facts for a scope, oldest first.
    fn list_facts(&self, scope_id: i64) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub author: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// SQLite persistence for the companion: conversation history, learned
/// facts, and a small key/value table for cross-run agent state.
pub struct CompanionDatabase {
    conn: Mutex<Connection>,
}

impl CompanionDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open companion database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                author TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS learned_facts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scope_id INTEGER NOT NULL,
                fact TEXT NOT NULL,
                category TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(scope_id, fact)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS agent_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        Ok(())
    }

    // ---- Chat history ----

    pub fn save_message(&self, author: &str, content: &str) -> Result<i64> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO chat_messages (author, content, created_at) VALUES (?1, ?2, ?3)",
            params![author, content, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent messages, returned oldest-first so they read in order.
    pub fn get_recent_messages(&self, limit: usize) -> Result<Vec<ChatMessage>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, author, content, created_at FROM chat_messages
             ORDER BY id DESC LIMIT ?1",
        )?;
        let mut messages = stmt
            .query_map([limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(id, author, content, created_at)| ChatMessage {
                id,
                author,
                content,
                created_at: created_at
                    .parse::<DateTime<Utc>>()
                    .unwrap_or_else(|_| Utc::now()),
            })
            .collect::<Vec<_>>();
        messages.reverse();
        Ok(messages)
    }

    pub fn count_messages(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM chat_messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn latest_message_id(&self) -> Result<i64> {
        let conn = self.lock_conn()?;
        let id: Option<i64> =
            conn.query_row("SELECT MAX(id) FROM chat_messages", [], |row| row.get(0))?;
        Ok(id.unwrap_or(0))
    }

    pub fn count_messages_after(&self, message_id: i64) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chat_messages WHERE id > ?1",
            [message_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete history older than the cutoff. Returns how many rows went away.
    pub fn delete_messages_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let deleted = conn.execute(
            "DELETE FROM chat_messages WHERE created_at < ?1",
            [cutoff.to_rfc3339()],
        )?;
        Ok(deleted)
    }

    // ---- Agent state ----

    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM agent_state WHERE key = ?1",
                [key],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO agent_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

impl KnowledgeStore for CompanionDatabase {
    fn record_fact(&self, scope_id: i64, fact: &str, category: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO learned_facts (scope_id, fact, category, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![scope_id, fact, category, Utc::now().to_rfc3339()],
        )?;
        Ok(inserted > 0)
    }

    fn list_facts(&self, scope_id: i64) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT fact FROM learned_facts WHERE scope_id = ?1 ORDER BY id ASC",
        )?;
        let facts = stmt
            .query_map([scope_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn temp_db() -> (tempfile::TempDir, CompanionDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let db = CompanionDatabase::new(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn messages_roundtrip_and_count() {
        let (_dir, db) = temp_db();
        db.save_message("user", "hello").unwrap();
        db.save_message("solace", "hi there").unwrap();

        assert_eq!(db.count_messages().unwrap(), 2);
        let messages = db.get_recent_messages(10).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].author, "user");
        assert_eq!(messages[1].content, "hi there");
    }

    #[test]
    fn message_cursor_tracks_new_activity() {
        let (_dir, db) = temp_db();
        assert_eq!(db.latest_message_id().unwrap(), 0);
        let first = db.save_message("user", "one").unwrap();
        db.save_message("user", "two").unwrap();
        db.save_message("user", "three").unwrap();

        assert_eq!(db.count_messages_after(first).unwrap(), 2);
        assert_eq!(db.count_messages_after(db.latest_message_id().unwrap()).unwrap(), 0);
    }

    #[test]
    fn delete_old_messages() {
        let (_dir, db) = temp_db();
        db.save_message("user", "old enough").unwrap();
        let cutoff = Utc::now() + ChronoDuration::seconds(1);
        let deleted = db.delete_messages_before(cutoff).unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.count_messages().unwrap(), 0);
    }

    #[test]
    fn facts_deduplicate_per_scope() {
        let (_dir, db) = temp_db();
        assert!(db.record_fact(0, "Rust has no garbage collector", "research").unwrap());
        assert!(!db.record_fact(0, "Rust has no garbage collector", "research").unwrap());
        assert!(db.record_fact(7, "Rust has no garbage collector", "research").unwrap());

        assert_eq!(db.list_facts(0).unwrap().len(), 1);
        assert_eq!(db.list_facts(7).unwrap().len(), 1);
    }

    #[test]
    fn state_upserts() {
        let (_dir, db) = temp_db();
        assert_eq!(db.get_state("cursor").unwrap(), None);
        db.set_state("cursor", "5").unwrap();
        db.set_state("cursor", "9").unwrap();
        assert_eq!(db.get_state("cursor").unwrap().as_deref(), Some("9"));
    }
}
