//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. `libsql::Connection` is
//! `Send + Sync` and safe for concurrent async use; a single connection
//! is reused for all operations.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::Store;
use crate::store::types::{
    CoachingStyle, Commitment, MessageRecord, MessageRole, Mode, PatternRecord, Phase, UserProfile,
};

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(store.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(store.conn()).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

const USER_COLUMNS: &str = "user_id, name, phase, mode, coaching_style, goal, goal_deadline, \
     sessions_count, commitments, patterns_detected, created_at, updated_at";

/// Map a libsql row (in USER_COLUMNS order) to a UserProfile.
fn row_to_profile(row: &libsql::Row) -> Result<UserProfile, StoreError> {
    let phase_str: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("profile row: {e}")))?;
    let mode_str: String = row
        .get(3)
        .map_err(|e| StoreError::Query(format!("profile row: {e}")))?;
    let style: i64 = row
        .get(4)
        .map_err(|e| StoreError::Query(format!("profile row: {e}")))?;
    let commitments_json: String = row
        .get(8)
        .map_err(|e| StoreError::Query(format!("profile row: {e}")))?;
    let patterns_json: String = row
        .get(9)
        .map_err(|e| StoreError::Query(format!("profile row: {e}")))?;
    let created_str: String = row
        .get(10)
        .map_err(|e| StoreError::Query(format!("profile row: {e}")))?;
    let updated_str: String = row
        .get(11)
        .map_err(|e| StoreError::Query(format!("profile row: {e}")))?;

    let commitments: Vec<Commitment> = serde_json::from_str(&commitments_json)
        .map_err(|e| StoreError::Serialization(format!("commitments: {e}")))?;
    let patterns_detected: Vec<String> = serde_json::from_str(&patterns_json)
        .map_err(|e| StoreError::Serialization(format!("patterns_detected: {e}")))?;

    Ok(UserProfile {
        user_id: row
            .get(0)
            .map_err(|e| StoreError::Query(format!("profile row: {e}")))?,
        name: row
            .get(1)
            .map_err(|e| StoreError::Query(format!("profile row: {e}")))?,
        phase: Phase::from_db(&phase_str),
        mode: Mode::from_db(&mode_str),
        style: CoachingStyle::from_db(style),
        goal: row.get(5).ok(),
        goal_deadline: row.get(6).ok(),
        sessions_count: row
            .get(7)
            .map_err(|e| StoreError::Query(format!("profile row: {e}")))?,
        commitments,
        patterns_detected,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql row (id, user_id, role, content, created_at) to a MessageRecord.
fn row_to_message(row: &libsql::Row) -> Result<MessageRecord, StoreError> {
    let role_str: String = row
        .get(2)
        .map_err(|e| StoreError::Query(format!("message row: {e}")))?;
    let created_str: String = row
        .get(4)
        .map_err(|e| StoreError::Query(format!("message row: {e}")))?;

    Ok(MessageRecord {
        id: row
            .get(0)
            .map_err(|e| StoreError::Query(format!("message row: {e}")))?,
        user_id: row
            .get(1)
            .map_err(|e| StoreError::Query(format!("message row: {e}")))?,
        role: MessageRole::from_db(&role_str),
        content: row
            .get(3)
            .map_err(|e| StoreError::Query(format!("message row: {e}")))?,
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_profile: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_profile(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_profile: {e}"))),
        }
    }

    async fn create_profile(&self, user_id: &str, name: &str) -> Result<UserProfile, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO users (user_id, name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![user_id, name, now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("create_profile: {e}")))?;

        debug!(user_id, "Profile ensured");
        self.get_profile(user_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "user".to_string(),
                id: user_id.to_string(),
            })
    }

    async fn set_phase(&self, user_id: &str, phase: Phase) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE users SET phase = ?1, updated_at = ?2 WHERE user_id = ?3",
                params![phase.as_str(), now, user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_phase: {e}")))?;
        debug!(user_id, phase = phase.as_str(), "Phase updated");
        Ok(())
    }

    async fn set_phase_and_sessions(
        &self,
        user_id: &str,
        phase: Phase,
        sessions: i64,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE users SET phase = ?1, sessions_count = ?2, updated_at = ?3 WHERE user_id = ?4",
                params![phase.as_str(), sessions, now, user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_phase_and_sessions: {e}")))?;
        debug!(user_id, phase = phase.as_str(), sessions, "Phase and sessions updated");
        Ok(())
    }

    async fn increment_sessions(&self, user_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE users SET sessions_count = sessions_count + 1, updated_at = ?1 WHERE user_id = ?2",
                params![now, user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("increment_sessions: {e}")))?;
        Ok(())
    }

    async fn set_mode(&self, user_id: &str, mode: Mode) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE users SET mode = ?1, updated_at = ?2 WHERE user_id = ?3",
                params![mode.as_str(), now, user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_mode: {e}")))?;
        Ok(())
    }

    async fn set_style(&self, user_id: &str, style: CoachingStyle) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE users SET coaching_style = ?1, updated_at = ?2 WHERE user_id = ?3",
                params![style.as_i64(), now, user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_style: {e}")))?;
        Ok(())
    }

    async fn set_commitments(
        &self,
        user_id: &str,
        commitments: &[Commitment],
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(commitments)
            .map_err(|e| StoreError::Serialization(format!("commitments: {e}")))?;
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE users SET commitments = ?1, updated_at = ?2 WHERE user_id = ?3",
                params![json, now, user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_commitments: {e}")))?;
        Ok(())
    }

    async fn append_message(
        &self,
        user_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<(), StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO messages (id, user_id, role, content, seq, created_at)
                 VALUES (?1, ?2, ?3, ?4,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE user_id = ?2),
                     ?5)",
                params![id, user_id, role.as_str(), content, now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_message: {e}")))?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, user_id, role, content, created_at FROM messages
                 WHERE user_id = ?1 ORDER BY seq DESC LIMIT ?2",
                params![user_id, limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("recent_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            messages.push(row_to_message(&row)?);
        }
        messages.reverse();
        Ok(messages)
    }

    async fn record_pattern(
        &self,
        user_id: &str,
        pattern_type: &str,
        label: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO patterns (user_id, pattern_type, pattern_text, count, detected_at)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT(user_id, pattern_type)
                 DO UPDATE SET count = count + 1",
                params![user_id, pattern_type, label, now],
            )
            .await
            .map_err(|e| StoreError::Query(format!("record_pattern: {e}")))?;

        // Maintain the denormalized distinct-type cache on the profile.
        if let Some(profile) = self.get_profile(user_id).await? {
            if !profile.patterns_detected.iter().any(|p| p == pattern_type) {
                let mut types = profile.patterns_detected;
                types.push(pattern_type.to_string());
                let json = serde_json::to_string(&types)
                    .map_err(|e| StoreError::Serialization(format!("patterns_detected: {e}")))?;
                self.conn()
                    .execute(
                        "UPDATE users SET patterns_detected = ?1 WHERE user_id = ?2",
                        params![json, user_id],
                    )
                    .await
                    .map_err(|e| StoreError::Query(format!("record_pattern cache: {e}")))?;
            }
        }

        debug!(user_id, pattern_type, "Pattern recorded");
        Ok(())
    }

    async fn patterns_for_user(&self, user_id: &str) -> Result<Vec<PatternRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, pattern_type, pattern_text, count, detected_at
                 FROM patterns WHERE user_id = ?1 ORDER BY count DESC",
                params![user_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("patterns_for_user: {e}")))?;

        let mut patterns = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let detected_str: String = row
                .get(4)
                .map_err(|e| StoreError::Query(format!("pattern row: {e}")))?;
            patterns.push(PatternRecord {
                user_id: row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("pattern row: {e}")))?,
                pattern_type: row
                    .get(1)
                    .map_err(|e| StoreError::Query(format!("pattern row: {e}")))?,
                label: row
                    .get(2)
                    .map_err(|e| StoreError::Query(format!("pattern row: {e}")))?,
                count: row
                    .get(3)
                    .map_err(|e| StoreError::Query(format!("pattern row: {e}")))?,
                detected_at: parse_datetime(&detected_str),
            });
        }
        Ok(patterns)
    }

    async fn active_users(&self, days: u32) -> Result<Vec<UserProfile>, StoreError> {
        let window = format!("-{days}");
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users
                     WHERE phase != 'onboarding'
                     AND user_id IN (
                         SELECT DISTINCT user_id FROM messages
                         WHERE created_at > datetime('now', ?1 || ' days')
                     )"
                ),
                params![window],
            )
            .await
            .map_err(|e| StoreError::Query(format!("active_users: {e}")))?;

        let mut users = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            users.push(row_to_profile(&row)?);
        }
        Ok(users)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
