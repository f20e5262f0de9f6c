//! SQLite-backed intelligence store.
//!
//! One `user_intelligence` row per user, with projects, goals, tasks,
//! knowledge files, contact intelligence, activity counts, and sync log rows
//! keyed to it. Merge is additive by natural key: rows a user may have edited
//! are never overwritten by a later sync. Connections are short-lived and
//! opened per operation.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extractor::{
    action_item_key, normalized_project_name, relationship_key, ExtractedInsightBatch,
};

/// How many insight notes `insights()` returns.
const RECENT_NOTES_LIMIT: usize = 10;

/// Days covered by the activity histogram.
const ACTIVITY_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Reset failed, no changes applied: {0}")]
    ResetFailed(String),
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbProject {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbTask {
    pub id: String,
    pub description: String,
    pub deadline: Option<String>,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbContact {
    pub id: String,
    pub contact_email: String,
    pub contact_name: Option<String>,
    pub context: Option<String>,
    pub first_seen: String,
    pub last_seen: String,
    pub total_mentions: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbGoal {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
}

/// An insight note stored in the intelligence row's facts column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactNote {
    pub text: String,
    pub noted_at: String,
}

/// The merged intelligence record for one user.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedUserIntelligence {
    pub id: String,
    pub user_email: String,
    pub last_synced_at: Option<String>,
    pub relationships: Vec<DbContact>,
    pub projects: Vec<DbProject>,
    pub tasks: Vec<DbTask>,
    pub facts: Vec<FactNote>,
}

/// Payload for `GET /api/insights`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsReport {
    pub projects: Vec<DbProject>,
    /// Daily message counts, oldest bucket first, always 7 entries.
    pub activity: Vec<ActivityBucket>,
    pub notes: Vec<FactNote>,
    pub tasks: Vec<DbTask>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityBucket {
    pub day: String,
    pub count: i64,
}

/// Top slices of a user's intelligence for the chat system prompt.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntelligenceSummary {
    pub relationships: Vec<DbContact>,
    pub projects: Vec<DbProject>,
    pub action_items: Vec<DbTask>,
    pub facts: Vec<FactNote>,
}

/// Terminal record of one sync run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub status: String,
    pub progress: i64,
    pub emails_processed: i64,
    pub error_message: Option<String>,
    pub started_at: String,
    pub completed_at: String,
}

// ============================================================================
// Database wrapper
// ============================================================================

/// SQLite connection wrapper. Intentionally not `Clone` or `Sync`; callers
/// open a fresh instance per operation.
pub struct IntelDb {
    conn: Connection,
}

impl IntelDb {
    /// Default database path (`~/.attache/intel.db`).
    pub fn default_path() -> Result<PathBuf, StoreError> {
        let home = dirs::home_dir().ok_or(StoreError::HomeDirNotFound)?;
        let dir = home.join(".attache");
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(StoreError::CreateDir)?;
        }
        Ok(dir.join("intel.db"))
    }

    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(Self::default_path()?)
    }

    pub fn open_at(path: PathBuf) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_intelligence (
                id TEXT PRIMARY KEY,
                user_email TEXT NOT NULL UNIQUE,
                facts_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                last_synced_at TEXT
            );
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                intel_id TEXT NOT NULL REFERENCES user_intelligence(id),
                name TEXT NOT NULL,
                normalized_name TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                UNIQUE (intel_id, normalized_name)
            );
            CREATE TABLE IF NOT EXISTS goals (
                id TEXT PRIMARY KEY,
                intel_id TEXT NOT NULL REFERENCES user_intelligence(id),
                title TEXT NOT NULL,
                description TEXT,
                category TEXT NOT NULL DEFAULT 'professional',
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                intel_id TEXT NOT NULL REFERENCES user_intelligence(id),
                description TEXT NOT NULL,
                deadline TEXT,
                natural_key TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                UNIQUE (intel_id, natural_key)
            );
            CREATE TABLE IF NOT EXISTS knowledge_files (
                id TEXT PRIMARY KEY,
                intel_id TEXT NOT NULL REFERENCES user_intelligence(id),
                filename TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS contact_intelligence (
                id TEXT PRIMARY KEY,
                intel_id TEXT NOT NULL REFERENCES user_intelligence(id),
                contact_email TEXT NOT NULL,
                contact_name TEXT,
                context TEXT,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                total_mentions INTEGER NOT NULL DEFAULT 1,
                UNIQUE (intel_id, contact_email)
            );
            CREATE TABLE IF NOT EXISTS email_activity (
                intel_id TEXT NOT NULL REFERENCES user_intelligence(id),
                day TEXT NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (intel_id, day)
            );
            CREATE TABLE IF NOT EXISTS email_sync_status (
                id TEXT PRIMARY KEY,
                intel_id TEXT NOT NULL REFERENCES user_intelligence(id),
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                emails_processed INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT
            );",
        )?;
        Ok(())
    }

    /// Find the intelligence row id for a user.
    fn intel_id(&self, user_email: &str) -> Result<Option<String>, StoreError> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM user_intelligence WHERE user_email = ?1",
                params![user_email],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Find or create the intelligence row for a user, returning its id.
    fn ensure_user(conn: &Connection, user_email: &str) -> Result<String, rusqlite::Error> {
        let existing = conn
            .query_row(
                "SELECT id FROM user_intelligence WHERE user_email = ?1",
                params![user_email],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO user_intelligence (id, user_email, created_at) VALUES (?1, ?2, ?3)",
            params![id, user_email, Utc::now().to_rfc3339()],
        )?;
        Ok(id)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Merge an extracted batch into the user's persisted intelligence.
    ///
    /// Additive with recency: entries whose natural key already exists are
    /// left untouched apart from contact mention counters. Runs as one
    /// transaction; a failure leaves no partial writes.
    pub fn merge(
        &mut self,
        user_email: &str,
        batch: &ExtractedInsightBatch,
    ) -> Result<PersistedUserIntelligence, StoreError> {
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;

        let intel_id = Self::ensure_user(&tx, user_email)?;

        for mention in &batch.relationships {
            let key = relationship_key(mention);
            if key.is_empty() {
                continue;
            }
            let updated = tx.execute(
                "UPDATE contact_intelligence
                 SET last_seen = ?1, total_mentions = total_mentions + 1
                 WHERE intel_id = ?2 AND contact_email = ?3",
                params![now, intel_id, key],
            )?;
            if updated == 0 {
                tx.execute(
                    "INSERT INTO contact_intelligence
                     (id, intel_id, contact_email, contact_name, context, first_seen, last_seen)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                    params![
                        uuid::Uuid::new_v4().to_string(),
                        intel_id,
                        key,
                        non_empty(&mention.name),
                        non_empty(&mention.context),
                        now,
                    ],
                )?;
            }
        }

        for project in &batch.projects {
            let normalized = normalized_project_name(&project.name);
            if normalized.is_empty() {
                continue;
            }
            tx.execute(
                "INSERT OR IGNORE INTO projects
                 (id, intel_id, name, normalized_name, description, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    intel_id,
                    project.name,
                    normalized,
                    non_empty(&project.description),
                    now,
                ],
            )?;
        }

        for item in &batch.action_items {
            if item.description.trim().is_empty() {
                continue;
            }
            let key = action_item_key(&item.description, item.deadline.as_deref());
            tx.execute(
                "INSERT OR IGNORE INTO tasks
                 (id, intel_id, description, deadline, natural_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    intel_id,
                    item.description,
                    item.deadline,
                    key,
                    now,
                ],
            )?;
        }

        if !batch.facts.is_empty() {
            let facts_json: String = tx.query_row(
                "SELECT facts_json FROM user_intelligence WHERE id = ?1",
                params![intel_id],
                |row| row.get(0),
            )?;
            let mut notes: Vec<FactNote> =
                serde_json::from_str(&facts_json).unwrap_or_default();
            for fact in &batch.facts {
                let trimmed = fact.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let already = notes
                    .iter()
                    .any(|n| n.text.to_lowercase() == trimmed.to_lowercase());
                if !already {
                    notes.push(FactNote {
                        text: trimmed.to_string(),
                        noted_at: now.clone(),
                    });
                }
            }
            let serialized =
                serde_json::to_string(&notes).unwrap_or_else(|_| "[]".to_string());
            tx.execute(
                "UPDATE user_intelligence SET facts_json = ?1 WHERE id = ?2",
                params![serialized, intel_id],
            )?;
        }

        tx.execute(
            "UPDATE user_intelligence SET last_synced_at = ?1 WHERE id = ?2",
            params![now, intel_id],
        )?;

        tx.commit()?;

        self.get_intelligence(user_email)?
            .ok_or_else(|| StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }

    /// Load the full merged record for a user.
    pub fn get_intelligence(
        &self,
        user_email: &str,
    ) -> Result<Option<PersistedUserIntelligence>, StoreError> {
        let header = self
            .conn
            .query_row(
                "SELECT id, facts_json, last_synced_at
                 FROM user_intelligence WHERE user_email = ?1",
                params![user_email],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((intel_id, facts_json, last_synced_at)) = header else {
            return Ok(None);
        };

        let facts: Vec<FactNote> = serde_json::from_str(&facts_json).unwrap_or_default();

        Ok(Some(PersistedUserIntelligence {
            id: intel_id.clone(),
            user_email: user_email.to_string(),
            last_synced_at,
            relationships: self.contacts(&intel_id, None)?,
            projects: self.projects(&intel_id, None)?,
            tasks: self.tasks(&intel_id, None)?,
            facts,
        }))
    }

    // ========================================================================
    // Reset
    // ========================================================================

    /// Delete a user's intelligence row and everything keyed to it.
    ///
    /// All-or-nothing: a failure mid-delete rolls back and the user's data is
    /// exactly as before the attempt. Resetting an unknown user succeeds.
    pub fn reset(&mut self, user_email: &str) -> Result<(), StoreError> {
        let Some(intel_id) = self.intel_id(user_email)? else {
            return Ok(());
        };

        let tx = self
            .conn
            .transaction()
            .map_err(|e| StoreError::ResetFailed(e.to_string()))?;

        let result: Result<(), rusqlite::Error> = (|| {
            for table in [
                "tasks",
                "goals",
                "projects",
                "knowledge_files",
                "contact_intelligence",
                "email_activity",
                "email_sync_status",
            ] {
                tx.execute(
                    &format!("DELETE FROM {} WHERE intel_id = ?1", table),
                    params![intel_id],
                )?;
            }
            tx.execute(
                "DELETE FROM user_intelligence WHERE id = ?1",
                params![intel_id],
            )?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                tx.commit().map_err(|e| StoreError::ResetFailed(e.to_string()))?;
                log::info!("Reset intelligence for {}", user_email);
                Ok(())
            }
            Err(e) => {
                // Dropping the transaction rolls back
                Err(StoreError::ResetFailed(e.to_string()))
            }
        }
    }

    // ========================================================================
    // Activity + sync log
    // ========================================================================

    /// Bump per-day message counts for the activity histogram.
    pub fn record_activity(
        &mut self,
        user_email: &str,
        timestamps: &[DateTime<Utc>],
    ) -> Result<(), StoreError> {
        if timestamps.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        let intel_id = Self::ensure_user(&tx, user_email)?;
        for ts in timestamps {
            let day = ts.date_naive().to_string();
            tx.execute(
                "INSERT INTO email_activity (intel_id, day, count) VALUES (?1, ?2, 1)
                 ON CONFLICT(intel_id, day) DO UPDATE SET count = count + 1",
                params![intel_id, day],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Persist the terminal record of one sync run.
    pub fn record_sync_outcome(
        &mut self,
        user_email: &str,
        outcome: &SyncOutcome,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        let intel_id = Self::ensure_user(&tx, user_email)?;
        tx.execute(
            "INSERT INTO email_sync_status
             (id, intel_id, status, progress, emails_processed, error_message, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                uuid::Uuid::new_v4().to_string(),
                intel_id,
                outcome.status,
                outcome.progress,
                outcome.emails_processed,
                outcome.error_message,
                outcome.started_at,
                outcome.completed_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Everything the insights endpoint needs in one call.
    pub fn insights(&self, user_email: &str) -> Result<InsightsReport, StoreError> {
        let Some(intel_id) = self.intel_id(user_email)? else {
            return Ok(InsightsReport {
                projects: Vec::new(),
                activity: empty_histogram(),
                notes: Vec::new(),
                tasks: Vec::new(),
            });
        };

        let facts_json: String = self.conn.query_row(
            "SELECT facts_json FROM user_intelligence WHERE id = ?1",
            params![intel_id],
            |row| row.get(0),
        )?;
        let mut notes: Vec<FactNote> = serde_json::from_str(&facts_json).unwrap_or_default();
        notes.reverse(); // newest first
        notes.truncate(RECENT_NOTES_LIMIT);

        Ok(InsightsReport {
            projects: self.projects(&intel_id, None)?,
            activity: self.activity_histogram(&intel_id)?,
            notes,
            tasks: self.tasks(&intel_id, None)?,
        })
    }

    /// Top slices for the chat system prompt: five relationships, five
    /// projects, five action items, three facts.
    pub fn intelligence_summary(
        &self,
        user_email: &str,
    ) -> Result<IntelligenceSummary, StoreError> {
        let Some(intel_id) = self.intel_id(user_email)? else {
            return Ok(IntelligenceSummary::default());
        };

        let facts_json: String = self.conn.query_row(
            "SELECT facts_json FROM user_intelligence WHERE id = ?1",
            params![intel_id],
            |row| row.get(0),
        )?;
        let mut facts: Vec<FactNote> = serde_json::from_str(&facts_json).unwrap_or_default();
        facts.reverse();
        facts.truncate(3);

        Ok(IntelligenceSummary {
            relationships: self.contacts(&intel_id, Some(5))?,
            projects: self.projects(&intel_id, Some(5))?,
            action_items: self.tasks(&intel_id, Some(5))?,
            facts,
        })
    }

    fn projects(&self, intel_id: &str, limit: Option<usize>) -> Result<Vec<DbProject>, StoreError> {
        let sql = format!(
            "SELECT id, name, description, status, created_at
             FROM projects WHERE intel_id = ?1
             ORDER BY created_at DESC, name ASC{}",
            limit_clause(limit)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![intel_id], |row| {
            Ok(DbProject {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                status: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn tasks(&self, intel_id: &str, limit: Option<usize>) -> Result<Vec<DbTask>, StoreError> {
        let sql = format!(
            "SELECT id, description, deadline, status, created_at
             FROM tasks WHERE intel_id = ?1 AND status != 'done'
             ORDER BY created_at DESC{}",
            limit_clause(limit)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![intel_id], |row| {
            Ok(DbTask {
                id: row.get(0)?,
                description: row.get(1)?,
                deadline: row.get(2)?,
                status: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn contacts(&self, intel_id: &str, limit: Option<usize>) -> Result<Vec<DbContact>, StoreError> {
        let sql = format!(
            "SELECT id, contact_email, contact_name, context, first_seen, last_seen, total_mentions
             FROM contact_intelligence WHERE intel_id = ?1
             ORDER BY total_mentions DESC, last_seen DESC{}",
            limit_clause(limit)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![intel_id], |row| {
            Ok(DbContact {
                id: row.get(0)?,
                contact_email: row.get(1)?,
                contact_name: row.get(2)?,
                context: row.get(3)?,
                first_seen: row.get(4)?,
                last_seen: row.get(5)?,
                total_mentions: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Seven daily buckets ending today, zero-filled.
    fn activity_histogram(&self, intel_id: &str) -> Result<Vec<ActivityBucket>, StoreError> {
        let mut buckets = empty_histogram();
        let mut stmt = self.conn.prepare(
            "SELECT day, count FROM email_activity
             WHERE intel_id = ?1 AND day >= ?2",
        )?;
        let oldest = buckets[0].day.clone();
        let rows = stmt.query_map(params![intel_id, oldest], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (day, count) = row?;
            if let Some(bucket) = buckets.iter_mut().find(|b| b.day == day) {
                bucket.count = count;
            }
        }
        Ok(buckets)
    }

    // ========================================================================
    // User-authored rows (goals, knowledge files)
    // ========================================================================

    pub fn add_goal(
        &mut self,
        user_email: &str,
        title: &str,
        description: Option<&str>,
    ) -> Result<String, StoreError> {
        let tx = self.conn.transaction()?;
        let intel_id = Self::ensure_user(&tx, user_email)?;
        let id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO goals (id, intel_id, title, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, intel_id, title, description, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(id)
    }

    pub fn add_knowledge_file(
        &mut self,
        user_email: &str,
        filename: &str,
        description: Option<&str>,
    ) -> Result<String, StoreError> {
        let tx = self.conn.transaction()?;
        let intel_id = Self::ensure_user(&tx, user_email)?;
        let id = uuid::Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO knowledge_files (id, intel_id, filename, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, intel_id, filename, description, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(id)
    }

    pub fn goals(&self, user_email: &str) -> Result<Vec<DbGoal>, StoreError> {
        let Some(intel_id) = self.intel_id(user_email)? else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(
            "SELECT id, title, description, category FROM goals
             WHERE intel_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![intel_id], |row| {
            Ok(DbGoal {
                id: row.get(0)?,
                title: row.get(1)?,
                description: row.get(2)?,
                category: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Count rows in any dependent table for a given intelligence id.
    #[cfg(test)]
    fn dependent_row_count(&self, intel_id: &str) -> i64 {
        let mut total = 0i64;
        for table in [
            "projects",
            "goals",
            "tasks",
            "knowledge_files",
            "contact_intelligence",
            "email_activity",
            "email_sync_status",
        ] {
            let count: i64 = self
                .conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM {} WHERE intel_id = ?1", table),
                    params![intel_id],
                    |row| row.get(0),
                )
                .unwrap_or(0);
            total += count;
        }
        total
    }
}

fn limit_clause(limit: Option<usize>) -> String {
    match limit {
        Some(n) => format!(" LIMIT {}", n),
        None => String::new(),
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Seven zeroed buckets ending today, oldest first.
fn empty_histogram() -> Vec<ActivityBucket> {
    let today = Utc::now().date_naive();
    (0..ACTIVITY_DAYS)
        .rev()
        .map(|offset| ActivityBucket {
            day: (today - chrono::Duration::days(offset)).to_string(),
            count: 0,
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
