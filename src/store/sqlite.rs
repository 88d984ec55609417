//! SQLite-backed store.
//!
//! Every process pointing at the same database file sees the same job
//! records, so job status survives worker restarts.

use super::{AccountStore, Claim, InsertOutcome, JobStore, MessageStore, MirrorStore};
use crate::error::{Error, Result};
use crate::job::{JobState, SyncJob};
use crate::model::{
    Account, AccountId, DedupKey, FolderStateRecord, JobId, MessageFlags, MessageLocation,
    OwnerId, RawMessage, Scope, Uid,
};
use crate::progress::{Phase, ProgressEvent};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::BTreeSet;
use tracing::{debug, instrument};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS accounts (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        email TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS folder_state (
        owner TEXT NOT NULL,
        account TEXT NOT NULL,
        folder TEXT NOT NULL,
        uid INTEGER NOT NULL,
        uid_validity INTEGER NOT NULL,
        message_id TEXT,
        subject TEXT,
        sender TEXT,
        date TEXT,
        size INTEGER,
        flags TEXT NOT NULL,
        PRIMARY KEY (owner, account, folder, uid)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS folder_epochs (
        owner TEXT NOT NULL,
        account TEXT NOT NULL,
        folder TEXT NOT NULL,
        uid_validity INTEGER NOT NULL,
        PRIMARY KEY (owner, account, folder)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS raw_messages (
        owner TEXT NOT NULL,
        account TEXT NOT NULL,
        dedup_key TEXT NOT NULL,
        folder TEXT NOT NULL,
        uid_validity INTEGER NOT NULL,
        uid INTEGER NOT NULL,
        sealed_body BLOB NOT NULL,
        sealed_subject BLOB,
        sealed_from BLOB,
        size INTEGER NOT NULL,
        flags TEXT NOT NULL,
        stored_at TEXT NOT NULL,
        PRIMARY KEY (owner, account, dedup_key)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS message_locations (
        owner TEXT NOT NULL,
        account TEXT NOT NULL,
        folder TEXT NOT NULL,
        uid_validity INTEGER NOT NULL,
        uid INTEGER NOT NULL,
        dedup_key TEXT NOT NULL,
        PRIMARY KEY (owner, account, folder, uid_validity, uid)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS sync_jobs (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        account TEXT NOT NULL,
        state TEXT NOT NULL,
        finished_at TEXT,
        worker TEXT,
        heartbeat_at TEXT,
        record TEXT NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_sync_jobs_account_state
    ON sync_jobs(account, state)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_sync_jobs_worker
    ON sync_jobs(worker)
    ",
    r"
    CREATE TABLE IF NOT EXISTS job_progress (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        event TEXT NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_job_progress_job
    ON job_progress(job_id, seq)
    ",
];

const TERMINAL_STATES: &str = "('SUCCEEDED', 'FAILED', 'CANCELLED')";

/// Store over a `sqlx` SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema creation fails.
    pub async fn open(path: &str) -> Result<Self> {
        let url = format!("sqlite:{path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema ready");
        Ok(())
    }

    /// Registers or updates an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn add_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO accounts (id, owner, email) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET owner = excluded.owner, email = excluded.email
            ",
        )
        .bind(account.id.as_str())
        .bind(account.owner.as_str())
        .bind(&account.email)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn uid_from(value: i64) -> Result<Uid> {
    Uid::try_from(value).map_err(|_| Error::CorruptRecord {
        message: format!("identifier {value} out of range"),
    })
}

fn time_from(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| Error::CorruptRecord {
            message: format!("invalid timestamp '{value}'"),
        })
}

/// Fixed-width UTC timestamps so stored values compare correctly as text.
fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn size_to_db(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

fn row_to_record(row: &SqliteRow) -> Result<FolderStateRecord> {
    let flags: String = row.try_get("flags")?;
    let date: Option<String> = row.try_get("date")?;
    let size: Option<i64> = row.try_get("size")?;
    Ok(FolderStateRecord {
        folder: row.try_get("folder")?,
        uid_validity: uid_from(row.try_get("uid_validity")?)?,
        uid: uid_from(row.try_get("uid")?)?,
        message_id: row.try_get("message_id")?,
        subject: row.try_get("subject")?,
        from: row.try_get("sender")?,
        date: date.as_deref().map(time_from).transpose()?,
        size: size.map(uid_from).transpose()?,
        flags: serde_json::from_str(&flags)?,
    })
}

fn row_to_message(row: &SqliteRow) -> Result<RawMessage> {
    let flags: String = row.try_get("flags")?;
    let stored_at: String = row.try_get("stored_at")?;
    let size: i64 = row.try_get("size")?;
    let dedup_key: String = row.try_get("dedup_key")?;
    Ok(RawMessage {
        dedup_key: DedupKey::from_raw(dedup_key),
        location: MessageLocation {
            folder: row.try_get("folder")?,
            uid_validity: uid_from(row.try_get("uid_validity")?)?,
            uid: uid_from(row.try_get("uid")?)?,
        },
        sealed_body: row.try_get("sealed_body")?,
        sealed_subject: row.try_get("sealed_subject")?,
        sealed_from: row.try_get("sealed_from")?,
        size: u64::try_from(size).map_err(|_| Error::CorruptRecord {
            message: format!("negative message size {size}"),
        })?,
        flags: serde_json::from_str(&flags)?,
        stored_at: time_from(&stored_at)?,
    })
}

fn row_to_job(row: &SqliteRow) -> Result<SyncJob> {
    let record: String = row.try_get("record")?;
    Ok(serde_json::from_str(&record)?)
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn owned_account(&self, owner: &OwnerId, account: &AccountId) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT id, owner, email FROM accounts WHERE id = ? AND owner = ?")
            .bind(account.as_str())
            .bind(owner.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<Account> {
            let id: String = row.try_get("id")?;
            let owner: String = row.try_get("owner")?;
            let email: String = row.try_get("email")?;
            Ok(Account::new(id, owner, email))
        })
        .transpose()
    }
}

#[async_trait]
impl MirrorStore for SqliteStore {
    #[instrument(
        name = "SqliteStore::replace_folder",
        skip_all,
        fields(account_id = %scope.account, folder = %folder, rows = rows.len())
    )]
    async fn replace_folder(
        &self,
        scope: &Scope,
        folder: &str,
        uid_validity: u32,
        rows: Vec<FolderStateRecord>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM folder_state WHERE owner = ? AND account = ? AND folder = ?")
            .bind(scope.owner.as_str())
            .bind(scope.account.as_str())
            .bind(folder)
            .execute(&mut *tx)
            .await?;

        for row in &rows {
            sqlx::query(
                r"
                INSERT INTO folder_state
                    (owner, account, folder, uid, uid_validity, message_id, subject, sender,
                     date, size, flags)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(scope.owner.as_str())
            .bind(scope.account.as_str())
            .bind(folder)
            .bind(i64::from(row.uid))
            .bind(i64::from(row.uid_validity))
            .bind(&row.message_id)
            .bind(&row.subject)
            .bind(&row.from)
            .bind(row.date.map(stamp))
            .bind(row.size.map(i64::from))
            .bind(serde_json::to_string(&row.flags)?)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r"
            INSERT INTO folder_epochs (owner, account, folder, uid_validity) VALUES (?, ?, ?, ?)
            ON CONFLICT(owner, account, folder) DO UPDATE SET uid_validity = excluded.uid_validity
            ",
        )
        .bind(scope.owner.as_str())
        .bind(scope.account.as_str())
        .bind(folder)
        .bind(i64::from(uid_validity))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn folder_state(&self, scope: &Scope, folder: &str) -> Result<Vec<FolderStateRecord>> {
        let rows = sqlx::query(
            r"
            SELECT folder, uid, uid_validity, message_id, subject, sender, date, size, flags
            FROM folder_state
            WHERE owner = ? AND account = ? AND folder = ?
            ORDER BY uid ASC
            ",
        )
        .bind(scope.owner.as_str())
        .bind(scope.account.as_str())
        .bind(folder)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn folder_validity(&self, scope: &Scope, folder: &str) -> Result<Option<u32>> {
        let row = sqlx::query(
            "SELECT uid_validity FROM folder_epochs WHERE owner = ? AND account = ? AND folder = ?",
        )
        .bind(scope.owner.as_str())
        .bind(scope.account.as_str())
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| uid_from(row.try_get("uid_validity")?))
            .transpose()
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn insert_message(&self, scope: &Scope, message: RawMessage) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r"
            INSERT INTO raw_messages
                (owner, account, dedup_key, folder, uid_validity, uid, sealed_body,
                 sealed_subject, sealed_from, size, flags, stored_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner, account, dedup_key) DO NOTHING
            ",
        )
        .bind(scope.owner.as_str())
        .bind(scope.account.as_str())
        .bind(message.dedup_key.as_str())
        .bind(&message.location.folder)
        .bind(i64::from(message.location.uid_validity))
        .bind(i64::from(message.location.uid))
        .bind(&message.sealed_body)
        .bind(&message.sealed_subject)
        .bind(&message.sealed_from)
        .bind(size_to_db(message.size))
        .bind(serde_json::to_string(&message.flags)?)
        .bind(stamp(message.stored_at))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r"
            INSERT INTO message_locations (owner, account, folder, uid_validity, uid, dedup_key)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner, account, folder, uid_validity, uid)
            DO UPDATE SET dedup_key = excluded.dedup_key
            ",
        )
        .bind(scope.owner.as_str())
        .bind(scope.account.as_str())
        .bind(&message.location.folder)
        .bind(i64::from(message.location.uid_validity))
        .bind(i64::from(message.location.uid))
        .bind(message.dedup_key.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(if inserted == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    async fn persisted_uids(
        &self,
        scope: &Scope,
        folder: &str,
        uid_validity: u32,
    ) -> Result<BTreeSet<Uid>> {
        let rows = sqlx::query(
            r"
            SELECT uid FROM message_locations
            WHERE owner = ? AND account = ? AND folder = ? AND uid_validity = ?
            ",
        )
        .bind(scope.owner.as_str())
        .bind(scope.account.as_str())
        .bind(folder)
        .bind(i64::from(uid_validity))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| uid_from(row.try_get("uid")?))
            .collect()
    }

    async fn forget_locations(&self, scope: &Scope, folder: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM message_locations WHERE owner = ? AND account = ? AND folder = ?")
                .bind(scope.owner.as_str())
                .bind(scope.account.as_str())
                .bind(folder)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn update_flags(
        &self,
        scope: &Scope,
        folder: &str,
        uid_validity: u32,
        flags: &[(Uid, MessageFlags)],
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;

        for (uid, new_flags) in flags {
            let encoded = serde_json::to_string(new_flags)?;
            let result = sqlx::query(
                r"
                UPDATE raw_messages SET flags = ?
                WHERE owner = ? AND account = ? AND flags != ? AND dedup_key = (
                    SELECT dedup_key FROM message_locations
                    WHERE owner = ? AND account = ? AND folder = ? AND uid_validity = ? AND uid = ?
                )
                ",
            )
            .bind(&encoded)
            .bind(scope.owner.as_str())
            .bind(scope.account.as_str())
            .bind(&encoded)
            .bind(scope.owner.as_str())
            .bind(scope.account.as_str())
            .bind(folder)
            .bind(i64::from(uid_validity))
            .bind(i64::from(*uid))
            .execute(&mut *tx)
            .await?;
            changed += result.rows_affected();
        }

        tx.commit().await?;
        Ok(changed)
    }

    async fn message(&self, scope: &Scope, key: &DedupKey) -> Result<Option<RawMessage>> {
        let row = sqlx::query(
            r"
            SELECT dedup_key, folder, uid_validity, uid, sealed_body, sealed_subject, sealed_from,
                   size, flags, stored_at
            FROM raw_messages
            WHERE owner = ? AND account = ? AND dedup_key = ?
            ",
        )
        .bind(scope.owner.as_str())
        .bind(scope.account.as_str())
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_message).transpose()
    }

    async fn count_messages(&self, scope: &Scope) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM raw_messages WHERE owner = ? AND account = ?")
            .bind(scope.owner.as_str())
            .bind(scope.account.as_str())
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("n")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_job(&self, job: &SyncJob) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sync_jobs (id, owner, account, state, finished_at, worker, heartbeat_at, record)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(job.id.to_string())
        .bind(job.owner.as_str())
        .bind(job.account.as_str())
        .bind(job.state.as_str())
        .bind(job.finished_at.map(stamp))
        .bind(job.worker.as_deref())
        .bind(stamp(job.updated_at))
        .bind(serde_json::to_string(job)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(name = "SqliteStore::create_job_if_idle", skip_all, fields(job_id = %job.id))]
    async fn create_job_if_idle(&self, job: &SyncJob, live_after: DateTime<Utc>) -> Result<bool> {
        let inserted = sqlx::query(&format!(
            r"
            INSERT INTO sync_jobs (id, owner, account, state, finished_at, worker, heartbeat_at, record)
            SELECT ?, ?, ?, ?, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM sync_jobs
                WHERE owner = ? AND account = ?
                  AND state NOT IN {TERMINAL_STATES}
                  AND heartbeat_at > ?
            )
            "
        ))
        .bind(job.id.to_string())
        .bind(job.owner.as_str())
        .bind(job.account.as_str())
        .bind(job.state.as_str())
        .bind(job.finished_at.map(stamp))
        .bind(job.worker.as_deref())
        .bind(stamp(job.updated_at))
        .bind(serde_json::to_string(job)?)
        .bind(job.owner.as_str())
        .bind(job.account.as_str())
        .bind(stamp(live_after))
        .execute(&self.pool)
        .await?
        .rows_affected();

        debug!(inserted, "Idle-checked job insert");
        Ok(inserted == 1)
    }

    async fn save_job(&self, job: &SyncJob) -> Result<bool> {
        let result = sqlx::query(&format!(
            r"
            UPDATE sync_jobs SET state = ?, finished_at = ?, worker = ?, record = ?
            WHERE id = ? AND state NOT IN {TERMINAL_STATES}
            "
        ))
        .bind(job.state.as_str())
        .bind(job.finished_at.map(stamp))
        .bind(job.worker.as_deref())
        .bind(serde_json::to_string(job)?)
        .bind(job.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let exists = sqlx::query("SELECT 1 FROM sync_jobs WHERE id = ?")
            .bind(job.id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Ok(false)
        } else {
            Err(Error::JobNotFound { job: job.id })
        }
    }

    async fn job(&self, id: JobId) -> Result<Option<SyncJob>> {
        let row = sqlx::query("SELECT record FROM sync_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    #[instrument(name = "SqliteStore::try_claim", skip_all, fields(job_id = %id))]
    async fn try_claim(
        &self,
        id: JobId,
        worker: &str,
        live_after: DateTime<Utc>,
    ) -> Result<Claim> {
        let now = stamp(Utc::now());
        // One statement, so two processes can never both see the account idle
        let claimed = sqlx::query(&format!(
            r"
            UPDATE sync_jobs
            SET state = 'RUNNING',
                worker = ?,
                heartbeat_at = ?,
                record = json_set(
                    record,
                    '$.state', 'RUNNING',
                    '$.phase', ?,
                    '$.worker', ?,
                    '$.attempts', json_extract(record, '$.attempts') + 1,
                    '$.started_at', ?,
                    '$.updated_at', ?
                )
            WHERE id = ?
              AND state NOT IN {TERMINAL_STATES}
              AND state != 'RUNNING'
              AND NOT EXISTS (
                  SELECT 1 FROM sync_jobs AS other
                  WHERE other.account = sync_jobs.account
                    AND other.id != sync_jobs.id
                    AND other.state = 'RUNNING'
                    AND other.heartbeat_at > ?
              )
            "
        ))
        .bind(worker)
        .bind(&now)
        .bind(Phase::Prepare.as_str())
        .bind(worker)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .bind(stamp(live_after))
        .execute(&self.pool)
        .await?
        .rows_affected();

        let job = self.job(id).await?.ok_or(Error::JobNotFound { job: id })?;
        if claimed > 0 {
            return Ok(Claim::Acquired(job));
        }
        if job.state.is_terminal() || job.state == JobState::Running {
            return Ok(Claim::Unavailable(job));
        }
        debug!(account_id = %job.account, "Account running elsewhere");
        Ok(Claim::AccountBusy)
    }

    async fn heartbeat(&self, worker: &str, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&format!(
            "UPDATE sync_jobs SET heartbeat_at = ? WHERE worker = ? AND state NOT IN {TERMINAL_STATES}"
        ))
        .bind(stamp(at))
        .bind(worker)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stale_jobs(&self, live_after: DateTime<Utc>) -> Result<Vec<SyncJob>> {
        let rows = sqlx::query(&format!(
            r"
            SELECT record FROM sync_jobs
            WHERE state NOT IN {TERMINAL_STATES}
              AND (heartbeat_at IS NULL OR heartbeat_at <= ?)
            "
        ))
        .bind(stamp(live_after))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_job).collect()
    }

    async fn append_progress(&self, id: JobId, event: &ProgressEvent) -> Result<()> {
        sqlx::query("INSERT INTO job_progress (job_id, event) VALUES (?, ?)")
            .bind(id.to_string())
            .bind(serde_json::to_string(event)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn progress(&self, id: JobId) -> Result<Vec<ProgressEvent>> {
        let rows = sqlx::query("SELECT event FROM job_progress WHERE job_id = ? ORDER BY seq ASC")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<ProgressEvent> {
                let event: String = row.try_get("event")?;
                Ok(serde_json::from_str(&event)?)
            })
            .collect()
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = stamp(cutoff);
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            r"
            DELETE FROM job_progress WHERE job_id IN (
                SELECT id FROM sync_jobs WHERE state IN {TERMINAL_STATES} AND finished_at < ?
            )
            "
        ))
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;

        let purged = sqlx::query(&format!(
            "DELETE FROM sync_jobs WHERE state IN {TERMINAL_STATES} AND finished_at < ?"
        ))
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        debug!(purged, "Purged finished jobs");
        Ok(purged)
    }
}
