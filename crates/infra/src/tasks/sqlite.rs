//! SQLite-backed task store. Queued and retrying tasks survive a restart.
//!
//! Each row keeps the encoded [`ScheduledTask`] next to the columns used for
//! claiming (`status`, `execute_at` in microseconds).

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::warn;

use enforcement_core::TaskId;

use super::store::{TaskStats, TaskStore, TaskStoreError};
use super::types::{DeadLetterEntry, ScheduledTask, TaskStatus};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS scheduled_tasks (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        execute_at INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        body TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_due
        ON scheduled_tasks(status, execute_at);

    CREATE TABLE IF NOT EXISTS task_dead_letters (
        id TEXT PRIMARY KEY,
        dead_lettered_at INTEGER NOT NULL,
        reason TEXT NOT NULL,
        body TEXT NOT NULL
    );
";

/// Record and task stores may share one database file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open or create the database at `path`.
    ///
    /// Tasks a previous process left `running` are put back in the queue, so
    /// only one executor process should use a given file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TaskStoreError> {
        let conn = Connection::open(path).map_err(storage)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, TaskStoreError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, TaskStoreError> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;
        let store = Self {
            conn: Mutex::new(conn),
        };

        let requeued = store.requeue_interrupted()?;
        if requeued > 0 {
            warn!(requeued, "requeued tasks interrupted by a previous shutdown");
        }
        Ok(store)
    }

    fn requeue_interrupted(&self) -> Result<usize, TaskStoreError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction().map_err(storage)?;

        let interrupted = select_tasks(&tx, "WHERE status = 'running'", [])?;
        for mut task in interrupted.iter().cloned() {
            task.status = TaskStatus::Pending;
            write_task(&tx, &task)?;
        }
        tx.commit().map_err(storage)?;
        Ok(interrupted.len())
    }
}

fn storage(e: impl std::fmt::Display) -> TaskStoreError {
    TaskStoreError::Storage(e.to_string())
}

fn status_tag(status: &TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Failed { .. } => "failed",
        TaskStatus::DeadLettered { .. } => "dead_lettered",
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String, TaskStoreError> {
    serde_json::to_string(value).map_err(storage)
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, TaskStoreError> {
    serde_json::from_str(body).map_err(storage)
}

fn select_tasks<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Vec<ScheduledTask>, TaskStoreError> {
    let mut stmt = conn
        .prepare(&format!("SELECT body FROM scheduled_tasks {filter}"))
        .map_err(storage)?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(storage)?;

    let mut tasks = Vec::new();
    for body in rows {
        tasks.push(decode(&body.map_err(storage)?)?);
    }
    Ok(tasks)
}

fn select_task(conn: &Connection, id: TaskId) -> Result<Option<ScheduledTask>, TaskStoreError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM scheduled_tasks WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage)?;
    body.as_deref().map(decode).transpose()
}

fn insert_task(conn: &Connection, task: &ScheduledTask) -> Result<bool, TaskStoreError> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO scheduled_tasks (id, kind, status, execute_at, created_at, body) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task.id.to_string(),
                task.kind.name(),
                status_tag(&task.status),
                task.execute_at.timestamp_micros(),
                task.created_at.timestamp_micros(),
                encode(task)?,
            ],
        )
        .map_err(storage)?;
    Ok(inserted == 1)
}

/// Overwrite an existing row. Returns `false` when there is none.
fn write_task(conn: &Connection, task: &ScheduledTask) -> Result<bool, TaskStoreError> {
    let updated = conn
        .execute(
            "UPDATE scheduled_tasks SET kind = ?2, status = ?3, execute_at = ?4, body = ?5 \
             WHERE id = ?1",
            params![
                task.id.to_string(),
                task.kind.name(),
                status_tag(&task.status),
                task.execute_at.timestamp_micros(),
                encode(task)?,
            ],
        )
        .map_err(storage)?;
    Ok(updated == 1)
}

impl TaskStore for SqliteTaskStore {
    fn insert_if_absent(&self, task: ScheduledTask) -> Result<bool, TaskStoreError> {
        let conn = self.conn.lock()?;
        insert_task(&conn, &task)
    }

    fn get(&self, id: TaskId) -> Result<Option<ScheduledTask>, TaskStoreError> {
        let conn = self.conn.lock()?;
        select_task(&conn, id)
    }

    fn update(&self, task: &ScheduledTask) -> Result<(), TaskStoreError> {
        let conn = self.conn.lock()?;
        if write_task(&conn, task)? {
            Ok(())
        } else {
            Err(TaskStoreError::NotFound(task.id))
        }
    }

    fn replace(&self, task: ScheduledTask) -> Result<ScheduledTask, TaskStoreError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction().map_err(storage)?;

        let previous = select_task(&tx, task.id)?.ok_or(TaskStoreError::NotFound(task.id))?;
        write_task(&tx, &task)?;
        tx.commit().map_err(storage)?;
        Ok(previous)
    }

    fn remove(&self, id: TaskId) -> Result<bool, TaskStoreError> {
        let conn = self.conn.lock()?;
        let removed = conn
            .execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id.to_string()])
            .map_err(storage)?;
        Ok(removed > 0)
    }

    fn claim_next(
        &self,
        now: chrono::DateTime<Utc>,
    ) -> Result<Option<ScheduledTask>, TaskStoreError> {
        let mut conn = self.conn.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage)?;

        let mut due = select_tasks(
            &tx,
            "WHERE status IN ('pending', 'failed') AND execute_at <= ?1 \
             ORDER BY execute_at, created_at LIMIT 1",
            params![now.timestamp_micros()],
        )?;
        let Some(mut task) = due.pop() else {
            return Ok(None);
        };

        task.mark_running(now);
        write_task(&tx, &task)?;
        tx.commit().map_err(storage)?;
        Ok(Some(task))
    }

    fn dead_letter(&self, task: ScheduledTask, reason: String) -> Result<(), TaskStoreError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction().map_err(storage)?;

        let entry = task.into_dead_letter(reason, Utc::now());
        tx.execute(
            "DELETE FROM scheduled_tasks WHERE id = ?1",
            params![entry.task.id.to_string()],
        )
        .map_err(storage)?;
        tx.execute(
            "INSERT OR REPLACE INTO task_dead_letters (id, dead_lettered_at, reason, body) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.task.id.to_string(),
                entry.dead_lettered_at.timestamp_micros(),
                entry.reason,
                encode(&entry)?,
            ],
        )
        .map_err(storage)?;
        tx.commit().map_err(storage)?;
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, TaskStoreError> {
        let conn = self.conn.lock()?;
        let mut stmt = conn
            .prepare("SELECT body FROM task_dead_letters ORDER BY dead_lettered_at LIMIT ?1")
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                row.get::<_, String>(0)
            })
            .map_err(storage)?;

        let mut entries = Vec::new();
        for body in rows {
            entries.push(decode(&body.map_err(storage)?)?);
        }
        Ok(entries)
    }

    fn retry_dead_letter(
        &self,
        id: TaskId,
        now: chrono::DateTime<Utc>,
    ) -> Result<ScheduledTask, TaskStoreError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction().map_err(storage)?;

        if select_task(&tx, id)?.is_some() {
            return Err(TaskStoreError::AlreadyExists(id));
        }
        let body: String = tx
            .query_row(
                "SELECT body FROM task_dead_letters WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?
            .ok_or(TaskStoreError::NotFound(id))?;
        let entry: DeadLetterEntry = decode(&body)?;

        let mut task = entry.task;
        task.requeue(now);
        tx.execute("DELETE FROM task_dead_letters WHERE id = ?1", params![id.to_string()])
            .map_err(storage)?;
        insert_task(&tx, &task)?;
        tx.commit().map_err(storage)?;
        Ok(task)
    }

    fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let conn = self.conn.lock()?;
        let mut stats = TaskStats::default();

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM scheduled_tasks GROUP BY status")
            .map_err(storage)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(storage)?;
        for row in rows {
            let (status, count) = row.map_err(storage)?;
            let count = usize::try_from(count).unwrap_or_default();
            match status.as_str() {
                "pending" => stats.pending += count,
                "running" => stats.running += count,
                "failed" => stats.failed += count,
                _ => stats.dead_lettered += count,
            }
        }

        let dead: i64 = conn
            .query_row("SELECT COUNT(*) FROM task_dead_letters", [], |row| row.get(0))
            .map_err(storage)?;
        stats.dead_lettered += usize::try_from(dead).unwrap_or_default();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::types::RetryPolicy;
    use crate::tasks::types::tests::task;
    use chrono::Duration;
    use enforcement_notify::TaskKind;

    fn temp_db() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("notify-tasks-{}.db", TaskId::new()))
    }

    #[test]
    fn insert_is_idempotent_per_id() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let t = task(RetryPolicy::default(), Utc::now());

        assert!(store.insert_if_absent(t.clone()).unwrap());
        assert!(!store.insert_if_absent(t.clone()).unwrap());
        assert_eq!(store.get(t.id).unwrap(), Some(t));
        assert_eq!(store.stats().unwrap().pending, 1);
    }

    #[test]
    fn claim_respects_execute_at_and_order() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut late = task(RetryPolicy::default(), now);
        late.execute_at = now + Duration::seconds(10);
        let mut early = task(RetryPolicy::default(), now);
        early.execute_at = now + Duration::seconds(5);
        store.insert_if_absent(late.clone()).unwrap();
        store.insert_if_absent(early.clone()).unwrap();

        assert!(store.claim_next(now).unwrap().is_none());

        let at = now + Duration::seconds(10);
        let first = store.claim_next(at).unwrap().unwrap();
        assert_eq!(first.id, early.id);
        assert_eq!(first.status, TaskStatus::Running);
        assert_eq!(first.attempt, 1);
        assert_eq!(store.claim_next(at).unwrap().unwrap().id, late.id);
        assert!(store.claim_next(at).unwrap().is_none());
        assert_eq!(store.stats().unwrap().running, 2);
    }

    #[test]
    fn retrying_task_is_claimed_after_backoff() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let now = Utc::now();
        let t = task(RetryPolicy::fixed(3, std::time::Duration::from_secs(60)), now);
        store.insert_if_absent(t).unwrap();

        let mut claimed = store.claim_next(now).unwrap().unwrap();
        claimed.mark_failed("429".into(), true, now, now);
        store.update(&claimed).unwrap();

        assert_eq!(store.stats().unwrap().failed, 1);
        assert!(store.claim_next(now + Duration::seconds(59)).unwrap().is_none());
        let again = store.claim_next(now + Duration::seconds(60)).unwrap().unwrap();
        assert_eq!(again.attempt, 2);
        assert_eq!(again.history.len(), 1);
    }

    #[test]
    fn replace_and_update_require_existing_task() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let now = Utc::now();
        let t = task(RetryPolicy::default(), now);

        assert_eq!(store.replace(t.clone()).unwrap_err(), TaskStoreError::NotFound(t.id));
        assert_eq!(store.update(&t).unwrap_err(), TaskStoreError::NotFound(t.id));

        store.insert_if_absent(t.clone()).unwrap();
        let mut next = t.clone();
        next.replace_with(
            TaskKind::VerifyEmail,
            t.payload.clone(),
            now + Duration::minutes(1),
            RetryPolicy::no_retry(),
            now,
        );
        let previous = store.replace(next.clone()).unwrap();

        assert_eq!(previous, t);
        assert_eq!(store.get(t.id).unwrap(), Some(next));
    }

    #[test]
    fn dead_letter_and_retry() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let now = Utc::now();
        let t = task(RetryPolicy::default(), now);
        let id = t.id;
        store.insert_if_absent(t).unwrap();

        let claimed = store.claim_next(now).unwrap().unwrap();
        store.dead_letter(claimed, "unclassified".into()).unwrap();

        assert!(store.get(id).unwrap().is_none());
        let dls = store.list_dead_letters(10).unwrap();
        assert_eq!(dls.len(), 1);
        assert_eq!(dls[0].reason, "unclassified");
        assert!(matches!(dls[0].task.status, TaskStatus::DeadLettered { attempts: 1, .. }));
        assert_eq!(store.stats().unwrap().dead_lettered, 1);

        let retried = store.retry_dead_letter(id, now).unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.attempt, 0);
        assert!(store.list_dead_letters(10).unwrap().is_empty());
        assert_eq!(store.stats().unwrap().live(), 1);
        assert_eq!(
            store.retry_dead_letter(id, now).unwrap_err(),
            TaskStoreError::AlreadyExists(id)
        );
    }

    #[test]
    fn remove_reports_presence() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let t = task(RetryPolicy::default(), Utc::now());
        store.insert_if_absent(t.clone()).unwrap();

        assert!(store.remove(t.id).unwrap());
        assert!(!store.remove(t.id).unwrap());
    }

    #[test]
    fn tasks_survive_reopen_and_interrupted_runs_are_requeued() {
        let path = temp_db();
        let now = Utc::now();
        let waiting = task(RetryPolicy::default(), now + Duration::minutes(5));
        let mut interrupted = task(RetryPolicy::default(), now);
        interrupted.execute_at = now - Duration::seconds(1);
        {
            let store = SqliteTaskStore::open(&path).unwrap();
            store.insert_if_absent(waiting.clone()).unwrap();
            store.insert_if_absent(interrupted.clone()).unwrap();
            let claimed = store.claim_next(now).unwrap().unwrap();
            assert_eq!(claimed.id, interrupted.id);
        }

        let reopened = SqliteTaskStore::open(&path).unwrap();
        let stats = reopened.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.running, 0);
        assert_eq!(reopened.get(waiting.id).unwrap(), Some(waiting));

        let reclaimed = reopened.claim_next(now).unwrap().unwrap();
        assert_eq!(reclaimed.id, interrupted.id);
        assert_eq!(reclaimed.attempt, 2);
        let _ = std::fs::remove_file(&path);
    }
}
