//! SQLite-backed notification record store.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use enforcement_core::{CaseId, NotificationId};
use enforcement_notify::{
    NotificationRecord, NotificationStatus, NotificationStore, NotificationType,
    ProviderNotificationId, StoreError, TransitionError,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS case_notifications (
        id TEXT PRIMARY KEY,
        case_id TEXT NOT NULL,
        provider_notification_id TEXT,
        status TEXT NOT NULL,
        notification_type TEXT NOT NULL,
        recipient TEXT NOT NULL,
        scheduled_at TEXT NOT NULL,
        submitted_at TEXT,
        last_updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_case_notifications_case_id
        ON case_notifications(case_id);
";

const COLUMNS: &str = "id, case_id, provider_notification_id, status, notification_type, \
                       recipient, scheduled_at, submitted_at, last_updated_at";

pub struct SqliteNotificationStore {
    conn: Mutex<Connection>,
}

impl SqliteNotificationStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(storage)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5)).map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn storage(e: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(e.to_string())
}

/// Column values as stored, before domain parsing.
struct RawRecord {
    id: String,
    case_id: String,
    provider_notification_id: Option<String>,
    status: String,
    notification_type: String,
    recipient: String,
    scheduled_at: String,
    submitted_at: Option<String>,
    last_updated_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            case_id: row.get(1)?,
            provider_notification_id: row.get(2)?,
            status: row.get(3)?,
            notification_type: row.get(4)?,
            recipient: row.get(5)?,
            scheduled_at: row.get(6)?,
            submitted_at: row.get(7)?,
            last_updated_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<NotificationRecord, StoreError> {
        Ok(NotificationRecord {
            id: self.id.parse::<NotificationId>().map_err(storage)?,
            case_id: self.case_id.parse::<CaseId>().map_err(storage)?,
            provider_notification_id: self
                .provider_notification_id
                .map(ProviderNotificationId::new)
                .transpose()
                .map_err(storage)?,
            status: self.status.parse::<NotificationStatus>().map_err(storage)?,
            notification_type: NotificationType::parse(&self.notification_type).ok_or_else(
                || storage(format!("unknown notification type: {}", self.notification_type)),
            )?,
            recipient: self.recipient,
            scheduled_at: timestamp(&self.scheduled_at)?,
            submitted_at: self.submitted_at.as_deref().map(timestamp).transpose()?,
            last_updated_at: timestamp(&self.last_updated_at)?,
        })
    }
}

fn timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(storage)
}

fn select_one(conn: &Connection, id: NotificationId) -> Result<Option<NotificationRecord>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM case_notifications WHERE id = ?1"),
            params![id.to_string()],
            RawRecord::from_row,
        )
        .optional()
        .map_err(storage)?;
    raw.map(RawRecord::into_record).transpose()
}

impl NotificationStore for SqliteNotificationStore {
    fn create(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock()?;
        let inserted = conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO case_notifications ({COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    record.id.to_string(),
                    record.case_id.to_string(),
                    record.provider_notification_id.as_ref().map(|p| p.as_str()),
                    record.status.as_str(),
                    record.notification_type.as_str(),
                    record.recipient,
                    record.scheduled_at.to_rfc3339(),
                    record.submitted_at.map(|t| t.to_rfc3339()),
                    record.last_updated_at.to_rfc3339(),
                ],
            )
            .map_err(storage)?;

        if inserted == 0 {
            return Err(StoreError::AlreadyExists(record.id));
        }
        Ok(())
    }

    fn get(&self, id: NotificationId) -> Result<Option<NotificationRecord>, StoreError> {
        let conn = self.conn.lock()?;
        select_one(&conn, id)
    }

    fn update_with(
        &self,
        id: NotificationId,
        apply: &mut dyn FnMut(&mut NotificationRecord) -> Result<(), TransitionError>,
    ) -> Result<NotificationRecord, StoreError> {
        let mut conn = self.conn.lock()?;
        let tx = conn.transaction().map_err(storage)?;

        let mut record = select_one(&tx, id)?.ok_or(StoreError::NotFound(id))?;
        apply(&mut record)?;

        tx.execute(
            "UPDATE case_notifications \
             SET provider_notification_id = ?2, status = ?3, submitted_at = ?4, last_updated_at = ?5 \
             WHERE id = ?1",
            params![
                id.to_string(),
                record.provider_notification_id.as_ref().map(|p| p.as_str()),
                record.status.as_str(),
                record.submitted_at.map(|t| t.to_rfc3339()),
                record.last_updated_at.to_rfc3339(),
            ],
        )
        .map_err(storage)?;
        tx.commit().map_err(storage)?;

        Ok(record)
    }

    fn list_by_case(&self, case_id: CaseId) -> Result<Vec<NotificationRecord>, StoreError> {
        let conn = self.conn.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COLUMNS} FROM case_notifications WHERE case_id = ?1 \
                 ORDER BY scheduled_at, id"
            ))
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![case_id.to_string()], RawRecord::from_row)
            .map_err(storage)?;

        let mut records = Vec::new();
        for raw in rows {
            records.push(raw.map_err(storage)?.into_record()?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> NotificationRecord {
        NotificationRecord::new_email(CaseId::new(), "a@example.com", Utc::now())
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = SqliteNotificationStore::open_in_memory().unwrap();
        let r = record();

        store.create(&r).unwrap();
        let loaded = store.get(r.id).unwrap().unwrap();

        assert_eq!(loaded.id, r.id);
        assert_eq!(loaded.case_id, r.case_id);
        assert_eq!(loaded.status, NotificationStatus::PendingSchedule);
        assert_eq!(loaded.notification_type, NotificationType::Email);
        assert_eq!(loaded.recipient, "a@example.com");
        assert_eq!(loaded.scheduled_at, r.scheduled_at);
        assert!(loaded.submitted_at.is_none());
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let store = SqliteNotificationStore::open_in_memory().unwrap();
        let r = record();
        store.create(&r).unwrap();

        assert_eq!(store.create(&r), Err(StoreError::AlreadyExists(r.id)));
    }

    #[test]
    fn update_persists_status_and_provider_id() {
        let store = SqliteNotificationStore::open_in_memory().unwrap();
        let r = record();
        store.create(&r).unwrap();
        let p1 = ProviderNotificationId::new("P1").unwrap();

        store
            .update_with(r.id, &mut |rec| {
                rec.transition(NotificationStatus::Submitted, Some(p1.clone()), Utc::now())
            })
            .unwrap();

        let loaded = store.get(r.id).unwrap().unwrap();
        assert_eq!(loaded.status, NotificationStatus::Submitted);
        assert_eq!(loaded.provider_notification_id, Some(p1));
        assert!(loaded.submitted_at.is_some());
    }

    #[test]
    fn rejected_transition_rolls_back() {
        let store = SqliteNotificationStore::open_in_memory().unwrap();
        let r = record();
        store.create(&r).unwrap();
        store
            .update_with(r.id, &mut |rec| {
                rec.transition(NotificationStatus::TechnicalFailure, None, Utc::now())
            })
            .unwrap();

        let err = store
            .update_with(r.id, &mut |rec| {
                rec.transition(NotificationStatus::Delivered, None, Utc::now())
            })
            .unwrap_err();

        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(
            store.get(r.id).unwrap().unwrap().status,
            NotificationStatus::TechnicalFailure
        );
    }

    #[test]
    fn missing_record() {
        let store = SqliteNotificationStore::open_in_memory().unwrap();
        let id = NotificationId::new();

        assert!(store.get(id).unwrap().is_none());
        assert_eq!(
            store.update_with(id, &mut |_| Ok(())).unwrap_err(),
            StoreError::NotFound(id)
        );
    }

    #[test]
    fn records_survive_reopen() {
        let path = std::env::temp_dir().join(format!("notify-{}.db", NotificationId::new()));
        let r = record();
        {
            let store = SqliteNotificationStore::open(&path).unwrap();
            store.create(&r).unwrap();
            store
                .update_with(r.id, &mut |rec| {
                    rec.transition(NotificationStatus::Scheduled, None, Utc::now())
                })
                .unwrap();
        }

        let reopened = SqliteNotificationStore::open(&path).unwrap();
        assert_eq!(
            reopened.get(r.id).unwrap().unwrap().status,
            NotificationStatus::Scheduled
        );
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn list_by_case_returns_only_that_case() {
        let store = SqliteNotificationStore::open_in_memory().unwrap();
        let case = CaseId::new();
        let now = Utc::now();
        store.create(&NotificationRecord::new_email(case, "a@example.com", now)).unwrap();
        store.create(&NotificationRecord::new_email(case, "b@example.com", now)).unwrap();
        store.create(&record()).unwrap();

        let listed = store.list_by_case(case).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|r| r.case_id == case));
    }
}
