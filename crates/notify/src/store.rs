//! Notification record persistence.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use enforcement_core::{CaseId, Entity, NotificationId};

use crate::record::{NotificationRecord, TransitionError};

/// Record store abstraction.
///
/// `update_with` is a read-modify-write: implementations hold their write lock
/// (or transaction) across the closure so concurrent callers see whole updates.
pub trait NotificationStore: Send + Sync {
    fn create(&self, record: &NotificationRecord) -> Result<(), StoreError>;

    fn get(&self, id: NotificationId) -> Result<Option<NotificationRecord>, StoreError>;

    fn update_with(
        &self,
        id: NotificationId,
        apply: &mut dyn FnMut(&mut NotificationRecord) -> Result<(), TransitionError>,
    ) -> Result<NotificationRecord, StoreError>;

    /// Records belonging to a case, oldest first.
    fn list_by_case(&self, case_id: CaseId) -> Result<Vec<NotificationRecord>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("notification not found: {0}")]
    NotFound(NotificationId),
    #[error("notification already exists: {0}")]
    AlreadyExists(NotificationId),
    #[error(transparent)]
    Rejected(#[from] TransitionError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(_: PoisonError<T>) -> Self {
        StoreError::Storage("record store lock poisoned".to_string())
    }
}

impl<S: NotificationStore + ?Sized> NotificationStore for Arc<S> {
    fn create(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        (**self).create(record)
    }

    fn get(&self, id: NotificationId) -> Result<Option<NotificationRecord>, StoreError> {
        (**self).get(id)
    }

    fn update_with(
        &self,
        id: NotificationId,
        apply: &mut dyn FnMut(&mut NotificationRecord) -> Result<(), TransitionError>,
    ) -> Result<NotificationRecord, StoreError> {
        (**self).update_with(id, apply)
    }

    fn list_by_case(&self, case_id: CaseId) -> Result<Vec<NotificationRecord>, StoreError> {
        (**self).list_by_case(case_id)
    }
}

/// In-memory record store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryNotificationStore {
    records: RwLock<HashMap<NotificationId, NotificationRecord>>,
}

impl InMemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NotificationStore for InMemoryNotificationStore {
    fn create(&self, record: &NotificationRecord) -> Result<(), StoreError> {
        let id = *record.id();
        let mut records = self.records.write()?;
        if records.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        records.insert(id, record.clone());
        Ok(())
    }

    fn get(&self, id: NotificationId) -> Result<Option<NotificationRecord>, StoreError> {
        Ok(self.records.read()?.get(&id).cloned())
    }

    fn update_with(
        &self,
        id: NotificationId,
        apply: &mut dyn FnMut(&mut NotificationRecord) -> Result<(), TransitionError>,
    ) -> Result<NotificationRecord, StoreError> {
        let mut records = self.records.write()?;
        let current = records.get(&id).ok_or(StoreError::NotFound(id))?;

        // Work on a copy so a rejected change leaves the stored row untouched.
        let mut next = current.clone();
        apply(&mut next)?;
        records.insert(id, next.clone());
        Ok(next)
    }

    fn list_by_case(&self, case_id: CaseId) -> Result<Vec<NotificationRecord>, StoreError> {
        let records = self.records.read()?;
        let mut result: Vec<_> = records
            .values()
            .filter(|r| r.case_id == case_id)
            .cloned()
            .collect();
        result.sort_by_key(|r| (r.scheduled_at, r.id));
        Ok(result)
    }
}
