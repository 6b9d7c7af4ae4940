//! In-memory persistence adapter. Useful for tests; all state is lost when
//! the process exits.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::messaging::SourceId;
use crate::sideline::SidelineId;

use super::{PersistenceAdapter, PersistenceError, SidelineRequestRecord};

#[derive(Default)]
struct State {
    opened: bool,
    consumer_offsets: BTreeMap<(SourceId, i32), i64>,
    requests: BTreeMap<(SidelineId, i32), SidelineRequestRecord>,
}

#[derive(Default)]
pub struct InMemoryPersistenceAdapter {
    state: Mutex<State>,
}

impl InMemoryPersistenceAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn opened(&self) -> Result<parking_lot::MutexGuard<'_, State>, PersistenceError> {
        let guard = self.state.lock();
        if !guard.opened {
            return Err(PersistenceError::NotOpened);
        }
        Ok(guard)
    }
}

impl PersistenceAdapter for InMemoryPersistenceAdapter {
    fn open(&self) -> Result<(), PersistenceError> {
        self.state.lock().opened = true;
        Ok(())
    }

    fn close(&self) {
        let mut guard = self.state.lock();
        guard.consumer_offsets.clear();
        guard.requests.clear();
    }

    fn persist_consumer_offset(
        &self,
        source_id: &SourceId,
        partition: i32,
        offset: i64,
    ) -> Result<(), PersistenceError> {
        self.opened()?
            .consumer_offsets
            .insert((source_id.clone(), partition), offset);
        Ok(())
    }

    fn retrieve_consumer_offset(
        &self,
        source_id: &SourceId,
        partition: i32,
    ) -> Result<Option<i64>, PersistenceError> {
        Ok(self
            .opened()?
            .consumer_offsets
            .get(&(source_id.clone(), partition))
            .copied())
    }

    fn clear_consumer_offset(
        &self,
        source_id: &SourceId,
        partition: i32,
    ) -> Result<(), PersistenceError> {
        self.opened()?
            .consumer_offsets
            .remove(&(source_id.clone(), partition));
        Ok(())
    }

    fn persist_sideline_request(
        &self,
        id: &SidelineId,
        partition: i32,
        record: &SidelineRequestRecord,
    ) -> Result<(), PersistenceError> {
        self.opened()?
            .requests
            .insert((id.clone(), partition), record.clone());
        Ok(())
    }

    fn retrieve_sideline_request(
        &self,
        id: &SidelineId,
        partition: i32,
    ) -> Result<Option<SidelineRequestRecord>, PersistenceError> {
        Ok(self.opened()?.requests.get(&(id.clone(), partition)).cloned())
    }

    fn clear_sideline_request(
        &self,
        id: &SidelineId,
        partition: i32,
    ) -> Result<(), PersistenceError> {
        self.opened()?.requests.remove(&(id.clone(), partition));
        Ok(())
    }

    fn list_sideline_requests(&self) -> Result<Vec<SidelineId>, PersistenceError> {
        let guard = self.opened()?;
        let mut ids: Vec<SidelineId> = guard.requests.keys().map(|(id, _)| id.clone()).collect();
        ids.dedup();
        Ok(ids)
    }

    fn list_sideline_request_partitions(
        &self,
        id: &SidelineId,
    ) -> Result<Vec<i32>, PersistenceError> {
        Ok(self
            .opened()?
            .requests
            .keys()
            .filter(|(stored, _)| stored == id)
            .map(|(_, partition)| *partition)
            .collect())
    }
}
