//! The single-valued cluster-framework identifier.

use redb::{ReadableTable, Table};

use crate::error::{map_err, StateResult};
use crate::tables::FRAMEWORK_ID_KEY;

type SchedulerTable<'t> = Table<'t, &'static str, &'static [u8]>;

/// Typed view over the scheduler table.
pub struct SchedulerStore<T> {
    pub(crate) table: T,
}

impl<T: ReadableTable<&'static str, &'static [u8]>> SchedulerStore<T> {
    pub fn fetch_framework_id(&self) -> StateResult<Option<String>> {
        match self.table.get(FRAMEWORK_ID_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let id = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }
}

impl<'t> SchedulerStore<SchedulerTable<'t>> {
    pub fn save_framework_id(&mut self, framework_id: &str) -> StateResult<()> {
        let value = serde_json::to_vec(framework_id).map_err(map_err!(Serialize))?;
        self.table
            .insert(FRAMEWORK_ID_KEY, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }
}
