//! Task CRUD and queries, inside a storage transaction.

use std::collections::BTreeSet;

use redb::{ReadableTable, Table};

use flotilla_core::ScheduledTask;

use crate::error::{map_err, StateError, StateResult};
use crate::query::TaskQuery;

type TaskTable<'t> = Table<'t, &'static str, &'static [u8]>;

/// Typed view over the tasks table. Read operations are available on any
/// transaction; mutations only inside `Storage::write`.
pub struct TaskStore<T> {
    pub(crate) table: T,
}

impl<T: ReadableTable<&'static str, &'static [u8]>> TaskStore<T> {
    pub fn fetch_task(&self, task_id: &str) -> StateResult<Option<ScheduledTask>> {
        match self.table.get(task_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let task =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Scan the table, returning tasks matching the query.
    pub fn fetch(&self, query: &TaskQuery) -> StateResult<Vec<ScheduledTask>> {
        let mut results = Vec::new();
        for entry in self.table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let task: ScheduledTask =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if query.matches(&task) {
                results.push(task);
            }
        }
        Ok(results)
    }
}

impl<'t> TaskStore<TaskTable<'t>> {
    /// Insert or overwrite the given task records.
    pub fn save_tasks(&mut self, tasks: &[ScheduledTask]) -> StateResult<()> {
        for task in tasks {
            let value = serde_json::to_vec(task).map_err(map_err!(Serialize))?;
            self.table
                .insert(task.id(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        Ok(())
    }

    /// Apply `mutator` to the stored task, persist the result and return
    /// it. Returns `None` when the task does not exist.
    pub fn mutate_task(
        &mut self,
        task_id: &str,
        mutator: impl FnOnce(ScheduledTask) -> ScheduledTask,
    ) -> StateResult<Option<ScheduledTask>> {
        let current = match self.fetch_task(task_id)? {
            Some(task) => task,
            None => return Ok(None),
        };
        let mutated = mutator(current);
        if mutated.id() != task_id {
            return Err(StateError::Write(format!(
                "mutation changed task id {task_id} to {}",
                mutated.id()
            )));
        }
        let value = serde_json::to_vec(&mutated).map_err(map_err!(Serialize))?;
        self.table
            .insert(task_id, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(Some(mutated))
    }

    /// Remove the given tasks, returning the records that existed.
    pub fn delete_tasks(&mut self, task_ids: &BTreeSet<String>) -> StateResult<Vec<ScheduledTask>> {
        let mut deleted = Vec::new();
        for id in task_ids {
            if let Some(guard) = self.table.remove(id.as_str()).map_err(map_err!(Write))? {
                let task =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                deleted.push(task);
            }
        }
        Ok(deleted)
    }
}
