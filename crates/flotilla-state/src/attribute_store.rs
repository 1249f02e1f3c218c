//! Host attribute records with merge-on-save semantics.

use redb::{ReadableTable, Table};

use flotilla_core::{HostAttributes, MaintenanceMode};

use crate::error::{map_err, StateError, StateResult};

type AttributeTable<'t> = Table<'t, &'static str, &'static [u8]>;

/// Typed view over the host-attributes table.
pub struct AttributeStore<T> {
    pub(crate) table: T,
}

impl<T: ReadableTable<&'static str, &'static [u8]>> AttributeStore<T> {
    pub fn fetch_host_attributes(&self, host: &str) -> StateResult<Option<HostAttributes>> {
        match self.table.get(host).map_err(map_err!(Read))? {
            Some(guard) => {
                let attributes =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(attributes))
            }
            None => Ok(None),
        }
    }

    pub fn fetch_all(&self) -> StateResult<Vec<HostAttributes>> {
        let mut results = Vec::new();
        for entry in self.table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let attributes: HostAttributes =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(attributes);
        }
        Ok(results)
    }
}

impl<'t> AttributeStore<AttributeTable<'t>> {
    /// Save an attribute record, merging with the previous record for the
    /// host: a save that omits the maintenance mode inherits the stored
    /// mode (defaulting to `None`). Returns whether the stored record
    /// changed.
    ///
    /// Attributes with an empty value set are rejected.
    ///
    /// Crate-internal: callers go through
    /// `StoreProvider::save_host_attributes`, which also enqueues the
    /// change event.
    pub(crate) fn save_host_attributes(&mut self, attributes: HostAttributes) -> StateResult<bool> {
        if attributes.attributes.iter().any(|a| a.values.is_empty()) {
            return Err(StateError::EmptyAttributeValues(attributes.host));
        }

        let previous = self.fetch_host_attributes(&attributes.host)?;
        let merged = merge(attributes, previous.as_ref());

        let changed = previous.as_ref() != Some(&merged);
        let value = serde_json::to_vec(&merged).map_err(map_err!(Serialize))?;
        self.table
            .insert(merged.host.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(changed)
    }
}

fn merge(mut incoming: HostAttributes, previous: Option<&HostAttributes>) -> HostAttributes {
    if incoming.mode.is_none() {
        incoming.mode = Some(
            previous
                .and_then(|p| p.mode)
                .unwrap_or(MaintenanceMode::None),
        );
    }
    incoming
}
