//! Per-role resource quotas.

use std::collections::BTreeMap;

use redb::{ReadableTable, Table};

use flotilla_core::ResourceQuantity;

use crate::error::{map_err, StateResult};

type QuotaTable<'t> = Table<'t, &'static str, &'static [u8]>;

/// Typed view over the quota table: role → resource aggregate.
pub struct QuotaStore<T> {
    pub(crate) table: T,
}

impl<T: ReadableTable<&'static str, &'static [u8]>> QuotaStore<T> {
    pub fn fetch_quota(&self, role: &str) -> StateResult<Option<ResourceQuantity>> {
        match self.table.get(role).map_err(map_err!(Read))? {
            Some(guard) => {
                let quota =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(quota))
            }
            None => Ok(None),
        }
    }

    pub fn fetch_quotas(&self) -> StateResult<BTreeMap<String, ResourceQuantity>> {
        let mut results = BTreeMap::new();
        for entry in self.table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let quota: ResourceQuantity =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.insert(key.value().to_string(), quota);
        }
        Ok(results)
    }
}

impl<'t> QuotaStore<QuotaTable<'t>> {
    /// Insert or update the quota for a role.
    pub fn save_quota(&mut self, role: &str, quota: ResourceQuantity) -> StateResult<()> {
        let value = serde_json::to_vec(&quota).map_err(map_err!(Serialize))?;
        self.table
            .insert(role, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Remove a role's quota. Returns true if one existed.
    pub fn remove_quota(&mut self, role: &str) -> StateResult<bool> {
        Ok(self.table.remove(role).map_err(map_err!(Write))?.is_some())
    }
}
