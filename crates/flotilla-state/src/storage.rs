//! Storage — the single write-transaction lane over redb.
//!
//! All durable mutations go through [`Storage::write`]: one writer at a
//! time, one atomic commit per call, and events enqueued during the
//! closure delivered to the bus strictly after the commit succeeds.
//! `write` must not be called from inside a `write` closure; the writer
//! lane is not reentrant.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use redb::{Database, ReadTransaction, ReadOnlyTable, Table, WriteTransaction};
use tracing::debug;

use flotilla_core::HostAttributes;

use crate::attribute_store::AttributeStore;
use crate::error::{map_err, StateError, StateResult};
use crate::events::{EventBus, HostAttributesChanged, SchedulerEvent};
use crate::quota_store::QuotaStore;
use crate::scheduler_store::SchedulerStore;
use crate::tables::{HOST_ATTRIBUTES, QUOTAS, SCHEDULER, TASKS};
use crate::task_store::TaskStore;

type Bytes = &'static [u8];
type Str = &'static str;

/// Mutable sub-stores plus the pending-event queue of one write
/// transaction.
pub struct StoreProvider<'t> {
    pub tasks: TaskStore<Table<'t, Str, Bytes>>,
    pub attributes: AttributeStore<Table<'t, Str, Bytes>>,
    pub quotas: QuotaStore<Table<'t, Str, Bytes>>,
    pub scheduler: SchedulerStore<Table<'t, Str, Bytes>>,
    events: &'t mut Vec<SchedulerEvent>,
}

impl<'t> StoreProvider<'t> {
    fn new(txn: &'t WriteTransaction, events: &'t mut Vec<SchedulerEvent>) -> StateResult<Self> {
        Ok(Self {
            tasks: TaskStore {
                table: txn.open_table(TASKS).map_err(map_err!(Table))?,
            },
            attributes: AttributeStore {
                table: txn.open_table(HOST_ATTRIBUTES).map_err(map_err!(Table))?,
            },
            quotas: QuotaStore {
                table: txn.open_table(QUOTAS).map_err(map_err!(Table))?,
            },
            scheduler: SchedulerStore {
                table: txn.open_table(SCHEDULER).map_err(map_err!(Table))?,
            },
            events,
        })
    }

    /// Queue an event for post-commit delivery. Events fire in enqueue
    /// order once the transaction commits; they are dropped if it aborts.
    pub fn enqueue_event(&mut self, event: SchedulerEvent) {
        self.events.push(event);
    }

    /// Save a host attribute record (merge semantics, see
    /// [`AttributeStore`]), enqueueing a `HostAttributesChanged` event
    /// when the stored record changed. Returns whether it changed.
    pub fn save_host_attributes(&mut self, attributes: HostAttributes) -> StateResult<bool> {
        let host = attributes.host.clone();
        let changed = self.attributes.save_host_attributes(attributes)?;
        if changed {
            // The event carries the stored record, with the merged mode.
            let stored = self
                .attributes
                .fetch_host_attributes(&host)?
                .ok_or_else(|| StateError::Read(format!("attributes for {host} vanished")))?;
            self.events
                .push(SchedulerEvent::HostAttributesChanged(HostAttributesChanged {
                    attributes: stored,
                }));
        }
        Ok(changed)
    }
}

/// Read-only sub-stores of one snapshot-isolated read transaction.
pub struct ReadProvider {
    pub tasks: TaskStore<ReadOnlyTable<Str, Bytes>>,
    pub attributes: AttributeStore<ReadOnlyTable<Str, Bytes>>,
    pub quotas: QuotaStore<ReadOnlyTable<Str, Bytes>>,
    pub scheduler: SchedulerStore<ReadOnlyTable<Str, Bytes>>,
}

impl ReadProvider {
    fn new(txn: &ReadTransaction) -> StateResult<Self> {
        Ok(Self {
            tasks: TaskStore {
                table: txn.open_table(TASKS).map_err(map_err!(Table))?,
            },
            attributes: AttributeStore {
                table: txn.open_table(HOST_ATTRIBUTES).map_err(map_err!(Table))?,
            },
            quotas: QuotaStore {
                table: txn.open_table(QUOTAS).map_err(map_err!(Table))?,
            },
            scheduler: SchedulerStore {
                table: txn.open_table(SCHEDULER).map_err(map_err!(Table))?,
            },
        })
    }
}

/// Thread-safe transactional storage with post-commit event delivery.
#[derive(Clone)]
pub struct Storage {
    db: Arc<Database>,
    bus: Arc<EventBus>,
    /// Serializes writers: the single logical write lane.
    writer: Arc<Mutex<()>>,
}

impl Storage {
    /// Open (or create) persistent storage at the given path.
    pub fn open(path: &Path, bus: Arc<EventBus>) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let storage = Self {
            db: Arc::new(db),
            bus,
            writer: Arc::new(Mutex::new(())),
        };
        storage.ensure_tables()?;
        debug!(?path, "storage opened");
        Ok(storage)
    }

    /// Create ephemeral in-memory storage (for testing).
    pub fn open_in_memory(bus: Arc<EventBus>) -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let storage = Self {
            db: Arc::new(db),
            bus,
            writer: Arc::new(Mutex::new(())),
        };
        storage.ensure_tables()?;
        Ok(storage)
    }

    /// The bus post-commit events are delivered to.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Run `f` inside the write transaction. On success the transaction
    /// commits and enqueued events are published in order; on error the
    /// transaction aborts and events are dropped.
    ///
    /// Generic over the caller's error type so domain errors abort the
    /// transaction without wrapping.
    pub fn write<R, E: From<StateError>>(
        &self,
        f: impl FnOnce(&mut StoreProvider<'_>) -> Result<R, E>,
    ) -> Result<R, E> {
        let _lane = self.writer.lock();
        let txn = self
            .db
            .begin_write()
            .map_err(map_err!(Transaction))
            .map_err(E::from)?;
        let mut events = Vec::new();
        let result = {
            let mut provider = StoreProvider::new(&txn, &mut events).map_err(E::from)?;
            f(&mut provider)
        };
        match result {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction)).map_err(E::from)?;
                for event in &events {
                    self.bus.publish(event);
                }
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction)).map_err(E::from)?;
                Err(e)
            }
        }
    }

    /// Run `f` against a consistent read snapshot.
    pub fn read<R, E: From<StateError>>(
        &self,
        f: impl FnOnce(&ReadProvider) -> Result<R, E>,
    ) -> Result<R, E> {
        let txn = self
            .db
            .begin_read()
            .map_err(map_err!(Transaction))
            .map_err(E::from)?;
        let provider = ReadProvider::new(&txn).map_err(E::from)?;
        f(&provider)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(HOST_ATTRIBUTES).map_err(map_err!(Table))?;
        txn.open_table(QUOTAS).map_err(map_err!(Table))?;
        txn.open_table(SCHEDULER).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}
