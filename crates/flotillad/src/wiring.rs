//! Explicit construction of the scheduling core.
//!
//! Every component receives its collaborators as constructor arguments;
//! there is no runtime lookup. The order below follows the dependency
//! graph: bus and storage first, then the managers, then the workers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};
use uuid::Uuid;

use flotilla_core::{Clock, Driver, ScheduleStatus};
use flotilla_offers::{OfferManager, OfferOrder, OfferOrdering, OfferSettings};
use flotilla_preemptor::{Preemptor, PreemptorSettings};
use flotilla_scheduler::{
    FlapPenaltyCalculator, FlapPenaltySettings, NullUpdateAgentReserver, PreemptionReservations,
    ReconcilerSettings, SchedulingSettings, StateManager, TaskReconciler, TaskScheduler,
    TaskThrottler, UuidTaskIdGenerator,
};
use flotilla_state::{EventBus, SchedulerEvent, StateError, Storage};

use crate::Options;

/// The wired core, ready to start.
pub struct Core {
    pub storage: Storage,
    pub bus: Arc<EventBus>,
    pub offer_manager: Arc<OfferManager>,
    pub state_manager: Arc<StateManager>,
    pub task_scheduler: Arc<TaskScheduler>,
    pub preemptor: Arc<Preemptor>,
    pub reconciler: Arc<TaskReconciler>,
    pub throttler: Arc<TaskThrottler>,
    pub framework_id: String,
}

pub fn wire(
    options: &Options,
    driver: Arc<dyn Driver>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Core> {
    let bus = Arc::new(EventBus::new());
    let storage = Storage::open(&options.data_dir.join("flotilla.redb"), Arc::clone(&bus))?;

    let offer_manager = Arc::new(OfferManager::new(
        Arc::clone(&driver),
        Arc::clone(&clock),
        offer_settings(options)?,
    ));

    let penalty = Arc::new(FlapPenaltyCalculator::new(
        FlapPenaltySettings::default(),
        Arc::clone(&clock),
    ));
    let state_manager = Arc::new(StateManager::new(
        Arc::clone(&clock),
        Arc::clone(&driver),
        Arc::new(UuidTaskIdGenerator),
        Arc::clone(&penalty) as _,
    )?);

    let reservations = Arc::new(PreemptionReservations::new(
        Arc::clone(&clock),
        Duration::from_secs(options.reservation_lifetime_secs),
    ));

    let task_scheduler = Arc::new(TaskScheduler::new(
        storage.clone(),
        Arc::clone(&state_manager),
        Arc::clone(&offer_manager),
        Arc::clone(&reservations),
        Arc::new(NullUpdateAgentReserver),
        SchedulingSettings {
            batch_size: options.schedule_batch_size,
        },
    ));

    let preemptor = Arc::new(Preemptor::new(
        storage.clone(),
        Arc::clone(&state_manager),
        Arc::clone(&offer_manager),
        Arc::clone(&reservations),
        Arc::clone(&clock),
        PreemptorSettings {
            enabled: options.preemptor_enabled,
            search_interval: Duration::from_secs(options.preemptor_search_interval_secs),
            preemption_delay: Duration::from_secs(options.preemptor_delay_secs),
            reservation_max_batch_size: options.preemptor_reservation_max_batch_size,
        },
    ));

    let reconciler = Arc::new(TaskReconciler::new(
        ReconcilerSettings {
            initial_delay: Duration::from_secs(options.reconciliation_initial_delay_mins * 60),
            explicit_interval: Duration::from_secs(
                options.reconciliation_explicit_interval_mins * 60,
            ),
            implicit_interval: Duration::from_secs(
                options.reconciliation_implicit_interval_mins * 60,
            ),
            spread: Duration::from_secs(options.reconciliation_spread_mins * 60),
            batch_size: options.reconciliation_batch_size,
            batch_delay: Duration::from_secs(options.reconciliation_batch_delay_secs),
        },
        storage.clone(),
        Arc::clone(&driver),
    )?);

    let throttler = Arc::new(TaskThrottler::new(
        storage.clone(),
        Arc::clone(&state_manager),
        penalty,
    ));

    let framework_id = storage.write(|p| {
        if let Some(id) = p.scheduler.fetch_framework_id()? {
            Ok::<_, StateError>(id)
        } else {
            let id = format!("flotilla-{}", Uuid::new_v4());
            p.scheduler.save_framework_id(&id)?;
            Ok(id)
        }
    })?;

    Ok(Core {
        storage,
        bus,
        offer_manager,
        state_manager,
        task_scheduler,
        preemptor,
        reconciler,
        throttler,
        framework_id,
    })
}

fn offer_settings(options: &Options) -> anyhow::Result<OfferSettings> {
    let criteria: Vec<OfferOrder> = options
        .offer_order
        .split(',')
        .map(|s| s.trim().parse())
        .collect::<Result<_, _>>()
        .map_err(anyhow::Error::msg)?;
    Ok(OfferSettings {
        min_hold: Duration::from_secs(options.offer_min_hold_secs),
        jitter_window: Duration::from_secs(options.offer_jitter_window_secs),
        order: OfferOrdering::new(criteria),
        unavailability_threshold: Duration::from_secs(options.offer_unavailability_threshold_secs),
        filter_duration: Duration::from_secs(options.offer_filter_duration_secs),
        ban_max_size: options.ban_max_cache_size,
        ban_expire_after: Duration::from_secs(options.ban_expire_after_secs),
    })
}

impl Core {
    /// Start the workers: the pending-task queue feeding the scheduler,
    /// the preemptor's search loop and the reconciliation loops, then
    /// announce the scheduler as active.
    pub fn start(&self) {
        self.start_pending_queue();
        self.throttler.start(&self.bus);
        self.preemptor.start();
        self.reconciler.start();

        let result = self.storage.write(|p| {
            p.enqueue_event(SchedulerEvent::SchedulerActive);
            Ok::<_, StateError>(())
        });
        if let Err(e) = result {
            error!(error = %e, "failed to announce scheduler activation");
        }
    }

    pub fn stop(&self) {
        self.preemptor.stop();
        self.reconciler.stop();
        self.throttler.stop();
    }

    /// Tasks entering PENDING queue up for the next scheduling pass.
    fn start_pending_queue(&self) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        self.bus.on_task_state_change(move |change| {
            if change.task.status == ScheduleStatus::Pending {
                let _ = tx.send(change.task.id().to_string());
            }
        });

        let scheduler = Arc::clone(&self.task_scheduler);
        tokio::spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut batch = vec![first];
                while batch.len() < 100 {
                    match rx.try_recv() {
                        Ok(task_id) => batch.push(task_id),
                        Err(_) => break,
                    }
                }
                let scheduler = Arc::clone(&scheduler);
                let result =
                    tokio::task::spawn_blocking(move || scheduler.schedule(&batch)).await;
                match result {
                    Ok(Ok(scheduled)) => {
                        debug!(scheduled = scheduled.len(), "scheduling pass complete");
                    }
                    Ok(Err(e)) => error!(error = %e, "scheduling pass failed"),
                    Err(e) => error!(error = %e, "scheduling worker panicked"),
                }
            }
        });
    }
}
