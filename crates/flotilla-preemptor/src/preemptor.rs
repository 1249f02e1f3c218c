//! The preemption slot search.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use flotilla_core::{
    Clock, HostAttributes, MaintenanceMode, ResourceBag, ResourceQuantity, ScheduleStatus,
    ScheduledTask,
};
use flotilla_filter::SiblingCounts;
use flotilla_offers::OfferManager;
use flotilla_scheduler::{PreemptionReservations, SchedulerError, SchedulerResult, StateManager};
use flotilla_state::{Storage, TaskQuery};

use crate::cluster_state::{ClusterSnapshot, Victim};

#[derive(Debug, Clone)]
pub struct PreemptorSettings {
    pub enabled: bool,
    /// Interval between slot-search passes.
    pub search_interval: Duration,
    /// How long a task must stay PENDING before it may trigger preemption.
    pub preemption_delay: Duration,
    /// Preemption decisions per pass; bounds the blast radius of one run.
    pub reservation_max_batch_size: usize,
}

impl Default for PreemptorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            search_interval: Duration::from_secs(60),
            preemption_delay: Duration::from_secs(3 * 60),
            reservation_max_batch_size: 5,
        }
    }
}

/// Finds victim sets on fully-utilized agents and reserves the freed
/// slots for pending high-tier tasks.
pub struct Preemptor {
    storage: Storage,
    state_manager: Arc<StateManager>,
    offer_manager: Arc<OfferManager>,
    reservations: Arc<PreemptionReservations>,
    clock: Arc<dyn Clock>,
    settings: PreemptorSettings,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Preemptor {
    pub fn new(
        storage: Storage,
        state_manager: Arc<StateManager>,
        offer_manager: Arc<OfferManager>,
        reservations: Arc<PreemptionReservations>,
        clock: Arc<dyn Clock>,
        settings: PreemptorSettings,
    ) -> Self {
        Self {
            storage,
            state_manager,
            offer_manager,
            reservations,
            clock,
            settings,
            worker: Mutex::new(None),
        }
    }

    /// Start the periodic search worker. No-op when disabled.
    pub fn start(self: &Arc<Self>) {
        if !self.settings.enabled {
            info!("preemptor disabled");
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.settings.search_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match this.run_once() {
                    Ok(0) => {}
                    Ok(reserved) => info!(reserved, "preemption pass reserved slots"),
                    Err(e) => error!(error = %e, "preemption pass failed"),
                }
            }
        });
        *self.worker.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }

    /// One slot-search pass. Returns the number of reservations made.
    pub fn run_once(&self) -> SchedulerResult<usize> {
        if !self.settings.enabled {
            return Ok(0);
        }

        let (pending, snapshot, attributes) = self.storage.read(|p| {
            let pending = p
                .tasks
                .fetch(&TaskQuery::all().statuses([ScheduleStatus::Pending]))?;
            let snapshot = ClusterSnapshot::build(p)?;
            let attributes: HashMap<String, HostAttributes> = p
                .attributes
                .fetch_all()?
                .into_iter()
                .map(|a| (a.host.clone(), a))
                .collect();
            Ok::<_, SchedulerError>((pending, snapshot, attributes))
        })?;

        let now = self.clock.now_millis();
        let delay_ms = self.settings.preemption_delay.as_millis() as u64;
        let mut eligible: Vec<&ScheduledTask> = pending
            .iter()
            .filter(|t| now.saturating_sub(arrival_ms(t)) >= delay_ms)
            .collect();
        // Highest tier first, then longest-pending, then id for stability.
        eligible.sort_by(|a, b| {
            b.assigned
                .task
                .tier
                .rank()
                .cmp(&a.assigned.task.tier.rank())
                .then(arrival_ms(a).cmp(&arrival_ms(b)))
                .then(a.id().cmp(b.id()))
        });

        // Unclaimed offer resources count toward the slot alongside what
        // the victims would free.
        let slack: HashMap<String, ResourceBag> = self
            .offer_manager
            .get_offers()
            .into_iter()
            .map(|o| (o.host.clone(), o.resources))
            .collect();

        let mut reserved = 0;
        for task in eligible {
            if reserved >= self.settings.reservation_max_batch_size {
                break;
            }
            if self.reservations.reserved_host(task.id()).is_some() {
                continue;
            }
            let Some((host, victims)) = self.find_slot(task, &snapshot, &attributes, &slack)
            else {
                continue;
            };

            let task_id = task.id().to_string();
            self.storage.write(|provider| {
                for victim in &victims {
                    self.state_manager.change_state(
                        provider,
                        &victim.task_id,
                        None,
                        ScheduleStatus::Preempting,
                        Some(format!("Preempting to make room for {task_id}")),
                    )?;
                }
                Ok::<_, SchedulerError>(())
            })?;
            self.reservations.reserve(&host, &task_id);
            info!(
                task_id = %task_id,
                host = %host,
                victims = victims.len(),
                "preemption slot reserved"
            );
            reserved += 1;
        }
        Ok(reserved)
    }

    /// Pick the best (agent, victim set) for the pending task: fewest
    /// victims, then least resource waste, ties broken by the snapshot's
    /// stable host order.
    fn find_slot(
        &self,
        task: &ScheduledTask,
        snapshot: &ClusterSnapshot,
        attributes: &HashMap<String, HostAttributes>,
        slack: &HashMap<String, ResourceBag>,
    ) -> Option<(String, Vec<Victim>)> {
        let config = &task.assigned.task;
        let need = config.resources.quantity();
        let needed_ports = config.resources.requested_ports.len();
        let my_rank = config.tier.rank();
        let counts = self.sibling_counts(task, snapshot, attributes);

        let mut best: Option<(usize, f64, String, Vec<Victim>)> = None;
        for (host, residents) in &snapshot.tasks_by_host {
            if self.reservations.is_reserved(host) {
                continue;
            }

            let mut candidates: Vec<&Victim> = residents
                .iter()
                .filter(|v| v.tier.rank() < my_rank)
                .collect();
            if candidates.is_empty() {
                continue;
            }
            // Biggest victims first: fewest kills to cover the request.
            candidates.sort_by(|a, b| {
                b.quantity
                    .cpus
                    .partial_cmp(&a.quantity.cpus)
                    .unwrap_or(Ordering::Equal)
                    .then(b.quantity.ram_mb.cmp(&a.quantity.ram_mb))
                    .then(a.task_id.cmp(&b.task_id))
            });

            let host_slack = slack.get(host.as_str());
            let mut freed = host_slack
                .map(|bag| ResourceQuantity {
                    cpus: bag.cpus,
                    ram_mb: bag.ram_mb,
                    disk_mb: bag.disk_mb,
                })
                .unwrap_or_default();
            let mut freed_ports: Vec<u16> = host_slack
                .map(|bag| {
                    bag.port_ranges
                        .iter()
                        .flat_map(|r| r.begin..=r.end)
                        .collect()
                })
                .unwrap_or_default();

            let mut chosen: Vec<Victim> = Vec::new();
            for victim in candidates {
                if freed.covers(&need) && freed_ports.len() >= needed_ports {
                    break;
                }
                freed.add(&victim.quantity);
                freed_ports.extend(&victim.ports);
                chosen.push(victim.clone());
            }
            if chosen.is_empty()
                || !freed.covers(&need)
                || freed_ports.len() < needed_ports
            {
                continue;
            }

            // Placement constraints must hold on the freed slot.
            let slot = ResourceBag::from_freed(freed, freed_ports.iter().copied());
            let default_attrs =
                HostAttributes::new(host, MaintenanceMode::None, Vec::new());
            let host_attrs = attributes.get(host.as_str()).unwrap_or(&default_attrs);
            let vetoes = flotilla_filter::vetoes(
                &slot,
                host_attrs,
                &config.resources,
                &config.constraints,
                config.tier,
                &counts,
            );
            if !vetoes.is_empty() {
                continue;
            }

            let waste = (freed.cpus - need.cpus)
                + (freed.ram_mb.saturating_sub(need.ram_mb)) as f64 / 1024.0;
            let better = match &best {
                None => true,
                Some((count, best_waste, _, _)) => {
                    chosen.len() < *count || (chosen.len() == *count && waste < *best_waste)
                }
            };
            if better {
                best = Some((chosen.len(), waste, host.clone(), chosen));
            }
        }
        best.map(|(_, _, host, victims)| (host, victims))
    }

    /// Limit-constraint oracle for the pending task, derived from the
    /// snapshot: active siblings of the same job per host attribute value.
    fn sibling_counts(
        &self,
        task: &ScheduledTask,
        snapshot: &ClusterSnapshot,
        attributes: &HashMap<String, HostAttributes>,
    ) -> SiblingCounts {
        let job = &task.assigned.task.job;
        let mut counts = SiblingCounts::new();
        for (host, residents) in &snapshot.tasks_by_host {
            let siblings = residents.iter().filter(|r| &r.job == job).count();
            if siblings == 0 {
                continue;
            }
            if let Some(attrs) = attributes.get(host.as_str()) {
                for attribute in &attrs.attributes {
                    for value in &attribute.values {
                        for _ in 0..siblings {
                            counts.increment(&attribute.name, value);
                        }
                    }
                }
            }
        }
        counts
    }
}

impl Drop for Preemptor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// When the task entered the queue: its first recorded event.
fn arrival_ms(task: &ScheduledTask) -> u64 {
    task.task_events.first().map_or(0, |e| e.timestamp_ms)
}
