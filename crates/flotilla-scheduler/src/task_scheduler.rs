//! The scheduling pass: pending tasks against held offers.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use flotilla_core::{
    AssignedTask, HostAttributes, JobKey, MaintenanceMode, Offer, ScheduleStatus, TaskConfig,
    TaskConstraint, TaskGroupKey,
};
use flotilla_filter::{ActiveSiblingCounts, NoSiblings, SiblingCounts, Veto};
use flotilla_offers::{LaunchResult, OfferManager};
use flotilla_state::{Storage, StoreProvider, TaskQuery};

use crate::error::{SchedulerError, SchedulerResult};
use crate::reservations::{PreemptionReservations, UpdateAgentReserver};
use crate::state_manager::StateManager;

#[derive(Debug, Clone)]
pub struct SchedulingSettings {
    /// Pending tasks matched per write transaction.
    pub batch_size: usize,
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self { batch_size: 5 }
    }
}

/// Matches pending tasks to held offers. Each batch of tasks runs inside
/// one storage write transaction; a task that finds no fitting offer stays
/// PENDING for the preemptor to pick up.
pub struct TaskScheduler {
    storage: Storage,
    state_manager: Arc<StateManager>,
    offer_manager: Arc<OfferManager>,
    reservations: Arc<PreemptionReservations>,
    update_reserver: Arc<dyn UpdateAgentReserver>,
    settings: SchedulingSettings,
}

impl TaskScheduler {
    pub fn new(
        storage: Storage,
        state_manager: Arc<StateManager>,
        offer_manager: Arc<OfferManager>,
        reservations: Arc<PreemptionReservations>,
        update_reserver: Arc<dyn UpdateAgentReserver>,
        settings: SchedulingSettings,
    ) -> Self {
        Self {
            storage,
            state_manager,
            offer_manager,
            reservations,
            update_reserver,
            settings,
        }
    }

    /// Try to place each task, in input order, in batches of the
    /// configured size. Returns the ids that reached ASSIGNED.
    pub fn schedule(&self, task_ids: &[String]) -> SchedulerResult<BTreeSet<String>> {
        let mut scheduled = BTreeSet::new();
        for batch in task_ids.chunks(self.settings.batch_size.max(1)) {
            self.storage.write(|provider| {
                for task_id in batch {
                    if self.schedule_one(provider, task_id)? {
                        scheduled.insert(task_id.clone());
                    }
                }
                Ok::<_, SchedulerError>(())
            })?;
        }
        Ok(scheduled)
    }

    fn schedule_one(
        &self,
        provider: &mut StoreProvider<'_>,
        task_id: &str,
    ) -> SchedulerResult<bool> {
        let Some(task) = provider.tasks.fetch_task(task_id)? else {
            debug!(task_id, "task disappeared before scheduling");
            return Ok(false);
        };
        if task.status != ScheduleStatus::Pending {
            debug!(task_id, status = %task.status, "task no longer pending, skipping");
            return Ok(false);
        }

        let config = task.assigned.task.clone();
        let group = TaskGroupKey::of(&config);
        let instance_key = task.instance_key();

        // Limit constraints need the sibling counts; skip the scan for
        // tasks that carry none.
        let has_limits = config
            .constraints
            .iter()
            .any(|c| matches!(c.constraint, TaskConstraint::Limit(_)));
        let counts: Box<dyn ActiveSiblingCounts> = if has_limits {
            Box::new(sibling_counts(provider, &config.job, task_id)?)
        } else {
            Box::new(NoSiblings)
        };

        let mut failure: Option<SchedulerError> = None;
        let attempt = |offer: &Offer| {
            self.attempt_offer(provider, task_id, &config, &group, counts.as_ref(), offer)
                .unwrap_or_else(|e| {
                    failure = Some(e);
                    None
                })
        };

        // Reservation paths are checked first: a job update claiming the
        // instance wins, then a preemption slot.
        let outcome = if let Some(host) = self.update_reserver.reserved_host(&instance_key) {
            let result = self.offer_manager.launch_on_host(&host, attempt);
            if matches!(result, LaunchResult::Launched { .. }) {
                self.update_reserver.release(&host, &instance_key);
            }
            result
        } else if let Some(host) = self.reservations.reserved_host(task_id) {
            let result = self.offer_manager.launch_on_host(&host, attempt);
            // Consumed on success, dropped on failure: either way the
            // reservation is done and the open market applies next pass.
            self.reservations.release(&host);
            result
        } else {
            self.offer_manager.launch_first(&group, attempt)
        };

        if let Some(e) = failure {
            return Err(e);
        }
        Ok(matches!(outcome, LaunchResult::Launched { .. }))
    }

    /// Filter one claimed offer and, when it fits, bind and assign the
    /// task. Returning `None` re-holds the offer.
    fn attempt_offer(
        &self,
        provider: &mut StoreProvider<'_>,
        task_id: &str,
        config: &TaskConfig,
        group: &TaskGroupKey,
        counts: &dyn ActiveSiblingCounts,
        offer: &Offer,
    ) -> SchedulerResult<Option<AssignedTask>> {
        let attributes = match provider.attributes.fetch_host_attributes(&offer.host)? {
            Some(attributes) => attributes,
            None => HostAttributes::new(&offer.host, MaintenanceMode::None, Vec::new()),
        };

        let vetoes = flotilla_filter::vetoes(
            &offer.resources,
            &attributes,
            &config.resources,
            &config.constraints,
            config.tier,
            counts,
        );
        if !vetoes.is_empty() {
            debug!(
                task_id,
                offer_id = %offer.id,
                host = %offer.host,
                vetoes = ?vetoes.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "offer vetoed"
            );
            // Only vetoes that hold for the whole task group are worth
            // memoizing; limit and maintenance vetoes shift with cluster
            // state.
            if vetoes.iter().all(Veto::is_static) {
                self.offer_manager.ban_offer(&offer.id, group);
            }
            return Ok(None);
        }

        let Some(ports) = offer
            .resources
            .assign_ports(&config.resources.requested_ports)
        else {
            warn!(task_id, offer_id = %offer.id, "port assignment failed after fit check");
            return Ok(None);
        };

        let assigned = self.state_manager.assign_task(
            provider,
            task_id,
            &offer.host,
            &offer.agent_id,
            |mut at| {
                at.assigned_ports = ports;
                at
            },
        )?;
        Ok(Some(assigned))
    }
}

/// Active sibling tasks of `job` per (attribute, value) of the hosts they
/// occupy; the oracle behind limit constraints.
fn sibling_counts(
    provider: &StoreProvider<'_>,
    job: &JobKey,
    excluding_task_id: &str,
) -> SchedulerResult<SiblingCounts> {
    let mut counts = SiblingCounts::new();
    for sibling in provider.tasks.fetch(&TaskQuery::by_job(job).active())? {
        if sibling.id() == excluding_task_id {
            continue;
        }
        let Some(host) = &sibling.assigned.agent_host else {
            continue;
        };
        if let Some(attributes) = provider.attributes.fetch_host_attributes(host)? {
            for attribute in &attributes.attributes {
                for value in &attribute.values {
                    counts.increment(&attribute.name, value);
                }
            }
        }
    }
    Ok(counts)
}
