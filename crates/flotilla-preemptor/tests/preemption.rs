//! Preemption end to end: a full cluster, a pending production task, one
//! victim killed, the freed agent reserved and then consumed by the next
//! scheduling pass.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use flotilla_core::{
    FakeClock, JobKey, Offer, PortRange, RecordingDriver, ResourceBag, ResourceRequest,
    ScheduleStatus, ScheduledTask, TaskConfig, Tier,
};
use flotilla_offers::{OfferManager, OfferOrder, OfferOrdering, OfferSettings};
use flotilla_preemptor::{Preemptor, PreemptorSettings};
use flotilla_scheduler::{
    NoPenalty, NullUpdateAgentReserver, PreemptionReservations, SchedulingSettings, StateManager,
    TaskIdGenerator, TaskScheduler,
};
use flotilla_state::{EventBus, Storage};

struct SequentialIds(Mutex<u64>);

impl TaskIdGenerator for SequentialIds {
    fn generate(&self, config: &TaskConfig, instance_id: u32) -> String {
        let mut next = self.0.lock();
        *next += 1;
        format!("{}-{}-{}", config.job.name, instance_id, *next)
    }
}

struct Cluster {
    storage: Storage,
    offers: Arc<OfferManager>,
    state_manager: Arc<StateManager>,
    reservations: Arc<PreemptionReservations>,
    preemptor: Preemptor,
    scheduler: TaskScheduler,
    driver: Arc<RecordingDriver>,
    clock: Arc<FakeClock>,
}

fn cluster(settings: PreemptorSettings) -> Cluster {
    let storage = Storage::open_in_memory(Arc::new(EventBus::new())).unwrap();
    let driver = Arc::new(RecordingDriver::new());
    let clock = Arc::new(FakeClock::new(1_000));
    let offers = Arc::new(OfferManager::new(
        Arc::clone(&driver) as _,
        Arc::clone(&clock) as _,
        OfferSettings {
            order: OfferOrdering::new(vec![OfferOrder::Fifo]),
            ..OfferSettings::default()
        },
    ));
    let state_manager = Arc::new(StateManager::with_scheduler_host(
        Arc::clone(&clock) as _,
        Arc::clone(&driver) as _,
        Arc::new(SequentialIds(Mutex::new(0))),
        Arc::new(NoPenalty),
        "scheduler-1".to_string(),
    ));
    let reservations = Arc::new(PreemptionReservations::new(
        Arc::clone(&clock) as _,
        Duration::from_secs(180),
    ));
    let preemptor = Preemptor::new(
        storage.clone(),
        Arc::clone(&state_manager),
        Arc::clone(&offers),
        Arc::clone(&reservations),
        Arc::clone(&clock) as _,
        settings,
    );
    let scheduler = TaskScheduler::new(
        storage.clone(),
        Arc::clone(&state_manager),
        Arc::clone(&offers),
        Arc::clone(&reservations),
        Arc::new(NullUpdateAgentReserver),
        SchedulingSettings::default(),
    );
    Cluster {
        storage,
        offers,
        state_manager,
        reservations,
        preemptor,
        scheduler,
        driver,
        clock,
    }
}

fn config(name: &str, tier: Tier, cpus: f64) -> TaskConfig {
    TaskConfig {
        job: JobKey::new("ops", "prod", name),
        tier,
        resources: ResourceRequest {
            cpus,
            ram_mb: 1_024,
            disk_mb: 64,
            requested_ports: flotilla_core::task::port_names(["http"]),
        },
        constraints: Vec::new(),
        is_service: true,
        max_task_failures: -1,
    }
}

/// Park a running task directly on a host, occupying its resources.
fn seed_running(c: &Cluster, id: &str, host: &str, tier: Tier, cpus: f64) {
    let mut task = ScheduledTask::new(id.to_string(), 0, config(id, tier, cpus));
    task.status = ScheduleStatus::Running;
    task.assigned.agent_host = Some(host.to_string());
    task.assigned.agent_id = Some(format!("{host}-id"));
    task.assigned.assigned_ports.insert("http".to_string(), 31_000);
    c.storage
        .write(|p| p.tasks.save_tasks(std::slice::from_ref(&task)))
        .unwrap();
}

fn insert_pending(c: &Cluster, template: &TaskConfig) -> String {
    c.storage
        .write(|p| {
            c.state_manager
                .insert_pending_tasks(p, template, &BTreeSet::from([0]))
        })
        .unwrap()
        .remove(0)
}

#[test]
fn full_cluster_preempts_one_victim_and_places_the_pending_task() {
    let c = cluster(PreemptorSettings::default());

    // 18 agents saturated by preemptible work, 2 by preferred work.
    for i in 0..18 {
        seed_running(&c, &format!("victim-{i:02}"), &format!("host-{i:02}"), Tier::Preemptible, 8.0);
    }
    for i in 18..20 {
        seed_running(&c, &format!("prod-{i:02}"), &format!("host-{i:02}"), Tier::Preferred, 8.0);
    }

    let pending = insert_pending(&c, &config("web", Tier::Preferred, 4.0));
    // Long enough in the queue to be preemption-eligible.
    c.clock.set(200_000);

    let reserved = c.preemptor.run_once().unwrap();
    assert_eq!(reserved, 1);
    assert_eq!(c.reservations.active_count(), 1);

    // Exactly one victim was told to die, and it is PREEMPTING.
    let killed = c.driver.killed_task_ids();
    assert_eq!(killed.len(), 1);
    let victim = c
        .storage
        .read(|p| p.tasks.fetch_task(&killed[0]))
        .unwrap()
        .unwrap();
    assert_eq!(victim.status, ScheduleStatus::Preempting);
    let freed_host = victim.assigned.agent_host.clone().unwrap();
    assert_eq!(
        c.reservations.reserved_host(&pending).as_deref(),
        Some(freed_host.as_str())
    );

    // A second pass does not double-preempt while the reservation lives.
    assert_eq!(c.preemptor.run_once().unwrap(), 0);
    assert_eq!(c.driver.killed_task_ids().len(), 1);

    // The agent confirms the kill; the victim is rescheduled elsewhere.
    c.storage
        .write(|p| {
            c.state_manager
                .change_state(p, &killed[0], None, ScheduleStatus::Killed, None)
                .map(|_| ())
        })
        .unwrap();
    assert!(c
        .storage
        .read(|p| p.tasks.fetch_task(&killed[0]))
        .unwrap()
        .is_none());

    // The freed agent re-offers; the next scheduling pass consumes the
    // reservation and assigns the pending task there.
    c.offers.add_offer(Offer {
        id: "offer-freed".to_string(),
        agent_id: format!("{freed_host}-id"),
        host: freed_host.clone(),
        resources: ResourceBag {
            cpus: 8.0,
            ram_mb: 16_384,
            disk_mb: 32_768,
            port_ranges: vec![PortRange { begin: 31_000, end: 31_100 }],
            revocable: false,
        },
        unavailability_start_ms: None,
    });
    let scheduled = c.scheduler.schedule(std::slice::from_ref(&pending)).unwrap();
    assert!(scheduled.contains(&pending));

    let placed = c
        .storage
        .read(|p| p.tasks.fetch_task(&pending))
        .unwrap()
        .unwrap();
    assert_eq!(placed.status, ScheduleStatus::Assigned);
    assert_eq!(placed.assigned.agent_host.as_deref(), Some(freed_host.as_str()));
    // The reservation was consumed.
    assert_eq!(c.reservations.active_count(), 0);
}

#[test]
fn same_tier_work_is_never_preempted() {
    let c = cluster(PreemptorSettings::default());
    for i in 0..5 {
        seed_running(&c, &format!("prod-{i}"), &format!("host-{i}"), Tier::Preferred, 8.0);
    }
    insert_pending(&c, &config("web", Tier::Preferred, 4.0));
    c.clock.set(200_000);

    assert_eq!(c.preemptor.run_once().unwrap(), 0);
    assert!(c.driver.killed_task_ids().is_empty());
}

#[test]
fn fresh_pending_tasks_wait_out_the_delay() {
    let c = cluster(PreemptorSettings::default());
    seed_running(&c, "victim", "host-0", Tier::Revocable, 8.0);
    insert_pending(&c, &config("web", Tier::Preferred, 4.0));
    // Inserted at t=1s, delay is 180s: not yet eligible.
    c.clock.set(120_000);

    assert_eq!(c.preemptor.run_once().unwrap(), 0);
    c.clock.set(200_000);
    assert_eq!(c.preemptor.run_once().unwrap(), 1);
}

#[test]
fn batch_size_caps_decisions_per_pass() {
    let c = cluster(PreemptorSettings {
        reservation_max_batch_size: 2,
        ..PreemptorSettings::default()
    });
    for i in 0..6 {
        seed_running(&c, &format!("victim-{i}"), &format!("host-{i}"), Tier::Preemptible, 8.0);
    }
    for name in ["a", "b", "c", "d"] {
        insert_pending(&c, &config(name, Tier::Preferred, 4.0));
    }
    c.clock.set(200_000);

    assert_eq!(c.preemptor.run_once().unwrap(), 2);
    assert_eq!(c.reservations.active_count(), 2);
    // The next pass picks up the remainder.
    assert_eq!(c.preemptor.run_once().unwrap(), 2);
    assert_eq!(c.reservations.active_count(), 4);
}

#[test]
fn victims_must_cover_the_request() {
    let c = cluster(PreemptorSettings::default());
    // Two small revocable tasks on one host: both needed for 4 cpus.
    for i in 0..2 {
        seed_running(&c, &format!("small-{i}"), "host-0", Tier::Revocable, 2.5);
    }
    let pending = insert_pending(&c, &config("web", Tier::Preferred, 4.0));
    c.clock.set(200_000);

    assert_eq!(c.preemptor.run_once().unwrap(), 1);
    // Both residents had to go.
    assert_eq!(c.driver.killed_task_ids().len(), 2);
    assert_eq!(c.reservations.reserved_host(&pending).as_deref(), Some("host-0"));
}

#[test]
fn disabled_preemptor_does_nothing() {
    let c = cluster(PreemptorSettings {
        enabled: false,
        ..PreemptorSettings::default()
    });
    seed_running(&c, "victim", "host-0", Tier::Revocable, 8.0);
    insert_pending(&c, &config("web", Tier::Preferred, 4.0));
    c.clock.set(200_000);

    assert_eq!(c.preemptor.run_once().unwrap(), 0);
}
