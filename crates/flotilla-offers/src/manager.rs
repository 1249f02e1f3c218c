//! The offer manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use flotilla_core::{AssignedTask, Clock, Driver, Offer, TaskGroupKey};

use crate::ban::StaticBanCache;
use crate::ordering::{OfferOrdering, SequencedOffer};
use crate::settings::OfferSettings;

/// Outcome of a launch attempt over the held offers.
#[derive(Debug, PartialEq, Eq)]
pub enum LaunchResult {
    Launched { offer_id: String },
    NoFit,
}

struct HeldOffer {
    sequence: u64,
    offer: Offer,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct Pool {
    /// offer id → held offer. At most one offer per agent.
    offers: HashMap<String, HeldOffer>,
    by_agent: HashMap<String, String>,
    by_host: HashMap<String, String>,
    next_sequence: u64,
}

impl Pool {
    fn insert(&mut self, held: HeldOffer) {
        self.by_agent
            .insert(held.offer.agent_id.clone(), held.offer.id.clone());
        self.by_host
            .insert(held.offer.host.clone(), held.offer.id.clone());
        self.offers.insert(held.offer.id.clone(), held);
    }

    fn remove(&mut self, offer_id: &str) -> Option<HeldOffer> {
        let held = self.offers.remove(offer_id)?;
        self.by_agent.remove(&held.offer.agent_id);
        self.by_host.remove(&held.offer.host);
        if let Some(timer) = &held.timer {
            timer.abort();
        }
        Some(held)
    }
}

/// Thread-safe inventory of held offers.
///
/// All pool operations serialize on one mutex; the ban cache serves reads
/// under its own lock. Driver calls are never made while the pool mutex is
/// held.
pub struct OfferManager {
    inner: Arc<Inner>,
}

struct Inner {
    pool: Mutex<Pool>,
    bans: StaticBanCache,
    driver: Arc<dyn Driver>,
    clock: Arc<dyn Clock>,
    settings: OfferSettings,
}

impl OfferManager {
    pub fn new(driver: Arc<dyn Driver>, clock: Arc<dyn Clock>, settings: OfferSettings) -> Self {
        let bans = StaticBanCache::new(
            settings.ban_max_size,
            settings.ban_expire_after,
            Arc::clone(&clock),
        );
        Self {
            inner: Arc::new(Inner {
                pool: Mutex::new(Pool::default()),
                bans,
                driver,
                clock,
                settings,
            }),
        }
    }

    /// Register a newly received offer.
    ///
    /// An offer already held for the same agent is replaced (and declined);
    /// its return timer is cancelled and a fresh jittered timer armed for
    /// the new offer. Offers entering their unavailability window are
    /// declined immediately.
    pub fn add_offer(&self, offer: Offer) {
        let inner = &self.inner;
        if inner.unavailable_soon(&offer) {
            debug!(offer_id = %offer.id, host = %offer.host, "offer in unavailability window, declining");
            inner
                .driver
                .decline_offer(&offer.id, inner.settings.filter_duration);
            return;
        }

        let offer_id = offer.id.clone();
        let replaced = {
            let mut pool = inner.pool.lock();
            let replaced = pool
                .by_agent
                .get(&offer.agent_id)
                .cloned()
                .and_then(|old_id| pool.remove(&old_id));
            let sequence = pool.next_sequence;
            pool.next_sequence += 1;
            pool.insert(HeldOffer {
                sequence,
                offer,
                timer: Inner::arm_return_timer(inner, &offer_id),
            });
            replaced
        };

        if let Some(old) = replaced {
            debug!(offer_id = %old.offer.id, agent_id = %old.offer.agent_id, "replaced held offer");
            inner
                .driver
                .decline_offer(&old.offer.id, inner.settings.filter_duration);
        }
    }

    /// Remove a rescinded offer. No decline is sent; the agent already
    /// withdrew it.
    pub fn cancel_offer(&self, offer_id: &str) {
        let removed = self.inner.pool.lock().remove(offer_id);
        if removed.is_some() {
            debug!(offer_id, "offer rescinded");
        }
    }

    /// Probe held offers in the configured order until `attempt` accepts
    /// one, then hand the launch to the driver and drop the offer from the
    /// pool. Offers statically banned for `group` are skipped.
    ///
    /// `attempt` returns the fully bound task when the offer fits; it runs
    /// without the pool mutex held, with the offer claimed from the pool.
    pub fn launch_first(
        &self,
        group: &TaskGroupKey,
        mut attempt: impl FnMut(&Offer) -> Option<AssignedTask>,
    ) -> LaunchResult {
        let ordered = self.ordered_offers(&self.inner.settings.order);
        for candidate in ordered {
            if self.inner.bans.is_banned(&candidate.id, group) {
                continue;
            }
            match self.try_launch(&candidate.id, &mut attempt) {
                Some(result) => return result,
                None => continue,
            }
        }
        LaunchResult::NoFit
    }

    /// Like `launch_first` but probes only the offer held for `host`, if
    /// any. Used to consume reservations.
    pub fn launch_on_host(
        &self,
        host: &str,
        mut attempt: impl FnMut(&Offer) -> Option<AssignedTask>,
    ) -> LaunchResult {
        let offer_id = match self.inner.pool.lock().by_host.get(host) {
            Some(id) => id.clone(),
            None => return LaunchResult::NoFit,
        };
        self.try_launch(&offer_id, &mut attempt)
            .unwrap_or(LaunchResult::NoFit)
    }

    /// Claim `offer_id`, run the attempt, and launch on success. Returns
    /// `None` when the offer is no longer available (caller moves on),
    /// `Some(NoFit)` when the attempt rejected it (offer is re-held).
    fn try_launch(
        &self,
        offer_id: &str,
        attempt: &mut impl FnMut(&Offer) -> Option<AssignedTask>,
    ) -> Option<LaunchResult> {
        let inner = &self.inner;
        let held = inner.pool.lock().remove(offer_id)?;
        if inner.unavailable_soon(&held.offer) {
            inner
                .driver
                .decline_offer(&held.offer.id, inner.settings.filter_duration);
            return None;
        }

        match attempt(&held.offer) {
            Some(task) => {
                info!(
                    offer_id = %held.offer.id,
                    task_id = %task.task_id,
                    host = %held.offer.host,
                    "launching task"
                );
                inner.driver.launch_task(&held.offer.id, &task);
                Some(LaunchResult::Launched {
                    offer_id: held.offer.id,
                })
            }
            None => {
                // Put it back for other tasks, keeping its FIFO position.
                let sequence = held.sequence;
                let offer = held.offer;
                let offer_id = offer.id.clone();
                inner.pool.lock().insert(HeldOffer {
                    sequence,
                    offer,
                    timer: Inner::arm_return_timer(inner, &offer_id),
                });
                Some(LaunchResult::NoFit)
            }
        }
    }

    pub fn ban_offer(&self, offer_id: &str, group: &TaskGroupKey) {
        self.inner.bans.ban(offer_id, group);
    }

    pub fn is_banned(&self, offer_id: &str, group: &TaskGroupKey) -> bool {
        self.inner.bans.is_banned(offer_id, group)
    }

    pub fn banned_count(&self) -> usize {
        self.inner.bans.len()
    }

    pub fn offer_count(&self) -> usize {
        self.inner.pool.lock().offers.len()
    }

    /// Snapshot the held offers arranged by `ordering`.
    pub fn ordered_offers(&self, ordering: &OfferOrdering) -> Vec<Offer> {
        let mut sequenced: Vec<SequencedOffer> = {
            let pool = self.inner.pool.lock();
            pool.offers
                .values()
                .map(|h| SequencedOffer {
                    sequence: h.sequence,
                    offer: h.offer.clone(),
                })
                .collect()
        };
        ordering.arrange(&mut sequenced);
        sequenced.into_iter().map(|s| s.offer).collect()
    }

    /// Snapshot in the configured probe order.
    pub fn get_offers(&self) -> Vec<Offer> {
        self.ordered_offers(&self.inner.settings.order)
    }
}

impl Inner {
    /// True when the offer's unavailability window starts within the
    /// configured threshold (or already started).
    fn unavailable_soon(&self, offer: &Offer) -> bool {
        match offer.unavailability_start_ms {
            Some(start_ms) => {
                let horizon = self
                    .clock
                    .now_millis()
                    .saturating_add(self.settings.unavailability_threshold.as_millis() as u64);
                start_ms <= horizon
            }
            None => false,
        }
    }

    /// Arm the jittered return timer for a held offer. Returns `None`
    /// outside a tokio runtime (synchronous tests drive expiry manually).
    fn arm_return_timer(inner: &Arc<Inner>, offer_id: &str) -> Option<AbortHandle> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let hold = inner.return_delay();
        let weak = Arc::downgrade(inner);
        let offer_id = offer_id.to_string();
        let task = handle.spawn(async move {
            tokio::time::sleep(hold).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_offer(&offer_id);
            }
        });
        Some(task.abort_handle())
    }

    /// A random duration within the configured window.
    fn return_delay(&self) -> Duration {
        let jitter_ms = self.settings.jitter_window.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..jitter_ms)
        };
        self.settings.min_hold + Duration::from_millis(jitter)
    }

    /// The hold deadline passed: return the offer to its agent.
    fn expire_offer(&self, offer_id: &str) {
        let expired = self.pool.lock().remove(offer_id);
        if let Some(held) = expired {
            debug!(offer_id = %held.offer.id, host = %held.offer.host, "hold deadline reached, declining offer");
            self.driver
                .decline_offer(&held.offer.id, self.settings.filter_duration);
        }
    }
}
