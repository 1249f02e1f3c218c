//! Offer manager configuration.

use std::time::Duration;

use crate::ordering::OfferOrdering;

/// Settings required to create an `OfferManager`.
#[derive(Debug, Clone)]
pub struct OfferSettings {
    /// Minimum time an unused offer is held before being declined.
    pub min_hold: Duration,
    /// Jitter window added to the hold time; the actual hold deadline is
    /// drawn uniformly from `[min_hold, min_hold + jitter_window)`.
    pub jitter_window: Duration,
    /// The order offers are probed in during a scheduling pass.
    pub order: OfferOrdering,
    /// Offers whose unavailability window starts within this threshold are
    /// not used for launches.
    pub unavailability_threshold: Duration,
    /// Re-offer hint attached to declines.
    pub filter_duration: Duration,
    /// Maximum entries in the static ban cache; 0 disables banning.
    pub ban_max_size: usize,
    /// Age at which ban entries expire.
    pub ban_expire_after: Duration,
}

impl Default for OfferSettings {
    fn default() -> Self {
        Self {
            min_hold: Duration::from_secs(5 * 60),
            jitter_window: Duration::from_secs(60),
            order: OfferOrdering::default(),
            unavailability_threshold: Duration::from_secs(6 * 60),
            filter_duration: Duration::from_secs(5),
            ban_max_size: 10_000,
            // Bans should not outlive the offers they refer to.
            ban_expire_after: Duration::from_secs(6 * 60),
        }
    }
}
