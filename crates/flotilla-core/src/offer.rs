//! Resource offers from worker agents.

use serde::{Deserialize, Serialize};

use crate::resources::ResourceBag;

/// An agent's snapshot of currently-available resources.
///
/// Offers are ephemeral: the offer manager holds them briefly and either
/// consumes them for a launch or declines them back to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub agent_id: String,
    pub host: String,
    pub resources: ResourceBag,
    /// Start of a scheduled maintenance window, epoch milliseconds. Offers
    /// close to their window are not used for new launches.
    pub unavailability_start_ms: Option<u64>,
}
