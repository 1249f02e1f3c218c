//! Offer ordering policies.

use std::cmp::Ordering;
use std::str::FromStr;

use rand::seq::SliceRandom;

use flotilla_core::Offer;

/// A single ordering criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOrder {
    /// Shuffle the pool; spreads load across agents.
    Random,
    /// Oldest held offer first.
    Fifo,
    /// Ascending remaining cpus; packs small tasks onto drained agents.
    Cpu,
    /// Ascending remaining memory.
    Memory,
    /// Ascending remaining disk.
    Disk,
    /// Revocable offers before non-revocable ones.
    Revocable,
}

impl FromStr for OfferOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RANDOM" => Ok(Self::Random),
            "FIFO" => Ok(Self::Fifo),
            "CPU" => Ok(Self::Cpu),
            "MEMORY" => Ok(Self::Memory),
            "DISK" => Ok(Self::Disk),
            "REVOCABLE" => Ok(Self::Revocable),
            other => Err(format!("unknown offer order: {other}")),
        }
    }
}

/// A lexicographic composite of criteria: each criterion orders the pool,
/// breaking ties with the next one. A `Random` criterion contributes a
/// shuffled base order (the final tiebreak, since sorting is stable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferOrdering {
    criteria: Vec<OfferOrder>,
}

impl Default for OfferOrdering {
    fn default() -> Self {
        Self {
            criteria: vec![OfferOrder::Random],
        }
    }
}

/// An offer plus its arrival sequence number, the sort key for FIFO.
#[derive(Debug, Clone)]
pub struct SequencedOffer {
    pub sequence: u64,
    pub offer: Offer,
}

impl OfferOrdering {
    pub fn new(criteria: Vec<OfferOrder>) -> Self {
        Self { criteria }
    }

    pub fn criteria(&self) -> &[OfferOrder] {
        &self.criteria
    }

    /// Arrange offers into probe order.
    pub fn arrange(&self, offers: &mut Vec<SequencedOffer>) {
        if self.criteria.contains(&OfferOrder::Random) {
            offers.shuffle(&mut rand::rng());
        }
        let comparators: Vec<OfferOrder> = self
            .criteria
            .iter()
            .copied()
            .filter(|c| *c != OfferOrder::Random)
            .collect();
        if comparators.is_empty() {
            return;
        }
        offers.sort_by(|a, b| {
            for criterion in &comparators {
                let ord = compare(*criterion, a, b);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
}

fn compare(criterion: OfferOrder, a: &SequencedOffer, b: &SequencedOffer) -> Ordering {
    match criterion {
        OfferOrder::Random => Ordering::Equal,
        OfferOrder::Fifo => a.sequence.cmp(&b.sequence),
        OfferOrder::Cpu => a
            .offer
            .resources
            .cpus
            .partial_cmp(&b.offer.resources.cpus)
            .unwrap_or(Ordering::Equal),
        OfferOrder::Memory => a.offer.resources.ram_mb.cmp(&b.offer.resources.ram_mb),
        OfferOrder::Disk => a.offer.resources.disk_mb.cmp(&b.offer.resources.disk_mb),
        // Revocable first.
        OfferOrder::Revocable => b.offer.resources.revocable.cmp(&a.offer.resources.revocable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use flotilla_core::ResourceBag;

    fn offer(id: &str, sequence: u64, cpus: f64, ram_mb: u64, revocable: bool) -> SequencedOffer {
        SequencedOffer {
            sequence,
            offer: Offer {
                id: id.to_string(),
                agent_id: format!("agent-{id}"),
                host: format!("host-{id}"),
                resources: ResourceBag {
                    cpus,
                    ram_mb,
                    disk_mb: 0,
                    port_ranges: Vec::new(),
                    revocable,
                },
                unavailability_start_ms: None,
            },
        }
    }

    fn ids(offers: &[SequencedOffer]) -> Vec<&str> {
        offers.iter().map(|o| o.offer.id.as_str()).collect()
    }

    #[test]
    fn fifo_orders_by_arrival() {
        let mut offers = vec![
            offer("b", 2, 1.0, 100, false),
            offer("a", 1, 4.0, 400, false),
            offer("c", 3, 2.0, 200, false),
        ];
        OfferOrdering::new(vec![OfferOrder::Fifo]).arrange(&mut offers);
        assert_eq!(ids(&offers), ["a", "b", "c"]);
    }

    #[test]
    fn cpu_orders_ascending() {
        let mut offers = vec![
            offer("big", 1, 8.0, 100, false),
            offer("small", 2, 1.0, 100, false),
            offer("mid", 3, 4.0, 100, false),
        ];
        OfferOrdering::new(vec![OfferOrder::Cpu]).arrange(&mut offers);
        assert_eq!(ids(&offers), ["small", "mid", "big"]);
    }

    #[test]
    fn composite_breaks_ties_with_next_criterion() {
        let mut offers = vec![
            offer("a", 1, 2.0, 400, false),
            offer("b", 2, 2.0, 100, false),
            offer("c", 3, 1.0, 900, false),
        ];
        OfferOrdering::new(vec![OfferOrder::Cpu, OfferOrder::Memory]).arrange(&mut offers);
        assert_eq!(ids(&offers), ["c", "b", "a"]);
    }

    #[test]
    fn revocable_first() {
        let mut offers = vec![
            offer("solid", 1, 1.0, 100, false),
            offer("besteffort", 2, 1.0, 100, true),
        ];
        OfferOrdering::new(vec![OfferOrder::Revocable]).arrange(&mut offers);
        assert_eq!(ids(&offers), ["besteffort", "solid"]);
    }

    #[test]
    fn random_keeps_all_offers() {
        let mut offers: Vec<SequencedOffer> = (0..20)
            .map(|i| offer(&format!("o{i}"), i, 1.0, 100, false))
            .collect();
        OfferOrdering::default().arrange(&mut offers);
        assert_eq!(offers.len(), 20);
    }

    #[test]
    fn parse_order_names() {
        assert_eq!("cpu".parse::<OfferOrder>().unwrap(), OfferOrder::Cpu);
        assert_eq!("RANDOM".parse::<OfferOrder>().unwrap(), OfferOrder::Random);
        assert!("bogus".parse::<OfferOrder>().is_err());
    }
}
