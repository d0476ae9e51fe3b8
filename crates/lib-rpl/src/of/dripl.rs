use tracing::info;

use linkstats::{LinkAddr, LinkStatsTable, ETX_DIVISOR};

use crate::dag::Dag;
use crate::message::{MetricContainer, MC_NONE};
use crate::of::{grounded_preference_rank, ObjectiveFunction, OCP_DRIPLOF};
use crate::parent::Parent;
use crate::rank::{Rank, INFINITE_RANK};

/// Reject links whose normalized metric exceeds 8 expected transmissions.
const MAX_LINK_METRIC: u16 = 8 * ETX_DIVISOR;
/// Reject paths costlier than 256 expected transmissions.
const MAX_PATH_COST: u16 = 256 * ETX_DIVISOR;
/// Hysteresis: do not switch away from the preferred parent for a gain
/// below 0.75 expected transmissions.
const PARENT_SWITCH_THRESHOLD: u16 = (3 * ETX_DIVISOR) / 4;

/// The default objective function: minimum-cost paths over the
/// normalized cross-interface metric, with hysteresis around the
/// preferred parent.
pub struct DriplOf;

impl ObjectiveFunction for DriplOf {
    fn ocp(&self) -> u16 {
        OCP_DRIPLOF
    }

    fn reset(&self, _dag: &Dag) {
        info!("reset DRiPLOF");
    }

    fn parent_link_metric(&self, p: &Parent, stats: &LinkStatsTable) -> u16 {
        stats
            .get(&p.addr)
            .map(|nbr| nbr.normalized_metric)
            .unwrap_or(0xffff)
    }

    fn parent_path_cost(&self, p: &Parent, stats: &LinkStatsTable) -> u16 {
        let base = p.rank as u32;
        (base + self.parent_link_metric(p, stats) as u32).min(0xffff) as u16
    }

    fn parent_has_usable_link(&self, p: &Parent, stats: &LinkStatsTable) -> bool {
        self.parent_link_metric(p, stats) <= MAX_LINK_METRIC
    }

    fn parent_is_acceptable(&self, p: &Parent, stats: &LinkStatsTable) -> bool {
        /* Exclude links with too high a link metric or path cost
           (RFC 6719 §3.2.2). */
        self.parent_link_metric(p, stats) <= MAX_LINK_METRIC
            && self.parent_path_cost(p, stats) <= MAX_PATH_COST
    }

    fn rank_via_parent(&self, p: &Parent, min_hoprankinc: u16, stats: &LinkStatsTable) -> Rank {
        let path_cost = self.parent_path_cost(p, stats);
        /* Rank lower bound: parent rank plus the minimum increase. */
        let floor = (p.rank as u32 + min_hoprankinc as u32).min(0xffff) as u16;
        floor.max(path_cost)
    }

    fn rank_via_dag(
        &self,
        preferred: Option<&Parent>,
        eligible: &[&Parent],
        min_hoprankinc: u16,
        stats: &LinkStatsTable,
    ) -> (Rank, Option<LinkAddr>) {
        /* Advertise the worst rank any eligible parent could impose, so
           the advertised value stays a safe upper bound. */
        let mut worst: Option<(Rank, LinkAddr)> = None;
        for p in eligible {
            let rank = self.rank_via_parent(p, min_hoprankinc, stats);
            if worst.map_or(true, |(r, _)| rank > r) {
                worst = Some((rank, p.addr));
            }
        }
        match worst {
            Some((rank, addr)) => (rank, Some(addr)),
            None => match preferred {
                Some(p) => (self.rank_via_parent(p, min_hoprankinc, stats), Some(p.addr)),
                None => (INFINITE_RANK, None),
            },
        }
    }

    fn best_parent<'p>(
        &self,
        preferred: Option<&LinkAddr>,
        best: Option<&'p Parent>,
        candidate: &'p Parent,
        stats: &LinkStatsTable,
    ) -> Option<&'p Parent> {
        let best_ok = best.is_some_and(|p| self.parent_is_acceptable(p, stats));
        let candidate_ok = self.parent_is_acceptable(candidate, stats);

        let p1 = match best {
            Some(p1) if best_ok => p1,
            _ => return if candidate_ok { Some(candidate) } else { None },
        };
        if !candidate_ok {
            return Some(p1);
        }

        let p1_cost = self.parent_path_cost(p1, stats);
        let p2_cost = self.parent_path_cost(candidate, stats);

        /* Keep the preferred parent unless the gain beats the switching
           threshold. */
        if preferred == Some(&p1.addr) || preferred == Some(&candidate.addr) {
            if p1_cost < p2_cost.saturating_add(PARENT_SWITCH_THRESHOLD)
                && p1_cost > p2_cost.saturating_sub(PARENT_SWITCH_THRESHOLD)
            {
                return if preferred == Some(&p1.addr) {
                    Some(p1)
                } else {
                    Some(candidate)
                };
            }
        }

        if p1_cost < p2_cost {
            Some(p1)
        } else {
            Some(candidate)
        }
    }

    fn best_dag<'d>(&self, d1: &'d Dag, d2: &'d Dag) -> &'d Dag {
        grounded_preference_rank(d1, d2)
    }

    fn update_metric_container(&self, mc: &mut MetricContainer) {
        mc.mc_type = MC_NONE;
    }
}
