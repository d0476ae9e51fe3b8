use linkstats::{LinkAddr, LinkStatsTable};

use crate::dag::Dag;
use crate::parent::Parent;
use crate::rank::{Rank, INFINITE_RANK};

mod dripl;
mod po;

pub use dripl::DriplOf;
pub use po::PoOf;

/// Experimental objective code points.
pub const OCP_POOF: u16 = 0xE1;
pub const OCP_DRIPLOF: u16 = 0xE2;

/// The objective-function plug-in contract. The routing core dispatches
/// every rank and parent-ordering decision through this trait; link
/// metrics come from the neighbor's normalized cross-interface metric in
/// the link-stats table.
pub trait ObjectiveFunction: Sync {
    fn ocp(&self) -> u16;

    fn reset(&self, dag: &Dag);

    fn parent_link_metric(&self, p: &Parent, stats: &LinkStatsTable) -> u16;

    fn parent_path_cost(&self, p: &Parent, stats: &LinkStatsTable) -> u16;

    fn parent_has_usable_link(&self, p: &Parent, stats: &LinkStatsTable) -> bool;

    fn parent_is_acceptable(&self, p: &Parent, stats: &LinkStatsTable) -> bool;

    fn rank_via_parent(&self, p: &Parent, min_hoprankinc: u16, stats: &LinkStatsTable) -> Rank;

    /// The rank to advertise for a whole DAG, blaming the parent
    /// responsible for it. The default derives it from the preferred
    /// parent; metric-hysteresis families override this with the maximum
    /// over all eligible parents so the advertised rank is a safe upper
    /// bound (RFC 6719 §3.3).
    fn rank_via_dag(
        &self,
        preferred: Option<&Parent>,
        _eligible: &[&Parent],
        min_hoprankinc: u16,
        stats: &LinkStatsTable,
    ) -> (Rank, Option<LinkAddr>) {
        match preferred {
            Some(p) => (self.rank_via_parent(p, min_hoprankinc, stats), Some(p.addr)),
            None => (INFINITE_RANK, None),
        }
    }

    /// Fold step of preferred-parent selection: the better of the running
    /// best and the candidate, or `None` when neither is acceptable.
    fn best_parent<'p>(
        &self,
        preferred: Option<&LinkAddr>,
        best: Option<&'p Parent>,
        candidate: &'p Parent,
        stats: &LinkStatsTable,
    ) -> Option<&'p Parent>;

    fn best_dag<'d>(&self, d1: &'d Dag, d2: &'d Dag) -> &'d Dag;

    fn update_metric_container(&self, mc: &mut crate::message::MetricContainer);
}

static SUPPORTED_OFS: &[&'static dyn ObjectiveFunction] = &[&DriplOf, &PoOf];

/// Look up a supported objective function by objective code point.
pub fn find_of(ocp: u16) -> Option<&'static dyn ObjectiveFunction> {
    SUPPORTED_OFS.iter().copied().find(|of| of.ocp() == ocp)
}

/// Shared DAG ordering: grounded beats floating, then administrative
/// preference, then rank.
pub(crate) fn grounded_preference_rank<'d>(d1: &'d Dag, d2: &'d Dag) -> &'d Dag {
    if d1.grounded != d2.grounded {
        return if d1.grounded { d1 } else { d2 };
    }
    if d1.preference != d2.preference {
        return if d1.preference > d2.preference { d1 } else { d2 };
    }
    if d1.rank < d2.rank {
        d1
    } else {
        d2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_supported_ocps() {
        assert_eq!(find_of(OCP_DRIPLOF).map(|of| of.ocp()), Some(OCP_DRIPLOF));
        assert_eq!(find_of(OCP_POOF).map(|of| of.ocp()), Some(OCP_POOF));
        assert!(find_of(0x00).is_none());
        assert!(find_of(0x01).is_none());
    }
}
