use tracing::info;

use linkstats::{LinkAddr, LinkStatsTable};

use crate::dag::Dag;
use crate::message::{MetricContainer, MC_NONE};
use crate::of::{grounded_preference_rank, ObjectiveFunction, OCP_POOF};
use crate::parent::Parent;
use crate::rank::{Rank, INFINITE_RANK};

/// The parent-oblivious diagnostic objective function: every parent is
/// infinitely expensive and unacceptable, which forces a node running it
/// to detach from the DODAG.
pub struct PoOf;

impl ObjectiveFunction for PoOf {
    fn ocp(&self) -> u16 {
        OCP_POOF
    }

    fn reset(&self, _dag: &Dag) {
        info!("reset POOF");
    }

    fn parent_link_metric(&self, _p: &Parent, _stats: &LinkStatsTable) -> u16 {
        0xffff
    }

    fn parent_path_cost(&self, _p: &Parent, _stats: &LinkStatsTable) -> u16 {
        0xffff
    }

    fn parent_has_usable_link(&self, _p: &Parent, _stats: &LinkStatsTable) -> bool {
        false
    }

    fn parent_is_acceptable(&self, _p: &Parent, _stats: &LinkStatsTable) -> bool {
        false
    }

    fn rank_via_parent(&self, _p: &Parent, _min_hoprankinc: u16, _stats: &LinkStatsTable) -> Rank {
        INFINITE_RANK
    }

    fn best_parent<'p>(
        &self,
        _preferred: Option<&LinkAddr>,
        _best: Option<&'p Parent>,
        _candidate: &'p Parent,
        _stats: &LinkStatsTable,
    ) -> Option<&'p Parent> {
        None
    }

    fn best_dag<'d>(&self, d1: &'d Dag, d2: &'d Dag) -> &'d Dag {
        grounded_preference_rank(d1, d2)
    }

    fn update_metric_container(&self, mc: &mut MetricContainer) {
        mc.mc_type = MC_NONE;
    }
}
