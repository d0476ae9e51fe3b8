use std::time::{Duration, Instant};

use linkstats::LinkAddr;

use crate::message::{DagId, MetricContainer, Mop, PrefixInfo};
use crate::of::ObjectiveFunction;
use crate::rank::{Rank, INFINITE_RANK};

/// One DODAG within an instance.
#[derive(Debug)]
pub struct Dag {
    pub dag_id: DagId,
    pub instance_idx: usize,
    /// Rank this node advertises in the DAG.
    pub rank: Rank,
    /// Lowest rank ever advertised; anchors the max-rank-increase rule.
    pub min_rank: Rank,
    pub version: u8,
    pub grounded: bool,
    pub preference: u8,
    pub joined: bool,
    pub preferred_parent: Option<LinkAddr>,
    pub prefix_info: Option<PrefixInfo>,
    /// Remaining lifetime in seconds; refreshed by DIOs from the DAG.
    pub lifetime: u32,
}

impl Dag {
    pub fn new(dag_id: DagId, instance_idx: usize) -> Self {
        Self {
            dag_id,
            instance_idx,
            rank: INFINITE_RANK,
            min_rank: INFINITE_RANK,
            version: 0,
            grounded: false,
            preference: 0,
            joined: false,
            preferred_parent: None,
            prefix_info: None,
            lifetime: 0,
        }
    }
}

/// One RPL instance: its objective function, configuration copied from
/// the root, trickle state, DAO bookkeeping and up to
/// `max_dag_per_instance` DAGs.
pub struct Instance {
    pub instance_id: u8,
    pub mop: Mop,
    pub of: &'static dyn ObjectiveFunction,
    pub mc: MetricContainer,
    pub dags: Vec<Option<Dag>>,
    pub current_dag: Option<usize>,
    pub dtsn_out: u8,
    pub dao_sequence: u8,
    pub max_rankinc: u16,
    pub min_hoprankinc: u16,
    pub default_lifetime: u8,
    pub lifetime_unit: u16,
    pub has_downward_route: bool,
    /// Next hop of the installed default route.
    pub def_route: Option<LinkAddr>,

    /* DIO trickle state */
    pub dio_intdoubl: u8,
    pub dio_intmin: u8,
    pub dio_redundancy: u8,
    pub dio_intcurrent: u8,
    pub dio_counter: u8,
    pub dio_send: bool,
    pub dio_next_delay: Duration,
    pub dio_timer: Option<Instant>,

    /* DAO timers */
    pub dao_timer: Option<Instant>,
    pub dao_lifetime_timer: Option<Instant>,

    /* Probing */
    pub probing_timer: Option<Instant>,
    pub urgent_probing_target: Option<LinkAddr>,
    pub last_dag: usize,
    pub unicast_dio_target: Option<LinkAddr>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("instance_id", &self.instance_id)
            .field("mop", &self.mop)
            .field("ocp", &self.of.ocp())
            .field("current_dag", &self.current_dag)
            .field("dio_intcurrent", &self.dio_intcurrent)
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub fn new(
        instance_id: u8,
        of: &'static dyn ObjectiveFunction,
        mop: Mop,
        max_dags: usize,
    ) -> Self {
        let mut dags = Vec::with_capacity(max_dags);
        dags.resize_with(max_dags, || None);
        Self {
            instance_id,
            mop,
            of,
            mc: MetricContainer::default(),
            dags,
            current_dag: None,
            dtsn_out: crate::rank::lollipop::INIT,
            dao_sequence: crate::rank::lollipop::INIT,
            max_rankinc: 0,
            min_hoprankinc: 256,
            default_lifetime: 0,
            lifetime_unit: 1,
            has_downward_route: false,
            def_route: None,
            dio_intdoubl: 0,
            dio_intmin: 0,
            dio_redundancy: 0,
            dio_intcurrent: 0,
            dio_counter: 0,
            dio_send: false,
            dio_next_delay: Duration::ZERO,
            dio_timer: None,
            dao_timer: None,
            dao_lifetime_timer: None,
            probing_timer: None,
            urgent_probing_target: None,
            last_dag: 0,
            unicast_dio_target: None,
        }
    }

    /// The rank of the root within this instance.
    pub fn root_rank(&self) -> Rank {
        self.min_hoprankinc
    }

    pub fn dag(&self, idx: usize) -> Option<&Dag> {
        self.dags.get(idx).and_then(|slot| slot.as_ref())
    }

    pub fn dag_mut(&mut self, idx: usize) -> Option<&mut Dag> {
        self.dags.get_mut(idx).and_then(|slot| slot.as_mut())
    }

    pub fn find_dag(&self, dag_id: &DagId) -> Option<usize> {
        self.dags
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|dag| dag.dag_id == *dag_id))
    }

    pub fn alloc_dag(&mut self, dag_id: DagId, instance_idx: usize) -> Option<usize> {
        let free = self.dags.iter().position(|slot| slot.is_none())?;
        self.dags[free] = Some(Dag::new(dag_id, instance_idx));
        Some(free)
    }

    pub fn used_dags(&self) -> impl Iterator<Item = (usize, &Dag)> {
        self.dags
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|dag| (idx, dag)))
    }
}
