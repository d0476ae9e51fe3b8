use std::collections::VecDeque;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use linkstats::{LinkAddr, LinkStatsTable, TxStatus};

use crate::command::{ProbeIface, RplCommand};
use crate::config::RplConfig;
use crate::dag::{Dag, Instance};
use crate::message::{Dao, DagId, Dio, Dis, Mop, PrefixInfo, PREFIX_FLAG_AUTONOMOUS};
use crate::of::{find_of, ObjectiveFunction};
use crate::parent::{
    Parent, ParentTable, PARENT_FLAG_NOT_ELIGIBLE, PARENT_FLAG_UPDATED, PARENT_FLAG_WAS_KICKED,
};
use crate::rank::{dag_rank, lollipop, Rank, INFINITE_RANK};

/// Lifetime value of a No-Path DAO.
pub const ZERO_LIFETIME: u8 = 0;
/// Route lifetime value meaning "never expires".
pub const INFINITE_LIFETIME: u8 = 0xff;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RplError {
    #[error("objective function with OCP {0:#x} not supported")]
    UnsupportedOf(u16),

    #[error("no space left in the instance or DAG table")]
    TableFull,

    #[error("no such instance")]
    NoSuchInstance,
}

/// Freshness requirement applied when filtering parent candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Freshness {
    Unspecified,
    /// Every interface of the parent must be fresh.
    AllInterfaces,
    /// At least one interface of the parent must be fresh.
    AnyInterface,
}

/// The multi-interface routing core: instances, DAGs and parents, driven
/// by control-message inputs and timer ticks from a single event loop.
/// Outbound work is queued as [`RplCommand`]s for the host to drain.
pub struct Router {
    pub(crate) cfg: RplConfig,
    pub(crate) node_addr: LinkAddr,
    pub(crate) instances: Vec<Option<Instance>>,
    pub(crate) parents: ParentTable,
    pub(crate) default_instance: Option<usize>,
    /// Instance currently advertising `INFINITE_RANK` after a repair, if
    /// any. While set, finite-rank DIOs for it are refused.
    pub(crate) poisoning_instance: Option<usize>,
    pub(crate) poison_timer: Option<Instant>,
    pub(crate) periodic_timer: Option<Instant>,
    pub(crate) next_dis: i64,
    pub(crate) dio_send_ok: bool,
    /// Interface weights shared across neighbors, by interface ID.
    pub(crate) ifw_collection: Vec<(u8, u8)>,
    pub(crate) ifw_recalc_timer: Option<Instant>,
    pub(crate) ifw_delay_timer: Option<(Instant, LinkAddr)>,
    pub(crate) weighting_queue: VecDeque<(LinkAddr, Instant)>,
    /// Packets transmitted to the preferred parent in the current
    /// weighting window.
    pub(crate) num_tx_preferred: u32,
    pub(crate) commands: Vec<RplCommand>,
}

impl Router {
    pub fn new(cfg: RplConfig, node_addr: LinkAddr, now: Instant) -> Self {
        let mut instances = Vec::with_capacity(cfg.max_instances);
        instances.resize_with(cfg.max_instances, || None);
        let max_parents = cfg.max_parents;
        let weighted = cfg.weighted_interfaces;
        let if_weights_window = cfg.if_weights_window;
        let mut router = Self {
            cfg,
            node_addr,
            instances,
            parents: ParentTable::new(max_parents),
            default_instance: None,
            poisoning_instance: None,
            poison_timer: None,
            periodic_timer: None,
            next_dis: 0,
            dio_send_ok: true,
            ifw_collection: Vec::new(),
            ifw_recalc_timer: weighted.then(|| now + if_weights_window),
            ifw_delay_timer: None,
            weighting_queue: VecDeque::new(),
            num_tx_preferred: 0,
            commands: Vec::new(),
        };
        router.reset_periodic_timer(now);
        router
    }

    /* ------------------------------------------------------------------ */
    /* Table access                                                       */
    /* ------------------------------------------------------------------ */

    pub(crate) fn inst(&self, idx: usize) -> Option<&Instance> {
        self.instances.get(idx).and_then(|slot| slot.as_ref())
    }

    pub(crate) fn inst_mut(&mut self, idx: usize) -> Option<&mut Instance> {
        self.instances.get_mut(idx).and_then(|slot| slot.as_mut())
    }

    pub fn instance_by_id(&self, instance_id: u8) -> Option<usize> {
        self.instances.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|inst| inst.instance_id == instance_id)
        })
    }

    pub(crate) fn dag_ref(&self, i: usize, d: usize) -> Option<&Dag> {
        self.inst(i).and_then(|inst| inst.dag(d))
    }

    pub(crate) fn dag_mut_ref(&mut self, i: usize, d: usize) -> Option<&mut Dag> {
        self.inst_mut(i).and_then(|inst| inst.dag_mut(d))
    }

    fn get_dag(&self, instance_id: u8, dag_id: &DagId) -> Option<(usize, usize)> {
        let i = self.instance_by_id(instance_id)?;
        let d = self.inst(i)?.find_dag(dag_id)?;
        Some((i, d))
    }

    fn alloc_dag(
        &mut self,
        instance_id: u8,
        dag_id: DagId,
        of: &'static dyn ObjectiveFunction,
        now: Instant,
    ) -> Option<(usize, usize)> {
        let i = match self.instance_by_id(instance_id) {
            Some(i) => i,
            None => {
                let free = self.instances.iter().position(|slot| slot.is_none())?;
                let mut inst =
                    Instance::new(instance_id, of, self.cfg.mop, self.cfg.max_dag_per_instance);
                inst.probing_timer = self
                    .cfg
                    .with_probing
                    .then(|| now + self.probing_delay());
                self.instances[free] = Some(inst);
                free
            }
        };
        let d = self.inst_mut(i)?.alloc_dag(dag_id, i)?;
        Some((i, d))
    }

    pub fn default_instance(&self) -> Option<usize> {
        self.default_instance
    }

    pub fn poisoning_instance(&self) -> Option<usize> {
        self.poisoning_instance
    }

    pub fn parent(&self, addr: &LinkAddr) -> Option<&Parent> {
        self.parents.get(addr)
    }

    pub fn parent_count(&self) -> usize {
        self.parents.len()
    }

    pub fn current_rank(&self, i: usize) -> Rank {
        self.inst(i)
            .and_then(|inst| inst.current_dag.and_then(|d| inst.dag(d)))
            .map(|dag| dag.rank)
            .unwrap_or(INFINITE_RANK)
    }

    pub fn preferred_parent(&self, i: usize) -> Option<LinkAddr> {
        self.inst(i)
            .and_then(|inst| inst.current_dag.and_then(|d| inst.dag(d)))
            .and_then(|dag| dag.preferred_parent)
    }

    pub fn is_root(&self, i: usize) -> bool {
        self.inst(i).is_some_and(|inst| {
            inst.current_dag
                .and_then(|d| inst.dag(d))
                .is_some_and(|dag| dag.rank == inst.root_rank())
        })
    }

    pub fn has_joined(&self) -> bool {
        self.instances.iter().flatten().any(|inst| {
            inst.current_dag
                .and_then(|d| inst.dag(d))
                .is_some_and(|dag| dag.joined && dag.preferred_parent.is_some())
        }) || self.default_instance.is_some_and(|i| self.is_root(i))
    }

    pub fn take_commands(&mut self) -> Vec<RplCommand> {
        std::mem::take(&mut self.commands)
    }

    /// Current trickle interval exponent, for diagnostics.
    pub fn dio_interval_current(&self, i: usize) -> Option<u8> {
        self.inst(i).map(|inst| inst.dio_intcurrent)
    }

    /// Dump the parent set of the default instance at debug level: ranks,
    /// link metrics, freshness markers and per-interface refresh ages.
    pub fn log_neighbor_list(&self, stats: &LinkStatsTable, now: Instant) {
        let Some(i) = self.default_instance else {
            return;
        };
        let Some(inst) = self.inst(i) else {
            return;
        };
        let Some(d) = inst.current_dag else {
            return;
        };
        let Some(dag) = inst.dag(d) else {
            return;
        };
        debug!(
            mop = ?inst.mop,
            ocp = inst.of.ocp(),
            rank = dag.rank,
            dio_interval = inst.dio_intcurrent,
            parents = self.parents.len(),
            "neighbor list"
        );
        for p in self.parents.iter() {
            let freshness = if self.parent_is_fresh(&p.addr, stats, now) {
                'f'
            } else if self.parent_is_stale(&p.addr, stats, now) {
                's'
            } else {
                'u'
            };
            let iface_ages: Vec<u64> = stats
                .get(&p.addr)
                .map(|nbr| {
                    nbr.interfaces()
                        .iter()
                        .map(|ile| match ile.last_tx_time {
                            Some(t) => now.saturating_duration_since(t).as_secs(),
                            None => u64::MAX,
                        })
                        .collect()
                })
                .unwrap_or_default();
            debug!(
                addr = %p.addr,
                rank = p.rank,
                link_metric = inst.of.parent_link_metric(p, stats),
                rank_via = self.rank_via_parent(&p.addr, stats),
                %freshness,
                preferred = dag.preferred_parent == Some(p.addr),
                eligible = p.is_eligible() && p.in_dag(i, d),
                ?iface_ages,
                "parent"
            );
        }
        debug!("end of neighbor list");
    }

    /* ------------------------------------------------------------------ */
    /* Parent freshness and reachability                                  */
    /* ------------------------------------------------------------------ */

    /// True if every interface of the parent has fresh statistics.
    pub fn parent_is_fresh(&self, addr: &LinkAddr, stats: &LinkStatsTable, now: Instant) -> bool {
        match stats.get(addr) {
            Some(nbr) => {
                !nbr.interfaces().is_empty() && nbr.interfaces().iter().all(|ile| ile.is_fresh(now))
            }
            None => false,
        }
    }

    /// True if no interface of the parent has fresh statistics.
    pub fn parent_is_stale(&self, addr: &LinkAddr, stats: &LinkStatsTable, now: Instant) -> bool {
        match stats.get(addr) {
            Some(nbr) => !nbr.interfaces().iter().any(|ile| ile.is_fresh(now)),
            None => true,
        }
    }

    /// Without fresh link information, assume the parent is reachable.
    fn parent_is_reachable(&self, addr: &LinkAddr, stats: &LinkStatsTable, now: Instant) -> bool {
        let Some(p) = self.parents.get(addr) else {
            return false;
        };
        let Some(inst) = self.inst(p.instance_idx) else {
            return false;
        };
        self.parent_is_stale(addr, stats, now) || inst.of.parent_has_usable_link(p, stats)
    }

    pub fn rank_via_parent(&self, addr: &LinkAddr, stats: &LinkStatsTable) -> Rank {
        let Some(p) = self.parents.get(addr) else {
            return INFINITE_RANK;
        };
        let Some(inst) = self.inst(p.instance_idx) else {
            return INFINITE_RANK;
        };
        inst.of.rank_via_parent(p, inst.min_hoprankinc, stats)
    }

    /// The rank to advertise for a DAG, and the parent to blame for it.
    pub(crate) fn rank_via_dag(
        &self,
        i: usize,
        d: usize,
        stats: &LinkStatsTable,
    ) -> (Rank, Option<LinkAddr>) {
        let Some(inst) = self.inst(i) else {
            return (INFINITE_RANK, None);
        };
        let Some(dag) = inst.dag(d) else {
            return (INFINITE_RANK, None);
        };
        let preferred = dag.preferred_parent.and_then(|addr| self.parents.get(&addr));
        let eligible: Vec<&Parent> = self
            .parents
            .iter()
            .filter(|p| p.in_dag(i, d) && p.is_eligible() && p.rank != INFINITE_RANK)
            .collect();
        inst.of
            .rank_via_dag(preferred, &eligible, inst.min_hoprankinc, stats)
    }

    /// Rank-acceptability per RFC 6550 §8.2.2.4 rule 3.
    pub(crate) fn acceptable_rank(&self, i: usize, d: usize, rank: Rank) -> bool {
        let Some(inst) = self.inst(i) else {
            return false;
        };
        let Some(dag) = inst.dag(d) else {
            return false;
        };
        rank != INFINITE_RANK
            && (inst.max_rankinc == 0
                || dag_rank(rank, inst.min_hoprankinc)
                    <= dag_rank(
                        dag.min_rank.saturating_add(inst.max_rankinc),
                        inst.min_hoprankinc,
                    ))
    }

    /* ------------------------------------------------------------------ */
    /* Parent set maintenance                                             */
    /* ------------------------------------------------------------------ */

    fn find_parent(&self, i: usize, d: usize, addr: &LinkAddr) -> bool {
        self.parents.get(addr).is_some_and(|p| p.in_dag(i, d))
    }

    /// The DAG (within instance `i`) a known parent currently belongs to.
    fn find_parent_dag(&self, i: usize, addr: &LinkAddr) -> Option<usize> {
        self.parents
            .get(addr)
            .filter(|p| p.instance_idx == i)
            .map(|p| p.dag_idx)
    }

    fn add_parent(
        &mut self,
        i: usize,
        d: usize,
        dio: &Dio,
        from: LinkAddr,
        stats: &mut LinkStatsTable,
        now: Instant,
    ) -> bool {
        debug!(%from, "adding parent");
        let parent = Parent {
            addr: from,
            instance_idx: i,
            dag_idx: d,
            rank: dio.rank,
            dtsn: dio.dtsn,
            mc: dio.mc,
            flags: 0,
        };
        if !self.parents.insert(parent) {
            return false;
        }
        if self.cfg.weighted_interfaces {
            self.schedule_interface_weighting(from, now);
        }
        stats.reset_defer_flags(&from);
        stats.update_norm_metric(&from);
        true
    }

    pub(crate) fn set_preferred_parent(
        &mut self,
        i: usize,
        d: usize,
        new: Option<LinkAddr>,
        _stats: &mut LinkStatsTable,
    ) {
        let Some(dag) = self.dag_ref(i, d) else {
            return;
        };
        let old = dag.preferred_parent;
        if old == new {
            return;
        }
        if let Some(addr) = &new {
            if !self.parents.get(addr).is_some_and(|p| p.is_eligible()) {
                info!(%addr, "refusing ineligible preferred parent");
                return;
            }
        }
        info!(
            new = ?new,
            old = ?old,
            "preferred parent change"
        );

        /* Keep the preferred parent locked so it stays in the tables. */
        if let Some(old) = old {
            self.parents.unlock(&old);
        }
        if let Some(new) = &new {
            self.parents.lock(new);
        }
        if let Some(dag) = self.dag_mut_ref(i, d) {
            dag.preferred_parent = new;
        }
    }

    pub(crate) fn nullify_parent(&mut self, addr: &LinkAddr, stats: &mut LinkStatsTable) {
        let Some(p) = self.parents.get_mut(addr) else {
            return;
        };
        let (i, d) = (p.instance_idx, p.dag_idx);
        if p.is_eligible() {
            p.flags |= PARENT_FLAG_NOT_ELIGIBLE | PARENT_FLAG_WAS_KICKED;
        }

        /* An ineligible parent is out of the logical parent set, so its
           preferred-interface selection is no longer weighted. */
        if self.cfg.weighted_interfaces {
            stats.modify_wifsel_flag(addr, false);
        }

        let Some(dag) = self.dag_ref(i, d) else {
            return;
        };
        let preferred = dag.preferred_parent;
        let joined = dag.joined;

        if preferred == Some(*addr) || preferred.is_none() {
            if let Some(dag) = self.dag_mut_ref(i, d) {
                dag.rank = INFINITE_RANK;
            }
            if joined {
                let had_route = self.inst(i).is_some_and(|inst| inst.def_route.is_some());
                if had_route {
                    debug!(%addr, "removing default route");
                    self.commands.push(RplCommand::SetDefaultRoute { via: None });
                    if let Some(inst) = self.inst_mut(i) {
                        inst.def_route = None;
                    }
                }
                if preferred == Some(*addr) {
                    /* No-Path DAO only when dethroning the preferred
                       parent. */
                    if self.inst(i).is_some_and(|inst| inst.mop.is_storing()) {
                        self.dao_output(i, *addr, ZERO_LIFETIME);
                    }
                    self.set_preferred_parent(i, d, None, stats);
                }
            }
        }
        info!(%addr, "nullified parent");
    }

    pub(crate) fn remove_parent(&mut self, addr: &LinkAddr, stats: &mut LinkStatsTable) {
        info!(%addr, "removing parent");
        self.nullify_parent(addr, stats);
        self.parents.remove(addr);
    }

    fn remove_parents(&mut self, i: usize, d: usize, minimum_rank: Rank, stats: &mut LinkStatsTable) {
        info!(minimum_rank, "removing parents");
        for addr in self.parents.addrs() {
            if self
                .parents
                .get(&addr)
                .is_some_and(|p| p.in_dag(i, d) && p.rank >= minimum_rank)
            {
                self.remove_parent(&addr, stats);
            }
        }
    }

    pub(crate) fn nullify_parents(
        &mut self,
        i: usize,
        d: usize,
        minimum_rank: Rank,
        stats: &mut LinkStatsTable,
    ) {
        info!(minimum_rank, "nullifying parents");
        for addr in self.parents.addrs() {
            if self
                .parents
                .get(&addr)
                .is_some_and(|p| p.in_dag(i, d) && p.rank >= minimum_rank)
            {
                self.nullify_parent(&addr, stats);
            }
        }
    }

    fn move_parent(
        &mut self,
        src: (usize, usize),
        dst: (usize, usize),
        addr: &LinkAddr,
        stats: &mut LinkStatsTable,
    ) {
        let Some(dag) = self.dag_ref(src.0, src.1) else {
            return;
        };
        let was_preferred = dag.preferred_parent == Some(*addr);
        let joined = dag.joined;
        if was_preferred {
            self.set_preferred_parent(src.0, src.1, None, stats);
            if let Some(dag) = self.dag_mut_ref(src.0, src.1) {
                dag.rank = INFINITE_RANK;
            }
            if joined && self.inst(src.0).is_some_and(|inst| inst.def_route.is_some()) {
                debug!(%addr, "removing default route");
                self.commands.push(RplCommand::SetDefaultRoute { via: None });
                if let Some(inst) = self.inst_mut(src.0) {
                    inst.def_route = None;
                }
            }
        } else if joined && self.inst(src.0).is_some_and(|inst| inst.mop.is_storing()) {
            self.commands
                .push(RplCommand::RemoveRoutesByNexthop { nexthop: *addr });
        }

        info!(%addr, "moving parent");
        if let Some(p) = self.parents.get_mut(addr) {
            p.instance_idx = dst.0;
            p.dag_idx = dst.1;
        }
        stats.reset_defer_flags(addr);
        stats.update_norm_metric(addr);
    }

    /// Normalization sweep over the parent set. The current preferred
    /// parent of the default instance is skipped while its defer
    /// condition holds; everyone else is normalized immediately.
    pub(crate) fn exec_norm_metric_logic(&mut self, reset_defer: bool, stats: &mut LinkStatsTable) {
        let preferred = self
            .default_instance
            .and_then(|i| self.preferred_parent_of_current_dag(i));
        for addr in self.parents.addrs() {
            if preferred == Some(addr) {
                if stats.is_defer_required(&addr) {
                    debug!(%addr, "deferring normalized metric update");
                } else {
                    stats.update_norm_metric(&addr);
                }
            } else {
                stats.update_norm_metric(&addr);
            }
            if reset_defer {
                stats.reset_defer_flags(&addr);
            }
        }
    }

    fn preferred_parent_of_current_dag(&self, i: usize) -> Option<LinkAddr> {
        let inst = self.inst(i)?;
        inst.dag(inst.current_dag?)?.preferred_parent
    }

    /* ------------------------------------------------------------------ */
    /* Parent and DAG selection                                           */
    /* ------------------------------------------------------------------ */

    pub(crate) fn best_parent_in(
        &self,
        i: usize,
        d: usize,
        freshness: Freshness,
        stats: &LinkStatsTable,
        now: Instant,
    ) -> Option<LinkAddr> {
        let inst = self.inst(i)?;
        let _ = inst.dag(d)?;
        let of = inst.of;
        let root_rank = inst.root_rank();
        let preferred = self
            .dag_ref(i, d)
            .and_then(|dag| dag.preferred_parent);

        let mut best: Option<&Parent> = None;
        for p in self.parents.iter() {
            if !p.in_dag(i, d) || p.rank == INFINITE_RANK || !p.is_eligible() {
                continue;
            }
            if p.rank < root_rank {
                warn!(addr = %p.addr, rank = p.rank, "parent has invalid rank");
                continue;
            }
            match freshness {
                Freshness::AllInterfaces => {
                    if !self.parent_is_fresh(&p.addr, stats, now) {
                        continue;
                    }
                }
                Freshness::AnyInterface => {
                    if self.parent_is_stale(&p.addr, stats, now) {
                        continue;
                    }
                }
                Freshness::Unspecified => {}
            }
            if !self.parent_is_reachable(&p.addr, stats, now) {
                continue;
            }
            best = of.best_parent(preferred.as_ref(), best, p, stats);
        }
        best.map(|p| p.addr)
    }

    /// Preferred-parent selection with freshness-aware fallback: adopt
    /// the overall best parent when all its interfaces are fresh;
    /// otherwise prefer the best all-fresh parent, then the best
    /// partly-fresh one, then the overall best, and schedule an urgent
    /// probe of the overall best.
    pub(crate) fn select_parent(
        &mut self,
        i: usize,
        d: usize,
        stats: &mut LinkStatsTable,
        now: Instant,
    ) -> Option<LinkAddr> {
        let best = self.best_parent_in(i, d, Freshness::Unspecified, stats, now);

        match best {
            Some(best_addr) if self.cfg.with_probing => {
                if self.parent_is_fresh(&best_addr, stats, now) {
                    self.set_preferred_parent(i, d, Some(best_addr), stats);
                    if let Some(inst) = self.inst_mut(i) {
                        inst.urgent_probing_target = None;
                    }
                } else {
                    let adopted = self
                        .best_parent_in(i, d, Freshness::AllInterfaces, stats, now)
                        .or_else(|| self.best_parent_in(i, d, Freshness::AnyInterface, stats, now))
                        .unwrap_or(best_addr);
                    self.set_preferred_parent(i, d, Some(adopted), stats);
                    /* Probe the overall best shortly to refresh its
                       non-fresh interfaces. */
                    if let Some(inst) = self.inst_mut(i) {
                        inst.urgent_probing_target = Some(best_addr);
                    }
                    self.schedule_probing_now(i, now);
                }
            }
            Some(best_addr) => {
                self.set_preferred_parent(i, d, Some(best_addr), stats);
            }
            None => {
                self.set_preferred_parent(i, d, None, stats);
            }
        }

        let (rank, _) = self.rank_via_dag(i, d, stats);
        if let Some(dag) = self.dag_mut_ref(i, d) {
            dag.rank = rank;
        }
        self.dag_ref(i, d).and_then(|dag| dag.preferred_parent)
    }

    /// Re-evaluate the best DAG of the instance after something changed
    /// around `paddr`. Returns the index of the chosen DAG, or `None`
    /// when no DAG is usable anymore.
    pub(crate) fn select_dag(
        &mut self,
        i: usize,
        paddr: &LinkAddr,
        stats: &mut LinkStatsTable,
        now: Instant,
    ) -> Option<usize> {
        let inst = self.inst(i)?;
        let current = inst.current_dag?;
        let root_rank = inst.root_rank();
        let old_rank = inst.dag(current)?.rank;
        let last_parent = inst.dag(current)?.preferred_parent;

        if old_rank != root_rank {
            /* Recompute the preferred parent for the DAG the triggering
               parent belongs to; it is not necessarily the current DAG. */
            if let Some(p_dag) = self.parents.get(paddr).map(|p| p.dag_idx) {
                self.select_parent(i, p_dag, stats, now);
            }
        }

        /* Fold the objective function's DAG ordering over every usable
           DAG of the instance. */
        let mut best: Option<usize> = None;
        {
            let inst = self.inst(i)?;
            let of = inst.of;
            for (d, dag) in inst.used_dags() {
                if dag.preferred_parent.is_none() {
                    continue;
                }
                if self.rank_via_dag(i, d, stats).0 == INFINITE_RANK {
                    continue;
                }
                best = Some(match best {
                    None => d,
                    Some(b) => {
                        let best_dag = inst.dag(b)?;
                        if std::ptr::eq(of.best_dag(best_dag, dag), dag) {
                            d
                        } else {
                            b
                        }
                    }
                });
            }
        }
        let best = best?;

        if best != current {
            if self.inst(i)?.mop.is_storing() {
                let dag_id = self.dag_ref(i, current)?.dag_id;
                self.commands.push(RplCommand::RemoveRoutes { dag_id });
            }
            info!(dag_id = %self.dag_ref(i, best)?.dag_id, "new preferred DAG");
            if let Some(dag) = self.dag_mut_ref(i, best) {
                dag.joined = true;
            }
            if let Some(dag) = self.dag_mut_ref(i, current) {
                dag.joined = false;
            }
            if let Some(inst) = self.inst_mut(i) {
                inst.current_dag = Some(best);
            }
        }

        {
            let inst = self.inst_mut(i)?;
            let of = inst.of;
            of.update_metric_container(&mut inst.mc);
        }

        /* The advertised rank comes from the whole eligible parent set,
           not just the preferred parent, so note whom to blame. */
        let (new_rank, blame) = self.rank_via_dag(i, best, stats);
        if let Some(dag) = self.dag_mut_ref(i, best) {
            dag.rank = new_rank;
            if last_parent.is_none() || new_rank < dag.min_rank {
                /* Departure from RFC 6550: with no previous preferred
                   parent, restart the min-rank anchor to recover from
                   transient bad link conditions. */
                dag.min_rank = new_rank;
            }
        }

        if !self.acceptable_rank(i, best, new_rank) {
            warn!(rank = new_rank, "new rank unacceptable");
            if let Some(blamed) = blame {
                if self.parents.get(&blamed).is_some() {
                    self.nullify_parent(&blamed, stats);
                }
            }
            return None;
        }

        let new_parent = self.dag_ref(i, best)?.preferred_parent;
        if new_parent != last_parent {
            self.commands
                .push(RplCommand::SetDefaultRoute { via: new_parent });
            if let Some(inst) = self.inst_mut(i) {
                inst.def_route = new_parent;
            }
            info!(old_rank, new_rank, "changed preferred parent");
            if self.inst(i)?.mop.is_storing() {
                if let Some(last) = last_parent {
                    /* No-Path DAO to the dethroned parent. */
                    self.dao_output(i, last, ZERO_LIFETIME);
                }
                /* Trigger DAO refresh from immediate children (storing
                   mode, RFC 6550 §9.6). */
                if let Some(inst) = self.inst_mut(i) {
                    inst.dtsn_out = lollipop::increment(inst.dtsn_out);
                }
            }
            /* Parents that now advertise a rank above ours must leave
               the eligible set. */
            self.nullify_parents(i, best, new_rank, stats);
            self.schedule_dao(i, now);
            self.reset_dio_timer(i, now);
        } else if new_rank != old_rank {
            debug!(old_rank, new_rank, "eligible parent update");
            self.nullify_parents(i, best, new_rank, stats);
            if new_rank != INFINITE_RANK
                && old_rank != INFINITE_RANK
                && (new_rank as i32 - old_rank as i32).unsigned_abs()
                    > self.cfg.significant_change_threshold as u32
            {
                debug!("significant rank update");
                self.reset_dio_timer(i, now);
            }
        }
        Some(best)
    }

    /// Enforce acceptability for one parent, then re-run DAG selection.
    /// Returns false when the parent was rejected.
    pub(crate) fn process_parent_event(
        &mut self,
        i: usize,
        addr: &LinkAddr,
        stats: &mut LinkStatsTable,
        now: Instant,
    ) -> bool {
        let last_parent = self.preferred_parent_of_current_dag(i);

        if self
            .inst(i)
            .is_some_and(|inst| inst.mop.is_storing())
            && !self.parent_is_reachable(addr, stats, now)
        {
            warn!(%addr, "unacceptable link, removing routes via parent");
            self.commands
                .push(RplCommand::RemoveRoutesByNexthop { nexthop: *addr });
        }

        let rank_via = self.rank_via_parent(addr, stats);
        let Some(p) = self.parents.get(addr) else {
            return false;
        };
        let (pi, pd) = (p.instance_idx, p.dag_idx);
        if p.is_eligible() && !self.acceptable_rank(pi, pd, rank_via) {
            warn!(
                %addr,
                rank_via,
                "parent may cause an unacceptable advertised rank in the worst case"
            );
            self.nullify_parent(addr, stats);
        }

        if let Some(p) = self.parents.get(addr) {
            if !p.is_eligible()
                && self.dag_ref(pi, pd).is_some_and(|dag| dag.preferred_parent == Some(*addr))
            {
                /* The preferred parent was marked ineligible outside of a
                   nullify call. */
                self.nullify_parent(addr, stats);
            }
        }

        let eligible = self.parents.get(addr).is_some_and(|p| p.is_eligible());
        let was_kicked = self
            .parents
            .get(addr)
            .is_some_and(|p| p.flags & PARENT_FLAG_WAS_KICKED != 0);

        if self.cfg.weighted_interfaces {
            stats.modify_wifsel_flag(addr, eligible);
        }

        if eligible || was_kicked {
            if let Some(p) = self.parents.get_mut(addr) {
                p.flags &= !PARENT_FLAG_WAS_KICKED;
            }
            if self.select_dag(i, addr, stats, now).is_none() && last_parent.is_some() {
                /* No suitable parent anymore in any DAG. */
                error!("no parents found in any DAG");
                self.local_repair(i, stats, now);
                return false;
            }
        }
        eligible
    }

    /* ------------------------------------------------------------------ */
    /* Repair                                                             */
    /* ------------------------------------------------------------------ */

    /// Detach from every DAG of the instance: advertise `INFINITE_RANK`
    /// to poison the sub-DODAG, empty the parent set, and refuse
    /// finite-rank DIOs until the poison window closes.
    pub fn local_repair(&mut self, i: usize, stats: &mut LinkStatsTable, now: Instant) {
        if self.inst(i).is_none() {
            warn!("local repair requested for unknown instance");
            return;
        }
        info!("starting a local instance repair");
        let dag_count = self.inst(i).map(|inst| inst.dags.len()).unwrap_or(0);
        for d in 0..dag_count {
            if self.dag_ref(i, d).is_some() {
                if let Some(dag) = self.dag_mut_ref(i, d) {
                    dag.rank = INFINITE_RANK;
                }
                self.nullify_parents(i, d, 0, stats);
            }
        }
        if let Some(inst) = self.inst_mut(i) {
            inst.has_downward_route = false;
        }
        /* Poisoning DIOs must go out before new DIOs are accepted. */
        self.reset_dio_timer(i, now);
        self.reset_poison_timer(i, now);
        if self.inst(i).is_some_and(|inst| inst.mop.is_storing()) {
            if let Some(inst) = self.inst_mut(i) {
                inst.dtsn_out = lollipop::increment(inst.dtsn_out);
            }
        }
    }

    fn global_repair(
        &mut self,
        from: LinkAddr,
        dio: &Dio,
        i: usize,
        d: usize,
        stats: &mut LinkStatsTable,
        now: Instant,
    ) {
        self.remove_parents(i, d, 0, stats);
        if let Some(dag) = self.dag_mut_ref(i, d) {
            dag.version = dio.version;
            dag.min_rank = INFINITE_RANK;
        }
        if let Some(inst) = self.inst_mut(i) {
            inst.dio_intdoubl = dio.dag_intdoubl;
            inst.dio_intmin = dio.dag_intmin;
            inst.dio_redundancy = dio.dag_redund;
            inst.default_lifetime = dio.default_lifetime;
            inst.lifetime_unit = dio.lifetime_unit;
            inst.dtsn_out = lollipop::increment(inst.dtsn_out);
        }
        if let (Some(inst), Some(dag)) = (self.inst(i), self.dag_ref(i, d)) {
            inst.of.reset(dag);
        }

        if !self.add_parent(i, d, dio, from, stats, now) {
            error!("failed to add a parent during the global repair");
            if let Some(dag) = self.dag_mut_ref(i, d) {
                dag.rank = INFINITE_RANK;
            }
        } else {
            let rank = self.rank_via_parent(&from, stats);
            if let Some(dag) = self.dag_mut_ref(i, d) {
                dag.rank = rank;
                dag.min_rank = rank;
            }
            self.process_parent_event(i, &from, stats, now);
        }
        debug!(
            version = dio.version,
            rank = self.dag_ref(i, d).map(|dag| dag.rank).unwrap_or(INFINITE_RANK),
            "participating in a global repair"
        );
    }

    /// Asynchronous rank recalculation: handle every parent flagged as
    /// updated since the last sweep.
    pub(crate) fn recalculate_ranks(&mut self, stats: &mut LinkStatsTable, now: Instant) {
        for addr in self.parents.addrs() {
            let flagged = self.parents.get_mut(&addr).is_some_and(|p| {
                if p.flags & PARENT_FLAG_UPDATED != 0 {
                    p.flags &= !PARENT_FLAG_UPDATED;
                    true
                } else {
                    false
                }
            });
            if flagged {
                let Some(i) = self.parents.get(&addr).map(|p| p.instance_idx) else {
                    continue;
                };
                debug!(%addr, "recalculating ranks after parent update");
                if !self.process_parent_event(i, &addr, stats, now) {
                    debug!("a parent was dropped");
                }
            }
        }
    }

    /// Feedback from the MAC about a terminal unicast outcome towards
    /// `addr`. Flags the parent for rank recalculation and counts
    /// traffic towards the preferred parent for interface weighting.
    pub fn link_callback(
        &mut self,
        addr: &LinkAddr,
        status: TxStatus,
        numtx: u16,
        stats: &mut LinkStatsTable,
    ) {
        if status == TxStatus::Ok {
            let preferred = self
                .default_instance
                .and_then(|i| self.preferred_parent_of_current_dag(i));
            if preferred == Some(*addr) {
                self.num_tx_preferred += numtx as u32;
            }
        }
        if self.parents.get(addr).is_some() {
            self.exec_norm_metric_logic(false, stats);
            if let Some(p) = self.parents.get_mut(addr) {
                p.flags |= PARENT_FLAG_UPDATED;
            }
        }
    }

    /* ------------------------------------------------------------------ */
    /* Joining                                                            */
    /* ------------------------------------------------------------------ */

    fn join_instance(
        &mut self,
        from: LinkAddr,
        dio: &Dio,
        stats: &mut LinkStatsTable,
        now: Instant,
    ) {
        let Some(of) = find_of(dio.ocp) else {
            warn!(
                instance_id = dio.instance_id,
                ocp = dio.ocp,
                "DIO does not specify a supported objective function"
            );
            return;
        };

        let Some((i, d)) = self.alloc_dag(dio.instance_id, dio.dag_id, of, now) else {
            error!("failed to allocate a DAG object");
            return;
        };

        {
            let Some(inst) = self.inst_mut(i) else {
                return;
            };
            inst.of = of;
            inst.mop = dio.mop;
            inst.mc = dio.mc;
            inst.current_dag = Some(d);
            inst.dtsn_out = lollipop::INIT;
            inst.max_rankinc = dio.dag_max_rankinc;
            inst.min_hoprankinc = dio.dag_min_hoprankinc;
            inst.dio_intdoubl = dio.dag_intdoubl;
            inst.dio_intmin = dio.dag_intmin;
            /* Differ from the minimum interval so the upcoming trickle
               reset actually fires. */
            inst.dio_intcurrent = dio.dag_intmin + dio.dag_intdoubl;
            inst.dio_redundancy = dio.dag_redund;
            inst.default_lifetime = dio.default_lifetime;
            inst.lifetime_unit = dio.lifetime_unit;
        }

        if !self.add_parent(i, d, dio, from, stats, now) {
            debug!("failed to add initial parent, leaving instance");
            self.instances[i] = None;
            return;
        }

        {
            let Some(dag) = self.dag_mut_ref(i, d) else {
                return;
            };
            dag.joined = true;
            dag.preference = dio.preference;
            dag.grounded = dio.grounded;
            dag.version = dio.version;
            dag.dag_id = dio.dag_id;
            dag.prefix_info = dio.prefix_info;
        }

        self.set_preferred_parent(i, d, Some(from), stats);
        {
            let Some(inst) = self.inst_mut(i) else {
                return;
            };
            let of = inst.of;
            of.update_metric_container(&mut inst.mc);
        }
        /* A single parent in the set: its rank is both the path rank and
           the safe upper bound. */
        let rank = self.rank_via_parent(&from, stats);
        if let Some(dag) = self.dag_mut_ref(i, d) {
            dag.rank = rank;
            dag.min_rank = rank;
        }

        if self.default_instance.is_none() {
            self.default_instance = Some(i);
        }

        if self.cfg.weighted_interfaces {
            /* The only parent is preferred and eligible; weighted
               interface selection applies. */
            stats.modify_wifsel_flag(&from, true);
        }

        info!(
            instance_id = dio.instance_id,
            rank,
            dag_id = %dio.dag_id,
            "joined DAG"
        );

        self.reset_dio_timer(i, now);
        self.commands
            .push(RplCommand::SetDefaultRoute { via: Some(from) });
        if let Some(inst) = self.inst_mut(i) {
            inst.def_route = Some(from);
        }

        if dio.mop != Mop::NoDownwardRoutes {
            self.schedule_dao(i, now);
        } else {
            warn!("instance does not use downward routes, no DAO scheduled");
        }

        if let (Some(inst), Some(dag)) = (self.inst(i), self.dag_ref(i, d)) {
            inst.of.reset(dag);
        }
    }

    /// Attach a second (or later) DAG of a known instance.
    fn add_dag(
        &mut self,
        from: LinkAddr,
        dio: &Dio,
        stats: &mut LinkStatsTable,
        now: Instant,
    ) -> Option<(usize, usize)> {
        let of = find_of(dio.ocp)?;
        let (i, d) = self.alloc_dag(dio.instance_id, dio.dag_id, of, now)?;

        let previous_dag = self.find_parent_dag(i, &from);
        match previous_dag {
            None => {
                if !self.add_parent(i, d, dio, from, stats, now) {
                    debug!("failed to add parent for new DAG");
                    if let Some(inst) = self.inst_mut(i) {
                        inst.dags[d] = None;
                    }
                    return None;
                }
            }
            Some(prev) => {
                self.move_parent((i, prev), (i, d), &from, stats);
            }
        }
        if let Some(p) = self.parents.get_mut(&from) {
            p.rank = dio.rank;
            p.flags &= !(PARENT_FLAG_NOT_ELIGIBLE | PARENT_FLAG_WAS_KICKED);
        }

        /* The DIO must agree with the instance-wide configuration. */
        let compatible = self.inst(i).is_some_and(|inst| {
            std::ptr::eq(inst.of, of)
                && inst.mop == dio.mop
                && inst.max_rankinc == dio.dag_max_rankinc
                && inst.min_hoprankinc == dio.dag_min_hoprankinc
                && inst.dio_intdoubl == dio.dag_intdoubl
                && inst.dio_intmin == dio.dag_intmin
                && inst.dio_redundancy == dio.dag_redund
                && inst.default_lifetime == dio.default_lifetime
                && inst.lifetime_unit == dio.lifetime_unit
        });
        if !compatible {
            warn!(
                instance_id = dio.instance_id,
                "DIO incompatible with previous DIO for the instance"
            );
            self.remove_parent(&from, stats);
            if let Some(inst) = self.inst_mut(i) {
                inst.dags[d] = None;
            }
            return None;
        }

        {
            let dag = self.dag_mut_ref(i, d)?;
            dag.grounded = dio.grounded;
            dag.preference = dio.preference;
            dag.version = dio.version;
            dag.dag_id = dio.dag_id;
            dag.prefix_info = dio.prefix_info;
        }

        self.set_preferred_parent(i, d, Some(from), stats);
        let rank = self.rank_via_parent(&from, stats);
        {
            let dag = self.dag_mut_ref(i, d)?;
            dag.rank = rank;
            dag.min_rank = rank;
        }

        info!(
            instance_id = dio.instance_id,
            rank,
            dag_id = %dio.dag_id,
            "joined DAG"
        );

        /* Also maintains the weighted-selection flag. */
        self.process_parent_event(i, &from, stats, now);
        if let Some(p) = self.parents.get_mut(&from) {
            p.dtsn = dio.dtsn;
        }
        Some((i, d))
    }

    /* ------------------------------------------------------------------ */
    /* Root operations                                                    */
    /* ------------------------------------------------------------------ */

    pub fn set_root(
        &mut self,
        instance_id: u8,
        dag_id: DagId,
        stats: &mut LinkStatsTable,
        now: Instant,
    ) -> Result<(), RplError> {
        let of = find_of(self.cfg.of_ocp).ok_or(RplError::UnsupportedOf(self.cfg.of_ocp))?;

        let mut version = lollipop::INIT;
        if let Some(i) = self.instance_by_id(instance_id) {
            let dag_count = self.inst(i).map(|inst| inst.dags.len()).unwrap_or(0);
            for d in 0..dag_count {
                let Some(dag) = self.dag_ref(i, d) else {
                    continue;
                };
                if dag.dag_id == dag_id {
                    version = lollipop::increment(dag.version);
                    if let Some(inst) = self.inst_mut(i) {
                        inst.dags[d] = None;
                    }
                } else {
                    let was_current = self.inst(i).and_then(|inst| inst.current_dag) == Some(d);
                    if was_current {
                        info!("dropping a joined DAG when setting this node as root");
                        self.commands.push(RplCommand::SetDefaultRoute { via: None });
                        if let Some(inst) = self.inst_mut(i) {
                            inst.def_route = None;
                            inst.current_dag = None;
                        }
                    } else {
                        info!("dropping a DAG when setting this node as root");
                    }
                    self.free_dag(i, d, stats);
                }
            }
        }

        let (i, d) = self
            .alloc_dag(instance_id, dag_id, of, now)
            .ok_or(RplError::TableFull)?;

        let cfg_mop = self.cfg.mop;
        let cfg_dio_interval_doublings = self.cfg.dio_interval_doublings;
        let cfg_dio_interval_min = self.cfg.dio_interval_min;
        let cfg_dio_redundancy = self.cfg.dio_redundancy;
        let cfg_max_rankinc = self.cfg.max_rankinc;
        let cfg_min_hoprankinc = self.cfg.min_hoprankinc;
        let cfg_default_lifetime = self.cfg.default_lifetime;
        let cfg_lifetime_unit = self.cfg.lifetime_unit;
        let cfg_grounded = self.cfg.grounded;
        let cfg_preference = self.cfg.preference;
        {
            let Some(inst) = self.inst_mut(i) else {
                return Err(RplError::NoSuchInstance);
            };
            inst.of = of;
            inst.mop = cfg_mop;
            inst.dio_intdoubl = cfg_dio_interval_doublings;
            inst.dio_intmin = cfg_dio_interval_min;
            /* Force the upcoming trickle reset to fire. */
            inst.dio_intcurrent = cfg_dio_interval_min + cfg_dio_interval_doublings;
            inst.dio_redundancy = cfg_dio_redundancy;
            inst.max_rankinc = cfg_max_rankinc;
            inst.min_hoprankinc = cfg_min_hoprankinc;
            inst.default_lifetime = cfg_default_lifetime;
            inst.lifetime_unit = cfg_lifetime_unit;
            inst.current_dag = Some(d);
            inst.dtsn_out = lollipop::INIT;
        }
        {
            let Some(dag) = self.dag_mut_ref(i, d) else {
                return Err(RplError::TableFull);
            };
            dag.version = version;
            dag.joined = true;
            dag.grounded = cfg_grounded;
            dag.preference = cfg_preference;
            dag.dag_id = dag_id;
        }
        let root_rank = self.inst(i).map(|inst| inst.root_rank()).unwrap_or(0);
        if let Some(dag) = self.dag_mut_ref(i, d) {
            dag.rank = root_rank;
            dag.min_rank = root_rank;
        }
        {
            let Some(inst) = self.inst_mut(i) else {
                return Err(RplError::NoSuchInstance);
            };
            let of = inst.of;
            of.update_metric_container(&mut inst.mc);
        }
        self.default_instance = Some(i);

        info!(%dag_id, "node set to be a DAG root");
        self.reset_dio_timer(i, now);
        Ok(())
    }

    /// Initiate a global repair from the root: bump the DODAG version and
    /// start advertising it.
    pub fn repair_root(&mut self, instance_id: u8, now: Instant) -> bool {
        let Some(i) = self.instance_by_id(instance_id) else {
            warn!("repair_root triggered but not root");
            return false;
        };
        if !self.is_root(i) {
            warn!("repair_root triggered but not root");
            return false;
        }
        let Some(inst) = self.inst_mut(i) else {
            return false;
        };
        inst.dtsn_out = lollipop::increment(inst.dtsn_out);
        let Some(d) = inst.current_dag else {
            return false;
        };
        if let Some(dag) = inst.dag_mut(d) {
            dag.version = lollipop::increment(dag.version);
            info!(version = dag.version, "initiating global repair");
        }
        self.reset_dio_timer(i, now);
        true
    }

    fn free_dag(&mut self, i: usize, d: usize, stats: &mut LinkStatsTable) {
        let Some(dag) = self.dag_ref(i, d) else {
            return;
        };
        if dag.joined {
            info!(dag_id = %dag.dag_id, "leaving the DAG");
            let storing = self.inst(i).is_some_and(|inst| inst.mop.is_storing());
            let dag_id = dag.dag_id;
            if storing {
                self.commands.push(RplCommand::RemoveRoutes { dag_id });
            }
            if let Some(dag) = self.dag_mut_ref(i, d) {
                dag.joined = false;
            }
        }
        self.remove_parents(i, d, 0, stats);
        if let Some(inst) = self.inst_mut(i) {
            inst.dags[d] = None;
        }
    }

    /// Age DAG lifetimes; an expired DAG that is not joined is removed.
    pub(crate) fn purge_dags(&mut self, stats: &mut LinkStatsTable) {
        for i in 0..self.instances.len() {
            let dag_count = self.inst(i).map(|inst| inst.dags.len()).unwrap_or(0);
            for d in 0..dag_count {
                let expired = {
                    let Some(dag) = self.dag_mut_ref(i, d) else {
                        continue;
                    };
                    if dag.lifetime == 0 {
                        continue;
                    }
                    dag.lifetime -= 1;
                    dag.lifetime == 0 && !dag.joined
                };
                if expired {
                    info!("removing expired DAG");
                    self.free_dag(i, d, stats);
                }
            }
        }
    }

    /* ------------------------------------------------------------------ */
    /* Control message processing                                         */
    /* ------------------------------------------------------------------ */

    pub fn process_dio(
        &mut self,
        from: LinkAddr,
        dio: &Dio,
        stats: &mut LinkStatsTable,
        now: Instant,
    ) {
        if dio.mop != self.cfg.mop {
            error!(mop = ?dio.mop, "ignoring a DIO with an unsupported MOP");
            return;
        }

        let known_dag = self.get_dag(dio.instance_id, &dio.dag_id);
        let known_instance = self.instance_by_id(dio.instance_id);

        /* A poisoned instance refuses finite ranks until the poison
           window closes. */
        if let Some(i) = known_instance {
            if self.poisoning_instance == Some(i) && dio.rank != INFINITE_RANK {
                debug!(%from, "not processing DIO, currently poisoning the instance");
                return;
            }
        }

        if let (Some((i, d)), Some(_)) = (known_dag, known_instance) {
            let (dag_version, dag_rank, joined) = {
                let Some(dag) = self.dag_ref(i, d) else {
                    return;
                };
                (dag.version, dag.rank, dag.joined)
            };
            let root_rank = self.inst(i).map(|inst| inst.root_rank()).unwrap_or(0);

            if lollipop::greater_than(dio.version, dag_version) {
                if dag_rank == root_rank {
                    /* Our own sub-DODAG advertises a version above ours:
                       outrun it. */
                    warn!(
                        current = dag_version,
                        received = dio.version,
                        "root received inconsistent DIO version"
                    );
                    if let Some(dag) = self.dag_mut_ref(i, d) {
                        dag.version = lollipop::increment(dio.version);
                    }
                } else {
                    debug!("global repair");
                    if let Some(prefix) = &dio.prefix_info {
                        if prefix.length != 0 && prefix.flags & PREFIX_FLAG_AUTONOMOUS != 0 {
                            debug!("prefix announced in DIO");
                            if let Some(dag) = self.dag_mut_ref(i, d) {
                                dag.prefix_info = Some(*prefix);
                            }
                        }
                    }
                    self.global_repair(from, dio, i, d, stats, now);
                }
                if joined {
                    self.reset_dio_timer(i, now);
                }
                return;
            }

            if lollipop::greater_than(dag_version, dio.version) {
                /* The sender lags behind in an older DODAG version. */
                warn!("old DAG version received, inconsistency detected");
                if joined {
                    self.reset_dio_timer(i, now);
                }
                return;
            }
        }

        let Some(i) = known_instance else {
            info!(instance_id = dio.instance_id, "new instance detected, joining");
            self.join_instance(from, dio, stats, now);
            return;
        };

        if self.is_root(i) && known_dag.map(|(_, d)| Some(d)) != self.inst(i).map(|x| x.current_dag)
        {
            warn!("root ignored DIO for different DAG");
            return;
        }

        let (i, d) = match known_dag {
            Some(pair) => pair,
            None => {
                if self.cfg.max_dag_per_instance > 1 {
                    info!("adding new DAG to known instance");
                    match self.add_dag(from, dio, stats, now) {
                        Some(pair) => pair,
                        None => {
                            warn!("failed to add DAG");
                            return;
                        }
                    }
                } else {
                    warn!("only one DAG per instance supported");
                    return;
                }
            }
        };

        let root_rank = self.inst(i).map(|inst| inst.root_rank()).unwrap_or(0);
        if dio.rank < root_rank {
            info!(rank = dio.rank, root_rank, "ignoring DIO with rank below root rank");
            return;
        }

        if let Some(prefix) = &dio.prefix_info {
            if prefix.length != 0 && prefix.flags & PREFIX_FLAG_AUTONOMOUS != 0 {
                debug!("prefix announced in DIO");
                if let Some(dag) = self.dag_mut_ref(i, d) {
                    dag.prefix_info = Some(*prefix);
                }
            }
        }

        let dag_rank = self.dag_ref(i, d).map(|dag| dag.rank).unwrap_or(INFINITE_RANK);
        if dag_rank == root_rank {
            if dio.rank != INFINITE_RANK {
                if let Some(inst) = self.inst_mut(i) {
                    inst.dio_counter += 1;
                }
            }
            debug!("DIO processing terminated, we are root");
            return;
        }

        /* The DIO comes from a valid DAG; refresh its lifetime. */
        let lifetime = {
            let inst = self.inst(i);
            let (intmin, intdoubl) = inst
                .map(|inst| (inst.dio_intmin, inst.dio_intdoubl))
                .unwrap_or((0, 0));
            ((1u64 << (intmin + intdoubl)) * self.cfg.dag_lifetime as u64 / 1000) as u32
        };
        if let Some(dag) = self.dag_mut_ref(i, d) {
            dag.lifetime = lifetime;
        }

        let parent_known = self.find_parent(i, d, &from);
        let dag_joined = self.dag_ref(i, d).is_some_and(|dag| dag.joined);

        if dio.rank < dag_rank {
            debug!(dio_rank = dio.rank, dag_rank, "DIO advertises a rank below ours");
            if !parent_known {
                match self.find_parent_dag(i, &from) {
                    None => {
                        if !self.add_parent(i, d, dio, from, stats, now) {
                            warn!(%from, "failed to add a new parent");
                            return;
                        }
                        info!(%from, rank = dio.rank, "new candidate parent");
                    }
                    Some(prev) => {
                        self.move_parent((i, prev), (i, d), &from, stats);
                    }
                }
                if let Some(p) = self.parents.get_mut(&from) {
                    p.flags &= !(PARENT_FLAG_NOT_ELIGIBLE | PARENT_FLAG_WAS_KICKED);
                }
            } else if self.parents.get(&from).is_some_and(|p| p.rank == dio.rank) {
                info!("received consistent DIO");
                if dag_joined {
                    if let Some(inst) = self.inst_mut(i) {
                        inst.dio_counter += 1;
                    }
                }
            }
            if let Some(p) = self.parents.get_mut(&from) {
                p.rank = dio.rank;
            }

            let eligible = self.parents.get(&from).is_some_and(|p| p.is_eligible());
            if !eligible {
                debug!("originator of DIO is currently ineligible");
                stats.update_norm_metric(&from);
                let rank_via = self.rank_via_parent(&from, stats);
                if self.acceptable_rank(i, d, rank_via) {
                    debug!("originator of DIO will be marked eligible");
                    if let Some(p) = self.parents.get_mut(&from) {
                        p.flags &= !PARENT_FLAG_NOT_ELIGIBLE;
                    }
                    self.exec_norm_metric_logic(true, stats);
                } else {
                    debug!(
                        %from,
                        rank_via,
                        "parent may cause an unacceptable advertised rank in the worst case"
                    );
                    stats.reset_defer_flags(&from);
                }
            } else {
                debug!("originator of DIO is currently eligible");
                self.exec_norm_metric_logic(true, stats);
            }
        } else {
            debug!(dio_rank = dio.rank, dag_rank, "DIO advertises a rank at or above ours");
            if !parent_known {
                match self.find_parent_dag(i, &from) {
                    None => {
                        if !self.add_parent(i, d, dio, from, stats, now) {
                            debug!(%from, "failed to add a new parent");
                            return;
                        }
                        debug!(%from, "new candidate parent, marked ineligible");
                    }
                    Some(prev) => {
                        self.move_parent((i, prev), (i, d), &from, stats);
                        debug!(%from, "moved candidate parent, marked ineligible");
                    }
                }
                if let Some(p) = self.parents.get_mut(&from) {
                    p.flags |= PARENT_FLAG_NOT_ELIGIBLE;
                    p.rank = dio.rank;
                }
                return;
            }
            let already_ineligible = self.parents.get(&from).is_some_and(|p| !p.is_eligible());
            if let Some(p) = self.parents.get_mut(&from) {
                p.rank = dio.rank;
            }
            if already_ineligible {
                debug!(%from, "candidate parent already marked ineligible");
                return;
            }
            debug!(%from, "candidate parent leaves the parent set");
            if let Some(p) = self.parents.get_mut(&from) {
                p.flags |= PARENT_FLAG_NOT_ELIGIBLE | PARENT_FLAG_WAS_KICKED;
            }
            /* Normalize even a preferred parent now; it will not stay
               preferred for long. */
            if self.default_instance.is_some_and(|di| {
                self.preferred_parent_of_current_dag(di) == Some(from)
            }) {
                stats.reset_defer_flags(&from);
            }
            self.exec_norm_metric_logic(true, stats);
        }

        let preferred = self.dag_ref(i, d).and_then(|dag| dag.preferred_parent);
        if dio.rank == INFINITE_RANK && preferred == Some(from) {
            debug!(%from, "preferred parent advertises INFINITE_RANK");
            self.reset_dio_timer(i, now);
        }

        if let Some(p) = self.parents.get_mut(&from) {
            p.mc = dio.mc;
        }

        if !self.process_parent_event(i, &from, stats, now) {
            warn!("the candidate parent is rejected");
            return;
        }

        let preferred = self.dag_ref(i, d).and_then(|dag| dag.preferred_parent);
        let dag_joined = self.dag_ref(i, d).is_some_and(|dag| dag.joined);
        if dag_joined && preferred == Some(from) {
            if self.should_refresh_routes(i, dio, &from) {
                /* The parent requests new DAOs; increment DTSN in turn
                   (RFC 6550 §9.6). */
                if let Some(inst) = self.inst_mut(i) {
                    inst.dtsn_out = lollipop::increment(inst.dtsn_out);
                }
                self.schedule_dao(i, now);
            }
            /* Refresh the default-route lifetime. */
            self.commands
                .push(RplCommand::SetDefaultRoute { via: Some(from) });
        }
        if let Some(p) = self.parents.get_mut(&from) {
            p.dtsn = dio.dtsn;
        }
    }

    fn should_refresh_routes(&self, i: usize, dio: &Dio, from: &LinkAddr) -> bool {
        let Some(inst) = self.inst(i) else {
            return false;
        };
        if inst.mop == Mop::NoDownwardRoutes {
            return false;
        }
        let preferred = inst
            .current_dag
            .and_then(|d| inst.dag(d))
            .and_then(|dag| dag.preferred_parent);
        preferred == Some(*from)
            && self
                .parents
                .get(from)
                .is_some_and(|p| lollipop::greater_than(dio.dtsn, p.dtsn))
    }

    /// A DIS: multicast resets our trickle timers; unicast solicits an
    /// immediate unicast DIO (the probing reply path).
    pub fn process_dis(&mut self, from: LinkAddr, dis: &Dis, unicast: bool, now: Instant) {
        for i in 0..self.instances.len() {
            let Some(inst) = self.inst(i) else {
                continue;
            };
            if let Some(solicited) = &dis.solicited {
                if solicited.instance_id != inst.instance_id {
                    continue;
                }
            }
            if unicast {
                if let Some(inst) = self.inst_mut(i) {
                    inst.unicast_dio_target = Some(from);
                }
                self.dio_output(i, Some(from));
            } else {
                self.reset_dio_timer(i, now);
            }
        }
    }

    /// A DAO from the sub-DODAG (storing mode): install or withdraw the
    /// advertised target.
    pub fn process_dao(&mut self, from: LinkAddr, dao: &Dao) {
        let Some(i) = self.instance_by_id(dao.instance_id) else {
            warn!(instance_id = dao.instance_id, "DAO for unknown instance");
            return;
        };
        let Some(inst) = self.inst(i) else {
            return;
        };
        if !inst.mop.is_storing() {
            return;
        }
        let lifetime_unit = inst.lifetime_unit as u32;
        if dao.lifetime == ZERO_LIFETIME {
            debug!(%from, "No-Path DAO received");
            self.commands.push(RplCommand::RemoveRoute {
                target: dao.target.prefix,
                target_len: dao.target.length,
            });
        } else {
            self.commands.push(RplCommand::AddRoute {
                target: dao.target.prefix,
                target_len: dao.target.length,
                via: from,
                lifetime_seconds: dao.lifetime as u32 * lifetime_unit,
            });
            if let Some(inst) = self.inst_mut(i) {
                inst.has_downward_route = true;
            }
        }
    }

    /* ------------------------------------------------------------------ */
    /* Message construction                                               */
    /* ------------------------------------------------------------------ */

    fn build_dio(&self, i: usize) -> Option<Dio> {
        let inst = self.inst(i)?;
        let dag = inst.dag(inst.current_dag?)?;
        Some(Dio {
            instance_id: inst.instance_id,
            version: dag.version,
            rank: dag.rank,
            grounded: dag.grounded,
            preference: dag.preference,
            mop: inst.mop,
            ocp: inst.of.ocp(),
            dtsn: inst.dtsn_out,
            dag_id: dag.dag_id,
            dag_intdoubl: inst.dio_intdoubl,
            dag_intmin: inst.dio_intmin,
            dag_redund: inst.dio_redundancy,
            dag_max_rankinc: inst.max_rankinc,
            dag_min_hoprankinc: inst.min_hoprankinc,
            default_lifetime: inst.default_lifetime,
            lifetime_unit: inst.lifetime_unit,
            mc: inst.mc,
            prefix_info: dag.prefix_info,
        })
    }

    pub(crate) fn dio_output(&mut self, i: usize, dest: Option<LinkAddr>) {
        if let Some(dio) = self.build_dio(i) {
            debug!(rank = dio.rank, unicast = dest.is_some(), "emitting DIO");
            self.commands.push(RplCommand::SendDio { dest, dio });
        }
    }

    pub(crate) fn dao_output(&mut self, i: usize, parent: LinkAddr, lifetime: u8) {
        let Some(inst) = self.inst(i) else {
            return;
        };
        let instance_id = inst.instance_id;
        let prefix = inst
            .current_dag
            .and_then(|d| inst.dag(d))
            .and_then(|dag| dag.prefix_info);

        let mut target = [0u8; 16];
        if let Some(prefix) = &prefix {
            target[..8].copy_from_slice(&prefix.prefix[..8]);
        }
        target[8..].copy_from_slice(self.node_addr.as_bytes());

        let path_sequence = {
            let Some(inst) = self.inst_mut(i) else {
                return;
            };
            inst.dao_sequence = lollipop::increment(inst.dao_sequence);
            inst.dao_sequence
        };

        debug!(%parent, lifetime, "emitting DAO");
        self.commands.push(RplCommand::SendDao {
            dest: parent,
            dao: Dao {
                instance_id,
                target: PrefixInfo {
                    prefix: target,
                    length: 128,
                    flags: 0,
                },
                lifetime,
                path_sequence,
                parent_addr: None,
            },
        });
    }

    pub(crate) fn dis_output(&mut self, dest: Option<LinkAddr>, iface: ProbeIface) {
        debug!(unicast = dest.is_some(), ?iface, "emitting DIS");
        self.commands.push(RplCommand::SendDis {
            dest,
            dis: Dis::default(),
            iface,
        });
    }
}
