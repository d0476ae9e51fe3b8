use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use linkstats::{LinkAddr, LinkStatsTable};
use radio::IfaceIdCollection;

use crate::command::ProbeIface;
use crate::rank::{Rank, INFINITE_RANK};
use crate::router::{Router, INFINITE_LIFETIME};

/// Exponent divisor of the interface weighting formula; chosen so the
/// weight approaches 255 as `density * data_rate` approaches 65535.
const IFW_EXPONENT_DIVISOR: f64 = 8197.7;
/// The traffic density is normalized to packets per four minutes.
const IFW_DENSITY_WINDOW_SECONDS: f64 = 240.0;

impl Router {
    /* ------------------------------------------------------------------ */
    /* DIO trickle                                                        */
    /* ------------------------------------------------------------------ */

    /// Open a new trickle interval of `2^dio_intcurrent` milliseconds and
    /// pick a send time uniformly from its second half.
    fn new_dio_interval(&mut self, i: usize, now: Instant) {
        let Some(inst) = self.inst_mut(i) else {
            return;
        };
        let interval = Duration::from_millis(1u64 << inst.dio_intcurrent);

        /* Send somewhere in [I/2, I); remember the residue so the next
           interval starts on schedule. */
        let half = interval / 2;
        let offset_micros = if half > Duration::ZERO {
            rand::thread_rng().gen_range(0..half.as_micros() as u64)
        } else {
            0
        };
        let until_send = half + Duration::from_micros(offset_micros);
        inst.dio_next_delay = interval - until_send;
        inst.dio_send = true;
        inst.dio_counter = 0;
        inst.dio_timer = Some(now + until_send);
        debug!(
            instance_id = inst.instance_id,
            intcurrent = inst.dio_intcurrent,
            ?until_send,
            "scheduling DIO timer"
        );
    }

    /// Reset trickle to its minimum interval, unless already there.
    pub(crate) fn reset_dio_timer(&mut self, i: usize, now: Instant) {
        let Some(inst) = self.inst_mut(i) else {
            return;
        };
        if inst.dio_intcurrent > inst.dio_intmin {
            inst.dio_counter = 0;
            inst.dio_intcurrent = inst.dio_intmin;
            self.new_dio_interval(i, now);
        }
    }

    pub(crate) fn handle_dio_timer(&mut self, i: usize, now: Instant) {
        debug!("DIO timer triggered");
        if !self.dio_send_ok {
            warn!("postponing DIO transmission, link is not ready");
            if let Some(inst) = self.inst_mut(i) {
                inst.dio_timer = Some(now + Duration::from_secs(1));
            }
            return;
        }

        let (dio_send, counter, redundancy, next_delay) = match self.inst(i) {
            Some(inst) => (
                inst.dio_send,
                inst.dio_counter,
                inst.dio_redundancy,
                inst.dio_next_delay,
            ),
            None => return,
        };
        if dio_send {
            if redundancy != 0 && counter >= redundancy {
                debug!(counter, redundancy, "suppressing DIO transmission");
            } else {
                self.dio_output(i, None);
            }
            if let Some(inst) = self.inst_mut(i) {
                inst.dio_send = false;
                inst.dio_timer = Some(now + next_delay);
            }
        } else {
            /* End of the interval: double it, bounded by Imax. */
            if let Some(inst) = self.inst_mut(i) {
                if inst.dio_intcurrent < inst.dio_intmin + inst.dio_intdoubl {
                    inst.dio_intcurrent += 1;
                    debug!(intcurrent = inst.dio_intcurrent, "DIO timer interval doubled");
                }
            }
            self.new_dio_interval(i, now);
        }
    }

    /* ------------------------------------------------------------------ */
    /* DAO scheduling                                                     */
    /* ------------------------------------------------------------------ */

    fn set_dao_lifetime_timer(&mut self, i: usize, now: Instant) {
        let Some(inst) = self.inst_mut(i) else {
            return;
        };
        if inst.default_lifetime == INFINITE_LIFETIME {
            return;
        }
        /* Re-register between 1/2 and 3/4 of the route lifetime. */
        let half = Duration::from_secs(
            inst.default_lifetime as u64 * inst.lifetime_unit as u64 / 2,
        );
        let jitter_micros = if half > Duration::ZERO {
            rand::thread_rng().gen_range(0..(half.as_micros() as u64) / 2 + 1)
        } else {
            0
        };
        let expiration = half + Duration::from_micros(jitter_micros);
        debug!(?expiration, "scheduling DAO lifetime timer");
        inst.dao_lifetime_timer = Some(now + expiration);
    }

    fn schedule_dao_with_latency(&mut self, i: usize, latency: Duration, now: Instant) {
        let Some(inst) = self.inst(i) else {
            return;
        };
        if inst.dao_timer.is_some_and(|t| t > now) {
            debug!("DAO timer already scheduled");
            return;
        }
        let expiration = if latency > Duration::ZERO {
            let jitter = rand::thread_rng().gen_range(0..latency.as_micros() as u64);
            latency / 2 + Duration::from_micros(jitter)
        } else {
            Duration::ZERO
        };
        debug!(?expiration, "scheduling DAO timer");
        if let Some(inst) = self.inst_mut(i) {
            inst.dao_timer = Some(now + expiration);
        }
        self.set_dao_lifetime_timer(i, now);
    }

    pub(crate) fn schedule_dao(&mut self, i: usize, now: Instant) {
        let delay = self.cfg.dao_delay;
        self.schedule_dao_with_latency(i, delay, now);
    }

    pub fn schedule_dao_immediately(&mut self, i: usize, now: Instant) {
        self.schedule_dao_with_latency(i, Duration::ZERO, now);
    }

    pub fn cancel_dao(&mut self, i: usize) {
        if let Some(inst) = self.inst_mut(i) {
            inst.dao_timer = None;
            inst.dao_lifetime_timer = None;
        }
    }

    fn handle_dao_timer(&mut self, i: usize, now: Instant) {
        let preferred = self
            .inst(i)
            .and_then(|inst| inst.current_dag.and_then(|d| inst.dag(d)))
            .and_then(|dag| dag.preferred_parent);
        match preferred {
            Some(parent) => {
                info!("DAO timer, sending DAO");
                let lifetime = self.inst(i).map(|inst| inst.default_lifetime).unwrap_or(0);
                self.dao_output(i, parent, lifetime);
            }
            None => info!("no suitable DAO parent"),
        }
        let lifetime_expired = self
            .inst(i)
            .map(|inst| inst.dao_lifetime_timer.map_or(true, |t| t <= now))
            .unwrap_or(false);
        if let Some(inst) = self.inst_mut(i) {
            inst.dao_timer = None;
        }
        if lifetime_expired {
            self.set_dao_lifetime_timer(i, now);
        }
    }

    /* ------------------------------------------------------------------ */
    /* Probing                                                            */
    /* ------------------------------------------------------------------ */

    pub(crate) fn probing_delay(&self) -> Duration {
        let interval = self.cfg.probing_interval;
        let jitter = rand::thread_rng().gen_range(0..interval.as_micros() as u64);
        interval / 2 + Duration::from_micros(jitter)
    }

    pub(crate) fn schedule_probing(&mut self, i: usize, now: Instant) {
        let delay = self.probing_delay();
        if let Some(inst) = self.inst_mut(i) {
            inst.probing_timer = Some(now + delay);
        }
    }

    /// Probe within a four-second window.
    pub(crate) fn schedule_probing_now(&mut self, i: usize, now: Instant) {
        let delay = Duration::from_micros(
            rand::thread_rng().gen_range(0..Duration::from_secs(4).as_micros() as u64),
        );
        if let Some(inst) = self.inst_mut(i) {
            inst.probing_timer = Some(now + delay);
        }
    }

    /// Round-robin cursor over the used DAGs of the instance.
    fn next_probing_dag(&mut self, i: usize) -> Option<usize> {
        let inst = self.inst(i)?;
        let dag_count = inst.dags.len();
        if dag_count == 0 {
            return None;
        }
        let start = inst.last_dag.min(dag_count - 1);
        let mut cursor = start;
        let mut found = None;
        loop {
            cursor = (cursor + 1) % dag_count;
            if self.inst(i)?.dag(cursor).is_some() {
                found = Some(cursor);
                break;
            }
            if cursor == start {
                break;
            }
        }
        if let Some(found) = found {
            if let Some(inst) = self.inst_mut(i) {
                inst.last_dag = found;
            }
        }
        found
    }

    /// The next probing target: the urgent target if any, else the
    /// preferred parent when any of its interfaces went stale, else (with
    /// 50% probability) the best-rank parent with a non-fresh interface,
    /// else the parent owning the least-recently refreshed interface.
    pub(crate) fn get_probing_target(
        &self,
        i: usize,
        d: usize,
        stats: &LinkStatsTable,
        now: Instant,
    ) -> Option<LinkAddr> {
        let inst = self.inst(i)?;
        let dag = inst.dag(d)?;

        if let Some(urgent) = inst.urgent_probing_target {
            return Some(urgent);
        }

        if let Some(preferred) = dag.preferred_parent {
            /* Any stale interface of the preferred parent warrants a
               probe, not just all of them. */
            if !self.parent_is_fresh(&preferred, stats, now) {
                return Some(preferred);
            }
        }

        let mut probing_target: Option<LinkAddr> = None;
        if rand::thread_rng().gen_range(0..2) == 0 {
            let mut target_rank: Rank = INFINITE_RANK;
            for p in self.parents.iter() {
                if p.in_dag(i, d) && !self.parent_is_fresh(&p.addr, stats, now) {
                    let p_rank = self.rank_via_parent(&p.addr, stats);
                    if probing_target.is_none() || p_rank < target_rank {
                        probing_target = Some(p.addr);
                        target_rank = p_rank;
                    }
                }
            }
        }

        if probing_target.is_none() {
            let mut target_age = Duration::ZERO;
            for p in self.parents.iter() {
                if !p.in_dag(i, d) {
                    continue;
                }
                let Some(nbr) = stats.get(&p.addr) else {
                    continue;
                };
                for ile in nbr.interfaces() {
                    let age = match ile.last_tx_time {
                        Some(t) => now.saturating_duration_since(t),
                        None => Duration::MAX,
                    };
                    if probing_target.is_none() || age > target_age {
                        /* Do not break: another interface of the same
                           parent may be even older. */
                        probing_target = Some(p.addr);
                        target_age = age;
                    }
                }
            }
        }

        probing_target
    }

    fn handle_probing_timer(&mut self, i: usize, stats: &LinkStatsTable, now: Instant) {
        if let Some(d) = self.next_probing_dag(i) {
            if let Some(target) = self.get_probing_target(i, d, stats, now) {
                let urgent = self
                    .inst(i)
                    .is_some_and(|inst| inst.urgent_probing_target.is_some());
                info!(%target, urgent, "probing parent");

                if self.cfg.probing_stale_interfaces_only {
                    /* Probe only the interfaces whose estimate went
                       stale. */
                    let stale: Vec<u8> = stats
                        .get(&target)
                        .map(|nbr| {
                            nbr.interfaces()
                                .iter()
                                .filter(|ile| !ile.is_fresh(now))
                                .map(|ile| ile.if_id)
                                .collect()
                        })
                        .unwrap_or_default();
                    for if_id in stale {
                        debug!(if_id, "stale interface metric, sending probe");
                        self.dis_output(Some(target), ProbeIface::Mandatory(if_id));
                    }
                } else {
                    self.dis_output(Some(target), ProbeIface::AllInterfaces);
                }
            }
        }
        self.schedule_probing(i, now);
    }

    /* ------------------------------------------------------------------ */
    /* Interface weighting                                                */
    /* ------------------------------------------------------------------ */

    fn skip_weighting_at_root(&self) -> bool {
        self.default_instance.is_some_and(|i| self.is_root(i))
    }

    /// Store a recalculated weight, reporting whether anything changed.
    fn update_interface_weight(&mut self, if_id: u8, weight: u8) -> bool {
        for entry in &mut self.ifw_collection {
            if entry.0 == if_id {
                if entry.1 != weight {
                    debug!(if_id, weight, previously = entry.1, "interface weight updated");
                    entry.1 = weight;
                    return true;
                }
                return false;
            }
        }
        debug!(if_id, weight, "interface weight recorded");
        self.ifw_collection.push((if_id, weight));
        true
    }

    /// Translate the traffic density towards the preferred parent into a
    /// per-interface weight, using each interface's data rate.
    pub(crate) fn recalculate_interface_weights(&mut self, ifaces: &IfaceIdCollection) -> bool {
        if !self.cfg.weighted_interfaces || self.skip_weighting_at_root() {
            return false;
        }
        debug!(
            num_tx = self.num_tx_preferred,
            "recalculating interface weights"
        );
        let window_seconds = self.cfg.if_weights_window.as_secs().max(1) as f64;
        let density =
            (self.num_tx_preferred as f64 / window_seconds) * IFW_DENSITY_WINDOW_SECONDS;

        let mut updated = false;
        for desc in ifaces.iter() {
            let exponent = (density * desc.data_rate as f64) / IFW_EXPONENT_DIVISOR;
            let weight = (2f64.powf(exponent) + 0.5).floor().min(255.0) as u8;
            updated |= self.update_interface_weight(desc.if_id, weight);
        }
        updated
    }

    /// Push the stored weights into the link statistics, for one parent
    /// or for every neighbor.
    pub(crate) fn set_interface_weights(
        &mut self,
        target: Option<&LinkAddr>,
        stats: &mut LinkStatsTable,
    ) {
        if !self.cfg.weighted_interfaces || self.skip_weighting_at_root() {
            return;
        }
        let weights = self.ifw_collection.clone();
        match target {
            Some(addr) => {
                debug!(%addr, entries = weights.len(), "weighting parent interfaces");
                for (if_id, weight) in weights {
                    stats.modify_weight(addr, if_id, weight);
                }
            }
            None => {
                for (if_id, weight) in weights {
                    debug!(if_id, weight, "weighting all neighboring interfaces");
                    stats.modify_weights(if_id, weight);
                }
            }
        }
    }

    /// Weight a new parent's interfaces after a settling delay. The
    /// single delay timer serializes requests through a bounded queue.
    pub(crate) fn schedule_interface_weighting(&mut self, addr: LinkAddr, now: Instant) {
        if self.ifw_delay_timer.is_none() {
            debug!(%addr, "scheduling interface weighting");
            self.ifw_delay_timer = Some((now + self.cfg.if_weights_delay, addr));
        } else if self.weighting_queue.len() < self.cfg.max_weighting_queue {
            debug!(%addr, "delay timer busy, queueing interface weighting");
            self.weighting_queue.push_back((addr, now));
        } else {
            debug!("weighting queue already full");
        }
    }

    fn handle_ifw_delay_timer(&mut self, stats: &mut LinkStatsTable, now: Instant) {
        if let Some((_, addr)) = self.ifw_delay_timer.take() {
            if self.parents.get(&addr).is_some() {
                self.set_interface_weights(Some(&addr), stats);
                debug!(%addr, "selecting preferred interface after weighting");
                stats.select_pref_iface(&addr);
            }
        }
        /* Serve the next queued parent, honoring the remainder of its
           settling delay. */
        while let Some((addr, queued_at)) = self.weighting_queue.pop_front() {
            if self.parents.get(&addr).is_none() {
                continue;
            }
            let elapsed = now.saturating_duration_since(queued_at);
            let delay = self.cfg.if_weights_delay.saturating_sub(elapsed);
            debug!(%addr, ?delay, "scheduling queued interface weighting");
            self.ifw_delay_timer = Some((now + delay, addr));
            break;
        }
    }

    fn handle_ifw_recalc_timer(&mut self, ifaces: &IfaceIdCollection, stats: &mut LinkStatsTable, now: Instant) {
        if self.recalculate_interface_weights(ifaces) {
            self.set_interface_weights(None, stats);
            stats.select_pref_ifaces();
        }
        self.num_tx_preferred = 0;
        self.ifw_recalc_timer = Some(now + self.cfg.if_weights_window);
    }

    /* ------------------------------------------------------------------ */
    /* Poisoning                                                          */
    /* ------------------------------------------------------------------ */

    pub(crate) fn reset_poison_timer(&mut self, i: usize, now: Instant) {
        self.poisoning_instance = Some(i);
        self.poison_timer = Some(now + self.cfg.poison_period);
    }

    fn handle_poison_timer(&mut self) {
        self.poisoning_instance = None;
        self.poison_timer = None;
    }

    /* ------------------------------------------------------------------ */
    /* Periodic work                                                      */
    /* ------------------------------------------------------------------ */

    pub(crate) fn reset_periodic_timer(&mut self, now: Instant) {
        let interval = self.cfg.dis_interval as i64;
        let jitter = rand::thread_rng().gen_range(0..=interval.max(1));
        self.next_dis = interval / 2 + jitter - self.cfg.dis_start_delay as i64;
        self.periodic_timer = Some(now + Duration::from_secs(1));
    }

    fn handle_periodic_timer(&mut self, stats: &mut LinkStatsTable, now: Instant) {
        self.purge_dags(stats);
        self.recalculate_ranks(stats, now);

        /* Solicit DIOs while detached: no joined DAG, or advertising an
           infinite rank outside a poison window. */
        self.next_dis += 1;
        let detached = match self.default_instance {
            None => true,
            Some(i) => {
                self.current_rank(i) == INFINITE_RANK && self.poisoning_instance != Some(i)
            }
        };
        if detached && self.next_dis >= self.cfg.dis_interval as i64 {
            self.next_dis = 0;
            self.dis_output(None, ProbeIface::Any);
        }
        self.periodic_timer = Some(now + Duration::from_secs(1));
    }

    /* ------------------------------------------------------------------ */
    /* Event-loop surface                                                 */
    /* ------------------------------------------------------------------ */

    /// Earliest deadline across all router timers.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut consider = |t: Option<Instant>| {
            if let Some(t) = t {
                deadline = Some(match deadline {
                    Some(d) => d.min(t),
                    None => t,
                });
            }
        };
        consider(self.periodic_timer);
        consider(self.poison_timer);
        consider(self.ifw_recalc_timer);
        consider(self.ifw_delay_timer.map(|(t, _)| t));
        for inst in self.instances.iter().flatten() {
            consider(inst.dio_timer);
            consider(inst.dao_timer);
            consider(inst.dao_lifetime_timer);
            consider(inst.probing_timer);
        }
        deadline
    }

    /// Dispatch every expired timer. The host calls this whenever the
    /// deadline from [`Router::next_deadline`] passes.
    pub fn poll(&mut self, ifaces: &IfaceIdCollection, stats: &mut LinkStatsTable, now: Instant) {
        if self.periodic_timer.is_some_and(|t| t <= now) {
            self.handle_periodic_timer(stats, now);
        }
        if self.poison_timer.is_some_and(|t| t <= now) {
            self.handle_poison_timer();
        }
        if self.ifw_recalc_timer.is_some_and(|t| t <= now) {
            self.handle_ifw_recalc_timer(ifaces, stats, now);
        }
        if self.ifw_delay_timer.is_some_and(|(t, _)| t <= now) {
            self.handle_ifw_delay_timer(stats, now);
        }
        for i in 0..self.instances.len() {
            let (dio, dao, dao_lifetime, probing) = match self.inst(i) {
                Some(inst) => (
                    inst.dio_timer.is_some_and(|t| t <= now),
                    inst.dao_timer.is_some_and(|t| t <= now),
                    inst.dao_lifetime_timer.is_some_and(|t| t <= now),
                    inst.probing_timer.is_some_and(|t| t <= now),
                ),
                None => continue,
            };
            if dio {
                self.handle_dio_timer(i, now);
                self.log_neighbor_list(stats, now);
            }
            if dao {
                self.handle_dao_timer(i, now);
            }
            if dao_lifetime {
                if let Some(inst) = self.inst_mut(i) {
                    inst.dao_lifetime_timer = None;
                }
                self.handle_dao_timer(i, now);
            }
            if probing && self.cfg.with_probing {
                self.handle_probing_timer(i, stats, now);
                self.log_neighbor_list(stats, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RplConfig;
    use crate::message::{DagId, Dio, MetricContainer, Mop};
    use crate::of::OCP_DRIPLOF;
    use crate::rank::lollipop;
    use linkstats::{LinkStatsConfig, TxStatus};
    use radio::IfaceDescriptor;

    fn addr(last: u8) -> LinkAddr {
        LinkAddr::new([0, 0, 0, 0, 0, 0, 0, last])
    }

    fn dio(rank: u16) -> Dio {
        Dio {
            instance_id: 30,
            version: lollipop::INIT,
            rank,
            grounded: true,
            preference: 0,
            mop: Mop::StoringNoMulticast,
            ocp: OCP_DRIPLOF,
            dtsn: lollipop::INIT,
            dag_id: DagId::new([0x20; 16]),
            dag_intdoubl: 8,
            dag_intmin: 12,
            dag_redund: 10,
            dag_max_rankinc: 768,
            dag_min_hoprankinc: 256,
            default_lifetime: 30,
            lifetime_unit: 60,
            mc: MetricContainer::default(),
            prefix_info: None,
        }
    }

    fn joined_router() -> (Router, LinkStatsTable, Instant) {
        let now = Instant::now();
        let mut router = Router::new(RplConfig::default(), addr(1), now);
        let mut stats = LinkStatsTable::new(LinkStatsConfig::default());
        for _ in 0..50 {
            stats.packet_sent(&addr(2), 1, TxStatus::Ok, 1, now);
        }
        router.process_dio(addr(2), &dio(256), &mut stats, now);
        router.take_commands();
        (router, stats, now)
    }

    #[test]
    fn trickle_interval_is_monotone_between_resets() {
        let (mut router, _, start) = joined_router();
        let i = router.default_instance().unwrap();
        assert_eq!(router.inst(i).unwrap().dio_intcurrent, 12);

        let mut now = start;
        let mut previous = 12;
        for _ in 0..64 {
            let Some(deadline) = router.inst(i).unwrap().dio_timer else {
                break;
            };
            now = now.max(deadline);
            router.handle_dio_timer(i, now);
            let current = router.inst(i).unwrap().dio_intcurrent;
            assert!(current >= previous);
            previous = current;
        }
        assert_eq!(previous, 12 + 8);

        router.reset_dio_timer(i, now);
        let inst = router.inst(i).unwrap();
        assert_eq!(inst.dio_intcurrent, 12);
        assert_eq!(inst.dio_counter, 0);
    }

    #[test]
    fn trickle_redundancy_suppresses_dios() {
        let (mut router, _, start) = joined_router();
        let i = router.default_instance().unwrap();
        router.inst_mut(i).unwrap().dio_counter = 200;

        let deadline = router.inst(i).unwrap().dio_timer.unwrap();
        let now = start.max(deadline);
        router.handle_dio_timer(i, now);
        assert!(router
            .take_commands()
            .iter()
            .all(|cmd| !matches!(cmd, crate::command::RplCommand::SendDio { .. })));
    }

    #[test]
    fn probing_targets_urgent_then_stale_parents() {
        let (mut router, mut stats, now) = joined_router();
        let i = router.default_instance().unwrap();

        /* A second, worse parent over a different interface. */
        for _ in 0..50 {
            stats.packet_sent(&addr(3), 2, TxStatus::Ok, 2, now);
        }
        router.process_dio(addr(3), &dio(256), &mut stats, now);

        router.inst_mut(i).unwrap().urgent_probing_target = Some(addr(3));
        assert_eq!(router.get_probing_target(i, 0, &stats, now), Some(addr(3)));
        router.inst_mut(i).unwrap().urgent_probing_target = None;

        /* The preferred parent wins as soon as any of its interfaces
           goes stale. */
        let later = now + Duration::from_secs(11 * 60);
        let preferred = router.preferred_parent(i).unwrap();
        assert!(!router.parent_is_fresh(&preferred, &stats, later));
        assert_eq!(
            router.get_probing_target(i, 0, &stats, later),
            Some(preferred)
        );
    }

    #[test]
    fn probing_falls_back_to_least_recently_refreshed() {
        let (mut router, mut stats, now) = joined_router();
        let i = router.default_instance().unwrap();

        /* Keep the preferred parent fresh, and add a parent whose
           single interface was refreshed long ago. */
        let later = now + Duration::from_secs(9 * 60);
        for _ in 0..50 {
            stats.packet_sent(&addr(2), 1, TxStatus::Ok, 1, later);
        }
        stats.packet_sent(&addr(4), 2, TxStatus::Ok, 1, now);
        router.process_dio(addr(4), &dio(300), &mut stats, later);

        /* Whichever random branch runs, the only candidate with stale
           interfaces is the old parent. */
        for _ in 0..8 {
            assert_eq!(
                router.get_probing_target(i, 0, &stats, later),
                Some(addr(4))
            );
        }
    }

    #[test]
    fn interface_weights_follow_traffic_density() {
        let now = Instant::now();
        let mut router = Router::new(RplConfig::default(), addr(1), now);
        let mut stats = LinkStatsTable::new(LinkStatsConfig::default());

        let mut ifaces = IfaceIdCollection::new();
        ifaces.push(IfaceDescriptor {
            if_id: 1,
            data_rate: 250,
        });
        ifaces.push(IfaceDescriptor {
            if_id: 2,
            data_rate: 50,
        });

        /* 100 packets per window towards the preferred parent. */
        router.num_tx_preferred = 100;
        assert!(router.recalculate_interface_weights(&ifaces));
        assert_eq!(router.ifw_collection, vec![(1, 8), (2, 2)]);

        /* Unchanged density reports no update. */
        router.num_tx_preferred = 100;
        assert!(!router.recalculate_interface_weights(&ifaces));

        /* Weights land in the link statistics of every neighbor. */
        stats.packet_sent(&addr(2), 1, TxStatus::Ok, 1, now);
        stats.packet_sent(&addr(2), 2, TxStatus::Ok, 1, now);
        router.set_interface_weights(None, &mut stats);
        let nbr = stats.get(&addr(2)).unwrap();
        assert_eq!(nbr.interface(1).unwrap().weight, 8);
        assert_eq!(nbr.interface(2).unwrap().weight, 2);
    }

    #[test]
    fn idle_node_weights_interfaces_evenly() {
        let now = Instant::now();
        let mut router = Router::new(RplConfig::default(), addr(1), now);
        let mut ifaces = IfaceIdCollection::new();
        ifaces.push(IfaceDescriptor {
            if_id: 1,
            data_rate: 250,
        });

        /* Zero density: 2^0 rounds to weight 1. */
        router.num_tx_preferred = 0;
        assert!(router.recalculate_interface_weights(&ifaces));
        assert_eq!(router.ifw_collection, vec![(1, 1)]);
    }

    #[test]
    fn parent_weighting_is_delayed_and_queued() {
        let (mut router, mut stats, now) = joined_router();

        /* Joining already armed the delay timer for the first parent. */
        assert!(router.ifw_delay_timer.is_some());
        router.schedule_interface_weighting(addr(3), now);
        assert_eq!(router.weighting_queue.len(), 1);

        /* Only known parents are served from the queue. */
        let fire = router.ifw_delay_timer.unwrap().0;
        router.handle_ifw_delay_timer(&mut stats, fire);
        assert!(router.ifw_delay_timer.is_none());
        assert!(router.weighting_queue.is_empty());
    }
}

