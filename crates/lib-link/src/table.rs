use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::addr::LinkAddr;
use crate::metric::*;

/// Per-interface statistics of one neighbor.
#[derive(Debug, Clone)]
pub struct InterfaceStats {
    pub if_id: u8,
    /// Inferred metric of the physical link (ETX fixed point or LQL).
    pub inferred_metric: u16,
    /// Set when the metric crossed the threshold downward; tells the
    /// routing layer to postpone normalization until the other interfaces
    /// have been resampled.
    pub defer_flag: bool,
    pub weight: u8,
    pub last_tx_time: Option<Instant>,
    pub freshness: u8,
    pub rssi: i16,
    tx_count: u16,
    ack_count: u16,
}

impl InterfaceStats {
    fn new(if_id: u8, weight: u8) -> Self {
        Self {
            if_id,
            inferred_metric: 0,
            defer_flag: false,
            weight,
            last_tx_time: None,
            freshness: 0,
            rssi: 0,
            tx_count: 0,
            ack_count: 0,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        match self.last_tx_time {
            Some(t) => {
                now.saturating_duration_since(t) < FRESHNESS_EXPIRATION_TIME
                    && self.freshness >= FRESHNESS_TARGET
            }
            None => false,
        }
    }
}

/// Per-link packet counters, kept per accounting period and in total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCounters {
    /// Attempts to transmit unicast packets.
    pub num_packets_tx: u16,
    /// ACKs for unicast packets.
    pub num_packets_acked: u16,
    /// Unicast and broadcast packets received.
    pub num_packets_rx: u16,
}

impl PacketCounters {
    fn absorb(&mut self, period: &mut PacketCounters) {
        self.num_packets_tx += period.num_packets_tx;
        self.num_packets_acked += period.num_packets_acked;
        self.num_packets_rx += period.num_packets_rx;
        *period = PacketCounters::default();
    }
}

/// All statistics of a given neighbor: the aggregate link estimates kept
/// for single-interface consumers, the normalized cross-interface metric
/// the objective functions consume, and the bounded interface list.
#[derive(Debug, Clone)]
pub struct NeighborStats {
    pub etx: u16,
    pub rssi: i16,
    pub freshness: u8,
    pub last_tx_time: Option<Instant>,
    /// Weighted average metric across interfaces.
    pub normalized_metric: u16,
    /// ID of the currently preferred interface towards this neighbor.
    pub pref_if_id: u8,
    /// Whether preferred-interface selection is weight-based.
    pub wifsel_flag: bool,
    /// Packets in the current accounting period.
    pub cnt_current: PacketCounters,
    pub cnt_total: PacketCounters,
    interfaces: Vec<InterfaceStats>,
    tx_count: u16,
    ack_count: u16,
}

impl NeighborStats {
    fn new() -> Self {
        Self {
            etx: 0,
            rssi: 0,
            freshness: 0,
            last_tx_time: None,
            normalized_metric: 0,
            pref_if_id: 0,
            wifsel_flag: false,
            cnt_current: PacketCounters::default(),
            cnt_total: PacketCounters::default(),
            interfaces: Vec::new(),
            tx_count: 0,
            ack_count: 0,
        }
    }

    pub fn interfaces(&self) -> &[InterfaceStats] {
        &self.interfaces
    }

    pub fn interface(&self, if_id: u8) -> Option<&InterfaceStats> {
        self.interfaces.iter().find(|ile| ile.if_id == if_id)
    }

    fn interface_mut(&mut self, if_id: u8) -> Option<&mut InterfaceStats> {
        self.interfaces.iter_mut().find(|ile| ile.if_id == if_id)
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        match self.last_tx_time {
            Some(t) => {
                now.saturating_duration_since(t) < FRESHNESS_EXPIRATION_TIME
                    && self.freshness >= FRESHNESS_TARGET
            }
            None => false,
        }
    }
}

fn ewma(stored: u16, sample: u16, alpha: u32) -> u16 {
    ((stored as u32 * (EWMA_SCALE - alpha) + sample as u32 * alpha) / EWMA_SCALE) as u16
}

fn ewma_rssi(stored: i16, sample: i16, alpha: i32) -> i16 {
    ((stored as i32 * (EWMA_SCALE as i32 - alpha) + sample as i32 * alpha) / EWMA_SCALE as i32)
        as i16
}

fn guess_interface_etx(ile: &InterfaceStats) -> u16 {
    guess_etx_from_rssi(ile.rssi)
}

/// Compute the new inferred metric for an interface record. `init` marks a
/// record created for this very update, whose stored metric is not yet
/// meaningful. `packet_rssi` is the RSSI of the packet triggering a
/// reception-path update, if any.
fn inferred_metric(
    cfg: &LinkStatsConfig,
    ile: &mut InterfaceStats,
    status: TxStatus,
    numtx: u16,
    init: bool,
    packet_rssi: i16,
    now: Instant,
) -> u16 {
    match cfg.mode {
        MetricMode::Lql => {
            if status == TxStatus::Ok {
                let rssi = if ile.rssi == 0 { packet_rssi } else { ile.rssi };
                lql_from_rssi(rssi)
            } else {
                0
            }
        }
        MetricMode::EtxEwma | MetricMode::EtxPacketCount => {
            if (status != TxStatus::Ok && status != TxStatus::Noack)
                || (status == TxStatus::Ok && numtx == 0 && !init)
            {
                /* Receptions never feed the ETX estimate of an
                   initialized record. */
                return ile.inferred_metric;
            }

            let mut numtx = numtx;
            if status == TxStatus::Noack {
                numtx += ETX_NOACK_PENALTY;
            }

            if cfg.mode == MetricMode::EtxPacketCount {
                if ile.tx_count + numtx > TX_COUNT_MAX {
                    ile.tx_count /= 2;
                    ile.ack_count /= 2;
                }
                ile.tx_count += numtx;
                if status == TxStatus::Ok {
                    ile.ack_count += 1;
                }
                if ile.ack_count > 0 {
                    (ile.tx_count * ETX_DIVISOR) / ile.ack_count
                } else {
                    ETX_NOACK_PENALTY.max(ile.tx_count) * ETX_DIVISOR
                }
            } else {
                let stored = if init {
                    if cfg.init_etx_from_rssi {
                        guess_interface_etx(ile)
                    } else {
                        ETX_DEFAULT * ETX_DIVISOR
                    }
                } else {
                    ile.inferred_metric
                };
                let packet_etx = numtx * ETX_DIVISOR;
                let alpha = if ile.is_fresh(now) {
                    EWMA_ALPHA
                } else {
                    EWMA_BOOTSTRAP_ALPHA
                };
                ewma(stored, packet_etx, alpha)
            }
        }
    }
}

/// The per-neighbor link statistics table. Owns every neighbor record and
/// its interface list; all lookups key on the link-layer address.
#[derive(Debug, Default)]
pub struct LinkStatsTable {
    cfg: LinkStatsConfig,
    neighbors: BTreeMap<LinkAddr, NeighborStats>,
}

impl LinkStatsTable {
    pub fn new(cfg: LinkStatsConfig) -> Self {
        Self {
            cfg,
            neighbors: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &LinkStatsConfig {
        &self.cfg
    }

    pub fn get(&self, lladdr: &LinkAddr) -> Option<&NeighborStats> {
        self.neighbors.get(lladdr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LinkAddr, &NeighborStats)> {
        self.neighbors.iter()
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn remove(&mut self, lladdr: &LinkAddr) -> bool {
        self.neighbors.remove(lladdr).is_some()
    }

    pub fn reset(&mut self) {
        self.neighbors.clear();
    }

    /// Update the defer flag when the metric crossed the threshold, in
    /// either direction. No crossing leaves the flag untouched.
    fn update_defer_flag(cfg: &LinkStatsConfig, ile: &mut InterfaceStats, old_metric: u16) {
        let was_down = cfg.worse_than_thresh(old_metric);
        let is_down = cfg.worse_than_thresh(ile.inferred_metric);
        if was_down && !is_down {
            trace!(if_id = ile.if_id, "metric crossed threshold upward");
            ile.defer_flag = false;
        } else if !was_down && is_down {
            trace!(if_id = ile.if_id, "metric crossed threshold downward");
            ile.defer_flag = true;
        }
    }

    /// Shared tail of the tx/rx update paths: update or create the
    /// interface record and run the selection/normalization hooks.
    /// Returns false when the interface list is full and no record exists.
    fn update_interface(
        &mut self,
        lladdr: &LinkAddr,
        if_id: u8,
        status: TxStatus,
        numtx: u16,
        packet_rssi: i16,
        now: Instant,
    ) -> bool {
        let cfg = self.cfg.clone();
        let Some(nbr) = self.neighbors.get_mut(lladdr) else {
            return false;
        };

        if let Some(ile) = nbr.interface_mut(if_id) {
            let old_metric = ile.inferred_metric;
            ile.inferred_metric =
                inferred_metric(&cfg, ile, status, numtx, false, packet_rssi, now);
            if ile.inferred_metric != old_metric {
                debug!(
                    %lladdr,
                    if_id,
                    metric = ile.inferred_metric,
                    previously = old_metric,
                    "updated interface metric"
                );
                Self::update_defer_flag(&cfg, ile, old_metric);
                /* Re-selecting makes no sense when the metric is
                   unchanged. */
                self.select_pref_iface(lladdr);
            }
            true
        } else {
            if nbr.interfaces.len() >= cfg.max_ifaces_per_neighbor {
                /* Full interface list: silently keep the existing set. */
                return false;
            }
            let mut ile = InterfaceStats::new(if_id, cfg.default_weight);
            ile.rssi = packet_rssi;
            ile.inferred_metric = inferred_metric(&cfg, &mut ile, status, numtx, true, packet_rssi, now);
            debug!(
                %lladdr,
                if_id,
                metric = ile.inferred_metric,
                "added interface to neighbor"
            );
            nbr.interfaces.push(ile);
            /* Creation leaves defer flags alone; the routing layer resets
               them explicitly where needed. */
            self.update_norm_metric(lladdr);
            self.select_pref_iface(lladdr);
            true
        }
    }

    /// Transmission outcome feed from the MAC. Only `Ok` and `Noack`
    /// update the statistics; collisions and errors never penalize ETX.
    pub fn packet_sent(
        &mut self,
        lladdr: &LinkAddr,
        if_id: u8,
        status: TxStatus,
        numtx: u16,
        now: Instant,
    ) {
        if status != TxStatus::Ok && status != TxStatus::Noack {
            return;
        }

        if !self.neighbors.contains_key(lladdr) {
            /* If the transmission failed, do not add the neighbor; it may
               not exist anymore. */
            if status != TxStatus::Ok {
                return;
            }
            if self.neighbors.len() >= self.cfg.max_neighbors {
                warn!(%lladdr, "neighbor table full, dropping statistics");
                return;
            }
            let mut nbr = NeighborStats::new();
            nbr.etx = if self.cfg.init_etx_from_rssi {
                guess_etx_from_rssi(nbr.rssi)
            } else {
                ETX_DEFAULT * ETX_DIVISOR
            };
            self.neighbors.insert(*lladdr, nbr);
        }

        self.update_interface(lladdr, if_id, status, numtx, 0, now);

        let cfg = self.cfg.clone();
        let Some(nbr) = self.neighbors.get_mut(lladdr) else {
            return;
        };
        let fresh = nbr.is_fresh(now);

        nbr.last_tx_time = Some(now);
        nbr.freshness = (nbr.freshness as u16 + numtx).min(FRESHNESS_MAX as u16) as u8;
        if let Some(ile) = nbr.interface_mut(if_id) {
            ile.last_tx_time = Some(now);
            ile.freshness = (ile.freshness as u16 + numtx).min(FRESHNESS_MAX as u16) as u8;
        }

        nbr.cnt_current.num_packets_tx += numtx;
        if status == TxStatus::Ok {
            nbr.cnt_current.num_packets_acked += 1;
        }

        /* Aggregate ETX, with the no-ACK penalty applied. */
        let mut numtx = numtx;
        if status == TxStatus::Noack {
            numtx += ETX_NOACK_PENALTY;
        }
        if cfg.mode == MetricMode::EtxPacketCount {
            if nbr.tx_count + numtx > TX_COUNT_MAX {
                nbr.tx_count /= 2;
                nbr.ack_count /= 2;
            }
            nbr.tx_count += numtx;
            if status == TxStatus::Ok {
                nbr.ack_count += 1;
            }
            nbr.etx = if nbr.ack_count > 0 {
                (nbr.tx_count * ETX_DIVISOR) / nbr.ack_count
            } else {
                ETX_NOACK_PENALTY.max(nbr.tx_count) * ETX_DIVISOR
            };
        } else {
            let packet_etx = numtx * ETX_DIVISOR;
            let alpha = if fresh { EWMA_ALPHA } else { EWMA_BOOTSTRAP_ALPHA };
            nbr.etx = ewma(nbr.etx, packet_etx, alpha);
        }
    }

    /// Reception feed from the MAC input path.
    pub fn packet_received(&mut self, lladdr: &LinkAddr, if_id: u8, packet_rssi: i16, now: Instant) {
        if !self.neighbors.contains_key(lladdr) {
            if self.neighbors.len() >= self.cfg.max_neighbors {
                warn!(%lladdr, "neighbor table full, dropping statistics");
                return;
            }
            let mut nbr = NeighborStats::new();
            nbr.rssi = packet_rssi;
            nbr.etx = if self.cfg.init_etx_from_rssi {
                guess_etx_from_rssi(nbr.rssi)
            } else {
                ETX_DEFAULT * ETX_DIVISOR
            };
            self.neighbors.insert(*lladdr, nbr);
        }

        self.update_interface(lladdr, if_id, TxStatus::Ok, 0, packet_rssi, now);

        let Some(nbr) = self.neighbors.get_mut(lladdr) else {
            return;
        };
        nbr.last_tx_time = Some(now);
        nbr.freshness = (nbr.freshness + 1).min(FRESHNESS_MAX);
        nbr.cnt_current.num_packets_rx += 1;
        nbr.rssi = ewma_rssi(nbr.rssi, packet_rssi, EWMA_ALPHA as i32);
        if let Some(ile) = nbr.interface_mut(if_id) {
            ile.last_tx_time = Some(now);
            ile.freshness = (ile.freshness + 1).min(FRESHNESS_MAX);
            ile.rssi = ewma_rssi(ile.rssi, packet_rssi, EWMA_ALPHA as i32);
        }
    }

    /// Change the weight of one neighboring interface. A weight of zero is
    /// prohibited.
    pub fn modify_weight(&mut self, lladdr: &LinkAddr, if_id: u8, weight: u8) -> bool {
        if weight == 0 {
            debug!("a weight of 0 is prohibited, aborting weight modification");
            return false;
        }
        let Some(nbr) = self.neighbors.get_mut(lladdr) else {
            return false;
        };
        match nbr.interface_mut(if_id) {
            Some(ile) => {
                ile.weight = weight;
                debug!(%lladdr, if_id, weight, "interface weight changed");
                true
            }
            None => false,
        }
    }

    /// Change the weight of every neighboring interface with the given ID.
    pub fn modify_weights(&mut self, if_id: u8, weight: u8) -> bool {
        if weight == 0 {
            debug!("a weight of 0 is prohibited, aborting weight modification");
            return false;
        }
        for nbr in self.neighbors.values_mut() {
            if let Some(ile) = nbr.interface_mut(if_id) {
                ile.weight = weight;
            }
        }
        true
    }

    /// Flip weight-based preferred-interface selection for one neighbor.
    pub fn modify_wifsel_flag(&mut self, lladdr: &LinkAddr, value: bool) -> bool {
        match self.neighbors.get_mut(lladdr) {
            Some(nbr) => {
                nbr.wifsel_flag = value;
                true
            }
            None => false,
        }
    }

    /// Pick the preferred interface of one neighbor: the interface with
    /// the best inferred metric, where an up interface always beats a down
    /// one, and metrics are scaled by 1/weight when selection is weighted.
    pub fn select_pref_iface(&mut self, lladdr: &LinkAddr) -> bool {
        let cfg = &self.cfg;
        let Some(nbr) = self.neighbors.get_mut(lladdr) else {
            return false;
        };
        if nbr.interfaces.is_empty() {
            return false;
        }

        let mut pref = 0usize;
        for i in 1..nbr.interfaces.len() {
            let cand = &nbr.interfaces[i];
            let cur = &nbr.interfaces[pref];
            let cand_down = cfg.worse_than_thresh(cand.inferred_metric);
            let cur_down = cfg.worse_than_thresh(cur.inferred_metric);

            if cand_down == cur_down {
                let (mut cur_metric, mut cand_metric): (u32, u32) =
                    if cand_down && cfg.thresh_is_lower_bound() {
                        /* Both down under a "less-than" predicate: compare
                           through the placeholder so the tie-break is
                           neutral. */
                        (cfg.metric_placeholder as u32, cfg.metric_placeholder as u32)
                    } else {
                        (cur.inferred_metric as u32, cand.inferred_metric as u32)
                    };
                if nbr.wifsel_flag {
                    /* Four decimal places of precision for the division. */
                    cur_metric *= 10_000;
                    cand_metric *= 10_000;
                    let cur_weight =
                        if cur.weight != 0 { cur.weight } else { cfg.default_weight } as u32;
                    let cand_weight =
                        if cand.weight != 0 { cand.weight } else { cfg.default_weight } as u32;
                    cur_metric = (cur_metric + cur_weight / 2) / cur_weight;
                    cand_metric = (cand_metric + cand_weight / 2) / cand_weight;
                }
                if cand_metric < cur_metric {
                    pref = i;
                }
            } else if cur_down {
                /* The candidate wins simply because it is up. */
                pref = i;
            }
        }

        let pref_if_id = nbr.interfaces[pref].if_id;
        if pref_if_id != nbr.pref_if_id {
            debug!(
                %lladdr,
                from = nbr.pref_if_id,
                to = pref_if_id,
                "preferred interface changed"
            );
        }
        nbr.pref_if_id = pref_if_id;
        true
    }

    /// Preferred-interface selection for every neighbor.
    pub fn select_pref_ifaces(&mut self) {
        let addrs: Vec<LinkAddr> = self.neighbors.keys().copied().collect();
        for addr in addrs {
            self.select_pref_iface(&addr);
        }
    }

    /// Recompute the weighted average metric across a neighbor's
    /// interfaces. Down interfaces contribute the placeholder; missing
    /// slots contribute synthetic `(placeholder, default weight)` entries.
    pub fn update_norm_metric(&mut self, lladdr: &LinkAddr) -> bool {
        let cfg = &self.cfg;
        let Some(nbr) = self.neighbors.get_mut(lladdr) else {
            return false;
        };

        let mut numerator: u32 = 0;
        let mut denominator: u32 = 0;
        let num_if = nbr.interfaces.len();
        if num_if > cfg.max_ifaces_per_neighbor {
            warn!(%lladdr, num_if, "interface list exceeds the per-neighbor bound");
            return false;
        }
        for ile in &nbr.interfaces {
            let metric = if cfg.worse_than_thresh(ile.inferred_metric) {
                cfg.metric_placeholder
            } else {
                ile.inferred_metric
            };
            let weight = if ile.weight != 0 { ile.weight } else { cfg.default_weight };
            numerator += metric as u32 * weight as u32;
            denominator += weight as u32;
        }

        let missing = (cfg.max_ifaces_per_neighbor - num_if) as u32;
        numerator += missing * cfg.metric_placeholder as u32 * cfg.default_weight as u32;
        denominator += missing * cfg.default_weight as u32;
        let denominator = denominator.max(1);

        nbr.normalized_metric = ((numerator + denominator / 2) / denominator) as u16;
        trace!(%lladdr, normalized = nbr.normalized_metric, "normalized metric updated");
        true
    }

    /// Whether normalization for this neighbor must wait: true iff some,
    /// but not all, of its nominal interfaces recently went down. An
    /// interface missing from the list never went down; it has simply
    /// never been available.
    pub fn is_defer_required(&self, lladdr: &LinkAddr) -> bool {
        let Some(nbr) = self.neighbors.get(lladdr) else {
            return false;
        };
        let num_def = nbr.interfaces.iter().filter(|ile| ile.defer_flag).count();
        num_def > 0 && num_def < self.cfg.max_ifaces_per_neighbor
    }

    pub fn reset_defer_flags(&mut self, lladdr: &LinkAddr) -> bool {
        match self.neighbors.get_mut(lladdr) {
            Some(nbr) => {
                for ile in &mut nbr.interfaces {
                    ile.defer_flag = false;
                }
                true
            }
            None => false,
        }
    }

    /// Periodic tick at [`FRESHNESS_HALF_LIFE`]: age every freshness
    /// counter by halving, and close the packet-counter period.
    pub fn age_freshness(&mut self) {
        for (lladdr, nbr) in self.neighbors.iter_mut() {
            nbr.freshness >>= 1;
            for ile in &mut nbr.interfaces {
                ile.freshness >>= 1;
                trace!(%lladdr, if_id = ile.if_id, freshness = ile.freshness, "freshness aged");
            }
            debug!(
                %lladdr,
                tx = nbr.cnt_current.num_packets_tx,
                ack = nbr.cnt_current.num_packets_acked,
                rx = nbr.cnt_current.num_packets_rx,
                "period packet counts"
            );
            nbr.cnt_total.absorb(&mut nbr.cnt_current);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(last: u8) -> LinkAddr {
        LinkAddr::new([0, 0, 0, 0, 0, 0, 0, last])
    }

    fn table() -> LinkStatsTable {
        LinkStatsTable::new(LinkStatsConfig::default())
    }

    /// Drive a neighbor to a known ETX on one interface by repeated
    /// successful single transmissions.
    fn settle(table: &mut LinkStatsTable, lladdr: &LinkAddr, if_id: u8, now: Instant) {
        for _ in 0..50 {
            table.packet_sent(lladdr, if_id, TxStatus::Ok, 1, now);
        }
    }

    #[test]
    fn neighbor_created_on_first_successful_tx_only() {
        let mut t = table();
        let now = Instant::now();
        t.packet_sent(&addr(1), 1, TxStatus::Noack, 1, now);
        assert!(t.get(&addr(1)).is_none());

        t.packet_sent(&addr(1), 1, TxStatus::Ok, 1, now);
        let nbr = t.get(&addr(1)).unwrap();
        assert_eq!(nbr.interfaces().len(), 1);
        assert_eq!(nbr.pref_if_id, 1);
    }

    #[test]
    fn collisions_do_not_touch_the_metric() {
        let mut t = table();
        let now = Instant::now();
        t.packet_sent(&addr(1), 1, TxStatus::Ok, 1, now);
        let before = t.get(&addr(1)).unwrap().interface(1).unwrap().inferred_metric;
        t.packet_sent(&addr(1), 1, TxStatus::Collision, 3, now);
        t.packet_sent(&addr(1), 1, TxStatus::Err, 1, now);
        let after = t.get(&addr(1)).unwrap().interface(1).unwrap().inferred_metric;
        assert_eq!(before, after);
    }

    #[test]
    fn interface_list_is_bounded_and_ids_distinct() {
        let mut t = table();
        let now = Instant::now();
        for if_id in 1..=4u8 {
            t.packet_sent(&addr(1), if_id, TxStatus::Ok, 1, now);
            t.packet_sent(&addr(1), if_id, TxStatus::Ok, 1, now);
        }
        let nbr = t.get(&addr(1)).unwrap();
        assert_eq!(nbr.interfaces().len(), 2);
        let mut ids: Vec<u8> = nbr.interfaces().iter().map(|ile| ile.if_id).collect();
        ids.dedup();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn noack_storm_crosses_threshold_and_switches_interface() {
        let mut t = table();
        let now = Instant::now();
        /* Two fresh interfaces, metrics around 2.0 and 3.0 ETX. */
        settle(&mut t, &addr(1), 1, now);
        settle(&mut t, &addr(1), 2, now);
        for _ in 0..16 {
            t.packet_sent(&addr(1), 1, TxStatus::Ok, 2, now);
            t.packet_sent(&addr(1), 2, TxStatus::Ok, 3, now);
        }
        t.select_pref_iface(&addr(1));
        assert_eq!(t.get(&addr(1)).unwrap().pref_if_id, 1);

        for _ in 0..10 {
            t.packet_sent(&addr(1), 1, TxStatus::Noack, 1, now);
        }

        let nbr = t.get(&addr(1)).unwrap();
        let iface = nbr.interface(1).unwrap();
        assert!(iface.inferred_metric > 0x0300);
        assert!(iface.defer_flag);
        assert!(!nbr.interface(2).unwrap().defer_flag);
        assert_eq!(nbr.pref_if_id, 2);
        assert!(t.is_defer_required(&addr(1)));

        /* Normalization substitutes the placeholder for the down
           interface. */
        t.update_norm_metric(&addr(1));
        let nbr = t.get(&addr(1)).unwrap();
        let up_metric = nbr.interface(2).unwrap().inferred_metric as u32;
        let expected = (0x0400 + up_metric + 1) / 2;
        assert_eq!(nbr.normalized_metric as u32, expected);
    }

    #[test]
    fn noack_penalty_bounds_the_ewma() {
        let mut t = table();
        let now = Instant::now();
        t.packet_sent(&addr(1), 1, TxStatus::Ok, 1, now);
        let ceiling = (1 + ETX_NOACK_PENALTY) * ETX_DIVISOR;
        for _ in 0..200 {
            t.packet_sent(&addr(1), 1, TxStatus::Noack, 1, now);
            let metric = t.get(&addr(1)).unwrap().interface(1).unwrap().inferred_metric;
            assert!(metric <= ceiling);
        }
    }

    #[test]
    fn normalization_is_order_independent_and_fills_missing_slots() {
        let now = Instant::now();
        let mut forward = table();
        settle(&mut forward, &addr(1), 1, now);
        settle(&mut forward, &addr(1), 2, now);
        forward.update_norm_metric(&addr(1));

        let mut reverse = table();
        settle(&mut reverse, &addr(1), 2, now);
        settle(&mut reverse, &addr(1), 1, now);
        reverse.update_norm_metric(&addr(1));

        assert_eq!(
            forward.get(&addr(1)).unwrap().normalized_metric,
            reverse.get(&addr(1)).unwrap().normalized_metric
        );

        /* A single-interface neighbor gets a synthetic placeholder slot. */
        let mut single = table();
        settle(&mut single, &addr(2), 1, now);
        single.update_norm_metric(&addr(2));
        let nbr = single.get(&addr(2)).unwrap();
        let metric = nbr.interface(1).unwrap().inferred_metric as u32;
        let expected = (metric + 0x0400 + 1) / 2;
        assert_eq!(nbr.normalized_metric as u32, expected);
    }

    #[test]
    fn weighted_selection_coerces_zero_weight() {
        let mut t = table();
        let now = Instant::now();
        settle(&mut t, &addr(1), 1, now);
        settle(&mut t, &addr(1), 2, now);
        t.modify_wifsel_flag(&addr(1), true);

        /* Interface 2 gets a large weight, making its scaled metric
           smaller despite equal real metrics. */
        assert!(t.modify_weight(&addr(1), 2, 8));
        assert!(!t.modify_weight(&addr(1), 2, 0));
        t.select_pref_iface(&addr(1));
        assert_eq!(t.get(&addr(1)).unwrap().pref_if_id, 2);
    }

    #[test]
    fn packet_counters_roll_over_each_period() {
        let mut t = table();
        let now = Instant::now();
        t.packet_sent(&addr(1), 1, TxStatus::Ok, 2, now);
        t.packet_sent(&addr(1), 1, TxStatus::Noack, 1, now);
        t.packet_received(&addr(1), 1, -70, now);

        let nbr = t.get(&addr(1)).unwrap();
        assert_eq!(nbr.cnt_current.num_packets_tx, 3);
        assert_eq!(nbr.cnt_current.num_packets_acked, 1);
        assert_eq!(nbr.cnt_current.num_packets_rx, 1);

        t.age_freshness();
        let nbr = t.get(&addr(1)).unwrap();
        assert_eq!(nbr.cnt_current, PacketCounters::default());
        assert_eq!(nbr.cnt_total.num_packets_tx, 3);
        assert_eq!(nbr.cnt_total.num_packets_acked, 1);
        assert_eq!(nbr.cnt_total.num_packets_rx, 1);
    }

    #[test]
    fn freshness_halves_each_period() {
        let mut t = table();
        let now = Instant::now();
        for _ in 0..12 {
            t.packet_sent(&addr(1), 1, TxStatus::Ok, 1, now);
        }
        assert_eq!(t.get(&addr(1)).unwrap().interface(1).unwrap().freshness, 12);

        for expected in [6, 3, 1, 0] {
            t.age_freshness();
            assert_eq!(
                t.get(&addr(1)).unwrap().interface(1).unwrap().freshness,
                expected
            );
        }
    }

    #[test]
    fn freshness_expires_without_traffic() {
        let mut t = table();
        let now = Instant::now();
        for _ in 0..8 {
            t.packet_sent(&addr(1), 1, TxStatus::Ok, 1, now);
        }
        let nbr = t.get(&addr(1)).unwrap();
        assert!(nbr.interface(1).unwrap().is_fresh(now));
        assert!(!nbr
            .interface(1)
            .unwrap()
            .is_fresh(now + FRESHNESS_EXPIRATION_TIME + Duration::from_secs(1)));
    }

    #[test]
    fn receptions_update_rssi_but_not_etx() {
        let mut t = table();
        let now = Instant::now();
        t.packet_sent(&addr(1), 1, TxStatus::Ok, 1, now);
        let metric_before = t.get(&addr(1)).unwrap().interface(1).unwrap().inferred_metric;

        t.packet_received(&addr(1), 1, -70, now);
        t.packet_received(&addr(1), 1, -70, now);

        let nbr = t.get(&addr(1)).unwrap();
        assert_eq!(nbr.interface(1).unwrap().inferred_metric, metric_before);
        assert!(nbr.interface(1).unwrap().rssi < 0);
        assert_eq!(nbr.freshness, 3);
    }

    #[test]
    fn reception_creates_interface_with_rssi_seeded_metric() {
        let mut t = table();
        let now = Instant::now();
        t.packet_received(&addr(1), 2, -60, now);
        let nbr = t.get(&addr(1)).unwrap();
        let iface = nbr.interface(2).unwrap();
        /* Seeded from the strong RSSI (1.0 ETX), then one bootstrap EWMA
           step with a zero-transmission sample. */
        let seeded = ETX_DIVISOR as u32;
        let expected = (seeded * (EWMA_SCALE - EWMA_BOOTSTRAP_ALPHA) / EWMA_SCALE) as u16;
        assert_eq!(iface.inferred_metric, expected);
        assert_eq!(nbr.pref_if_id, 2);
    }

    #[test]
    fn defer_requires_partial_outage() {
        let mut t = table();
        let now = Instant::now();
        settle(&mut t, &addr(1), 1, now);
        settle(&mut t, &addr(1), 2, now);
        assert!(!t.is_defer_required(&addr(1)));

        for _ in 0..10 {
            t.packet_sent(&addr(1), 1, TxStatus::Noack, 1, now);
        }
        assert!(t.is_defer_required(&addr(1)));

        for _ in 0..10 {
            t.packet_sent(&addr(1), 2, TxStatus::Noack, 1, now);
        }
        /* All interfaces down: no partial outage, no deferral. */
        assert!(!t.is_defer_required(&addr(1)));

        t.reset_defer_flags(&addr(1));
        assert!(!t.is_defer_required(&addr(1)));
    }

    #[test]
    fn packet_count_mode_computes_etx_from_counters() {
        let mut t = LinkStatsTable::new(LinkStatsConfig::for_mode(MetricMode::EtxPacketCount));
        let now = Instant::now();
        t.packet_sent(&addr(1), 1, TxStatus::Ok, 2, now);
        /* 2 transmissions, 1 ack. */
        assert_eq!(
            t.get(&addr(1)).unwrap().interface(1).unwrap().inferred_metric,
            2 * ETX_DIVISOR
        );
        t.packet_sent(&addr(1), 1, TxStatus::Ok, 2, now);
        /* 4 transmissions, 2 acks. */
        assert_eq!(
            t.get(&addr(1)).unwrap().interface(1).unwrap().inferred_metric,
            2 * ETX_DIVISOR
        );
    }

    #[test]
    fn lql_mode_updates_on_reception() {
        let mut t = LinkStatsTable::new(LinkStatsConfig::for_mode(MetricMode::Lql));
        let now = Instant::now();
        t.packet_received(&addr(1), 1, -61, now);
        let metric = t.get(&addr(1)).unwrap().interface(1).unwrap().inferred_metric;
        assert!((1..=7).contains(&metric));
    }

    #[test]
    fn table_is_bounded() {
        let mut cfg = LinkStatsConfig::default();
        cfg.max_neighbors = 2;
        let mut t = LinkStatsTable::new(cfg);
        let now = Instant::now();
        t.packet_sent(&addr(1), 1, TxStatus::Ok, 1, now);
        t.packet_sent(&addr(2), 1, TxStatus::Ok, 1, now);
        t.packet_sent(&addr(3), 1, TxStatus::Ok, 1, now);
        assert_eq!(t.len(), 2);
        assert!(t.get(&addr(3)).is_none());
    }
}
