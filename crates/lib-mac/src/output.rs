use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use linkstats::{LinkAddr, LinkStatsTable, TxStatus};
use radio::{Radio, RadioObject, RadioParam, TxOutcome};

use crate::frame::{Frame, ACK_LEN, HEADER_LEN};

/// IEEE 802.15.4 aUnitBackoffPeriod.
const UNIT_BACKOFF: Duration = Duration::from_micros(320);
/// Scale factor compensating for a coarse-grained simulated medium.
const SIM_MEDIUM_BACKOFF_SCALE: u32 = 20;

#[derive(Debug, Clone)]
pub struct MacConfig {
    /// How long to wait for a pending-packet indication after a unicast
    /// transmission.
    pub ack_wait: Duration,
    /// Additional wait for full ACK reception once detected.
    pub after_ack_detected_wait: Duration,
    /// macMinBE.
    pub min_be: u8,
    /// macMaxBE.
    pub max_be: u8,
    /// Collisions tolerated before they count as one retry.
    pub max_backoff: u8,
    /// macMaxFrameRetries.
    pub max_frame_retries: u8,
    pub max_neighbor_queues: usize,
    pub max_packet_per_neighbor: usize,
    /// Scale the unit backoff up for coarse simulated media.
    pub sim_medium: bool,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_micros(400),
            after_ack_detected_wait: Duration::from_micros(667),
            min_be: 3,
            max_be: 5,
            max_backoff: 5,
            max_frame_retries: 7,
            max_neighbor_queues: 2,
            max_packet_per_neighbor: 8,
            sim_medium: false,
        }
    }
}

impl MacConfig {
    fn unit_backoff(&self) -> Duration {
        if self.sim_medium {
            UNIT_BACKOFF * SIM_MEDIUM_BACKOFF_SCALE
        } else {
            UNIT_BACKOFF
        }
    }

    fn default_max_tx(&self) -> u8 {
        self.max_frame_retries + 1
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacError {
    #[error("could not allocate neighbor queue")]
    NeighborTableFull,

    #[error("neighbor queue full")]
    QueueFull,

    #[error("radio advertises no interfaces")]
    NoInterfaces,
}

/// Per-packet send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Total transmission budget; defaults to `max_frame_retries + 1`.
    pub max_tx: Option<u8>,
    /// Transmit one copy per advertised interface, restoring the selected
    /// interface after the last copy completes.
    pub all_interfaces: bool,
    /// Pin the transmission to one interface.
    pub if_id: Option<u8>,
    /// Opaque tag echoed in the terminal [`TxDone`] event.
    pub cookie: u64,
}

/// Terminal outcome of one queued packet, reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxDone {
    pub dest: LinkAddr,
    pub status: TxStatus,
    pub num_tx: u8,
    pub if_id: u8,
    pub cookie: u64,
}

#[derive(Debug)]
struct QueuedPacket {
    frame: Frame,
    if_id: Option<u8>,
    /// Interface to re-select once this packet reaches a terminal
    /// outcome (set on the last copy of an all-interfaces burst).
    restore_if: Option<u8>,
    max_tx: u8,
    cookie: u64,
}

#[derive(Debug)]
struct NeighborQueue {
    laddr: LinkAddr,
    packets: VecDeque<QueuedPacket>,
    num_tx: u8,
    num_col: u8,
    next_tx: Option<Instant>,
}

/// The unicast MAC output engine: one FIFO queue and backoff timer per
/// neighbor, driven by [`MacOutput::poll`] from the event loop.
pub struct MacOutput {
    cfg: MacConfig,
    node_addr: LinkAddr,
    queues: Vec<NeighborQueue>,
    seqno: u8,
    seqno_initialized: bool,
}

impl MacOutput {
    pub fn new(cfg: MacConfig, node_addr: LinkAddr) -> Self {
        Self {
            cfg,
            node_addr,
            queues: Vec::new(),
            seqno: 0,
            seqno_initialized: false,
        }
    }

    /// Earliest scheduled transmission across all neighbor queues.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queues.iter().filter_map(|q| q.next_tx).min()
    }

    pub fn pending_packets(&self) -> usize {
        self.queues.iter().map(|q| q.packets.len()).sum()
    }

    /// Largest payload that still fits under the radio's budget once the
    /// frame header is accounted for.
    pub fn max_payload(&self, radio: &dyn Radio) -> usize {
        let radio_max = radio
            .get_value(RadioParam::ConstMaxPayloadLen)
            .unwrap_or(0)
            .max(0) as usize;
        radio_max.saturating_sub(HEADER_LEN)
    }

    fn next_seqno(&mut self) -> u8 {
        if !self.seqno_initialized {
            self.seqno_initialized = true;
            self.seqno = rand::thread_rng().gen();
        }
        if self.seqno == 0 {
            /* Zero is reserved; the framer treats it as "unset". */
            self.seqno = 1;
        }
        let seqno = self.seqno;
        self.seqno = self.seqno.wrapping_add(1);
        seqno
    }

    /// Enqueue an outbound frame. An all-interfaces send enqueues one copy
    /// per interface advertised by the radio, in collection order, and
    /// arranges for the interface selected before the burst to be restored
    /// after the last copy completes.
    pub fn send(
        &mut self,
        radio: &mut dyn Radio,
        frame: Frame,
        opts: SendOptions,
        now: Instant,
    ) -> Result<(), MacError> {
        let max_tx = opts.max_tx.unwrap_or_else(|| self.cfg.default_max_tx());

        if opts.all_interfaces {
            let collection = match radio.get_object(RadioParam::ConstInterfaceIdCollection) {
                Ok(RadioObject::InterfaceIdCollection(collection)) if !collection.is_empty() => {
                    collection
                }
                _ => {
                    debug!("no interfaces with a valid ID, sending on the default interface");
                    return self.enqueue(frame, opts.if_id, None, max_tx, opts.cookie, now);
                }
            };
            debug!(count = collection.size(), "transmitting on all interfaces");
            let selected = radio
                .get_value(RadioParam::SelIfId)
                .or_else(|_| radio.get_value(RadioParam::ConstInterfaceId))
                .map_err(|_| MacError::NoInterfaces)? as u8;
            let last = collection.size() - 1;
            for (i, desc) in collection.iter().enumerate() {
                let restore_if = (i == last).then_some(selected);
                self.enqueue(
                    frame.clone(),
                    Some(desc.if_id),
                    restore_if,
                    max_tx,
                    opts.cookie,
                    now,
                )?;
            }
            Ok(())
        } else {
            let if_id = match opts.if_id {
                Some(id) => Some(id),
                None => radio
                    .get_value(RadioParam::ConstInterfaceId)
                    .ok()
                    .map(|v| v as u8),
            };
            self.enqueue(frame, if_id, None, max_tx, opts.cookie, now)
        }
    }

    fn enqueue(
        &mut self,
        mut frame: Frame,
        if_id: Option<u8>,
        restore_if: Option<u8>,
        max_tx: u8,
        cookie: u64,
        now: Instant,
    ) -> Result<(), MacError> {
        frame.seqno = self.next_seqno();
        frame.src = self.node_addr;

        let laddr = frame.dest;
        let index = match self.queues.iter().position(|q| q.laddr == laddr) {
            Some(index) => index,
            None => {
                if self.queues.len() >= self.cfg.max_neighbor_queues {
                    warn!(%laddr, "could not allocate neighbor queue, dropping packet");
                    return Err(MacError::NeighborTableFull);
                }
                self.queues.push(NeighborQueue {
                    laddr,
                    packets: VecDeque::new(),
                    num_tx: 0,
                    num_col: 0,
                    next_tx: None,
                });
                self.queues.len() - 1
            }
        };

        let queue = &mut self.queues[index];
        if queue.packets.len() >= self.cfg.max_packet_per_neighbor {
            warn!(%laddr, "neighbor queue full, dropping packet");
            if queue.packets.is_empty() {
                self.queues.remove(index);
            }
            return Err(MacError::QueueFull);
        }

        info!(
            %laddr,
            seqno = frame.seqno,
            len = frame.payload.len(),
            queued = queue.packets.len() + 1,
            "sending"
        );
        queue.packets.push_back(QueuedPacket {
            frame,
            if_id,
            restore_if,
            max_tx,
            cookie,
        });
        if queue.packets.len() == 1 {
            Self::schedule(&self.cfg, queue, now);
        }
        Ok(())
    }

    /// Pick a time for the next transmission: a uniform draw over
    /// `2^BE - 1` backoff periods.
    fn schedule(cfg: &MacConfig, queue: &mut NeighborQueue, now: Instant) {
        let be = (queue.num_col + cfg.min_be).min(cfg.max_be);
        let slots = (1u32 << be) - 1;
        let max_delay = cfg.unit_backoff() * slots;
        let delay = if max_delay > Duration::ZERO {
            let micros = rand::thread_rng().gen_range(0..max_delay.as_micros() as u64);
            Duration::from_micros(micros)
        } else {
            Duration::ZERO
        };
        debug!(
            laddr = %queue.laddr,
            ?delay,
            nb = queue.num_col,
            be,
            "scheduling transmission"
        );
        queue.next_tx = Some(now + delay);
    }

    /// Run every queue whose backoff expired. Transmission attempts run to
    /// completion, including the ACK busy-wait; terminal outcomes feed the
    /// link statistics and are returned to the caller.
    pub fn poll(
        &mut self,
        now: Instant,
        radio: &mut dyn Radio,
        stats: &mut LinkStatsTable,
    ) -> Vec<TxDone> {
        let due: Vec<LinkAddr> = self
            .queues
            .iter()
            .filter(|q| q.next_tx.is_some_and(|t| t <= now))
            .map(|q| q.laddr)
            .collect();

        let mut events = Vec::new();
        for laddr in due {
            self.transmit_from_queue(&laddr, now, radio, stats, &mut events);
        }
        events
    }

    fn transmit_from_queue(
        &mut self,
        laddr: &LinkAddr,
        now: Instant,
        radio: &mut dyn Radio,
        stats: &mut LinkStatsTable,
        events: &mut Vec<TxDone>,
    ) {
        let Some(index) = self.queues.iter().position(|q| q.laddr == *laddr) else {
            return;
        };
        self.queues[index].next_tx = None;
        let Some(head) = self.queues[index].packets.front() else {
            return;
        };

        info!(
            %laddr,
            seqno = head.frame.seqno,
            tx = self.queues[index].num_tx,
            queue = self.queues[index].packets.len(),
            "preparing packet"
        );

        /* Route the attempt to the packet's interface. */
        if let Some(if_id) = head.if_id {
            let _ = radio.set_value(RadioParam::SelIfId, if_id as i32);
        }

        let status = Self::send_one_packet(&self.cfg, head, radio);
        self.packet_sent(index, status, now, radio, stats, events);
    }

    /// One transmission attempt, mirroring the contract of the radio
    /// driver: collision detection before transmit, then the two bounded
    /// busy-wait windows for the acknowledgment.
    fn send_one_packet(cfg: &MacConfig, packet: &QueuedPacket, radio: &mut dyn Radio) -> TxStatus {
        let max_payload = radio
            .get_value(RadioParam::ConstMaxPayloadLen)
            .unwrap_or(i32::MAX) as usize;
        if HEADER_LEN + packet.frame.payload.len() > max_payload {
            warn!(seqno = packet.frame.seqno, "failed to create packet");
            return TxStatus::ErrFatal;
        }

        let bytes = packet.frame.build();
        let dsn = bytes[2];
        let is_broadcast = packet.frame.is_broadcast();

        if radio.prepare(&bytes).is_err() {
            return TxStatus::Err;
        }

        if radio.receiving_packet() || (!is_broadcast && radio.pending_packet()) {
            /* Receiving over the air, or an unread packet must be read
               before an auto-acked exchange can start. */
            return TxStatus::Collision;
        }

        match radio.transmit(bytes.len()) {
            TxOutcome::Ok => {
                if is_broadcast {
                    TxStatus::Ok
                } else {
                    Self::wait_for_ack(cfg, radio, dsn)
                }
            }
            TxOutcome::Collision => TxStatus::Collision,
            TxOutcome::Err => TxStatus::Err,
        }
    }

    fn wait_for_ack(cfg: &MacConfig, radio: &mut dyn Radio, dsn: u8) -> TxStatus {
        busy_wait_until(cfg.ack_wait, || radio.pending_packet());

        if radio.receiving_packet() || radio.pending_packet() || !radio.channel_clear() {
            busy_wait_until(cfg.after_ack_detected_wait, || radio.pending_packet());

            if radio.pending_packet() {
                let mut ackbuf = [0u8; ACK_LEN];
                let len = radio.read(&mut ackbuf);
                if len == ACK_LEN && ackbuf[2] == dsn {
                    debug!("ACK received");
                    return TxStatus::Ok;
                }
                /* Not an ack, or an ack for somebody else. */
                debug!(got = ackbuf[2], expected = dsn, "bad ACK");
                return TxStatus::Collision;
            }
            debug!("no full ACK within the detection window");
        } else {
            debug!("no ACK indication within the wait window");
        }
        TxStatus::Noack
    }

    /// Outcome bookkeeping for one attempt. `num_tx` of the attempt is
    /// always one; collisions convert into retries once `max_backoff`
    /// consecutive ones accumulate.
    fn packet_sent(
        &mut self,
        index: usize,
        status: TxStatus,
        now: Instant,
        radio: &mut dyn Radio,
        stats: &mut LinkStatsTable,
        events: &mut Vec<TxDone>,
    ) {
        let max_tx = self.queues[index]
            .packets
            .front()
            .map(|p| p.max_tx)
            .unwrap_or(1);

        match status {
            TxStatus::Ok => {
                let queue = &mut self.queues[index];
                queue.num_col = 0;
                queue.num_tx += 1;
                self.tx_done(index, TxStatus::Ok, now, radio, stats, events);
            }
            TxStatus::Noack => {
                let queue = &mut self.queues[index];
                queue.num_col = 0;
                queue.num_tx += 1;
                if queue.num_tx >= max_tx {
                    self.tx_done(index, TxStatus::Noack, now, radio, stats, events);
                } else {
                    Self::schedule(&self.cfg, queue, now);
                }
            }
            TxStatus::Collision => {
                let queue = &mut self.queues[index];
                queue.num_col += 1;
                if queue.num_col > self.cfg.max_backoff {
                    queue.num_col = 0;
                    /* Counts as one retry. */
                    queue.num_tx += 1;
                }
                if queue.num_tx >= max_tx {
                    self.tx_done(index, TxStatus::Collision, now, radio, stats, events);
                } else {
                    Self::schedule(&self.cfg, queue, now);
                }
            }
            TxStatus::Deferred => {}
            other => self.tx_done(index, other, now, radio, stats, events),
        }
    }

    /// Terminal outcome: free the packet, restore the interface when the
    /// packet closed an all-interfaces burst, feed the link statistics,
    /// and advance or free the queue.
    fn tx_done(
        &mut self,
        index: usize,
        status: TxStatus,
        now: Instant,
        radio: &mut dyn Radio,
        stats: &mut LinkStatsTable,
        events: &mut Vec<TxDone>,
    ) {
        let queue = &mut self.queues[index];
        let num_tx = queue.num_tx;
        let laddr = queue.laddr;
        let Some(packet) = queue.packets.pop_front() else {
            return;
        };

        let if_id = packet.if_id.unwrap_or_else(|| {
            radio
                .get_value(RadioParam::SelIfId)
                .or_else(|_| radio.get_value(RadioParam::ConstInterfaceId))
                .unwrap_or(0) as u8
        });

        info!(
            %laddr,
            seqno = packet.frame.seqno,
            ?status,
            tx = num_tx,
            "packet sent"
        );

        if let Some(restore) = packet.restore_if {
            /* Goes through the dispatch layer, so a selection change that
               landed mid-burst wins over this restoration. */
            let _ = radio.set_value(RadioParam::SelIfId, restore as i32);
        }

        if !laddr.is_null() {
            stats.packet_sent(&laddr, if_id, status, num_tx as u16, now);
        }

        let queue = &mut self.queues[index];
        if queue.packets.is_empty() {
            self.queues.remove(index);
        } else {
            queue.num_tx = 0;
            queue.num_col = 0;
            Self::schedule(&self.cfg, queue, now);
        }

        events.push(TxDone {
            dest: laddr,
            status,
            num_tx,
            if_id,
            cookie: packet.cookie,
        });
    }
}

/// Spin on a monotonic clock until `cond` holds or the window elapses. No
/// allocation happens while spinning; the ACK windows are microsecond
/// scale.
fn busy_wait_until(window: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + window;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkstats::LinkStatsConfig;
    use radio::{MultiRadio, SimRadio};

    fn addr(last: u8) -> LinkAddr {
        LinkAddr::new([0, 0, 0, 0, 0, 0, 0, last])
    }

    fn frame_to(dest: LinkAddr) -> Frame {
        Frame {
            ack_required: !dest.is_null(),
            seqno: 0,
            dest,
            src: addr(1),
            payload: vec![1, 2, 3],
        }
    }

    fn drain(
        mac: &mut MacOutput,
        radio: &mut dyn Radio,
        stats: &mut LinkStatsTable,
        mut now: Instant,
    ) -> Vec<TxDone> {
        let mut events = Vec::new();
        while let Some(deadline) = mac.next_deadline() {
            now = now.max(deadline);
            events.extend(mac.poll(now, radio, stats));
        }
        events
    }

    #[test]
    fn broadcast_succeeds_first_attempt() {
        let mut radio = SimRadio::new(1, 250);
        radio.on().unwrap();
        let mut stats = LinkStatsTable::new(LinkStatsConfig::default());
        let mut mac = MacOutput::new(MacConfig::default(), addr(1));

        let now = Instant::now();
        mac.send(&mut radio, frame_to(LinkAddr::NULL), SendOptions::default(), now)
            .unwrap();
        let events = drain(&mut mac, &mut radio, &mut stats, now);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, TxStatus::Ok);
        assert_eq!(events[0].num_tx, 1);
        assert_eq!(radio.transmitted().len(), 1);
        assert_eq!(mac.pending_packets(), 0);
    }

    #[test]
    fn unicast_acked_when_dsn_matches() {
        let mut radio = SimRadio::new(1, 250);
        radio.on().unwrap();
        radio.set_auto_ack(true);
        let mut stats = LinkStatsTable::new(LinkStatsConfig::default());
        let mut mac = MacOutput::new(MacConfig::default(), addr(1));

        let now = Instant::now();
        mac.send(&mut radio, frame_to(addr(2)), SendOptions::default(), now)
            .unwrap();
        let events = drain(&mut mac, &mut radio, &mut stats, now);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, TxStatus::Ok);
        assert_eq!(events[0].num_tx, 1);
        /* The terminal outcome fed the link statistics. */
        assert!(stats.get(&addr(2)).is_some());
    }

    #[test]
    fn retry_exhaustion_reports_noack_exactly_once() {
        let mut radio = SimRadio::new(1, 250);
        radio.on().unwrap();
        let mut stats = LinkStatsTable::new(LinkStatsConfig::default());
        let mut mac = MacOutput::new(MacConfig::default(), addr(1));

        let now = Instant::now();
        mac.send(&mut radio, frame_to(addr(2)), SendOptions::default(), now)
            .unwrap();
        let events = drain(&mut mac, &mut radio, &mut stats, now);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, TxStatus::Noack);
        assert_eq!(events[0].num_tx, 8);
        assert_eq!(radio.transmitted().len(), 8);
        assert_eq!(mac.pending_packets(), 0);
    }

    #[test]
    fn mismatched_dsn_counts_as_collision() {
        let mut radio = SimRadio::new(1, 250);
        radio.on().unwrap();
        /* The peer acknowledges, but echoes the wrong DSN. */
        radio.set_auto_ack(true);
        radio.set_auto_ack_dsn_offset(1);
        let mut stats = LinkStatsTable::new(LinkStatsConfig::default());
        let mut mac = MacOutput::new(MacConfig::default(), addr(1));

        let now = Instant::now();
        mac.send(
            &mut radio,
            frame_to(addr(2)),
            SendOptions {
                max_tx: Some(1),
                ..SendOptions::default()
            },
            now,
        )
        .unwrap();
        let events = drain(&mut mac, &mut radio, &mut stats, now);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, TxStatus::Collision);
        assert_eq!(events[0].num_tx, 0);
    }

    #[test]
    fn queue_bounds_are_enforced() {
        let mut radio = SimRadio::new(1, 250);
        radio.on().unwrap();
        let cfg = MacConfig {
            max_neighbor_queues: 1,
            max_packet_per_neighbor: 2,
            ..MacConfig::default()
        };
        let mut mac = MacOutput::new(cfg, addr(1));
        let now = Instant::now();

        mac.send(&mut radio, frame_to(addr(2)), SendOptions::default(), now)
            .unwrap();
        mac.send(&mut radio, frame_to(addr(2)), SendOptions::default(), now)
            .unwrap();
        assert_eq!(
            mac.send(&mut radio, frame_to(addr(2)), SendOptions::default(), now),
            Err(MacError::QueueFull)
        );
        assert_eq!(
            mac.send(&mut radio, frame_to(addr(3)), SendOptions::default(), now),
            Err(MacError::NeighborTableFull)
        );
    }

    #[test]
    fn all_interfaces_burst_restores_selection() {
        let mut a = SimRadio::new(1, 250);
        a.set_auto_ack(true);
        let mut b = SimRadio::new(2, 50);
        b.set_auto_ack(true);
        let mut dispatch = MultiRadio::new(vec![Box::new(a), Box::new(b)]).unwrap();
        dispatch.on().unwrap();
        assert_eq!(dispatch.selected_if_id(), 1);

        let mut stats = LinkStatsTable::new(LinkStatsConfig::default());
        let mut mac = MacOutput::new(MacConfig::default(), addr(1));
        let now = Instant::now();

        mac.send(
            &mut dispatch,
            frame_to(addr(2)),
            SendOptions {
                all_interfaces: true,
                ..SendOptions::default()
            },
            now,
        )
        .unwrap();

        let events = drain(&mut mac, &mut dispatch, &mut stats, now);

        /* One terminal outcome per copy, in collection order. */
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].if_id, 1);
        assert_eq!(events[1].if_id, 2);
        assert!(events.iter().all(|e| e.status == TxStatus::Ok));

        /* Both interfaces carry statistics, and the selection is back to
           the pre-burst interface. */
        let nbr = stats.get(&addr(2)).unwrap();
        assert!(nbr.interface(1).is_some());
        assert!(nbr.interface(2).is_some());
        assert_eq!(dispatch.selected_if_id(), 1);
    }

    #[test]
    fn collisions_convert_into_retries() {
        let mut radio = SimRadio::new(1, 250);
        radio.on().unwrap();
        /* The radio stays busy receiving forever. */
        radio.set_receiving(true);
        let mut stats = LinkStatsTable::new(LinkStatsConfig::default());
        let mut mac = MacOutput::new(MacConfig::default(), addr(1));
        let now = Instant::now();

        mac.send(
            &mut radio,
            frame_to(addr(2)),
            SendOptions {
                max_tx: Some(2),
                ..SendOptions::default()
            },
            now,
        )
        .unwrap();
        let events = drain(&mut mac, &mut radio, &mut stats, now);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, TxStatus::Collision);
        /* Six collisions convert into one retry, twice over. */
        assert_eq!(events[0].num_tx, 2);
        assert_eq!(radio.transmitted().len(), 0);
    }
}
