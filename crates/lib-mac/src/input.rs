use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use linkstats::{LinkAddr, LinkStatsTable};

use crate::frame::{Frame, ACK_LEN};

/// How many distinct senders the duplicate-detection history covers.
const MAX_SEQNO_HISTORY: usize = 16;
/// A registered sequence number older than this no longer counts as a
/// duplicate.
const SEQNO_MAX_AGE: Duration = Duration::from_secs(20);

/// A frame accepted by the demux, ready for the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFrame {
    pub src: LinkAddr,
    pub dest: LinkAddr,
    pub seqno: u8,
    pub payload: Vec<u8>,
    pub if_id: u8,
    pub rssi: i16,
}

#[derive(Debug)]
struct SeqnoEntry {
    addr: LinkAddr,
    seqno: u8,
    registered_at: Instant,
}

/// The MAC input demux: drops acknowledgments and foreign frames, updates
/// link statistics, and suppresses link-layer duplicates by sequence
/// number.
pub struct MacInput {
    node_addr: LinkAddr,
    history: VecDeque<SeqnoEntry>,
    input_locked: bool,
}

impl MacInput {
    pub fn new(node_addr: LinkAddr) -> Self {
        Self {
            node_addr,
            history: VecDeque::new(),
            input_locked: false,
        }
    }

    /// Try-lock preventing re-entrant delivery while a burst is being
    /// dispatched across interfaces.
    pub fn lock_input(&mut self) -> bool {
        if self.input_locked {
            return false;
        }
        self.input_locked = true;
        true
    }

    pub fn unlock_input(&mut self) {
        self.input_locked = false;
    }

    fn is_duplicate(&self, src: &LinkAddr, seqno: u8, now: Instant) -> bool {
        self.history.iter().any(|entry| {
            entry.addr == *src
                && entry.seqno == seqno
                && now.saturating_duration_since(entry.registered_at) < SEQNO_MAX_AGE
        })
    }

    fn register_seqno(&mut self, src: LinkAddr, seqno: u8, now: Instant) {
        self.history.retain(|entry| entry.addr != src);
        self.history.push_back(SeqnoEntry {
            addr: src,
            seqno,
            registered_at: now,
        });
        while self.history.len() > MAX_SEQNO_HISTORY {
            self.history.pop_front();
        }
    }

    /// Process one received frame. Link statistics are updated for every
    /// frame that parses and passes the address filter, duplicates
    /// included; only non-duplicates are delivered upward.
    pub fn input(
        &mut self,
        bytes: &[u8],
        if_id: u8,
        rssi: i16,
        now: Instant,
        stats: &mut LinkStatsTable,
    ) -> Option<IncomingFrame> {
        debug!(if_id, len = bytes.len(), "packet received");
        if bytes.len() == ACK_LEN {
            debug!("ignored ack");
            return None;
        }

        let frame = match Frame::parse(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(len = bytes.len(), %err, "failed to parse");
                return None;
            }
        };

        if frame.dest != self.node_addr && !frame.is_broadcast() {
            debug!(dest = %frame.dest, "not for us");
            return None;
        }
        if frame.src == self.node_addr {
            warn!("frame from ourselves");
            return None;
        }

        stats.packet_received(&frame.src, if_id, rssi, now);

        if self.is_duplicate(&frame.src, frame.seqno, now) {
            warn!(src = %frame.src, seqno = frame.seqno, "drop duplicate link-layer packet");
            return None;
        }
        self.register_seqno(frame.src, frame.seqno, now);

        info!(
            src = %frame.src,
            seqno = frame.seqno,
            len = frame.payload.len(),
            "received packet"
        );
        Some(IncomingFrame {
            src: frame.src,
            dest: frame.dest,
            seqno: frame.seqno,
            payload: frame.payload,
            if_id,
            rssi,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::build_ack;
    use linkstats::LinkStatsConfig;

    fn addr(last: u8) -> LinkAddr {
        LinkAddr::new([0, 0, 0, 0, 0, 0, 0, last])
    }

    fn frame_bytes(src: LinkAddr, dest: LinkAddr, seqno: u8) -> Vec<u8> {
        Frame {
            ack_required: true,
            seqno,
            dest,
            src,
            payload: vec![9, 9, 9],
        }
        .build()
    }

    fn setup() -> (MacInput, LinkStatsTable) {
        (
            MacInput::new(addr(1)),
            LinkStatsTable::new(LinkStatsConfig::default()),
        )
    }

    #[test]
    fn delivers_frames_addressed_to_us_and_broadcasts() {
        let (mut input, mut stats) = setup();
        let now = Instant::now();

        let unicast = input.input(&frame_bytes(addr(2), addr(1), 10), 1, -70, now, &mut stats);
        assert!(unicast.is_some());

        let broadcast = input.input(
            &frame_bytes(addr(2), LinkAddr::NULL, 11),
            1,
            -70,
            now,
            &mut stats,
        );
        assert!(broadcast.is_some());
    }

    #[test]
    fn filters_acks_foreign_frames_and_own_echo() {
        let (mut input, mut stats) = setup();
        let now = Instant::now();

        assert!(input.input(&build_ack(7), 1, -70, now, &mut stats).is_none());
        assert!(input
            .input(&frame_bytes(addr(2), addr(3), 1), 1, -70, now, &mut stats)
            .is_none());
        assert!(input
            .input(&frame_bytes(addr(1), addr(1), 2), 1, -70, now, &mut stats)
            .is_none());
        /* None of those updated the statistics of a neighbor. */
        assert!(stats.get(&addr(2)).is_none());
    }

    #[test]
    fn duplicate_is_dropped_but_still_feeds_statistics() {
        let (mut input, mut stats) = setup();
        let now = Instant::now();
        let bytes = frame_bytes(addr(2), addr(1), 42);

        assert!(input.input(&bytes, 1, -70, now, &mut stats).is_some());
        assert!(input.input(&bytes, 1, -70, now, &mut stats).is_none());

        /* The RSSI EWMA saw both receptions. */
        assert_eq!(stats.get(&addr(2)).unwrap().freshness, 2);
    }

    #[test]
    fn duplicate_detection_expires() {
        let (mut input, mut stats) = setup();
        let now = Instant::now();
        let bytes = frame_bytes(addr(2), addr(1), 42);

        assert!(input.input(&bytes, 1, -70, now, &mut stats).is_some());
        let later = now + SEQNO_MAX_AGE + Duration::from_secs(1);
        assert!(input.input(&bytes, 1, -70, later, &mut stats).is_some());
    }

    #[test]
    fn input_lock_is_a_try_lock() {
        let (mut input, _) = setup();
        assert!(input.lock_input());
        assert!(!input.lock_input());
        input.unlock_input();
        assert!(input.lock_input());
    }
}
