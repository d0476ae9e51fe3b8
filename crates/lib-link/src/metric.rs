use std::time::Duration;

/// ETX fixed point divisor. 128 is the value used by RPL (RFC 6551 and
/// RFC 6719).
pub const ETX_DIVISOR: u16 = 128;
/// In case of no-ACK, add ETX_NOACK_PENALTY to the real tx count.
pub const ETX_NOACK_PENALTY: u16 = 12;
/// Initial ETX value, in whole expected transmissions.
pub const ETX_DEFAULT: u16 = 2;
/// Cap on the RSSI-guessed initial ETX, in whole expected transmissions.
pub const ETX_INIT_MAX: u16 = 3;
/// Maximum value for the tx counter in packet-count mode.
pub const TX_COUNT_MAX: u16 = 32;

/// EWMA (exponential moving average) parameters.
pub const EWMA_SCALE: u32 = 100;
pub const EWMA_ALPHA: u32 = 10;
pub const EWMA_BOOTSTRAP_ALPHA: u32 = 25;

/// RSSI anchors for metric guessing.
pub const RSSI_HIGH: i16 = -60;
pub const RSSI_LOW: i16 = -90;
pub const RSSI_DIFF: i16 = RSSI_HIGH - RSSI_LOW;

/// Statistics with no update within this window are not fresh.
pub const FRESHNESS_EXPIRATION_TIME: Duration = Duration::from_secs(10 * 60);
/// Half life of the freshness counter.
pub const FRESHNESS_HALF_LIFE: Duration = Duration::from_secs(15 * 60);
/// Statistics are fresh once the counter reaches this value.
pub const FRESHNESS_TARGET: u8 = 4;
pub const FRESHNESS_MAX: u8 = 16;

pub const DEFAULT_WEIGHT: u8 = 1;

/// Terminal outcome of a MAC transmission, as reported to the statistics
/// engine and to upper-layer callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Ok,
    Collision,
    Noack,
    Deferred,
    Err,
    ErrFatal,
}

/// How the per-interface metric is inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetricMode {
    /// ETX maintained with an EWMA over per-packet transmission counts.
    #[default]
    EtxEwma,
    /// ETX computed from running tx/ack counters.
    EtxPacketCount,
    /// Link quality level in 1..=7 derived from RSSI, 7 worst.
    Lql,
}

impl MetricMode {
    pub fn is_etx(self) -> bool {
        !matches!(self, MetricMode::Lql)
    }
}

/// Tunables of the link statistics engine.
#[derive(Debug, Clone)]
pub struct LinkStatsConfig {
    pub mode: MetricMode,
    /// At most this many interface records per neighbor.
    pub max_ifaces_per_neighbor: usize,
    pub max_neighbors: usize,
    /// Metric value "below" which a physical link counts as down; the
    /// direction of "below" depends on the mode.
    pub metric_threshold: u16,
    /// Stand-in metric used during normalization for interfaces that are
    /// down or missing.
    pub metric_placeholder: u16,
    pub default_weight: u8,
    /// Seed a new neighbor's ETX from the RSSI of received packets.
    pub init_etx_from_rssi: bool,
}

impl Default for LinkStatsConfig {
    fn default() -> Self {
        Self::for_mode(MetricMode::EtxEwma)
    }
}

impl LinkStatsConfig {
    pub fn for_mode(mode: MetricMode) -> Self {
        let (metric_threshold, metric_placeholder) = if mode.is_etx() {
            (0x0300, 0x0400)
        } else {
            (1, 7)
        };
        Self {
            mode,
            max_ifaces_per_neighbor: 2,
            max_neighbors: 16,
            metric_threshold,
            metric_placeholder,
            default_weight: DEFAULT_WEIGHT,
            init_etx_from_rssi: true,
        }
    }

    /// Whether `metric` is worse than the configured threshold. For ETX a
    /// larger value is worse; for LQL a smaller one is.
    pub fn worse_than_thresh(&self, metric: u16) -> bool {
        if self.mode.is_etx() {
            metric > self.metric_threshold
        } else {
            metric < self.metric_threshold
        }
    }

    /// True when the threshold predicate is a strict lower bound, in which
    /// case two down interfaces compare through the placeholder instead of
    /// their real metrics.
    pub fn thresh_is_lower_bound(&self) -> bool {
        self.worse_than_thresh(self.metric_threshold.wrapping_sub(1))
    }
}

fn bounded_rssi(rssi: i16) -> i16 {
    rssi.min(RSSI_HIGH).max(RSSI_LOW + 1)
}

/// A rough ETX estimate from RSSI: a linear PRR model where RSSI >= -60
/// gives a PRR of 1 and RSSI <= -90 a PRR of 0.
pub fn guess_etx_from_rssi(rssi: i16) -> u16 {
    if rssi == 0 {
        return ETX_DEFAULT * ETX_DIVISOR;
    }
    let etx = (RSSI_DIFF as u32 * ETX_DIVISOR as u32) / (bounded_rssi(rssi) - RSSI_LOW) as u32;
    (etx as u16).min(ETX_INIT_MAX * ETX_DIVISOR)
}

/// Map RSSI into a link-quality level in 1..=7, 7 worst.
pub fn lql_from_rssi(rssi: i16) -> u16 {
    let bounded = bounded_rssi(rssi);
    let scaled = ((bounded - RSSI_LOW) as u32 * 6 + RSSI_DIFF as u32 / 2) / RSSI_DIFF as u32;
    7 - scaled as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etx_guess_follows_rssi() {
        assert_eq!(guess_etx_from_rssi(0), ETX_DEFAULT * ETX_DIVISOR);
        /* Strong signal: one expected transmission. */
        assert_eq!(guess_etx_from_rssi(-50), ETX_DIVISOR);
        assert_eq!(guess_etx_from_rssi(-60), ETX_DIVISOR);
        /* Weak signal clamps at the init cap. */
        assert_eq!(guess_etx_from_rssi(-95), ETX_INIT_MAX * ETX_DIVISOR);
    }

    #[test]
    fn lql_covers_full_range() {
        assert_eq!(lql_from_rssi(-50), 1);
        assert_eq!(lql_from_rssi(-60), 1);
        assert_eq!(lql_from_rssi(-95), 7);
        for rssi in -120..0 {
            let lql = lql_from_rssi(rssi);
            assert!((1..=7).contains(&lql), "rssi {rssi} mapped to {lql}");
        }
    }

    #[test]
    fn threshold_direction_depends_on_mode() {
        let etx = LinkStatsConfig::for_mode(MetricMode::EtxEwma);
        assert!(etx.worse_than_thresh(0x0301));
        assert!(!etx.worse_than_thresh(0x0300));
        assert!(!etx.thresh_is_lower_bound());

        let lql = LinkStatsConfig::for_mode(MetricMode::Lql);
        assert!(lql.worse_than_thresh(0));
        assert!(!lql.worse_than_thresh(1));
        assert!(lql.thresh_is_lower_bound());
    }
}
