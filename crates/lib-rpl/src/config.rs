use std::time::Duration;

use crate::message::Mop;
use crate::of::OCP_DRIPLOF;
use crate::rank::Rank;

/// Tunables of the routing core. Defaults follow the protocol constants
/// the wire format assumes; deployments override through the daemon
/// configuration.
#[derive(Debug, Clone)]
pub struct RplConfig {
    pub max_instances: usize,
    pub max_dag_per_instance: usize,
    pub max_parents: usize,
    /// Objective code point advertised when acting as root.
    pub of_ocp: u16,
    pub mop: Mop,
    pub grounded: bool,
    pub preference: u8,
    /// Trickle Imin, as a power-of-two exponent over milliseconds.
    pub dio_interval_min: u8,
    /// Trickle doublings (Imax = Imin + doublings).
    pub dio_interval_doublings: u8,
    /// Trickle redundancy constant k; zero disables suppression.
    pub dio_redundancy: u8,
    pub max_rankinc: u16,
    pub min_hoprankinc: u16,
    /// Route lifetime, in `lifetime_unit`s; 0xFF means infinite.
    pub default_lifetime: u8,
    pub lifetime_unit: u16,
    /// DAG lifetime in maximum trickle intervals.
    pub dag_lifetime: u32,
    pub dao_delay: Duration,
    /// Periodic DIS emission period while detached, in seconds.
    pub dis_interval: u32,
    pub dis_start_delay: u32,
    pub probing_interval: Duration,
    /// Probe only the stale interfaces of the target instead of fanning
    /// one probe across all interfaces.
    pub probing_stale_interfaces_only: bool,
    pub with_probing: bool,
    /// Window during which an instance under local repair refuses
    /// finite-rank DIOs.
    pub poison_period: Duration,
    /// Rank movement that resets trickle even without a parent change.
    pub significant_change_threshold: Rank,
    pub weighted_interfaces: bool,
    pub if_weights_window: Duration,
    pub if_weights_delay: Duration,
    pub max_weighting_queue: usize,
}

impl Default for RplConfig {
    fn default() -> Self {
        Self {
            max_instances: 1,
            max_dag_per_instance: 2,
            max_parents: 16,
            of_ocp: OCP_DRIPLOF,
            mop: Mop::StoringNoMulticast,
            grounded: false,
            preference: 0,
            dio_interval_min: 12,
            dio_interval_doublings: 8,
            dio_redundancy: 10,
            max_rankinc: 7 * 256,
            min_hoprankinc: 256,
            default_lifetime: 30,
            lifetime_unit: 60,
            dag_lifetime: 8,
            dao_delay: Duration::from_secs(4),
            dis_interval: 60,
            dis_start_delay: 5,
            probing_interval: Duration::from_secs(120),
            probing_stale_interfaces_only: false,
            with_probing: true,
            poison_period: Duration::from_secs(10),
            significant_change_threshold: 768,
            weighted_interfaces: true,
            if_weights_window: Duration::from_secs(240),
            if_weights_delay: Duration::from_secs(10),
            max_weighting_queue: 4,
        }
    }
}
