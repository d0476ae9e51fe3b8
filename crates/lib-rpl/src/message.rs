use std::fmt;

use serde::{Deserialize, Serialize};

use linkstats::LinkAddr;

use crate::rank::Rank;

/// DODAG identifier: a 128-bit value, typically the root's global address.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct DagId([u8; 16]);

impl DagId {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for DagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for chunk in self.0.chunks(2) {
            if chunk.as_ptr() != self.0.as_ptr() {
                write!(f, ":")?;
            }
            write!(f, "{:02x}{:02x}", chunk[0], chunk[1])?;
        }
        Ok(())
    }
}

impl fmt::Debug for DagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The autonomous address-configuration flag of a prefix information
/// option.
pub const PREFIX_FLAG_AUTONOMOUS: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixInfo {
    pub prefix: [u8; 16],
    pub length: u8,
    pub flags: u8,
}

pub const MC_NONE: u8 = 0;
pub const MC_ETX: u8 = 7;
pub const MC_AGGR_ADDITIVE: u8 = 0;

/// Semantic fields of a DAG metric container option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricContainer {
    pub mc_type: u8,
    pub flags: u8,
    pub aggr: u8,
    pub prec: u8,
}

/// Mode of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub enum Mop {
    NoDownwardRoutes,
    NonStoring,
    StoringNoMulticast,
    StoringMulticast,
}

impl Mop {
    pub fn is_storing(self) -> bool {
        matches!(self, Mop::StoringNoMulticast | Mop::StoringMulticast)
    }
}

/// Semantic fields of a DODAG Information Object, including the DODAG
/// configuration option carried with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dio {
    pub instance_id: u8,
    pub version: u8,
    pub rank: Rank,
    pub grounded: bool,
    pub preference: u8,
    pub mop: Mop,
    pub ocp: u16,
    pub dtsn: u8,
    pub dag_id: DagId,
    pub dag_intdoubl: u8,
    pub dag_intmin: u8,
    pub dag_redund: u8,
    pub dag_max_rankinc: u16,
    pub dag_min_hoprankinc: u16,
    pub default_lifetime: u8,
    pub lifetime_unit: u16,
    pub mc: MetricContainer,
    pub prefix_info: Option<PrefixInfo>,
}

/// Semantic fields of a Destination Advertisement Object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dao {
    pub instance_id: u8,
    pub target: PrefixInfo,
    pub lifetime: u8,
    pub path_sequence: u8,
    /// Transit parent, present in non-storing mode only.
    pub parent_addr: Option<LinkAddr>,
}

/// Semantic fields of a DODAG Information Solicitation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dis {
    /// Restrict responses to one instance/DODAG.
    pub solicited: Option<SolicitedInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolicitedInfo {
    pub instance_id: u8,
    pub dag_id: Option<DagId>,
}
