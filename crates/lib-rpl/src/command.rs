use linkstats::LinkAddr;

use crate::message::{Dao, DagId, Dio, Dis};

/// Which interface(s) an outbound control message must use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeIface {
    /// Whatever interface is currently selected.
    Any,
    /// Fan out one copy per advertised interface.
    AllInterfaces,
    /// Pin to one interface.
    Mandatory(u8),
}

/// Side effects the routing core asks its host to carry out: control
/// message emission and forwarding-table maintenance. The host drains
/// these with [`crate::Router::take_commands`] after every call into the
/// router.
#[derive(Debug, Clone)]
pub enum RplCommand {
    /// Emit a DIO; `dest == None` means link-local multicast.
    SendDio { dest: Option<LinkAddr>, dio: Dio },
    SendDao { dest: LinkAddr, dao: Dao },
    /// Emit a DIS; `dest == None` means link-local multicast.
    SendDis {
        dest: Option<LinkAddr>,
        dis: Dis,
        iface: ProbeIface,
    },
    SetDefaultRoute { via: Option<LinkAddr> },
    AddRoute {
        target: [u8; 16],
        target_len: u8,
        via: LinkAddr,
        lifetime_seconds: u32,
    },
    RemoveRoute { target: [u8; 16], target_len: u8 },
    /// Drop every route installed for this DAG.
    RemoveRoutes { dag_id: DagId },
    /// Drop every route whose next hop is this neighbor.
    RemoveRoutesByNexthop { nexthop: LinkAddr },
}
