use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use linkstats::{LinkAddr, LinkStatsTable, FRESHNESS_HALF_LIFE};
use mac::frame::Frame;
use mac::{IncomingFrame, MacInput, MacOutput, SendOptions};
use radio::{
    IfaceIdCollection, MultiRadio, Radio, RadioObject, RadioParam, SimRadio, MULTI_RF_EN,
};
use rpl::message::{Dao, Dio, Dis};
use rpl::{ProbeIface, Router, RplCommand};

use crate::config::Config;

/// How often the radios are polled for pending frames when no timer is
/// due earlier.
const RX_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Wire envelope for routing control messages.
#[derive(Debug, Serialize, Deserialize)]
enum ControlMessage {
    Dio(Dio),
    Dao(Dao),
    Dis(Dis),
}

/// One mesh node: the radios behind the dispatch layer, the MAC engines,
/// the link statistics and the routing core, driven from a single
/// cooperative event loop.
pub struct Node {
    addr: LinkAddr,
    radio: MultiRadio,
    ifaces: IfaceIdCollection,
    stats: LinkStatsTable,
    mac_out: MacOutput,
    mac_in: MacInput,
    router: Router,
    routes: BTreeMap<[u8; 16], LinkAddr>,
    default_route: Option<LinkAddr>,
    freshness_tick: Instant,
}

impl Node {
    pub fn new(cfg: &Config) -> Result<Self> {
        let addr = cfg.node_addr()?;

        let mut radios: Vec<Box<dyn Radio>> = Vec::with_capacity(cfg.interfaces.len());
        for iface in &cfg.interfaces {
            let mut radio = SimRadio::new(iface.if_id, iface.data_rate);
            radio
                .set_value(RadioParam::Channel, iface.channel)
                .map_err(|err| anyhow!("interface {}: {err}", iface.if_id))?;
            radios.push(Box::new(radio));
        }
        let mut radio =
            MultiRadio::new(radios).map_err(|err| anyhow!("radio dispatch: {err}"))?;
        radio.init().map_err(|err| anyhow!("radio init: {err}"))?;

        /* The same capability checks the MAC driver performs at init. */
        if radio.get_value(RadioParam::ConstMultiRf)? != MULTI_RF_EN {
            bail!("radio does not support multiple concurrent interfaces");
        }
        let ifaces = match radio.get_object(RadioParam::ConstInterfaceIdCollection)? {
            RadioObject::InterfaceIdCollection(collection) => collection,
            _ => bail!("radio does not advertise its interface collection"),
        };
        let max_payload = radio.get_value(RadioParam::ConstMaxPayloadLen)?;
        if max_payload <= 0 {
            bail!("radio reports no payload budget");
        }
        radio.on().map_err(|err| anyhow!("radio on: {err}"))?;

        let now = Instant::now();
        let mut stats = LinkStatsTable::new(cfg.link_stats_config());
        let mut router = Router::new(cfg.rpl_config(), addr, now);
        if cfg.node.root {
            router.set_root(cfg.node.instance_id, cfg.dag_id()?, &mut stats, now)?;
        }

        Ok(Self {
            addr,
            radio,
            ifaces,
            stats,
            mac_out: MacOutput::new(cfg.mac_config(), addr),
            mac_in: MacInput::new(addr),
            router,
            routes: BTreeMap::new(),
            default_route: None,
            freshness_tick: now + FRESHNESS_HALF_LIFE,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(address = %self.addr, root = self.router.has_joined(), "dripld starting");
        loop {
            let now = Instant::now();
            self.drive(now);

            let mut deadline = now + RX_POLL_INTERVAL;
            for candidate in [
                self.router.next_deadline(),
                self.mac_out.next_deadline(),
                Some(self.freshness_tick),
            ]
            .into_iter()
            .flatten()
            {
                deadline = deadline.min(candidate);
            }
            let idle = deadline
                .saturating_duration_since(now)
                .max(Duration::from_millis(1));

            tokio::select! {
                _ = sleep(idle) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!(
                        default_route = ?self.default_route,
                        routes = self.routes.len(),
                        "shutting down"
                    );
                    return Ok(());
                }
            }
        }
    }

    /// One cooperative pass: aged statistics, due MAC transmissions,
    /// received frames, routing timers, and queued routing commands.
    fn drive(&mut self, now: Instant) {
        if now >= self.freshness_tick {
            self.stats.age_freshness();
            self.freshness_tick = now + FRESHNESS_HALF_LIFE;
        }

        let events = self.mac_out.poll(now, &mut self.radio, &mut self.stats);
        for event in events {
            if !event.dest.is_null() {
                self.router.link_callback(
                    &event.dest,
                    event.status,
                    event.num_tx as u16,
                    &mut self.stats,
                );
            }
        }

        self.poll_radio(now);
        self.router.poll(&self.ifaces, &mut self.stats, now);

        for cmd in self.router.take_commands() {
            self.dispatch(cmd, now);
        }
    }

    fn poll_radio(&mut self, now: Instant) {
        let mut buf = [0u8; 256];
        while self.radio.pending_packet_all() {
            let len = self.radio.read(&mut buf);
            if len == 0 {
                break;
            }
            let if_id = self
                .radio
                .get_value(RadioParam::LastInterfaceId)
                .unwrap_or(0) as u8;
            let rssi = self.radio.get_value(RadioParam::LastRssi).unwrap_or(0) as i16;

            if !self.mac_in.lock_input() {
                warn!("input locked, dropping frame");
                continue;
            }
            let delivered = self.mac_in.input(&buf[..len], if_id, rssi, now, &mut self.stats);
            self.mac_in.unlock_input();

            if let Some(frame) = delivered {
                self.deliver(frame, now);
            }
        }
    }

    fn deliver(&mut self, frame: IncomingFrame, now: Instant) {
        let unicast = !frame.dest.is_null();
        match serde_json::from_slice::<ControlMessage>(&frame.payload) {
            Ok(ControlMessage::Dio(dio)) => {
                self.router.process_dio(frame.src, &dio, &mut self.stats, now)
            }
            Ok(ControlMessage::Dao(dao)) => self.router.process_dao(frame.src, &dao),
            Ok(ControlMessage::Dis(dis)) => {
                self.router.process_dis(frame.src, &dis, unicast, now)
            }
            Err(err) => debug!(src = %frame.src, %err, "payload is not a control message"),
        }
    }

    fn dispatch(&mut self, cmd: RplCommand, now: Instant) {
        match cmd {
            RplCommand::SendDio { dest, dio } => {
                self.send_control(dest, &ControlMessage::Dio(dio), ProbeIface::Any, now)
            }
            RplCommand::SendDao { dest, dao } => {
                self.send_control(Some(dest), &ControlMessage::Dao(dao), ProbeIface::Any, now)
            }
            RplCommand::SendDis { dest, dis, iface } => {
                self.send_control(dest, &ControlMessage::Dis(dis), iface, now)
            }
            RplCommand::SetDefaultRoute { via } => {
                info!(via = ?via, "default route");
                self.default_route = via;
            }
            RplCommand::AddRoute {
                target,
                via,
                lifetime_seconds,
                ..
            } => {
                debug!(%via, lifetime_seconds, "route installed");
                self.routes.insert(target, via);
            }
            RplCommand::RemoveRoute { target, .. } => {
                self.routes.remove(&target);
            }
            RplCommand::RemoveRoutes { .. } => {
                self.routes.clear();
            }
            RplCommand::RemoveRoutesByNexthop { nexthop } => {
                self.routes.retain(|_, via| *via != nexthop);
            }
        }
    }

    fn send_control(
        &mut self,
        dest: Option<LinkAddr>,
        msg: &ControlMessage,
        iface: ProbeIface,
        now: Instant,
    ) {
        let payload = match serde_json::to_vec(msg) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "failed to encode control message");
                return;
            }
        };
        let dest_addr = dest.unwrap_or(LinkAddr::NULL);

        let mut opts = SendOptions::default();
        match iface {
            ProbeIface::Any => {
                /* Unicasts follow the preferred interface towards the
                   neighbor. */
                if let Some(nbr) = self.stats.get(&dest_addr) {
                    if nbr.pref_if_id != 0 {
                        opts.if_id = Some(nbr.pref_if_id);
                    }
                }
            }
            ProbeIface::AllInterfaces => opts.all_interfaces = true,
            ProbeIface::Mandatory(if_id) => opts.if_id = Some(if_id),
        }

        let frame = Frame {
            ack_required: dest.is_some(),
            seqno: 0,
            dest: dest_addr,
            src: self.addr,
            payload,
        };
        if let Err(err) = self.mac_out.send(&mut self.radio, frame, opts, now) {
            warn!(%err, "failed to queue control message");
        }
    }
}
