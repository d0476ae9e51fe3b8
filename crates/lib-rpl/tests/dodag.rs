use std::time::{Duration, Instant};

use linkstats::{LinkAddr, LinkStatsConfig, LinkStatsTable, TxStatus};
use radio::IfaceIdCollection;
use rpl::message::{DagId, Dao, Dio, Dis, MetricContainer, Mop, PrefixInfo};
use rpl::of::OCP_DRIPLOF;
use rpl::rank::{lollipop, INFINITE_RANK};
use rpl::{ProbeIface, Router, RplCommand, RplConfig};

const INSTANCE_ID: u8 = 30;

fn addr(last: u8) -> LinkAddr {
    LinkAddr::new([0, 0, 0, 0, 0, 0, 0, last])
}

fn dag_id() -> DagId {
    DagId::new([0x20; 16])
}

fn dio(rank: u16) -> Dio {
    Dio {
        instance_id: INSTANCE_ID,
        version: lollipop::INIT,
        rank,
        grounded: true,
        preference: 0,
        mop: Mop::StoringNoMulticast,
        ocp: OCP_DRIPLOF,
        dtsn: lollipop::INIT,
        dag_id: dag_id(),
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

fn setup() -> (Router, LinkStatsTable, Instant) {
    let now = Instant::now();
    let router = Router::new(RplConfig::default(), addr(1), now);
    let stats = LinkStatsTable::new(LinkStatsConfig::default());
    (router, stats, now)
}

/// Give a neighbor fresh, settled statistics on one interface. Repeated
/// successful single transmissions converge the ETX to one transmission.
fn settle(stats: &mut LinkStatsTable, lladdr: &LinkAddr, if_id: u8, now: Instant) {
    for _ in 0..50 {
        stats.packet_sent(lladdr, if_id, TxStatus::Ok, 1, now);
    }
}

fn ifaces() -> IfaceIdCollection {
    let mut collection = IfaceIdCollection::new();
    collection.push(radio::IfaceDescriptor {
        if_id: 1,
        data_rate: 250,
    });
    collection.push(radio::IfaceDescriptor {
        if_id: 2,
        data_rate: 50,
    });
    collection
}

/// Run the router's timers forward until `predicate` matches one of the
/// emitted commands, or the iteration budget runs out.
fn poll_until(
    router: &mut Router,
    stats: &mut LinkStatsTable,
    mut now: Instant,
    predicate: impl Fn(&RplCommand) -> bool,
) -> Option<RplCommand> {
    let ifaces = ifaces();
    for _ in 0..10_000 {
        let deadline = router.next_deadline()?;
        now = now.max(deadline);
        router.poll(&ifaces, stats, now);
        for cmd in router.take_commands() {
            if predicate(&cmd) {
                return Some(cmd);
            }
        }
    }
    None
}

#[test]
fn joins_instance_on_first_dio() {
    let (mut router, mut stats, now) = setup();
    settle(&mut stats, &addr(2), 1, now);

    router.process_dio(addr(2), &dio(256), &mut stats, now);

    let i = router.default_instance().expect("joined instance");
    assert!(router.has_joined());
    assert_eq!(router.preferred_parent(i), Some(addr(2)));
    /* Path cost through the settled parent: parent rank 256 plus the
       normalized metric (one settled interface at 1.0 ETX plus the
       placeholder slot). */
    assert_eq!(router.current_rank(i), 832);

    let commands = router.take_commands();
    assert!(commands
        .iter()
        .any(|cmd| matches!(cmd, RplCommand::SetDefaultRoute { via: Some(v) } if *v == addr(2))));
    /* Trickle and DAO are armed. */
    assert!(router.next_deadline().is_some());
    assert_eq!(router.dio_interval_current(i), Some(12));
}

#[test]
fn advertised_rank_is_at_least_root_rank_and_acceptable() {
    let (mut router, mut stats, now) = setup();
    settle(&mut stats, &addr(2), 1, now);
    router.process_dio(addr(2), &dio(256), &mut stats, now);
    let i = router.default_instance().unwrap();

    let rank = router.current_rank(i);
    assert!(rank >= 256);
    assert_ne!(rank, INFINITE_RANK);
}

#[test]
fn unacceptable_rank_nullifies_parent_and_repairs() {
    let (mut router, mut stats, now) = setup();
    settle(&mut stats, &addr(2), 1, now);

    router.process_dio(addr(2), &dio(256), &mut stats, now);
    let i = router.default_instance().unwrap();
    assert_eq!(router.current_rank(i), 832);
    router.take_commands();

    /* The parent raises its advertised rank far past the acceptability
       cap anchored at min_rank. */
    router.process_dio(addr(2), &dio(2000), &mut stats, now);

    /* The lone parent was the preferred parent: local repair. */
    assert_eq!(router.current_rank(i), INFINITE_RANK);
    assert_eq!(router.preferred_parent(i), None);
    assert_eq!(router.poisoning_instance(), Some(i));

    /* The dethroned parent got a No-Path DAO. */
    let commands = router.take_commands();
    assert!(commands.iter().any(|cmd| matches!(
        cmd,
        RplCommand::SendDao { dest, dao: Dao { lifetime: 0, .. } } if *dest == addr(2)
    )));
}

#[test]
fn poison_window_refuses_finite_ranks_and_advertises_infinite() {
    let (mut router, mut stats, now) = setup();
    settle(&mut stats, &addr(2), 1, now);
    settle(&mut stats, &addr(3), 1, now);

    router.process_dio(addr(2), &dio(256), &mut stats, now);
    let i = router.default_instance().unwrap();
    router.local_repair(i, &mut stats, now);
    router.take_commands();

    assert_eq!(router.poisoning_instance(), Some(i));
    assert_eq!(router.current_rank(i), INFINITE_RANK);

    /* Finite-rank DIOs are refused while poisoning. */
    router.process_dio(addr(3), &dio(300), &mut stats, now);
    assert!(router.parent(&addr(3)).is_none());
    assert_eq!(router.current_rank(i), INFINITE_RANK);

    /* DIOs emitted during the window advertise INFINITE_RANK. */
    let sent = poll_until(&mut router, &mut stats, now, |cmd| {
        matches!(cmd, RplCommand::SendDio { dest: None, .. })
    })
    .expect("a DIO during the poison window");
    let RplCommand::SendDio { dio: sent_dio, .. } = sent else {
        unreachable!();
    };
    assert_eq!(sent_dio.rank, INFINITE_RANK);

    /* Once the window closes, finite ranks are accepted again. */
    let after = now + Duration::from_secs(11);
    router.poll(&ifaces(), &mut stats, after);
    assert_eq!(router.poisoning_instance(), None);
    router.process_dio(addr(3), &dio(300), &mut stats, after);
    assert_eq!(router.preferred_parent(i), Some(addr(3)));
    assert_ne!(router.current_rank(i), INFINITE_RANK);
}

#[test]
fn stale_dio_version_resets_trickle() {
    let (mut router, mut stats, now) = setup();
    settle(&mut stats, &addr(2), 1, now);
    router.process_dio(addr(2), &dio(256), &mut stats, now);
    let i = router.default_instance().unwrap();

    /* Let trickle grow past the minimum interval. */
    poll_until(&mut router, &mut stats, now, |_| false);
    /* The loop above runs the deadline budget dry; the interval must
       have grown by then. */
    assert!(router.dio_interval_current(i) > Some(12));

    let mut stale = dio(256);
    stale.version = lollipop::INIT - 1;
    let later = now + Duration::from_secs(3600);
    router.process_dio(addr(2), &stale, &mut stats, later);
    assert_eq!(router.dio_interval_current(i), Some(12));
}

#[test]
fn newer_version_triggers_global_repair() {
    let (mut router, mut stats, now) = setup();
    settle(&mut stats, &addr(2), 1, now);
    router.process_dio(addr(2), &dio(256), &mut stats, now);
    let i = router.default_instance().unwrap();
    router.take_commands();

    let mut newer = dio(256);
    newer.version = lollipop::increment(lollipop::INIT);
    router.process_dio(addr(2), &newer, &mut stats, now);

    /* Still joined through the sender, in the new version. */
    assert_eq!(router.preferred_parent(i), Some(addr(2)));
    assert_eq!(router.current_rank(i), 832);
    assert!(router.parent(&addr(2)).is_some());
}

#[test]
fn root_advertises_and_repairs() {
    let (mut router, mut stats, now) = setup();
    router
        .set_root(INSTANCE_ID, dag_id(), &mut stats, now)
        .unwrap();
    let i = router.default_instance().unwrap();

    assert!(router.is_root(i));
    assert!(router.has_joined());
    assert_eq!(router.current_rank(i), 256);

    let sent = poll_until(&mut router, &mut stats, now, |cmd| {
        matches!(cmd, RplCommand::SendDio { dest: None, .. })
    })
    .expect("root DIO");
    let RplCommand::SendDio { dio: sent_dio, .. } = sent else {
        unreachable!();
    };
    assert_eq!(sent_dio.rank, 256);
    assert_eq!(sent_dio.ocp, OCP_DRIPLOF);

    assert!(router.repair_root(INSTANCE_ID, now));
    /* A DIO with rank below the root rank is never accepted. */
    router.process_dio(addr(9), &dio(100), &mut stats, now);
    assert!(router.parent(&addr(9)).is_none());
}

#[test]
fn freshness_fallback_prefers_fresh_parent_and_probes_best() {
    let (mut router, mut stats, _) = setup();
    let start = Instant::now();

    /* Parent A: better cost, but its statistics have gone stale. */
    settle(&mut stats, &addr(2), 1, start);
    /* Parent B: worse cost (two transmissions per packet), fresh. */
    let now = start + Duration::from_secs(11 * 60);
    for _ in 0..50 {
        stats.packet_sent(&addr(3), 1, TxStatus::Ok, 2, now);
    }

    router.process_dio(addr(2), &dio(256), &mut stats, now);
    let i = router.default_instance().unwrap();
    /* Joining adopted the sender directly. */
    assert_eq!(router.preferred_parent(i), Some(addr(2)));

    router.process_dio(addr(3), &dio(256), &mut stats, now);

    /* A stays the best by cost, but B is the best fresh parent; B is
       adopted and A becomes the urgent probing target. */
    assert_eq!(router.preferred_parent(i), Some(addr(3)));
    let probe = poll_until(&mut router, &mut stats, now, |cmd| {
        matches!(cmd, RplCommand::SendDis { dest: Some(d), .. } if *d == addr(2))
    })
    .expect("urgent probe towards the stale best parent");
    assert!(matches!(
        probe,
        RplCommand::SendDis {
            iface: ProbeIface::AllInterfaces,
            ..
        }
    ));
}

#[test]
fn multicast_dis_resets_trickle_and_unicast_dis_solicits_dio() {
    let (mut router, mut stats, now) = setup();
    settle(&mut stats, &addr(2), 1, now);
    router.process_dio(addr(2), &dio(256), &mut stats, now);
    let i = router.default_instance().unwrap();
    poll_until(&mut router, &mut stats, now, |_| false);
    assert!(router.dio_interval_current(i) > Some(12));

    router.process_dis(addr(7), &Dis::default(), false, now);
    assert_eq!(router.dio_interval_current(i), Some(12));

    router.process_dis(addr(7), &Dis::default(), true, now);
    let commands = router.take_commands();
    assert!(commands
        .iter()
        .any(|cmd| matches!(cmd, RplCommand::SendDio { dest: Some(d), .. } if *d == addr(7))));
}

#[test]
fn storing_mode_daos_install_and_withdraw_routes() {
    let (mut router, mut stats, now) = setup();
    router
        .set_root(INSTANCE_ID, dag_id(), &mut stats, now)
        .unwrap();

    let target = PrefixInfo {
        prefix: [0x55; 16],
        length: 128,
        flags: 0,
    };
    let dao = Dao {
        instance_id: INSTANCE_ID,
        target,
        lifetime: 30,
        path_sequence: 1,
        parent_addr: None,
    };
    router.process_dao(addr(4), &dao);
    let commands = router.take_commands();
    assert!(commands.iter().any(|cmd| matches!(
        cmd,
        RplCommand::AddRoute { via, lifetime_seconds: 1800, .. } if *via == addr(4)
    )));

    let no_path = Dao {
        lifetime: 0,
        ..dao.clone()
    };
    router.process_dao(addr(4), &no_path);
    let commands = router.take_commands();
    assert!(commands
        .iter()
        .any(|cmd| matches!(cmd, RplCommand::RemoveRoute { .. })));
}

#[test]
fn dtsn_bump_schedules_dao_refresh() {
    let (mut router, mut stats, now) = setup();
    settle(&mut stats, &addr(2), 1, now);
    router.process_dio(addr(2), &dio(256), &mut stats, now);
    router.take_commands();

    /* Drain the initial DAO. */
    poll_until(&mut router, &mut stats, now, |cmd| {
        matches!(cmd, RplCommand::SendDao { .. })
    })
    .expect("initial DAO");

    /* The parent signals a DTSN refresh. */
    let mut refresh = dio(256);
    refresh.dtsn = lollipop::increment(lollipop::INIT);
    let later = now + Duration::from_secs(60);
    router.process_dio(addr(2), &refresh, &mut stats, later);

    poll_until(&mut router, &mut stats, later, |cmd| {
        matches!(cmd, RplCommand::SendDao { dao: Dao { lifetime: 30, .. }, .. })
    })
    .expect("refreshed DAO");
}

#[test]
fn detached_node_solicits_with_dis() {
    let (mut router, mut stats, now) = setup();
    let dis = poll_until(&mut router, &mut stats, now, |cmd| {
        matches!(cmd, RplCommand::SendDis { dest: None, .. })
    });
    assert!(dis.is_some(), "a detached node eventually multicasts a DIS");
}
