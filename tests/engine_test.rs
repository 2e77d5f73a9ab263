use netbios_ns::{
    AdapterId, AdapterSpec, DaemonConfig, DaemonEvent, Error, NameEvent, NbAddrEntry, NbName,
    NsEngine, NsIncoming, NsOutgoing, NsRecord, Opcode, OperationState, Outgoing, QueryState,
    RData, RRType, Rcode, Reachability, Requester, BCAST_QUERY_RETRIES, BCAST_REG_TIMEOUT_SECS,
    CHALLENGE_RETRIES, CHALLENGE_TIMEOUT_SECS, FLAGS_RA, NBNS_PORT, NEG_CACHE_SECS,
    REACH_CHECK_SECS, REACH_POLL_INTERVAL, RELEASE_HOLD_SECS, UCAST_QUERY_TIMEOUT_SECS,
    UCAST_REG_RETRIES, UCAST_REG_TIMEOUT_SECS,
};
use std::net::{Ipv4Addr, SocketAddrV4};
use test_log::test;

const ETH0_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
const ETH1_IP: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 10);
const WINS_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
const PEER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 30);

/// Nothing off the local subnets answers.
struct Unreachable;

impl Reachability for Unreachable {
    fn start(&mut self, _addr: Ipv4Addr) {}

    fn poll(&mut self, _addr: Ipv4Addr) -> Option<bool> {
        Some(false)
    }

    fn finish(&mut self, _addr: Ipv4Addr) {}
}

fn eth0() -> AdapterSpec {
    AdapterSpec::new("eth0", ETH0_IP, Ipv4Addr::new(255, 255, 255, 0))
}

fn eth1() -> AdapterSpec {
    AdapterSpec::new("eth1", ETH1_IP, Ipv4Addr::new(255, 255, 0, 0))
}

/// An engine with `specs` loaded and the startup events drained.
fn engine_with(config: DaemonConfig, specs: Vec<AdapterSpec>) -> NsEngine {
    let mut engine = NsEngine::with_reachability(config, Box::new(Unreachable));
    engine.reload_adapters(specs).expect("adapters fit");
    engine.drain_events();
    engine
}

fn requester(origin: u32) -> (Requester, flume::Receiver<NameEvent>) {
    let (tx, rx) = flume::unbounded();
    (Requester::local(origin, tx), rx)
}

fn host_name() -> NbName {
    NbName::new("MYHOST", 0x20).unwrap()
}

fn peer() -> SocketAddrV4 {
    SocketAddrV4::new(PEER_IP, NBNS_PORT)
}

fn decode_all(outgoing: &[Outgoing]) -> Vec<NsIncoming> {
    outgoing.iter().map(|out| out.decode().unwrap()).collect()
}

/// Registers `name` on a B-node engine and waits out the broadcast timeout.
fn register_broadcast(engine: &mut NsEngine, name: NbName) {
    let (req, rx) = requester(1);
    engine.register(name, false, req);
    engine.tick(BCAST_REG_TIMEOUT_SECS);
    assert_eq!(rx.try_recv().unwrap(), NameEvent::Registered(name));
    engine.drain_outgoing();
    engine.drain_events();
}

fn first_adapter(engine: &NsEngine) -> AdapterId {
    engine.adapters().snapshot()[0]
}

fn wins() -> SocketAddrV4 {
    SocketAddrV4::new(WINS_IP, NBNS_PORT)
}

fn wins_config() -> DaemonConfig {
    DaemonConfig::builder().wins_server(WINS_IP).build()
}

/// The registration request queued for `adapter`.
fn request_on(sent: &[Outgoing], adapter: AdapterId) -> NsIncoming {
    sent.iter()
        .find(|out| out.adapter == adapter)
        .map(|out| out.decode().unwrap())
        .expect("a request on the adapter")
}

/// A WINS server answer to the registration request `id`. With `clean`
/// false the server says `holder` still owns the name.
fn wins_answer(id: u16, name: NbName, ttl: u32, clean: bool, holder: Ipv4Addr) -> Vec<u8> {
    let mut answer = NsOutgoing::response(id, Opcode::Registration, Rcode::NoError);
    if clean {
        answer.set_flags(answer.flags() | FLAGS_RA);
    }
    answer.add_answer(NsRecord::nb(name, ttl, NbAddrEntry::new(0, holder)));
    answer.to_data_on_wire()
}

/// Registers `name` with a WINS server that says PEER_IP owns it, and
/// returns the challenge query sent to PEER_IP.
fn register_contested(engine: &mut NsEngine, name: NbName, req: Requester) -> NsIncoming {
    let id = first_adapter(engine);
    engine.register(name, false, req);
    let request = request_on(&engine.drain_outgoing(), id);
    engine
        .handle_frame(wins_answer(request.id(), name, 300, false, PEER_IP), wins(), id)
        .unwrap();
    assert_eq!(
        engine.operation_state(&name, id),
        Some(OperationState::EndNodeChallenge)
    );

    let sent = engine.drain_outgoing();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].dest, peer());
    let challenge = sent[0].decode().unwrap();
    assert_eq!(challenge.opcode(), Some(Opcode::Query));
    assert!(!challenge.is_response());
    assert_eq!(challenge.subject(), Some(name));
    challenge
}

#[test]
fn b_node_registers_after_broadcast_timeout() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = host_name();

    let (req, rx) = requester(1);
    engine.register(name, false, req);

    let sent = engine.drain_outgoing();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].dest,
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 255), NBNS_PORT)
    );
    let msg = sent[0].decode().unwrap();
    assert_eq!(msg.opcode(), Some(Opcode::Registration));
    assert!(msg.is_broadcast());
    assert_eq!(msg.subject(), Some(name));
    assert_eq!(
        msg.first_record().unwrap().addr_entries(),
        &[NbAddrEntry::new(0, ETH0_IP)]
    );

    assert_eq!(
        engine.operation_state(&name, id),
        Some(OperationState::InRegistrationBroadcast)
    );
    assert!(rx.try_recv().is_err());

    engine.tick(BCAST_REG_TIMEOUT_SECS);
    assert_eq!(
        engine.operation_state(&name, id),
        Some(OperationState::RegisteredBroadcast)
    );
    assert_eq!(rx.try_recv().unwrap(), NameEvent::Registered(name));
    assert!(rx.try_recv().is_err());
    assert_eq!(
        engine.drain_events(),
        vec![DaemonEvent::Registered(name, ETH0_IP)]
    );
}

#[test]
fn register_again_answers_without_wire_traffic() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let name = host_name();
    register_broadcast(&mut engine, name);

    let (req, rx) = requester(2);
    engine.register(name, false, req);

    assert_eq!(rx.try_recv().unwrap(), NameEvent::Registered(name));
    assert!(engine.outgoing().is_empty());
    assert_eq!(engine.registration_count(&name), Some(2));
}

#[test]
fn register_as_group_conflicts_with_unique_registration() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let name = host_name();
    register_broadcast(&mut engine, name);

    let (req, rx) = requester(2);
    engine.register(name, true, req);

    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::RegisterFailed(name, Error::NameConflict)
    );
    assert_eq!(engine.registration_count(&name), Some(1));
}

#[test]
fn register_release_register_round_trip() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = host_name();
    register_broadcast(&mut engine, name);

    let (req, rx) = requester(1);
    engine.release(name, req, true);
    assert_eq!(rx.try_recv().unwrap(), NameEvent::Released(name));

    let sent = decode_all(&engine.drain_outgoing());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].opcode(), Some(Opcode::Release));
    assert_eq!(sent[0].first_record().unwrap().ttl, 0);
    assert_eq!(engine.registration_count(&name), Some(0));

    // The entry is freed at the next tick.
    engine.tick(0);
    assert_eq!(engine.internal_name_count(), 0);

    register_broadcast(&mut engine, name);
    assert_eq!(engine.registration_count(&name), Some(1));
    assert_eq!(engine.operation_adapters(&name), vec![id]);
    assert_eq!(engine.pending_total(&name), Some(0));
    assert_eq!(engine.internal_name_count(), 1);
}

#[test]
fn release_unknown_name_fails() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let name = host_name();

    let (req, rx) = requester(1);
    engine.release(name, req, true);

    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::ReleaseFailed(name, Error::NotRegistered)
    );
    assert!(engine.outgoing().is_empty());
}

#[test]
fn release_keeping_the_port() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let name = host_name();

    assert_eq!(engine.set_port(name, 445), Err(Error::NotRegistered));

    register_broadcast(&mut engine, name);
    engine.set_port(name, 445).unwrap();
    assert_eq!(engine.port(&name), Some(445));

    let (req, rx) = requester(1);
    engine.release(name, req, false);
    assert_eq!(rx.try_recv().unwrap(), NameEvent::Released(name));

    engine.tick(0);
    assert_eq!(engine.internal_name_count(), 1);
    assert_eq!(engine.port(&name), Some(445));
}

#[test]
fn register_without_adapters_fails() {
    let mut engine = NsEngine::new(DaemonConfig::default());
    let name = host_name();

    let (req, rx) = requester(1);
    engine.register(name, false, req);

    assert!(matches!(
        rx.try_recv().unwrap(),
        NameEvent::RegisterFailed(_, Error::Msg(_))
    ));
    assert!(engine.outgoing().is_empty());
}

#[test]
fn local_only_names_stay_off_the_wire() {
    let config = DaemonConfig::builder().local_only_suffix(0x03).build();
    let mut engine = engine_with(config, vec![eth0()]);
    let name = NbName::new("MYHOST", 0x03).unwrap();

    let (req, rx) = requester(1);
    engine.register(name, false, req);
    assert_eq!(rx.try_recv().unwrap(), NameEvent::Registered(name));
    assert!(engine.outgoing().is_empty());

    // Resolvable locally.
    let (req, rx) = requester(2);
    engine.resolve(name, req);
    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::Resolved(name, vec![ETH0_IP])
    );

    // Never answered to the network.
    let id = first_adapter(&engine);
    let mut query = NsOutgoing::request(0x4242, Opcode::Query, true);
    query.add_question(name, RRType::NB);
    engine
        .handle_frame(query.to_data_on_wire(), peer(), id)
        .unwrap();
    assert!(engine.outgoing().is_empty());
}

/// Two H-node adapters: one exhausts its retries while the other waits on a
/// WACK, then the positive answer registers both at once.
#[test]
fn wins_acknowledgement_collapses_all_adapters() {
    let config = DaemonConfig::builder().wins_server(WINS_IP).build();
    let mut engine = engine_with(config, vec![eth0(), eth1()]);
    let ids = engine.adapters().snapshot();
    let (slow, fast) = (ids[0], ids[1]);
    let name = host_name();

    let (req, rx) = requester(1);
    engine.register(name, false, req);

    let sent = engine.drain_outgoing();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|out| *out.dest.ip() == WINS_IP));
    let slow_req = sent
        .iter()
        .find(|out| out.adapter == slow)
        .map(|out| out.decode().unwrap())
        .unwrap();
    assert_eq!(slow_req.opcode(), Some(Opcode::MultiHomedRegistration));
    assert!(!slow_req.is_broadcast());
    assert_eq!(engine.pending_total(&name), Some(2));

    let wins = SocketAddrV4::new(WINS_IP, NBNS_PORT);

    // The server needs time for the request on `slow`.
    let mut wack = NsOutgoing::response(slow_req.id(), Opcode::Wack, Rcode::NoError);
    wack.add_answer(NsRecord::nb(name, 60, NbAddrEntry::new(0, ETH0_IP)));
    engine
        .handle_frame(wack.to_data_on_wire(), wins, slow)
        .unwrap();

    // `fast` resends until its retries are exhausted.
    for _ in 0..UCAST_REG_RETRIES {
        engine.tick(UCAST_REG_TIMEOUT_SECS);
        let resent = engine.drain_outgoing();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].adapter, fast);
    }
    engine.tick(UCAST_REG_TIMEOUT_SECS);
    assert_eq!(
        engine.operation_state(&name, fast),
        Some(OperationState::PendingBroadcastFallback)
    );
    assert_eq!(
        engine.operation_state(&name, slow),
        Some(OperationState::InRegistrationUnicast)
    );
    assert_eq!(engine.pending_total(&name), Some(1));
    assert!(engine.drain_outgoing().is_empty());
    assert!(rx.try_recv().is_err());

    let mut ack = NsOutgoing::response(slow_req.id(), Opcode::Registration, Rcode::NoError);
    ack.set_flags(ack.flags() | FLAGS_RA);
    ack.add_answer(NsRecord::nb(name, 3600, NbAddrEntry::new(0, ETH0_IP)));
    engine
        .handle_frame(ack.to_data_on_wire(), wins, slow)
        .unwrap();

    assert_eq!(
        engine.operation_state(&name, slow),
        Some(OperationState::RegisteredUnicast)
    );
    assert_eq!(
        engine.operation_state(&name, fast),
        Some(OperationState::RegisteredUnicast)
    );
    assert_eq!(engine.pending_total(&name), Some(0));
    assert_eq!(rx.try_recv().unwrap(), NameEvent::Registered(name));
    assert!(rx.try_recv().is_err());
    assert!(engine.outgoing().is_empty());
}

#[test]
fn wins_rejection_fails_registration() {
    let config = DaemonConfig::builder().wins_server(WINS_IP).build();
    let mut engine = engine_with(config, vec![eth0()]);
    let id = first_adapter(&engine);
    let name = host_name();

    let (req, rx) = requester(1);
    engine.register(name, false, req);
    let sent = decode_all(&engine.drain_outgoing());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].opcode(), Some(Opcode::Registration));

    let mut nak = NsOutgoing::response(sent[0].id(), Opcode::Registration, Rcode::Active);
    nak.set_flags(nak.flags() | FLAGS_RA);
    nak.add_answer(NsRecord::nb(name, 0, NbAddrEntry::new(0, ETH0_IP)));
    engine
        .handle_frame(nak.to_data_on_wire(), SocketAddrV4::new(WINS_IP, NBNS_PORT), id)
        .unwrap();

    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::RegisterFailed(name, Error::NameConflict)
    );
    assert_eq!(engine.registration_count(&name), Some(0));
    assert_eq!(
        engine.drain_events(),
        vec![DaemonEvent::NameConflict(name, ETH0_IP)]
    );
}

#[test]
fn negative_cache_holds_then_expires() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let name = NbName::new("NOBODY", 0x20).unwrap();

    let (req, rx) = requester(1);
    engine.resolve(name, req);
    assert_eq!(engine.drain_outgoing().len(), 1);
    assert_eq!(engine.query_state(&name), Some(QueryState::InQuery));

    for _ in 0..BCAST_QUERY_RETRIES {
        engine.tick(1);
        let resent = decode_all(&engine.drain_outgoing());
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].subject(), Some(name));
    }
    engine.tick(1);
    assert_eq!(engine.query_state(&name), Some(QueryState::NotKnown));
    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::ResolveFailed(name, Error::Timeout)
    );

    // Answered from the negative cache.
    let (req, rx) = requester(2);
    engine.resolve(name, req);
    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::ResolveFailed(name, Error::NameNotFound)
    );
    assert!(engine.outgoing().is_empty());

    engine.tick(NEG_CACHE_SECS);
    assert_eq!(engine.query_state(&name), None);

    let (req, _rx) = requester(3);
    engine.resolve(name, req);
    assert_eq!(engine.drain_outgoing().len(), 1);
}

#[test]
fn concurrent_resolvers_share_one_query() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = NbName::new("FILESERVER", 0x20).unwrap();

    let receivers: Vec<_> = (1..=3)
        .map(|origin| {
            let (req, rx) = requester(origin);
            engine.resolve(name, req);
            rx
        })
        .collect();

    let sent = decode_all(&engine.drain_outgoing());
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is_broadcast());

    let server = Ipv4Addr::new(192, 168, 1, 20);
    let mut answer = NsOutgoing::response(sent[0].id(), Opcode::Query, Rcode::NoError);
    answer.add_answer(NsRecord::nb(name, 300, NbAddrEntry::new(0, server)));
    engine
        .handle_frame(
            answer.to_data_on_wire(),
            SocketAddrV4::new(server, NBNS_PORT),
            id,
        )
        .unwrap();

    for rx in receivers.iter() {
        assert_eq!(
            rx.try_recv().unwrap(),
            NameEvent::Resolved(name, vec![server])
        );
        assert!(rx.try_recv().is_err());
    }
    assert_eq!(engine.query_state(&name), Some(QueryState::Known(server)));

    // Cached now.
    let (req, rx) = requester(4);
    engine.resolve(name, req);
    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::Resolved(name, vec![server])
    );
    assert!(engine.outgoing().is_empty());

    // Until the owner releases it.
    let mut release = NsOutgoing::request(0x0101, Opcode::Release, true);
    release.add_question(name, RRType::NB);
    release.add_additional(NsRecord::nb(name, 0, NbAddrEntry::new(0, server)));
    engine
        .handle_frame(
            release.to_data_on_wire(),
            SocketAddrV4::new(server, NBNS_PORT),
            id,
        )
        .unwrap();
    assert_eq!(engine.query_state(&name), None);
}

#[test]
fn defend_owned_name_against_foreign_registration() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = host_name();
    register_broadcast(&mut engine, name);

    let mut claim = NsOutgoing::request(0x7777, Opcode::Registration, true);
    claim.add_question(name, RRType::NB);
    claim.add_additional(NsRecord::nb(name, 300, NbAddrEntry::new(0, PEER_IP)));
    engine
        .handle_frame(claim.to_data_on_wire(), peer(), id)
        .unwrap();

    let sent = engine.drain_outgoing();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].dest, peer());
    let msg = sent[0].decode().unwrap();
    assert!(msg.is_response());
    assert_eq!(msg.id(), 0x7777);
    assert_eq!(msg.rcode(), Rcode::Conflict as u16);
    assert_eq!(
        msg.answers()[0].addr_entries(),
        &[NbAddrEntry::new(0, ETH0_IP)]
    );

    assert_eq!(
        engine.operation_state(&name, id),
        Some(OperationState::RegisteredBroadcast)
    );
    assert_eq!(engine.registration_count(&name), Some(1));
}

#[test]
fn answer_queries_from_the_network() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = host_name();
    register_broadcast(&mut engine, name);

    // Owned name.
    let mut query = NsOutgoing::request(0x1001, Opcode::Query, true);
    query.add_question(name, RRType::NB);
    engine
        .handle_frame(query.to_data_on_wire(), peer(), id)
        .unwrap();
    let sent = decode_all(&engine.drain_outgoing());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].id(), 0x1001);
    assert_eq!(sent[0].rcode(), Rcode::NoError as u16);
    assert_eq!(
        sent[0].answers()[0].addr_entries(),
        &[NbAddrEntry::new(0, ETH0_IP)]
    );

    // Foreign name, broadcast: silence.
    let other = NbName::new("SOMEONE", 0x20).unwrap();
    let mut query = NsOutgoing::request(0x1002, Opcode::Query, true);
    query.add_question(other, RRType::NB);
    engine
        .handle_frame(query.to_data_on_wire(), peer(), id)
        .unwrap();
    assert!(engine.outgoing().is_empty());

    // Foreign name, unicast: negative answer.
    let mut query = NsOutgoing::request(0x1003, Opcode::Query, false);
    query.add_question(other, RRType::NB);
    engine
        .handle_frame(query.to_data_on_wire(), peer(), id)
        .unwrap();
    let sent = decode_all(&engine.drain_outgoing());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].rcode(), Rcode::NameError as u16);

    // Node status lists the owned name.
    let mut query = NsOutgoing::request(0x1004, Opcode::Query, false);
    query.add_question(NbName::wildcard(), RRType::NBSTAT);
    engine
        .handle_frame(query.to_data_on_wire(), peer(), id)
        .unwrap();
    let sent = decode_all(&engine.drain_outgoing());
    assert_eq!(sent.len(), 1);
    match &sent[0].answers()[0].rdata {
        RData::NbStat { names, .. } => {
            assert_eq!(names.len(), 1);
            assert_eq!(names[0].name, name);
            assert!(names[0].is_active());
        }
        other => panic!("unexpected rdata {:?}", other),
    }
}

#[test]
fn ignore_our_own_broadcasts() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = host_name();

    let (req, _rx) = requester(1);
    engine.register(name, false, req);
    let sent = engine.drain_outgoing();

    engine
        .handle_frame(
            sent[0].packet.clone(),
            SocketAddrV4::new(ETH0_IP, NBNS_PORT),
            id,
        )
        .unwrap();
    assert!(engine.outgoing().is_empty());
    assert_eq!(
        engine.operation_state(&name, id),
        Some(OperationState::InRegistrationBroadcast)
    );
}

#[test]
fn malformed_frame_is_reported() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let id = first_adapter(&engine);

    let result = engine.handle_frame(vec![0x12, 0x34, 0x00], peer(), id);
    assert!(matches!(result, Err(Error::MalformedFrame(_))));
}

#[test]
fn removed_adapter_drops_its_operations() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0(), eth1()]);
    let ids = engine.adapters().snapshot();
    let name = host_name();
    register_broadcast(&mut engine, name);
    assert_eq!(engine.operation_adapters(&name), ids);

    let outcome = engine.reload_adapters(vec![eth0()]).unwrap();
    assert_eq!(outcome.kept, vec![ids[0]]);
    assert_eq!(outcome.removed.len(), 1);
    assert_eq!(outcome.removed[0].ip, ETH1_IP);

    assert_eq!(engine.adapters().snapshot(), vec![ids[0]]);
    assert_eq!(engine.operation_adapters(&name), vec![ids[0]]);
    assert_eq!(engine.drain_events(), vec![DaemonEvent::IpDel(ETH1_IP)]);
    assert_eq!(engine.registration_count(&name), Some(1));

    // A new adapter registers the owned names.
    engine.reload_adapters(vec![eth0(), eth1()]).unwrap();
    let added = engine.adapters().snapshot();
    assert_eq!(added.len(), 2);
    let sent = engine.drain_outgoing();
    assert_eq!(sent.len(), 1);
    assert_eq!(*sent[0].dest.ip(), Ipv4Addr::new(10, 1, 255, 255));
    engine.tick(BCAST_REG_TIMEOUT_SECS);
    for id in added {
        assert_eq!(
            engine.operation_state(&name, id),
            Some(OperationState::RegisteredBroadcast)
        );
    }
}

#[test]
fn shutdown_releases_everything() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let name = host_name();
    register_broadcast(&mut engine, name);

    let pending = NbName::new("LATECOMER", 0x00).unwrap();
    let (req, rx) = requester(2);
    engine.register(pending, false, req);
    engine.drain_outgoing();

    engine.release_all();
    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::RegisterFailed(pending, Error::NameBeingReleased)
    );
    let sent = decode_all(&engine.drain_outgoing());
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|msg| msg.opcode() == Some(Opcode::Release)));

    engine.tick(0);
    assert_eq!(engine.internal_name_count(), 0);
}

#[test]
fn release_by_same_caller_cancels_one_registration() {
    let mut engine = engine_with(wins_config(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = host_name();

    let (req, rx1) = requester(7);
    engine.register(name, false, req);
    let (req, rx2) = requester(7);
    engine.register(name, false, req);
    assert_eq!(engine.registration_count(&name), Some(2));
    let request = request_on(&engine.drain_outgoing(), id);

    let (req, rx) = requester(7);
    engine.release(name, req, true);
    assert_eq!(rx.try_recv().unwrap(), NameEvent::Released(name));
    assert_eq!(engine.registration_count(&name), Some(1));
    assert!(engine.outgoing().is_empty());

    engine
        .handle_frame(wins_answer(request.id(), name, 3600, true, ETH0_IP), wins(), id)
        .unwrap();
    for _ in 0..10 {
        engine.tick(1);
    }

    // The released registration is cancelled, the other one succeeds.
    assert!(rx1.try_recv().is_err());
    assert_eq!(rx2.try_recv().unwrap(), NameEvent::Registered(name));
    assert_eq!(engine.registration_count(&name), Some(1));
    assert_eq!(
        engine.operation_state(&name, id),
        Some(OperationState::RegisteredUnicast)
    );
}

#[test]
fn adapter_swap_keeps_registration_going() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let name = host_name();

    let (req, rx) = requester(1);
    engine.register(name, false, req);
    engine.drain_outgoing();

    let outcome = engine.reload_adapters(vec![eth1()]).unwrap();
    assert_eq!(outcome.removed.len(), 1);
    assert_eq!(outcome.added.len(), 1);
    let new_id = outcome.added[0];

    assert!(rx.try_recv().is_err());
    assert_eq!(engine.registration_count(&name), Some(1));
    assert_eq!(engine.operation_adapters(&name), vec![new_id]);
    let sent = engine.drain_outgoing();
    assert_eq!(sent.len(), 1);
    assert_eq!(*sent[0].dest.ip(), Ipv4Addr::new(10, 1, 255, 255));
    assert_eq!(sent[0].decode().unwrap().opcode(), Some(Opcode::Registration));

    engine.tick(BCAST_REG_TIMEOUT_SECS);
    assert_eq!(rx.try_recv().unwrap(), NameEvent::Registered(name));
    assert_eq!(
        engine.operation_state(&name, new_id),
        Some(OperationState::RegisteredBroadcast)
    );
    assert_eq!(engine.registration_count(&name), Some(1));
}

#[test]
fn removed_adapter_drops_its_pending_frames() {
    let mut engine = engine_with(wins_config(), vec![eth0(), eth1()]);
    let ids = engine.adapters().snapshot();
    let name = host_name();

    let (req, rx) = requester(1);
    engine.register(name, false, req);
    let sent = engine.drain_outgoing();
    assert_eq!(engine.pending_total(&name), Some(2));

    engine.reload_adapters(vec![eth0()]).unwrap();
    assert_eq!(engine.adapters().snapshot(), vec![ids[0]]);
    assert_eq!(engine.operation_adapters(&name), vec![ids[0]]);
    assert_eq!(engine.pending_total(&name), Some(1));
    assert_eq!(
        engine.operation_state(&name, ids[0]),
        Some(OperationState::InRegistrationUnicast)
    );
    assert!(rx.try_recv().is_err());

    let request = request_on(&sent, ids[0]);
    engine
        .handle_frame(wins_answer(request.id(), name, 3600, true, ETH0_IP), wins(), ids[0])
        .unwrap();
    assert_eq!(engine.pending_total(&name), Some(0));
    assert_eq!(rx.try_recv().unwrap(), NameEvent::Registered(name));
}

#[test]
fn owner_defends_challenged_name() {
    let mut engine = engine_with(wins_config(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = host_name();

    let (req, rx) = requester(1);
    let challenge = register_contested(&mut engine, name, req);
    engine.drain_events();

    let mut defence = NsOutgoing::response(challenge.id(), Opcode::Query, Rcode::NoError);
    defence.add_answer(NsRecord::nb(name, 300, NbAddrEntry::new(0, PEER_IP)));
    engine
        .handle_frame(defence.to_data_on_wire(), peer(), id)
        .unwrap();

    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::RegisterFailed(name, Error::NameConflict)
    );
    assert_eq!(
        engine.operation_state(&name, id),
        Some(OperationState::InReleaseUnicast)
    );
    assert_eq!(engine.registration_count(&name), Some(0));
    assert_eq!(
        engine.drain_events(),
        vec![DaemonEvent::NameConflict(name, ETH0_IP)]
    );

    engine.tick(RELEASE_HOLD_SECS);
    assert_eq!(engine.internal_name_count(), 0);
}

#[test]
fn silent_owner_loses_name_to_claim() {
    let mut engine = engine_with(wins_config(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = host_name();

    let (req, rx) = requester(1);
    let challenge = register_contested(&mut engine, name, req);

    // The challenge is asked again, always to the owner.
    for _ in 0..CHALLENGE_RETRIES {
        engine.tick(CHALLENGE_TIMEOUT_SECS);
        let sent = engine.drain_outgoing();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dest, peer());
        assert_eq!(sent[0].decode().unwrap().subject(), challenge.subject());
    }
    engine.tick(CHALLENGE_TIMEOUT_SECS);
    assert_eq!(
        engine.operation_state(&name, id),
        Some(OperationState::Claim)
    );
    assert_eq!(engine.pending_total(&name), Some(1));

    let claim = request_on(&engine.drain_outgoing(), id);
    assert_eq!(claim.opcode(), Some(Opcode::Registration));
    assert!(rx.try_recv().is_err());

    engine.drain_events();
    engine
        .handle_frame(wins_answer(claim.id(), name, 3600, true, ETH0_IP), wins(), id)
        .unwrap();
    assert_eq!(
        engine.operation_state(&name, id),
        Some(OperationState::RegisteredUnicast)
    );
    assert_eq!(rx.try_recv().unwrap(), NameEvent::Registered(name));
    assert_eq!(
        engine.drain_events(),
        vec![DaemonEvent::Registered(name, ETH0_IP)]
    );
}

#[test]
fn negative_challenge_answer_starts_claim() {
    let mut engine = engine_with(wins_config(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = host_name();

    let (req, rx) = requester(1);
    let challenge = register_contested(&mut engine, name, req);

    let denial = NsOutgoing::response(challenge.id(), Opcode::Query, Rcode::NameError);
    engine
        .handle_frame(denial.to_data_on_wire(), peer(), id)
        .unwrap();

    assert_eq!(
        engine.operation_state(&name, id),
        Some(OperationState::Claim)
    );
    let sent = engine.drain_outgoing();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].dest, wins());
    assert!(rx.try_recv().is_err());
}

/// Two adapters: the owner stays silent on the first one until its claim
/// runs out, while the second one gave up on WINS.
#[test]
fn unanswered_claim_gives_the_name_up() {
    let mut engine = engine_with(wins_config(), vec![eth0(), eth1()]);
    let ids = engine.adapters().snapshot();
    let name = host_name();

    let (req, rx) = requester(1);
    engine.register(name, false, req);
    let request = request_on(&engine.drain_outgoing(), ids[0]);
    engine
        .handle_frame(wins_answer(request.id(), name, 300, false, PEER_IP), wins(), ids[0])
        .unwrap();
    assert_eq!(
        engine.operation_state(&name, ids[0]),
        Some(OperationState::EndNodeChallenge)
    );

    let mut sent = Vec::new();
    let mut claimed = false;
    for _ in 0..30 {
        engine.tick(1);
        sent.extend(decode_all(&engine.drain_outgoing()));
        claimed |= engine.operation_state(&name, ids[0]) == Some(OperationState::Claim);
    }
    assert!(claimed);

    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::RegisterFailed(name, Error::Timeout)
    );
    assert!(rx.try_recv().is_err());
    assert!(!sent
        .iter()
        .any(|msg| msg.is_broadcast() && msg.opcode() == Some(Opcode::Registration)));
    assert_eq!(engine.internal_name_count(), 0);
    assert_eq!(engine.registration_count(&name), None);

    let (req, rx) = requester(1);
    engine.release(name, req, true);
    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::ReleaseFailed(name, Error::NotRegistered)
    );

    let mut query = NsOutgoing::request(0x2001, Opcode::Query, true);
    query.add_question(name, RRType::NB);
    engine
        .handle_frame(query.to_data_on_wire(), peer(), ids[0])
        .unwrap();
    assert!(engine.outgoing().is_empty());
}

#[test]
fn refresh_at_half_ttl_and_lose_name_on_rejection() {
    let mut engine = engine_with(wins_config(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = host_name();

    let (req, rx) = requester(1);
    engine.register(name, false, req);
    let request = request_on(&engine.drain_outgoing(), id);
    engine
        .handle_frame(wins_answer(request.id(), name, 200, true, ETH0_IP), wins(), id)
        .unwrap();
    assert_eq!(rx.try_recv().unwrap(), NameEvent::Registered(name));
    engine.drain_events();

    engine.tick(99);
    assert!(engine.outgoing().is_empty());
    engine.tick(1);
    let sent = engine.drain_outgoing();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].dest, wins());
    assert_eq!(sent[0].kind(), "refresh");
    let refresh = sent[0].decode().unwrap();
    assert_eq!(refresh.opcode(), Some(Opcode::Refresh));
    assert_eq!(refresh.first_record().unwrap().ttl, DaemonConfig::default().default_ttl);
    assert_eq!(
        engine.operation_state(&name, id),
        Some(OperationState::RegisteredUnicast)
    );

    let mut nak = NsOutgoing::response(refresh.id(), Opcode::Refresh, Rcode::Active);
    nak.set_flags(nak.flags() | FLAGS_RA);
    nak.add_answer(NsRecord::nb(name, 0, NbAddrEntry::new(0, PEER_IP)));
    engine
        .handle_frame(nak.to_data_on_wire(), wins(), id)
        .unwrap();

    assert_eq!(
        engine.operation_state(&name, id),
        Some(OperationState::InReleaseUnicast)
    );
    assert_eq!(
        engine.drain_events(),
        vec![DaemonEvent::NameConflict(name, ETH0_IP)]
    );
}

/// Two adapters: WINS never answers the first one, and keeps the second
/// one waiting with a WACK before going silent too.
#[test]
fn silent_wins_falls_back_to_broadcast() {
    let mut engine = engine_with(wins_config(), vec![eth0(), eth1()]);
    let ids = engine.adapters().snapshot();
    let (first, waiting) = (ids[0], ids[1]);
    let name = host_name();

    let (req, rx) = requester(1);
    engine.register(name, false, req);
    let request = request_on(&engine.drain_outgoing(), waiting);

    let mut wack = NsOutgoing::response(request.id(), Opcode::Wack, Rcode::NoError);
    wack.add_answer(NsRecord::nb(name, 10, NbAddrEntry::new(0, ETH1_IP)));
    engine
        .handle_frame(wack.to_data_on_wire(), wins(), waiting)
        .unwrap();

    for _ in 0..=UCAST_REG_RETRIES {
        engine.tick(UCAST_REG_TIMEOUT_SECS);
    }
    assert_eq!(
        engine.operation_state(&name, first),
        Some(OperationState::PendingBroadcastFallback)
    );
    assert_eq!(
        engine.operation_state(&name, waiting),
        Some(OperationState::InRegistrationUnicast)
    );
    engine.drain_outgoing();

    let mut broadcasts = Vec::new();
    for _ in 0..20 {
        engine.tick(1);
        broadcasts = decode_all(&engine.drain_outgoing());
        if engine.operation_state(&name, first) != Some(OperationState::PendingBroadcastFallback) {
            break;
        }
    }
    assert_eq!(broadcasts.len(), 2);
    assert!(broadcasts
        .iter()
        .all(|msg| msg.is_broadcast() && msg.opcode() == Some(Opcode::Registration)));
    for id in [first, waiting] {
        assert_eq!(
            engine.operation_state(&name, id),
            Some(OperationState::InRegistrationBroadcast)
        );
    }
    assert!(rx.try_recv().is_err());

    engine.tick(BCAST_REG_TIMEOUT_SECS);
    for id in [first, waiting] {
        assert_eq!(
            engine.operation_state(&name, id),
            Some(OperationState::RegisteredBroadcast)
        );
    }
    assert_eq!(rx.try_recv().unwrap(), NameEvent::Registered(name));
}

#[test]
fn full_tables_refuse_new_names() {
    let config = DaemonConfig::builder()
        .max_internal_names(1)
        .max_external_names(1)
        .build();
    let mut engine = engine_with(config, vec![eth0()]);

    register_broadcast(&mut engine, host_name());
    let other = NbName::new("OTHERNAME", 0x20).unwrap();
    let (req, rx) = requester(2);
    engine.register(other, false, req);
    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::RegisterFailed(other, Error::TableFull)
    );
    assert!(engine.outgoing().is_empty());
    assert_eq!(engine.internal_name_count(), 1);

    let (req, _rx) = requester(3);
    engine.resolve(NbName::new("SERVER1", 0x20).unwrap(), req);
    assert_eq!(engine.drain_outgoing().len(), 1);

    let server2 = NbName::new("SERVER2", 0x20).unwrap();
    let (req, rx) = requester(4);
    engine.resolve(server2, req);
    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::ResolveFailed(server2, Error::TableFull)
    );
    assert!(engine.outgoing().is_empty());
    assert_eq!(engine.query_state(&server2), None);
}

#[test]
fn negative_query_response_is_cached() {
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = NbName::new("NOBODY", 0x20).unwrap();

    let (req, rx) = requester(1);
    engine.resolve(name, req);
    let query = engine.drain_outgoing()[0].decode().unwrap();

    let mut denial = NsOutgoing::response(query.id(), Opcode::Query, Rcode::NameError);
    denial.add_question(name, RRType::NB);
    engine
        .handle_frame(denial.to_data_on_wire(), peer(), id)
        .unwrap();

    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::ResolveFailed(name, Error::NameNotFound)
    );
    assert_eq!(engine.query_state(&name), Some(QueryState::NotKnown));
    assert!(engine.outgoing().is_empty());
}

#[test]
fn wack_only_delays_a_query() {
    let mut engine = engine_with(wins_config(), vec![eth0()]);
    let id = first_adapter(&engine);
    let name = NbName::new("FILESERVER", 0x20).unwrap();

    let (req, rx) = requester(1);
    engine.resolve(name, req);
    let sent = engine.drain_outgoing();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].dest, wins());
    let query = sent[0].decode().unwrap();

    let mut wack = NsOutgoing::response(query.id(), Opcode::Wack, Rcode::NoError);
    wack.add_answer(NsRecord::nb(name, 10, NbAddrEntry::new(0, WINS_IP)));
    engine
        .handle_frame(wack.to_data_on_wire(), wins(), id)
        .unwrap();
    assert_eq!(engine.query_state(&name), Some(QueryState::InQuery));

    // No resend while the server asked us to wait.
    engine.tick(UCAST_QUERY_TIMEOUT_SECS);
    engine.tick(9 - UCAST_QUERY_TIMEOUT_SECS);
    assert!(engine.outgoing().is_empty());
    assert!(rx.try_recv().is_err());

    engine.tick(1);
    let resent = decode_all(&engine.drain_outgoing());
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].id(), query.id());
    assert_eq!(engine.query_state(&name), Some(QueryState::InQuery));
}

#[test]
fn node_status_reports_adapter_mac() {
    let mac = [0x00, 0x15, 0x5d, 0x01, 0x02, 0x03];
    let mut engine = engine_with(DaemonConfig::default(), vec![eth0().with_mac(mac)]);
    let id = first_adapter(&engine);
    register_broadcast(&mut engine, host_name());

    let mut query = NsOutgoing::request(0x3001, Opcode::Query, false);
    query.add_question(NbName::wildcard(), RRType::NBSTAT);
    engine
        .handle_frame(query.to_data_on_wire(), peer(), id)
        .unwrap();

    let sent = decode_all(&engine.drain_outgoing());
    assert_eq!(sent.len(), 1);
    match &sent[0].answers()[0].rdata {
        RData::NbStat { names, mac: unit_id } => {
            assert_eq!(names.len(), 1);
            assert_eq!(*unit_id, mac);
        }
        other => panic!("unexpected rdata {:?}", other),
    }
}

/// Connects that never finish.
struct Hanging;

impl Reachability for Hanging {
    fn start(&mut self, _addr: Ipv4Addr) {}

    fn poll(&mut self, _addr: Ipv4Addr) -> Option<bool> {
        None
    }

    fn finish(&mut self, _addr: Ipv4Addr) {}
}

#[test]
fn reachability_checks_never_hold_the_engine() {
    let mut engine = NsEngine::with_reachability(DaemonConfig::default(), Box::new(Hanging));
    engine.reload_adapters(vec![eth0()]).unwrap();
    let id = first_adapter(&engine);
    let name = NbName::new("FARSERVER", 0x20).unwrap();
    let far = [Ipv4Addr::new(10, 9, 0, 1), Ipv4Addr::new(10, 9, 0, 2)];

    let (req, rx) = requester(1);
    engine.resolve(name, req);
    let query = engine.drain_outgoing()[0].decode().unwrap();

    let mut answer = NsOutgoing::response(query.id(), Opcode::Query, Rcode::NoError);
    answer.add_answer(NsRecord {
        name,
        ttl: 300,
        rdata: RData::Nb(far.iter().map(|ip| NbAddrEntry::new(0, *ip)).collect()),
    });
    engine
        .handle_frame(answer.to_data_on_wire(), peer(), id)
        .unwrap();
    assert_eq!(engine.query_state(&name), Some(QueryState::Checking));

    // Polled often while the checks run.
    assert!(engine.tick(0) <= REACH_POLL_INTERVAL);
    assert_eq!(engine.query_state(&name), Some(QueryState::Checking));
    assert!(rx.try_recv().is_err());

    engine.tick(REACH_CHECK_SECS);
    assert_eq!(engine.query_state(&name), Some(QueryState::Known(far[0])));
    assert_eq!(
        rx.try_recv().unwrap(),
        NameEvent::Resolved(name, vec![far[0]])
    );
}
