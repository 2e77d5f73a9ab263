//! The name service engine.
//!
//! [NsEngine] owns every table of the name service: the adapters, the names
//! owned by this host, and the names being resolved. It does no I/O: frames
//! come in through [NsEngine::handle_frame], time comes in through
//! [NsEngine::tick], and everything to be sent is queued as [Outgoing]
//! datagrams for the caller to put on the wire. The daemon thread is the
//! only caller in production; tests drive it directly.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    adapter::{AdapterId, AdapterRegistry, AdapterSpec, ReloadOutcome},
    config::{DaemonConfig, IDLE_WAKE, REACH_POLL_INTERVAL},
    external_name::{ExternalNames, QueryState, Reachability, TcpProbe},
    internal_name::{InternalNames, OperationState},
    name_daemon::DaemonEvent,
    nbns_parser::{
        NbName, NodeStatusEntry, NsIncoming, NsOutgoing, NsRecord, Opcode, RData, RRType,
        Rcode,
    },
    Error, Result,
};
use flume::{Sender, TrySendError};
use std::{
    cmp, fmt,
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

/// Results sent back to a local caller of the name service.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum NameEvent {
    /// The name is registered on at least one adapter.
    Registered(NbName),

    RegisterFailed(NbName, Error),

    Released(NbName),

    ReleaseFailed(NbName, Error),

    /// The name resolved to these addresses.
    Resolved(NbName, Vec<Ipv4Addr>),

    ResolveFailed(NbName, Error),

    /// The name table of the host at this address.
    NodeStatus(Ipv4Addr, Vec<NodeStatusEntry>),

    NodeStatusFailed(Ipv4Addr, Error),
}

/// Who is waiting for the outcome of a name operation.
#[derive(Clone, Debug)]
pub enum Requester {
    /// A caller on this host. `origin` identifies the caller: requests from
    /// the same origin are merged, and a release cancels the pending
    /// requests of its own origin.
    Local {
        origin: u32,
        sender: Sender<NameEvent>,
    },

    /// A host that sent us a query, answered on the wire.
    Remote {
        addr: SocketAddrV4,
        tran_id: u16,
        adapter: AdapterId,
    },
}

impl Requester {
    pub fn local(origin: u32, sender: Sender<NameEvent>) -> Self {
        Self::Local { origin, sender }
    }

    /// Returns true if both come from the same caller.
    pub fn same_origin(&self, other: &Requester) -> bool {
        match (self, other) {
            (Self::Local { origin: a, .. }, Self::Local { origin: b, .. }) => a == b,
            (Self::Remote { addr: a, .. }, Self::Remote { addr: b, .. }) => a == b,
            _ => false,
        }
    }

    pub const fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }

    /// Sends `event` to a local caller. Remote requesters are answered with
    /// frames by the engines, so this is a no-op for them.
    pub(crate) fn answer(&self, event: NameEvent) {
        if let Self::Local { sender, .. } = self {
            match sender.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Disconnected(e)) => {
                    trace!("requester gone, dropped {:?}", e);
                }
                Err(e) => debug!("failed to answer requester: {}", e),
            }
        }
    }
}

/// An inclusive range of transaction ids issued for one batch of requests.
///
/// Ids wrap around, so `first` may be bigger than `last`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranRange {
    pub first: u16,
    pub last: u16,
}

impl TranRange {
    pub const fn single(id: u16) -> Self {
        Self {
            first: id,
            last: id,
        }
    }

    /// Returns true if `id` belongs to this batch.
    pub const fn contains(&self, id: u16) -> bool {
        if self.first <= self.last {
            self.first <= id && id <= self.last
        } else {
            id >= self.first || id <= self.last
        }
    }

    /// Extends the range up to `id`, which must be issued after `last`.
    pub const fn extend(self, id: u16) -> Self {
        Self {
            first: self.first,
            last: id,
        }
    }
}

/// Different counters included in the metrics.
/// Currently all counters are for outgoing packets.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub(crate) enum Counter {
    Register,
    RegisterResend,
    Refresh,
    Release,
    Query,
    QueryResend,
    Respond,
    Conflict,
    Challenge,
    NodeStatus,
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Register => write!(f, "register"),
            Self::RegisterResend => write!(f, "register-resend"),
            Self::Refresh => write!(f, "refresh"),
            Self::Release => write!(f, "release"),
            Self::Query => write!(f, "query"),
            Self::QueryResend => write!(f, "query-resend"),
            Self::Respond => write!(f, "respond"),
            Self::Conflict => write!(f, "conflict"),
            Self::Challenge => write!(f, "challenge"),
            Self::NodeStatus => write!(f, "node-status"),
        }
    }
}

/// One datagram to send.
#[derive(Clone, Debug)]
pub struct Outgoing {
    /// The adapter whose socket sends it.
    pub adapter: AdapterId,
    pub dest: SocketAddrV4,
    pub packet: Vec<u8>,
    pub(crate) counter: Counter,
}

impl Outgoing {
    /// The metrics key of this datagram.
    pub fn kind(&self) -> String {
        self.counter.to_string()
    }

    /// Decodes the packet back, mostly for inspection in tests.
    pub fn decode(&self) -> Result<NsIncoming> {
        NsIncoming::new(self.packet.clone())
    }
}

/// The output side of the engine: transaction ids, datagrams and events.
#[derive(Debug)]
pub(crate) struct Wire {
    next_id: u16,
    port: u16,
    pub(crate) outbox: Vec<Outgoing>,
    events: Vec<DaemonEvent>,
}

impl Wire {
    pub(crate) fn new(port: u16) -> Self {
        Self {
            next_id: fastrand::u16(1..),
            port,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Returns a new transaction id. Ids are never 0.
    pub(crate) fn next_tran_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        id
    }

    /// Queues `out` to the name service port of `dest`.
    pub(crate) fn send(
        &mut self,
        adapter: AdapterId,
        dest: Ipv4Addr,
        out: &NsOutgoing,
        counter: Counter,
    ) {
        let dest = SocketAddrV4::new(dest, self.port);
        self.send_to(adapter, dest, out, counter);
    }

    /// Queues `out` to `dest`, typically the source address of a request.
    pub(crate) fn send_to(
        &mut self,
        adapter: AdapterId,
        dest: SocketAddrV4,
        out: &NsOutgoing,
        counter: Counter,
    ) {
        if adapter.is_internal() {
            debug!("drop {} to {}: no adapter to send on", counter, dest);
            return;
        }
        trace!(
            "queue {} id {} to {} via {}",
            counter,
            out.id(),
            dest,
            adapter
        );
        self.outbox.push(Outgoing {
            adapter,
            dest,
            packet: out.to_data_on_wire(),
            counter,
        });
    }

    pub(crate) fn notify(&mut self, event: DaemonEvent) {
        self.events.push(event);
    }
}

/// Everything a name state machine may touch besides its own table.
pub(crate) struct EngineCtx<'a> {
    pub(crate) adapters: &'a AdapterRegistry,
    pub(crate) config: &'a DaemonConfig,
    pub(crate) wire: &'a mut Wire,
}

/// The name service engine. See the module docs.
pub struct NsEngine {
    config: DaemonConfig,
    adapters: AdapterRegistry,
    internal: InternalNames,
    external: ExternalNames,
    wire: Wire,
}

impl NsEngine {
    /// Creates an engine with no adapters yet. Names registered before the
    /// first [reload_adapters](Self::reload_adapters) fail immediately.
    pub fn new(config: DaemonConfig) -> Self {
        Self::with_reachability(config, Box::new(TcpProbe::default()))
    }

    /// Creates an engine that uses `probe` to pick among multiple addresses
    /// of a resolved name.
    pub fn with_reachability(config: DaemonConfig, probe: Box<dyn Reachability>) -> Self {
        let adapters = AdapterRegistry::new(config.max_adapters, config.wins_servers.clone());
        let internal = InternalNames::new(config.max_internal_names);
        let external = ExternalNames::new(config.max_external_names, probe);
        let wire = Wire::new(config.port);
        Self {
            config,
            adapters,
            internal,
            external,
            wire,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Splits `self` into the name tables and the context they work with.
    fn parts(&mut self) -> (&mut InternalNames, &mut ExternalNames, EngineCtx<'_>) {
        let ctx = EngineCtx {
            adapters: &self.adapters,
            config: &self.config,
            wire: &mut self.wire,
        };
        (&mut self.internal, &mut self.external, ctx)
    }

    /// Replaces the adapter table with `specs`.
    ///
    /// Operations on removed adapters are dropped, and names owned by this
    /// host start registering on added adapters.
    pub fn reload_adapters(&mut self, specs: Vec<AdapterSpec>) -> Result<ReloadOutcome> {
        let outcome = self.adapters.reload(specs)?;

        for adapter in outcome.removed.iter() {
            self.wire.notify(DaemonEvent::IpDel(adapter.ip));
        }
        for id in outcome.added.iter() {
            if let Some(adapter) = self.adapters.get(*id) {
                self.wire.notify(DaemonEvent::IpAdd(adapter.ip));
            }
        }

        // An added adapter may reuse the id of a removed one, so registrants
        // are only answered after both.
        let (internal, _, mut ctx) = self.parts();
        for adapter in outcome.removed.iter() {
            internal.release_adapter(adapter.id);
        }
        for id in outcome.added.iter() {
            internal.register_new_adapter(&mut ctx, *id);
        }
        internal.settle_all(&mut ctx);

        Ok(outcome)
    }

    /// Sets the WINS servers of every adapter. Names already registered keep
    /// their state; new operations use the new servers.
    pub fn set_wins_servers(&mut self, servers: Vec<Ipv4Addr>) {
        self.config.wins_servers = servers.clone();
        self.adapters.set_wins_servers(servers);
    }

    /// Registers `name` on every adapter. `requester` gets exactly one answer.
    pub fn register(&mut self, name: NbName, is_group: bool, requester: Requester) {
        debug!("register {} group {}", name, is_group);
        let (internal, _, mut ctx) = self.parts();
        internal.register_all_adapters(&mut ctx, name, is_group, requester);
    }

    /// Releases one registration of `name`.
    ///
    /// With `free_slot` false, the name entry (and its bound port) is kept
    /// after the last registration is released.
    pub fn release(&mut self, name: NbName, requester: Requester, free_slot: bool) {
        debug!("release {}", name);
        let (internal, _, mut ctx) = self.parts();
        internal.release_all_adapters(&mut ctx, name, requester, free_slot);
    }

    /// Resolves `name`: names owned by this host answer from the local table,
    /// any other name goes through the resolution cache.
    pub fn resolve(&mut self, name: NbName, requester: Requester) {
        let (internal, external, mut ctx) = self.parts();
        if internal.answer_query(&mut ctx, name, &requester, false) {
            return;
        }
        external.query(&mut ctx, requester, name);
    }

    /// Asks the host at `ip` for its name table.
    pub fn node_status(&mut self, ip: Ipv4Addr, requester: Requester) {
        let (_, external, mut ctx) = self.parts();
        external.node_status(&mut ctx, requester, ip);
    }

    /// Binds a local port to a registered name.
    pub fn set_port(&mut self, name: NbName, port: u16) -> Result<()> {
        self.internal.set_port(&name, port)
    }

    pub fn port(&self, name: &NbName) -> Option<u16> {
        self.internal.port(name)
    }

    /// Handles one received datagram.
    ///
    /// `src` is the sender, `adapter` the adapter whose socket received it.
    /// Frames that do not decode are returned as `MalformedFrame` and must
    /// be dropped by the caller.
    pub fn handle_frame(
        &mut self,
        data: Vec<u8>,
        src: SocketAddrV4,
        adapter: AdapterId,
    ) -> Result<()> {
        let msg = NsIncoming::new(data)?;

        // Broadcasts we sent come back on our own broadcast socket.
        if self.adapters.is_local_ip(*src.ip()) && src.port() == self.config.port {
            trace!("ignore our own frame id {} from {}", msg.id(), src);
            return Ok(());
        }

        let Some(opcode) = msg.opcode() else {
            debug!("unknown opcode in flags {:#06x} from {}", msg.flags(), src);
            return Ok(());
        };

        trace!(
            "{} {} id {} from {} on {}",
            opcode,
            if msg.is_response() { "response" } else { "request" },
            msg.id(),
            src,
            adapter
        );

        if msg.is_response() {
            let (internal, external, mut ctx) = self.parts();
            match opcode {
                Opcode::Query => {
                    if !internal.on_challenge_response(&mut ctx, &msg) {
                        external.on_response(&mut ctx, &msg, adapter);
                    }
                }
                Opcode::Registration | Opcode::MultiHomedRegistration | Opcode::Refresh => {
                    internal.on_registration_response(&mut ctx, &msg);
                }
                Opcode::Wack => {
                    if !internal.on_wack(&msg) {
                        external.on_wack(&msg);
                    }
                }
                Opcode::Release => {
                    trace!("release response id {} from {}", msg.id(), src);
                }
            }
            return Ok(());
        }

        match opcode {
            Opcode::Query => self.handle_query(&msg, src, adapter),
            Opcode::Registration | Opcode::MultiHomedRegistration => {
                let (internal, _, mut ctx) = self.parts();
                if internal.check_conflict(&mut ctx, adapter, &msg, src) {
                    debug!("defended {:?} against {}", msg.subject(), src);
                }
            }
            Opcode::Release => {
                if let Some(name) = msg.subject() {
                    self.external.invalidate(&name);
                }
            }
            _ => trace!("ignore {} request from {}", opcode, src),
        }
        Ok(())
    }

    fn handle_query(&mut self, msg: &NsIncoming, src: SocketAddrV4, adapter: AdapterId) {
        let Some(question) = msg.questions().first() else {
            return;
        };
        let name = question.name;
        let requester = Requester::Remote {
            addr: src,
            tran_id: msg.id(),
            adapter,
        };

        let (internal, external, mut ctx) = self.parts();

        if question.qtype == RRType::NBSTAT {
            if !name.is_wildcard() && !internal.owns(&name) {
                return;
            }
            let Some(intf) = ctx.adapters.get(adapter) else {
                return;
            };
            let mac = intf.mac;
            let names = internal.node_status_entries(intf);
            let mut out = NsOutgoing::response(msg.id(), Opcode::Query, Rcode::NoError);
            out.add_answer(NsRecord {
                name,
                ttl: 0,
                rdata: RData::NbStat { names, mac },
            });
            ctx.wire.send_to(adapter, src, &out, Counter::NodeStatus);
            return;
        }

        if name.is_wildcard() {
            internal.answer_all(&mut ctx, &requester);
            return;
        }

        if msg.is_broadcast() {
            if internal.answer_query(&mut ctx, name, &requester, false) {
                return;
            }
            let has_wins = ctx.adapters.iter().any(|a| !a.wins.is_empty());
            if ctx.config.proxy && has_wins {
                debug!("proxy query for {} from {}", name, src);
                external.query(&mut ctx, requester, name);
            }
        } else {
            internal.answer_query(&mut ctx, name, &requester, true);
        }
    }

    /// Advances every state machine by `elapsed` seconds, and returns how
    /// long the caller may wait before the next tick.
    pub fn tick(&mut self, elapsed: u32) -> Duration {
        let (internal, external, mut ctx) = self.parts();
        internal.tick(&mut ctx, elapsed);
        external.tick(&mut ctx, elapsed);
        internal.reclaim();

        let next = match (internal.next_wake(), external.next_wake()) {
            (Some(a), Some(b)) => Some(cmp::min(a, b)),
            (a, b) => a.or(b),
        };
        let wake = next
            .map(|secs| cmp::min(Duration::from_secs(secs as u64), IDLE_WAKE))
            .unwrap_or(IDLE_WAKE);
        if external.is_checking() {
            cmp::min(wake, REACH_POLL_INTERVAL)
        } else {
            wake
        }
    }

    /// Releases every owned name on the wire, for shutdown.
    pub fn release_all(&mut self) {
        let (internal, _, mut ctx) = self.parts();
        internal.release_everything(&mut ctx);
    }

    /// Takes all queued datagrams.
    pub fn drain_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.wire.outbox)
    }

    /// Peeks at the queued datagrams.
    pub fn outgoing(&self) -> &[Outgoing] {
        &self.wire.outbox
    }

    /// Takes all events for daemon monitors.
    pub fn drain_events(&mut self) -> Vec<DaemonEvent> {
        std::mem::take(&mut self.wire.events)
    }

    /// The state of the operation of `name` on `adapter`.
    pub fn operation_state(&self, name: &NbName, adapter: AdapterId) -> Option<OperationState> {
        self.internal.state(name, adapter)
    }

    /// The adapters `name` has an operation for.
    pub fn operation_adapters(&self, name: &NbName) -> Vec<AdapterId> {
        self.internal.operation_adapters(name)
    }

    pub fn registration_count(&self, name: &NbName) -> Option<u32> {
        self.internal.registration_count(name)
    }

    /// Unicast registration frames of `name` still waiting for an answer.
    pub fn pending_total(&self, name: &NbName) -> Option<u32> {
        self.internal.pending_total(name)
    }

    /// Number of names owned (or being released) by this host.
    pub fn internal_name_count(&self) -> usize {
        self.internal.len()
    }

    pub fn query_state(&self, name: &NbName) -> Option<QueryState> {
        self.external.state(name)
    }
}

impl fmt::Debug for NsEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NsEngine")
            .field("adapters", &self.adapters.len())
            .field("internal", &self.internal.len())
            .field("external", &self.external.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Requester, TranRange, Wire};
    use crate::adapter::AdapterId;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use test_log::test;

    #[test]
    fn test_tran_range() {
        let range = TranRange { first: 10, last: 12 };
        assert!(range.contains(10));
        assert!(range.contains(12));
        assert!(!range.contains(13));
        assert!(!range.contains(9));

        let wrapped = TranRange {
            first: 65534,
            last: 2,
        };
        assert!(wrapped.contains(65535));
        assert!(wrapped.contains(1));
        assert!(wrapped.contains(2));
        assert!(!wrapped.contains(3));
        assert!(!wrapped.contains(65533));

        assert!(TranRange::single(7).contains(7));
        assert_eq!(TranRange::single(7).extend(9), TranRange { first: 7, last: 9 });
    }

    #[test]
    fn test_tran_id_never_zero() {
        let mut wire = Wire::new(137);
        wire.next_id = u16::MAX;
        assert_eq!(wire.next_tran_id(), u16::MAX);
        assert_eq!(wire.next_tran_id(), 1);
        assert_eq!(wire.next_tran_id(), 2);
    }

    #[test]
    fn test_same_origin() {
        let (s, _r) = flume::bounded(1);
        let a = Requester::local(1, s.clone());
        let b = Requester::local(1, s.clone());
        let c = Requester::local(2, s);
        assert!(a.same_origin(&b));
        assert!(!a.same_origin(&c));

        let remote = Requester::Remote {
            addr: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 137),
            tran_id: 1,
            adapter: AdapterId::INTERNAL,
        };
        assert!(!remote.same_origin(&a));
        assert!(remote.same_origin(&remote.clone()));
    }
}
