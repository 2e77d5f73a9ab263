//! Names of other hosts: resolution and the resolution cache.
//!
//! A name being resolved has one query on the wire at a time, with one
//! transaction id for all of its resends. Every asker for the name while the
//! query is in flight is merged into its waiter list, and all of them get the
//! same answer in the order they were merged. Answers are cached, negative
//! ones for a short while only.
//!
//! A name with several addresses, none of them on the subnet of the adapter
//! that got the answer, is checked for reachability before it resolves. The
//! checks never block: connects are started together and polled on every
//! tick until one decides the pick or `REACH_CHECK_SECS` runs out.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    adapter::AdapterId,
    config::{
        BCAST_QUERY_RETRIES, BCAST_QUERY_TIMEOUT_SECS, MAX_WAITERS, NEG_CACHE_SECS,
        REACH_CHECK_SECS, UCAST_QUERY_RETRIES, UCAST_QUERY_TIMEOUT_SECS,
    },
    engine::{Counter, EngineCtx, NameEvent, Requester},
    nbns_parser::{
        NbAddrEntry, NbName, NsIncoming, NsOutgoing, NsRecord, Opcode, RData, RRType, Rcode,
    },
    Error,
};
use mio::net::TcpStream;
use std::{
    collections::HashMap,
    fmt, io,
    net::{Ipv4Addr, SocketAddr},
};

/// Decides whether a host answers at all, to pick among multiple addresses
/// of a resolved name. No method may block.
pub trait Reachability: Send {
    /// Starts checking `addr`.
    fn start(&mut self, addr: Ipv4Addr);

    /// The outcome of the check of `addr`: None while it is still running.
    fn poll(&mut self, addr: Ipv4Addr) -> Option<bool>;

    /// Forgets the check of `addr`.
    fn finish(&mut self, addr: Ipv4Addr);
}

#[derive(Debug)]
enum Connect {
    InProgress(TcpStream),
    Done(bool),
}

/// Connects to the NetBIOS session service of the host, without blocking.
#[derive(Debug)]
pub struct TcpProbe {
    pub port: u16,
    connects: HashMap<Ipv4Addr, Connect>,
}

impl TcpProbe {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            connects: HashMap::new(),
        }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(139)
    }
}

impl Reachability for TcpProbe {
    fn start(&mut self, addr: Ipv4Addr) {
        let sock_addr = SocketAddr::from((addr, self.port));
        let connect = match TcpStream::connect(sock_addr) {
            Ok(stream) => Connect::InProgress(stream),
            Err(e) => {
                trace!("connect to {} failed: {}", sock_addr, e);
                Connect::Done(false)
            }
        };
        self.connects.insert(addr, connect);
    }

    fn poll(&mut self, addr: Ipv4Addr) -> Option<bool> {
        let connect = self.connects.get_mut(&addr)?;
        let reachable = match connect {
            Connect::Done(reachable) => return Some(*reachable),

            // A failed connect leaves its error on the socket.
            Connect::InProgress(stream) => match stream.take_error() {
                Ok(None) => match stream.peer_addr() {
                    Ok(_) => true,
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => return None,
                    Err(_) => false,
                },
                Ok(Some(e)) | Err(e) => {
                    trace!("connect to {} failed: {}", addr, e);
                    false
                }
            },
        };
        *connect = Connect::Done(reachable);
        Some(reachable)
    }

    fn finish(&mut self, addr: Ipv4Addr) {
        self.connects.remove(&addr);
    }
}

/// The observable state of a name being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum QueryState {
    InQuery,

    /// Answered, the addresses are being checked for reachability.
    Checking,

    Known(Ipv4Addr),
    NotKnown,
}

/// Where a query goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Wins { adapter: AdapterId, server: Ipv4Addr },
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    InQuery {
        tran_id: u16,
        countdown: u32,
        retries_left: u32,
        target: Target,
    },

    /// Answered with `candidates`, waiting for their reachability checks.
    Checking {
        candidates: Vec<NbAddrEntry>,
        ttl: u32,
        countdown: u32,
    },

    /// Resolved to `entry` for `ttl` more seconds.
    Known { entry: NbAddrEntry, ttl: u32 },

    /// Not resolvable, asking again is pointless for `cooldown` seconds.
    NotKnown { cooldown: u32 },
}

impl Status {
    fn state(&self) -> QueryState {
        match self {
            Self::InQuery { .. } => QueryState::InQuery,
            Self::Checking { .. } => QueryState::Checking,
            Self::Known { entry, .. } => QueryState::Known(entry.addr),
            Self::NotKnown { .. } => QueryState::NotKnown,
        }
    }

    fn countdown(&self) -> u32 {
        match self {
            Self::InQuery { countdown, .. } | Self::Checking { countdown, .. } => *countdown,
            Self::Known { ttl, .. } => *ttl,
            Self::NotKnown { cooldown } => *cooldown,
        }
    }
}

#[derive(Debug)]
struct ExternalName {
    name: NbName,
    status: Status,
    waiters: Vec<Requester>,
}

impl ExternalName {
    /// Adds `requester` to the waiters, unless the same asker is already
    /// waiting or the list is full.
    fn merge(&mut self, requester: Requester) {
        if self.waiters.iter().any(|w| w.same_origin(&requester)) {
            trace!("{}: merged duplicate request", self.name);
            return;
        }
        if self.waiters.len() >= MAX_WAITERS {
            debug!("{}: too many waiters, drop request", self.name);
            return;
        }
        self.waiters.push(requester);
    }

    /// Caches `picked` and answers every waiter with it.
    fn resolve(&mut self, ctx: &mut EngineCtx, picked: NbAddrEntry, ttl: u32) {
        debug!("{} resolved to {} ttl {}", self.name, picked.addr, ttl);
        self.status = Status::Known { entry: picked, ttl };
        for waiter in self.waiters.drain(..) {
            answer_resolved(ctx, self.name, &waiter, picked, ttl);
        }
    }
}

/// A node status query sent to one host.
#[derive(Debug)]
struct NodeStatusQuery {
    ip: Ipv4Addr,
    adapter: AdapterId,
    tran_id: u16,
    countdown: u32,
    retries_left: u32,
    waiters: Vec<Requester>,
}

/// The table of names being resolved or cached, and of node status queries.
pub(crate) struct ExternalNames {
    entries: HashMap<NbName, ExternalName>,
    capacity: usize,
    probe: Box<dyn Reachability>,
    node_status: Vec<NodeStatusQuery>,
}

impl ExternalNames {
    pub(crate) fn new(capacity: usize, probe: Box<dyn Reachability>) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            probe,
            node_status: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn state(&self, name: &NbName) -> Option<QueryState> {
        self.entries.get(name).map(|e| e.status.state())
    }

    /// Resolves `name` for `requester`, from the cache if possible.
    pub(crate) fn query(&mut self, ctx: &mut EngineCtx, requester: Requester, name: NbName) {
        if let Some(entry) = self.entries.get_mut(&name) {
            match entry.status {
                Status::Known { entry: addr, ttl } => {
                    trace!("{} is cached: {}", name, addr.addr);
                    answer_resolved(ctx, name, &requester, addr, ttl);
                }
                Status::NotKnown { .. } => {
                    trace!("{} is negatively cached", name);
                    answer_failed(name, &requester, Error::NameNotFound);
                }
                Status::InQuery { .. } | Status::Checking { .. } => entry.merge(requester),
            }
            return;
        }

        if self.entries.len() >= self.capacity {
            debug!("external name table full, cannot resolve {}", name);
            answer_failed(name, &requester, Error::TableFull);
            return;
        }

        let Some(status) = issue_query(ctx, name) else {
            answer_failed(name, &requester, Error::NameNotFound);
            self.entries.insert(
                name,
                ExternalName {
                    name,
                    status: Status::NotKnown {
                        cooldown: NEG_CACHE_SECS,
                    },
                    waiters: Vec::new(),
                },
            );
            return;
        };

        self.entries.insert(
            name,
            ExternalName {
                name,
                status,
                waiters: vec![requester],
            },
        );
    }

    /// Handles a query response. Returns true if it matched a query of ours.
    pub(crate) fn on_response(
        &mut self,
        ctx: &mut EngineCtx,
        msg: &NsIncoming,
        adapter: AdapterId,
    ) -> bool {
        if self.on_node_status_response(msg) {
            return true;
        }

        let tran_id = msg.id();
        let subject = msg.subject();
        let Some(entry) = self.entries.values_mut().find(|e| {
            matches!(e.status, Status::InQuery { tran_id: id, .. } if id == tran_id)
                && subject.map(|s| s == e.name).unwrap_or(true)
        }) else {
            trace!("no query for response id {}", tran_id);
            return false;
        };

        let name = entry.name;
        let record = msg.answers().first();
        let candidates = record.map(NsRecord::addr_entries).unwrap_or(&[]);

        if msg.rcode() != Rcode::NoError as u16 || candidates.is_empty() {
            debug!("{} not found, rcode {}", name, msg.rcode());
            entry.status = Status::NotKnown {
                cooldown: NEG_CACHE_SECS,
            };
            for waiter in entry.waiters.drain(..) {
                answer_failed(name, &waiter, Error::NameNotFound);
            }
            return true;
        }

        let ttl = record
            .map(|r| r.ttl)
            .unwrap_or(0)
            .min(ctx.config.max_cache_ttl);

        match pick_candidate(ctx, adapter, candidates) {
            Some(picked) => entry.resolve(ctx, picked, ttl),
            None => {
                debug!("{}: check {} candidates", name, candidates.len());
                for candidate in candidates {
                    self.probe.start(candidate.addr);
                }
                entry.status = Status::Checking {
                    candidates: candidates.to_vec(),
                    ttl,
                    countdown: REACH_CHECK_SECS,
                };
            }
        }
        true
    }

    /// Returns true if some reachability check is still running.
    pub(crate) fn is_checking(&self) -> bool {
        self.entries
            .values()
            .any(|e| matches!(e.status, Status::Checking { .. }))
    }

    fn on_node_status_response(&mut self, msg: &NsIncoming) -> bool {
        let Some(pos) = self
            .node_status
            .iter()
            .position(|q| q.tran_id == msg.id())
        else {
            return false;
        };
        let query = self.node_status.remove(pos);

        let names = msg.answers().iter().find_map(|r| match &r.rdata {
            RData::NbStat { names, .. } => Some(names.clone()),
            _ => None,
        });

        for waiter in query.waiters.iter() {
            let event = match &names {
                Some(names) if msg.rcode() == Rcode::NoError as u16 => {
                    NameEvent::NodeStatus(query.ip, names.clone())
                }
                _ => NameEvent::NodeStatusFailed(query.ip, Error::NameNotFound),
            };
            waiter.answer(event);
        }
        true
    }

    /// A WACK only extends the wait of the matching query.
    pub(crate) fn on_wack(&mut self, msg: &NsIncoming) -> bool {
        let secs = msg.first_record().map(|r| r.ttl).unwrap_or(0);
        for entry in self.entries.values_mut() {
            if let Status::InQuery {
                tran_id, countdown, ..
            } = &mut entry.status
            {
                if *tran_id == msg.id() {
                    *countdown = secs;
                    return true;
                }
            }
        }
        if let Some(query) = self.node_status.iter_mut().find(|q| q.tran_id == msg.id()) {
            query.countdown = secs;
            return true;
        }
        false
    }

    /// Forgets a cached name, e.g. after its owner released it.
    pub(crate) fn invalidate(&mut self, name: &NbName) {
        if matches!(
            self.entries.get(name).map(|e| &e.status),
            Some(Status::Known { .. })
        ) {
            debug!("{} released by its owner", name);
            self.entries.remove(name);
        }
    }

    /// Asks the host at `ip` for its name table.
    pub(crate) fn node_status(&mut self, ctx: &mut EngineCtx, requester: Requester, ip: Ipv4Addr) {
        if let Some(query) = self.node_status.iter_mut().find(|q| q.ip == ip) {
            if !query.waiters.iter().any(|w| w.same_origin(&requester))
                && query.waiters.len() < MAX_WAITERS
            {
                query.waiters.push(requester);
            }
            return;
        }

        let mut adapter = ctx.adapters.find_by_destination_ip(ip);
        if adapter.is_internal() {
            match ctx.adapters.snapshot().first() {
                Some(id) => adapter = *id,
                None => {
                    requester.answer(NameEvent::NodeStatusFailed(
                        ip,
                        e_fmt!("no network adapter"),
                    ));
                    return;
                }
            }
        }

        let tran_id = ctx.wire.next_tran_id();
        send_node_status(ctx, adapter, ip, tran_id, Counter::NodeStatus);
        self.node_status.push(NodeStatusQuery {
            ip,
            adapter,
            tran_id,
            countdown: UCAST_QUERY_TIMEOUT_SECS,
            retries_left: UCAST_QUERY_RETRIES,
            waiters: vec![requester],
        });
    }

    pub(crate) fn tick(&mut self, ctx: &mut EngineCtx, elapsed: u32) {
        let mut expired = Vec::new();
        let probe = self.probe.as_mut();

        for entry in self.entries.values_mut() {
            match &mut entry.status {
                Status::InQuery {
                    tran_id,
                    countdown,
                    retries_left,
                    target,
                } => {
                    *countdown = countdown.saturating_sub(elapsed);
                    if *countdown > 0 {
                        continue;
                    }
                    if *retries_left > 0 {
                        *retries_left -= 1;
                        *countdown =
                            send_query(ctx, entry.name, *tran_id, *target, Counter::QueryResend);
                        continue;
                    }

                    debug!("{}: query timed out", entry.name);
                    entry.status = Status::NotKnown {
                        cooldown: NEG_CACHE_SECS,
                    };
                    for waiter in entry.waiters.drain(..) {
                        answer_failed(entry.name, &waiter, Error::Timeout);
                    }
                }
                Status::Checking {
                    candidates,
                    ttl,
                    countdown,
                } => {
                    *countdown = countdown.saturating_sub(elapsed);
                    let timed_out = *countdown == 0;
                    let Some(picked) = checked_pick(probe, candidates, timed_out) else {
                        continue;
                    };
                    for candidate in candidates.iter() {
                        probe.finish(candidate.addr);
                    }
                    let ttl = *ttl;
                    entry.resolve(ctx, picked, ttl);
                }
                Status::Known { ttl: left, .. } | Status::NotKnown { cooldown: left } => {
                    *left = left.saturating_sub(elapsed);
                    if *left == 0 {
                        expired.push(entry.name);
                    }
                }
            }
        }

        for name in expired {
            trace!("{} expired from the cache", name);
            self.entries.remove(&name);
        }

        let mut i = 0;
        while i < self.node_status.len() {
            let query = &mut self.node_status[i];
            query.countdown = query.countdown.saturating_sub(elapsed);
            if query.countdown > 0 {
                i += 1;
                continue;
            }
            if query.retries_left > 0 {
                query.retries_left -= 1;
                query.countdown = UCAST_QUERY_TIMEOUT_SECS;
                let (adapter, ip, tran_id) = (query.adapter, query.ip, query.tran_id);
                send_node_status(ctx, adapter, ip, tran_id, Counter::NodeStatus);
                i += 1;
                continue;
            }

            let query = self.node_status.remove(i);
            debug!("node status of {} timed out", query.ip);
            for waiter in query.waiters.iter() {
                waiter.answer(NameEvent::NodeStatusFailed(query.ip, Error::Timeout));
            }
        }
    }

    pub(crate) fn next_wake(&self) -> Option<u32> {
        let names = self.entries.values().map(|e| e.status.countdown());
        let node_status = self.node_status.iter().map(|q| q.countdown);
        names.chain(node_status).min()
    }
}

impl fmt::Debug for ExternalNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalNames")
            .field("entries", &self.entries)
            .field("capacity", &self.capacity)
            .field("node_status", &self.node_status)
            .finish()
    }
}

/// Sends the first query for `name`: to the first WINS server if any
/// adapter has one, otherwise broadcast on every adapter.
///
/// Returns None if there is no adapter to send on.
fn issue_query(ctx: &mut EngineCtx, name: NbName) -> Option<Status> {
    if ctx.adapters.is_empty() {
        debug!("no adapter to resolve {}", name);
        return None;
    }

    let target = ctx
        .adapters
        .iter()
        .find_map(|a| {
            a.wins.first().map(|server| Target::Wins {
                adapter: a.id,
                server: *server,
            })
        })
        .unwrap_or(Target::Broadcast);
    let retries_left = match target {
        Target::Wins { .. } => UCAST_QUERY_RETRIES,
        Target::Broadcast => BCAST_QUERY_RETRIES,
    };

    let tran_id = ctx.wire.next_tran_id();
    let countdown = send_query(ctx, name, tran_id, target, Counter::Query);
    Some(Status::InQuery {
        tran_id,
        countdown,
        retries_left,
        target,
    })
}

/// Sends a name query with `tran_id` and returns how long to wait for the answer.
fn send_query(
    ctx: &mut EngineCtx,
    name: NbName,
    tran_id: u16,
    target: Target,
    counter: Counter,
) -> u32 {
    match target {
        Target::Wins { adapter, server } => {
            let mut out = NsOutgoing::request(tran_id, Opcode::Query, false);
            out.add_question(name, RRType::NB);
            ctx.wire.send(adapter, server, &out, counter);
            UCAST_QUERY_TIMEOUT_SECS
        }
        Target::Broadcast => {
            let mut out = NsOutgoing::request(tran_id, Opcode::Query, true);
            out.add_question(name, RRType::NB);
            let adapters = ctx.adapters;
            for adapter in adapters.iter().filter(|a| a.is_broadcast_mode()) {
                ctx.wire.send(adapter.id, adapter.broadcast, &out, counter);
            }
            BCAST_QUERY_TIMEOUT_SECS
        }
    }
}

fn send_node_status(
    ctx: &mut EngineCtx,
    adapter: AdapterId,
    ip: Ipv4Addr,
    tran_id: u16,
    counter: Counter,
) {
    let mut out = NsOutgoing::request(tran_id, Opcode::Query, false);
    out.add_question(NbName::wildcard(), RRType::NBSTAT);
    ctx.wire.send(adapter, ip, &out, counter);
}

/// Picks one of multiple addresses: the first on the subnet of the adapter
/// that received the answer, else the first one if there is nothing to check.
///
/// Returns None if the candidates need reachability checks first.
fn pick_candidate(
    ctx: &EngineCtx,
    adapter: AdapterId,
    candidates: &[NbAddrEntry],
) -> Option<NbAddrEntry> {
    let first = candidates[0];
    if candidates.len() == 1 {
        return Some(first);
    }

    if let Some(entry) = candidates
        .iter()
        .find(|e| ctx.adapters.same_subnet(adapter, e.addr))
    {
        return Some(*entry);
    }

    if ctx.config.reachability_probe {
        None
    } else {
        Some(first)
    }
}

/// The first reachable candidate once every candidate before it is known to
/// be unreachable. With `timed_out`, the first reachable one so far, else the
/// first candidate.
///
/// Returns None while the pick still depends on a running check.
fn checked_pick(
    probe: &mut dyn Reachability,
    candidates: &[NbAddrEntry],
    timed_out: bool,
) -> Option<NbAddrEntry> {
    let mut undecided = false;
    for candidate in candidates {
        match probe.poll(candidate.addr) {
            Some(true) if !undecided || timed_out => return Some(*candidate),
            Some(true) | Some(false) => {}
            None => undecided = true,
        }
    }
    if undecided && !timed_out {
        None
    } else {
        candidates.first().copied()
    }
}

fn answer_resolved(
    ctx: &mut EngineCtx,
    name: NbName,
    requester: &Requester,
    entry: NbAddrEntry,
    ttl: u32,
) {
    match requester {
        Requester::Local { .. } => requester.answer(NameEvent::Resolved(name, vec![entry.addr])),
        Requester::Remote {
            addr,
            tran_id,
            adapter,
        } => {
            let mut out = NsOutgoing::response(*tran_id, Opcode::Query, Rcode::NoError);
            out.add_answer(NsRecord::nb(name, ttl, entry));
            ctx.wire.send_to(*adapter, *addr, &out, Counter::Respond);
        }
    }
}

/// Remote askers never get negative answers from us.
fn answer_failed(name: NbName, requester: &Requester, error: Error) {
    requester.answer(NameEvent::ResolveFailed(name, error));
}
