//! Name service daemon for NetBIOS over TCP/IP.

// How the NetBIOS name service works in a nutshell:
//
// (excerpt from RFC 1001)
// .... The NetBIOS name service is the collection of procedures through
//    which nodes acquire, defend and locate the holders of NetBIOS names.
//    ... B nodes perform name resolution by broadcasting; P nodes by
//    directed (point-to-point) communication with a NetBIOS Name Server
//    (NBNS); M and H nodes use combinations of both.
//
// This daemon is a B-node on adapters without WINS servers and a H-node on
// adapters with them. All of the protocol state lives in `NsEngine`, which
// never touches a socket: this module owns the sockets and the thread, feeds
// received frames and elapsed time into the engine, and puts whatever the
// engine queued on the wire.
#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    adapter::{apply_selections, my_ipv4_interfaces, AdapterId, IfKind, IfSelection, IntoIfKindVec},
    config::{DaemonConfig, IP_CHECK_INTERVAL},
    engine::{Counter, NameEvent, NsEngine, Requester},
    error::{Error, Result},
    nbns_parser::{NbName, MAX_MSG_ABSOLUTE},
    Receiver,
};
use flume::{bounded, Sender, TrySendError};
use mio::{net::UdpSocket as MioUdpSocket, Poll};
use socket2::Socket;
use std::{
    collections::HashMap,
    fmt,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    thread,
    time::{Duration, Instant},
};

const LOOPBACK_V4: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Shortest poll timeout, so a due state machine never spins the loop.
const MIN_POLL_WAIT: Duration = Duration::from_millis(10);

/// Whether the daemon thread is still serving commands.
#[derive(Debug, PartialEq, Clone, Eq)]
#[non_exhaustive]
pub enum DaemonStatus {
    /// Serving commands.
    Running,

    /// Stopped, after releasing its names.
    Shutdown,
}

/// Counters of the datagrams sent by the daemon, keyed by kind (`register`,
/// `query`, `respond`, ...).
pub type Metrics = HashMap<String, i64>;

const SIGNAL_SOCK_EVENT_KEY: usize = usize::MAX - 1; // avoid to overlap with ns.poll_ids

/// A daemon thread for the NetBIOS name service.
///
/// This struct provides a handle and an API to the daemon. It is cloneable,
/// and all clones share one origin: a release through any of them cancels
/// the registrations in flight requested through any of them.
#[derive(Clone)]
pub struct NameDaemon {
    /// Commands to the daemon thread.
    sender: Sender<Command>,

    /// A datagram to this loopback addr wakes the daemon up after a
    /// command was queued. It is polled along with the name service sockets.
    signal_addr: SocketAddr,

    /// Identifies the registrations made through this handle.
    origin: u32,
}

impl NameDaemon {
    /// Creates a new daemon on the default port 137 and spawns a thread to run it.
    pub fn new() -> Result<Self> {
        Self::with_config(DaemonConfig::default())
    }

    /// Creates a new daemon with `config` and spawns a thread to run it.
    pub fn with_config(config: DaemonConfig) -> Result<Self> {
        // Any free loopback port will do.
        let signal_addr = SocketAddrV4::new(LOOPBACK_V4, 0);

        let signal_sock = UdpSocket::bind(signal_addr).map_err(|e| {
            Error::Transport(format!("failed to create signal_sock for daemon: {}", e))
        })?;

        let signal_addr = signal_sock
            .local_addr()
            .map_err(|e| Error::Transport(format!("failed to get signal sock addr: {}", e)))?;

        // Must be nonblocking so we can listen to it together with the name service sockets.
        signal_sock.set_nonblocking(true).map_err(|e| {
            Error::Transport(format!(
                "failed to set nonblocking for signal socket: {}",
                e
            ))
        })?;

        let poller = Poll::new()
            .map_err(|e| Error::Transport(format!("failed to create mio Poll: {e}")))?;

        let (sender, receiver) = bounded(100);

        // Spawn the daemon thread
        let mio_sock = MioUdpSocket::from_std(signal_sock);
        thread::Builder::new()
            .name("NBNS_daemon".to_string())
            .spawn(move || Self::daemon_thread(mio_sock, poller, receiver, config))
            .map_err(|e| e_fmt!("thread builder failed to spawn: {}", e))?;

        Ok(Self {
            sender,
            signal_addr,
            origin: fastrand::u32(..),
        })
    }

    /// Queues `cmd` for the daemon and wakes it up with a datagram on its
    /// signal socket.
    fn send_cmd(&self, cmd: Command) -> Result<()> {
        let cmd_name = cmd.to_string();

        // Queue first, so that the daemon finds the command once woken up.
        self.sender.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => Error::Again,
            e => e_fmt!("flume::channel::send failed: {}", e),
        })?;

        let addr = SocketAddrV4::new(LOOPBACK_V4, 0);
        let socket = UdpSocket::bind(addr)
            .map_err(|e| e_fmt!("Failed to create socket to send signal: {}", e))?;
        socket
            .send_to(cmd_name.as_bytes(), self.signal_addr)
            .map_err(|e| {
                e_fmt!(
                    "signal socket send_to {} ({}) failed: {}",
                    self.signal_addr,
                    cmd_name,
                    e
                )
            })?;

        Ok(())
    }

    /// Registers `name` on every adapter of the host.
    ///
    /// Returns a channel receiver that gets exactly one event: either
    /// [`NameEvent::Registered`] or [`NameEvent::RegisterFailed`].
    ///
    /// Registering a name that is already registered increases its reference
    /// count, and every registration needs its own [`release`](Self::release).
    pub fn register(&self, name: NbName, is_group: bool) -> Result<Receiver<NameEvent>> {
        let (resp_s, resp_r) = bounded(1);
        let requester = Requester::local(self.origin, resp_s);
        self.send_cmd(Command::Register(name, is_group, requester))?;
        Ok(resp_r)
    }

    /// Releases one registration of `name`.
    ///
    /// Pending registrations of the same name through this handle are
    /// cancelled. With `keep_port` true, the port bound to the name survives
    /// the release of its last registration.
    pub fn release(&self, name: NbName, keep_port: bool) -> Result<Receiver<NameEvent>> {
        let (resp_s, resp_r) = bounded(1);
        let requester = Requester::local(self.origin, resp_s);
        self.send_cmd(Command::Release(name, !keep_port, requester))?;
        Ok(resp_r)
    }

    /// Resolves `name` to IPv4 addresses.
    ///
    /// Returns a channel receiver that gets either [`NameEvent::Resolved`]
    /// or [`NameEvent::ResolveFailed`].
    pub fn resolve(&self, name: NbName) -> Result<Receiver<NameEvent>> {
        let (resp_s, resp_r) = bounded(1);
        let requester = Requester::local(fastrand::u32(..), resp_s);
        self.send_cmd(Command::Resolve(name, requester))?;
        Ok(resp_r)
    }

    /// Asks the host at `ip` for its name table.
    ///
    /// Returns a channel receiver that gets either [`NameEvent::NodeStatus`]
    /// or [`NameEvent::NodeStatusFailed`].
    pub fn node_status(&self, ip: Ipv4Addr) -> Result<Receiver<NameEvent>> {
        let (resp_s, resp_r) = bounded(1);
        let requester = Requester::local(fastrand::u32(..), resp_s);
        self.send_cmd(Command::NodeStatus(ip, requester))?;
        Ok(resp_r)
    }

    /// Binds a local port to the registered `name`, e.g. the listener of the
    /// session service for this name.
    pub fn set_port(&self, name: NbName, port: u16) -> Result<Receiver<Result<()>>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::SetPort(name, port, resp_s))?;
        Ok(resp_r)
    }

    /// Returns the local port bound to `name`, if any.
    pub fn get_port(&self, name: NbName) -> Result<Receiver<Option<u16>>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::GetPort(name, resp_s))?;
        Ok(resp_r)
    }

    /// Tells the daemon that the network configuration of the host changed.
    ///
    /// The daemon re-reads the interfaces right away instead of waiting for
    /// its periodic check.
    pub fn notify_config_change(&self) -> Result<()> {
        self.send_cmd(Command::ConfigChanged)
    }

    /// Uses the interfaces matching `if_kind` as adapters again.
    ///
    /// For example:
    /// ```ignore
    ///     daemon.enable_interface("en0")?;
    /// ```
    pub fn enable_interface(&self, if_kind: impl IntoIfKindVec) -> Result<()> {
        let if_kind_vec = if_kind.into_vec();
        self.send_cmd(Command::SetOption(DaemonOption::EnableInterface(
            if_kind_vec.kinds,
        )))
    }

    /// Stops using the interfaces matching `if_kind` as adapters. Names
    /// registered on them are dropped from those adapters.
    ///
    /// For example:
    /// ```ignore
    ///     daemon.disable_interface(IfKind::All)?;
    /// ```
    pub fn disable_interface(&self, if_kind: impl IntoIfKindVec) -> Result<()> {
        let if_kind_vec = if_kind.into_vec();
        self.send_cmd(Command::SetOption(DaemonOption::DisableInterface(
            if_kind_vec.kinds,
        )))
    }

    /// Replaces the WINS servers. Adapters become H-nodes with a non-empty
    /// list and B-nodes with an empty one.
    pub fn set_wins_servers(&self, servers: Vec<Ipv4Addr>) -> Result<()> {
        self.send_cmd(Command::SetOption(DaemonOption::WinsServers(servers)))
    }

    /// Subscribes to [`DaemonEvent`]s: adapter changes, registrations and
    /// conflicts on each adapter, and errors.
    pub fn monitor(&self) -> Result<Receiver<DaemonEvent>> {
        let (resp_s, resp_r) = bounded(100);
        self.send_cmd(Command::Monitor(resp_s))?;
        Ok(resp_r)
    }

    /// Stops the daemon thread. The receiver gets [`DaemonStatus::Shutdown`]
    /// once it is done.
    ///
    /// All names owned by this host are released on the wire before the
    /// daemon stops.
    ///
    /// `Error::Again` means the command queue is full and the call may be
    /// retried.
    pub fn shutdown(&self) -> Result<Receiver<DaemonStatus>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Exit(resp_s))?;
        Ok(resp_r)
    }

    /// Asks the daemon whether it is still running. A daemon whose thread
    /// is gone is reported as [`DaemonStatus::Shutdown`] right away.
    pub fn status(&self) -> Result<Receiver<DaemonStatus>> {
        let (resp_s, resp_r) = bounded(1);

        if self.sender.is_disconnected() {
            resp_s
                .send(DaemonStatus::Shutdown)
                .map_err(|e| e_fmt!("failed to send daemon status to the client: {}", e))?;
        } else {
            self.send_cmd(Command::GetStatus(resp_s))?;
        }

        Ok(resp_r)
    }

    /// A snapshot of the outgoing datagram counters.
    pub fn get_metrics(&self) -> Result<Receiver<Metrics>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::GetMetrics(resp_s))?;
        Ok(resp_r)
    }

    fn daemon_thread(
        signal_sock: MioUdpSocket,
        poller: Poll,
        receiver: Receiver<Command>,
        config: DaemonConfig,
    ) {
        let ns = NameService::new(signal_sock, poller, config);

        if let Some(cmd) = Self::run(ns, receiver) {
            match cmd {
                Command::Exit(resp_s) => {
                    // It is guaranteed that the receiver already dropped,
                    // i.e. the daemon command channel closed.
                    if let Err(e) = resp_s.send(DaemonStatus::Shutdown) {
                        debug!("exit: failed to send response of shutdown: {}", e);
                    }
                }
                _ => {
                    debug!("Unexpected command: {:?}", cmd);
                }
            }
        }
    }

    fn handle_poller_events(ns: &mut NameService, events: &mio::Events) {
        for ev in events.iter() {
            trace!("event received with key {:?}", ev.token());
            if ev.token().0 == SIGNAL_SOCK_EVENT_KEY {
                // Drain signals as we will drain commands as well.
                ns.signal_sock_drain();

                if let Err(e) = ns.poller.registry().reregister(
                    &mut ns.signal_sock,
                    ev.token(),
                    mio::Interest::READABLE,
                ) {
                    debug!("failed to modify poller for signal socket: {}", e);
                }
                continue; // Next event.
            }

            // Read until no more packets available.
            let Some((id, kind)) = ns.poll_ids.get(&ev.token().0).copied() else {
                debug!("adapter for event key {} not found", ev.token().0);
                continue;
            };
            while ns.handle_read(id, kind) {}

            // we continue to monitor this socket.
            if let Some(sock) = ns.socks.get_mut(&id).and_then(|s| s.get_mut(kind)) {
                if let Err(e) =
                    ns.poller
                        .registry()
                        .reregister(sock, ev.token(), mio::Interest::READABLE)
                {
                    debug!("modify poller for {}: {}", id, e);
                }
            }
        }
    }

    /// The event loop. Each round polls the sockets until the engine's next
    /// timeout, hands received frames to the engine, runs the queued commands,
    /// ticks the engine and puts its outbox on the wire. Interfaces are
    /// re-read every `IP_CHECK_INTERVAL`.
    fn run(mut ns: NameService, receiver: Receiver<Command>) -> Option<Command> {
        // Add the daemon's signal socket to the poller.
        if let Err(e) = ns.poller.registry().register(
            &mut ns.signal_sock,
            mio::Token(SIGNAL_SOCK_EVENT_KEY),
            mio::Interest::READABLE,
        ) {
            debug!("failed to add signal socket to the poller: {}", e);
            return None;
        }

        // Bind the name service sockets of all adapters.
        ns.check_ip_changes();
        ns.flush();

        let mut next_ip_check = Instant::now() + IP_CHECK_INTERVAL;
        let mut wake = ns.engine.tick(0);

        let mut events = mio::Events::with_capacity(1024);
        loop {
            let timeout = wake.saturating_sub(ns.carry).max(MIN_POLL_WAIT);

            events.clear();
            match ns.poller.poll(&mut events, Some(timeout)) {
                Ok(_) => Self::handle_poller_events(&mut ns, &events),
                Err(e) => debug!("failed to select from sockets: {}", e),
            }

            while let Ok(command) = receiver.try_recv() {
                if matches!(command, Command::Exit(_)) {
                    ns.engine.release_all();
                    ns.flush();
                    ns.status = DaemonStatus::Shutdown;
                    return Some(command);
                }
                ns.exec_command(command);
            }

            let now = Instant::now();
            if now >= next_ip_check {
                next_ip_check = now + IP_CHECK_INTERVAL;
                ns.check_ip_changes();
            }

            wake = ns.tick(now);
            ns.flush();
        }
    }
}

/// A nonblocking UDP socket bound to `addr` that may send broadcasts.
///
/// Address (and port) reuse lets several daemons on one host share the
/// broadcast address.
fn new_socket(addr: SocketAddrV4) -> Result<Socket> {
    let fd = Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, None)
        .map_err(|e| Error::Transport(format!("create socket failed: {}", e)))?;

    fd.set_reuse_address(true)
        .map_err(|e| Error::Transport(format!("set ReuseAddr failed: {}", e)))?;
    #[cfg(unix)] // this is currently restricted to Unix's in socket2
    fd.set_reuse_port(true)
        .map_err(|e| Error::Transport(format!("set ReusePort failed: {}", e)))?;

    // Registrations and queries of B-nodes go to the broadcast address.
    fd.set_broadcast(true)
        .map_err(|e| Error::Transport(format!("set SO_BROADCAST failed: {}", e)))?;

    fd.set_nonblocking(true)
        .map_err(|e| Error::Transport(format!("set O_NONBLOCK: {}", e)))?;

    let sock_addr = SocketAddr::V4(addr);
    fd.bind(&sock_addr.into())
        .map_err(|e| Error::Transport(format!("socket bind to {} failed: {}", addr, e)))?;

    trace!("new socket bind to {}", addr);
    Ok(fd)
}

fn new_mio_socket(addr: SocketAddrV4) -> Result<MioUdpSocket> {
    let sock = new_socket(addr)?;
    Ok(MioUdpSocket::from_std(UdpSocket::from(sock)))
}

/// Which socket of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SockKind {
    /// Bound to the adapter address, also used for sending.
    Unicast,

    /// Bound to the directed broadcast address of the adapter.
    Broadcast,
}

/// The sockets of one adapter.
struct AdapterSocks {
    ip: Ipv4Addr,
    unicast: MioUdpSocket,

    /// Not every platform lets us bind a broadcast address.
    broadcast: Option<MioUdpSocket>,
}

impl AdapterSocks {
    fn get_mut(&mut self, kind: SockKind) -> Option<&mut MioUdpSocket> {
        match kind {
            SockKind::Unicast => Some(&mut self.unicast),
            SockKind::Broadcast => self.broadcast.as_mut(),
        }
    }
}

/// The state of the daemon thread.
struct NameService {
    /// All name service state.
    engine: NsEngine,

    port: u16,

    /// Sockets of every adapter.
    socks: HashMap<AdapterId, AdapterSocks>,

    /// Map poll id to the adapter socket.
    poll_ids: HashMap<usize, (AdapterId, SockKind)>,

    /// Next poll id value
    poll_id_count: usize,

    counters: Metrics,

    /// Waits for incoming packets.
    poller: Poll,

    /// Channels to notify events.
    monitors: Vec<Sender<DaemonEvent>>,

    /// All interface selections called to the daemon.
    if_selections: Vec<IfSelection>,

    /// Socket for signaling.
    signal_sock: MioUdpSocket,

    status: DaemonStatus,

    /// When the engine was last ticked.
    last_tick: Instant,

    /// Time passed since `last_tick` not yet given to the engine, always
    /// less than one second.
    carry: Duration,
}

impl NameService {
    fn new(signal_sock: MioUdpSocket, poller: Poll, config: DaemonConfig) -> Self {
        let port = config.port;
        Self {
            engine: NsEngine::new(config),
            port,
            socks: HashMap::new(),
            poll_ids: HashMap::new(),
            poll_id_count: 0,
            counters: HashMap::new(),
            poller,
            monitors: Vec::new(),
            if_selections: Vec::new(),
            signal_sock,
            status: DaemonStatus::Running,
            last_tick: Instant::now(),
            carry: Duration::ZERO,
        }
    }

    fn process_set_option(&mut self, daemon_opt: DaemonOption) {
        match daemon_opt {
            DaemonOption::EnableInterface(if_kind) => self.select_interfaces(if_kind, true),
            DaemonOption::DisableInterface(if_kind) => self.select_interfaces(if_kind, false),
            DaemonOption::WinsServers(servers) => {
                debug!("set WINS servers: {:?}", servers);
                self.engine.set_wins_servers(servers);
            }
        }
    }

    fn select_interfaces(&mut self, kinds: Vec<IfKind>, selected: bool) {
        for if_kind in kinds {
            self.if_selections.push(IfSelection { if_kind, selected });
        }

        self.check_ip_changes();
    }

    fn notify_monitors(&mut self, event: DaemonEvent) {
        // Only retain the monitors that are still connected.
        self.monitors.retain(|sender| {
            if let Err(e) = sender.try_send(event.clone()) {
                debug!("notify_monitors: try_send: {}", &e);
                if matches!(e, TrySendError::Disconnected(_)) {
                    return false; // This monitor is dropped.
                }
            }
            true
        });
    }

    fn add_poll(&mut self, id: AdapterId, kind: SockKind) -> usize {
        let key = self.poll_id_count;
        self.poll_id_count += 1;
        self.poll_ids.insert(key, (id, kind));
        key
    }

    /// Reloads the adapters from the interfaces of the host, and rebinds
    /// the sockets of the adapters that came and went.
    fn check_ip_changes(&mut self) {
        let specs = apply_selections(my_ipv4_interfaces(), &self.if_selections);

        let outcome = match self.engine.reload_adapters(specs) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("failed to reload adapters: {}", e);
                self.notify_monitors(DaemonEvent::Error(e));
                return;
            }
        };

        if outcome.is_unchanged() {
            return;
        }

        for adapter in outcome.removed.iter() {
            self.remove_adapter_socks(adapter.id);
        }
        for id in outcome.added.iter() {
            self.add_adapter_socks(*id);
        }
    }

    fn remove_adapter_socks(&mut self, id: AdapterId) {
        let Some(mut socks) = self.socks.remove(&id) else {
            return;
        };
        debug!("remove sockets of {} ({})", id, socks.ip);

        let poller = &self.poller;
        let deregister = |sock: &mut MioUdpSocket| {
            if let Err(e) = poller.registry().deregister(sock) {
                debug!("check_ip_changes: poller.delete {}: {}", id, e);
            }
        };
        deregister(&mut socks.unicast);
        if let Some(sock) = socks.broadcast.as_mut() {
            deregister(sock);
        }
        self.poll_ids.retain(|_, (v, _)| *v != id);
    }

    fn add_adapter_socks(&mut self, id: AdapterId) {
        let Some(adapter) = self.engine.adapters().get(id) else {
            return;
        };
        let ip = adapter.ip;
        let broadcast_ip = adapter.broadcast;

        let mut unicast = match new_mio_socket(SocketAddrV4::new(ip, self.port)) {
            Ok(sock) => sock,
            Err(e) => {
                debug!("bind a socket to {}: {}. Skipped.", ip, e);
                self.notify_monitors(DaemonEvent::Error(e));
                return;
            }
        };

        let key = self.add_poll(id, SockKind::Unicast);
        if let Err(e) =
            self.poller
                .registry()
                .register(&mut unicast, mio::Token(key), mio::Interest::READABLE)
        {
            debug!("check_ip_changes: poller add ip {}: {}", ip, e);
            return;
        }

        let broadcast = match new_mio_socket(SocketAddrV4::new(broadcast_ip, self.port)) {
            Ok(mut sock) => {
                let key = self.add_poll(id, SockKind::Broadcast);
                match self.poller.registry().register(
                    &mut sock,
                    mio::Token(key),
                    mio::Interest::READABLE,
                ) {
                    Ok(()) => Some(sock),
                    Err(e) => {
                        debug!("poller add broadcast {}: {}", broadcast_ip, e);
                        None
                    }
                }
            }
            Err(e) => {
                // Broadcasts may still arrive on the unicast socket.
                trace!("bind broadcast {}: {}", broadcast_ip, e);
                None
            }
        };

        debug!("add new adapter {}: {}", id, ip);
        self.socks.insert(
            id,
            AdapterSocks {
                ip,
                unicast,
                broadcast,
            },
        );
    }

    /// Reads one datagram. Returns false if nothing was read.
    fn handle_read(&mut self, id: AdapterId, kind: SockKind) -> bool {
        let Some(sock) = self.socks.get_mut(&id).and_then(|s| s.get_mut(kind)) else {
            return false;
        };
        let mut buf = vec![0u8; MAX_MSG_ABSOLUTE];

        // Read the next name service UDP datagram.
        //
        // Larger datagrams are truncated by the socket layer and will not
        // decode, which only drops them.
        let (sz, src) = match sock.recv_from(&mut buf) {
            Ok(read) => read,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::WouldBlock {
                    debug!("listening socket read failed: {}", e);
                }
                return false;
            }
        };

        trace!("received {} bytes from {} on {}", sz, src, id);

        let SocketAddr::V4(src) = src else {
            return true;
        };

        buf.truncate(sz); // reduce potential processing errors

        if let Err(e) = self.engine.handle_frame(buf, src, id) {
            debug!("drop frame from {}: {}", src, e);
        }

        true
    }

    /// Gives the elapsed whole seconds to the engine, and returns how long
    /// the engine may sleep.
    fn tick(&mut self, now: Instant) -> Duration {
        self.carry += now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        let elapsed = take_whole_secs(&mut self.carry);
        self.engine.tick(elapsed)
    }

    /// Sends out all queued frames and events.
    fn flush(&mut self) {
        for out in self.engine.drain_outgoing() {
            self.increase_counter(out.counter, 1);
            let Some(socks) = self.socks.get(&out.adapter) else {
                debug!(
                    "{}",
                    Error::Transport(format!("no socket for {} to {}", out.adapter, out.dest))
                );
                continue;
            };
            match socks.unicast.send_to(&out.packet, SocketAddr::V4(out.dest)) {
                Ok(sz) => trace!("sent {} bytes to {} via {}", sz, out.dest, socks.ip),
                Err(e) => debug!(
                    "{}",
                    Error::Transport(format!("send to {} via {}: {}", out.dest, socks.ip, e))
                ),
            }
        }

        for event in self.engine.drain_events() {
            self.notify_monitors(event);
        }
    }

    fn increase_counter(&mut self, counter: Counter, count: i64) {
        let key = counter.to_string();
        match self.counters.get_mut(&key) {
            Some(v) => *v += count,
            None => {
                self.counters.insert(key, count);
            }
        }
    }

    fn signal_sock_drain(&self) {
        let mut signal_buf = [0; 1024];

        // This recv is non-blocking as the socket is non-blocking.
        while let Ok(sz) = self.signal_sock.recv(&mut signal_buf) {
            trace!(
                "signal socket recvd: {}",
                String::from_utf8_lossy(&signal_buf[0..sz])
            );
        }
    }

    /// The entry point that executes all commands received by the daemon.
    fn exec_command(&mut self, command: Command) {
        match command {
            Command::Register(name, is_group, requester) => {
                self.engine.register(name, is_group, requester);
            }

            Command::Release(name, free_slot, requester) => {
                self.engine.release(name, requester, free_slot);
            }

            Command::Resolve(name, requester) => self.engine.resolve(name, requester),

            Command::NodeStatus(ip, requester) => self.engine.node_status(ip, requester),

            Command::SetPort(name, port, resp_s) => {
                let result = self.engine.set_port(name, port);
                if let Err(e) = resp_s.send(result) {
                    debug!("Failed to send set_port result: {}", e);
                }
            }

            Command::GetPort(name, resp_s) => {
                if let Err(e) = resp_s.send(self.engine.port(&name)) {
                    debug!("Failed to send port: {}", e);
                }
            }

            Command::ConfigChanged => {
                debug!("network configuration changed");
                self.check_ip_changes();
            }

            Command::GetMetrics(resp_s) => match resp_s.send(self.counters.clone()) {
                Ok(()) => trace!("Sent metrics to the client"),
                Err(e) => debug!("Failed to send metrics: {}", e),
            },

            Command::GetStatus(resp_s) => match resp_s.send(self.status.clone()) {
                Ok(()) => trace!("Sent status to the client"),
                Err(e) => debug!("Failed to send status: {}", e),
            },

            Command::Monitor(resp_s) => {
                self.monitors.push(resp_s);
            }

            Command::SetOption(daemon_opt) => {
                self.process_set_option(daemon_opt);
            }

            Command::Exit(_) => {
                debug!("unexpected command: {}", &command);
            }
        }
    }
}

/// Takes the whole seconds out of `carry`, leaving the fraction.
fn take_whole_secs(carry: &mut Duration) -> u32 {
    let secs = carry.as_secs();
    *carry -= Duration::from_secs(secs);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Some notable events from the daemon besides [`NameEvent`].
/// These events are expected to happen infrequently.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum DaemonEvent {
    /// Daemon encountered an error.
    Error(Error),

    /// Daemon detected a new IP address from the host.
    IpAdd(Ipv4Addr),

    /// Daemon detected a IP address removed from the host.
    IpDel(Ipv4Addr),

    /// A name is now registered on the adapter with this address.
    Registered(NbName, Ipv4Addr),

    /// Another host owns the name on the adapter with this address.
    NameConflict(NbName, Ipv4Addr),
}

/// Commands supported by the daemon
#[derive(Debug)]
enum Command {
    /// Register a name (name, is_group, requester)
    Register(NbName, bool, Requester),

    /// Release a name (name, free_slot, requester)
    Release(NbName, bool, Requester),

    /// Resolve a name to addresses.
    Resolve(NbName, Requester),

    /// Query the name table of a host.
    NodeStatus(Ipv4Addr, Requester),

    SetPort(NbName, u16, Sender<Result<()>>),

    GetPort(NbName, Sender<Option<u16>>),

    /// The interfaces of the host may have changed.
    ConfigChanged,

    /// Read the current values of the counters
    GetMetrics(Sender<Metrics>),

    /// Get the current status of the daemon.
    GetStatus(Sender<DaemonStatus>),

    /// Monitor noticable events in the daemon.
    Monitor(Sender<DaemonEvent>),

    SetOption(DaemonOption),

    Exit(Sender<DaemonStatus>),
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register(_, _, _) => write!(f, "Command Register"),
            Self::Release(_, _, _) => write!(f, "Command Release"),
            Self::Resolve(_, _) => write!(f, "Command Resolve"),
            Self::NodeStatus(_, _) => write!(f, "Command NodeStatus"),
            Self::SetPort(_, _, _) => write!(f, "Command SetPort"),
            Self::GetPort(_, _) => write!(f, "Command GetPort"),
            Self::ConfigChanged => write!(f, "Command ConfigChanged"),
            Self::Exit(_) => write!(f, "Command Exit"),
            Self::GetStatus(_) => write!(f, "Command GetStatus"),
            Self::GetMetrics(_) => write!(f, "Command GetMetrics"),
            Self::Monitor(_) => write!(f, "Command Monitor"),
            Self::SetOption(_) => write!(f, "Command SetOption"),
        }
    }
}

#[derive(Debug)]
enum DaemonOption {
    EnableInterface(Vec<IfKind>),
    DisableInterface(Vec<IfKind>),
    WinsServers(Vec<Ipv4Addr>),
}
