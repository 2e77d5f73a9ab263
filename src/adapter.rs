//! Local network adapters the name service runs on.
//!
//! [AdapterRegistry] keeps one [Adapter] per IPv4 address of the host in a
//! slot table with a free-list, so an [AdapterId] stays valid for as long as
//! its address exists and freed slots are reused.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    nbns_parser::{NB_FLAGS_ONT_B, NB_FLAGS_ONT_H},
    Error, Result,
};
use if_addrs::{IfAddr, Interface};
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
};

/// Identifier of an adapter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AdapterId(u16);

impl AdapterId {
    /// The loopback pseudo-adapter, used for traffic that matches no real
    /// adapter. Nothing is ever sent on the wire through it.
    pub const INTERNAL: AdapterId = AdapterId(u16::MAX);

    #[inline]
    pub const fn is_internal(&self) -> bool {
        self.0 == u16::MAX
    }

    #[inline]
    const fn slot(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_internal() {
            write!(f, "adapter#internal")
        } else {
            write!(f, "adapter#{}", self.0)
        }
    }
}

/// How names are registered and resolved on an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// B-node: broadcast only.
    Broadcast,

    /// H-node: WINS server first, broadcast as fallback.
    Hybrid,
}

/// The platform view of one IPv4 interface, before it gets a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSpec {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub mac: [u8; 6],
}

impl AdapterSpec {
    /// Creates a spec with the directed broadcast address of `ip/netmask`.
    pub fn new(name: &str, ip: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            name: name.to_string(),
            ip,
            netmask,
            broadcast: directed_broadcast(ip, netmask),
            mac: [0; 6],
        }
    }

    /// Sets the hardware address, reported in node status answers.
    pub fn with_mac(mut self, mac: [u8; 6]) -> Self {
        self.mac = mac;
        self
    }

    /// Converts an interface from `if_addrs`. Loopback and IPv6 interfaces
    /// are never adapters.
    pub fn from_interface(intf: &Interface) -> Option<Self> {
        if intf.is_loopback() {
            return None;
        }

        match &intf.addr {
            IfAddr::V4(v4) => Some(Self {
                name: intf.name.clone(),
                ip: v4.ip,
                netmask: v4.netmask,
                broadcast: v4
                    .broadcast
                    .unwrap_or_else(|| directed_broadcast(v4.ip, v4.netmask)),
                mac: interface_mac(&intf.name).unwrap_or([0; 6]),
            }),
            IfAddr::V6(_) => None,
        }
    }
}

/// One local network adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adapter {
    pub id: AdapterId,
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub wins: Vec<Ipv4Addr>,
    pub mode: NodeMode,
    pub mac: [u8; 6],
}

impl Adapter {
    fn new(id: AdapterId, spec: AdapterSpec, wins: &[Ipv4Addr]) -> Self {
        let mut adapter = Self {
            id,
            name: spec.name,
            ip: spec.ip,
            netmask: spec.netmask,
            broadcast: spec.broadcast,
            wins: Vec::new(),
            mode: NodeMode::Broadcast,
            mac: spec.mac,
        };
        adapter.set_wins(wins);
        adapter
    }

    fn set_wins(&mut self, wins: &[Ipv4Addr]) {
        self.wins = wins.to_vec();
        self.mode = if self.wins.is_empty() {
            NodeMode::Broadcast
        } else {
            NodeMode::Hybrid
        };
    }

    #[inline]
    pub fn is_broadcast_mode(&self) -> bool {
        self.mode == NodeMode::Broadcast
    }

    /// Returns true if `addr` is in the same network of this adapter.
    pub fn same_subnet(&self, addr: Ipv4Addr) -> bool {
        let netmask = u32::from(self.netmask);
        u32::from(self.ip) & netmask == u32::from(addr) & netmask
    }

    /// The owner node type bits of NB_FLAGS for names registered on this adapter.
    pub fn ont_flags(&self) -> u16 {
        match self.mode {
            NodeMode::Broadcast => NB_FLAGS_ONT_B,
            NodeMode::Hybrid => NB_FLAGS_ONT_H,
        }
    }
}

fn directed_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// What changed in one [AdapterRegistry::reload].
#[derive(Debug, Default)]
pub struct ReloadOutcome {
    pub added: Vec<AdapterId>,
    pub removed: Vec<Adapter>,
    pub kept: Vec<AdapterId>,
}

impl ReloadOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The table of current adapters.
#[derive(Debug)]
pub struct AdapterRegistry {
    slots: Vec<Option<Adapter>>,

    /// Indexes of empty slots, reused before the table grows.
    free: Vec<usize>,

    capacity: usize,

    /// WINS servers applied to every adapter.
    wins: Vec<Ipv4Addr>,
}

impl AdapterRegistry {
    pub fn new(capacity: usize, wins: Vec<Ipv4Addr>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity: capacity.min(u16::MAX as usize),
            wins,
        }
    }

    /// Replaces the table with `specs`.
    ///
    /// Entries are matched by (ip, broadcast): matched entries keep their id
    /// and get their WINS list refreshed, unmatched old entries are removed,
    /// and new ones are inserted into free slots. If the new set does not fit
    /// in the table, nothing changes and `CapacityExceeded` is returned.
    pub fn reload(&mut self, specs: Vec<AdapterSpec>) -> Result<ReloadOutcome> {
        let mut unique: Vec<AdapterSpec> = Vec::with_capacity(specs.len());
        for spec in specs {
            if !unique
                .iter()
                .any(|s| s.ip == spec.ip && s.broadcast == spec.broadcast)
            {
                unique.push(spec);
            }
        }

        if unique.len() > self.capacity {
            debug!(
                "reload: {} adapters exceed capacity {}",
                unique.len(),
                self.capacity
            );
            return Err(Error::CapacityExceeded);
        }

        let mut outcome = ReloadOutcome::default();

        // Remove old entries not present any more.
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let gone = match slot {
                Some(adapter) => !unique
                    .iter()
                    .any(|s| s.ip == adapter.ip && s.broadcast == adapter.broadcast),
                None => false,
            };
            if gone {
                if let Some(adapter) = slot.take() {
                    debug!("reload: remove {} {}", adapter.id, adapter.ip);
                    outcome.removed.push(adapter);
                    self.free.push(i);
                }
            }
        }

        for spec in unique {
            let existing = self.slots.iter_mut().flatten().find(|a| {
                a.ip == spec.ip && a.broadcast == spec.broadcast
            });

            match existing {
                Some(adapter) => {
                    adapter.name = spec.name;
                    adapter.netmask = spec.netmask;
                    adapter.mac = spec.mac;
                    adapter.set_wins(&self.wins);
                    outcome.kept.push(adapter.id);
                }
                None => {
                    let slot = match self.free.pop() {
                        Some(i) => i,
                        None => {
                            self.slots.push(None);
                            self.slots.len() - 1
                        }
                    };
                    let id = AdapterId(slot as u16);
                    debug!("reload: add {} {} ({})", id, spec.ip, spec.name);
                    self.slots[slot] = Some(Adapter::new(id, spec, &self.wins));
                    outcome.added.push(id);
                }
            }
        }

        trace!(
            "reload: {} added {} removed {} kept",
            outcome.added.len(),
            outcome.removed.len(),
            outcome.kept.len()
        );
        Ok(outcome)
    }

    /// Returns the ids of all current adapters in slot order.
    ///
    /// The result is a snapshot: changes to the table do not affect it.
    pub fn snapshot(&self) -> Vec<AdapterId> {
        self.iter().map(|a| a.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Adapter> {
        self.slots.iter().flatten()
    }

    pub fn get(&self, id: AdapterId) -> Option<&Adapter> {
        if id.is_internal() {
            return None;
        }
        self.slots.get(id.slot()).and_then(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// A host with more than one adapter registers names as multi-homed.
    pub fn is_multi_homed(&self) -> bool {
        self.len() > 1
    }

    /// Finds the adapter whose directed broadcast address matches `ip` under
    /// its own netmask, i.e. the adapter on the subnet of `ip`.
    ///
    /// Returns [`AdapterId::INTERNAL`] if no adapter matches.
    pub fn find_by_destination_ip(&self, ip: Ipv4Addr) -> AdapterId {
        self.iter()
            .find(|a| directed_broadcast(ip, a.netmask) == a.broadcast)
            .map(|a| a.id)
            .unwrap_or(AdapterId::INTERNAL)
    }

    pub fn same_subnet(&self, id: AdapterId, ip: Ipv4Addr) -> bool {
        self.get(id).map(|a| a.same_subnet(ip)).unwrap_or(false)
    }

    /// Returns true if `ip` is one of our own addresses.
    pub fn is_local_ip(&self, ip: Ipv4Addr) -> bool {
        ip.is_loopback() || self.iter().any(|a| a.ip == ip)
    }

    pub fn wins_servers(&self) -> &[Ipv4Addr] {
        &self.wins
    }

    /// Sets the WINS servers of every adapter, which also decides its mode.
    pub fn set_wins_servers(&mut self, wins: Vec<Ipv4Addr>) {
        self.wins = wins;
        for adapter in self.slots.iter_mut().flatten() {
            adapter.set_wins(&self.wins);
        }
    }
}

/// Specify kinds of interfaces. It is used to enable or to disable interfaces in the daemon.
///
/// Note that for ergonomic reasons, `From<&str>` and `From<IpAddr>` are implemented.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum IfKind {
    /// All interfaces.
    All,

    /// By the interface name, for example "en0"
    Name(String),

    /// By an IPv4 address.
    Addr(IpAddr),
}

impl IfKind {
    /// Checks if `spec` matches with this interface kind.
    fn matches(&self, spec: &AdapterSpec) -> bool {
        match self {
            Self::All => true,
            Self::Name(ifname) => ifname == &spec.name,
            Self::Addr(addr) => addr == &IpAddr::V4(spec.ip),
        }
    }
}

/// The first use case of specifying an interface was to
/// use an interface name. Hence adding this for ergonomic reasons.
impl From<&str> for IfKind {
    fn from(val: &str) -> Self {
        Self::Name(val.to_string())
    }
}

impl From<&String> for IfKind {
    fn from(val: &String) -> Self {
        Self::Name(val.to_string())
    }
}

impl From<IpAddr> for IfKind {
    fn from(val: IpAddr) -> Self {
        Self::Addr(val)
    }
}

impl From<Ipv4Addr> for IfKind {
    fn from(val: Ipv4Addr) -> Self {
        Self::Addr(IpAddr::V4(val))
    }
}

/// A list of `IfKind` that can be used to match interfaces.
pub struct IfKindVec {
    pub(crate) kinds: Vec<IfKind>,
}

/// A trait that converts a type into a Vec of `IfKind`.
pub trait IntoIfKindVec {
    fn into_vec(self) -> IfKindVec;
}

impl<T: Into<IfKind>> IntoIfKindVec for T {
    fn into_vec(self) -> IfKindVec {
        let if_kind: IfKind = self.into();
        IfKindVec {
            kinds: vec![if_kind],
        }
    }
}

impl<T: Into<IfKind>> IntoIfKindVec for Vec<T> {
    fn into_vec(self) -> IfKindVec {
        let kinds: Vec<IfKind> = self.into_iter().map(|x| x.into()).collect();
        IfKindVec { kinds }
    }
}

/// Selection of interfaces.
#[derive(Debug, Clone)]
pub(crate) struct IfSelection {
    /// The interfaces to be selected.
    pub(crate) if_kind: IfKind,

    /// Whether the `if_kind` should be enabled or not.
    pub(crate) selected: bool,
}

/// Applies all selections in order to `specs` and returns the selected ones.
/// All interfaces are enabled by default, and the last matching selection wins.
pub(crate) fn apply_selections(
    specs: Vec<AdapterSpec>,
    selections: &[IfSelection],
) -> Vec<AdapterSpec> {
    specs
        .into_iter()
        .filter(|spec| {
            selections
                .iter()
                .filter(|s| s.if_kind.matches(spec))
                .last()
                .map(|s| s.selected)
                .unwrap_or(true)
        })
        .collect()
}

/// Returns valid IPv4 network interfaces in the host system.
/// Loopback interfaces are excluded.
pub(crate) fn my_ipv4_interfaces() -> Vec<AdapterSpec> {
    if_addrs::get_if_addrs()
        .unwrap_or_default()
        .iter()
        .filter_map(AdapterSpec::from_interface)
        .collect()
}

/// The hardware address of the interface `name`, from sysfs.
#[cfg(target_os = "linux")]
fn interface_mac(name: &str) -> Option<[u8; 6]> {
    let path = format!("/sys/class/net/{}/address", name);
    match std::fs::read_to_string(&path) {
        Ok(text) => parse_mac(text.trim()),
        Err(e) => {
            trace!("no hardware address for {}: {}", name, e);
            None
        }
    }
}

/// Hardware addresses are only read on Linux, elsewhere the unit ID is zero.
#[cfg(not(target_os = "linux"))]
fn interface_mac(_name: &str) -> Option<[u8; 6]> {
    None
}

/// Parses `aa:bb:cc:dd:ee:ff`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = text.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::{
        apply_selections, parse_mac, AdapterId, AdapterRegistry, AdapterSpec, IfKind,
        IfSelection, NodeMode,
    };
    use crate::Error;
    use std::net::Ipv4Addr;
    use test_log::test;

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("00:1a:2B:3c:4d:ff"),
            Some([0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0xff])
        );
        assert_eq!(parse_mac("00:1a:2b:3c:4d"), None);
        assert_eq!(parse_mac("00:1a:2b:3c:4d:5e:6f"), None);
        assert_eq!(parse_mac("00:1a:2b:3c:4d:zz"), None);
        assert_eq!(parse_mac(""), None);
    }

    #[test]
    fn test_mac_carried_into_adapter() {
        let mac = [0x02, 0, 0, 0, 0, 0x01];
        let mut registry = AdapterRegistry::new(4, vec![]);
        registry
            .reload(vec![spec("eth0", [192, 168, 1, 2]).with_mac(mac)])
            .unwrap();
        let id = registry.snapshot()[0];
        assert_eq!(registry.get(id).unwrap().mac, mac);
    }

    fn spec(name: &str, ip: [u8; 4]) -> AdapterSpec {
        AdapterSpec::new(name, Ipv4Addr::from(ip), Ipv4Addr::new(255, 255, 255, 0))
    }

    #[test]
    fn test_broadcast_addr() {
        let s = spec("eth0", [192, 168, 1, 20]);
        assert_eq!(s.broadcast, Ipv4Addr::new(192, 168, 1, 255));

        let s = AdapterSpec::new(
            "eth1",
            Ipv4Addr::new(10, 1, 2, 3),
            Ipv4Addr::new(255, 0, 0, 0),
        );
        assert_eq!(s.broadcast, Ipv4Addr::new(10, 255, 255, 255));
    }

    #[test]
    fn test_reload_diff_and_slot_reuse() {
        let mut registry = AdapterRegistry::new(4, vec![]);
        let outcome = registry
            .reload(vec![spec("eth0", [192, 168, 1, 2]), spec("eth1", [10, 0, 0, 2])])
            .unwrap();
        assert_eq!(outcome.added.len(), 2);
        assert_eq!(registry.len(), 2);
        let ids = registry.snapshot();
        let eth0 = ids[0];
        let eth1 = ids[1];

        // eth1 goes away, eth2 shows up in its slot.
        let outcome = registry
            .reload(vec![spec("eth0", [192, 168, 1, 2]), spec("eth2", [172, 16, 0, 2])])
            .unwrap();
        assert_eq!(outcome.kept, vec![eth0]);
        assert_eq!(outcome.removed.len(), 1);
        assert_eq!(outcome.removed[0].id, eth1);
        assert_eq!(outcome.added, vec![eth1]);
        assert_eq!(
            registry.get(eth1).unwrap().ip,
            Ipv4Addr::new(172, 16, 0, 2)
        );

        // No change.
        let outcome = registry
            .reload(vec![spec("eth0", [192, 168, 1, 2]), spec("eth2", [172, 16, 0, 2])])
            .unwrap();
        assert!(outcome.is_unchanged());
    }

    #[test]
    fn test_reload_capacity() {
        let mut registry = AdapterRegistry::new(1, vec![]);
        registry.reload(vec![spec("eth0", [192, 168, 1, 2])]).unwrap();
        let result = registry.reload(vec![
            spec("eth0", [192, 168, 1, 2]),
            spec("eth1", [10, 0, 0, 2]),
        ]);
        assert_eq!(result.unwrap_err(), Error::CapacityExceeded);
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.iter().next().unwrap().ip,
            Ipv4Addr::new(192, 168, 1, 2)
        );
    }

    #[test]
    fn test_find_by_destination_ip() {
        let mut registry = AdapterRegistry::new(4, vec![]);
        registry
            .reload(vec![spec("eth0", [192, 168, 1, 2]), spec("eth1", [10, 0, 0, 2])])
            .unwrap();
        let ids = registry.snapshot();

        assert_eq!(
            registry.find_by_destination_ip(Ipv4Addr::new(10, 0, 0, 77)),
            ids[1]
        );
        assert_eq!(
            registry.find_by_destination_ip(Ipv4Addr::new(192, 168, 1, 255)),
            ids[0]
        );
        assert_eq!(
            registry.find_by_destination_ip(Ipv4Addr::new(8, 8, 8, 8)),
            AdapterId::INTERNAL
        );
        assert!(registry.get(AdapterId::INTERNAL).is_none());
        assert!(registry.same_subnet(ids[0], Ipv4Addr::new(192, 168, 1, 100)));
        assert!(!registry.same_subnet(ids[0], Ipv4Addr::new(10, 0, 0, 100)));
        assert!(registry.is_local_ip(Ipv4Addr::new(10, 0, 0, 2)));
        assert!(!registry.is_local_ip(Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[test]
    fn test_wins_sets_mode() {
        let mut registry = AdapterRegistry::new(4, vec![]);
        registry.reload(vec![spec("eth0", [192, 168, 1, 2])]).unwrap();
        let id = registry.snapshot()[0];
        assert_eq!(registry.get(id).unwrap().mode, NodeMode::Broadcast);

        registry.set_wins_servers(vec![Ipv4Addr::new(192, 168, 1, 1)]);
        assert_eq!(registry.get(id).unwrap().mode, NodeMode::Hybrid);

        registry.set_wins_servers(vec![]);
        assert!(registry.get(id).unwrap().is_broadcast_mode());
    }

    #[test]
    fn test_if_selections() {
        let specs = vec![spec("eth0", [192, 168, 1, 2]), spec("eth1", [10, 0, 0, 2])];

        let selections = vec![
            IfSelection {
                if_kind: IfKind::All,
                selected: false,
            },
            IfSelection {
                if_kind: IfKind::from("eth1"),
                selected: true,
            },
        ];
        let selected = apply_selections(specs.clone(), &selections);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "eth1");

        let selections = vec![IfSelection {
            if_kind: IfKind::from(Ipv4Addr::new(192, 168, 1, 2)),
            selected: false,
        }];
        let selected = apply_selections(specs, &selections);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "eth1");
    }
}
