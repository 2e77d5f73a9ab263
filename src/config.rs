//! Daemon configuration and protocol timing constants.

use crate::nbns_parser::NBNS_PORT;
use std::{net::Ipv4Addr, time::Duration};

/// Wait for a conflict response after a broadcast registration.
///
/// B-nodes have no positive acknowledgement: silence means success.
pub const BCAST_REG_TIMEOUT_SECS: u32 = 1;

/// Wait for a WINS server to answer one registration frame.
pub const UCAST_REG_TIMEOUT_SECS: u32 = 2;

/// Resends of a unicast registration before giving up on the WINS servers.
pub const UCAST_REG_RETRIES: u32 = 2;

pub const BCAST_QUERY_TIMEOUT_SECS: u32 = 1;
pub const BCAST_QUERY_RETRIES: u32 = 2;

pub const UCAST_QUERY_TIMEOUT_SECS: u32 = 2;
pub const UCAST_QUERY_RETRIES: u32 = 2;

/// Wait for the current owner of a name to answer an end-node challenge query.
pub const CHALLENGE_TIMEOUT_SECS: u32 = 2;
pub const CHALLENGE_RETRIES: u32 = 2;

/// Resends of the registration that claims a name after a won challenge.
pub const CLAIM_RETRIES: u32 = 3;

/// How long a failed resolution answers negatively without asking the network again.
pub const NEG_CACHE_SECS: u32 = 5;

/// How long a released operation stays in the release state before it settles.
pub const RELEASE_HOLD_SECS: u32 = 1;

/// Lower bound of the refresh interval of a name registered with a WINS server.
pub const MIN_REFRESH_SECS: u32 = 60;

/// Wait for the reachability checks of the addresses of a resolved name.
pub const REACH_CHECK_SECS: u32 = 1;

/// Poll interval of running reachability checks.
pub const REACH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Max number of askers waiting on one unresolved name.
pub const MAX_WAITERS: usize = 8;

/// Max poll timeout of the daemon when no state machine is active.
pub const IDLE_WAKE: Duration = Duration::from_secs(5);

/// Interval to re-read the network interfaces of the host.
pub const IP_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// The TTL we ask for when registering a name, as RFC 1002 suggests: about 3.5 days.
pub const DEFAULT_TTL: u32 = 300_000;

/// Upper bound of how long a resolved name is cached.
pub const DEFAULT_MAX_CACHE_TTL: u32 = 600;

/// Configuration of a [`NameDaemon`](crate::NameDaemon) and its engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// UDP port of the name service (default: 137).
    pub port: u16,

    /// WINS servers for every adapter. An adapter with WINS servers is a
    /// H-node, otherwise a B-node (default: none).
    pub wins_servers: Vec<Ipv4Addr>,

    /// Max number of names owned by this host (default: 64).
    pub max_internal_names: usize,

    /// Max number of names being resolved or cached (default: 128).
    pub max_external_names: usize,

    /// Max number of adapters (default: 16).
    pub max_adapters: usize,

    /// Name suffixes that are never advertised on the wire (default: none).
    ///
    /// The wildcard name `*` is always local-only.
    pub local_only_suffixes: Vec<u8>,

    /// Resolve broadcast queries for foreign names on behalf of the asker
    /// (default: false).
    pub proxy: bool,

    /// TTL asked for in registration requests, in seconds (default: 300000).
    pub default_ttl: u32,

    /// Upper bound of how long a resolved name stays cached, in seconds (default: 600).
    pub max_cache_ttl: u32,

    /// When a name resolves to multiple addresses and none is on the same
    /// subnet, try a TCP connect to pick a reachable one (default: true).
    pub reachability_probe: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: NBNS_PORT,
            wins_servers: Vec::new(),
            max_internal_names: 64,
            max_external_names: 128,
            max_adapters: 16,
            local_only_suffixes: Vec::new(),
            proxy: false,
            default_ttl: DEFAULT_TTL,
            max_cache_ttl: DEFAULT_MAX_CACHE_TTL,
            reachability_probe: true,
        }
    }
}

impl DaemonConfig {
    /// Create a builder for `DaemonConfig`.
    pub fn builder() -> DaemonConfigBuilder {
        DaemonConfigBuilder::default()
    }

    /// Returns true if names with `suffix` must not be sent on the wire.
    pub fn is_local_only_suffix(&self, suffix: u8) -> bool {
        self.local_only_suffixes.contains(&suffix)
    }
}

/// Builder for `DaemonConfig`
///
/// ```
/// use netbios_ns::DaemonConfig;
/// use std::net::Ipv4Addr;
///
/// let config = DaemonConfig::builder()
///     .port(10137)
///     .wins_server(Ipv4Addr::new(192, 168, 1, 2))
///     .max_internal_names(8)
///     .build();
/// assert_eq!(config.wins_servers.len(), 1);
/// ```
#[derive(Default)]
#[must_use]
pub struct DaemonConfigBuilder {
    config: DaemonConfig,
}

impl DaemonConfigBuilder {
    /// The UDP port to listen and send on.
    ///
    /// Default: 137. Binding it usually needs privileges.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Adds one WINS server. Servers are tried in the order they were added.
    pub fn wins_server(mut self, server: Ipv4Addr) -> Self {
        self.config.wins_servers.push(server);
        self
    }

    /// Replaces the WINS server list.
    pub fn wins_servers(mut self, servers: Vec<Ipv4Addr>) -> Self {
        self.config.wins_servers = servers;
        self
    }

    pub fn max_internal_names(mut self, max: usize) -> Self {
        self.config.max_internal_names = max;
        self
    }

    pub fn max_external_names(mut self, max: usize) -> Self {
        self.config.max_external_names = max;
        self
    }

    pub fn max_adapters(mut self, max: usize) -> Self {
        self.config.max_adapters = max;
        self
    }

    /// Names with this suffix are registered locally but never advertised.
    pub fn local_only_suffix(mut self, suffix: u8) -> Self {
        self.config.local_only_suffixes.push(suffix);
        self
    }

    /// Enable or disable answering broadcast queries on behalf of names
    /// resolved through a WINS server.
    ///
    /// Default: false
    pub fn proxy(mut self, enabled: bool) -> Self {
        self.config.proxy = enabled;
        self
    }

    /// TTL in seconds asked for in registration requests.
    pub fn default_ttl(mut self, ttl: u32) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    /// Upper bound in seconds of the cached lifetime of a resolved name.
    pub fn max_cache_ttl(mut self, ttl: u32) -> Self {
        self.config.max_cache_ttl = ttl;
        self
    }

    pub fn reachability_probe(mut self, enabled: bool) -> Self {
        self.config.reachability_probe = enabled;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> DaemonConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::{DaemonConfig, DEFAULT_TTL};
    use std::net::Ipv4Addr;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.port, 137);
        assert!(config.wins_servers.is_empty());
        assert_eq!(config.default_ttl, DEFAULT_TTL);
        assert!(!config.proxy);
        assert!(config.reachability_probe);
    }

    #[test]
    fn test_builder() {
        let config = DaemonConfig::builder()
            .port(5137)
            .wins_server(Ipv4Addr::new(10, 0, 0, 1))
            .wins_server(Ipv4Addr::new(10, 0, 0, 2))
            .local_only_suffix(0x1f)
            .proxy(true)
            .max_adapters(2)
            .build();

        assert_eq!(config.port, 5137);
        assert_eq!(
            config.wins_servers,
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
        );
        assert!(config.is_local_only_suffix(0x1f));
        assert!(!config.is_local_only_suffix(0x20));
        assert!(config.proxy);
        assert_eq!(config.max_adapters, 2);
    }
}
