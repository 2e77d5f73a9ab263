//! A small and safe library for the NetBIOS-over-TCP/IP name service (NBNS).
//!
//! This library creates one new thread to run a name service daemon, and
//! exposes its API that interacts with the daemon via a
//! [`flume`](https://crates.io/crates/flume) channel. The channel supports
//! both `recv()` and `recv_async()`.
//!
//! For example, a client registering a name behaves like this:
//!```text
//!  Client       <channel>       NBNS daemon thread
//!    |                             | starts its run-loop.
//!    |       --- Register -->      |
//!    |                             | broadcasts registration (B-node)
//!    |                             | or asks the WINS servers (H-node)
//!    |                             | no conflict within the timeout
//!    |       <-- Registered --     |
//!    |           ...               | defends the name, refreshes it
//!    |       --- Release -->       |
//!    |                             | releases the name on the wire
//!    |       <-- Released --       |
//!```
//! All commands in the public API are sent to the daemon using the unblocking `try_send()`
//! so that the caller can use it with both sync and async code, with no dependency on any
//! particular async runtimes.
//!
//! # Usage
//!
//! The user starts with creating a daemon by calling [`NameDaemon::new()`] or
//! [`NameDaemon::with_config()`]. Then the user would call
//! [`register`](`NameDaemon::register`) to own a name on the network, and
//! [`resolve`](`NameDaemon::resolve`) to find the address of a name owned by
//! another host. The daemon type can be cloned and passed around between threads.
//!
//! ## Example: resolve a name.
//!
//! ```no_run
//! use netbios_ns::{NameDaemon, NameEvent, NbName};
//!
//! // Create a daemon
//! let daemon = NameDaemon::new().expect("Failed to create daemon");
//!
//! // Resolve the file server name of a host.
//! let name: NbName = "FILESERVER<20>".parse().expect("invalid name");
//! let receiver = daemon.resolve(name).expect("Failed to resolve");
//!
//! match receiver.recv() {
//!     Ok(NameEvent::Resolved(name, addrs)) => println!("{} is at {:?}", name, addrs),
//!     Ok(other) => println!("Received other event: {:?}", other),
//!     Err(e) => println!("daemon gone: {}", e),
//! }
//! ```
//!
//! ## Example: own a name on the network.
//!
//! ```no_run
//! use netbios_ns::{DaemonConfig, NameDaemon, NameEvent, NbName};
//! use std::net::Ipv4Addr;
//!
//! // Register through a WINS server instead of broadcasting.
//! let config = DaemonConfig::builder()
//!     .wins_server(Ipv4Addr::new(192, 168, 1, 2))
//!     .build();
//! let daemon = NameDaemon::with_config(config).expect("Failed to create daemon");
//!
//! let name = NbName::new("MYHOST", 0x20).expect("invalid name");
//! let receiver = daemon.register(name, false).expect("Failed to register");
//! if let Ok(NameEvent::Registered(name)) = receiver.recv() {
//!     println!("{} is ours", name);
//! }
//!
//! // Gracefully shutdown the daemon, which releases the name.
//! std::thread::sleep(std::time::Duration::from_secs(1));
//! daemon.shutdown().unwrap();
//! ```
//!
//! The protocol state machines live in [`NsEngine`], which does no I/O of its
//! own. It can be driven directly, e.g. to test a name service scenario
//! without any network.

#![forbid(unsafe_code)]
#![allow(clippy::single_component_path_imports)]

// log for logging (optional).
#[cfg(feature = "logging")]
use log;

#[cfg(not(feature = "logging"))]
#[macro_use]
mod log {
    macro_rules! trace {
        ($($arg:expr),*) => {
            {
                let _ = ($($arg),*); // avoid warnings about unused variables.
            }
        };
    }

    macro_rules! debug {
        ($($arg:expr),*) => {
            {
                let _ = ($($arg),*);
            }
        };
    }

    #[allow(unused_macros)]
    macro_rules! info {
        ($($arg:expr),*) => {
            {
                let _ = ($($arg),*);
            }
        };
    }

    #[allow(unused_macros)]
    macro_rules! error {
        ($($arg:expr),*) => {
            {
                let _ = ($($arg),*);
            }
        };
    }
}

/// A simple macro to report all kinds of errors.
macro_rules! e_fmt {
  ($($arg:tt)+) => {
      Error::Msg(format!($($arg)+))
  };
}

mod adapter;
mod config;
mod engine;
mod error;
mod external_name;
mod internal_name;
mod name_daemon;
mod nbns_parser;

pub use adapter::{
    Adapter, AdapterId, AdapterRegistry, AdapterSpec, IfKind, IfKindVec, IntoIfKindVec,
    NodeMode, ReloadOutcome,
};
pub use config::{
    DaemonConfig, DaemonConfigBuilder, BCAST_QUERY_RETRIES, BCAST_QUERY_TIMEOUT_SECS,
    BCAST_REG_TIMEOUT_SECS, CHALLENGE_RETRIES, CHALLENGE_TIMEOUT_SECS, CLAIM_RETRIES,
    DEFAULT_MAX_CACHE_TTL, DEFAULT_TTL, IDLE_WAKE, IP_CHECK_INTERVAL, MAX_WAITERS,
    MIN_REFRESH_SECS, NEG_CACHE_SECS, REACH_CHECK_SECS, REACH_POLL_INTERVAL,
    RELEASE_HOLD_SECS, UCAST_QUERY_RETRIES, UCAST_QUERY_TIMEOUT_SECS, UCAST_REG_RETRIES,
    UCAST_REG_TIMEOUT_SECS,
};
pub use engine::{NameEvent, NsEngine, Outgoing, Requester, TranRange};
pub use error::{Error, Result};
pub use external_name::{QueryState, Reachability, TcpProbe};
pub use internal_name::OperationState;
pub use name_daemon::{DaemonEvent, DaemonStatus, Metrics, NameDaemon};
pub use nbns_parser::{
    NbAddrEntry, NbName, NodeStatusEntry, NsIncoming, NsOutgoing, NsQuestion, NsRecord, Opcode,
    RData, RRType, Rcode, FLAGS_B, FLAGS_RA, NBNS_PORT, NB_FLAGS_GROUP, NB_FLAGS_ONT_B,
    NB_FLAGS_ONT_H,
};

/// Re-export from `flume`.
pub use flume::Receiver;
