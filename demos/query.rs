//! A NetBIOS name query client.
//!
//! Run with:
//!
//!     cargo run --example query <name>
//!     cargo run --example query --status <ip>
//!
//! Example:
//!
//!     cargo run --example query FILESERVER<20>
//!
//! The first form resolves a name to an IPv4 address, the second one asks
//! a host for its name table.

use netbios_ns::{NameDaemon, NameEvent, NbName};
use std::net::Ipv4Addr;

fn main() {
    env_logger::builder().format_timestamp_millis().init();

    // Create a daemon
    let daemon = NameDaemon::new().expect("Failed to create daemon");

    let args: Vec<String> = std::env::args().collect();
    let receiver = match (args.get(1).map(String::as_str), args.get(2)) {
        (Some("--status"), Some(ip)) => {
            let Ok(ip) = ip.parse::<Ipv4Addr>() else {
                print_usage();
                return;
            };
            daemon.node_status(ip).expect("Failed to ask node status")
        }
        (Some(name), None) => {
            let name: NbName = match name.parse() {
                Ok(name) => name,
                Err(e) => {
                    println!("Invalid name: {}", e);
                    return;
                }
            };
            daemon.resolve(name).expect("Failed to resolve")
        }
        _ => {
            print_usage();
            return;
        }
    };

    let now = std::time::Instant::now();
    match receiver.recv() {
        Ok(NameEvent::Resolved(name, addrs)) => {
            println!("At {:?}: {} is at {:?}", now.elapsed(), name, addrs);
        }
        Ok(NameEvent::NodeStatus(ip, names)) => {
            println!("At {:?}: {} owns:", now.elapsed(), ip);
            for entry in names {
                let kind = if entry.is_group() { "GROUP" } else { "UNIQUE" };
                println!("    {} {}", entry.name, kind);
            }
        }
        Ok(other_event) => {
            println!("At {:?} : {:?}", now.elapsed(), &other_event);
        }
        Err(e) => println!("Daemon gone: {}", e),
    }

    daemon.shutdown().unwrap();
}

fn print_usage() {
    println!("Usage: cargo run --example query <name>");
    println!("       cargo run --example query --status <ip>");
    println!("Example: ");
    println!("cargo run --example query FILESERVER<20>");
}
