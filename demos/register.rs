//! Registers a NetBIOS name.
//!
//! Run with:
//!
//! cargo run --example register <name> [options]
//!
//! Example:
//!
//! cargo run --example register MYHOST<20>
//!
//! Options:
//! "--release": automatically release the name after 2 seconds.
//! "--group": register a group name instead of a unique one.
//! "--wins <ip>": register with a WINS server instead of broadcasting.
//! "--port <port>": use another name service port than 137.
//! "--logfile": write debug log to a file instead of stderr.
//!
//! For example: to see the debug log, set the RUST_LOG environment variable and write a logfile:
//!
//! RUST_LOG=netbios_ns=debug cargo run --example register MYHOST --port 10137 --logfile

use netbios_ns::{DaemonConfig, DaemonEvent, NameDaemon, NameEvent, NbName};
use std::{
    env, fs::File, net::Ipv4Addr, thread, time::Duration, time::SystemTime, time::UNIX_EPOCH,
};

fn main() {
    // Simple command line options.
    let args: Vec<String> = env::args().collect();
    let mut should_release = false;
    let mut is_group = false;
    let mut use_logfile = false;
    let mut config = DaemonConfig::builder();

    let mut iter = args.iter().skip(2);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--release" => should_release = true,
            "--group" => is_group = true,
            "--logfile" => use_logfile = true,
            "--wins" => {
                let Some(ip) = iter.next().and_then(|s| s.parse::<Ipv4Addr>().ok()) else {
                    print_usage();
                    return;
                };
                config = config.wins_server(ip);
            }
            "--port" => {
                let Some(port) = iter.next().and_then(|s| s.parse::<u16>().ok()) else {
                    print_usage();
                    return;
                };
                config = config.port(port);
            }
            _ => {}
        }
    }

    // setup env_logger
    let mut builder = env_logger::Builder::from_default_env();
    if use_logfile {
        let now = SystemTime::now();
        let duration = now
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards: failed to get UNIX timestamp");
        let log_filename = format!("nbns-register-{}.log", duration.as_secs());
        let file = File::create(&log_filename).unwrap();
        builder.target(env_logger::Target::Pipe(Box::new(file)));
        println!("Logging to file: {}\n", log_filename);
    }

    // more precise timestamp.
    builder.format_timestamp_millis().init();

    let name: NbName = match args.get(1).map(|arg| arg.parse()) {
        Some(Ok(name)) => name,
        Some(Err(e)) => {
            println!("Invalid name: {}", e);
            return;
        }
        None => {
            print_usage();
            return;
        }
    };

    // Create a new name service daemon.
    let daemon = NameDaemon::with_config(config.build()).expect("Could not create name daemon");

    // Optionally, we can monitor the daemon events.
    let monitor = daemon.monitor().expect("Failed to monitor the daemon");

    let receiver = daemon
        .register(name, is_group)
        .expect("Failed to register the name");
    match receiver.recv() {
        Ok(NameEvent::Registered(name)) => println!("Registered {}", name),
        Ok(other) => {
            println!("Registration failed: {:?}", other);
            return;
        }
        Err(e) => {
            println!("Daemon gone: {}", e);
            return;
        }
    }

    if should_release {
        let wait_in_secs = 2;
        println!("Sleeping {} seconds before release", wait_in_secs);
        thread::sleep(Duration::from_secs(wait_in_secs));

        let receiver = daemon.release(name, false).unwrap();
        while let Ok(event) = receiver.recv() {
            println!("release result: {:?}", &event);
        }
        daemon.shutdown().unwrap();
    } else {
        // Monitor the daemon events.
        while let Ok(event) = monitor.recv() {
            println!("Daemon event: {:?}", &event);
            if let DaemonEvent::NameConflict(name, ip) = event {
                println!("Lost {} on {}", name, ip);
                break;
            }
        }
    }
}

fn print_usage() {
    println!("Usage:");
    println!("cargo run --example register <name> [options]");
    println!("\nOptions:\n");
    println!("--release: automatically release the name after 2 seconds");
    println!("--group: register a group name.");
    println!("--wins <ip>: register with a WINS server.");
    println!("--port <port>: the name service port, 137 by default.");
    println!("--logfile: write debug log to a file instead of stderr. The logfile is named 'nbns-register-<timestamp>.log'.");
    println!();
    println!("A name may carry its suffix in hex, e.g. MYHOST<20>.");
    println!();
    println!("To see the debug log, set the RUST_LOG environment variable and write a logfile:");
    println!("RUST_LOG=netbios_ns=debug cargo run --example register MYHOST --port 10137 --logfile");
}
