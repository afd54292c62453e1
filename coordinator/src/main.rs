// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Coordinator CLI entry point
//!
//! Listens for a capture agent and turns each line read from stdin into a
//! screenshot request:
//!
//! ```text
//! <tag> <class> <method> [orientation]
//! ```

use std::io::{self, BufRead};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use clap::{Arg, ArgAction, Command};
use log::{LevelFilter, error, info};
use simple_logger::SimpleLogger;

use shutter_coordinator::{Coordinator, CoordinatorConfig};
use shutter_protocol::Orientation;

struct RequestLine {
    tag: String,
    class_name: String,
    method_name: String,
    orientation: Orientation,
}

fn parse_request_line(line: &str) -> anyhow::Result<RequestLine> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let (tag, class_name, method_name, orientation) = match fields.as_slice() {
        [tag, class, method] => (tag, class, method, Orientation::default()),
        [tag, class, method, orientation] => (tag, class, method, orientation.parse()?),
        _ => bail!("expected `<tag> <class> <method> [orientation]`"),
    };
    Ok(RequestLine {
        tag: (*tag).to_string(),
        class_name: (*class_name).to_string(),
        method_name: (*method_name).to_string(),
        orientation,
    })
}

fn main() -> anyhow::Result<()> {
    let matches = Command::new("shutter-coordinator")
        .version("0.1.0")
        .author("Shutter Authors")
        .about("Publishes screenshot requests to a connected capture agent")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDR")
                .help("Address to listen on"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("Port to listen on (0 picks a free port)"),
        )
        .arg(
            Arg::new("timeout-ms")
                .short('t')
                .long("timeout-ms")
                .value_name("MS")
                .value_parser(clap::value_parser!(u64))
                .help("How long each request may take"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .map_err(|e| anyhow!("failed to initialise logging: {e}"))?;

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => CoordinatorConfig::from_file(path)?,
        None => CoordinatorConfig::default(),
    };
    if let Some(bind) = matches.get_one::<String>("bind") {
        config.bind_address.clone_from(bind);
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }
    if let Some(timeout) = matches.get_one::<u64>("timeout-ms") {
        config.request_timeout_ms = *timeout;
    }

    info!("Starting shutter-coordinator with config: {config:?}");
    let coordinator = Coordinator::bind(config).context("failed to start coordinator")?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to install Ctrl+C handler")?;

    // Stdin blocks; read it on its own thread so Ctrl+C is noticed promptly.
    let (tx, rx) = flume::unbounded::<String>();
    thread::Builder::new()
        .name("shutter-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;

    info!("Reading requests from stdin, press Ctrl+C to stop");

    while running.load(Ordering::SeqCst) {
        let line = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => line,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let request = match parse_request_line(line) {
            Ok(request) => request,
            Err(e) => {
                error!("Ignoring {line:?}: {e}");
                continue;
            }
        };

        match coordinator.request_tagged(
            &request.tag,
            &request.class_name,
            &request.method_name,
            request.orientation,
        ) {
            Ok(name) => println!("{name}"),
            Err(e) => error!("Screenshot {} failed: {e}", request.tag),
        }
    }

    info!("Stopping shutter-coordinator...");
    coordinator.shutdown();
    Ok(())
}
