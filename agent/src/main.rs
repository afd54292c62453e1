// Copyright 2024 Shutter Authors
// SPDX-License-Identifier: Apache-2.0

//! Capture Agent CLI entry point
//!
//! Connects to a coordinator and stores the screenshots it asks for.

use std::path::PathBuf;

use anyhow::{Context, anyhow};
use clap::{Arg, ArgAction, Command};
use log::{LevelFilter, info};
use simple_logger::SimpleLogger;

use shutter_agent::{Agent, AgentConfig, CaptureSource};

fn main() -> anyhow::Result<()> {
    let matches = Command::new("shutter-agent")
        .version("0.1.0")
        .author("Shutter Authors")
        .about("Capture agent for shutter screenshot requests")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("host")
                .short('H')
                .long("host")
                .value_name("HOST")
                .help("Coordinator host"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .value_parser(clap::value_parser!(u16))
                .help("Coordinator port"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("DIR")
                .help("Directory screenshots are stored under"),
        )
        .arg(
            Arg::new("clear")
                .long("clear")
                .action(ArgAction::SetTrue)
                .help("Empty the output directory before the first connection"),
        )
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .value_name("SOURCE")
                .value_parser(["x11", "stub"])
                .conflicts_with("replay")
                .help("Capture backend"),
        )
        .arg(
            Arg::new("replay")
                .long("replay")
                .value_name("PNG")
                .help("Answer every capture with this image"),
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
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };
    if let Some(host) = matches.get_one::<String>("host") {
        config.host.clone_from(host);
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }
    if let Some(output) = matches.get_one::<String>("output") {
        config.output_dir = PathBuf::from(output);
    }
    if matches.get_flag("clear") {
        config.clear_output = true;
    }
    match matches.get_one::<String>("source").map(String::as_str) {
        Some("x11") => config.capture = CaptureSource::X11,
        Some("stub") => config.capture = CaptureSource::default_stub(),
        _ => {}
    }
    if let Some(replay) = matches.get_one::<String>("replay") {
        config.capture = CaptureSource::File(PathBuf::from(replay));
    }

    info!("Starting shutter-agent with config: {config:?}");

    let mut agent = Agent::from_config(config).context("failed to start agent")?;

    let handle = agent.handle();
    ctrlc::set_handler(move || handle.stop()).context("failed to install Ctrl+C handler")?;

    info!("Agent running, press Ctrl+C to stop");
    agent.run()?;
    Ok(())
}
