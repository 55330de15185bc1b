// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! brother: scan-to-host daemon for Brother MFC/DCP devices.
//!
//! Loads the device configuration, registers every configured destination
//! on its device and services scan-button presses until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Run against the default ./brother.config
//! brother
//!
//! # Custom config, raised verbosity
//! brother -c /etc/brother.config -d
//!
//! # Alternate button-listener port
//! brother -p 54930
//! ```

use brotherd::{Config, DeviceHandler, BUTTON_PORT};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Scan-to-host daemon for Brother MFC/DCP multifunction devices.
#[derive(Parser, Debug)]
#[command(name = "brother", disable_version_flag = true)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config", default_value = brotherd::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Button-listener UDP port
    #[arg(short = 'p', long = "port", default_value_t = BUTTON_PORT)]
    port: u16,

    /// Raise log verbosity to debug
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if err.use_stderr() => {
            // Unknown flags and bad values exit 1, not clap's usage code.
            let _ = err.print();
            return ExitCode::FAILURE;
        }
        Err(err) => {
            // Help output.
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
    };

    if args.version {
        println!("brother scanner daemon {}", brotherd::VERSION);
        return ExitCode::SUCCESS;
    }

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    log::info!("brother scanner daemon {}", brotherd::VERSION);

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("{}", err);
            return ExitCode::FAILURE;
        }
    };
    if config.devices.is_empty() {
        log::error!(
            "no devices configured in '{}'; nothing to do",
            args.config.display()
        );
        return ExitCode::FAILURE;
    }

    let mut handler = match DeviceHandler::new(&config, args.port) {
        Ok(handler) => handler,
        Err(err) => {
            log::error!("could not start device handler: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(err) = ctrlc::set_handler(move || {
            log::info!("interrupt received, shutting down");
            shutdown.store(true, Ordering::Relaxed);
        }) {
            log::error!("could not install the signal handler: {}", err);
            return ExitCode::FAILURE;
        }
    }

    handler.run(&shutdown);

    log::info!("daemon stopped");
    ExitCode::SUCCESS
}
