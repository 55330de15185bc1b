// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! # brotherd: Brother scan daemon core
//!
//! Host-side endpoint for network-attached Brother MFC/DCP multifunction
//! scanners. The daemon registers itself on each configured device as a set
//! of scan destinations, waits for the user to press the Scan button, and
//! pulls the scanned pages over the device's proprietary TCP protocol,
//! running a user hook per page and per job.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Device handler                              |
//! |  reachability pings | destination registration | button listener   |
//! +--------------------------------------------------------------------+
//! |                        Data channels                               |
//! |  one task per device: welcome -> params x2 -> chunked page data    |
//! +--------------------------------------------------------------------+
//! |                SNMP client          |        Hook runner           |
//! |  status GET / destination SET       |  /bin/sh -c + SCANNER_* env  |
//! +--------------------------------------------------------------------+
//! |                        Transport                                   |
//! |  timeout-bounded UDP/TCP handle with peek/read framing buffer      |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Wire surface
//!
//! | Port | Protocol | Role |
//! |------|----------|------|
//! | 161/udp | SNMPv1 | status probe, destination (un)registration |
//! | 54925/udp | proprietary | button-press notifications from devices |
//! | 54921/tcp | proprietary | scan session (handshake + page data) |
//!
//! Scanned pages land as `scan<N>.<fmt>` in the working directory; all
//! downstream handling (conversion, OCR, mail) belongs to the user hook.

/// Per-device scan-session task and protocol engine.
pub mod channel;
/// Configuration schema and config file parser.
pub mod config;
/// Device discovery, registration and button dispatch.
pub mod device;
/// Cooperative task plumbing (mailboxes, wake semaphore).
pub mod engine;
/// Crate-wide error type.
pub mod error;
/// SNMPv1 client and its BER codec.
pub mod snmp;
/// Timeout-bounded socket handle.
pub mod transport;

pub use channel::DataChannel;
pub use config::{Config, DeviceConfig, ItemConfig, ScanFunc, DEFAULT_CONFIG_PATH};
pub use device::{DeviceHandler, BUTTON_PORT};
pub use error::{Error, Result};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
