// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! Timeout-bounded TCP/UDP transport.
//!
//! One handle type, [`Conn`], covers both socket kinds the daemon speaks:
//! datagram (SNMP, button notifications) and stream (the scan data channel).
//! The TCP variant carries a fixed-size receive buffer with `peek` / `read`
//! cursors so the protocol engine can consume exact byte counts even when
//! the device splits a frame across segments.

mod conn;

pub use conn::{Conn, ConnKind};

/// Log a wire-level hex dump of `buf` at debug level.
///
/// Compiled in only with the `hexdump` feature; release builds carry no
/// trace of the dump loop.
#[cfg(feature = "hexdump")]
pub(crate) fn dump(tag: &str, buf: &[u8]) {
    log::debug!("[wire] {} {} bytes:", tag, buf.len());
    for chunk in buf.chunks(16) {
        let hex: String = chunk.iter().map(|b| format!("{:02x} ", b)).collect();
        log::debug!("  {}", hex);
    }
}

#[cfg(not(feature = "hexdump"))]
pub(crate) fn dump(_tag: &str, _buf: &[u8]) {}
