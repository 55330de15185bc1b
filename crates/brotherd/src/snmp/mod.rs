// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! SNMPv1 client for scanner discovery and destination registration.
//!
//! Two request shapes cover everything the daemon needs from a device's
//! agent: a status GET against the Brother printer-status OID, and a SET
//! that registers (or unregisters) up to four scan destinations per packet.

pub mod ber;

use crate::error::{Error, Result};
use crate::transport::{Conn, ConnKind};
use ber::{MsgHeader, Value, VarBind};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// SNMP agent port on the device.
pub const SNMP_PORT: u16 = 161;

/// Destinations per SET packet; longer item lists are split by the caller.
pub const MAX_BATCH: usize = 4;

/// How long to wait for the agent's reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// brInfoPrinterUStatus, the integer device status.
const OID_PRINTER_STATUS: &[u32] = &[1, 3, 6, 1, 4, 1, 2435, 2, 3, 9, 4, 2, 1, 5, 5, 6, 0];
/// brRegisterKeyInfo, takes an OCTET STRING destination descriptor.
const OID_REGISTER: &[u32] = &[1, 3, 6, 1, 4, 1, 2435, 2, 3, 9, 2, 11, 1, 1, 0];
/// brUnregisterKeyInfo, not implemented by all firmware.
const OID_UNREGISTER: &[u32] = &[1, 3, 6, 1, 4, 1, 2435, 2, 3, 9, 2, 11, 1, 2, 0];

/// Process-wide request id source.
static REQUEST_ID: AtomicI64 = AtomicI64::new(1);

fn next_request_id() -> i64 {
    REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// One device's SNMP endpoint.
pub struct SnmpClient {
    conn: Conn,
    dest: SocketAddrV4,
}

impl SnmpClient {
    /// Open a datagram socket toward `dest` with `timeout` bounding each
    /// send/receive syscall.
    pub fn new(dest: SocketAddrV4, timeout: Duration) -> Result<Self> {
        let conn = Conn::open(ConnKind::Udp, timeout)?;
        Ok(SnmpClient { conn, dest })
    }

    /// Agent address this client talks to.
    pub fn dest(&self) -> SocketAddrV4 {
        self.dest
    }

    fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let sent = self.conn.sendto(request, self.dest)?;
        if sent != request.len() {
            return Err(Error::Snmp(format!(
                "short SNMP send ({}/{} bytes) to {}",
                sent,
                request.len(),
                self.dest
            )));
        }
        if !self.conn.poll(REPLY_TIMEOUT)? {
            return Err(Error::Timeout);
        }
        let mut buf = vec![0u8; 2048];
        let n = self.conn.receive(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Fetch the device status integer (10001 ready, 10006 low ink,
    /// 40038 empty ink; anything else means the device is unavailable).
    pub fn get_printer_status(&mut self) -> Result<i64> {
        let header = MsgHeader {
            version: ber::SNMP_VERSION_1,
            community: "public".into(),
            pdu_type: ber::PDU_GET_REQUEST,
            request_id: next_request_id(),
            error_status: 0,
            error_index: 0,
        };
        let request = ber::encode_msg(&header, &[VarBind::new(OID_PRINTER_STATUS, Value::Null)]);
        let reply = self.exchange(&request)?;

        let (reply_header, varbinds) = ber::decode_msg(&reply)?;
        if reply_header.error_status != 0 && reply_header.error_index != 0 {
            return Err(Error::Snmp(format!(
                "status request rejected by {} (error-status {}, error-index {})",
                self.dest, reply_header.error_status, reply_header.error_index
            )));
        }
        match varbinds.first().map(|vb| &vb.value) {
            Some(Value::Int(status)) => Ok(*status),
            _ => Err(Error::Snmp(format!(
                "status response from {} carries no integer value",
                self.dest
            ))),
        }
    }

    /// Register up to [`MAX_BATCH`] destination descriptors. Agent-reported
    /// errors are surfaced.
    pub fn register_destinations(&mut self, descriptors: &[String]) -> Result<()> {
        let reply = self.set_destinations(OID_REGISTER, descriptors)?;
        let (reply_header, _) = ber::decode_msg(&reply)?;
        if reply_header.error_status != 0 && reply_header.error_index != 0 {
            return Err(Error::Snmp(format!(
                "registration rejected by {} (error-status {}, error-index {})",
                self.dest, reply_header.error_status, reply_header.error_index
            )));
        }
        Ok(())
    }

    /// Unregister up to [`MAX_BATCH`] destination descriptors. Some firmware
    /// does not implement the unregister OID, so the reply is not inspected.
    pub fn unregister_destinations(&mut self, descriptors: &[String]) -> Result<()> {
        self.set_destinations(OID_UNREGISTER, descriptors)?;
        Ok(())
    }

    fn set_destinations(&mut self, oid: &[u32], descriptors: &[String]) -> Result<Vec<u8>> {
        if descriptors.is_empty() {
            return Err(Error::InvalidState("empty destination batch"));
        }
        if descriptors.len() > MAX_BATCH {
            return Err(Error::InvalidState("destination batch exceeds packet limit"));
        }

        let header = MsgHeader {
            version: ber::SNMP_VERSION_1,
            community: "internal".into(),
            pdu_type: ber::PDU_SET_REQUEST,
            request_id: next_request_id(),
            error_status: 0,
            error_index: 0,
        };
        let varbinds: Vec<VarBind> = descriptors
            .iter()
            .map(|d| VarBind::new(oid, Value::Bytes(d.as_bytes().to_vec())))
            .collect();
        let request = ber::encode_msg(&header, &varbinds);
        self.exchange(&request)
    }
}
