// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! ASN.1 BER subset used by the SNMPv1 exchanges.
//!
//! Only the shapes the scanner firmware speaks are implemented: SEQUENCE,
//! INTEGER, OCTET STRING, NULL, OBJECT IDENTIFIER and the v1 PDU wrappers.
//! Messages are built forward into a `Vec` with length back-patching and
//! decoded with a bounds-checked cursor.

use crate::error::{Error, Result};

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;

/// SNMPv1 GetRequest PDU tag.
pub const PDU_GET_REQUEST: u8 = 0xA0;
/// SNMPv1 GetResponse PDU tag.
pub const PDU_GET_RESPONSE: u8 = 0xA2;
/// SNMPv1 SetRequest PDU tag.
pub const PDU_SET_REQUEST: u8 = 0xA3;

/// SNMPv1 protocol version field value.
pub const SNMP_VERSION_1: i64 = 0;

/// A decoded varbind value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    Null,
}

/// One OID/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarBind {
    pub oid: Vec<u32>,
    pub value: Value,
}

impl VarBind {
    pub fn new(oid: &[u32], value: Value) -> Self {
        VarBind {
            oid: oid.to_vec(),
            value,
        }
    }
}

/// The message and PDU headers preceding the varbind list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgHeader {
    pub version: i64,
    pub community: String,
    pub pdu_type: u8,
    pub request_id: i64,
    pub error_status: i64,
    pub error_index: i64,
}

// ===== Encoding =====

fn push_len(out: &mut Vec<u8>, at: usize) {
    let len = out.len() - at;
    if len < 0x80 {
        out.insert(at, len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        let sig = &bytes[skip..];
        out.insert(at, 0x80 | sig.len() as u8);
        for (i, &b) in sig.iter().enumerate() {
            out.insert(at + 1 + i, b);
        }
    }
}

/// Append `tag`, run `content` to produce the body, then back-patch the
/// definite length in front of it.
fn push_tlv(out: &mut Vec<u8>, tag: u8, content: impl FnOnce(&mut Vec<u8>)) {
    out.push(tag);
    let at = out.len();
    content(out);
    push_len(out, at);
}

fn push_integer(out: &mut Vec<u8>, value: i64) {
    push_tlv(out, TAG_INTEGER, |out| {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        // Strip redundant sign-extension octets, keeping the sign bit intact.
        while start < bytes.len() - 1 {
            let lead = bytes[start];
            let next_msb = bytes[start + 1] & 0x80;
            if (lead == 0x00 && next_msb == 0) || (lead == 0xFF && next_msb != 0) {
                start += 1;
            } else {
                break;
            }
        }
        out.extend_from_slice(&bytes[start..]);
    });
}

fn push_octet_string(out: &mut Vec<u8>, bytes: &[u8]) {
    push_tlv(out, TAG_OCTET_STRING, |out| out.extend_from_slice(bytes));
}

fn push_null(out: &mut Vec<u8>) {
    out.push(TAG_NULL);
    out.push(0);
}

fn push_oid(out: &mut Vec<u8>, oid: &[u32]) {
    push_tlv(out, TAG_OID, |out| {
        // First two arcs collapse into one octet per X.690.
        let first = oid.first().copied().unwrap_or(1);
        let second = oid.get(1).copied().unwrap_or(3);
        out.push((first * 40 + second) as u8);
        for &arc in &oid[2.min(oid.len())..] {
            push_base128(out, arc);
        }
    });
}

fn push_base128(out: &mut Vec<u8>, mut arc: u32) {
    let mut chunks = [0u8; 5];
    let mut n = 0;
    loop {
        chunks[n] = (arc & 0x7F) as u8;
        n += 1;
        arc >>= 7;
        if arc == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let cont = if i == 0 { 0 } else { 0x80 };
        out.push(chunks[i] | cont);
    }
}

/// Encode a full SNMPv1 message.
pub fn encode_msg(header: &MsgHeader, varbinds: &[VarBind]) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    push_tlv(&mut out, TAG_SEQUENCE, |out| {
        push_integer(out, header.version);
        push_octet_string(out, header.community.as_bytes());
        push_tlv(out, header.pdu_type, |out| {
            push_integer(out, header.request_id);
            push_integer(out, header.error_status);
            push_integer(out, header.error_index);
            push_tlv(out, TAG_SEQUENCE, |out| {
                for vb in varbinds {
                    push_tlv(out, TAG_SEQUENCE, |out| {
                        push_oid(out, &vb.oid);
                        match &vb.value {
                            Value::Int(v) => push_integer(out, *v),
                            Value::Bytes(b) => push_octet_string(out, b),
                            Value::Null => push_null(out),
                        }
                    });
                }
            });
        });
    });
    out
}

// ===== Decoding =====

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8> {
        let b = self
            .buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::Snmp("truncated BER message".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Snmp("truncated BER message".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn length(&mut self) -> Result<usize> {
        let first = self.byte()?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let octets = (first & 0x7F) as usize;
        if octets == 0 || octets > 4 {
            return Err(Error::Snmp(format!("unsupported BER length form ({octets} octets)")));
        }
        let mut len = 0usize;
        for &b in self.take(octets)? {
            len = (len << 8) | b as usize;
        }
        Ok(len)
    }

    /// Read a header expecting `tag`; return a sub-reader over the content.
    fn enter(&mut self, tag: u8) -> Result<Reader<'a>> {
        let got = self.byte()?;
        if got != tag {
            return Err(Error::Snmp(format!(
                "unexpected BER tag 0x{got:02x} (wanted 0x{tag:02x})"
            )));
        }
        let len = self.length()?;
        Ok(Reader::new(self.take(len)?))
    }

    fn integer(&mut self) -> Result<i64> {
        let content = self.enter(TAG_INTEGER)?;
        let bytes = content.buf;
        if bytes.is_empty() || bytes.len() > 8 {
            return Err(Error::Snmp("invalid INTEGER width".into()));
        }
        let mut value: i64 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
        for &b in bytes {
            value = (value << 8) | i64::from(b);
        }
        Ok(value)
    }

    fn octet_string(&mut self) -> Result<&'a [u8]> {
        Ok(self.enter(TAG_OCTET_STRING)?.buf)
    }

    fn oid(&mut self) -> Result<Vec<u32>> {
        let content = self.enter(TAG_OID)?;
        let bytes = content.buf;
        if bytes.is_empty() {
            return Err(Error::Snmp("empty OID".into()));
        }
        let mut arcs = vec![u32::from(bytes[0]) / 40, u32::from(bytes[0]) % 40];
        let mut cur: u32 = 0;
        for &b in &bytes[1..] {
            cur = (cur << 7) | u32::from(b & 0x7F);
            if b & 0x80 == 0 {
                arcs.push(cur);
                cur = 0;
            }
        }
        Ok(arcs)
    }

    fn value(&mut self) -> Result<Value> {
        let tag = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::Snmp("truncated varbind value".into()))?;
        match tag {
            TAG_INTEGER => Ok(Value::Int(self.integer()?)),
            TAG_OCTET_STRING => Ok(Value::Bytes(self.octet_string()?.to_vec())),
            TAG_NULL => {
                self.byte()?;
                let len = self.length()?;
                self.take(len)?;
                Ok(Value::Null)
            }
            other => Err(Error::Snmp(format!("unsupported varbind value tag 0x{other:02x}"))),
        }
    }

    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// Decode a full SNMPv1 message (request or response).
pub fn decode_msg(buf: &[u8]) -> Result<(MsgHeader, Vec<VarBind>)> {
    let mut top = Reader::new(buf);
    let mut msg = top.enter(TAG_SEQUENCE)?;

    let version = msg.integer()?;
    let community = String::from_utf8_lossy(msg.octet_string()?).into_owned();

    let pdu_type = *msg
        .buf
        .get(msg.pos)
        .ok_or_else(|| Error::Snmp("missing PDU".into()))?;
    if !(PDU_GET_REQUEST..=PDU_SET_REQUEST).contains(&pdu_type) {
        return Err(Error::Snmp(format!("unexpected PDU tag 0x{pdu_type:02x}")));
    }
    let mut pdu = msg.enter(pdu_type)?;

    let request_id = pdu.integer()?;
    let error_status = pdu.integer()?;
    let error_index = pdu.integer()?;

    let mut list = pdu.enter(TAG_SEQUENCE)?;
    let mut varbinds = Vec::new();
    while !list.done() {
        let mut vb = list.enter(TAG_SEQUENCE)?;
        let oid = vb.oid()?;
        let value = vb.value()?;
        varbinds.push(VarBind { oid, value });
    }

    Ok((
        MsgHeader {
            version,
            community,
            pdu_type,
            request_id,
            error_status,
            error_index,
        },
        varbinds,
    ))
}
