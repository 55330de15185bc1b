// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! Ordered scan-parameter table.
//!
//! Parameters are single-byte ids mapped to short ASCII values. The device
//! and the daemon exchange them as `id=value\n` records; the backing table
//! preserves insertion order, which makes every serialisation of the same
//! table byte-identical.

use crate::error::{Error, Result};

/// Longest accepted parameter value.
pub const MAX_VALUE_LEN: usize = 15;

/// Ids allowed in the first parameter-exchange response.
pub const EXCHANGE1_WHITELIST: &[u8] = b"RMD";

/// Ids allowed in the second parameter-exchange response.
pub const EXCHANGE2_WHITELIST: &[u8] = b"RMCJBNADGL";

/// Ordered `id -> value` table with fixed-size value slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanParams {
    entries: Vec<(u8, String)>,
}

impl ScanParams {
    pub fn new() -> Self {
        ScanParams::default()
    }

    /// Append a new id with its initial value. Used to build templates;
    /// duplicate ids are a caller bug surfaced as a config error.
    pub fn push(&mut self, id: u8, value: &str) -> Result<()> {
        if self.entries.iter().any(|(eid, _)| *eid == id) {
            return Err(Error::Config(format!(
                "duplicate scan parameter id '{}'",
                id as char
            )));
        }
        self.check_value(id, value)?;
        self.entries.push((id, value.to_string()));
        Ok(())
    }

    /// Overwrite the value of an existing id.
    pub fn set(&mut self, id: u8, value: &str) -> Result<()> {
        self.check_value(id, value)?;
        match self.entries.iter_mut().find(|(eid, _)| *eid == id) {
            Some((_, slot)) => {
                slot.clear();
                slot.push_str(value);
                Ok(())
            }
            None => Err(Error::Config(format!(
                "unknown scan parameter id '{}'",
                id as char
            ))),
        }
    }

    pub fn get(&self, id: u8) -> Option<&str> {
        self.entries
            .iter()
            .find(|(eid, _)| *eid == id)
            .map(|(_, value)| value.as_str())
    }

    fn check_value(&self, id: u8, value: &str) -> Result<()> {
        if value.len() > MAX_VALUE_LEN {
            return Err(Error::Config(format!(
                "scan parameter '{}' value longer than {} bytes",
                id as char, MAX_VALUE_LEN
            )));
        }
        Ok(())
    }

    /// Parse a run of `id=value\n` records into the table. Every id must
    /// already exist; a device announcing an id we have no slot for is a
    /// protocol violation.
    pub fn parse_records(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            if buf.len() < 2 || buf[1] != b'=' {
                return Err(Error::protocol("scan parameter record missing '=' sign"));
            }
            let id = buf[0];
            let rest = &buf[2..];
            let end = rest
                .iter()
                .position(|&b| b == 0x0A)
                .ok_or_else(|| Error::protocol("scan parameter record missing terminator"))?;
            let value = std::str::from_utf8(&rest[..end])
                .map_err(|_| Error::protocol("scan parameter value is not ASCII"))?;
            if value.len() > MAX_VALUE_LEN {
                return Err(Error::protocol(format!(
                    "scan parameter '{}' value longer than {} bytes",
                    id as char, MAX_VALUE_LEN
                )));
            }

            let known = self.entries.iter_mut().find(|(eid, _)| *eid == id);
            match known {
                Some((_, slot)) => {
                    slot.clear();
                    slot.push_str(value);
                }
                None => {
                    return Err(Error::protocol(format!(
                        "unknown scan parameter id '{}'",
                        id as char
                    )));
                }
            }
            buf = &rest[end + 1..];
        }
        Ok(())
    }

    /// Append the table as `id=value\n` records in insertion order.
    /// Empty values are skipped; `whitelist` restricts which ids appear.
    pub fn serialize(&self, whitelist: Option<&[u8]>, out: &mut Vec<u8>) {
        for (id, value) in &self.entries {
            if value.is_empty() {
                continue;
            }
            if let Some(allowed) = whitelist {
                if !allowed.contains(id) {
                    continue;
                }
            }
            out.push(*id);
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
            out.push(0x0A);
        }
    }

    /// Devices may announce a single-axis resolution ("300" instead of
    /// "300,300"); normalise it to the pair form the response format needs.
    pub fn normalize_resolution(&mut self) -> Result<()> {
        let value = match self.get(b'R') {
            Some(v) if !v.contains(',') => v.to_string(),
            _ => return Ok(()),
        };
        let pair = format!("{},{}", value, value);
        if pair.len() > MAX_VALUE_LEN {
            return Err(Error::protocol(format!("invalid resolution '{}'", value)));
        }
        self.set(b'R', &pair)
    }
}
