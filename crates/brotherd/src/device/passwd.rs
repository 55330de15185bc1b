// SPDX-License-Identifier: MIT
// Copyright (c) 2025-2026 brotherd developers

//! BRID password encoding.
//!
//! PIN-protected destinations carry their 4-character password in the
//! registration descriptor as 8 hex digits: the 32 password bits are
//! permuted by a fixed table, XORed with a fixed key, and hex-printed.
//! The device applies the inverse before comparing against the PIN the
//! user keys in.

/// `PERMUTATION[k]` is the output bit position receiving input bit `k`.
/// Bit `8*i + j` is bit `j` (LSB first) of byte `i`.
const PERMUTATION: [u8; 32] = [
    5, 10, 31, 24, 8, 30, 28, 1, //
    17, 13, 12, 14, 27, 3, 21, 22, //
    29, 20, 0, 7, 16, 11, 25, 4, //
    19, 18, 6, 26, 9, 2, 15, 23,
];

const XOR_KEY: [u8; 4] = [0xCA, 0xFE, 0x28, 0xA9];

/// Encode a 4-byte password into its 8-digit uppercase hex BRID form.
pub(crate) fn encode(password: [u8; 4]) -> String {
    let mut out = [0u8; 4];
    for k in 0..32 {
        let bit = (password[k / 8] >> (k % 8)) & 1;
        if bit != 0 {
            let t = PERMUTATION[k] as usize;
            out[t / 8] |= 1 << (t % 8);
        }
    }
    for (byte, key) in out.iter_mut().zip(XOR_KEY) {
        *byte ^= key;
    }
    out.iter().map(|b| format!("{:02X}", b)).collect()
}
