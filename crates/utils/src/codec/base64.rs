/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Base64 codec: encode wraps at 76 columns for outbound MIME bodies;
//! decode tolerates missing padding and embedded CRLFs, and accepts a
//! byte iterator so MIME body parts can be decoded incrementally
//! mid-stream (spec §4.1).

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

const LINE_WRAP: usize = 76;

pub fn encode_wrapped(data: &[u8]) -> String {
    let raw = base64::engine::general_purpose::STANDARD.encode(data);
    let mut out = String::with_capacity(raw.len() + raw.len() / LINE_WRAP * 2);
    for chunk in raw.as_bytes().chunks(LINE_WRAP) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push_str("\r\n");
    }
    out
}

pub fn encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decodes a base64 payload coming from an untrusted peer: strips CRLFs
/// and whitespace, then decodes with or without padding.
pub fn decode(input: impl IntoIterator<Item = u8>) -> Option<Vec<u8>> {
    let filtered: Vec<u8> = input
        .into_iter()
        .filter(|b| !matches!(b, b'\r' | b'\n' | b' ' | b'\t'))
        .collect();
    if filtered.is_empty() {
        return Some(Vec::new());
    }
    base64::engine::general_purpose::STANDARD
        .decode(&filtered)
        .or_else(|_| STANDARD_NO_PAD.decode(&filtered))
        .ok()
}
