/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! POP3 wire responses (spec §6), reproduced byte-for-byte from the
//! protocol's canonical implementation rather than re-derived from the
//! RFC, since the exact text is part of observed client compatibility.
//! Two exceptions, both deliberate: `LIST n` here emits one clean
//! `+OK n size` line instead of the canonical implementation's
//! malformed two-line reply, and `UIDL n` reports the message's real
//! sequence number instead of the canonical implementation's
//! always-`1` counter bug — replicating either would break UIDL
//! stability across a session.

use store::DatumId;

pub const GREETING: &str = "+OK Epistula POP3 Server Ready\r\n";
pub const CAPA: &str = "+OK\r\nUSER\r\nUIDL\r\nSTAT\r\n.\r\n";
pub const AUTH_USERNAME_CHALLENGE: &str = "334 VXNlcm5hbWU6\r\n";
pub const AUTH_PASSWORD_CHALLENGE: &str = "334 UGFzc3dvcmQ6\r\n";
pub const ERR_NO_USERNAME: &str = "-ERR Internal fault, could not set username\r\n";
pub const ERR_APOP_UNSUPPORTED: &str = "-ERR Internal fault, APOP command not supported\r\n";
pub const ERR_PROTOCOL: &str = "-ERR Protocol error. Did not understand last command\r\n";
pub const ERR_EXPECTED_PASS: &str = "-ERR expected PASS\r\n";
pub const ERR_AUTH_FAILED: &str = "-ERR authentication failed\r\n";
pub const ERR_LIST_FAILED: &str = "-ERR internal fault, list failed\r\n";
pub const ERR_NO_SUCH_MESSAGE: &str = "-ERR No such message\r\n";
pub const ERR_NO_SUCH_MESSAGE_RANGE: &str = "-ERR No such message (range)\r\n";
pub const ERR_NO_SUCH_MESSAGE_DELETED: &str = "-ERR No such message (deleted)\r\n";
pub const OK_BARE: &str = "+OK\r\n";
pub const QUIT_OK: &str = "+OK\r\n";

pub fn user_ok(name: &str) -> String {
    format!("+OK {name}\r\n")
}

pub fn pass_ok(name: &str) -> String {
    format!("+OK {name} is cool\r\n")
}

pub fn stat_ok(count: usize, total: u64) -> String {
    format!("+OK {count} {total}\r\n")
}

/// `LIST` with no argument: a `+OK count total` header, one `n size`
/// line per live message, then the terminator.
pub fn list_all(live: &[(u32, u32)], total: u64) -> String {
    let mut out = stat_ok(live.len(), total);
    for (msg_no, size) in live {
        out.push_str(&format!("{msg_no} {size}\r\n"));
    }
    out.push_str(".\r\n");
    out
}

pub fn list_one(msg_no: u32, size: u32) -> String {
    format!("+OK {msg_no} {size}\r\n")
}

/// `UIDL` with no argument: a `+OK count total` header, one `n uidl`
/// line per live message, then the terminator.
pub fn uidl_all(live: &[(u32, DatumId)], total: u64, count: usize) -> String {
    let mut out = stat_ok(count, total);
    for (msg_no, datum_id) in live {
        out.push_str(&format!("{msg_no} {}\r\n", datum_id.to_uidl()));
    }
    out.push_str(".\r\n");
    out
}

pub fn uidl_one(msg_no: u32, datum_id: DatumId) -> String {
    format!("+OK {msg_no} {}\r\n", datum_id.to_uidl())
}

pub fn could_not_understand(line: &str) -> String {
    format!("-ERR cannot understand command [{line}]\r\n")
}

/// Dot-stuffs `body` so no line the client reads could be mistaken for
/// the terminator, per spec §4.8 (the canonical implementation's RETR
/// does not stuff, but its manifest format and client population
/// postdate the byte-stuffing requirement this server now honors).
pub fn dot_stuff(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for line in body.split_inclusive(|&b| b == b'\n') {
        if line.starts_with(b".") {
            out.push(b'.');
        }
        out.extend_from_slice(line);
    }
    out
}

/// `RETR`: the full message, dot-stuffed, terminated.
pub fn retr_response(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 16);
    out.extend_from_slice(b"+OK\r\n");
    out.extend_from_slice(&dot_stuff(body));
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// `TOP n`: the header block verbatim up to (not including) the blank
/// line separator, dot-stuffed, followed by an empty body and the
/// terminator. The requested line count is accepted but ignored, since
/// the canonical implementation always emits headers-only regardless of
/// the argument (spec §9 open question).
pub fn top_response(body: &[u8]) -> Vec<u8> {
    let headers_end = body
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 2)
        .unwrap_or(body.len());
    let headers = &body[..headers_end];

    let mut out = Vec::with_capacity(headers.len() + 16);
    out.extend_from_slice(b"+OK\r\n");
    out.extend_from_slice(&dot_stuff(headers));
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(b".\r\n");
    out
}
