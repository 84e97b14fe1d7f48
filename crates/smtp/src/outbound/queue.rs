/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The outbound queue on disk (spec §4.9): one `.outg` entry per accepted
//! message that had at least one alien recipient, plus a `.retry`
//! sidecar recording the scheduler's retry state for that entry.

use std::{
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use common::Core;
use serde::{Deserialize, Serialize};
use store::DatumId;

use crate::persist::PersistInput;

#[derive(Debug, Clone)]
pub struct QueueEntryHeader {
    pub sender: String,
    pub auth_user: Option<String>,
    pub sender_realname: String,
    pub client_ip: IpAddr,
    pub resolved_fqdn: Option<String>,
    pub mail_id: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryState {
    pub first_attempt_epoch: i64,
    pub attempts: u32,
    pub next_attempt_epoch: i64,
    /// Recipients a prior attempt already delivered; the scheduler skips
    /// them on retry so a partial success is never repeated (spec §4.9,
    /// "per-recipient-domain" grouping means each domain completes or
    /// retries independently of the others).
    pub completed: Vec<String>,
    /// Set once any domain has bounced across any attempt, so a later
    /// attempt that finishes the remaining domains cleanly still marks
    /// the entry `.fail` rather than `.sent` (spec §4: "rename to `.sent`
    /// (success-only) or `.fail` (any conclusive failure)").
    #[serde(default)]
    pub had_failure: bool,
}

/// Writes the queue entry for a just-persisted message with at least one
/// alien recipient. The file holds a small structured header followed by
/// a blank line and the verbatim message bytes.
pub fn write_queue_entry(core: &Core, input: &PersistInput, datum_id: DatumId) -> trc::Result<()> {
    let path = entry_path(&core.config.server.queue_root, datum_id);
    fs::create_dir_all(&core.config.server.queue_root)
        .map_err(|e| trc::Error::internal(format!("create queue root: {e}")))?;

    let mut out = Vec::new();
    out.extend_from_slice(format!("sender: {}\r\n", input.sender_address).as_bytes());
    if let Some(user) = &input.authenticated_as {
        out.extend_from_slice(format!("auth-user: {user}\r\n").as_bytes());
    }
    out.extend_from_slice(format!("sender-realname: {}\r\n", input.sender_realname).as_bytes());
    out.extend_from_slice(format!("client-ip: {}\r\n", input.client_ip).as_bytes());
    if let Some(fqdn) = &input.resolved_fqdn {
        out.extend_from_slice(format!("resolved-fqdn: {fqdn}\r\n").as_bytes());
    }
    out.extend_from_slice(format!("mail-id: {}\r\n", datum_id.to_hex()).as_bytes());
    for rcpt in &input.relay_targets {
        out.extend_from_slice(format!("rcpt: {rcpt}\r\n").as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&input.body);

    // spec §4: "thread R writes files ... by writing with a temporary
    // name and renaming atomically to the `.outg` name on completion" —
    // so the scheduler, scanning concurrently on thread S, never observes
    // a partially written entry.
    let tmp_path = path.with_extension("outg.tmp");
    fs::write(&tmp_path, &out).map_err(|e| trc::Error::internal(format!("write queue entry: {e}")))?;
    fs::rename(&tmp_path, &path).map_err(|e| trc::Error::internal(format!("rename queue entry into place: {e}")))?;

    let retry = RetryState {
        first_attempt_epoch: utils::now(),
        attempts: 0,
        next_attempt_epoch: utils::now(),
        completed: Vec::new(),
        had_failure: false,
    };
    write_retry_state(&path, &retry)?;
    Ok(())
}

pub fn entry_path(queue_root: &Path, datum_id: DatumId) -> PathBuf {
    queue_root.join(format!("{}.outg", datum_id.to_hex()))
}

fn retry_path(entry_path: &Path) -> PathBuf {
    entry_path.with_extension("retry")
}

pub fn read_retry_state(entry_path: &Path) -> trc::Result<RetryState> {
    let path = retry_path(entry_path);
    let raw = fs::read_to_string(&path).map_err(|e| trc::Error::internal(format!("read retry state: {e}")))?;
    serde_json::from_str(&raw).map_err(|e| trc::Error::malformed(format!("parse retry state: {e}")))
}

pub fn write_retry_state(entry_path: &Path, state: &RetryState) -> trc::Result<()> {
    let path = retry_path(entry_path);
    let raw = serde_json::to_string(state).map_err(|e| trc::Error::internal(format!("serialize retry state: {e}")))?;
    fs::write(&path, raw).map_err(|e| trc::Error::internal(format!("write retry state: {e}")))
}

/// A mail-item is terminal once every relay-task it holds has reached a
/// terminal state (spec §4): renames the `.outg` file to `.sent` (every
/// recipient delivered) or `.fail` (at least one conclusive failure or
/// expiry), and drops the now-irrelevant `.retry` sidecar. The renamed
/// file stays on disk — `scan` only matches `.outg`, so it is never
/// revisited.
pub fn mark_terminal(entry_path: &Path, had_failure: bool) -> trc::Result<PathBuf> {
    let extension = if had_failure { "fail" } else { "sent" };
    let dest = entry_path.with_extension(extension);
    fs::rename(entry_path, &dest).map_err(|e| trc::Error::internal(format!("rename queue entry to .{extension}: {e}")))?;
    let _ = fs::remove_file(retry_path(entry_path));
    Ok(dest)
}

/// Parses a queue entry's on-disk bytes back into its header and the
/// verbatim message body that follows the blank line.
pub fn parse_entry(raw: &[u8]) -> trc::Result<(QueueEntryHeader, Vec<u8>)> {
    let separator = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| trc::Error::malformed("queue entry missing header/body separator".to_string()))?;
    let header_bytes = &raw[..separator];
    let body = raw[separator + 4..].to_vec();

    let mut sender = None;
    let mut auth_user = None;
    let mut sender_realname = String::new();
    let mut client_ip = None;
    let mut resolved_fqdn = None;
    let mut mail_id = None;
    let mut recipients = Vec::new();

    for line in header_bytes.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let line = std::str::from_utf8(line).map_err(|_| trc::Error::malformed("non-utf8 queue header".to_string()))?;
        let Some((key, value)) = line.split_once(": ") else {
            continue;
        };
        match key {
            "sender" => sender = Some(value.to_string()),
            "auth-user" => auth_user = Some(value.to_string()),
            "sender-realname" => sender_realname = value.to_string(),
            "client-ip" => client_ip = value.parse().ok(),
            "resolved-fqdn" => resolved_fqdn = Some(value.to_string()),
            "mail-id" => mail_id = Some(value.to_string()),
            "rcpt" => recipients.push(value.to_string()),
            _ => {}
        }
    }

    let header = QueueEntryHeader {
        sender: sender.ok_or_else(|| trc::Error::malformed("queue entry missing sender".to_string()))?,
        auth_user,
        sender_realname,
        client_ip: client_ip.ok_or_else(|| trc::Error::malformed("queue entry missing client-ip".to_string()))?,
        resolved_fqdn,
        mail_id: mail_id.ok_or_else(|| trc::Error::malformed("queue entry missing mail-id".to_string()))?,
        recipients,
    };
    Ok((header, body))
}

/// Lists every queue entry currently on disk, in no particular order —
/// the scheduler consults each entry's own retry state to decide whether
/// it is due.
pub fn scan(queue_root: &Path) -> trc::Result<Vec<PathBuf>> {
    if !queue_root.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(queue_root).map_err(|e| trc::Error::internal(format!("scan queue: {e}")))? {
        let entry = entry.map_err(|e| trc::Error::internal(format!("read queue dir entry: {e}")))?;
        if entry.path().extension().and_then(|e| e.to_str()) == Some("outg") {
            entries.push(entry.path());
        }
    }
    Ok(entries)
}
