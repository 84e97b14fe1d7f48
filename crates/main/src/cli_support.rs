/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Shared plumbing for the `epismail`/`emailimp` CLI tools (spec §6):
//! loading a [`common::Core`] from the same TOML configuration the
//! server reads, and picking apart an IMF header block well enough to
//! discover a message's recipients and sender without a full parser.

use std::sync::Arc;

use common::{config::Config, Core};
use smtp::{
    inbound::{LocalDeliveryOutcome, LocalSubmission},
    persist::ShortFormStore,
};

/// Loads `Core` from `--config` (or the given path) without starting any
/// listener or the relay scheduler — these tools call the persistence
/// pipeline directly (spec §6).
pub fn open_core(config_path: &str) -> trc::Result<(Arc<Core>, ShortFormStore)> {
    let config = Config::load(config_path)?;
    let core = Core::open(config)?;
    let short_form = ShortFormStore::open(core.store.db())?;
    Ok((core, short_form))
}

/// Splits a raw IMF message into its header block and body, tolerating
/// both `\n` and `\r\n` line endings (unlike the wire path, these files
/// come from disk or a local pipe, not a socket).
pub fn split_headers_body(raw: &str) -> (&str, &str) {
    if let Some(pos) = raw.find("\r\n\r\n") {
        (&raw[..pos], &raw[pos + 4..])
    } else if let Some(pos) = raw.find("\n\n") {
        (&raw[..pos], &raw[pos + 2..])
    } else {
        (raw, "")
    }
}

/// Every value of a given header, case-insensitively, unfolded headers
/// only (no continuation-line support — these tools author their own
/// header blocks, not relay arbitrary incoming mail).
pub fn header_values<'a>(headers: &'a str, name: &str) -> Vec<&'a str> {
    headers
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
        .collect()
}

/// Pulls bare addresses out of a comma-separated address-list header
/// value, preferring the `<...>` form but accepting a bare address too.
pub fn parse_address_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|token| match (token.find('<'), token.find('>')) {
            (Some(start), Some(end)) if end > start => token[start + 1..end].to_string(),
            _ => token.to_string(),
        })
        .collect()
}

/// `From:` is a single address with an optional display name
/// (`"Display Name" <addr>` or bare `addr`).
pub fn parse_from_header(value: &str) -> (String, String) {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if end > start => {
            let realname = value[..start].trim().trim_matches('"').to_string();
            (realname, value[start + 1..end].to_string())
        }
        _ => (String::new(), value.trim().to_string()),
    }
}

/// Submission exit codes (spec §6): 0 success, 1 usage, 2 file/argument
/// error, 100+ submission errors.
pub fn outcome_exit_code(outcome: LocalDeliveryOutcome) -> i32 {
    match outcome {
        LocalDeliveryOutcome::Stored | LocalDeliveryOutcome::Duplicate => 0,
        LocalDeliveryOutcome::NoDeliverableRecipients => 100,
    }
}

pub fn submit(core: &Core, short_form: &ShortFormStore, submission: LocalSubmission) -> i32 {
    match smtp::inbound::deliver_local_message(core, short_form, submission) {
        Ok(outcome) => outcome_exit_code(outcome),
        Err(err) => {
            err.log();
            101
        }
    }
}
