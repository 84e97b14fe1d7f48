/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! `emailimp -dir=<path>`: imports a directory of legacy POP3-formatted
//! message files by calling straight into the persistence pipeline
//! (spec §6), one file per message, recipients and sender taken from its
//! own headers exactly as `epismail -t` reads them.

use epistula::cli_support::{self, parse_address_list, parse_from_header, split_headers_body};
use smtp::inbound::LocalSubmission;

/// `-dir=<path>` is a single-dash, equals-joined flag (the legacy tool's
/// own convention), which doesn't fit `clap`'s double-dash `long` option
/// shape, so this one parses its own argv.
fn parse_args() -> Result<(String, String), i32> {
    let mut dir = None;
    let mut config = "conf/epistula.toml".to_string();
    for arg in std::env::args().skip(1) {
        if let Some(value) = arg.strip_prefix("-dir=") {
            dir = Some(value.to_string());
        } else if let Some(value) = arg.strip_prefix("--config=") {
            config = value.to_string();
        } else {
            eprintln!("usage: emailimp -dir=<path> [--config=<file>]");
            return Err(1);
        }
    }
    match dir {
        Some(dir) => Ok((dir, config)),
        None => {
            eprintln!("usage: emailimp -dir=<path> [--config=<file>]");
            Err(1)
        }
    }
}

fn main() {
    let (dir, config) = match parse_args() {
        Ok(args) => args,
        Err(code) => std::process::exit(code),
    };

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) => {
            eprintln!("cannot read {dir}: {err}");
            std::process::exit(2);
        }
    };

    let (core, short_form) = match cli_support::open_core(&config) {
        Ok(opened) => opened,
        Err(err) => {
            err.log();
            std::process::exit(2);
        }
    };

    let mut imported = 0u32;
    let mut skipped = 0u32;
    let mut failed = 0u32;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };

        let (headers, _) = split_headers_body(&raw);
        let from = cli_support::header_values(headers, "From").first().copied().unwrap_or_default();
        let (sender_realname, sender_address) = parse_from_header(from);
        let recipients: Vec<String> = ["To", "Cc", "Bcc"]
            .iter()
            .flat_map(|name| cli_support::header_values(headers, name))
            .flat_map(parse_address_list)
            .collect();
        if sender_address.is_empty() || recipients.is_empty() {
            skipped += 1;
            continue;
        }

        let submission = LocalSubmission {
            body: raw.into_bytes(),
            sender_address,
            sender_realname,
            recipients,
            client_ip: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            authenticated_as: None,
        };
        match smtp::inbound::deliver_local_message(&core, &short_form, submission) {
            Ok(_) => imported += 1,
            Err(err) => {
                err.log();
                failed += 1;
            }
        }
    }

    eprintln!("imported {imported}, skipped {skipped}, failed {failed}");
    std::process::exit(if failed > 0 { 101 } else { 0 });
}
