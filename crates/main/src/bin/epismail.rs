/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! `epismail`: a thin external submission tool (spec §6), calling
//! directly into the persistence pipeline rather than opening a
//! submission-port connection (SPEC_FULL §14).
//!
//! - `epismail -t` reads an IMF message from stdin; recipients come from
//!   its `To`/`Cc`/`Bcc` headers.
//! - `epismail -i` is accepted for compatibility but is a no-op: the
//!   pipeline here never reads a line-oriented `DATA` stream, so a lone
//!   `.` line was never going to be mistaken for a terminator to begin
//!   with.
//! - `epismail -x <headers_file> [attach1 ...]` is like `-t` but reads
//!   the message from a file, optionally attaching further files as a
//!   MIME multipart.
//! - `epismail -m <recipient_list> <body_file>` bulk-sends one plain-text
//!   body file to every address in a comma-separated recipient list.

use std::path::PathBuf;

use clap::Parser;
use epistula::cli_support::{self, parse_address_list, parse_from_header, split_headers_body};
use mail_builder::MessageBuilder;
use smtp::inbound::LocalSubmission;

#[derive(Parser)]
#[command(name = "epismail")]
struct Cli {
    #[arg(short = 't')]
    from_headers: bool,

    #[arg(short = 'i')]
    literal_dot: bool,

    #[arg(short = 'x', value_name = "HEADERS_FILE")]
    headers_file: Option<PathBuf>,

    #[arg(short = 'm')]
    bulk: bool,

    /// `-x`'s attachment files, or `-m`'s `<recipient_list> <body_file>`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    rest: Vec<String>,

    #[arg(long, default_value = "conf/epistula.toml")]
    config: String,
}

fn main() {
    let cli = Cli::parse();
    let _ = cli.literal_dot;

    let (core, short_form) = match cli_support::open_core(&cli.config) {
        Ok(opened) => opened,
        Err(err) => {
            err.log();
            std::process::exit(2);
        }
    };

    let code = if cli.bulk {
        run_bulk(&cli.rest, &core.hostname)
    } else if let Some(headers_file) = &cli.headers_file {
        run_from_file(headers_file, &cli.rest)
    } else if cli.from_headers {
        run_from_stdin()
    } else {
        eprintln!("usage: epismail -t | -i | -x <headers_file> [attach...] | -m <recipients> <body_file>");
        std::process::exit(1);
    };

    let code = match code {
        Ok(submission) => cli_support::submit(&core, &short_form, submission),
        Err(code) => code,
    };
    std::process::exit(code);
}

fn run_from_stdin() -> Result<LocalSubmission, i32> {
    use std::io::Read;
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw).map_err(|_| 2)?;
    submission_from_message(&raw)
}

fn run_from_file(headers_file: &PathBuf, attachments: &[String]) -> Result<LocalSubmission, i32> {
    let raw = std::fs::read_to_string(headers_file).map_err(|_| 2)?;
    if attachments.is_empty() {
        return submission_from_message(&raw);
    }

    let (headers, body) = split_headers_body(&raw);
    let from = cli_support::header_values(headers, "From").first().copied().unwrap_or_default();
    let (sender_realname, sender_address) = parse_from_header(from);
    let recipients = recipients_from_headers(headers);
    if recipients.is_empty() {
        return Err(2);
    }
    let subject = cli_support::header_values(headers, "Subject").first().copied().unwrap_or_default();

    let mut message = MessageBuilder::new()
        .from((sender_realname.as_str(), sender_address.as_str()))
        .to(recipients.iter().map(|addr| ("", addr.as_str())).collect::<Vec<_>>())
        .subject(subject)
        .text_body(body.to_string());
    for path in attachments {
        let contents = std::fs::read(path).map_err(|_| 2)?;
        let filename = PathBuf::from(path).file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| path.clone());
        message = message.attachment("application/octet-stream", filename, contents);
    }

    let mut out = Vec::new();
    message.write_to(&mut out).map_err(|_| 2)?;

    Ok(LocalSubmission {
        body: out,
        sender_address,
        sender_realname,
        recipients,
        client_ip: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        authenticated_as: None,
    })
}

fn run_bulk(rest: &[String], hostname: &str) -> Result<LocalSubmission, i32> {
    let [recipient_list, body_file] = rest else {
        eprintln!("usage: epismail -m <recipient_list> <body_file>");
        return Err(1);
    };
    let recipients = parse_address_list(recipient_list);
    if recipients.is_empty() {
        return Err(2);
    }
    let body = std::fs::read(body_file).map_err(|_| 2)?;

    Ok(LocalSubmission {
        body,
        sender_address: format!("postmaster@{hostname}"),
        sender_realname: String::new(),
        recipients,
        client_ip: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        authenticated_as: None,
    })
}

fn submission_from_message(raw: &str) -> Result<LocalSubmission, i32> {
    let (headers, _) = split_headers_body(raw);
    let from = cli_support::header_values(headers, "From").first().copied().unwrap_or_default();
    let (sender_realname, sender_address) = parse_from_header(from);
    let recipients = recipients_from_headers(headers);
    if recipients.is_empty() {
        return Err(2);
    }

    Ok(LocalSubmission {
        body: raw.as_bytes().to_vec(),
        sender_address,
        sender_realname,
        recipients,
        client_ip: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        authenticated_as: None,
    })
}

fn recipients_from_headers(headers: &str) -> Vec<String> {
    ["To", "Cc", "Bcc"]
        .iter()
        .flat_map(|name| cli_support::header_values(headers, name))
        .flat_map(parse_address_list)
        .collect()
}

