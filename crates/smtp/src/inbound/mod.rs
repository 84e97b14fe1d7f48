/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Async wiring for one SMTP connection (spec §4.6, §4.7): reads command
//! lines off the socket, resolves whatever the synchronous [`Session`]
//! state machine needs (DNS, directory, reputation) and feeds the
//! verdicts back in, writing each [`SessionEffect`] response to the
//! peer. The persistence pipeline runs once `DATA` completes.

pub mod dns;

use std::sync::Arc;

use common::Core;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedReadHalf, TcpStream},
};
use utils::reputation as rep;

use crate::{
    persist::{self, PersistInput, ShortFormStore},
    session::{DnsVerdict, MailFromParams, Session, SessionEffect, SmtpVariant, State},
};
use dns::DnsChecker;

/// Drives one SMTP connection end to end. Intended to be wrapped in a
/// closure and passed as the `on_accept` callback to
/// `utils::listener::serve`.
pub async fn handle_connection<D: DnsChecker>(
    core: Arc<Core>,
    resolver: Arc<D>,
    short_form: Arc<ShortFormStore>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
    variant: SmtpVariant,
) {
    if let Err(err) = run(core, resolver, short_form, stream, peer, variant).await {
        err.log();
    }
}

async fn run<D: DnsChecker>(
    core: Arc<Core>,
    resolver: Arc<D>,
    short_form: Arc<ShortFormStore>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
    variant: SmtpVariant,
) -> trc::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut session = Session::new(variant, core.hostname.clone(), peer.ip());
    let mut accepted_recipients: Vec<String> = Vec::new();
    write_half
        .write_all(session.greeting().as_bytes())
        .await
        .map_err(|e| trc::Error::TransientPeer(format!("write greeting: {e}")))?;

    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| trc::Error::TransientPeer(format!("read command: {e}")))?;
        if read == 0 {
            return Ok(());
        }
        let line = line.trim_end_matches(['\r', '\n']).to_string();

        let effect = dispatch(
            &core,
            resolver.as_ref(),
            &short_form,
            &mut session,
            &line,
            &mut reader,
            &mut accepted_recipients,
        )
        .await?;
        let was_quit = session.state == State::ExpectQuit && line.eq_ignore_ascii_case("QUIT");
        write_half
            .write_all(effect.response.as_bytes())
            .await
            .map_err(|e| trc::Error::TransientPeer(format!("write response: {e}")))?;
        if let Some(reputation_effect) = effect.reputation {
            apply_reputation_effect(&core, peer.ip(), reputation_effect);
        }
        if was_quit {
            return Ok(());
        }
    }
}

fn apply_reputation_effect(core: &Core, ip: std::net::IpAddr, effect: crate::session::ReputationEffect) {
    let std::net::IpAddr::V4(ipv4) = ip else {
        return;
    };
    match effect {
        crate::session::ReputationEffect::BlacklistSmtp { ttl_secs } => {
            core.reputation.blacklist(ipv4, rep::SMTP, utils::now(), Some(ttl_secs));
        }
    }
}

async fn dispatch<D: DnsChecker>(
    core: &Core,
    resolver: &D,
    short_form: &ShortFormStore,
    session: &mut Session,
    line: &str,
    reader: &mut BufReader<OwnedReadHalf>,
    accepted_recipients: &mut Vec<String>,
) -> trc::Result<SessionEffect> {
    if session.state == State::ExpectAuthUser {
        let decoded = utils::codec::base64::decode(line.bytes())
            .and_then(|b| String::from_utf8(b).ok())
            .unwrap_or_default();
        return Ok(session.handle_auth_user(decoded));
    }
    if session.state == State::ExpectAuthPass {
        let decoded_password = utils::codec::base64::decode(line.bytes())
            .and_then(|b| String::from_utf8(b).ok())
            .unwrap_or_default();
        let username = session.pending_auth_user().unwrap_or("").to_string();
        let authenticated = core.directory.accounts.authenticate(&username, &decoded_password).unwrap_or(false);
        let whitelisted = match session.remote_ip {
            std::net::IpAddr::V4(ip) => core.reputation.is_whitelisted(ip, utils::now()),
            std::net::IpAddr::V6(_) => false,
        };
        return Ok(session.handle_auth_pass(authenticated, whitelisted));
    }

    let upper = line.to_ascii_uppercase();
    if upper.starts_with("HELO") || upper.starts_with("EHLO") {
        let ehlo = upper.starts_with("EHLO");
        let name = line.get(4..).unwrap_or("").trim().to_string();
        let peer_ip = session.remote_ip.to_string();
        return Ok(session.handle_helo(ehlo, &name, &peer_ip));
    }
    if upper.starts_with("AUTH LOGIN") {
        if session.variant == SmtpVariant::Alien {
            return Ok(session.handle_alien_auth_attempt());
        }
        return Ok(session.handle_auth_login_start());
    }
    if upper.starts_with("MAIL FROM") {
        return mail_from(core, resolver, session, line).await;
    }
    if upper.starts_with("RCPT TO") {
        return Ok(rcpt_to(core, session, line, accepted_recipients));
    }
    if upper == "DATA" {
        let effect = session.handle_data_command();
        if session.state == State::ExpectData {
            return read_data(core, short_form, session, reader, accepted_recipients).await;
        }
        return Ok(effect);
    }
    if upper == "QUIT" {
        return Ok(session.handle_quit());
    }
    Ok(session.handle_unexpected())
}

async fn mail_from<D: DnsChecker>(
    core: &Core,
    resolver: &D,
    session: &mut Session,
    line: &str,
) -> trc::Result<SessionEffect> {
    let address = extract_address(line);
    let Some(address) = address.filter(|a| !a.is_empty()) else {
        return Ok(session.handle_mail_from(MailFromParams {
            address: None,
            is_local_domain: false,
            is_banned: false,
            dns: DnsVerdict::Ok { skunk: false },
            permitted_originator: None,
        }));
    };

    let domain = address.rsplit_once('@').map(|(_, d)| d.to_string()).unwrap_or_default();
    let is_local_domain = core.directory.routing.is_local_domain(&domain);
    let is_banned = core.config.is_banned_domain(&domain);
    let dns = if session.variant == SmtpVariant::Alien && !is_banned {
        resolver.verdict(session.remote_ip, &session.helo_domain, &domain).await
    } else {
        DnsVerdict::Ok { skunk: false }
    };
    let permitted_originator = if session.variant == SmtpVariant::Submission {
        session
            .authenticated_as
            .as_ref()
            .map(|user| core.directory.routing.is_permitted_originator(user, &address))
    } else {
        None
    };

    Ok(session.handle_mail_from(MailFromParams {
        address: Some(address),
        is_local_domain,
        is_banned,
        dns,
        permitted_originator,
    }))
}

fn rcpt_to(core: &Core, session: &mut Session, line: &str, accepted_recipients: &mut Vec<String>) -> SessionEffect {
    let address = extract_address(line).unwrap_or_default();
    let resolution = core.directory.routing.resolve_recipient(&address);
    let effect = session.handle_rcpt(&address, resolution);
    if effect.response.starts_with("250") {
        accepted_recipients.push(address);
    }
    effect
}

fn extract_address(line: &str) -> Option<String> {
    let start = line.find('<')?;
    let end = line[start..].find('>')? + start;
    Some(line[start + 1..end].to_string())
}

async fn read_data(
    core: &Core,
    short_form: &ShortFormStore,
    session: &mut Session,
    reader: &mut BufReader<OwnedReadHalf>,
    accepted_recipients: &[String],
) -> trc::Result<SessionEffect> {
    loop {
        let mut line = Vec::new();
        let read = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| trc::Error::TransientPeer(format!("read data: {e}")))?;
        if read == 0 {
            return Ok(session.handle_persistence_failure());
        }
        if session.feed_data(&line) {
            break;
        }
    }

    let raw = session.data.copy_out();
    let body = unstuff_and_trim_terminator(&raw);
    let body = prepend_trace_headers(core, session, body);
    let message_id = extract_message_id(&body);
    let spam_hit = body_matches_spam_keywords(core, &body);

    let effect = session.handle_data_complete(spam_hit, message_id.is_some());
    if !effect.response.starts_with("250") {
        return Ok(effect);
    }

    if session.quarantine {
        return match crate::quarantine::write(core, &body) {
            Ok(_) => Ok(effect),
            Err(err) => {
                err.log();
                Ok(session.handle_persistence_failure())
            }
        };
    }

    let Some(mail_from) = session.mail_from.clone() else {
        return Ok(session.handle_persistence_failure());
    };

    let subject = extract_subject(&body);
    let input = PersistInput {
        body,
        sender_address: mail_from.address.clone(),
        sender_domain: mail_from.domain.clone(),
        sender_realname: session.realname.clone(),
        subject,
        message_id: message_id.unwrap_or_else(|| format!("<{}@{}>", utils::now(), core.hostname)),
        recipients: accepted_recipients.to_vec(),
        mailbox_targets: session.mailbox_targets.clone(),
        relay_targets: session.relay_targets.clone(),
        client_ip: session.remote_ip,
        resolved_fqdn: None,
        authenticated_as: session.authenticated_as.clone(),
    };

    match persist::persist_message(core, short_form, input) {
        Ok(_) => Ok(effect),
        Err(err) => {
            err.log();
            Ok(session.handle_persistence_failure())
        }
    }
}

/// Strips the trailing `\r\n.\r\n` terminator and undoes transparency
/// dot-stuffing (RFC 5321 §4.5.2) on the lines that remain.
fn unstuff_and_trim_terminator(raw: &[u8]) -> Vec<u8> {
    let body = raw.strip_suffix(b"\r\n.\r\n").unwrap_or(raw);
    let mut out = Vec::with_capacity(body.len());
    for (i, line) in body.split_inclusive(|&b| b == b'\n').enumerate() {
        if i > 0 && line.starts_with(b".") {
            out.extend_from_slice(&line[1..]);
        } else {
            out.extend_from_slice(line);
        }
    }
    out
}

/// Synthesizes the `Return-Path:` and `Received:` trace headers a
/// conforming MTA prepends at `DATA` acceptance (spec §4.7 EXPECT_RECIPIENT)
/// and returns the body with them in front. Applies uniformly to both the
/// quarantine and the normal persistence path, since the synthesis happens
/// at the EXPECT_RECIPIENT → EXPECT_DATA transition, before either is chosen.
fn prepend_trace_headers(core: &Core, session: &Session, body: Vec<u8>) -> Vec<u8> {
    let sender = session.mail_from.as_ref().map(|a| a.address.as_str()).unwrap_or("");
    let protocol = if session.authenticated_as.is_some() { "ESMTPA" } else { "ESMTP" };
    let date = utils::format_trace_date(chrono::Utc::now());
    let mut out = Vec::with_capacity(body.len() + 192);
    out.extend_from_slice(format!("Return-Path: <{sender}>\r\n").as_bytes());
    out.extend_from_slice(
        format!(
            "Received: from {} ([{}])\r\n\tby {} (Epistula) with {protocol}; {date}\r\n",
            session.helo_domain, session.remote_ip, core.hostname,
        )
        .as_bytes(),
    );
    out.extend_from_slice(&body);
    out
}

fn extract_message_id(body: &[u8]) -> Option<String> {
    let headers_end = body.windows(4).position(|w| w == b"\r\n\r\n").unwrap_or(body.len());
    let headers = std::str::from_utf8(&body[..headers_end]).ok()?;
    for line in headers.lines() {
        if let Some(value) = line.strip_prefix("Message-ID:").or_else(|| line.strip_prefix("Message-Id:")) {
            return Some(value.trim().to_string());
        }
    }
    None
}

fn extract_subject(body: &[u8]) -> String {
    let headers_end = body.windows(4).position(|w| w == b"\r\n\r\n").unwrap_or(body.len());
    let Ok(headers) = std::str::from_utf8(&body[..headers_end]) else {
        return String::new();
    };
    for line in headers.lines() {
        if let Some(value) = line.strip_prefix("Subject:") {
            return value.trim().to_string();
        }
    }
    String::new()
}

/// A message submitted by one of the out-of-core CLI tools (spec §6,
/// `epismail`/`emailimp`) rather than read off a socket.
pub struct LocalSubmission {
    pub body: Vec<u8>,
    pub sender_address: String,
    pub sender_realname: String,
    pub recipients: Vec<String>,
    pub client_ip: std::net::IpAddr,
    pub authenticated_as: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalDeliveryOutcome {
    Stored,
    Duplicate,
    /// Every recipient resolved to a local address with no mailbox and no
    /// forward — nothing to persist or queue.
    NoDeliverableRecipients,
}

/// Runs the same persistence pipeline `read_data` drives at `DATA`
/// completion, but for a message the CLI tools hand in directly (spec
/// §14: `epismail`/`emailimp` call this instead of opening a socket).
/// Recipient routing is resolved exactly as `rcpt_to` resolves it for a
/// live SMTP transaction.
pub fn deliver_local_message(
    core: &Core,
    short_form: &ShortFormStore,
    submission: LocalSubmission,
) -> trc::Result<LocalDeliveryOutcome> {
    let sender_domain = submission.sender_address.rsplit_once('@').map(|(_, d)| d.to_string()).unwrap_or_default();
    let message_id = extract_message_id(&submission.body).unwrap_or_else(|| format!("<{}@{}>", utils::now(), core.hostname));
    let subject = extract_subject(&submission.body);

    let mut mailbox_targets = Vec::new();
    let mut relay_targets = Vec::new();
    let mut deliverable = Vec::new();
    for rcpt in &submission.recipients {
        match core.directory.routing.resolve_recipient(rcpt) {
            directory::RecipientResolution::Local { mailboxes, relays } => {
                deliverable.push(rcpt.clone());
                mailbox_targets.extend(mailboxes);
                relay_targets.extend(relays);
            }
            directory::RecipientResolution::Alien => {
                deliverable.push(rcpt.clone());
                relay_targets.push(rcpt.clone());
            }
            directory::RecipientResolution::NoMailbox => {}
        }
    }
    if deliverable.is_empty() {
        return Ok(LocalDeliveryOutcome::NoDeliverableRecipients);
    }

    let input = PersistInput {
        body: submission.body,
        sender_address: submission.sender_address.clone(),
        sender_domain,
        sender_realname: submission.sender_realname,
        subject,
        message_id,
        recipients: deliverable,
        mailbox_targets,
        relay_targets,
        client_ip: submission.client_ip,
        resolved_fqdn: None,
        authenticated_as: submission.authenticated_as,
    };

    match persist::persist_message(core, short_form, input)? {
        persist::PersistOutcome::Stored { .. } => Ok(LocalDeliveryOutcome::Stored),
        persist::PersistOutcome::Duplicate { .. } => Ok(LocalDeliveryOutcome::Duplicate),
    }
}

fn body_matches_spam_keywords(core: &Core, body: &[u8]) -> bool {
    if core.config.spam.keywords.is_empty() {
        return false;
    }
    let Ok(text) = std::str::from_utf8(body) else {
        return false;
    };
    let lower = text.to_ascii_lowercase();
    core.config.spam.keywords.iter().any(|kw| lower.contains(&kw.to_ascii_lowercase()))
}
