/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Async wiring for one POP3 connection (spec §4.6, §4.8): reads command
//! lines off the socket, resolves whatever the synchronous [`Session`]
//! state machine needs (account authentication, manifest loading,
//! repository fetches) and feeds the verdicts back in, writing each
//! [`PopEffect`] response to the peer. The manifest save (spec §4.8.1)
//! runs once at `QUIT`, mirroring the canonical implementation's
//! `SavePop3File`.

use std::{collections::HashSet, sync::Arc};

use common::Core;
use store::{DatumId, Manifest};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::TcpStream,
};
use utils::reputation as rep;

use crate::session::{FetchRequest, PopEffect, Session, State};
use crate::wire;

/// Drives one POP3 connection end to end. Intended to be wrapped in a
/// closure and passed as the `on_accept` callback to
/// `utils::listener::serve`.
pub async fn handle_connection(core: Arc<Core>, stream: TcpStream, peer: std::net::SocketAddr) {
    if let Err(err) = run(core, stream, peer).await {
        err.log();
    }
}

async fn run(core: Arc<Core>, stream: TcpStream, peer: std::net::SocketAddr) -> trc::Result<()> {
    use tokio::io::AsyncBufReadExt;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut session = Session::new(peer.ip());
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

        let effect = dispatch(&core, &mut session, &line).await?;
        write_half
            .write_all(&effect.response)
            .await
            .map_err(|e| trc::Error::TransientPeer(format!("write response: {e}")))?;
        if let Some(reputation_effect) = effect.reputation {
            apply_reputation_effect(&core, peer.ip(), reputation_effect);
        }

        if session.state == State::Terminal {
            if session.needs_manifest_save() {
                if let Some(username) = session.username.clone() {
                    if let Err(err) = save_manifest(&core, &username, &session) {
                        err.log();
                    }
                }
            }
            return Ok(());
        }
    }
}

fn apply_reputation_effect(core: &Core, ip: std::net::IpAddr, effect: crate::session::ReputationEffect) {
    let std::net::IpAddr::V4(ipv4) = ip else {
        return;
    };
    match effect {
        crate::session::ReputationEffect::BlacklistPop3 { ttl_secs } => {
            core.reputation.blacklist(ipv4, rep::POP3, utils::now(), Some(ttl_secs));
        }
    }
}

/// Rewrites the account's manifest, dropping every entry the session
/// zeroed out via `DELE`. Re-opening the manifest fresh (rather than
/// reusing the handle from `PASS` time) is the grow-check: appends from
/// concurrent SMTP ingress land after the entries this session ever saw
/// and are addressed by `datum_id`, so they can never be mistaken for a
/// deletion and can never be lost (spec §4.8.1, testable property #2).
fn save_manifest(core: &Core, username: &str, session: &Session) -> trc::Result<()> {
    let deleted: HashSet<DatumId> = session
        .entries
        .iter()
        .filter(|e| e.size == 0)
        .map(|e| e.datum_id)
        .collect();
    if deleted.is_empty() {
        return Ok(());
    }

    let path = store::Store::manifest_path(&core.config.server.mailbox_root, username)?;
    let manifest = Manifest::open(&path)?;
    manifest.compact(|e| !deleted.contains(&e.datum_id))?;
    if manifest.is_empty() {
        let _ = std::fs::remove_file(&path);
    }
    Ok(())
}

async fn dispatch(core: &Core, session: &mut Session, line: &str) -> trc::Result<PopEffect> {
    let upper = line.to_ascii_uppercase();

    if upper == "QUIT" {
        return Ok(session.handle_quit());
    }
    if upper == "CAPA" {
        return Ok(session.handle_capa());
    }

    match session.state {
        State::ExpectAuthUser => {
            let decoded = utils::codec::base64::decode(line.bytes())
                .and_then(|b| String::from_utf8(b).ok())
                .unwrap_or_default();
            Ok(session.handle_auth_user(decoded))
        }
        State::ExpectAuthPass => {
            let decoded_password = utils::codec::base64::decode(line.bytes())
                .and_then(|b| String::from_utf8(b).ok())
                .unwrap_or_default();
            let username = session.username.clone().unwrap_or_default();
            Ok(complete_authentication(core, session, &username, &decoded_password).await)
        }
        State::ExpectAuth => {
            if upper == "AUTH" || upper == "AUTH LOGIN" {
                Ok(session.handle_auth_start())
            } else if upper.starts_with("USER ") {
                Ok(session.handle_user(line[5..].trim()))
            } else if upper.starts_with("APOP") {
                Ok(session.handle_apop())
            } else {
                Ok(session.handle_unexpected(line))
            }
        }
        State::ExpectPass => {
            if upper.starts_with("PASS ") {
                let username = session.username.clone().unwrap_or_default();
                let password = line[5..].trim().to_string();
                Ok(complete_authentication(core, session, &username, &password).await)
            } else {
                Ok(session.handle_unexpected(line))
            }
        }
        State::ExpectCmds => handle_transaction_command(core, session, &upper, line).await,
        State::Terminal => Ok(session.handle_unexpected(line)),
    }
}

async fn complete_authentication(core: &Core, session: &mut Session, username: &str, password: &str) -> PopEffect {
    let authenticated = core.directory.accounts.authenticate(username, password).unwrap_or(false);
    if !authenticated {
        return session.fail_authentication();
    }

    let path = match store::Store::manifest_path(&core.config.server.mailbox_root, username) {
        Ok(path) => path,
        Err(err) => {
            err.log();
            return session.manifest_unavailable();
        }
    };
    match Manifest::open(&path) {
        Ok(manifest) => session.load_mailbox(manifest.entries()),
        Err(err) => {
            err.log();
            session.manifest_unavailable()
        }
    }
}

async fn handle_transaction_command(core: &Core, session: &mut Session, upper: &str, line: &str) -> trc::Result<PopEffect> {
    if upper == "STAT" {
        return Ok(session.handle_stat());
    }
    if upper == "NOOP" {
        return Ok(session.handle_noop());
    }
    if upper == "RSET" {
        return Ok(session.handle_rset());
    }
    if upper == "LIST" {
        return Ok(session.handle_list(None));
    }
    if upper == "UIDL" {
        return Ok(session.handle_uidl(None));
    }
    if let Some(arg) = upper.strip_prefix("LIST ") {
        return Ok(session.handle_list(parse_msg_no(arg)));
    }
    if let Some(arg) = upper.strip_prefix("UIDL ") {
        return Ok(session.handle_uidl(parse_msg_no(arg)));
    }
    if let Some(arg) = upper.strip_prefix("DELE ") {
        return Ok(match parse_msg_no(arg) {
            Some(n) => session.handle_dele(n),
            None => PopEffect {
                response: wire::ERR_NO_SUCH_MESSAGE.as_bytes().to_vec(),
                reputation: None,
            },
        });
    }
    if let Some(arg) = upper.strip_prefix("RETR ") {
        return fetch_and_render(core, session, parse_msg_no(arg), true).await;
    }
    if upper.starts_with("TOP ") {
        let arg = upper["TOP ".len()..].trim();
        let msg_no = arg.split_whitespace().next().and_then(|s| s.parse::<u32>().ok());
        return fetch_and_render(core, session, msg_no, false).await;
    }
    Ok(session.handle_unexpected(line))
}

fn parse_msg_no(arg: &str) -> Option<u32> {
    arg.trim().parse().ok()
}

async fn fetch_and_render(core: &Core, session: &mut Session, msg_no: Option<u32>, retr: bool) -> trc::Result<PopEffect> {
    let Some(msg_no) = msg_no else {
        return Ok(session.handle_unexpected(""));
    };
    let request = if retr {
        session.handle_retr_request(msg_no)
    } else {
        session.handle_top_request(msg_no)
    };
    let datum_id = match request {
        Ok(FetchRequest::Retr { datum_id, .. }) | Ok(FetchRequest::Top { datum_id, .. }) => datum_id,
        Err(effect) => return Ok(effect),
    };

    match core.store.repo.fetch_owned(datum_id) {
        Ok(body) => Ok(if retr {
            session.render_retr(&body)
        } else {
            session.render_top(&body)
        }),
        Err(err) => {
            err.log();
            Ok(session.manifest_unavailable())
        }
    }
}
