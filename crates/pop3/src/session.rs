/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The POP3 session state machine (spec §4.8): holds the pure decision
//! logic only — manifest loading, account authentication and repository
//! fetches are all I/O performed by the caller (`crate::inbound`) and
//! handed back in as already-resolved parameters, the same split
//! `smtp::session::Session` uses for the SMTP side.
//!
//! Messages are addressed by their fixed position in `entries`, assigned
//! once at `load_mailbox` time and never renumbered for the life of the
//! session — a `DELE`d message keeps its sequence number (with its size
//! zeroed as the deletion marker) until `QUIT` drops it from the
//! listings entirely.

use std::net::IpAddr;

use store::{manifest::ManifestEntry, DatumId};

use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ExpectAuth,
    ExpectAuthUser,
    ExpectAuthPass,
    ExpectPass,
    ExpectCmds,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEffect {
    BlacklistPop3 { ttl_secs: i64 },
}

pub struct PopEffect {
    pub response: Vec<u8>,
    pub reputation: Option<ReputationEffect>,
}

impl PopEffect {
    fn plain(response: impl Into<String>) -> Self {
        PopEffect {
            response: response.into().into_bytes(),
            reputation: None,
        }
    }

    fn bytes(response: Vec<u8>) -> Self {
        PopEffect {
            response,
            reputation: None,
        }
    }

    fn with_reputation(response: impl Into<String>, effect: ReputationEffect) -> Self {
        PopEffect {
            response: response.into().into_bytes(),
            reputation: Some(effect),
        }
    }
}

/// What the async wiring must fetch from the binary repository before
/// the state machine can render a `RETR`/`TOP` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRequest {
    Retr { datum_id: DatumId, msg_no: u32 },
    Top { datum_id: DatumId, msg_no: u32 },
}

pub struct Session {
    pub state: State,
    pub remote_ip: IpAddr,
    pub username: Option<String>,
    pub entries: Vec<ManifestEntry>,
    pub deletes: u32,
}

impl Session {
    pub fn new(remote_ip: IpAddr) -> Self {
        Session {
            state: State::ExpectAuth,
            remote_ip,
            username: None,
            entries: Vec::new(),
            deletes: 0,
        }
    }

    pub fn greeting(&self) -> &'static str {
        wire::GREETING
    }

    /// `CAPA` and `QUIT` are accepted at any state (spec §4.8); the
    /// caller dispatches them before consulting `self.state` at all.
    pub fn handle_capa(&self) -> PopEffect {
        PopEffect::plain(wire::CAPA)
    }

    pub fn handle_quit(&mut self) -> PopEffect {
        self.state = State::Terminal;
        PopEffect::plain(wire::QUIT_OK)
    }

    /// True once `QUIT` has run and at least one `DELE` landed this
    /// session — the only condition under which the manifest needs a
    /// rewrite (spec §4.8.1: `SavePop3File` is a no-op with no deletes).
    pub fn needs_manifest_save(&self) -> bool {
        self.deletes > 0
    }

    pub fn handle_user(&mut self, name: &str) -> PopEffect {
        if self.state != State::ExpectAuth {
            return PopEffect::plain(wire::ERR_PROTOCOL);
        }
        if name.is_empty() {
            return PopEffect::plain(wire::ERR_NO_USERNAME);
        }
        self.username = Some(name.to_string());
        self.state = State::ExpectPass;
        PopEffect::plain(wire::user_ok(name))
    }

    pub fn handle_apop(&self) -> PopEffect {
        PopEffect::plain(wire::ERR_APOP_UNSUPPORTED)
    }

    pub fn handle_auth_start(&mut self) -> PopEffect {
        if self.state != State::ExpectAuth {
            return PopEffect::plain(wire::ERR_PROTOCOL);
        }
        self.state = State::ExpectAuthUser;
        PopEffect::plain(wire::AUTH_USERNAME_CHALLENGE)
    }

    pub fn handle_auth_user(&mut self, name: String) -> PopEffect {
        self.username = Some(name);
        self.state = State::ExpectAuthPass;
        PopEffect::plain(wire::AUTH_PASSWORD_CHALLENGE)
    }

    /// `authenticated` has already been checked by the caller against
    /// the subscriber store. On failure the IP is blacklisted for 900s
    /// (spec §4.8, mirroring the SMTP `AUTH_FAILURE` blacklist).
    pub fn fail_authentication(&mut self) -> PopEffect {
        self.state = State::Terminal;
        PopEffect::with_reputation(wire::ERR_AUTH_FAILED, ReputationEffect::BlacklistPop3 { ttl_secs: 900 })
    }

    /// The manifest failed to open: terminal, per the canonical
    /// implementation's "internal fault, list failed" reply.
    pub fn manifest_unavailable(&mut self) -> PopEffect {
        self.state = State::Terminal;
        PopEffect::plain(wire::ERR_LIST_FAILED)
    }

    pub fn load_mailbox(&mut self, entries: Vec<ManifestEntry>) -> PopEffect {
        self.entries = entries;
        self.deletes = 0;
        self.state = State::ExpectCmds;
        let username = self.username.clone().unwrap_or_default();
        PopEffect::plain(wire::pass_ok(&username))
    }

    fn live_entries(&self) -> impl Iterator<Item = (u32, &ManifestEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i as u32 + 1, e))
            .filter(|(_, e)| e.size != 0)
    }

    pub fn total_size(&self) -> u64 {
        self.live_entries().map(|(_, e)| e.size as u64).sum()
    }

    pub fn live_count(&self) -> usize {
        self.live_entries().count()
    }

    pub fn handle_stat(&self) -> PopEffect {
        if self.state != State::ExpectCmds {
            return PopEffect::plain(wire::ERR_PROTOCOL);
        }
        PopEffect::plain(wire::stat_ok(self.live_count(), self.total_size()))
    }

    pub fn handle_list(&self, arg: Option<u32>) -> PopEffect {
        if self.state != State::ExpectCmds {
            return PopEffect::plain(wire::ERR_PROTOCOL);
        }
        match arg {
            None => {
                let live: Vec<(u32, u32)> = self.live_entries().map(|(n, e)| (n, e.size)).collect();
                PopEffect::plain(wire::list_all(&live, self.total_size()))
            }
            Some(msg_no) => match self.lookup_live(msg_no) {
                Ok(entry) => PopEffect::plain(wire::list_one(msg_no, entry.size)),
                Err(effect) => effect,
            },
        }
    }

    pub fn handle_uidl(&self, arg: Option<u32>) -> PopEffect {
        if self.state != State::ExpectCmds {
            return PopEffect::plain(wire::ERR_PROTOCOL);
        }
        match arg {
            None => {
                let live: Vec<(u32, DatumId)> = self.live_entries().map(|(n, e)| (n, e.datum_id)).collect();
                PopEffect::plain(wire::uidl_all(&live, self.total_size(), self.live_count()))
            }
            Some(msg_no) => match self.lookup_live(msg_no) {
                Ok(entry) => PopEffect::plain(wire::uidl_one(msg_no, entry.datum_id)),
                Err(effect) => effect,
            },
        }
    }

    pub fn handle_dele(&mut self, msg_no: u32) -> PopEffect {
        if self.state != State::ExpectCmds {
            return PopEffect::plain(wire::ERR_PROTOCOL);
        }
        match self.lookup_live_index(msg_no) {
            Ok(index) => {
                self.entries[index].size = 0;
                self.deletes += 1;
                PopEffect::plain(wire::OK_BARE)
            }
            Err(effect) => effect,
        }
    }

    /// Validates `n`, returning what the async wiring must fetch from
    /// the repository. The actual fetch and response rendering happen
    /// back in `render_retr` once the bytes are in hand.
    pub fn handle_retr_request(&self, msg_no: u32) -> Result<FetchRequest, PopEffect> {
        if self.state != State::ExpectCmds {
            return Err(PopEffect::plain(wire::ERR_PROTOCOL));
        }
        let entry = self.lookup_live(msg_no)?;
        Ok(FetchRequest::Retr {
            datum_id: entry.datum_id,
            msg_no,
        })
    }

    pub fn handle_top_request(&self, msg_no: u32) -> Result<FetchRequest, PopEffect> {
        if self.state != State::ExpectCmds {
            return Err(PopEffect::plain(wire::ERR_PROTOCOL));
        }
        let entry = self.lookup_live(msg_no)?;
        Ok(FetchRequest::Top {
            datum_id: entry.datum_id,
            msg_no,
        })
    }

    pub fn render_retr(&self, body: &[u8]) -> PopEffect {
        PopEffect::bytes(wire::retr_response(body))
    }

    pub fn render_top(&self, body: &[u8]) -> PopEffect {
        PopEffect::bytes(wire::top_response(body))
    }

    pub fn handle_noop(&self) -> PopEffect {
        if self.state != State::ExpectCmds {
            return PopEffect::plain(wire::ERR_PROTOCOL);
        }
        PopEffect::plain(wire::OK_BARE)
    }

    /// Per spec §4.8, `RSET` is `+OK` with no further side effect —
    /// unlike RFC 1939's RSET, deletions already marked this session are
    /// not undone.
    pub fn handle_rset(&self) -> PopEffect {
        if self.state != State::ExpectCmds {
            return PopEffect::plain(wire::ERR_PROTOCOL);
        }
        PopEffect::plain(wire::OK_BARE)
    }

    pub fn handle_unexpected(&self, line: &str) -> PopEffect {
        match self.state {
            State::ExpectAuth => PopEffect::plain(wire::ERR_PROTOCOL),
            State::ExpectPass => PopEffect::plain(wire::ERR_EXPECTED_PASS),
            _ => PopEffect::plain(wire::could_not_understand(line)),
        }
    }

    fn lookup_live_index(&self, msg_no: u32) -> Result<usize, PopEffect> {
        if msg_no == 0 || msg_no as usize > self.entries.len() {
            return Err(PopEffect::plain(wire::ERR_NO_SUCH_MESSAGE_RANGE));
        }
        let index = msg_no as usize - 1;
        if self.entries[index].size == 0 {
            return Err(PopEffect::plain(wire::ERR_NO_SUCH_MESSAGE_DELETED));
        }
        Ok(index)
    }

    fn lookup_live(&self, msg_no: u32) -> Result<ManifestEntry, PopEffect> {
        self.lookup_live_index(msg_no).map(|i| self.entries[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn new_session() -> Session {
        Session::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)))
    }

    fn loaded_session() -> Session {
        let mut session = new_session();
        session.username = Some("bob".to_string());
        session.load_mailbox(vec![
            ManifestEntry { datum_id: DatumId(1), size: 512 },
            ManifestEntry { datum_id: DatumId(2), size: 300 },
        ]);
        session
    }

    #[test]
    fn user_then_pass_reaches_expect_cmds() {
        let mut session = new_session();
        let effect = session.handle_user("bob");
        assert_eq!(session.state, State::ExpectPass);
        assert_eq!(effect.response, b"+OK bob\r\n");

        let effect = session.load_mailbox(vec![]);
        assert_eq!(session.state, State::ExpectCmds);
        assert_eq!(effect.response, b"+OK bob is cool\r\n");
    }

    #[test]
    fn failed_authentication_blacklists_and_terminates() {
        let mut session = new_session();
        session.username = Some("bob".to_string());
        session.state = State::ExpectPass;
        let effect = session.fail_authentication();
        assert_eq!(session.state, State::Terminal);
        assert_eq!(effect.reputation, Some(ReputationEffect::BlacklistPop3 { ttl_secs: 900 }));
    }

    #[test]
    fn stat_reports_live_count_and_total_size() {
        let session = loaded_session();
        let effect = session.handle_stat();
        assert_eq!(effect.response, b"+OK 2 812\r\n");
    }

    #[test]
    fn dele_zeroes_size_and_excludes_from_stat() {
        let mut session = loaded_session();
        let effect = session.handle_dele(2);
        assert_eq!(effect.response, wire::OK_BARE.as_bytes());
        assert_eq!(session.entries[1].size, 0);
        assert!(session.needs_manifest_save());

        let stat = session.handle_stat();
        assert_eq!(stat.response, b"+OK 1 512\r\n");
    }

    #[test]
    fn dele_preserves_sequence_numbers_of_other_messages() {
        let mut session = loaded_session();
        session.handle_dele(1);
        let effect = session.handle_list(Some(2));
        assert_eq!(effect.response, b"+OK 2 300\r\n");
    }

    #[test]
    fn dele_twice_on_same_message_is_no_such_message() {
        let mut session = loaded_session();
        session.handle_dele(1);
        let effect = session.handle_dele(1);
        assert_eq!(effect.response, wire::ERR_NO_SUCH_MESSAGE_DELETED.as_bytes());
    }

    #[test]
    fn uidl_one_reports_the_real_sequence_number_not_a_stale_counter() {
        let session = loaded_session();
        let effect = session.handle_uidl(Some(2));
        assert_eq!(effect.response, b"+OK 2 ep0000000002\r\n");
    }

    #[test]
    fn retr_out_of_range_is_rejected_before_any_fetch() {
        let session = loaded_session();
        assert!(session.handle_retr_request(99).is_err());
    }

    #[test]
    fn retr_request_resolves_to_the_right_datum_id() {
        let session = loaded_session();
        let request = session.handle_retr_request(2).unwrap();
        assert_eq!(request, FetchRequest::Retr { datum_id: DatumId(2), msg_no: 2 });
    }

    #[test]
    fn quit_terminates_without_requiring_save_when_no_deletes_happened() {
        let mut session = loaded_session();
        let effect = session.handle_quit();
        assert_eq!(effect.response, wire::QUIT_OK.as_bytes());
        assert_eq!(session.state, State::Terminal);
        assert!(!session.needs_manifest_save());
    }
}
