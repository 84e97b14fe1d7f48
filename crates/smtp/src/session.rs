/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The SMTP ingress state machine (spec §4.7): the alien and submission
//! port variants share this one implementation, differing only at the
//! sender-classification and authentication steps (`SmtpVariant`).
//!
//! This module holds the pure decision logic only — command parsing into
//! addresses and any I/O (DNS lookups, directory lookups, reputation
//! checks) is performed by the caller (`crate::inbound`) and the outcome
//! handed back in as already-resolved parameters. That keeps the state
//! transitions themselves synchronous and unit-testable without a
//! reactor or live DNS.

use std::net::IpAddr;

use directory::RecipientResolution;
use utils::chain::Chain;

use crate::wire;

pub const MAX_MESSAGE_SIZE: usize = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpVariant {
    Alien,
    Submission,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ExpectHello,
    ExpectSender,
    ExpectAuthUser,
    ExpectAuthPass,
    ExpectRecipient,
    ExpectData,
    ExpectQuit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAddress {
    pub address: String,
    pub address_lcase: String,
    pub domain: String,
}

impl SessionAddress {
    pub fn new(address: &str) -> Self {
        let address_lcase = address.to_ascii_lowercase();
        let domain = address_lcase.rsplit_once('@').map(|(_, d)| d.to_string()).unwrap_or_default();
        SessionAddress {
            address: address.to_string(),
            address_lcase,
            domain,
        }
    }

    /// The empty "callback" sender (`MAIL FROM:<>`).
    pub fn empty() -> Self {
        SessionAddress {
            address: String::new(),
            address_lcase: String::new(),
            domain: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsVerdict {
    /// PTR/MX checks passed; `skunk` is set when the peer's IP/FQDN
    /// matched none of the sender domain's MX hosts.
    Ok { skunk: bool },
    NoMx,
    TempFail,
}

pub struct MailFromParams {
    /// `None` for the empty/callback sender.
    pub address: Option<String>,
    pub is_local_domain: bool,
    pub is_banned: bool,
    pub dns: DnsVerdict,
    /// `Some(bool)` only on the submission variant, once AUTH succeeded:
    /// whether the authenticated user may originate this address.
    pub permitted_originator: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEffect {
    BlacklistSmtp { ttl_secs: i64 },
}

pub struct SessionEffect {
    pub response: String,
    pub reputation: Option<ReputationEffect>,
}

impl SessionEffect {
    fn plain(response: impl Into<String>) -> Self {
        SessionEffect {
            response: response.into(),
            reputation: None,
        }
    }

    fn with_reputation(response: impl Into<String>, effect: ReputationEffect) -> Self {
        SessionEffect {
            response: response.into(),
            reputation: Some(effect),
        }
    }
}

pub struct Session {
    pub variant: SmtpVariant,
    pub state: State,
    pub remote_ip: IpAddr,
    pub hostname: String,
    pub helo_domain: String,
    pub realname: String,

    pub mail_from: Option<SessionAddress>,
    pub sender_local_domain: bool,
    pub quarantine: bool,
    pub skunk: bool,

    pub authenticated_as: Option<String>,
    auth_pending_user: Option<String>,

    pub mailbox_targets: Vec<directory::routing::MailboxTarget>,
    pub relay_targets: Vec<String>,

    pub data: Chain,
    pub message_too_large: bool,
}

impl Session {
    pub fn new(variant: SmtpVariant, hostname: String, remote_ip: IpAddr) -> Self {
        Session {
            variant,
            state: State::ExpectHello,
            remote_ip,
            hostname,
            helo_domain: String::new(),
            realname: String::new(),
            mail_from: None,
            sender_local_domain: false,
            quarantine: false,
            skunk: false,
            authenticated_as: None,
            auth_pending_user: None,
            mailbox_targets: Vec::new(),
            relay_targets: Vec::new(),
            data: Chain::new(),
            message_too_large: false,
        }
    }

    pub fn greeting(&self) -> String {
        wire::greeting(&self.hostname)
    }

    /// The username decoded from `AUTH LOGIN`'s first challenge response,
    /// held until the password response arrives.
    pub fn pending_auth_user(&self) -> Option<&str> {
        self.auth_pending_user.as_deref()
    }

    pub fn handle_helo(&mut self, ehlo: bool, name: &str, peer_ip: &str) -> SessionEffect {
        if self.state != State::ExpectHello {
            return SessionEffect::plain(wire::BAD_HELO_SEQUENCE);
        }
        self.helo_domain = name.to_string();
        self.realname = name.to_string();
        self.state = State::ExpectSender;
        if ehlo {
            SessionEffect::plain(wire::ehlo_ok(&self.hostname, name, peer_ip))
        } else {
            SessionEffect::plain(wire::helo_ok(&self.hostname, name, peer_ip))
        }
    }

    /// `AUTH` issued on the alien port while expecting a sender: the
    /// state machine keeps playing along (the client must see a full
    /// challenge/response) but the quarantine flag latches immediately,
    /// since on this port AUTH can never legitimately succeed.
    pub fn handle_alien_auth_attempt(&mut self) -> SessionEffect {
        self.quarantine = true;
        self.state = State::ExpectAuthUser;
        SessionEffect::plain(wire::AUTH_USERNAME_CHALLENGE)
    }

    pub fn handle_auth_login_start(&mut self) -> SessionEffect {
        self.state = State::ExpectAuthUser;
        SessionEffect::plain(wire::AUTH_USERNAME_CHALLENGE)
    }

    pub fn handle_auth_user(&mut self, decoded_username: String) -> SessionEffect {
        self.auth_pending_user = Some(decoded_username);
        self.state = State::ExpectAuthPass;
        SessionEffect::plain(wire::AUTH_PASSWORD_CHALLENGE)
    }

    /// `authenticated` has already been checked by the caller against the
    /// subscriber store (and is always `false` on the alien port, since
    /// AUTH there can never legitimately succeed).
    pub fn handle_auth_pass(&mut self, authenticated: bool, whitelisted: bool) -> SessionEffect {
        self.state = State::ExpectSender;
        if authenticated && self.variant == SmtpVariant::Submission {
            self.authenticated_as = self.auth_pending_user.take();
            self.quarantine = false;
            return SessionEffect::plain(wire::AUTH_OK);
        }

        // Alien port (or a submission auth failure): always a failure.
        self.auth_pending_user = None;
        if self.variant == SmtpVariant::Alien && whitelisted {
            // Accept-to-quarantine: preserve evidence of credential
            // compromise rather than rejecting outright.
            self.quarantine = true;
            SessionEffect::with_reputation(
                wire::AUTH_OK,
                ReputationEffect::BlacklistSmtp { ttl_secs: 900 },
            )
        } else {
            self.state = State::ExpectQuit;
            SessionEffect::with_reputation(wire::AUTH_FAILURE, ReputationEffect::BlacklistSmtp { ttl_secs: 900 })
        }
    }

    pub fn handle_mail_from(&mut self, params: MailFromParams) -> SessionEffect {
        if self.state != State::ExpectSender {
            return SessionEffect::plain(wire::EXPECTED_SENDER);
        }

        let Some(address) = params.address else {
            self.mail_from = Some(SessionAddress::empty());
            self.state = State::ExpectRecipient;
            return SessionEffect::plain(wire::SENDER_OK_CALLBACK);
        };

        match self.variant {
            SmtpVariant::Alien => {
                if params.is_local_domain {
                    self.sender_local_domain = true;
                    self.quarantine = true;
                }
                if params.is_banned {
                    self.state = State::ExpectQuit;
                    return SessionEffect::plain(wire::sender_banned(&address));
                }
                match params.dns {
                    DnsVerdict::TempFail => {
                        self.state = State::ExpectQuit;
                        SessionEffect::plain(wire::sender_dns_tempfail(&address))
                    }
                    DnsVerdict::NoMx => {
                        self.state = State::ExpectQuit;
                        SessionEffect::plain(wire::sender_no_mx(&address))
                    }
                    DnsVerdict::Ok { skunk } => {
                        self.skunk = skunk;
                        self.mail_from = Some(SessionAddress::new(&address));
                        self.state = State::ExpectRecipient;
                        if self.sender_local_domain {
                            SessionEffect::with_reputation(
                                wire::sender_ok(&address),
                                ReputationEffect::BlacklistSmtp { ttl_secs: 900 },
                            )
                        } else {
                            SessionEffect::plain(wire::sender_ok(&address))
                        }
                    }
                }
            }
            SmtpVariant::Submission => {
                if let Some(false) = params.permitted_originator {
                    self.quarantine = true;
                }
                self.mail_from = Some(SessionAddress::new(&address));
                self.state = State::ExpectRecipient;
                SessionEffect::plain(wire::sender_ok(&address))
            }
        }
    }

    pub fn handle_rcpt(&mut self, address: &str, resolution: RecipientResolution) -> SessionEffect {
        if self.state != State::ExpectRecipient {
            return SessionEffect::plain(wire::EXPECTED_RECIPIENT);
        }
        match resolution {
            RecipientResolution::Alien => {
                if self.authenticated_as.is_some() {
                    self.relay_targets.push(address.to_string());
                    SessionEffect::plain(wire::recipient_ok(address))
                } else {
                    SessionEffect::plain(wire::RELAYING_DENIED)
                }
            }
            RecipientResolution::NoMailbox => SessionEffect::plain(wire::NO_SUCH_MAILBOX),
            RecipientResolution::Local { mailboxes, relays } => {
                self.mailbox_targets.extend(mailboxes);
                self.relay_targets.extend(relays);
                SessionEffect::plain(wire::recipient_ok(address))
            }
        }
    }

    pub fn has_accepted_recipient(&self) -> bool {
        !self.mailbox_targets.is_empty() || !self.relay_targets.is_empty()
    }

    pub fn handle_data_command(&mut self) -> SessionEffect {
        if self.state != State::ExpectRecipient {
            return SessionEffect::plain(wire::EXPECTED_RECIPIENT_OR_DATA);
        }
        if !self.has_accepted_recipient() {
            return SessionEffect::plain(wire::NO_VALID_RECIPIENTS);
        }
        self.state = State::ExpectData;
        SessionEffect::plain(wire::DATA_GO_AHEAD)
    }

    /// Appends a chunk of DATA bytes. Returns `true` once the trailing
    /// CRLF-dot-CRLF terminator has been seen, covering the case where
    /// the terminator straddles two `recv` calls by always looking at the
    /// last five bytes of the buffer so far.
    pub fn feed_data(&mut self, chunk: &[u8]) -> bool {
        self.data.append(chunk);
        if self.data.len() > MAX_MESSAGE_SIZE {
            self.message_too_large = true;
        }
        self.data.len() >= 5 && self.data.tail(5) == b"\r\n.\r\n"
    }

    pub fn handle_data_complete(&mut self, spam_hit: bool, has_message_id: bool) -> SessionEffect {
        if self.message_too_large {
            self.state = State::ExpectQuit;
            return SessionEffect::plain(wire::MESSAGE_TOO_LARGE);
        }
        if spam_hit {
            self.state = State::ExpectQuit;
            return SessionEffect::plain(wire::SPAM_REJECTED);
        }
        let message_id_required_and_missing = !has_message_id && self.variant == SmtpVariant::Alien;
        if message_id_required_and_missing {
            self.state = State::ExpectQuit;
            return SessionEffect::plain(wire::NO_MESSAGE_ID);
        }
        self.state = State::ExpectQuit;
        SessionEffect::plain(wire::MESSAGE_ACCEPTED)
    }

    pub fn handle_persistence_failure(&mut self) -> SessionEffect {
        self.state = State::ExpectQuit;
        SessionEffect::plain(wire::INTERNAL_FAULT)
    }

    pub fn handle_quit(&mut self) -> SessionEffect {
        SessionEffect::plain(wire::SESSION_QUIT)
    }

    pub fn handle_unexpected(&mut self) -> SessionEffect {
        if self.state == State::ExpectQuit {
            SessionEffect::plain(wire::EXPECTING_QUIT_ONLY)
        } else {
            SessionEffect::plain(wire::could_not_understand(""))
        }
    }
}
