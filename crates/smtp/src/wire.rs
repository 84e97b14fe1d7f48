/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! SMTP wire responses (spec §6), reproduced byte-for-byte from the
//! protocol's canonical implementation rather than re-derived from the
//! RFC, since the exact text (including the non-standard phrasing) is
//! part of observed client compatibility.

pub const BAD_HELO_SEQUENCE: &str = "503 Expected a HELO or EHLO command\r\n";
pub const AUTH_USERNAME_CHALLENGE: &str = "334 VXNlcm5hbWU6\r\n";
pub const AUTH_PASSWORD_CHALLENGE: &str = "334 UGFzc3dvcmQ6\r\n";
pub const AUTH_OK: &str = "235 Go Ahead\r\n";
pub const AUTH_FAILURE: &str = "535 Auth Failure\r\n";
pub const MALFORMED_RECIPIENT: &str = "550 Malformed recipient address\r\n";
pub const RELAYING_DENIED: &str = "550 Relaying Denied\r\n";
pub const NO_SUCH_MAILBOX: &str = "550 5.1.1 No such mailbox\r\n";
pub const INTERNAL_FAULT: &str = "421 Internal fault\r\n";
pub const NO_VALID_RECIPIENTS: &str = "503 No valid recipients supplied\r\n";
pub const DATA_GO_AHEAD: &str = "354 Enter mail, end with . on a line by itself\r\n";
pub const EXPECTED_RECIPIENT: &str = "503 Expected a recipient\r\n";
pub const EXPECTED_RECIPIENT_OR_DATA: &str = "503 Expected a recipient or the DATA command\r\n";
pub const MESSAGE_TOO_LARGE: &str = "552 Message exceeds limit. Closing connection\r\n";
pub const SESSION_QUIT: &str = "221 Epistula SMTP session terminated normally\r\n";
pub const EXPECTED_SENDER: &str = "503 Expected a sender address\r\n";
pub const SENDER_UNPARSEABLE: &str = "501 Sender email address could not be deciphered.\r\n";
pub const SENDER_OK_CALLBACK: &str = "250 2.1.0 <>... Sender ok (callback)\r\n";
pub const SPAM_REJECTED: &str = "554 5.7.1 Message rejected for SPAM content\r\n";
pub const NO_MESSAGE_ID: &str = "554 5.7.1 Message rejected: No message id\r\n";
pub const MESSAGE_ACCEPTED: &str = "250 2.6.0 Message accepted for delivery\r\n";
pub const EXPECTING_QUIT_ONLY: &str = "503 Expecting a QUIT and nothing else\r\n";

pub fn greeting(hostname: &str) -> String {
    format!("220 {hostname} ESMTP Epistula\r\n")
}

pub fn helo_ok(hostname: &str, realname: &str, ip: &str) -> String {
    format!("250 {hostname} Hello {realname} [{ip}], pleased to meet you\r\n")
}

pub fn ehlo_ok(hostname: &str, realname: &str, ip: &str) -> String {
    format!(
        "250-{hostname} Hello {realname} [{ip}]\r\n250-ENHANCEDSTATUSCODES\r\n250-SIZE 4000000\r\n250-DSN\r\n250-HELP\r\n250 AUTH LOGIN\r\n"
    )
}

pub fn recipient_ok(addr: &str) -> String {
    format!("250 2.1.5 <{addr}>... Recipient ok\r\n")
}

pub fn sender_ok(addr: &str) -> String {
    format!("250 2.1.0 <{addr}>... Sender ok\r\n")
}

pub fn sender_banned(addr: &str) -> String {
    format!("550 <{addr}>... Sender not accepted. terminated\r\n")
}

pub fn sender_dns_tempfail(addr: &str) -> String {
    format!("421 Sender IP [{addr}] not resolved. Please try later\r\n")
}

pub fn sender_no_mx(addr: &str) -> String {
    format!("550 <{addr}>... Sender not accepted. No mail servers, session terminated\r\n")
}

pub fn could_not_understand(line: &str) -> String {
    format!("503 Could not understand command [{line}]\r\n")
}
