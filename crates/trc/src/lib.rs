/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Structured event and error taxonomy for the mail engine, built directly
//! on `tracing` rather than a proc-macro generated event catalog.

use std::fmt;

pub mod subscriber;

/// The error taxonomy of the persistence/ingress/relay pipeline.
///
/// Each variant carries enough context to be logged as a structured
/// `tracing` event at the call site via [`Error::log`].
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    #[error("transient peer error: {0}")]
    TransientPeer(String),

    #[error("permanent peer error: {0}")]
    PermanentPeer(String),

    #[error("policy reject: {0}")]
    PolicyReject(String),

    #[error("duplicate message")]
    DuplicateMessage,

    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("authentication failure")]
    AuthFail,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedInput(msg.into())
    }

    /// Emits this error as a structured `tracing` event at the
    /// appropriate level and returns itself for further propagation.
    pub fn log(self) -> Self {
        match &self {
            Error::TransientPeer(m) => tracing::warn!(kind = "transient-peer", %m),
            Error::PermanentPeer(m) => tracing::warn!(kind = "permanent-peer", %m),
            Error::PolicyReject(m) => tracing::info!(kind = "policy-reject", %m),
            Error::DuplicateMessage => tracing::debug!(kind = "duplicate-message"),
            Error::MalformedInput(m) => tracing::warn!(kind = "malformed-input", %m),
            Error::AuthFail => tracing::warn!(kind = "auth-fail"),
            Error::Internal(m) => tracing::error!(kind = "internal", %m),
        }
        self
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Lightweight marker for the event categories the reactor and sessions
/// report, used to tag `tracing` spans without allocating a string per
/// call. Mirrors the SMTP/POP3 response taxonomy of spec §7/§8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ConnectionAccepted,
    ConnectionClosed,
    SmtpCommand,
    SmtpReject,
    Pop3Command,
    RelayAttempt,
    RelayResult,
    Bounce,
    Quarantine,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::ConnectionAccepted => "connection-accepted",
            EventType::ConnectionClosed => "connection-closed",
            EventType::SmtpCommand => "smtp-command",
            EventType::SmtpReject => "smtp-reject",
            EventType::Pop3Command => "pop3-command",
            EventType::RelayAttempt => "relay-attempt",
            EventType::RelayResult => "relay-result",
            EventType::Bounce => "bounce",
            EventType::Quarantine => "quarantine",
        };
        f.write_str(s)
    }
}
