/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! TOML configuration (SPEC_FULL §12): listeners, data-root paths, local
//! and banned domains, the SPAM keyword probe, relay cadence and
//! whitelist/blacklist TTL defaults. The original XML format is left
//! unspecified by the system this was distilled from; TOML plus `serde`
//! is the concrete, ecosystem-idiomatic choice here.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub listener: Vec<ListenerConfig>,
    #[serde(default)]
    pub domains: DomainsConfig,
    #[serde(default)]
    pub spam: SpamConfig,
    #[serde(default)]
    pub reputation: ReputationConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub hostname: String,
    pub data_root: PathBuf,
    pub mailbox_root: PathBuf,
    pub queue_root: PathBuf,
    pub quarantine_root: PathBuf,
    pub log_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            hostname: "host.example".to_string(),
            data_root: PathBuf::from("data"),
            mailbox_root: PathBuf::from("mbox"),
            queue_root: PathBuf::from("mque"),
            quarantine_root: PathBuf::from("qtine"),
            log_root: PathBuf::from("logs"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListenerProtocol {
    SmtpAlien,
    SmtpSubmission,
    Pop3,
    Pop3Tls,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub id: String,
    pub protocol: ListenerProtocol,
    pub bind: String,
    #[serde(default)]
    pub tls_required: bool,
    /// Per-listener connection cap (spec §4.6); `0` means unlimited.
    #[serde(default)]
    pub max_connections: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainsConfig {
    #[serde(default)]
    pub local: Vec<String>,
    #[serde(default)]
    pub banned: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpamConfig {
    /// A trivial disallowed-substring probe (spec §4.7's "fixed set of
    /// disallowed substrings v1"), matched case-insensitively against the
    /// assembled message.
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReputationConfig {
    pub whitelist_ttl_secs: i64,
    pub smtp_auth_fail_blacklist_ttl_secs: i64,
    pub smtp_forged_sender_blacklist_ttl_secs: i64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        ReputationConfig {
            whitelist_ttl_secs: 3600,
            smtp_auth_fail_blacklist_ttl_secs: 900,
            smtp_forged_sender_blacklist_ttl_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    pub poll_interval_secs: u64,
    pub retry_delta_secs: i64,
    pub expire_after_secs: i64,
    pub queue_entry_ttl_secs: i64,
    /// The port dialed on a resolved MX host (spec §4.9.1 names port 25
    /// as the standard exchange port). Overridable so a test harness can
    /// point the scheduler at a loopback fixture instead.
    #[serde(default = "default_outbound_port")]
    pub outbound_port: u16,
}

fn default_outbound_port() -> u16 {
    25
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            poll_interval_secs: 10,
            retry_delta_secs: 3,
            expire_after_secs: 3600,
            queue_entry_ttl_secs: 72 * 3600,
            outbound_port: default_outbound_port(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> trc::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| trc::Error::internal(format!("read config {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| trc::Error::internal(format!("parse config {}: {e}", path.display())))
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.domains.local.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }

    pub fn is_banned_domain(&self, domain: &str) -> bool {
        self.domains.banned.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }
}
