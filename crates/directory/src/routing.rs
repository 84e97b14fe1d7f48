/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Local-routing tables (spec §4.5): domains, addresses, address→mailbox,
//! address→forward and address→originator maps. Loaded once at startup
//! from the indexed object store into plain in-memory maps optimized for
//! read; mutations are rare administrative events serialized through the
//! reactor thread, so a single `RwLock` around each map is enough.

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxTarget {
    pub account_username: String,
    pub mailbox_name: String,
    pub local_uid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientResolution {
    /// Domain is not local; the message is a relay candidate only.
    Alien,
    /// Domain is local but the address has neither a mailbox nor a
    /// forward — RCPT should be rejected with 550.
    NoMailbox,
    /// At least one deliverable target was found.
    Local {
        mailboxes: Vec<MailboxTarget>,
        /// Alien addresses this recipient forwards to (relay candidates).
        relays: Vec<String>,
    },
}

#[derive(Default)]
struct Tables {
    local_domains: AHashSet<String>,
    address_mailboxes: AHashMap<String, Vec<MailboxTarget>>,
    address_forwards: AHashMap<String, Vec<String>>,
    /// address -> usernames permitted to originate mail claiming it.
    originators: AHashMap<String, AHashSet<String>>,
}

pub struct RoutingTables {
    tables: RwLock<Tables>,
}

impl RoutingTables {
    pub fn new() -> Self {
        RoutingTables {
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn add_local_domain(&self, domain: &str) {
        self.tables.write().local_domains.insert(domain.to_ascii_lowercase());
    }

    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.tables.read().local_domains.contains(&domain.to_ascii_lowercase())
    }

    pub fn add_local_address(&self, address: &str, account_username: &str, mailbox_name: &str, local_uid: u32) {
        self.tables
            .write()
            .address_mailboxes
            .entry(normalize(address))
            .or_default()
            .push(MailboxTarget {
                account_username: account_username.to_string(),
                mailbox_name: mailbox_name.to_string(),
                local_uid,
            });
    }

    pub fn add_forward(&self, address: &str, forward_address: &str) {
        self.tables
            .write()
            .address_forwards
            .entry(normalize(address))
            .or_default()
            .push(normalize(forward_address));
    }

    pub fn add_originator(&self, username: &str, address: &str) {
        self.tables
            .write()
            .originators
            .entry(normalize(address))
            .or_default()
            .insert(username.to_string());
    }

    pub fn is_permitted_originator(&self, username: &str, address: &str) -> bool {
        self.tables
            .read()
            .originators
            .get(&normalize(address))
            .map(|set| set.contains(username))
            .unwrap_or(false)
    }

    /// Applies the §4.5 resolution algorithm for one RCPT address.
    pub fn resolve_recipient(&self, address: &str) -> RecipientResolution {
        let Some(domain) = domain_of(address) else {
            return RecipientResolution::NoMailbox;
        };
        if !self.is_local_domain(&domain) {
            return RecipientResolution::Alien;
        }

        let tables = self.tables.read();
        let key = normalize(address);
        let mut mailboxes = tables.address_mailboxes.get(&key).cloned().unwrap_or_default();
        let mut relays = Vec::new();

        if let Some(forwards) = tables.address_forwards.get(&key) {
            for forward in forwards {
                // Single-hop cap: fold in the forward target's own
                // mailboxes if it is itself local, but never its forwards.
                match domain_of(forward).map(|d| self.is_local_domain(&d)) {
                    Some(true) => {
                        if let Some(fwd_mailboxes) = tables.address_mailboxes.get(forward) {
                            mailboxes.extend(fwd_mailboxes.iter().cloned());
                        }
                    }
                    _ => relays.push(forward.clone()),
                }
            }
        }

        if mailboxes.is_empty() && relays.is_empty() {
            RecipientResolution::NoMailbox
        } else {
            RecipientResolution::Local { mailboxes, relays }
        }
    }
}

impl Default for RoutingTables {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(address: &str) -> String {
    address.to_ascii_lowercase()
}

fn domain_of(address: &str) -> Option<String> {
    address.rsplit_once('@').map(|(_, domain)| domain.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alien_domain_is_relay_only() {
        let tables = RoutingTables::new();
        tables.add_local_domain("local.example");
        assert_eq!(
            tables.resolve_recipient("bob@other.test"),
            RecipientResolution::Alien
        );
    }

    #[test]
    fn local_address_with_no_mailbox_or_forward_is_rejected() {
        let tables = RoutingTables::new();
        tables.add_local_domain("local.example");
        assert_eq!(
            tables.resolve_recipient("nobody@local.example"),
            RecipientResolution::NoMailbox
        );
    }

    #[test]
    fn local_address_resolves_to_its_mailboxes() {
        let tables = RoutingTables::new();
        tables.add_local_domain("local.example");
        tables.add_local_address("bob@local.example", "bob", "inbox", 1);
        match tables.resolve_recipient("bob@local.example") {
            RecipientResolution::Local { mailboxes, relays } => {
                assert_eq!(mailboxes.len(), 1);
                assert!(relays.is_empty());
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn forward_to_alien_address_becomes_a_relay() {
        let tables = RoutingTables::new();
        tables.add_local_domain("local.example");
        tables.add_forward("alice@local.example", "alice@outside.test");
        match tables.resolve_recipient("alice@local.example") {
            RecipientResolution::Local { mailboxes, relays } => {
                assert!(mailboxes.is_empty());
                assert_eq!(relays, vec!["alice@outside.test".to_string()]);
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn forward_chain_is_capped_at_one_hop() {
        let tables = RoutingTables::new();
        tables.add_local_domain("local.example");
        // a -> b -> c (mailbox). Resolving `a` should fold in b's mailboxes
        // but never recurse into b's own forward to c.
        tables.add_forward("a@local.example", "b@local.example");
        tables.add_forward("b@local.example", "c@local.example");
        tables.add_local_address("c@local.example", "carol", "inbox", 3);

        match tables.resolve_recipient("a@local.example") {
            RecipientResolution::NoMailbox => {}
            other => panic!("expected the second hop to be terminal, got {other:?}"),
        }
    }

    #[test]
    fn originator_permission_is_checked_by_exact_username() {
        let tables = RoutingTables::new();
        tables.add_originator("alice", "alice@local.example");
        assert!(tables.is_permitted_originator("alice", "alice@local.example"));
        assert!(!tables.is_permitted_originator("mallory", "alice@local.example"));
    }
}
