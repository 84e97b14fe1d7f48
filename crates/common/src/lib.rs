/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The bootstrap core: configuration, the message store and the
//! directory bundled behind one handle shared by every listener and by
//! the relay scheduler thread (spec §5).

pub mod config;

use std::sync::Arc;

use config::Config;
use directory::Directory;
use store::Store;
use utils::reputation::ReputationStore;

pub struct Core {
    pub config: Config,
    pub store: Store,
    pub directory: Directory,
    pub reputation: ReputationStore,
    pub hostname: String,
}

impl Core {
    pub fn open(config: Config) -> trc::Result<Arc<Self>> {
        let store = Store::open(&config.server.data_root)?;
        let directory = Directory::open(store.db())?;
        let reputation = ReputationStore::open(&config.server.data_root.join("status_ip.ips"))
            .map_err(|e| trc::Error::internal(format!("open reputation store: {e}")))?;

        for domain in &config.domains.local {
            directory.routing.add_local_domain(domain);
        }

        let hostname = config.server.hostname.clone();
        Ok(Arc::new(Core {
            config,
            store,
            directory,
            reputation,
            hostname,
        }))
    }

    /// For tests and local tooling: an in-memory/ephemeral core rooted at
    /// a throwaway directory.
    #[cfg(any(test, feature = "test_mode"))]
    pub fn open_in(root: &std::path::Path) -> trc::Result<Arc<Self>> {
        let mut config = Config {
            server: config::ServerConfig {
                hostname: "host.example".to_string(),
                data_root: root.join("data"),
                mailbox_root: root.join("mbox"),
                queue_root: root.join("mque"),
                quarantine_root: root.join("qtine"),
                log_root: root.join("logs"),
            },
            listener: Vec::new(),
            domains: config::DomainsConfig::default(),
            spam: config::SpamConfig::default(),
            reputation: config::ReputationConfig::default(),
            relay: config::RelayConfig::default(),
        };
        config.domains.local.push("local.example".to_string());
        Self::open(config)
    }
}
