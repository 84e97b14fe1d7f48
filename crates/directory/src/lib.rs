/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The directory: local-routing tables, the subscriber/account store and
//! the correspondent index (spec §3, §4.5).

pub mod account;
pub mod correspondent;
pub mod routing;

use std::sync::Arc;

pub use account::{Account, AccountStore};
pub use correspondent::CorrespondentIndex;
pub use routing::{RecipientResolution, RoutingTables};

/// Bundles the directory's three subsystems behind one handle, the way
/// callers in `smtp`/`pop3` need them together at session time.
pub struct Directory {
    pub accounts: AccountStore,
    pub correspondents: CorrespondentIndex,
    pub routing: RoutingTables,
}

impl Directory {
    pub fn open(db: Arc<sled::Db>) -> trc::Result<Self> {
        Ok(Directory {
            accounts: AccountStore::open(db.clone())?,
            correspondents: CorrespondentIndex::open(db)?,
            routing: RoutingTables::new(),
        })
    }
}
