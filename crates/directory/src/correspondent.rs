/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The correspondent index (spec §3 "Correspondent"): one record per
//! distinct remote email address ever seen as a sender or recipient,
//! keyed uniquely on `address`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use store::{IndexKind, IndexSpec, IndexedObjectStore, ObjectId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Correspondent {
    pub domain: String,
    pub address: String,
    pub realname: Option<String>,
}

pub struct CorrespondentIndex {
    objects: IndexedObjectStore<Correspondent>,
}

impl CorrespondentIndex {
    pub fn open(db: Arc<sled::Db>) -> trc::Result<Self> {
        let objects = IndexedObjectStore::open(
            db,
            "correspondents",
            &[IndexSpec {
                name: "address",
                kind: IndexKind::Unique,
            }],
        )?;
        Ok(CorrespondentIndex { objects })
    }

    pub fn lookup(&self, address: &str) -> trc::Result<Option<Correspondent>> {
        self.objects.fetch_by_unique("address", address.as_bytes())
    }

    /// Records `address` as a correspondent if it has never been seen
    /// before; a known correspondent is left untouched (the first
    /// realname observed wins, matching the original's first-write
    /// behavior for this cache).
    pub fn observe(&self, address: &str, realname: Option<&str>) -> trc::Result<ObjectId> {
        if let Some(existing) = self.objects.id_by_unique("address", address.as_bytes())? {
            return Ok(existing);
        }
        let domain = address.rsplit_once('@').map(|(_, d)| d.to_string()).unwrap_or_default();
        let record = Correspondent {
            domain,
            address: address.to_string(),
            realname: realname.map(|s| s.to_string()),
        };
        self.objects.insert(&record, &[("address", address.as_bytes())])
    }
}
