/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The ISAM key→value store (spec §3, §4.3): a bounded-key, bounded-value
//! map with first-write-wins duplicate detection, used for the short-form
//! and formal-message-id indexes. `sled::Tree` gives us the ordered-map
//! structure the original hand-rolled ISAM file provided, without having
//! to write our own B-tree.

use std::sync::Arc;

pub struct IsamStore {
    tree: sled::Tree,
    max_key_len: usize,
    max_value_len: usize,
}

impl IsamStore {
    /// Opens (or creates) the named tree within `db`. `max_key_len` and
    /// `max_value_len` bound every insert, matching the fixed-width
    /// records of the original ISAM file format.
    pub fn open(db: &sled::Db, name: &str, max_key_len: usize, max_value_len: usize) -> trc::Result<Self> {
        let tree = db
            .open_tree(name)
            .map_err(|e| trc::Error::internal(format!("open tree {name}: {e}")))?;
        Ok(IsamStore {
            tree,
            max_key_len,
            max_value_len,
        })
    }

    /// Inserts `key -> value`. Returns `Ok(false)` without modifying the
    /// store if `key` already exists (duplicate detection, spec §4.3);
    /// returns `Ok(true)` on a fresh insert.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> trc::Result<bool> {
        if key.len() > self.max_key_len {
            return Err(trc::Error::malformed(format!(
                "isam key too long: {} > {}",
                key.len(),
                self.max_key_len
            )));
        }
        if value.len() > self.max_value_len {
            return Err(trc::Error::malformed(format!(
                "isam value too long: {} > {}",
                value.len(),
                self.max_value_len
            )));
        }
        let mut inserted = false;
        self.tree
            .fetch_and_update(key, |existing| {
                if existing.is_some() {
                    existing.map(|v| v.to_vec())
                } else {
                    inserted = true;
                    Some(value.to_vec())
                }
            })
            .map_err(|e| trc::Error::internal(format!("isam insert: {e}")))?;
        if inserted {
            self.tree
                .flush()
                .map_err(|e| trc::Error::internal(format!("isam flush: {e}")))?;
        }
        Ok(inserted)
    }

    pub fn exists(&self, key: &[u8]) -> trc::Result<bool> {
        self.tree
            .contains_key(key)
            .map_err(|e| trc::Error::internal(format!("isam exists: {e}")))
    }

    pub fn lookup(&self, key: &[u8]) -> trc::Result<Option<Vec<u8>>> {
        self.tree
            .get(key)
            .map(|opt| opt.map(|ivec| ivec.to_vec()))
            .map_err(|e| trc::Error::internal(format!("isam lookup: {e}")))
    }

    pub fn remove(&self, key: &[u8]) -> trc::Result<bool> {
        self.tree
            .remove(key)
            .map(|opt| opt.is_some())
            .map_err(|e| trc::Error::internal(format!("isam remove: {e}")))
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Opens the shared `sled::Db` backing every ISAM/object tree in the
/// store root. One process, one writer, many readers (spec §5).
pub fn open_db(path: &std::path::Path) -> trc::Result<Arc<sled::Db>> {
    sled::open(path)
        .map(Arc::new)
        .map_err(|e| trc::Error::internal(format!("open sled db at {}: {e}", path.display())))
}
