/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Persistent storage for Epistula (spec §3, §4): the binary repository
//! that holds raw message bytes, the ISAM key→value indexes built on top
//! of it (short-form and formal-message-id lookup), the indexed object
//! store used for the directory's own tables, and the per-account POP3
//! manifests.

pub mod ids;
pub mod isam;
pub mod manifest;
pub mod objects;
pub mod repo;

use std::{path::Path, sync::Arc};

pub use ids::DatumId;
pub use isam::IsamStore;
pub use manifest::Manifest;
pub use objects::{IndexKind, IndexSpec, IndexedObjectStore, ObjectId};
pub use repo::BinaryRepository;

/// Fixed length of a formal message id (RFC 5322 `Message-ID` strings
/// vary, but the value we index — the datum's own hex id — never does).
pub const FORMAL_ID_MAX_KEY_LEN: usize = 255;
pub const FORMAL_ID_VALUE_LEN: usize = 8;
pub const SHORT_FORM_MAX_KEY_LEN: usize = 64;
pub const SHORT_FORM_VALUE_LEN: usize = 8;

/// Bundles the repository, its two ISAM indexes and the shared `sled`
/// handle that also backs the directory's indexed object stores. One
/// `Store` per running process (spec §5: a single writer thread owns
/// it, the relay scheduler thread and POP3 sessions only read).
pub struct Store {
    pub repo: BinaryRepository,
    pub short_form_index: IsamStore,
    pub formal_id_index: IsamStore,
    db: Arc<sled::Db>,
}

impl Store {
    pub fn open(root: &Path) -> trc::Result<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| trc::Error::internal(format!("create store root: {e}")))?;

        let repo = BinaryRepository::open(root.join("repository.dat"), root.join("repository.idx"))?;
        let db = isam::open_db(&root.join("indexes.sled"))?;
        let short_form_index = IsamStore::open(&db, "short_form", SHORT_FORM_MAX_KEY_LEN, SHORT_FORM_VALUE_LEN)?;
        let formal_id_index = IsamStore::open(&db, "formal_id", FORMAL_ID_MAX_KEY_LEN, FORMAL_ID_VALUE_LEN)?;

        Ok(Store {
            repo,
            short_form_index,
            formal_id_index,
            db,
        })
    }

    /// The shared `sled::Db` handle, for opening further indexed object
    /// stores (directory tables) against the same database.
    pub fn db(&self) -> Arc<sled::Db> {
        self.db.clone()
    }

    /// Opens (or creates) the per-account manifest directory and returns
    /// the path at which an account's manifest file should live.
    pub fn manifest_path(root: &Path, account: &str) -> trc::Result<std::path::PathBuf> {
        let dir = root.join("manifests");
        std::fs::create_dir_all(&dir)
            .map_err(|e| trc::Error::internal(format!("create manifest dir: {e}")))?;
        Ok(dir.join(format!("{account}.manifest")))
    }

    pub fn lookup_by_short_form(&self, key: &[u8]) -> trc::Result<Option<DatumId>> {
        Ok(self
            .short_form_index
            .lookup(key)?
            .and_then(|bytes| bytes.as_slice().try_into().ok())
            .map(u32::from_be_bytes)
            .map(DatumId))
    }

    pub fn lookup_by_formal_id(&self, key: &[u8]) -> trc::Result<Option<DatumId>> {
        Ok(self
            .formal_id_index
            .lookup(key)?
            .and_then(|bytes| bytes.as_slice().try_into().ok())
            .map(u32::from_be_bytes)
            .map(DatumId))
    }
}
