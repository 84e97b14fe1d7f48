/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Accounts and the subscriber store (spec §3 "Account"): username,
//! password hash, mailbox directory path and the mandatory built-in
//! folder tree. Password verification is local-only — no pluggable
//! external directory, matching SPEC_FULL's resolution of the spec's
//! "external subscriber store" language to a single embedded table.

use std::{path::PathBuf, sync::Arc};

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use serde::{Deserialize, Serialize};
use store::{IndexKind, IndexSpec, IndexedObjectStore, ObjectId};

/// Folders created empty for every new account (spec §3).
pub const BUILTIN_FOLDERS: &[&str] = &["Inbox", "Drafts", "Sent", "Adverts", "Quarantine", "Miscellaneous"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password_hash: String,
    pub mailbox_dir: PathBuf,
    pub folders: Vec<String>,
}

impl Account {
    pub fn new(username: &str, password: &str, mailbox_root: &PathBuf) -> trc::Result<Self> {
        Ok(Account {
            username: username.to_string(),
            password_hash: hash_password(password)?,
            mailbox_dir: mailbox_root.join(username),
            folders: BUILTIN_FOLDERS.iter().map(|s| s.to_string()).collect(),
        })
    }
}

pub fn hash_password(password: &str) -> trc::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| trc::Error::internal(format!("hash password: {e}")))
}

pub fn verify_password(stored_hash: &str, candidate: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default().verify_password(candidate.as_bytes(), &parsed).is_ok()
}

pub struct AccountStore {
    objects: IndexedObjectStore<Account>,
}

impl AccountStore {
    pub fn open(db: Arc<sled::Db>) -> trc::Result<Self> {
        let objects = IndexedObjectStore::open(
            db,
            "accounts",
            &[IndexSpec {
                name: "username",
                kind: IndexKind::Unique,
            }],
        )?;
        Ok(AccountStore { objects })
    }

    pub fn create(&self, account: &Account) -> trc::Result<ObjectId> {
        self.objects
            .insert(account, &[("username", account.username.as_bytes())])
    }

    pub fn lookup(&self, username: &str) -> trc::Result<Option<Account>> {
        self.objects.fetch_by_unique("username", username.as_bytes())
    }

    /// Validates `username`/`password` against the subscriber store
    /// (spec §4.7 `EXPECT_AUTH_PASS`, §4.8 `PASS`). Returns `false` for
    /// both "unknown user" and "bad password" so callers cannot
    /// distinguish the two from the return value alone.
    pub fn authenticate(&self, username: &str, password: &str) -> trc::Result<bool> {
        match self.lookup(username)? {
            Some(account) => Ok(verify_password(&account.password_hash, password)),
            None => Ok(false),
        }
    }
}
