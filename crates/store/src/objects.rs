/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The indexed object store (spec §3, §4.4): a typed record table with
//! one or more secondary indexes, at least one of which is expected to be
//! unique ("identifying"). Backs the short-form message table, the
//! correspondent table, the domain and local-address tables, the forward
//! table and the subscriber table — every one of those is "a primary
//! record plus a handful of lookup keys" in the original, so one generic
//! engine covers all of them.

use std::{fmt, marker::PhantomData};

use ahash::AHashMap;
use serde::{de::DeserializeOwned, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// At most one object per key; a second insert under the same key is
    /// rejected rather than overwriting the first (spec's "identifying"
    /// index).
    Unique,
    /// Many objects may share a key (e.g. many mailboxes forwarding to
    /// the same address).
    Multi,
}

pub struct IndexSpec {
    pub name: &'static str,
    pub kind: IndexKind,
}

struct IndexHandle {
    kind: IndexKind,
    tree: sled::Tree,
}

pub struct IndexedObjectStore<T> {
    db: std::sync::Arc<sled::Db>,
    objects: sled::Tree,
    indexes: AHashMap<&'static str, IndexHandle>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> IndexedObjectStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn open(db: std::sync::Arc<sled::Db>, name: &str, specs: &[IndexSpec]) -> trc::Result<Self> {
        let objects = db
            .open_tree(format!("{name}.objects"))
            .map_err(|e| trc::Error::internal(format!("open {name}.objects: {e}")))?;
        let mut indexes = AHashMap::new();
        for spec in specs {
            let tree = db
                .open_tree(format!("{name}.idx.{}", spec.name))
                .map_err(|e| trc::Error::internal(format!("open index {}: {e}", spec.name)))?;
            indexes.insert(spec.name, IndexHandle { kind: spec.kind, tree });
        }
        Ok(IndexedObjectStore {
            db,
            objects,
            indexes,
            _marker: PhantomData,
        })
    }

    /// Inserts `record` and populates every index listed in
    /// `index_values`. Fails without side effects if any `Unique` index
    /// key is already taken.
    pub fn insert(&self, record: &T, index_values: &[(&str, &[u8])]) -> trc::Result<ObjectId> {
        for (name, key) in index_values {
            let handle = self
                .indexes
                .get(name)
                .ok_or_else(|| trc::Error::internal(format!("unknown index {name}")))?;
            if handle.kind == IndexKind::Unique
                && handle
                    .tree
                    .contains_key(key)
                    .map_err(|e| trc::Error::internal(format!("index lookup: {e}")))?
            {
                return Err(trc::Error::PolicyReject(format!(
                    "duplicate value for unique index {name}"
                )));
            }
        }

        let raw_id = self
            .db
            .generate_id()
            .map_err(|e| trc::Error::internal(format!("generate object id: {e}")))?;
        let object_id = ObjectId(raw_id);
        let bytes = bincode::serialize(record)
            .map_err(|e| trc::Error::internal(format!("serialize record: {e}")))?;
        self.objects
            .insert(raw_id.to_be_bytes(), bytes)
            .map_err(|e| trc::Error::internal(format!("store record: {e}")))?;

        for (name, key) in index_values {
            let handle = self.indexes.get(name).unwrap();
            match handle.kind {
                IndexKind::Unique => {
                    handle
                        .tree
                        .insert(*key, &raw_id.to_be_bytes())
                        .map_err(|e| trc::Error::internal(format!("index insert: {e}")))?;
                }
                IndexKind::Multi => {
                    handle
                        .tree
                        .fetch_and_update(*key, |existing| {
                            let mut ids: Vec<u64> = existing
                                .and_then(|b| bincode::deserialize(b).ok())
                                .unwrap_or_default();
                            ids.push(raw_id);
                            bincode::serialize(&ids).ok()
                        })
                        .map_err(|e| trc::Error::internal(format!("index append: {e}")))?;
                }
            }
        }

        self.objects
            .flush()
            .map_err(|e| trc::Error::internal(format!("flush objects: {e}")))?;
        Ok(object_id)
    }

    pub fn fetch(&self, id: ObjectId) -> trc::Result<Option<T>> {
        match self
            .objects
            .get(id.0.to_be_bytes())
            .map_err(|e| trc::Error::internal(format!("fetch object: {e}")))?
        {
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| trc::Error::internal(format!("deserialize object: {e}"))),
            None => Ok(None),
        }
    }

    /// Looks up a `Unique` index; returns the single matching object, if
    /// present, already deserialized.
    pub fn fetch_by_unique(&self, index: &str, key: &[u8]) -> trc::Result<Option<T>> {
        let handle = self
            .indexes
            .get(index)
            .ok_or_else(|| trc::Error::internal(format!("unknown index {index}")))?;
        let raw = handle
            .tree
            .get(key)
            .map_err(|e| trc::Error::internal(format!("index lookup: {e}")))?;
        match raw {
            Some(bytes) => {
                let id = u64::from_be_bytes(bytes.as_ref().try_into().map_err(|_| {
                    trc::Error::internal("corrupt index entry".to_string())
                })?);
                self.fetch(ObjectId(id))
            }
            None => Ok(None),
        }
    }

    pub fn id_by_unique(&self, index: &str, key: &[u8]) -> trc::Result<Option<ObjectId>> {
        let handle = self
            .indexes
            .get(index)
            .ok_or_else(|| trc::Error::internal(format!("unknown index {index}")))?;
        let raw = handle
            .tree
            .get(key)
            .map_err(|e| trc::Error::internal(format!("index lookup: {e}")))?;
        Ok(raw.map(|bytes| {
            ObjectId(u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0; 8])))
        }))
    }

    /// Looks up a `Multi` index; returns every matching object id, in
    /// insertion order.
    pub fn ids_by_multi(&self, index: &str, key: &[u8]) -> trc::Result<Vec<ObjectId>> {
        let handle = self
            .indexes
            .get(index)
            .ok_or_else(|| trc::Error::internal(format!("unknown index {index}")))?;
        let raw = handle
            .tree
            .get(key)
            .map_err(|e| trc::Error::internal(format!("index lookup: {e}")))?;
        match raw {
            Some(bytes) => {
                let ids: Vec<u64> = bincode::deserialize(&bytes)
                    .map_err(|e| trc::Error::internal(format!("deserialize index entry: {e}")))?;
                Ok(ids.into_iter().map(ObjectId).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
