/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The binary message repository (spec §4.2): an append-only store keyed
//! by monotonically assigned `datum_id`. Single writer (the reactor
//! thread), many concurrent readers (POP3 sessions) — readers only ever
//! need positional reads against offsets that were valid the moment they
//! were looked up, since the index only ever grows by append.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use parking_lot::{Mutex, RwLock};

use crate::ids::DatumId;

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    length: u32,
}

pub struct BinaryRepository {
    data_path: PathBuf,
    index_path: PathBuf,
    data_file: Mutex<File>,
    index_file: Mutex<File>,
    read_handle: File,
    index: RwLock<Vec<IndexEntry>>,
}

impl BinaryRepository {
    /// Opens (creating if absent) the repository at `data_path`/`index_path`,
    /// rebuilding the in-memory index from the index file.
    pub fn open(data_path: impl AsRef<Path>, index_path: impl AsRef<Path>) -> trc::Result<Self> {
        let data_path = data_path.as_ref().to_path_buf();
        let index_path = index_path.as_ref().to_path_buf();

        let data_file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&data_path)
            .map_err(|e| trc::Error::internal(format!("open data file: {e}")))?;
        let mut index_file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&index_path)
            .map_err(|e| trc::Error::internal(format!("open index file: {e}")))?;
        let read_handle = File::open(&data_path)
            .map_err(|e| trc::Error::internal(format!("open data file for reading: {e}")))?;

        let mut raw = Vec::new();
        index_file
            .read_to_end(&mut raw)
            .map_err(|e| trc::Error::internal(format!("read index: {e}")))?;
        let mut index = Vec::with_capacity(raw.len() / 12);
        for chunk in raw.chunks_exact(12) {
            let offset = u64::from_be_bytes(chunk[0..8].try_into().unwrap());
            let length = u32::from_be_bytes(chunk[8..12].try_into().unwrap());
            index.push(IndexEntry { offset, length });
        }

        Ok(BinaryRepository {
            data_path,
            index_path,
            data_file: Mutex::new(data_file),
            index_file: Mutex::new(index_file),
            read_handle,
            index: RwLock::new(index),
        })
    }

    /// Atomically assigns the next `datum_id`, appends `bytes` (length-
    /// prefixed) to the data file and records the offset/length in the
    /// index. On any write failure no new id becomes visible.
    pub fn insert(&self, bytes: &[u8]) -> trc::Result<DatumId> {
        let mut data_file = self.data_file.lock();
        let offset = data_file
            .metadata()
            .map_err(|e| trc::Error::internal(format!("stat data file: {e}")))?
            .len();

        let mut record = Vec::with_capacity(4 + bytes.len());
        record.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        record.extend_from_slice(bytes);

        data_file
            .write_all(&record)
            .and_then(|_| data_file.sync_data())
            .map_err(|e| trc::Error::internal(format!("append to data file: {e}")))?;

        let data_offset = offset + 4;
        let mut index_file = self.index_file.lock();
        let mut index_record = Vec::with_capacity(12);
        index_record.extend_from_slice(&data_offset.to_be_bytes());
        index_record.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        index_file
            .write_all(&index_record)
            .and_then(|_| index_file.sync_data())
            .map_err(|e| trc::Error::internal(format!("append to index file: {e}")))?;

        let mut index = self.index.write();
        let datum_id = DatumId(index.len() as u32);
        index.push(IndexEntry {
            offset: data_offset,
            length: bytes.len() as u32,
        });
        Ok(datum_id)
    }

    /// Copies the payload for `datum_id` into `out`.
    pub fn fetch(&self, datum_id: DatumId, out: &mut Vec<u8>) -> trc::Result<()> {
        let entry = {
            let index = self.index.read();
            *index
                .get(datum_id.0 as usize)
                .ok_or_else(|| trc::Error::internal(format!("no such datum_id {datum_id}")))?
        };
        out.resize(entry.length as usize, 0);
        self.read_handle
            .read_exact_at(out, entry.offset)
            .map_err(|e| trc::Error::internal(format!("read datum {datum_id}: {e}")))?;
        Ok(())
    }

    pub fn fetch_owned(&self, datum_id: DatumId) -> trc::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.fetch(datum_id, &mut out)?;
        Ok(out)
    }

    /// Number of assigned ids, including any from failed-but-partially
    /// visible inserts — there is no tombstoning in v1 (spec §4.2).
    pub fn count(&self) -> u32 {
        self.index.read().len() as u32
    }

    /// Walks the data file, verifying every entry against the index and
    /// reporting anomalies through `reporter`.
    pub fn integrity(&self, mut reporter: impl FnMut(String)) -> trc::Result<()> {
        let index = self.index.read();
        for (id, entry) in index.iter().enumerate() {
            let mut buf = vec![0u8; entry.length as usize];
            if let Err(e) = self.read_handle.read_exact_at(&mut buf, entry.offset) {
                reporter(format!("datum_id {id}: read failed: {e}"));
            }
        }
        Ok(())
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_fetch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = BinaryRepository::open(dir.path().join("data"), dir.path().join("index")).unwrap();
        let id1 = repo.insert(b"hello").unwrap();
        let id2 = repo.insert(b"world, a longer message body").unwrap();
        assert_eq!(id1.0, 0);
        assert_eq!(id2.0, 1);
        assert_eq!(repo.fetch_owned(id1).unwrap(), b"hello");
        assert_eq!(repo.fetch_owned(id2).unwrap(), b"world, a longer message body");
        assert_eq!(repo.count(), 2);
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let repo = BinaryRepository::open(dir.path().join("data"), dir.path().join("index")).unwrap();
        let mut last = None;
        for i in 0..10 {
            let id = repo.insert(format!("msg-{i}").as_bytes()).unwrap();
            if let Some(last) = last {
                assert!(id.0 > last);
            }
            last = Some(id.0);
        }
    }

    #[test]
    fn reopen_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let index = dir.path().join("index");
        let id = {
            let repo = BinaryRepository::open(&data, &index).unwrap();
            repo.insert(b"persisted").unwrap()
        };
        let repo = BinaryRepository::open(&data, &index).unwrap();
        assert_eq!(repo.count(), 1);
        assert_eq!(repo.fetch_owned(id).unwrap(), b"persisted");
    }
}
