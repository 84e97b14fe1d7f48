/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Per-account POP3 manifests (spec §4.8.1): an append-only text file of
//! `ep%010u,%010u\n` records (UIDL digits, message size in bytes) naming
//! every message ever delivered to the mailbox. One manifest per account,
//! one writer at a time — guarded by a single `parking_lot::Mutex`
//! wrapping both the open file handle and the in-memory entry list so the
//! two never drift apart.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use crate::ids::DatumId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestEntry {
    pub datum_id: DatumId,
    pub size: u32,
}

struct Inner {
    file: File,
    entries: Vec<ManifestEntry>,
}

pub struct Manifest {
    path: PathBuf,
    inner: Mutex<Inner>,
}

/// Above this many stale bytes (lines whose message has been physically
/// removed since last compaction), `needs_compaction` reports true.
const COMPACTION_SLACK_BYTES: u64 = 64 * 1024;

impl Manifest {
    pub fn open(path: impl AsRef<Path>) -> trc::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| trc::Error::internal(format!("open manifest {}: {e}", path.display())))?;

        let mut entries = Vec::new();
        for line in BufReader::new(
            File::open(&path).map_err(|e| trc::Error::internal(format!("reopen manifest: {e}")))?,
        )
        .lines()
        {
            let line = line.map_err(|e| trc::Error::internal(format!("read manifest line: {e}")))?;
            if let Some(entry) = parse_line(&line) {
                entries.push(entry);
            }
        }

        Ok(Manifest {
            path,
            inner: Mutex::new(Inner { file, entries }),
        })
    }

    /// Appends a new message record. The manifest never rewrites prior
    /// lines on append — only `compact` does.
    pub fn append(&self, datum_id: DatumId, size: u32) -> trc::Result<()> {
        let mut inner = self.inner.lock();
        let line = format!("{},{:010}\n", datum_id.to_uidl(), size);
        inner
            .file
            .write_all(line.as_bytes())
            .and_then(|_| inner.file.sync_data())
            .map_err(|e| trc::Error::internal(format!("append manifest: {e}")))?;
        inner.entries.push(ManifestEntry { datum_id, size });
        Ok(())
    }

    /// A snapshot of every entry currently on record, in append order —
    /// this defines POP3 message-number assignment for the session that
    /// calls it (spec §4.8).
    pub fn entries(&self) -> Vec<ManifestEntry> {
        self.inner.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// True once the on-disk manifest has grown enough past its live
    /// entry count to be worth rewriting (spec §4.8.1 grow-check).
    pub fn needs_compaction(&self) -> trc::Result<bool> {
        let inner = self.inner.lock();
        let on_disk = inner
            .file
            .metadata()
            .map_err(|e| trc::Error::internal(format!("stat manifest: {e}")))?
            .len();
        let live_estimate = inner.entries.len() as u64 * 23;
        Ok(on_disk > live_estimate + COMPACTION_SLACK_BYTES)
    }

    /// Rewrites the manifest keeping only entries for which `retain`
    /// returns true (used after POP3 QUIT has applied pending DELEs),
    /// replacing the file atomically via rename.
    pub fn compact(&self, retain: impl Fn(&ManifestEntry) -> bool) -> trc::Result<()> {
        let mut inner = self.inner.lock();
        let kept: Vec<ManifestEntry> = inner.entries.iter().copied().filter(|e| retain(e)).collect();

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path)
            .map_err(|e| trc::Error::internal(format!("create manifest tmp: {e}")))?;
        for entry in &kept {
            let line = format!("{},{:010}\n", entry.datum_id.to_uidl(), entry.size);
            tmp.write_all(line.as_bytes())
                .map_err(|e| trc::Error::internal(format!("write manifest tmp: {e}")))?;
        }
        tmp.sync_all()
            .map_err(|e| trc::Error::internal(format!("sync manifest tmp: {e}")))?;
        fs::rename(&tmp_path, &self.path)
            .map_err(|e| trc::Error::internal(format!("replace manifest: {e}")))?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| trc::Error::internal(format!("reopen manifest after compact: {e}")))?;
        inner.file = file;
        inner.entries = kept;
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<ManifestEntry> {
    let (uidl, size) = line.split_once(',')?;
    let digits = uidl.strip_prefix("ep")?;
    let raw_id: u32 = digits.parse().ok()?;
    let size: u32 = size.parse().ok()?;
    Some(ManifestEntry {
        datum_id: DatumId(raw_id),
        size,
    })
}
