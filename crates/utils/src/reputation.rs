/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! IP reputation store (spec §3, §4): an in-memory map plus a durable
//! append-only log of `IP -> {white, black, timestamps, counters}`.
//! Writer is always the reactor thread; readers run on both threads with
//! no mutation from the relay scheduler thread (spec §5).

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    net::Ipv4Addr,
    path::Path,
};

use ahash::AHashMap;
use parking_lot::RwLock;

pub const WHITE: u32 = 1 << 0;
pub const BLACK: u32 = 1 << 1;
pub const SMTP: u32 = 1 << 2;
pub const POP3: u32 = 1 << 3;
pub const HTTP: u32 = 1 << 4;
pub const DATA: u32 = 1 << 5;
pub const PROT: u32 = 1 << 6;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReputationEntry {
    pub flags: u32,
    /// Epoch seconds at which the WHITE flag expires.
    pub t_white: i64,
    /// Epoch seconds at which the BLACK flag expires (0 = never).
    pub t_black: i64,
    pub since_count: u32,
    pub total_count: u32,
}

impl ReputationEntry {
    pub fn is_white(&self, now: i64) -> bool {
        self.flags & WHITE != 0 && (self.t_white == 0 || now < self.t_white)
    }

    pub fn is_black(&self, now: i64) -> bool {
        self.flags & BLACK != 0 && (self.t_black == 0 || now < self.t_black)
    }
}

pub struct ReputationStore {
    entries: RwLock<AHashMap<Ipv4Addr, ReputationEntry>>,
    log: parking_lot::Mutex<Option<File>>,
}

impl ReputationStore {
    pub fn open(log_path: &Path) -> std::io::Result<Self> {
        let mut entries = AHashMap::new();
        if log_path.exists() {
            let file = File::open(log_path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if let Some(record) = parse_log_line(&line) {
                    entries.insert(record.0, record.1);
                }
            }
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        Ok(ReputationStore {
            entries: RwLock::new(entries),
            log: parking_lot::Mutex::new(Some(log)),
        })
    }

    pub fn in_memory() -> Self {
        ReputationStore {
            entries: RwLock::new(AHashMap::new()),
            log: parking_lot::Mutex::new(None),
        }
    }

    pub fn get(&self, ip: Ipv4Addr) -> ReputationEntry {
        self.entries.read().get(&ip).copied().unwrap_or_default()
    }

    pub fn is_whitelisted(&self, ip: Ipv4Addr, now: i64) -> bool {
        self.get(ip).is_white(now)
    }

    pub fn is_blacklisted(&self, ip: Ipv4Addr, now: i64) -> bool {
        self.get(ip).is_black(now)
    }

    /// Whitelist an IP, expiring after `ttl_secs` (administrative
    /// interval, spec's invariant that whitelisting always expires).
    pub fn whitelist(&self, ip: Ipv4Addr, now: i64, ttl_secs: i64) {
        let mut entries = self.entries.write();
        let entry = entries.entry(ip).or_default();
        entry.flags |= WHITE;
        entry.t_white = now + ttl_secs;
        self.append(ip, *entry);
    }

    /// Blacklists an IP for `service` (one of SMTP/POP3/HTTP/DATA/PROT).
    /// `ttl_secs` of `None` means the flag never expires implicitly,
    /// matching the spec's invariant that blacklist flags persist unless
    /// a TTL was given at set time.
    pub fn blacklist(&self, ip: Ipv4Addr, service: u32, now: i64, ttl_secs: Option<i64>) {
        let mut entries = self.entries.write();
        let entry = entries.entry(ip).or_default();
        entry.flags |= BLACK | service;
        entry.t_black = ttl_secs.map(|ttl| now + ttl).unwrap_or(0);
        entry.total_count += 1;
        entry.since_count += 1;
        self.append(ip, *entry);
    }

    fn append(&self, ip: Ipv4Addr, entry: ReputationEntry) {
        let mut guard = self.log.lock();
        if let Some(file) = guard.as_mut() {
            let _ = writeln!(
                file,
                "{ip},{flags},{t_white},{t_black},{since},{total}",
                flags = entry.flags,
                t_white = entry.t_white,
                t_black = entry.t_black,
                since = entry.since_count,
                total = entry.total_count,
            );
        }
    }
}

fn parse_log_line(line: &str) -> Option<(Ipv4Addr, ReputationEntry)> {
    let mut parts = line.split(',');
    let ip: Ipv4Addr = parts.next()?.parse().ok()?;
    let flags: u32 = parts.next()?.parse().ok()?;
    let t_white: i64 = parts.next()?.parse().ok()?;
    let t_black: i64 = parts.next()?.parse().ok()?;
    let since_count: u32 = parts.next()?.parse().ok()?;
    let total_count: u32 = parts.next()?.parse().ok()?;
    Some((
        ip,
        ReputationEntry {
            flags,
            t_white,
            t_black,
            since_count,
            total_count,
        },
    ))
}
