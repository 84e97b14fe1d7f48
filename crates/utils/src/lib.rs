/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod chain;
pub mod codec;
pub mod listener;
pub mod reputation;

/// Returns the current time as epoch seconds. Centralized so tests can
/// reason about it without touching the system clock directly.
pub fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// RFC 5322 `Date:`/SMTP trace-header style timestamp: `dow, mon dd
/// hh:mm:ss yyyy` (spec §4.7, `Received:` trace header format).
pub fn format_trace_date(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%a, %d %b %H:%M:%S %Y").to_string()
}
