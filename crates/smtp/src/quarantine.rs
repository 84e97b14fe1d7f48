/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Quarantine (spec §3, §9): messages accepted-but-untrusted — a forged
//! local sender on the alien port, an AUTH attempt from a whitelisted IP,
//! or a submission user writing a `MAIL FROM` they aren't permitted to
//! originate — are persisted as a flat file outside the binary
//! repository and every index, with no manifest append and no relay
//! queue entry. The client still sees the normal 250 accepted response.

use std::path::PathBuf;

use common::Core;

/// Writes `body` to one `.pop3` file under the quarantine root, named so
/// concurrent ingress from the same second never collides.
pub fn write(core: &Core, body: &[u8]) -> trc::Result<PathBuf> {
    let root = &core.config.server.quarantine_root;
    std::fs::create_dir_all(root).map_err(|e| trc::Error::internal(format!("create quarantine root: {e}")))?;

    let name = format!("{:010}-{:06}.pop3", utils::now(), rand::random::<u32>() % 1_000_000);
    let path = root.join(name);
    std::fs::write(&path, body).map_err(|e| trc::Error::internal(format!("write quarantine file: {e}")))?;
    Ok(path)
}
