/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! MD5 digest for checksum use only — never used as an authentication
//! mechanism (spec §4.1).

pub fn digest(data: &[u8]) -> [u8; 16] {
    *::md5::compute(data)
}

pub fn digest_hex(data: &[u8]) -> String {
    format!("{:x}", ::md5::compute(data))
}
