/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The `datum_id`: a monotonically assigned 32-bit unsigned integer
//! identifying one entry in the binary message repository (spec §3).

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatumId(pub u32);

impl DatumId {
    /// The 8-hex-digit form used as the formal-message-id ISAM value
    /// (spec §3 "Formal message id").
    pub fn to_hex(self) -> String {
        format!("{:08x}", self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        u32::from_str_radix(s, 16).ok().map(DatumId)
    }

    /// The `epNNNNNNNNNN` POP3 UIDL form (spec §6).
    pub fn to_uidl(self) -> String {
        format!("ep{:010}", self.0)
    }
}

impl fmt::Display for DatumId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
