/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The POP3 engine: egress session state machine and its async wiring,
//! and the wire response catalog (spec §4.6, §4.8, §4.8.1).

pub mod inbound;
pub mod session;
pub mod wire;
