/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The SMTP engine: ingress session state machine and its async wiring,
//! the wire response catalog, the DATA-complete persistence pipeline and
//! the outbound relay (spec §4.6-§4.10).

pub mod inbound;
pub mod outbound;
pub mod persist;
pub mod quarantine;
pub mod session;
pub mod wire;
