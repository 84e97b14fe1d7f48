/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Outbound relay (spec §4.9, §4.10): the on-disk queue, the SMTP client
//! conversation and the relay scheduler that drives both, plus bounce
//! generation for permanently failed or expired deliveries.

pub mod bounce;
pub mod client;
pub mod queue;
pub mod scheduler;
