/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Support code shared by the `epismail`/`emailimp` CLI tools (spec §6).
//! The `epistula` server binary itself (`src/main.rs`) does not depend on
//! this library target.

pub mod cli_support;
