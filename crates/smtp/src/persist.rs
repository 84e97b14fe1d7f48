/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The persistence pipeline run at successful SMTP DATA completion (spec
//! §4.7.1): repository insert, correspondent upsert, short-form record,
//! formal-message-id duplicate detection, manifest append and outbound
//! queue entry.

use std::{net::IpAddr, sync::Arc};

use common::Core;
use directory::routing::MailboxTarget;
use serde::{Deserialize, Serialize};
use store::{DatumId, IndexKind, IndexSpec, IndexedObjectStore, Manifest};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShortFormMessage {
    /// Sub-second-resolution accept instant; also the record's unique
    /// ordering key (spec §3).
    pub date_id: i64,
    pub sender_domain: String,
    pub sender_realname: String,
    pub subject: String,
    pub sender_address: String,
    pub recipients: Vec<String>,
    pub datum_id: DatumId,
}

pub struct ShortFormStore {
    objects: IndexedObjectStore<ShortFormMessage>,
}

impl ShortFormStore {
    pub fn open(db: Arc<sled::Db>) -> trc::Result<Self> {
        let objects = IndexedObjectStore::open(
            db,
            "short_form",
            &[IndexSpec {
                name: "datum_id",
                kind: IndexKind::Unique,
            }],
        )?;
        Ok(ShortFormStore { objects })
    }

    pub fn insert(&self, record: &ShortFormMessage) -> trc::Result<store::ObjectId> {
        self.objects.insert(record, &[("datum_id", &record.datum_id.0.to_be_bytes())])
    }

    pub fn fetch_by_datum_id(&self, datum_id: DatumId) -> trc::Result<Option<ShortFormMessage>> {
        self.objects.fetch_by_unique("datum_id", &datum_id.0.to_be_bytes())
    }
}

pub struct PersistInput {
    /// The verbatim IMF (header block + body) as it will be stored and
    /// replayed to POP3 clients.
    pub body: Vec<u8>,
    pub sender_address: String,
    pub sender_domain: String,
    pub sender_realname: String,
    pub subject: String,
    pub message_id: String,
    /// Every address the ingress accepted as a recipient, for the
    /// correspondent cache — mailbox owners and relay targets alike.
    pub recipients: Vec<String>,
    pub mailbox_targets: Vec<MailboxTarget>,
    pub relay_targets: Vec<String>,
    pub client_ip: IpAddr,
    pub resolved_fqdn: Option<String>,
    pub authenticated_as: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Stored { datum_id: DatumId },
    /// The formal message id was already on record; per spec §4.7.1 step
    /// 4 the pipeline stops here with no manifest or queue side effects,
    /// but the client still sees success.
    Duplicate { datum_id: DatumId },
}

pub fn persist_message(core: &Core, short_form: &ShortFormStore, input: PersistInput) -> trc::Result<PersistOutcome> {
    // Checked before the repository gets touched: the repository has no
    // rollback (spec §4.2), so a duplicate formal message id must never
    // cause a second entry to be appended.
    if let Some(datum_id) = core.store.lookup_by_formal_id(input.message_id.as_bytes())? {
        return Ok(PersistOutcome::Duplicate { datum_id });
    }

    let datum_id = core.store.repo.insert(&input.body)?;

    core.directory
        .correspondents
        .observe(&input.sender_address, Some(&input.sender_realname))?;
    for rcpt in &input.recipients {
        core.directory.correspondents.observe(rcpt, None)?;
    }

    let record = ShortFormMessage {
        date_id: chrono::Utc::now().timestamp_micros(),
        sender_domain: input.sender_domain.clone(),
        sender_realname: input.sender_realname.clone(),
        subject: input.subject.clone(),
        sender_address: input.sender_address.clone(),
        recipients: input.recipients.clone(),
        datum_id,
    };
    let object_id = short_form.insert(&record)?;
    if object_id.0 != datum_id.0 as u64 {
        tracing::debug!(
            datum_id = datum_id.0,
            object_id = object_id.0,
            "short-form object id diverged from datum id"
        );
    }

    // Only reachable if another insert of the same formal id raced this one
    // in between the lookup above and here — doesn't happen under the
    // single-writer-thread model (spec §5), kept as a defensive fallback.
    let inserted = core.store.formal_id_index.insert(input.message_id.as_bytes(), &datum_id.0.to_be_bytes())?;
    if !inserted {
        return Ok(PersistOutcome::Duplicate { datum_id });
    }
    core.store
        .short_form_index
        .insert(datum_id.to_hex().as_bytes(), &object_id.0.to_be_bytes())?;

    for target in &input.mailbox_targets {
        let path = store::Store::manifest_path(&core.config.server.mailbox_root, &target.account_username)?;
        let manifest = Manifest::open(path)?;
        manifest.append(datum_id, input.body.len() as u32)?;
    }

    if !input.relay_targets.is_empty() {
        crate::outbound::queue::write_queue_entry(core, &input, datum_id)?;
    }

    Ok(PersistOutcome::Stored { datum_id })
}
