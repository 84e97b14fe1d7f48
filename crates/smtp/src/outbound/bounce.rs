/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Bounce generation (spec §4.10): a delivery-failure notice addressed
//! back to the original sender, with `Return-Path: <>` so the bounce
//! itself can never itself be bounced. Delivered locally through the
//! same persistence pipeline when the sender is local, or re-enqueued as
//! an outbound relay entry when the sender is alien.

use mail_builder::MessageBuilder;

use common::Core;

use super::queue::QueueEntryHeader;
use crate::persist::{self, PersistInput, ShortFormStore};

pub async fn generate(
    core: &Core,
    header: &QueueEntryHeader,
    original_body: &[u8],
    failed_recipients: &[String],
    reason: &str,
) -> trc::Result<()> {
    if header.sender.is_empty() {
        // The original message was itself a bounce (empty return path);
        // the invariant "a bounce is never bounced" stops here.
        return Ok(());
    }

    let excerpt = header_excerpt(original_body, 2048);
    let body = format!(
        "This is an automatically generated delivery failure notice.\r\n\r\n\
         The following recipient(s) could not be delivered:\r\n{}\r\n\r\n\
         Reason: {reason}\r\n\r\n\
         --- original message headers ---\r\n{excerpt}\r\n",
        failed_recipients
            .iter()
            .map(|r| format!("  {r}"))
            .collect::<Vec<_>>()
            .join("\r\n"),
    );

    let mut out = Vec::new();
    MessageBuilder::new()
        .from(("Mail Delivery Subsystem", format!("postmaster@{}", core.hostname)))
        .to(vec![(header.sender_realname.as_str(), header.sender.as_str())])
        .subject("Undeliverable mail")
        .text_body(body)
        .write_to(&mut out)
        .map_err(|e| trc::Error::internal(format!("build bounce message: {e}")))?;

    let bounce_body = prepend_return_path(&out);

    let sender_domain = header.sender.rsplit_once('@').map(|(_, d)| d).unwrap_or("");
    if core.directory.routing.is_local_domain(sender_domain) {
        deliver_locally(core, header, bounce_body).await
    } else {
        requeue_to_sender(core, header, bounce_body).await
    }
}

fn prepend_return_path(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 16);
    out.extend_from_slice(b"Return-Path: <>\r\n");
    out.extend_from_slice(message);
    out
}

fn header_excerpt(body: &[u8], max_bytes: usize) -> String {
    let end = body
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 2)
        .unwrap_or(body.len())
        .min(max_bytes);
    String::from_utf8_lossy(&body[..end]).to_string()
}

async fn deliver_locally(core: &Core, header: &QueueEntryHeader, bounce_body: Vec<u8>) -> trc::Result<()> {
    let resolution = core.directory.routing.resolve_recipient(&header.sender);
    let directory::RecipientResolution::Local { mailboxes, .. } = resolution else {
        return Ok(());
    };
    let short_form = ShortFormStore::open(core.store.db())?;
    let input = PersistInput {
        body: bounce_body,
        sender_address: String::new(),
        sender_domain: core.hostname.clone(),
        sender_realname: "Mail Delivery Subsystem".to_string(),
        subject: "Undeliverable mail".to_string(),
        message_id: format!("<bounce-{}@{}>", utils::now(), core.hostname),
        recipients: vec![header.sender.clone()],
        mailbox_targets: mailboxes,
        relay_targets: Vec::new(),
        client_ip: header.client_ip,
        resolved_fqdn: None,
        authenticated_as: None,
    };
    persist::persist_message(core, &short_form, input).map(|_| ())
}

async fn requeue_to_sender(core: &Core, header: &QueueEntryHeader, bounce_body: Vec<u8>) -> trc::Result<()> {
    let short_form = ShortFormStore::open(core.store.db())?;
    let input = PersistInput {
        body: bounce_body,
        sender_address: String::new(),
        sender_domain: core.hostname.clone(),
        sender_realname: "Mail Delivery Subsystem".to_string(),
        subject: "Undeliverable mail".to_string(),
        message_id: format!("<bounce-{}@{}>", utils::now(), core.hostname),
        recipients: vec![header.sender.clone()],
        mailbox_targets: Vec::new(),
        relay_targets: vec![header.sender.clone()],
        client_ip: header.client_ip,
        resolved_fqdn: None,
        authenticated_as: None,
    };
    persist::persist_message(core, &short_form, input).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_header(sender: &str) -> QueueEntryHeader {
        QueueEntryHeader {
            sender: sender.to_string(),
            auth_user: None,
            sender_realname: "Alice".to_string(),
            client_ip: std::net::IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)),
            resolved_fqdn: None,
            mail_id: "00000001".to_string(),
            recipients: vec!["bob@outside.test".to_string()],
        }
    }

    #[tokio::test]
    async fn bounce_never_bounces_itself() {
        let dir = tempfile::tempdir().unwrap();
        let core = Core::open_in(dir.path()).unwrap();
        let mut header = sample_header("alice@local.example");
        header.sender = String::new();
        generate(&core, &header, b"Subject: hi\r\n\r\nbody", &["bob@outside.test".to_string()], "timed out")
            .await
            .unwrap();
        // no panic, no manifest entries created for anyone
    }

    #[tokio::test]
    async fn local_sender_bounce_is_delivered_to_their_mailbox() {
        let dir = tempfile::tempdir().unwrap();
        let core = Core::open_in(dir.path()).unwrap();
        core.directory
            .routing
            .add_local_address("alice@local.example", "alice", "Inbox", 1);
        let header = sample_header("alice@local.example");
        generate(
            &core,
            &header,
            b"Subject: hi\r\n\r\nbody",
            &["bob@outside.test".to_string()],
            "no mail exchanger for domain",
        )
        .await
        .unwrap();

        let manifest_path = store::Store::manifest_path(&core.config.server.mailbox_root, "alice").unwrap();
        let manifest = store::Manifest::open(manifest_path).unwrap();
        assert_eq!(manifest.len(), 1);
    }
}
