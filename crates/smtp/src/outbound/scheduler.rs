/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The relay scheduler (spec §4.9, §5 thread S): scans the outbound
//! queue at `poll_interval_secs` cadence, groups each entry's recipients
//! by domain and drives one delivery attempt per domain that is due,
//! widening the retry delay on transient failure and bouncing on
//! permanent failure or expiry.

use std::collections::BTreeMap;

use ahash::AHashSet;
use common::Core;

use super::{
    bounce,
    client::{self, DeliveryResult, MxResolver},
    queue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Due,
    NotYetDue,
    Completed,
    Expired,
}

/// Runs one sweep of the queue. Intended to be called in a loop by the
/// dedicated relay-scheduler thread (spec §5), sleeping
/// `relay.poll_interval_secs` between calls.
pub async fn run_once(core: &Core, resolver: &impl MxResolver) -> trc::Result<Vec<TaskOutcome>> {
    let mut outcomes = Vec::new();
    for entry_path in queue::scan(&core.config.server.queue_root)? {
        let retry = match queue::read_retry_state(&entry_path) {
            Ok(retry) => retry,
            Err(_) => continue,
        };
        let now = utils::now();
        if retry.next_attempt_epoch > now {
            outcomes.push(TaskOutcome::NotYetDue);
            continue;
        }
        if now - retry.first_attempt_epoch > core.config.relay.expire_after_secs {
            expire_entry(core, &entry_path).await?;
            outcomes.push(TaskOutcome::Expired);
            continue;
        }

        outcomes.push(process_entry(core, resolver, &entry_path, retry).await?);
    }
    Ok(outcomes)
}

async fn process_entry(
    core: &Core,
    resolver: &impl MxResolver,
    entry_path: &std::path::Path,
    mut retry: queue::RetryState,
) -> trc::Result<TaskOutcome> {
    let raw = std::fs::read(entry_path).map_err(|e| trc::Error::internal(format!("read queue entry: {e}")))?;
    let (header, body) = queue::parse_entry(&raw)?;

    let already_done: AHashSet<&str> = retry.completed.iter().map(String::as_str).collect();
    let mut by_domain: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for rcpt in &header.recipients {
        if already_done.contains(rcpt.as_str()) {
            continue;
        }
        let domain = rcpt.rsplit_once('@').map(|(_, d)| d).unwrap_or("");
        by_domain.entry(domain).or_default().push(rcpt.clone());
    }

    if by_domain.is_empty() {
        queue::mark_terminal(entry_path, retry.had_failure)?;
        return Ok(TaskOutcome::Completed);
    }

    let mut any_delayed = false;
    for (domain, recipients) in by_domain {
        let hosts = resolver.resolve_mx(domain).await.unwrap_or_default();
        if hosts.is_empty() {
            bounce::generate(core, &header, &body, &recipients, "no mail exchanger for domain").await?;
            retry.completed.extend(recipients);
            retry.had_failure = true;
            continue;
        }

        let mut result = DeliveryResult::Delayed;
        for host in &hosts {
            if host.host.eq_ignore_ascii_case(&core.hostname) {
                continue;
            }
            result = client::deliver(&host.host, core.config.relay.outbound_port, &core.hostname, &header.sender, &recipients, &body)
                .await
                .unwrap_or(DeliveryResult::Delayed);
            if matches!(result, DeliveryResult::Success) {
                break;
            }
        }

        match result {
            DeliveryResult::Success => {
                retry.completed.extend(recipients);
            }
            DeliveryResult::PermanentFailure | DeliveryResult::BadSender | DeliveryResult::TooLarge => {
                let reason = match result {
                    DeliveryResult::BadSender => "sender rejected by remote exchange",
                    DeliveryResult::TooLarge => "message too large for remote exchange",
                    _ => "rejected by remote exchange",
                };
                bounce::generate(core, &header, &body, &recipients, reason).await?;
                retry.completed.extend(recipients);
                retry.had_failure = true;
            }
            DeliveryResult::NoDomain => {
                bounce::generate(core, &header, &body, &recipients, "no mail exchanger for domain").await?;
                retry.completed.extend(recipients);
                retry.had_failure = true;
            }
            DeliveryResult::Delayed | DeliveryResult::BadProtocol | DeliveryResult::InternalError => {
                any_delayed = true;
            }
        }
    }

    if retry.completed.len() >= header.recipients.len() {
        queue::mark_terminal(entry_path, retry.had_failure)?;
        return Ok(TaskOutcome::Completed);
    }

    retry.attempts += 1;
    retry.next_attempt_epoch = utils::now() + core.config.relay.retry_delta_secs * retry.attempts as i64;
    queue::write_retry_state(entry_path, &retry)?;
    Ok(if any_delayed { TaskOutcome::Due } else { TaskOutcome::Completed })
}

async fn expire_entry(core: &Core, entry_path: &std::path::Path) -> trc::Result<()> {
    let raw = std::fs::read(entry_path).map_err(|e| trc::Error::internal(format!("read queue entry: {e}")))?;
    let (header, body) = queue::parse_entry(&raw)?;
    bounce::generate(core, &header, &body, &header.recipients, "relay retry window expired").await?;
    queue::mark_terminal(entry_path, true).map(|_| ())
}
