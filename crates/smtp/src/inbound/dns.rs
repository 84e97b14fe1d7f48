/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Sender DNS verification for the alien SMTP port (spec §4.7): a PTR
//! lookup on the peer's IP, classified into the three-way
//! [`crate::session::DnsVerdict`] the session state machine expects.
//! Abstracted behind a trait so the session dispatch loop is testable
//! without live DNS, mirroring the `MxResolver` seam on the outbound side.

use std::{future::Future, net::IpAddr};

use crate::session::DnsVerdict;

pub trait DnsChecker: Send + Sync + 'static {
    fn verdict(&self, remote_ip: IpAddr, helo_domain: &str, sender_domain: &str) -> impl Future<Output = DnsVerdict> + Send;
}

pub struct SystemDnsChecker {
    resolver: mail_auth::Resolver,
}

impl SystemDnsChecker {
    pub fn new() -> trc::Result<Self> {
        let resolver =
            mail_auth::Resolver::new_system_conf().map_err(|e| trc::Error::internal(format!("init dns resolver: {e}")))?;
        Ok(SystemDnsChecker { resolver })
    }
}

impl DnsChecker for SystemDnsChecker {
    async fn verdict(&self, remote_ip: IpAddr, _helo_domain: &str, sender_domain: &str) -> DnsVerdict {
        match self.resolver.ptr_lookup(remote_ip).await {
            Ok(names) if !names.is_empty() => {
                let sender_domain = sender_domain.to_ascii_lowercase();
                let skunk = !names
                    .iter()
                    .any(|name| name.to_ascii_lowercase().contains(&sender_domain));
                DnsVerdict::Ok { skunk }
            }
            Ok(_) => DnsVerdict::NoMx,
            Err(_) => DnsVerdict::TempFail,
        }
    }
}
