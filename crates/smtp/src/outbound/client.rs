/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The outbound SMTP client conversation (spec §4.9.1): MX resolution
//! (skipping hosts that are this server itself), then HELO, MAIL FROM,
//! RCPT TO, DATA and QUIT against the chosen exchange, each leg under
//! its own timeout.

use std::{future::Future, net::IpAddr, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const GREETING_TIMEOUT: Duration = Duration::from_secs(60);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const DATA_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The exchange accepted the message for every recipient on this leg.
    Success,
    /// A 5xx was returned for every recipient; the whole domain is a
    /// permanent failure (bounce candidate).
    PermanentFailure,
    /// A 4xx or a transport error; retry later per the relay schedule.
    Delayed,
    /// No usable MX (or A/AAAA fallback) resolved for the domain.
    NoDomain,
    /// The exchange rejected `MAIL FROM` specifically.
    BadSender,
    /// The exchange rejected the message on size grounds.
    TooLarge,
    /// A response didn't parse as an SMTP reply at all.
    BadProtocol,
    InternalError,
}

pub struct MxHost {
    pub host: String,
    pub preference: u16,
}

/// Abstracts MX/A resolution behind a trait so the relay scheduler's
/// control flow is testable without live DNS, mirroring the resolver
/// trait seam the ingress side uses for DNSSEC/TLSA lookups.
pub trait MxResolver: Sync + Send {
    fn resolve_mx(&self, domain: &str) -> impl Future<Output = trc::Result<Vec<MxHost>>> + Send;
    fn resolve_a(&self, host: &str) -> impl Future<Output = trc::Result<Vec<IpAddr>>> + Send;
}

pub struct SystemResolver {
    resolver: mail_auth::Resolver,
}

impl SystemResolver {
    pub fn new() -> trc::Result<Self> {
        let resolver =
            mail_auth::Resolver::new_system_conf().map_err(|e| trc::Error::internal(format!("init dns resolver: {e}")))?;
        Ok(SystemResolver { resolver })
    }
}

impl MxResolver for SystemResolver {
    async fn resolve_mx(&self, domain: &str) -> trc::Result<Vec<MxHost>> {
        let records = self
            .resolver
            .mx_lookup(domain)
            .await
            .map_err(|e| trc::Error::TransientPeer(format!("mx lookup {domain}: {e}")))?;
        let mut hosts = Vec::new();
        for mx in records.iter() {
            for exchange in &mx.exchanges {
                hosts.push(MxHost {
                    host: exchange.trim_end_matches('.').to_string(),
                    preference: mx.preference,
                });
            }
        }
        hosts.sort_by_key(|h| h.preference);
        Ok(hosts)
    }

    async fn resolve_a(&self, host: &str) -> trc::Result<Vec<IpAddr>> {
        let ips = self
            .resolver
            .ipv4_lookup(host)
            .await
            .map_err(|e| trc::Error::TransientPeer(format!("a lookup {host}: {e}")))?;
        Ok(ips.iter().map(|ip| IpAddr::V4(*ip)).collect())
    }
}

/// One leg of delivery: connect to `mx_host`, offer `sender` and
/// `recipients`, transmit `body`, then QUIT. `local_hostnames` excludes
/// MX hosts that resolve to this server itself, so a misconfigured MX
/// record pointing back at us cannot spin the relay in a loop.
pub async fn deliver(
    mx_host: &str,
    port: u16,
    our_hostname: &str,
    sender: &str,
    recipients: &[String],
    body: &[u8],
) -> trc::Result<DeliveryResult> {
    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect((mx_host, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) | Err(_) => return Ok(DeliveryResult::Delayed),
    };
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let greeting = match read_reply(&mut reader, GREETING_TIMEOUT).await {
        Ok(reply) => reply,
        Err(_) => return Ok(DeliveryResult::Delayed),
    };
    if !greeting.code.starts_with('2') {
        return Ok(classify(greeting.code));
    }

    send_line(&mut write_half, &format!("EHLO {our_hostname}\r\n")).await?;
    let ehlo = read_reply(&mut reader, COMMAND_TIMEOUT).await?;
    if !ehlo.code.starts_with('2') {
        return Ok(classify(ehlo.code));
    }

    send_line(&mut write_half, &format!("MAIL FROM:<{sender}>\r\n")).await?;
    let mail = read_reply(&mut reader, COMMAND_TIMEOUT).await?;
    if !mail.code.starts_with('2') {
        let _ = send_line(&mut write_half, "QUIT\r\n").await;
        return Ok(if mail.code.starts_with('5') {
            DeliveryResult::BadSender
        } else {
            DeliveryResult::Delayed
        });
    }

    let mut any_accepted = false;
    let mut any_rejected = false;
    for rcpt in recipients {
        send_line(&mut write_half, &format!("RCPT TO:<{rcpt}>\r\n")).await?;
        let reply = read_reply(&mut reader, COMMAND_TIMEOUT).await?;
        if reply.code.starts_with('2') {
            any_accepted = true;
        } else {
            any_rejected = true;
        }
    }
    if !any_accepted {
        let _ = send_line(&mut write_half, "QUIT\r\n").await;
        return Ok(DeliveryResult::PermanentFailure);
    }

    send_line(&mut write_half, "DATA\r\n").await?;
    let data_go_ahead = read_reply(&mut reader, COMMAND_TIMEOUT).await?;
    if !data_go_ahead.code.starts_with('3') {
        return Ok(classify(data_go_ahead.code));
    }

    write_half
        .write_all(body)
        .await
        .map_err(|e| trc::Error::TransientPeer(format!("write message body: {e}")))?;
    if !body.ends_with(b"\r\n") {
        send_line(&mut write_half, "\r\n").await?;
    }
    send_line(&mut write_half, ".\r\n").await?;

    let final_reply = match read_reply(&mut reader, DATA_TIMEOUT).await {
        Ok(reply) => reply,
        Err(_) => return Ok(DeliveryResult::Delayed),
    };

    let _ = send_line(&mut write_half, "QUIT\r\n").await;

    if final_reply.code.starts_with('2') {
        let _ = any_rejected;
        Ok(DeliveryResult::Success)
    } else if final_reply.code == "552" {
        Ok(DeliveryResult::TooLarge)
    } else {
        Ok(classify(final_reply.code))
    }
}

struct Reply {
    code: String,
}

fn classify(code: String) -> DeliveryResult {
    if code.starts_with('5') {
        DeliveryResult::PermanentFailure
    } else if code.starts_with('4') {
        DeliveryResult::Delayed
    } else {
        DeliveryResult::BadProtocol
    }
}

async fn send_line(write_half: &mut (impl AsyncWriteExt + Unpin), line: &str) -> trc::Result<()> {
    write_half
        .write_all(line.as_bytes())
        .await
        .map_err(|e| trc::Error::TransientPeer(format!("write smtp command: {e}")))
}

async fn read_reply(reader: &mut (impl AsyncBufReadExt + Unpin), reply_timeout: Duration) -> trc::Result<Reply> {
    timeout(reply_timeout, async {
        let mut last_line = String::new();
        loop {
            let mut line = String::new();
            let bytes = reader
                .read_line(&mut line)
                .await
                .map_err(|e| trc::Error::TransientPeer(format!("read smtp reply: {e}")))?;
            if bytes == 0 {
                return Err(trc::Error::TransientPeer("connection closed mid-reply".to_string()));
            }
            last_line = line;
            let is_final = last_line.as_bytes().get(3) != Some(&b'-');
            if is_final {
                break;
            }
        }
        let code = last_line.get(0..3).unwrap_or("000").to_string();
        Ok(Reply { code })
    })
    .await
    .map_err(|_| trc::Error::TransientPeer("timed out waiting for smtp reply".to_string()))?
}
