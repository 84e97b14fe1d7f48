/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The reactor (spec §4.6). `tokio`'s multi-threaded epoll/kqueue-backed
//! executor *is* the edge-triggered multiplexor the spec describes;
//! running it with a single worker thread (see `crates/main`) gives the
//! single-threaded-cooperative contract of spec §5 thread R, while each
//! accepted connection still gets its own non-blocking task instead of a
//! hand-rolled callback table.

pub mod limiter;

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use limiter::ConcurrencyLimiter;

/// The protocol kind a listening socket is tagged with (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerProtocol {
    SmtpAlien,
    SmtpSubmission,
    Pop3Cleartext,
    Pop3Tls,
}

pub struct ServerInstance {
    pub id: String,
    pub protocol: ServerProtocol,
    pub hostname: String,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub limiter: ConcurrencyLimiter,
    /// Slow-loris defense: refuse a second connect from the same IP on
    /// the same listener within this window (spec §4.6, 15 seconds).
    pub reconnect_guard: Duration,
    last_connect: Mutex<AHashMap<IpAddr, Instant>>,
}

impl ServerInstance {
    pub fn new(
        id: impl Into<String>,
        protocol: ServerProtocol,
        hostname: impl Into<String>,
        max_connections: usize,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Arc<Self> {
        Arc::new(ServerInstance {
            id: id.into(),
            protocol,
            hostname: hostname.into(),
            tls_acceptor,
            limiter: ConcurrencyLimiter::new(max_connections),
            reconnect_guard: Duration::from_secs(15),
            last_connect: Mutex::new(AHashMap::new()),
        })
    }

    /// Returns true if this peer IP reconnected too soon and should be
    /// refused outright (spec §4.6 slow-loris defense).
    fn is_throttled(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut guard = self.last_connect.lock();
        let throttled = guard
            .get(&ip)
            .map(|last| now.duration_since(*last) < self.reconnect_guard)
            .unwrap_or(false);
        guard.insert(ip, now);
        throttled
    }
}

/// Accepts connections on `addr` tagged with `instance`, enforcing the
/// per-listener connection cap and slow-loris reconnect guard, and
/// invoking `on_accept` for every connection that passes both. Checking
/// IP reputation is the caller's responsibility inside `on_accept` (it
/// needs the shared reputation store, which this module does not own).
pub async fn serve<F, Fut>(
    addr: SocketAddr,
    instance: Arc<ServerInstance>,
    on_accept: F,
) -> std::io::Result<()>
where
    F: Fn(TcpStream, SocketAddr, Arc<ServerInstance>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    let on_accept = Arc::new(on_accept);
    loop {
        let (stream, peer) = listener.accept().await?;
        if instance.is_throttled(peer.ip()) {
            continue;
        }
        let Some(in_flight) = instance.limiter.try_acquire() else {
            continue;
        };
        let instance = instance.clone();
        let on_accept = on_accept.clone();
        tokio::spawn(async move {
            let _in_flight = in_flight;
            on_accept(stream, peer, instance).await;
        });
    }
}
