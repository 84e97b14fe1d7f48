/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! The `epistula` server binary (spec §5, §6): the reactor (thread R) and
//! the relay scheduler (thread S), wired together from one loaded
//! [`common::config::Config`].
//!
//! The reactor runs on a single-worker tokio runtime — the cooperative,
//! edge-triggered single-threaded contract spec §5 asks of thread R is
//! exactly what `tokio`'s executor gives for free when pinned to one
//! worker, per `utils::listener`'s own doc comment. The relay scheduler
//! runs on a dedicated OS thread with its own minimal runtime, so a slow
//! or wedged outbound peer can never stall an ingress accept.
//!
//! TLS termination itself is out of scope (spec §6: "the reactor exposes
//! a uniform byte-stream interface whether or not TLS is in use") — every
//! listener here binds a plain TCP socket regardless of its configured
//! protocol kind.

#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use common::{config::Config, Core};
use pop3::inbound as pop3_inbound;
use smtp::{
    inbound::{dns::SystemDnsChecker, handle_connection as smtp_handle_connection},
    outbound::{client::SystemResolver, scheduler},
    persist::ShortFormStore,
    session::SmtpVariant,
};
use tokio::net::TcpStream;
use tracing::Instrument;
use utils::listener::{ServerInstance, ServerProtocol};

/// A self-contained Internet mail server: SMTP ingress, POP3 egress and
/// outbound relay over one persistent content-addressed message store.
#[derive(Parser)]
#[command(name = "epistula")]
struct Cli {
    /// Path to the TOML configuration file (spec §6, SPEC_FULL §12).
    #[arg(long, default_value = "conf/epistula.toml")]
    config: String,
}

fn main() -> trc::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    std::fs::create_dir_all(&config.server.log_root)
        .map_err(|e| trc::Error::internal(format!("create log root: {e}")))?;
    let _log_guard = trc::subscriber::init(&config.server.log_root);

    let core = Core::open(config)?;
    let short_form = Arc::new(ShortFormStore::open(core.store.db())?);
    let dns_checker = Arc::new(SystemDnsChecker::new()?);

    let relay_core = core.clone();
    std::thread::Builder::new()
        .name("epistula-relay".to_string())
        .spawn(move || run_relay_scheduler(relay_core))
        .map_err(|e| trc::Error::internal(format!("spawn relay scheduler thread: {e}")))?;

    let reactor = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| trc::Error::internal(format!("build reactor runtime: {e}")))?;
    reactor.block_on(run_reactor(core, short_form, dns_checker))
}

/// Thread S: polls the outbound queue at `relay.poll_interval_secs`
/// cadence (spec §5) until the process exits.
fn run_relay_scheduler(core: Arc<Core>) {
    let resolver = match SystemResolver::new() {
        Ok(resolver) => resolver,
        Err(err) => {
            err.log();
            return;
        }
    };
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to build relay scheduler runtime");
            return;
        }
    };

    let poll_interval = Duration::from_secs(core.config.relay.poll_interval_secs.max(1));
    loop {
        if let Err(err) = runtime.block_on(scheduler::run_once(&core, &resolver)) {
            err.log();
        }
        std::thread::sleep(poll_interval);
    }
}

/// Thread R: binds every configured listener and drives it for the life
/// of the process.
async fn run_reactor(core: Arc<Core>, short_form: Arc<ShortFormStore>, dns_checker: Arc<SystemDnsChecker>) -> trc::Result<()> {
    let mut handles = Vec::new();
    for listener_cfg in core.config.listener.clone() {
        let addr: SocketAddr = listener_cfg
            .bind
            .parse()
            .map_err(|e| trc::Error::internal(format!("listener {} has invalid bind address {}: {e}", listener_cfg.id, listener_cfg.bind)))?;
        let protocol = map_protocol(listener_cfg.protocol);
        let instance = ServerInstance::new(listener_cfg.id.clone(), protocol, core.hostname.clone(), listener_cfg.max_connections, None);

        let core = core.clone();
        let short_form = short_form.clone();
        let dns_checker = dns_checker.clone();
        let id = listener_cfg.id.clone();
        handles.push(tokio::spawn(async move {
            let result = utils::listener::serve(addr, instance, move |stream, peer, instance| {
                let core = core.clone();
                let short_form = short_form.clone();
                let dns_checker = dns_checker.clone();
                let span = tracing::info_span!(
                    "connection",
                    conn_id = next_connection_id(),
                    peer = %peer,
                    protocol = ?instance.protocol,
                );
                accept_connection(core, short_form, dns_checker, stream, peer, instance).instrument(span)
            })
            .await;
            if let Err(err) = result {
                tracing::error!(listener = %id, error = %err, "listener stopped");
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

fn next_connection_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn map_protocol(protocol: common::config::ListenerProtocol) -> ServerProtocol {
    use common::config::ListenerProtocol as Cfg;
    match protocol {
        Cfg::SmtpAlien => ServerProtocol::SmtpAlien,
        Cfg::SmtpSubmission => ServerProtocol::SmtpSubmission,
        Cfg::Pop3 => ServerProtocol::Pop3Cleartext,
        Cfg::Pop3Tls => ServerProtocol::Pop3Tls,
    }
}

/// The shared on-accept callback for every listener (spec §4.6): consults
/// the IP reputation store before the protocol-specific handler ever
/// runs, so a blacklisted peer (unless freshly whitelisted) is dropped
/// with no reply at all.
async fn accept_connection(
    core: Arc<Core>,
    short_form: Arc<ShortFormStore>,
    dns_checker: Arc<SystemDnsChecker>,
    stream: TcpStream,
    peer: SocketAddr,
    instance: Arc<ServerInstance>,
) {
    if let std::net::IpAddr::V4(ipv4) = peer.ip() {
        let now = utils::now();
        if core.reputation.is_blacklisted(ipv4, now) && !core.reputation.is_whitelisted(ipv4, now) {
            return;
        }
    }

    match instance.protocol {
        ServerProtocol::SmtpAlien => {
            smtp_handle_connection(core, dns_checker, short_form, stream, peer, SmtpVariant::Alien).await;
        }
        ServerProtocol::SmtpSubmission => {
            smtp_handle_connection(core, dns_checker, short_form, stream, peer, SmtpVariant::Submission).await;
        }
        ServerProtocol::Pop3Cleartext | ServerProtocol::Pop3Tls => {
            pop3_inbound::handle_connection(core, stream, peer).await;
        }
    }
}
