//! The readiness-multiplexed event loop.
//!
//! Every iteration rebuilds the set of sockets worth waiting on from scratch,
//! mirroring the FD_SET rebuild a `select(2)`-based loop would do each pass, then
//! waits on whichever socket (or the listener) becomes ready first via
//! [`futures::future::select_all`], dispatches exactly one read-or-write step, and
//! loops. Running this under a current-thread runtime with no `tokio::spawn` calls
//! keeps everything on a single task and a single thread.

use std::future::Future;
use std::pin::Pin;

use futures::future::select_all;
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream};

use crate::app::circuit::CircuitGenerator;
use crate::app::session::{self, Session, SessionTable};
use crate::app::translate::TranslationTable;
use crate::config::Config;
use crate::error::ForwardError;

#[derive(Clone, Copy)]
enum Which {
    Client,
    Upstream,
}

enum Event {
    Accept(std::io::Result<(TcpStream, std::net::SocketAddr)>),
    Socket {
        idx: usize,
        which: Which,
        result: std::io::Result<tokio::io::Ready>,
    },
}

fn add_interest(acc: Option<Interest>, next: Interest) -> Option<Interest> {
    Some(match acc {
        Some(existing) => existing | next,
        None => next,
    })
}

fn client_interest(session: &Session) -> Option<Interest> {
    let mut acc = None;
    if session.client_read_interest() {
        acc = add_interest(acc, Interest::READABLE);
    }
    if session.client_write_interest() {
        acc = add_interest(acc, Interest::WRITABLE);
    }
    acc
}

fn upstream_interest(session: &Session) -> Option<Interest> {
    let mut acc = None;
    if session.upstream_read_interest() {
        acc = add_interest(acc, Interest::READABLE);
    }
    if session.upstream_write_interest() {
        acc = add_interest(acc, Interest::WRITABLE);
    }
    acc
}

/// Runs the forwarder until a fatal error occurs. Never returns `Ok` on its own;
/// the caller races this against a shutdown signal.
pub async fn run(listener: TcpListener, cfg: Config) -> Result<(), ForwardError> {
    let mut table = SessionTable::new();
    let mut circuits = CircuitGenerator::new();
    let translation = TranslationTable::load();

    loop {
        table.purge_dead();

        let mut events: Vec<Pin<Box<dyn Future<Output = Event> + '_>>> = Vec::new();

        if table.has_free_slot() {
            events.push(Box::pin(async { Event::Accept(listener.accept().await) }));
        }

        for (idx, session) in table.iter_mut() {
            if let Some(interest) = client_interest(session) {
                let sock: &TcpStream = &session.client;
                events.push(Box::pin(async move {
                    Event::Socket {
                        idx,
                        which: Which::Client,
                        result: sock.ready(interest).await,
                    }
                }));
            }
            if let Some(interest) = upstream_interest(session) {
                if let Some(sock) = session.upstream.as_ref() {
                    events.push(Box::pin(async move {
                        Event::Socket {
                            idx,
                            which: Which::Upstream,
                            result: sock.ready(interest).await,
                        }
                    }));
                }
            }
        }

        if events.is_empty() {
            // No free slot and no session has any pending interest: nothing can
            // make progress. This only happens transiently right after every slot
            // finished tearing down in the same tick as filling up again.
            tokio::task::yield_now().await;
            continue;
        }

        let (event, _, remaining) = select_all(events).await;
        drop(remaining);

        match event {
            Event::Accept(Ok((client, _peer))) => {
                log::debug!("accepted new client connection");
                table.install(client);
            }
            Event::Accept(Err(e)) => {
                return Err(ForwardError::Readiness(e));
            }
            Event::Socket { idx, which, result } => {
                let ready = match result {
                    Ok(r) => r,
                    Err(_) => {
                        if let Some(s) = table.get_mut(idx) {
                            session::shutdown_all(s).await;
                        }
                        continue;
                    }
                };
                let Some(s) = table.get_mut(idx) else {
                    continue;
                };
                dispatch(s, idx, which, ready, &cfg, &translation, &mut circuits).await;
            }
        }
    }
}

async fn dispatch(
    session: &mut Session,
    idx: usize,
    which: Which,
    ready: tokio::io::Ready,
    cfg: &Config,
    translation: &TranslationTable,
    circuits: &mut CircuitGenerator,
) {
    match which {
        Which::Client => {
            if ready.is_readable() && session.client_read_interest() {
                if let Err(fault) = session::read_client(session, cfg).await {
                    log::warn!("session {idx}: {fault}");
                    session::shutdown_all(session).await;
                    return;
                }
            }
            if ready.is_writable() && session.client_write_interest() {
                session::write_client(session).await;
            }
        }
        Which::Upstream => {
            if ready.is_readable() && session.upstream_read_interest() {
                if let Err(fault) = session::read_upstream(session, translation, circuits).await {
                    log::warn!("session {idx}: {fault}");
                    session::shutdown_all(session).await;
                    return;
                }
            }
            if ready.is_writable() && session.upstream_write_interest() {
                session::write_upstream(session).await;
            }
        }
    }
}
