//! Per-session buffers, half-close bookkeeping, and the generic (post-handshake)
//! non-blocking I/O handlers that splice bytes between the client and upstream
//! sockets.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::app::circuit::CircuitGenerator;
use crate::app::handshake::{self, HandshakeState};
use crate::app::translate::TranslationTable;
use crate::config::{Config, BUF_SIZE, MAX_PEERS};
use crate::error::SessionFault;

fn would_block(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
}

/// One proxied connection. `out_buf`/`out_len` carry client-to-upstream bytes;
/// `in_buf`/`in_len` carry upstream-to-client bytes, named for the direction
/// relative to the upstream socket.
pub struct Session {
    pub client: TcpStream,
    pub upstream: Option<TcpStream>,

    pub out_buf: Box<[u8; BUF_SIZE]>,
    pub out_len: usize,
    pub out_eof: bool,

    pub in_buf: Box<[u8; BUF_SIZE]>,
    pub in_len: usize,
    pub in_eof: bool,

    pub handshaking: bool,
    pub handshake: HandshakeState,

    /// Set once both directions have fully shut down; the table sweeps and frees
    /// the slot on the next pass rather than freeing it mid-handler.
    pub dead: bool,
}

impl Session {
    fn new(client: TcpStream) -> Self {
        Session {
            client,
            upstream: None,
            out_buf: Box::new([0u8; BUF_SIZE]),
            out_len: 0,
            out_eof: false,
            in_buf: Box::new([0u8; BUF_SIZE]),
            in_len: 0,
            in_eof: false,
            handshaking: true,
            handshake: HandshakeState::new(),
            dead: false,
        }
    }

    pub fn client_read_interest(&self) -> bool {
        self.out_len < BUF_SIZE && !self.out_eof
    }

    pub fn client_write_interest(&self) -> bool {
        self.in_len > 0 && !self.handshaking
    }

    pub fn upstream_read_interest(&self) -> bool {
        self.upstream.is_some() && self.in_len < BUF_SIZE && !self.in_eof
    }

    pub fn upstream_write_interest(&self) -> bool {
        self.upstream.is_some() && self.out_len > 0 && !self.handshaking
    }
}

/// Fixed-capacity table of live sessions, indexed by slot.
pub struct SessionTable {
    slots: [Option<Session>; MAX_PEERS],
}

impl SessionTable {
    pub fn new() -> Self {
        SessionTable {
            slots: std::array::from_fn(|_| None),
        }
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.iter().any(|s| s.is_none())
    }

    /// Installs a freshly-accepted client into the first free slot. The caller is
    /// expected to have already checked [`has_free_slot`] before accepting.
    pub fn install(&mut self, client: TcpStream) {
        for slot in self.slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(Session::new(client));
                return;
            }
        }
        // Dropping `client` here closes it; reachable only if the caller accepted
        // without checking `has_free_slot` first.
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Session> {
        self.slots[idx].as_mut()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Session)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| s.as_mut().map(|s| (i, s)))
    }

    /// Drops every session whose both directions have fully shut down, freeing
    /// their slots for new connections.
    pub fn purge_dead(&mut self) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(s) if s.dead) {
                *slot = None;
            }
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Half-closes the upstream-to-client direction: no more bytes will be delivered
/// to the client once `in_buf` drains. Mirrors the reference implementation's
/// `shutdown_in`, including the full-teardown check when the other direction has
/// already drained and ended, or the session never finished handshaking.
pub async fn shutdown_in(session: &mut Session) {
    session.in_eof = true;
    if session.in_len == 0 {
        let _ = session.client.shutdown().await;
        if (session.out_len == 0 && session.out_eof) || session.handshaking {
            shutdown_all(session).await;
        }
    }
}

/// Half-closes the client-to-upstream direction; symmetric with [`shutdown_in`].
pub async fn shutdown_out(session: &mut Session) {
    session.out_eof = true;
    if session.out_len == 0 {
        if let Some(up) = session.upstream.as_mut() {
            let _ = up.shutdown().await;
        }
        if session.in_len == 0 && session.in_eof {
            shutdown_all(session).await;
        }
    }
}

/// Ends the session outright: both sockets closed, slot marked for reclaiming.
pub async fn shutdown_all(session: &mut Session) {
    let _ = session.client.shutdown().await;
    if let Some(up) = session.upstream.as_mut() {
        let _ = up.shutdown().await;
    }
    session.dead = true;
}

/// Reads from the client into `out_buf`. On EOF or a permanent error, half-closes
/// that direction. While handshaking, newly-arrived bytes are handed to the
/// handshake parser, whose protocol errors propagate as a full-teardown signal.
pub async fn read_client(session: &mut Session, cfg: &Config) -> Result<(), SessionFault> {
    let old_len = session.out_len;
    let result = session.client.try_read(&mut session.out_buf[old_len..]);
    match result {
        Ok(0) => {
            shutdown_out(session).await;
            Ok(())
        }
        Ok(n) => {
            session.out_len += n;
            if session.handshaking {
                handshake::process_client_bytes(session, cfg).await?;
            }
            Ok(())
        }
        Err(e) if would_block(&e) => Ok(()),
        Err(_) => {
            shutdown_out(session).await;
            Ok(())
        }
    }
}

/// Reads from the upstream socket into `in_buf`; symmetric with [`read_client`].
pub async fn read_upstream(
    session: &mut Session,
    table: &TranslationTable,
    circuits: &mut CircuitGenerator,
) -> Result<(), SessionFault> {
    if session.upstream.is_none() {
        return Ok(());
    }
    let old_len = session.in_len;
    let result = {
        let buf = &mut session.in_buf[old_len..];
        session.upstream.as_ref().unwrap().try_read(buf)
    };
    match result {
        Ok(0) => {
            shutdown_in(session).await;
            Ok(())
        }
        Ok(n) => {
            session.in_len += n;
            if session.handshaking {
                handshake::process_upstream_bytes(session, table, circuits)?;
            }
            Ok(())
        }
        Err(e) if would_block(&e) => Ok(()),
        Err(_) => {
            shutdown_in(session).await;
            Ok(())
        }
    }
}

/// Flushes `in_buf` to the client. Only called once the handshake has completed
/// (see [`Session::client_write_interest`]), so any bytes here are payload.
pub async fn write_client(session: &mut Session) {
    if session.in_len > 0 {
        match session.client.try_write(&session.in_buf[..session.in_len]) {
            Ok(n) => {
                session.in_buf.copy_within(n..session.in_len, 0);
                session.in_len -= n;
            }
            Err(e) if would_block(&e) => {}
            Err(_) => {
                session.in_len = 0;
                shutdown_in(session).await;
                return;
            }
        }
    }
    if session.in_eof && session.in_len == 0 {
        shutdown_in(session).await;
    }
}

/// Flushes `out_buf` to the upstream socket; symmetric with [`write_client`].
pub async fn write_upstream(session: &mut Session) {
    if session.upstream.is_none() {
        return;
    }
    if session.out_len > 0 {
        let result = session
            .upstream
            .as_ref()
            .unwrap()
            .try_write(&session.out_buf[..session.out_len]);
        match result {
            Ok(n) => {
                session.out_buf.copy_within(n..session.out_len, 0);
                session.out_len -= n;
            }
            Err(e) if would_block(&e) => {}
            Err(_) => {
                session.out_len = 0;
                shutdown_out(session).await;
                return;
            }
        }
    }
    if session.out_eof && session.out_len == 0 {
        shutdown_out(session).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client_res, accept_res) = tokio::join!(connect, accept);
        (client_res.unwrap(), accept_res.unwrap().0)
    }

    async fn test_session() -> Session {
        let (a, _b) = loopback_pair().await;
        Session::new(a)
    }

    #[tokio::test]
    async fn fresh_session_wants_client_reads_only() {
        let session = test_session().await;
        assert!(session.client_read_interest());
        assert!(!session.client_write_interest());
        assert!(!session.upstream_read_interest());
        assert!(!session.upstream_write_interest());
    }

    #[tokio::test]
    async fn write_interest_withheld_while_handshaking() {
        let mut session = test_session().await;
        session.in_len = 5;
        assert!(session.handshaking);
        assert!(!session.client_write_interest());
        session.handshaking = false;
        assert!(session.client_write_interest());
    }

    #[tokio::test]
    async fn read_interest_drops_once_buffer_full_or_eof() {
        let mut session = test_session().await;
        session.out_len = BUF_SIZE;
        assert!(!session.client_read_interest());
        session.out_len = 0;
        session.out_eof = true;
        assert!(!session.client_read_interest());
    }

    #[tokio::test]
    async fn upstream_interest_requires_socket_present() {
        let mut session = test_session().await;
        session.in_len = 10;
        session.handshaking = false;
        assert!(!session.upstream_write_interest());
        let (_, b) = loopback_pair().await;
        session.upstream = Some(b);
        assert!(session.upstream_write_interest());
    }

    #[tokio::test]
    async fn shutdown_out_tears_down_once_both_sides_drained_and_ended() {
        let mut session = test_session().await;
        session.in_eof = true;
        shutdown_out(&mut session).await;
        assert!(session.dead);
    }

    #[tokio::test]
    async fn shutdown_out_half_closes_without_tearing_down_if_inbound_still_open() {
        let mut session = test_session().await;
        shutdown_out(&mut session).await;
        assert!(session.out_eof);
        assert!(!session.dead);
    }

    #[tokio::test]
    async fn purge_dead_frees_slot() {
        let mut table = SessionTable::new();
        let (a, _b) = loopback_pair().await;
        table.install(a);
        assert!(!table.has_free_slot() || MAX_PEERS > 1);
        for (_, s) in table.iter_mut() {
            s.dead = true;
        }
        table.purge_dead();
        assert!(table.has_free_slot());
    }
}
