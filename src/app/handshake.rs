//! The dual-sided SOCKS5 handshake state machine.
//!
//! This runs twice per session, once parsing bytes arriving from the client in
//! [`process_client_bytes`], once parsing bytes arriving from the upstream proxy in
//! [`process_upstream_bytes`], interleaved by whichever socket the readiness loop
//! wakes up next. Each side is modeled as an explicit stage enum rather than as raw
//! buffer-length arithmetic. A stage's one-shot action only ever runs while the
//! session is still in that stage, so advancing the stage is itself the "fired
//! exactly once" marker.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::net::TcpStream;

use crate::app::circuit::CircuitGenerator;
use crate::app::session::Session;
use crate::app::translate::TranslationTable;
use crate::config::{Config, DEFAULT_HOST, DEFAULT_PORT};
use crate::error::SessionFault;

/// Synthetic success reply sent to the client once the upstream handshake
/// completes: version 5, request granted, reserved, IPv4 bound address 0.0.0.0:0.
const SYNTHETIC_REPLY: [u8; 10] = [5, 0, 0, 1, 0, 0, 0, 0, 0, 0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStage {
    /// Waiting for the first byte, which decides SOCKS5 vs. raw mode.
    Start,
    /// SOCKS5 path: waiting for `[5, nmethods, methods...]` to be fully present.
    Socks5Greeting,
    /// SOCKS5 path: waiting for the CONNECT request starting at `base`.
    Socks5Request { base: usize },
    /// Nothing left to parse; `out_buf` holds payload only.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamStage {
    /// Waiting for the 2-byte method-selection response.
    AwaitingMethodSelect,
    /// Waiting for the 2-byte username/password auth result.
    AwaitingAuthResult,
    /// Waiting for the variable-length CONNECT reply.
    AwaitingConnectReply,
    /// Nothing left to parse; `in_buf` holds payload only.
    Done,
}

#[derive(Debug, Clone)]
enum RequestedHost {
    Name(String),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
}

impl RequestedHost {
    fn host_string(&self) -> String {
        match self {
            RequestedHost::Name(name) => name.clone(),
            RequestedHost::Ipv4(addr) => addr.to_string(),
            RequestedHost::Ipv6(addr) => addr.to_string(),
        }
    }
}

/// Per-session handshake progress and the destination parsed out of the client's
/// request (if any), kept here instead of re-read from the client's buffer later.
#[derive(Debug, Clone)]
pub struct HandshakeState {
    client_stage: ClientStage,
    upstream_stage: UpstreamStage,
    client_is_socks5: bool,
    /// Total bytes of the client's greeting + request, to be stripped from
    /// `out_buf` once the handshake completes. Zero in raw mode.
    client_header_len: usize,
    dest_host: Option<RequestedHost>,
    dest_port: u16,
}

impl HandshakeState {
    pub fn new() -> Self {
        HandshakeState {
            client_stage: ClientStage::Start,
            upstream_stage: UpstreamStage::AwaitingMethodSelect,
            client_is_socks5: false,
            client_header_len: 0,
            dest_host: None,
            dest_port: 0,
        }
    }
}

impl Default for HandshakeState {
    fn default() -> Self {
        Self::new()
    }
}

fn would_block(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
}

/// Sends a complete handshake message in one shot. Handshake messages are a few
/// bytes on a loopback socket that was just confirmed connected/writable, so any
/// short write or error here is treated as fatal rather than retried.
fn send_handshake_msg(sock: &TcpStream, msg: &[u8]) -> Result<(), SessionFault> {
    match sock.try_write(msg) {
        Ok(n) if n == msg.len() => Ok(()),
        Ok(_) => Err(SessionFault::Protocol("short write during handshake")),
        Err(e) if would_block(&e) => Err(SessionFault::Protocol("handshake write would block")),
        Err(e) => Err(SessionFault::Io(e)),
    }
}

/// Determines the byte length of the client's CONNECT request starting at `base`,
/// or `None` if not enough bytes have arrived yet to know.
fn request_len(buf: &[u8], base: usize) -> Option<Result<usize, SessionFault>> {
    if buf.len() < base + 4 {
        return None;
    }
    match buf[base + 3] {
        1 => Some(Ok(10)),      // IPv4: 4 header + 4 address + 2 port
        4 => Some(Ok(22)),      // IPv6: 4 header + 16 address + 2 port
        3 => {
            if buf.len() < base + 5 {
                return None;
            }
            Some(Ok(buf[base + 4] as usize + 7)) // 4 header + 1 len + L + 2 port
        }
        _ => Some(Err(SessionFault::Protocol("unsupported address type"))),
    }
}

fn parse_request(bytes: &[u8]) -> Result<(RequestedHost, u16), SessionFault> {
    match bytes[3] {
        1 => {
            let addr = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
            let port = u16::from_be_bytes([bytes[8], bytes[9]]);
            Ok((RequestedHost::Ipv4(addr), port))
        }
        3 => {
            let len = bytes[4] as usize;
            let name = std::str::from_utf8(&bytes[5..5 + len])
                .map_err(|_| SessionFault::Protocol("non-utf8 domain name"))?
                .to_string();
            let port = u16::from_be_bytes([bytes[5 + len], bytes[6 + len]]);
            Ok((RequestedHost::Name(name), port))
        }
        4 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[4..20]);
            let port = u16::from_be_bytes([bytes[20], bytes[21]]);
            Ok((RequestedHost::Ipv6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(SessionFault::Protocol("unsupported address type")),
    }
}

/// Processes newly-arrived client bytes, advancing [`ClientStage`] as far as the
/// currently buffered data allows. Called after every successful client read while
/// the session is still handshaking.
pub async fn process_client_bytes(session: &mut Session, cfg: &Config) -> Result<(), SessionFault> {
    loop {
        match session.handshake.client_stage {
            ClientStage::Start => {
                if session.out_len < 1 {
                    return Ok(());
                }
                if session.out_buf[0] == 5 {
                    session.handshake.client_is_socks5 = true;
                    session.handshake.client_stage = ClientStage::Socks5Greeting;
                    continue;
                }
                session.handshake.client_is_socks5 = false;
                session.handshake.client_header_len = 0;
                session.handshake.client_stage = ClientStage::Done;
                begin_upstream_handshake(session, cfg).await?;
                return Ok(());
            }
            ClientStage::Socks5Greeting => {
                if session.out_len < 2 {
                    return Ok(());
                }
                let nmethods = session.out_buf[1] as usize;
                if session.out_len < 2 + nmethods {
                    return Ok(());
                }
                if !session.out_buf[2..2 + nmethods].contains(&0) {
                    return Err(SessionFault::Protocol("client offered no no-auth method"));
                }
                send_handshake_msg(&session.client, &[5, 0])?;
                session.handshake.client_stage = ClientStage::Socks5Request { base: 2 + nmethods };
                continue;
            }
            ClientStage::Socks5Request { base } => {
                let req_len = match request_len(&session.out_buf[..session.out_len], base) {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(len)) => len,
                };
                if session.out_len < base + req_len {
                    return Ok(());
                }
                let req = &session.out_buf[base..base + req_len];
                if req[0] != 5 || req[1] != 1 || req[2] != 0 || req_len < 6 {
                    return Err(SessionFault::Protocol("bad client CONNECT request"));
                }
                let (host, port) = parse_request(req)?;
                session.handshake.dest_host = Some(host);
                session.handshake.dest_port = port;
                session.handshake.client_header_len = base + req_len;
                session.handshake.client_stage = ClientStage::Done;
                begin_upstream_handshake(session, cfg).await?;
                return Ok(());
            }
            ClientStage::Done => return Ok(()),
        }
    }
}

/// Creates and connects the upstream socket and sends the method-selection
/// greeting. Performed inline, not spawned, so it briefly stalls the single
/// event loop task, which is acceptable since the proxy sits on loopback.
async fn begin_upstream_handshake(session: &mut Session, cfg: &Config) -> Result<(), SessionFault> {
    let sock = TcpStream::connect(cfg.upstream_addr).await?;
    session.upstream = Some(sock);
    send_handshake_msg(session.upstream.as_ref().unwrap(), &[5, 1, 2])?;
    session.handshake.upstream_stage = UpstreamStage::AwaitingMethodSelect;
    Ok(())
}

fn connect_reply_len(buf: &[u8]) -> Option<Result<usize, SessionFault>> {
    if buf.len() < 4 + 4 {
        return None;
    }
    match buf[4 + 3] {
        1 => Some(Ok(10)),
        4 => Some(Ok(22)),
        3 => {
            if buf.len() < 4 + 5 {
                return None;
            }
            Some(Ok(buf[4 + 4] as usize + 7))
        }
        _ => Some(Err(SessionFault::Protocol("bad CONNECT reply address type"))),
    }
}

fn build_connect_request(session: &Session, table: &TranslationTable) -> Vec<u8> {
    let (name, port) = if session.handshake.client_is_socks5 {
        let raw = session
            .handshake
            .dest_host
            .as_ref()
            .expect("client destination parsed before upstream handshake begins")
            .host_string();
        (table.translate(&raw).to_string(), session.handshake.dest_port)
    } else {
        (DEFAULT_HOST.to_string(), DEFAULT_PORT)
    };
    let name_bytes = name.as_bytes();
    let mut buf = Vec::with_capacity(7 + name_bytes.len());
    buf.push(5); // SOCKS version
    buf.push(1); // CONNECT
    buf.push(0); // reserved
    buf.push(3); // domain name address type
    buf.push(name_bytes.len() as u8);
    buf.extend_from_slice(name_bytes);
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

/// Processes newly-arrived upstream bytes, advancing [`UpstreamStage`] as far as
/// the currently buffered data allows. Called after every successful upstream read
/// while the session is still handshaking.
pub fn process_upstream_bytes(
    session: &mut Session,
    table: &TranslationTable,
    circuits: &mut CircuitGenerator,
) -> Result<(), SessionFault> {
    loop {
        match session.handshake.upstream_stage {
            UpstreamStage::AwaitingMethodSelect => {
                if session.in_len < 2 {
                    return Ok(());
                }
                if session.in_buf[0] != 5 || session.in_buf[1] != 2 {
                    return Err(SessionFault::Protocol("bad upstream method selection"));
                }
                let circuit = circuits.current_circuit();
                let msg = auth_request(circuit);
                send_handshake_msg(session.upstream.as_ref().unwrap(), &msg)?;
                session.handshake.upstream_stage = UpstreamStage::AwaitingAuthResult;
                continue;
            }
            UpstreamStage::AwaitingAuthResult => {
                if session.in_len < 4 {
                    return Ok(());
                }
                if session.in_buf[2] != 1 || session.in_buf[3] != 0 {
                    return Err(SessionFault::Protocol("upstream rejected auth"));
                }
                let connect_req = build_connect_request(session, table);
                send_handshake_msg(session.upstream.as_ref().unwrap(), &connect_req)?;
                session.handshake.upstream_stage = UpstreamStage::AwaitingConnectReply;
                continue;
            }
            UpstreamStage::AwaitingConnectReply => {
                let reply_len = match connect_reply_len(&session.in_buf[..session.in_len]) {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(len)) => len,
                };
                if session.in_len < 4 + reply_len {
                    return Ok(());
                }
                let reply = &session.in_buf[4..4 + reply_len];
                if reply[0] != 5 || reply[1] != 0 || reply[2] != 0 || reply_len < 6 {
                    return Err(SessionFault::Protocol("bad upstream CONNECT reply"));
                }
                complete_handshake(session, 4 + reply_len);
                return Ok(());
            }
            UpstreamStage::Done => return Ok(()),
        }
    }
}

/// Encodes a 32-bit circuit ID as the 4-byte username and 4-byte password of a
/// username/password sub-negotiation request: `'a' + nibble`, LSB-first, low 16
/// bits as the username and high 16 bits as the password.
fn auth_request(circuit: u32) -> [u8; 11] {
    let nibble = |n: u32| b'a' + ((circuit >> (n * 4)) & 0xf) as u8;
    [
        0x01, // sub-negotiation version
        4,
        nibble(0),
        nibble(1),
        nibble(2),
        nibble(3),
        4,
        nibble(4),
        nibble(5),
        nibble(6),
        nibble(7),
    ]
}

/// Fires exactly once, when the upstream CONNECT reply is fully present. Excises
/// the handshake bytes from both buffers and, for SOCKS5 clients, prepends the
/// synthesized success reply ahead of any payload the upstream already piggybacked.
fn complete_handshake(session: &mut Session, consumed_inbound_len: usize) {
    session.handshaking = false;
    session.handshake.upstream_stage = UpstreamStage::Done;
    session.handshake.client_stage = ClientStage::Done;

    let residual_len = session.in_len - consumed_inbound_len;
    if session.handshake.client_is_socks5 {
        debug_assert!(
            consumed_inbound_len >= SYNTHETIC_REPLY.len(),
            "consumed handshake prefix must be at least as long as the synthetic reply"
        );
        session
            .in_buf
            .copy_within(consumed_inbound_len..consumed_inbound_len + residual_len, SYNTHETIC_REPLY.len());
        session.in_buf[..SYNTHETIC_REPLY.len()].copy_from_slice(&SYNTHETIC_REPLY);
        session.in_len = SYNTHETIC_REPLY.len() + residual_len;
    } else {
        session.in_buf.copy_within(consumed_inbound_len..consumed_inbound_len + residual_len, 0);
        session.in_len = residual_len;
    }

    let header_len = session.handshake.client_header_len;
    let residual_out = session.out_len - header_len;
    session.out_buf.copy_within(header_len..header_len + residual_out, 0);
    session.out_len = residual_out;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_request_encodes_circuit_nibbles() {
        // circuit = 0x04030201 -> username "abcd", password "efgh" style encoding
        let circuit: u32 = 0x0403_0201;
        let msg = auth_request(circuit);
        assert_eq!(msg[0], 0x01);
        assert_eq!(msg[1], 4);
        assert_eq!(msg[6], 4);
        // low 16 bits (0x0201) nibble-by-nibble, LSB first
        assert_eq!(msg[2], b'a' + 1);
        assert_eq!(msg[3], b'a' + 0);
        assert_eq!(msg[4], b'a' + 2);
        assert_eq!(msg[5], b'a' + 0);
        // high 16 bits (0x0403)
        assert_eq!(msg[7], b'a' + 3);
        assert_eq!(msg[8], b'a' + 0);
        assert_eq!(msg[9], b'a' + 4);
        assert_eq!(msg[10], b'a' + 0);
    }

    #[test]
    fn request_len_waits_for_domain_length_byte() {
        let partial = [5, 1, 0, 3];
        assert!(request_len(&partial, 0).is_none());
        let with_len = [5, 1, 0, 3, 11];
        match request_len(&with_len, 0) {
            Some(Ok(len)) => assert_eq!(len, 11 + 7),
            other => panic!("expected Some(Ok(18)), got {other:?}"),
        }
    }

    #[test]
    fn request_len_ipv4_is_fixed() {
        let buf = [5, 1, 0, 1];
        assert_eq!(request_len(&buf, 0).unwrap().unwrap(), 10);
    }

    #[test]
    fn request_len_rejects_unknown_atyp() {
        let buf = [5, 1, 0, 7];
        assert!(request_len(&buf, 0).unwrap().is_err());
    }

    #[test]
    fn connect_reply_len_domain() {
        let mut buf = vec![0, 0, 0, 0, 5, 0, 0, 3, 3];
        buf.extend_from_slice(b"abc");
        buf.extend_from_slice(&[0, 0]);
        assert_eq!(connect_reply_len(&buf).unwrap().unwrap(), 3 + 7);
    }

    #[test]
    fn connect_reply_len_ipv4() {
        let buf = [0, 0, 0, 0, 5, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        assert_eq!(connect_reply_len(&buf).unwrap().unwrap(), 10);
    }
}
