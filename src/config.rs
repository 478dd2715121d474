//! Startup configuration: CLI arguments and the compile-time constants that bound
//! the session table.
//!
//! Everything here is immutable once [`Config::from_args`] returns; it is handed
//! around by shared reference like the translation table, so no synchronization
//! is needed.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use clap::Parser;

/// Maximum number of concurrent sessions. Bounds the readiness primitive's
/// descriptor usage to `2 * MAX_PEERS + 1` (listener) + stderr.
pub const MAX_PEERS: usize = 9;

/// Per-direction buffer size. Must be >= 512 to guarantee any legal SOCKS5 message
/// fits in one buffer.
pub const BUF_SIZE: usize = 4096;

/// Circuit credentials stay stable if reused within this many seconds of the last
/// use; otherwise the next request rotates to a fresh circuit.
pub const ROTATE_SECONDS: u64 = 60;

/// Destination used for raw (non-SOCKS5) client connections.
pub const DEFAULT_HOST: &str = "5gdvpfoh6kb2iqbizb37lzk2ddzrwa47m6rpdueg2m656fovmbhoptqd.onion";
pub const DEFAULT_PORT: u16 = 465;

const _: () = assert!(BUF_SIZE >= 512);

/// A loopback SOCKS5-to-SOCKS5 forwarder that isolates each session behind its own
/// synthetic circuit credentials.
#[derive(Debug, Parser)]
#[command(name = "torforward", about = "Transparent SOCKS5 forwarder for loopback Tor proxies")]
pub struct Cli {
    /// Local port to accept client SOCKS5 connections on.
    #[arg(value_parser = clap::value_parser!(u16).range(1..=65535))]
    pub local_port: u16,

    /// Port of the upstream SOCKS5 proxy (e.g. Tor's SocksPort).
    #[arg(value_parser = clap::value_parser!(u16).range(1..=65535))]
    pub upstream_port: u16,
}

/// Resolved addresses the event loop binds/connects to. Both are hard-coded to
/// loopback; only the ports come from the CLI.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Self {
        Config {
            listen_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, cli.local_port)),
            upstream_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, cli.upstream_port)),
        }
    }
}
