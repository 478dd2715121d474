pub mod circuit;
pub mod handshake;
pub mod session;
pub mod translate;
