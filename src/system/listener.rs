//! Listener setup.

use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::error::ForwardError;

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ForwardError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ForwardError::Bind { addr, source })
}
