//! Local port availability check.
//!
//! For TCP this is a heuristic: a loopback connect that succeeds means
//! something is listening, and any failure is read as "free". A server that
//! refuses loopback connections, or listens only on another interface, is
//! misread as free; the subsequent bind is what actually decides. For UDP a
//! connect says nothing, so the check binds the port and releases it.

use portgate_core::Protocol;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether `port` looks free for a new rule of `protocol`.
pub async fn port_is_free(protocol: Protocol, port: u16) -> bool {
    match protocol {
        Protocol::Tcp => {
            let connect = TcpStream::connect(("127.0.0.1", port));
            let occupied = matches!(
                tokio::time::timeout(CONNECT_TIMEOUT, connect).await,
                Ok(Ok(_))
            );
            debug!(port, occupied, "TCP port check");
            !occupied
        }
        Protocol::Udp => {
            let free = UdpSocket::bind(("0.0.0.0", port)).await.is_ok();
            debug!(port, free, "UDP port check");
            free
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{free_tcp_port, free_udp_port};

    #[tokio::test]
    async fn listening_tcp_port_is_occupied() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_is_free(Protocol::Tcp, port).await);
        drop(listener);
        assert!(port_is_free(Protocol::Tcp, port).await);
    }

    #[tokio::test]
    async fn unused_ports_are_free() {
        assert!(port_is_free(Protocol::Tcp, free_tcp_port()).await);
        assert!(port_is_free(Protocol::Udp, free_udp_port()).await);
    }

    #[tokio::test]
    async fn bound_udp_port_is_occupied() {
        let socket = UdpSocket::bind("0.0.0.0:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        assert!(!port_is_free(Protocol::Udp, port).await);
    }
}
