//! TCP forward loop.
//!
//! One accept loop per TCP rule. Every inbound connection is handled in its
//! own task: dial the remote, then relay bytes in both directions until
//! either side closes. Cancelling the loop drops the listener and frees the
//! port; connections already accepted keep running until they finish.

use super::{TrafficCounters, WorkerContext, CHUNK_SIZE};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Accept loop for one rule (runs in a spawned task).
///
/// An accept error is a listener-level fault: the rule moves to `error` and
/// the loop exits. A cancel signal is a clean stop.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    mut cancel_rx: mpsc::Receiver<()>,
    ctx: WorkerContext,
) {
    let local = listener.local_addr().ok();
    info!(rule_id = %ctx.rule_id, local = ?local, remote = %ctx.remote_addr, "TCP forwarding started");

    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.recv() => {
                debug!(rule_id = %ctx.rule_id, "TCP accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((inbound, peer)) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            handle_connection(inbound, peer, ctx).await;
                        });
                    }
                    Err(e) => {
                        warn!(rule_id = %ctx.rule_id, error = %e, "TCP accept failed");
                        ctx.reporter.fail(format!("listener error: {e}")).await;
                        break;
                    }
                }
            }
        }
    }
}

/// Dial the remote for one inbound connection and relay until done.
///
/// A dial failure only closes this connection; the rule stays healthy.
async fn handle_connection(inbound: TcpStream, peer: SocketAddr, ctx: WorkerContext) {
    debug!(rule_id = %ctx.rule_id, peer = %peer, "inbound TCP connection");

    let dial = TcpStream::connect(&ctx.remote_addr);
    let outbound = match tokio::time::timeout(ctx.settings.connect_timeout, dial).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(rule_id = %ctx.rule_id, peer = %peer, remote = %ctx.remote_addr, error = %e, "remote dial failed");
            return;
        }
        Err(_) => {
            warn!(rule_id = %ctx.rule_id, peer = %peer, remote = %ctx.remote_addr, "remote dial timed out");
            return;
        }
    };

    let _guard = ctx.counters.open_connection();
    let _ = inbound.set_nodelay(true);
    let _ = outbound.set_nodelay(true);

    relay(inbound, outbound, &ctx.counters).await;
    debug!(rule_id = %ctx.rule_id, peer = %peer, "TCP relay ended");
}

/// Bidirectional relay. The first direction to finish (peer close or error)
/// ends the other, and both sockets are shut down.
pub(crate) async fn relay(inbound: TcpStream, outbound: TcpStream, counters: &TrafficCounters) {
    let (mut in_read, mut in_write) = inbound.into_split();
    let (mut out_read, mut out_write) = outbound.into_split();

    tokio::select! {
        result = copy_counted(&mut in_read, &mut out_write, counters) => {
            if let Err(e) = result {
                debug!(error = %e, "client → remote copy ended");
            }
        }
        result = copy_counted(&mut out_read, &mut in_write, counters) => {
            if let Err(e) = result {
                debug!(error = %e, "remote → client copy ended");
            }
        }
    }

    let _ = out_write.shutdown().await;
    let _ = in_write.shutdown().await;
}

/// Copy until EOF in `CHUNK_SIZE` reads, counting each chunk before it is
/// written through.
async fn copy_counted<R, W>(
    reader: &mut R,
    writer: &mut W,
    counters: &TrafficCounters,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        counters.add_bytes(n);
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::{ForwardSettings, RuleStore};
    use crate::testutil::{free_tcp_port, spawn_tcp_echo, wait_until};
    use portgate_core::{Protocol, RuleSpec, RuleStatus};
    use std::sync::Arc;
    use std::time::Duration;

    fn store() -> RuleStore {
        RuleStore::new(Arc::new(TrafficCounters::new()), ForwardSettings::default())
    }

    #[tokio::test]
    async fn ping_round_trips_through_echo_remote() {
        let echo_port = spawn_tcp_echo().await;
        let store = store();
        let local_port = free_tcp_port();
        let rule = store
            .start_rule(&RuleSpec::new(Protocol::Tcp, local_port, "127.0.0.1", echo_port))
            .await
            .unwrap();
        assert_eq!(rule.status, RuleStatus::Running);

        let before = store.counters().bytes_transferred();
        let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut reply))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(&reply, b"ping");

        let counters = Arc::clone(store.counters());
        assert!(wait_until(|| counters.bytes_transferred() >= before + 8).await);
        assert_eq!(counters.total_connections(), 1);
        assert_eq!(counters.active_connections(), 1);

        drop(client);
        assert!(wait_until(|| counters.active_connections() == 0).await);
        assert_eq!(counters.total_connections(), 1);
    }

    #[tokio::test]
    async fn dial_failure_keeps_rule_running() {
        let dead_port = free_tcp_port();
        let store = store();
        let local_port = free_tcp_port();
        let rule = store
            .start_rule(&RuleSpec::new(Protocol::Tcp, local_port, "127.0.0.1", dead_port))
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("connection was not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);

        let current = store.get_rule(&rule.id).await.unwrap();
        assert_eq!(current.status, RuleStatus::Running);
        assert_eq!(store.counters().total_connections(), 0);
    }

    #[tokio::test]
    async fn stopped_rule_lets_open_connection_drain() {
        let echo_port = spawn_tcp_echo().await;
        let store = store();
        let local_port = free_tcp_port();
        let rule = store
            .start_rule(&RuleSpec::new(Protocol::Tcp, local_port, "127.0.0.1", echo_port))
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", local_port)).await.unwrap();
        client.write_all(b"a").await.unwrap();
        let mut one = [0u8; 1];
        client.read_exact(&mut one).await.unwrap();

        store.stop_rule(&rule.id).await.unwrap();

        client.write_all(b"b").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut one))
            .await
            .expect("drain timed out")
            .unwrap();
        assert_eq!(&one, b"b");
        assert!(TcpStream::connect(("127.0.0.1", local_port)).await.is_err());
    }
}
