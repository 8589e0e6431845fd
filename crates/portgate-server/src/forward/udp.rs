//! UDP forward loop.
//!
//! One bound socket per UDP rule. The first datagram from a new client
//! address opens an outbound socket connected to the remote; that mapping is
//! cached and reused for later datagrams from the same client. A return task
//! per mapping relays remote replies back to the client through the bound
//! socket, so the relay works in both directions.
//!
//! The remote address is resolved once and cached for the life of the loop.
//! Opening a mapping stays responsive to the cancel signal. A sweep timer
//! drops idle client mappings whether or not other clients are sending.

use super::{TrafficCounters, WorkerContext};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Upper bound between idle sweeps.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Largest datagram the relay will carry.
const MAX_DATAGRAM: usize = 65_535;

/// Per-client state: the outbound socket and the task relaying replies.
struct ClientMapping {
    outbound: Arc<UdpSocket>,
    return_task: JoinHandle<()>,
    last_seen: Instant,
}

impl Drop for ClientMapping {
    fn drop(&mut self) {
        self.return_task.abort();
    }
}

/// Datagram loop for one rule (runs in a spawned task).
///
/// On exit every cached mapping is dropped, which aborts its return task
/// and closes its outbound socket.
pub(crate) async fn relay_loop(
    socket: UdpSocket,
    mut cancel_rx: mpsc::Receiver<()>,
    ctx: WorkerContext,
) {
    let socket = Arc::new(socket);
    let local = socket.local_addr().ok();
    info!(rule_id = %ctx.rule_id, local = ?local, remote = %ctx.remote_addr, "UDP forwarding started");

    let mut clients: HashMap<SocketAddr, ClientMapping> = HashMap::new();
    let mut target: Option<SocketAddr> = None;
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut sweep = tokio::time::interval(sweep_period(ctx.settings.udp_client_idle));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.recv() => {
                debug!(rule_id = %ctx.rule_id, "UDP relay cancelled");
                break;
            }
            _ = sweep.tick() => {
                expire_idle(&mut clients, ctx.settings.udp_client_idle, &ctx.rule_id);
            }
            result = socket.recv_from(&mut buf) => {
                let (n, peer) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(rule_id = %ctx.rule_id, error = %e, "UDP receive failed");
                        ctx.reporter.fail(format!("socket error: {e}")).await;
                        break;
                    }
                };

                if !clients.contains_key(&peer) {
                    let opened = tokio::select! {
                        biased;
                        _ = cancel_rx.recv() => {
                            debug!(rule_id = %ctx.rule_id, peer = %peer, "UDP relay cancelled while opening a mapping");
                            break;
                        }
                        result = open_mapping(peer, &socket, &ctx, &mut target) => result,
                    };
                    match opened {
                        Ok(mapping) => {
                            debug!(rule_id = %ctx.rule_id, peer = %peer, "new UDP client");
                            clients.insert(peer, mapping);
                        }
                        Err(e) => {
                            warn!(rule_id = %ctx.rule_id, peer = %peer, remote = %ctx.remote_addr, error = %e, "cannot open UDP mapping");
                            continue;
                        }
                    }
                }

                if let Some(mapping) = clients.get_mut(&peer) {
                    mapping.last_seen = Instant::now();
                    match mapping.outbound.send(&buf[..n]).await {
                        Ok(sent) => ctx.counters.add_bytes(sent),
                        Err(e) => debug!(rule_id = %ctx.rule_id, peer = %peer, error = %e, "UDP send to remote failed"),
                    }
                }
            }
        }
    }

    let mappings = clients.len();
    clients.clear();
    debug!(rule_id = %ctx.rule_id, mappings, "UDP relay closed");
}

/// Sweep at least once per poll interval, and often enough that a mapping
/// never outlives its idle limit by more than one period.
fn sweep_period(idle: Duration) -> Duration {
    idle.min(RECV_POLL_INTERVAL).max(Duration::from_millis(10))
}

/// Resolve the rule's remote, reusing the cached address when there is one.
/// A failed lookup is not cached, so the next new client retries it.
async fn resolve_remote(
    ctx: &WorkerContext,
    cached: &mut Option<SocketAddr>,
) -> io::Result<SocketAddr> {
    if let Some(addr) = *cached {
        return Ok(addr);
    }
    let lookup = tokio::net::lookup_host(&ctx.remote_addr);
    let addr = tokio::time::timeout(ctx.settings.connect_timeout, lookup)
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("resolving {} timed out", ctx.remote_addr),
            )
        })??
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {}", ctx.remote_addr),
            )
        })?;
    debug!(rule_id = %ctx.rule_id, remote = %addr, "UDP remote resolved");
    *cached = Some(addr);
    Ok(addr)
}

/// Open an outbound socket for `peer`, connected to the rule's remote, and
/// start its return task.
async fn open_mapping(
    peer: SocketAddr,
    listener: &Arc<UdpSocket>,
    ctx: &WorkerContext,
    target: &mut Option<SocketAddr>,
) -> io::Result<ClientMapping> {
    let target = resolve_remote(ctx, target).await?;

    let unspecified: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let outbound = UdpSocket::bind(unspecified).await?;
    outbound.connect(target).await?;
    let outbound = Arc::new(outbound);

    let return_task = tokio::spawn(return_path(
        Arc::clone(&outbound),
        Arc::clone(listener),
        peer,
        Arc::clone(&ctx.counters),
        ctx.rule_id.clone(),
    ));

    Ok(ClientMapping {
        outbound,
        return_task,
        last_seen: Instant::now(),
    })
}

/// Relay remote → client for one mapping until aborted.
async fn return_path(
    outbound: Arc<UdpSocket>,
    listener: Arc<UdpSocket>,
    peer: SocketAddr,
    counters: Arc<TrafficCounters>,
    rule_id: String,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match outbound.recv(&mut buf).await {
            Ok(n) => match listener.send_to(&buf[..n], peer).await {
                Ok(sent) => counters.add_bytes(sent),
                Err(e) => debug!(rule_id = %rule_id, peer = %peer, error = %e, "UDP reply to client failed"),
            },
            // ICMP unreachable from the remote surfaces here; keep listening.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                debug!(rule_id = %rule_id, peer = %peer, "remote refused datagram");
            }
            Err(e) => {
                debug!(rule_id = %rule_id, peer = %peer, error = %e, "UDP return path closed");
                break;
            }
        }
    }
}

fn expire_idle(clients: &mut HashMap<SocketAddr, ClientMapping>, idle: Duration, rule_id: &str) {
    let before = clients.len();
    clients.retain(|_, mapping| mapping.last_seen.elapsed() < idle);
    let dropped = before - clients.len();
    if dropped > 0 {
        debug!(rule_id, dropped, "expired idle UDP clients");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::{ForwardSettings, RuleStore};
    use crate::testutil::{free_udp_port, spawn_udp_echo, spawn_udp_echo_recording, wait_until};
    use portgate_core::{Protocol, RuleSpec, RuleStatus};

    fn store() -> RuleStore {
        RuleStore::new(Arc::new(TrafficCounters::new()), ForwardSettings::default())
    }

    fn store_with_idle(idle: Duration) -> RuleStore {
        let settings = ForwardSettings {
            udp_client_idle: idle,
            ..ForwardSettings::default()
        };
        RuleStore::new(Arc::new(TrafficCounters::new()), settings)
    }

    async fn exchange(client: &UdpSocket, local_port: u16, payload: &[u8]) -> Vec<u8> {
        client.send_to(payload, ("127.0.0.1", local_port)).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("no UDP reply")
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn datagram_is_forwarded_and_reply_returned() {
        let echo_port = spawn_udp_echo().await;
        let store = store();
        let local_port = free_udp_port();
        let rule = store
            .start_rule(&RuleSpec::new(Protocol::Udp, local_port, "127.0.0.1", echo_port))
            .await
            .unwrap();
        assert_eq!(rule.status, RuleStatus::Running);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(exchange(&client, local_port, b"ping").await, b"ping");

        let counters = Arc::clone(store.counters());
        assert!(wait_until(|| counters.bytes_transferred() >= 4).await);
    }

    #[tokio::test]
    async fn clients_get_independent_mappings() {
        let echo_port = spawn_udp_echo().await;
        let store = store();
        let local_port = free_udp_port();
        store
            .start_rule(&RuleSpec::new(Protocol::Udp, local_port, "127.0.0.1", echo_port))
            .await
            .unwrap();

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(exchange(&a, local_port, b"from-a").await, b"from-a");
        assert_eq!(exchange(&b, local_port, b"from-b").await, b"from-b");
        assert_eq!(exchange(&a, local_port, b"again").await, b"again");
    }

    #[tokio::test]
    async fn stop_releases_the_udp_port() {
        let store = store();
        let local_port = free_udp_port();
        let rule = store
            .start_rule(&RuleSpec::new(Protocol::Udp, local_port, "127.0.0.1", 9))
            .await
            .unwrap();
        store.stop_rule(&rule.id).await.unwrap();
        assert!(UdpSocket::bind(("0.0.0.0", local_port)).await.is_ok());
    }

    #[tokio::test]
    async fn idle_mappings_expire() {
        let outbound = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let mut clients = HashMap::new();
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        clients.insert(
            peer,
            ClientMapping {
                outbound,
                return_task: tokio::spawn(async {}),
                last_seen: Instant::now(),
            },
        );

        expire_idle(&mut clients, Duration::from_secs(120), "test");
        assert_eq!(clients.len(), 1);

        expire_idle(&mut clients, Duration::ZERO, "test");
        assert!(clients.is_empty());
    }

    #[tokio::test]
    async fn idle_client_expires_while_others_keep_sending() {
        let (echo_port, sources) = spawn_udp_echo_recording().await;
        let store = store_with_idle(Duration::from_millis(300));
        let local_port = free_udp_port();
        store
            .start_rule(&RuleSpec::new(Protocol::Udp, local_port, "127.0.0.1", echo_port))
            .await
            .unwrap();

        let quiet = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let busy = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        assert_eq!(exchange(&quiet, local_port, b"first").await, b"first");
        let first_source = sources.lock().unwrap()[0];

        // Keep the rule busy well past the idle limit.
        for _ in 0..10 {
            assert_eq!(exchange(&busy, local_port, b"tick").await, b"tick");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(exchange(&quiet, local_port, b"again").await, b"again");
        let last_source = *sources.lock().unwrap().last().unwrap();
        assert_ne!(
            first_source, last_source,
            "quiet client reused its mapping after the idle limit"
        );
    }

    #[tokio::test]
    async fn stop_is_prompt_when_remote_does_not_resolve() {
        let store = store();
        let local_port = free_udp_port();
        let rule = store
            .start_rule(&RuleSpec::new(
                Protocol::Udp,
                local_port,
                "portgate-unresolvable.invalid",
                53,
            ))
            .await
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", ("127.0.0.1", local_port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        store.stop_rule(&rule.id).await.unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "stop took {:?}",
            started.elapsed()
        );
        assert!(UdpSocket::bind(("0.0.0.0", local_port)).await.is_ok());
    }

    #[test]
    fn sweep_period_is_bounded() {
        assert_eq!(sweep_period(Duration::from_secs(120)), RECV_POLL_INTERVAL);
        assert_eq!(sweep_period(Duration::from_millis(300)), Duration::from_millis(300));
        assert_eq!(sweep_period(Duration::ZERO), Duration::from_millis(10));
    }
}
