//! Per-upstream connection pooling.
//!
//! Each upstream host owns one [`Transport`]: three buckets of persistent
//! connections (UDP, TCP, TCP-TLS) mutated exclusively by a single
//! connection-manager task, plus the adaptive dial-timeout average. All
//! other components talk to the manager through the dial/yield channels, so
//! the hot path takes no locks.

pub mod conn;
mod tls;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use conn::{ConnKind, DnsConn, MIN_MSG_SIZE};
pub use tls::TlsSettings;
pub(crate) use tls::{client_config, server_name};

use conn::KIND_COUNT;

pub(crate) const DEFAULT_CONN_EXPIRE: Duration = Duration::from_secs(15);
pub(crate) const MIN_EXPIRE_INTERVAL: Duration = Duration::from_secs(1);
pub(crate) const MIN_DIAL_TIMEOUT: Duration = Duration::from_secs(1);
pub(crate) const MAX_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const MAX_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const MAX_READ_TIMEOUT: Duration = Duration::from_secs(2);

const CUMULATIVE_AVG_WEIGHT: i64 = 4;

// Losing a cached connection is cheaper than blocking a busy forwarder on
// the manager, so yields give up after this long.
const YIELD_TIMEOUT: Duration = Duration::from_millis(25);

/// An open DNS connection plus the moment it was last used.
pub struct PersistConn {
    pub conn: DnsConn,
    pub used: Instant,
}

impl PersistConn {
    pub fn new(conn: DnsConn) -> Self {
        Self {
            conn,
            used: Instant::now(),
        }
    }
}

impl std::fmt::Debug for PersistConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistConn")
            .field("peer", &self.conn.peer())
            .field("used", &self.used)
            .finish()
    }
}

struct DialRequest {
    kind: ConnKind,
    reply: oneshot::Sender<Option<PersistConn>>,
}

/// Transport settings shared by everything dialing one upstream host.
pub struct Transport {
    avg_dial_nanos: AtomicI64,
    recursion_desired: bool,
    force_tcp: bool,
    prefer_udp: bool,
    expire: Duration,
    tls: Option<TlsSettings>,

    dial_tx: mpsc::Sender<DialRequest>,
    yield_tx: mpsc::Sender<PersistConn>,
    cancel: CancellationToken,
    channels: Mutex<Option<(mpsc::Receiver<DialRequest>, mpsc::Receiver<PersistConn>)>>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
pub struct TransportOptions {
    pub expire: Option<Duration>,
    pub recursion_desired: bool,
    pub force_tcp: bool,
    pub prefer_udp: bool,
    pub tls: Option<TlsSettings>,
}

impl Transport {
    pub fn new(opts: TransportOptions) -> Self {
        let (dial_tx, dial_rx) = mpsc::channel(1);
        let (yield_tx, yield_rx) = mpsc::channel(1);
        Self {
            avg_dial_nanos: AtomicI64::new(MIN_DIAL_TIMEOUT.as_nanos() as i64),
            recursion_desired: opts.recursion_desired,
            force_tcp: opts.force_tcp,
            prefer_udp: opts.prefer_udp,
            expire: opts.expire.unwrap_or(DEFAULT_CONN_EXPIRE),
            tls: opts.tls,
            dial_tx,
            yield_tx,
            cancel: CancellationToken::new(),
            channels: Mutex::new(Some((dial_rx, yield_rx))),
            manager: Mutex::new(None),
        }
    }

    pub fn recursion_desired(&self) -> bool {
        self.recursion_desired
    }

    pub fn force_tcp(&self) -> bool {
        self.force_tcp
    }

    pub fn prefer_udp(&self) -> bool {
        self.prefer_udp
    }

    pub fn expire(&self) -> Duration {
        self.expire
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub(crate) fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    /// Launches the connection-manager task. Must be called from within a
    /// runtime before the first dial.
    pub fn start(&self) {
        let Some((dial_rx, yield_rx)) = self.channels.lock().unwrap().take() else {
            return;
        };
        let manager = ConnManager {
            buckets: Default::default(),
            expire: self.expire,
            dial_rx,
            yield_rx,
            cancel: self.cancel.clone(),
        };
        *self.manager.lock().unwrap() = Some(tokio::spawn(manager.run()));
    }

    /// Signals the manager to drop all pooled connections and waits for it
    /// to finish. In-flight dial requests resolve to "no connection".
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.manager.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Asks the manager for a pooled connection of the given kind.
    pub async fn dial_cached(&self, kind: ConnKind) -> Option<PersistConn> {
        let (reply, rx) = oneshot::channel();
        if self.dial_tx.send(DialRequest { kind, reply }).await.is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Returns a connection to the pool for reuse. Best effort: if the
    /// manager does not take it within 25 ms the connection is dropped.
    pub async fn yield_conn(&self, mut pc: PersistConn) {
        pc.used = Instant::now();
        if self.yield_tx.send_timeout(pc, YIELD_TIMEOUT).await.is_err() {
            debug!("connection pool busy, dropping connection instead of yielding");
        }
    }

    /// Timeout for the next dial: double the observed average, kept within
    /// [1 s, 5 s] so a slow upstream leaves time to retry another one.
    pub fn dial_timeout(&self) -> Duration {
        let avg = self.avg_dial_nanos.load(Ordering::Relaxed).max(0) as u64;
        let avg = Duration::from_nanos(avg);
        if avg < MIN_DIAL_TIMEOUT {
            MIN_DIAL_TIMEOUT
        } else if avg < MAX_DIAL_TIMEOUT / 2 {
            avg * 2
        } else {
            MAX_DIAL_TIMEOUT
        }
    }

    /// Folds a measured dial time into the cumulative moving average:
    /// `avg += (measured - avg) / 4`.
    pub fn update_dial_timeout(&self, measured: Duration) {
        let old = self.avg_dial_nanos.load(Ordering::Relaxed);
        let delta = (measured.as_nanos() as i64 - old) / CUMULATIVE_AVG_WEIGHT;
        self.avg_dial_nanos.fetch_add(delta, Ordering::Relaxed);
    }
}

/// Sole owner of the connection buckets; every mutation happens on this
/// task.
struct ConnManager {
    buckets: [Vec<PersistConn>; KIND_COUNT],
    expire: Duration,
    dial_rx: mpsc::Receiver<DialRequest>,
    yield_rx: mpsc::Receiver<PersistConn>,
    cancel: CancellationToken,
}

impl ConnManager {
    async fn run(mut self) {
        // A zero expire disables pooling; the ticker still needs a sane
        // period to exist at all.
        let period = if self.expire.is_zero() {
            Duration::from_secs(3600)
        } else {
            self.expire
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                Some(req) = self.dial_rx.recv() => self.handle_dial(req),
                Some(pc) = self.yield_rx.recv() => self.handle_yield(pc),
                _ = ticker.tick() => self.evict_expired(),
                _ = self.cancel.cancelled() => break,
                else => break,
            }
        }

        for bucket in &mut self.buckets {
            close_conns(std::mem::take(bucket));
        }
    }

    fn handle_dial(&mut self, req: DialRequest) {
        // Fold in connections yielded before this request arrived, so a
        // yield followed by a dial finds its connection again.
        while let Ok(pc) = self.yield_rx.try_recv() {
            self.handle_yield(pc);
        }

        let bucket = &mut self.buckets[req.kind.index()];
        // The tail is the most recently used connection.
        if let Some(pc) = bucket.pop() {
            if !self.expire.is_zero() && pc.used.elapsed() < self.expire {
                let _ = req.reply.send(Some(pc));
                return;
            }
            // Everything behind an expired tail is at least as old, so the
            // whole bucket goes.
            bucket.push(pc);
            close_conns(std::mem::take(bucket));
        }
        let _ = req.reply.send(None);
    }

    fn handle_yield(&mut self, pc: PersistConn) {
        if self.expire.is_zero() {
            return;
        }
        self.buckets[pc.conn.kind().index()].push(pc);
    }

    fn evict_expired(&mut self) {
        for bucket in &mut self.buckets {
            if bucket.is_empty() {
                continue;
            }
            // `used` is non-decreasing from head to tail; drop the stale
            // prefix only.
            let first_fresh = bucket
                .iter()
                .position(|pc| pc.used.elapsed() < self.expire)
                .unwrap_or(bucket.len());
            if first_fresh == 0 {
                continue;
            }
            let stale: Vec<PersistConn> = bucket.drain(..first_fresh).collect();
            debug!(
                "dropping {} expired connection(s) to {}",
                stale.len(),
                stale[0].conn.peer()
            );
            close_conns(stale);
        }
    }
}

// The connections handed over here are no longer reachable from the
// manager, so they can be closed off-task.
fn close_conns(conns: Vec<PersistConn>) {
    if conns.is_empty() {
        return;
    }
    tokio::spawn(async move {
        drop(conns);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    async fn local_udp_conn() -> (DnsConn, SocketAddr, tokio::net::UdpSocket) {
        // The anchor socket keeps the peer port reserved for the test's
        // lifetime; UDP connect itself never touches the wire.
        let anchor = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = anchor.local_addr().unwrap();
        let conn = DnsConn::connect(ConnKind::Udp, peer, None, Duration::from_secs(1))
            .await
            .unwrap();
        (conn, peer, anchor)
    }

    #[test]
    fn test_dial_timeout_bounds() {
        let transport = Transport::new(TransportOptions::default());

        // Fresh transport starts at the minimum.
        assert_eq!(transport.dial_timeout(), MIN_DIAL_TIMEOUT);

        // A pathological sample sequence never escapes [1 s, 5 s].
        for measured in [
            Duration::ZERO,
            Duration::from_millis(1),
            Duration::from_secs(100),
            Duration::from_secs(1000),
            Duration::ZERO,
        ] {
            transport.update_dial_timeout(measured);
            let timeout = transport.dial_timeout();
            assert!(timeout >= MIN_DIAL_TIMEOUT, "timeout {timeout:?} below floor");
            assert!(timeout <= MAX_DIAL_TIMEOUT, "timeout {timeout:?} above cap");
        }
    }

    #[test]
    fn test_dial_timeout_doubles_average() {
        let transport = Transport::new(TransportOptions::default());
        // Pull the average up towards 1.8 s; the timeout should double it
        // until it hits the cap.
        for _ in 0..64 {
            transport.update_dial_timeout(Duration::from_millis(1800));
        }
        let timeout = transport.dial_timeout();
        assert!(timeout > Duration::from_secs(3), "got {timeout:?}");
        assert!(timeout <= MAX_DIAL_TIMEOUT);
    }

    #[test]
    fn test_update_dial_timeout_moves_quarter_way() {
        let transport = Transport::new(TransportOptions::default());
        // avg starts at 1 s; one 5 s sample moves it up by (5-1)/4 = 1 s.
        transport.update_dial_timeout(Duration::from_secs(5));
        let avg = transport.avg_dial_nanos.load(Ordering::Relaxed);
        assert_eq!(avg, Duration::from_secs(2).as_nanos() as i64);
    }

    #[tokio::test]
    async fn test_yield_then_dial_returns_same_conn() {
        let transport = Transport::new(TransportOptions::default());
        transport.start();

        let (conn, peer, _anchor) = local_udp_conn().await;
        transport.yield_conn(PersistConn::new(conn)).await;

        let pc = transport.dial_cached(ConnKind::Udp).await.expect("pooled conn");
        assert_eq!(pc.conn.peer(), peer);

        // Pool is empty again.
        assert!(transport.dial_cached(ConnKind::Udp).await.is_none());
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_dial_pops_most_recent_first() {
        let transport = Transport::new(TransportOptions::default());
        transport.start();

        let (first, _, _anchor_a) = local_udp_conn().await;
        let (second, second_peer, _anchor_b) = local_udp_conn().await;
        transport.yield_conn(PersistConn::new(first)).await;
        transport.yield_conn(PersistConn::new(second)).await;

        let pc = transport.dial_cached(ConnKind::Udp).await.unwrap();
        assert_eq!(pc.conn.peer(), second_peer);
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_expired_conn_is_not_returned() {
        let transport = Transport::new(TransportOptions {
            expire: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        transport.start();

        let (conn, _, _anchor) = local_udp_conn().await;
        transport.yield_conn(PersistConn::new(conn)).await;
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(transport.dial_cached(ConnKind::Udp).await.is_none());
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_zero_expire_disables_pooling() {
        let transport = Transport::new(TransportOptions {
            expire: Some(Duration::ZERO),
            ..Default::default()
        });
        transport.start();

        let (conn, _, _anchor) = local_udp_conn().await;
        transport.yield_conn(PersistConn::new(conn)).await;
        assert!(transport.dial_cached(ConnKind::Udp).await.is_none());
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_dial_after_stop_returns_none() {
        let transport = Transport::new(TransportOptions::default());
        transport.start();
        transport.stop().await;
        assert!(transport.dial_cached(ConnKind::Udp).await.is_none());
    }

    #[tokio::test]
    async fn test_buckets_keyed_by_kind() {
        let transport = Transport::new(TransportOptions::default());
        transport.start();

        let (conn, _, _anchor) = local_udp_conn().await;
        transport.yield_conn(PersistConn::new(conn)).await;

        assert!(transport.dial_cached(ConnKind::Tcp).await.is_none());
        assert!(transport.dial_cached(ConnKind::Udp).await.is_some());
        transport.stop().await;
    }
}
