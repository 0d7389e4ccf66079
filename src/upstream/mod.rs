//! One remote DNS server: dialing, the query exchange, and health probes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Scheme;
use crate::dispatch::{QueryInfo, QueryProto};
use crate::error::ExchangeError;
use crate::stats::StatsCollector;
use crate::transport::{
    ConnKind, DnsConn, PersistConn, Transport, MAX_READ_TIMEOUT, MAX_WRITE_TIMEOUT,
};

pub(crate) const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Decides whether a host counts as down. Must be side-effect free.
pub type DownFn = Arc<dyn Fn(&UpstreamHost) -> bool + Send + Sync>;

/// The default criterion: `max_fails` consecutive probe failures, where 0
/// means the host is never marked down.
pub fn default_down_fn(max_fails: u32) -> DownFn {
    Arc::new(move |host: &UpstreamHost| max_fails != 0 && host.fails() >= max_fails)
}

/// A single upstream DNS server with its owned transport.
pub struct UpstreamHost {
    addr: SocketAddr,
    scheme: Scheme,
    fails: AtomicU32,
    down_fn: Option<DownFn>,
    transport: Transport,
    stats: Arc<StatsCollector>,
}

impl UpstreamHost {
    pub fn new(
        addr: SocketAddr,
        scheme: Scheme,
        transport: Transport,
        down_fn: Option<DownFn>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            addr,
            scheme,
            fails: AtomicU32::new(0),
            down_fn,
            transport,
            stats,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Relaxed)
    }

    /// Whether this host is considered down.
    pub fn down(&self) -> bool {
        match &self.down_fn {
            Some(down) => {
                let down = down(self);
                if down {
                    debug!("{} marked as down", self.addr);
                }
                down
            }
            None => {
                warn!(
                    "upstream host {} has no down function, falling back to default",
                    self.addr
                );
                self.fails() > 0
            }
        }
    }

    /// Effective wire transport for a query: TLS always wins, then
    /// force-TCP; prefer-UDP and the neutral "dns" tag pick UDP; otherwise
    /// the caller's protocol is kept.
    fn conn_kind(&self, requested: QueryProto) -> ConnKind {
        if self.transport.is_tls() {
            ConnKind::Tls
        } else if self.transport.force_tcp() {
            ConnKind::Tcp
        } else if self.transport.prefer_udp() || requested == QueryProto::Dns {
            ConnKind::Udp
        } else {
            match requested {
                QueryProto::Tcp => ConnKind::Tcp,
                QueryProto::Udp | QueryProto::Dns => ConnKind::Udp,
            }
        }
    }

    /// Returns a connection and whether it came from the pool.
    pub async fn dial(&self, requested: QueryProto) -> Result<(PersistConn, bool), ExchangeError> {
        let kind = self.conn_kind(requested);

        if let Some(pc) = self.transport.dial_cached(kind).await {
            return Ok((pc, true));
        }

        let timeout = self.transport.dial_timeout();
        let started = Instant::now();
        let result = DnsConn::connect(kind, self.addr, self.transport.tls(), timeout).await;
        self.transport.update_dial_timeout(started.elapsed());
        Ok((PersistConn::new(result?), false))
    }

    /// Sends the query and reads the reply on a pooled or fresh connection.
    ///
    /// An end-of-stream error on a pooled connection becomes
    /// [`ExchangeError::CachedConnClosed`] so the caller can retry on a
    /// fresh dial. A reply whose id differs from the query's closes the
    /// connection and fails; out-of-order responses are not tolerated.
    pub async fn exchange(&self, query: &QueryInfo) -> Result<Message, ExchangeError> {
        let (mut pc, reused) = self.dial(query.proto()).await?;
        if reused {
            debug!("cached connection used for {}", self.addr);
        } else {
            debug!("new connection established for {}", self.addr);
        }

        pc.conn.set_udp_size(query.udp_size());

        if let Err(err) = pc
            .conn
            .write_message(query.message(), MAX_WRITE_TIMEOUT)
            .await
        {
            // Dropping pc closes the connection.
            return Err(cached_closed(err, reused));
        }

        let reply = match pc.conn.read_message(MAX_READ_TIMEOUT).await {
            Ok(reply) => reply,
            Err(err) => return Err(cached_closed(err, reused)),
        };

        if reply.id() != query.message().id() {
            return Err(ExchangeError::IdMismatch {
                want: query.message().id(),
                got: reply.id(),
            });
        }

        self.transport.yield_conn(pc).await;
        Ok(reply)
    }

    /// One health probe: `. IN NS` on a fresh, unpooled connection. Any
    /// error bumps the fail counter; success resets it to zero.
    pub async fn check(&self) {
        let started = Instant::now();
        match self.probe().await {
            Ok(()) => {
                self.fails.store(0, Ordering::Relaxed);
            }
            Err(err) => {
                self.stats.inc_health_failure();
                self.fails.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "hc: DNS @{} +{} failed  rtt: {:?} err: {}",
                    self.addr,
                    self.scheme,
                    started.elapsed(),
                    err
                );
            }
        }
    }

    async fn probe(&self) -> Result<(), ExchangeError> {
        let mut ping = Message::new();
        ping.set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(self.transport.recursion_desired())
            .add_query(Query::query(Name::root(), RecordType::NS));

        let kind = self.conn_kind(QueryProto::Dns);
        let send = async {
            let mut conn =
                DnsConn::connect(kind, self.addr, self.transport.tls(), HEALTH_CHECK_TIMEOUT)
                    .await?;
            conn.write_message(&ping, MAX_WRITE_TIMEOUT).await?;
            conn.read_bytes(MAX_READ_TIMEOUT).await
        };
        let bytes = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, send)
            .await
            .map_err(|_| ExchangeError::Timeout {
                op: "health check",
                timeout: HEALTH_CHECK_TIMEOUT,
            })??;

        // Only I/O-level failures count against the host: anything that
        // still looks like a DNS response (or query) came from a live
        // server, however malformed the rest of it is.
        if reply_looks_sane(&bytes) {
            Ok(())
        } else {
            Err(ExchangeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "reply is not a DNS message",
            )))
        }
    }

    #[cfg(test)]
    pub(crate) fn force_fails(&self, n: u32) {
        self.fails.store(n, Ordering::Relaxed);
    }
}

impl std::fmt::Display for UpstreamHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.scheme, self.addr)
    }
}

impl std::fmt::Debug for UpstreamHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamHost")
            .field("addr", &self.addr)
            .field("scheme", &self.scheme)
            .field("fails", &self.fails())
            .finish()
    }
}

fn cached_closed(err: ExchangeError, reused: bool) -> ExchangeError {
    if reused && err.is_eof() {
        ExchangeError::CachedConnClosed
    } else {
        err
    }
}

fn reply_looks_sane(bytes: &[u8]) -> bool {
    if Message::from_vec(bytes).is_ok() {
        return true;
    }
    // Fall back to a header-level check: a set QR bit or a plain QUERY
    // opcode means something DNS-shaped answered.
    if bytes.len() < 12 {
        return false;
    }
    let flags = u16::from_be_bytes([bytes[2], bytes[3]]);
    let qr = flags & 0x8000 != 0;
    let opcode = (flags >> 11) & 0xf;
    qr || opcode == 0
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportOptions;
    use tokio::net::UdpSocket;

    fn make_host(addr: SocketAddr, scheme: Scheme, opts: TransportOptions) -> UpstreamHost {
        UpstreamHost::new(
            addr,
            scheme,
            Transport::new(opts),
            Some(default_down_fn(3)),
            StatsCollector::new(0),
        )
    }

    #[test]
    fn test_conn_kind_derivation() {
        let addr: SocketAddr = "127.0.0.1:53".parse().unwrap();

        let plain = make_host(addr, Scheme::Dns, TransportOptions::default());
        assert_eq!(plain.conn_kind(QueryProto::Udp), ConnKind::Udp);
        assert_eq!(plain.conn_kind(QueryProto::Tcp), ConnKind::Tcp);
        assert_eq!(plain.conn_kind(QueryProto::Dns), ConnKind::Udp);

        let forced = make_host(
            addr,
            Scheme::Dns,
            TransportOptions {
                force_tcp: true,
                ..Default::default()
            },
        );
        assert_eq!(forced.conn_kind(QueryProto::Udp), ConnKind::Tcp);

        let prefer = make_host(
            addr,
            Scheme::Dns,
            TransportOptions {
                prefer_udp: true,
                ..Default::default()
            },
        );
        assert_eq!(prefer.conn_kind(QueryProto::Tcp), ConnKind::Udp);
    }

    #[test]
    fn test_down_threshold() {
        let host = testutil::host("127.0.0.1:53".parse().unwrap(), 3);
        assert!(!host.down());
        host.force_fails(2);
        assert!(!host.down());
        host.force_fails(3);
        assert!(host.down());
        host.force_fails(0);
        assert!(!host.down());
    }

    #[test]
    fn test_zero_max_fails_never_down() {
        let host = testutil::host("127.0.0.1:53".parse().unwrap(), 0);
        host.force_fails(1000);
        assert!(!host.down());
    }

    #[test]
    fn test_reply_sanity_heuristic() {
        // Valid response header with QR set.
        let mut header = vec![0u8; 12];
        header[2] = 0x80;
        assert!(reply_looks_sane(&header));

        // Garbage opcode without QR.
        let mut bad = vec![0u8; 12];
        bad[2] = 0x79;
        assert!(!reply_looks_sane(&bad));

        // Too short for a header.
        assert!(!reply_looks_sane(&[0u8; 4]));
    }

    #[tokio::test]
    async fn test_check_counts_failures_and_resets() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let host = testutil::host(addr, 3);

        // Garbage replies are not DNS; each probe counts one failure.
        let garbage_server = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            for _ in 0..2 {
                let (_, from) = server.recv_from(&mut buf).await.unwrap();
                server.send_to(b"junk", from).await.unwrap();
            }
            server
        });

        host.check().await;
        host.check().await;
        assert_eq!(host.fails(), 2);

        // A well-formed response resets the counter.
        let server = garbage_server.await.unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            let req = Message::from_vec(&buf[..n]).unwrap();
            let mut reply = Message::new();
            reply
                .set_id(req.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .add_queries(req.queries().to_vec());
            server
                .send_to(&reply.to_vec().unwrap(), from)
                .await
                .unwrap();
        });

        host.check().await;
        assert_eq!(host.fails(), 0);
    }
}
