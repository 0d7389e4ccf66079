use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::ExchangeError;

use super::TlsSettings;

/// Smallest read buffer used for UDP replies.
pub const MIN_MSG_SIZE: u16 = 512;

pub(crate) const KIND_COUNT: usize = 3;

/// The three wire transports a persistent connection can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Udp,
    Tcp,
    Tls,
}

impl ConnKind {
    pub(crate) fn index(self) -> usize {
        match self {
            ConnKind::Udp => 0,
            ConnKind::Tcp => 1,
            ConnKind::Tls => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnKind::Udp => "udp",
            ConnKind::Tcp => "tcp",
            ConnKind::Tls => "tcp-tls",
        }
    }
}

impl std::fmt::Display for ConnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum DnsStream {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// One open DNS connection. Closed by dropping it.
pub struct DnsConn {
    kind: ConnKind,
    peer: SocketAddr,
    stream: DnsStream,
    udp_size: u16,
}

impl DnsConn {
    /// Opens a new connection of the given kind, bounded by `dial_timeout`.
    /// TLS connections need the client configuration and server name from
    /// the owning transport.
    pub async fn connect(
        kind: ConnKind,
        peer: SocketAddr,
        tls: Option<&TlsSettings>,
        dial_timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        let connect = async {
            let stream = match kind {
                ConnKind::Udp => {
                    let local: SocketAddr = if peer.is_ipv4() {
                        "0.0.0.0:0".parse().unwrap()
                    } else {
                        "[::]:0".parse().unwrap()
                    };
                    let socket = UdpSocket::bind(local).await?;
                    socket.connect(peer).await?;
                    DnsStream::Udp(socket)
                }
                ConnKind::Tcp => DnsStream::Tcp(TcpStream::connect(peer).await?),
                ConnKind::Tls => {
                    let settings = tls.ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidInput, "no TLS configuration")
                    })?;
                    let tcp = TcpStream::connect(peer).await?;
                    let connector = TlsConnector::from(settings.config.clone());
                    let stream = connector
                        .connect(settings.server_name.clone(), tcp)
                        .await?;
                    DnsStream::Tls(Box::new(stream))
                }
            };
            Ok::<_, io::Error>(stream)
        };

        match tokio::time::timeout(dial_timeout, connect).await {
            Ok(Ok(stream)) => Ok(Self {
                kind,
                peer,
                stream,
                udp_size: MIN_MSG_SIZE,
            }),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(ExchangeError::Timeout {
                op: "dial",
                timeout: dial_timeout,
            }),
        }
    }

    pub fn kind(&self) -> ConnKind {
        self.kind
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Sets the receive buffer size used for UDP replies, clamped to at
    /// least [`MIN_MSG_SIZE`].
    pub fn set_udp_size(&mut self, size: u16) {
        self.udp_size = size.max(MIN_MSG_SIZE);
    }

    pub async fn write_message(
        &mut self,
        msg: &Message,
        timeout: Duration,
    ) -> Result<(), ExchangeError> {
        let bytes = msg.to_vec()?;
        match tokio::time::timeout(timeout, self.write_raw(&bytes)).await {
            Ok(res) => res.map_err(ExchangeError::Io),
            Err(_) => Err(ExchangeError::Timeout { op: "write", timeout }),
        }
    }

    pub async fn read_message(&mut self, timeout: Duration) -> Result<Message, ExchangeError> {
        let bytes = self.read_bytes(timeout).await?;
        Ok(Message::from_vec(&bytes)?)
    }

    pub(crate) async fn read_bytes(&mut self, timeout: Duration) -> Result<Vec<u8>, ExchangeError> {
        match tokio::time::timeout(timeout, self.read_raw()).await {
            Ok(res) => res.map_err(ExchangeError::Io),
            Err(_) => Err(ExchangeError::Timeout { op: "read", timeout }),
        }
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.stream {
            DnsStream::Udp(socket) => {
                socket.send(bytes).await?;
                Ok(())
            }
            DnsStream::Tcp(stream) => write_framed(stream, bytes).await,
            DnsStream::Tls(stream) => write_framed(stream, bytes).await,
        }
    }

    async fn read_raw(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.stream {
            DnsStream::Udp(socket) => {
                let mut buf = vec![0u8; usize::from(self.udp_size)];
                let n = socket.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(buf)
            }
            DnsStream::Tcp(stream) => read_framed(stream).await,
            DnsStream::Tls(stream) => read_framed(stream).await,
        }
    }
}

impl std::fmt::Debug for DnsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsConn")
            .field("kind", &self.kind)
            .field("peer", &self.peer)
            .finish()
    }
}

// TCP and TLS carry DNS messages behind a 2-byte big-endian length prefix.
async fn write_framed<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> io::Result<()> {
    let len = u16::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "DNS message exceeds 64 KiB"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

async fn read_framed<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    if len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "zero-length DNS message",
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
