//! Socket wrappers: a server connection with deferred connect completion
//! and the listener for inbound peer connections.
//!
//! Connects are started without blocking the caller; completion is observed
//! from the client's readiness poll, the same way the reactor reports
//! readable sockets. Writes go straight out (`write_all`), reads drain
//! whatever the kernel has and hand it to the FLAP assembler.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use super::flap::FrameAssembler;

/// Convert a wire IPv4 address (u32, network order semantics) to `Ipv4Addr`.
pub fn u32_to_ip(ip: u32) -> Ipv4Addr {
    Ipv4Addr::from(ip)
}

/// Convert a socket address to the wire u32 form (0 for IPv6).
pub fn ip_to_u32(addr: IpAddr) -> u32 {
    match addr {
        IpAddr::V4(v4) => u32::from(v4),
        IpAddr::V6(_) => 0,
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum SocketState {
    Connecting(ConnectFuture),
    Connected(TcpStream),
}

/// What a readiness poll observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The deferred connect completed; the socket is now usable.
    ConnectFinished,
    /// Bytes are waiting to be read.
    Readable,
}

/// Outcome of draining a readable socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were read into the assembler.
    Data(usize),
    /// The peer closed the connection.
    Closed,
    /// Nothing available after all.
    WouldBlock,
}

/// One TCP connection to an OSCAR server (authorizer or BOS).
pub struct ServerConnection {
    state: SocketState,
    /// Inbound FLAP reassembly.
    pub assembler: FrameAssembler,
}

impl ServerConnection {
    /// Start a deferred connect. DNS resolution happens inside the connect
    /// future and is the only potentially slow step.
    pub fn connect(host: &str, port: u16) -> Self {
        let target = format!("{}:{}", host, port);
        ServerConnection {
            state: SocketState::Connecting(Box::pin(TcpStream::connect(target))),
            assembler: FrameAssembler::new(),
        }
    }

    /// True once the TCP connect completed.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, SocketState::Connected(_))
    }

    /// Local address, once connected.
    pub fn local_ip(&self) -> u32 {
        match &self.state {
            SocketState::Connected(s) => s
                .local_addr()
                .map(|a| ip_to_u32(a.ip()))
                .unwrap_or_default(),
            SocketState::Connecting(_) => 0,
        }
    }

    /// Poll for connect completion or readability.
    pub fn poll_readiness(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Readiness>> {
        match &mut self.state {
            SocketState::Connecting(fut) => match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(stream)) => {
                    self.state = SocketState::Connected(stream);
                    Poll::Ready(Ok(Readiness::ConnectFinished))
                }
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            },
            SocketState::Connected(stream) => match stream.poll_read_ready(cx) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(Readiness::Readable)),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    /// Drain readable bytes into the assembler.
    pub fn read_available(&mut self) -> io::Result<ReadOutcome> {
        let stream = match &mut self.state {
            SocketState::Connected(s) => s,
            SocketState::Connecting(_) => return Ok(ReadOutcome::WouldBlock),
        };

        let mut total = 0usize;
        let mut chunk = [0u8; 4096];
        loop {
            match stream.try_read(&mut chunk) {
                Ok(0) => {
                    return if total > 0 {
                        Ok(ReadOutcome::Data(total))
                    } else {
                        Ok(ReadOutcome::Closed)
                    };
                }
                Ok(n) => {
                    self.assembler.feed(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if total > 0 {
                        Ok(ReadOutcome::Data(total))
                    } else {
                        Ok(ReadOutcome::WouldBlock)
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write a whole buffer to the server.
    pub async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        match &mut self.state {
            SocketState::Connected(s) => s.write_all(bytes).await,
            SocketState::Connecting(_) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connect has not completed",
            )),
        }
    }
}

/// Listening socket for inbound peer connections.
pub struct PeerListener {
    listener: TcpListener,
    port: u16,
}

impl PeerListener {
    /// Bind an ephemeral port on all interfaces.
    pub async fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        Ok(PeerListener { listener, port })
    }

    /// The bound port, advertised in our status TLV.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Poll for an inbound peer connection.
    pub fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        self.listener.poll_accept(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_round_trip() {
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(ip_to_u32(ip), 0xc0a80101);
        assert_eq!(u32_to_ip(0xc0a80101), Ipv4Addr::new(192, 168, 1, 1));
    }

    #[tokio::test]
    async fn test_connect_read_write() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut conn = ServerConnection::connect("127.0.0.1", addr.port());
        let accept = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            use tokio::io::AsyncReadExt;
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(b"pong!").await.unwrap();
            buf
        });

        // drive the deferred connect
        let readiness = std::future::poll_fn(|cx| conn.poll_readiness(cx))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::ConnectFinished);
        assert!(conn.is_connected());
        assert_ne!(conn.local_ip(), 0);

        conn.send(b"ping!").await.unwrap();
        assert_eq!(&accept.await.unwrap(), b"ping!");

        let readiness = std::future::poll_fn(|cx| conn.poll_readiness(cx))
            .await
            .unwrap();
        assert_eq!(readiness, Readiness::Readable);
        match conn.read_available().unwrap() {
            ReadOutcome::Data(n) => assert_eq!(n, 5),
            other => panic!("expected data, got {:?}", other),
        }
        assert_eq!(conn.assembler.pending_len(), 5);
    }
}
