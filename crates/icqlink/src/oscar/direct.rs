//! Peer-to-peer direct connections.
//!
//! Both sides run the same little machine: length-framed packets, a v6/v7
//! init handshake, obfuscated data packets carrying advanced message
//! subtypes, and sequence-number acknowledgements. Messages submitted before
//! the handshake completes queue up and flush on the `Connected` transition.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use bytes::BytesMut;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::buffer::Buffer;
use super::cache::TimedCache;
use super::contact_list::ContactList;
use super::crypt;
use super::error::{Error, Result};
use super::events::OutgoingMessage;
use super::socket::ip_to_u32;
use super::status::Status;
use super::subtype::{IcqSubType, SubTypeFrame, SubTypeWrite};
use super::translator::Translator;

/// TCP command word opening a message exchange.
pub const TCP_START: u16 = 0x07ee;
/// TCP command word acknowledging one.
pub const TCP_ACK: u16 = 0x07da;

/// Handle of a direct client within the client's peer table.
pub type DcHandle = u64;

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DcState {
    /// Socket not up yet.
    NotConnected,
    /// Expecting the peer's init packet.
    WaitingForInit,
    /// Expecting the init acknowledgement.
    WaitingForInitAck,
    /// Expecting the v7 second-stage handshake.
    WaitingForInit2,
    /// Handshake complete, data packets flow.
    Connected,
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;

enum DcSocket {
    Connecting(ConnectFuture),
    Stream(TcpStream),
}

/// Things a direct client reports back to the orchestrator.
#[derive(Debug)]
pub enum DcEvent {
    /// Handshake completed (queued messages were flushed).
    Connected,
    /// An inbound message arrived.
    Message(SubTypeFrame),
    /// One of our messages was acknowledged.
    Ack {
        /// The finalized message.
        message: OutgoingMessage,
        /// Away text from the acknowledgement, when the probe asked for one.
        away_message: String,
    },
}

/// Read-only state a direct client needs from the orchestrator.
pub struct DcContext<'a> {
    /// Charset translator.
    pub translator: &'a Translator,
    /// Roster, for UIN confirmation.
    pub contacts: &'a ContactList,
    /// Own status.
    pub status: Status,
    /// Own invisibility flag.
    pub invisible: bool,
    /// Current away message.
    pub away_message: &'a str,
}

/// One peer connection.
pub struct DirectClient {
    state: DcState,
    socket: DcSocket,
    recv: BytesMut,
    incoming: bool,

    local_uin: u32,
    local_ext_ip: u32,
    local_server_port: u16,

    remote_uin: u32,
    remote_addr: Option<SocketAddr>,
    remote_tcp_version: u16,
    eff_tcp_version: u8,
    session_id: u32,
    tcp_flags: u8,

    seqnum: u16,
    /// Unacknowledged sent messages, keyed by sequence number.
    pub msg_cache: TimedCache<u16, OutgoingMessage>,
    queue: VecDeque<OutgoingMessage>,
    confirmed: bool,
}

impl DirectClient {
    fn base(local_uin: u32, local_ext_ip: u32, local_server_port: u16) -> Self {
        DirectClient {
            state: DcState::NotConnected,
            socket: DcSocket::Connecting(Box::pin(async {
                Err(io::Error::new(io::ErrorKind::NotConnected, "placeholder"))
            })),
            recv: BytesMut::new(),
            incoming: false,
            local_uin,
            local_ext_ip,
            local_server_port,
            remote_uin: 0,
            remote_addr: None,
            remote_tcp_version: 0,
            eff_tcp_version: 7,
            session_id: 0,
            tcp_flags: 0,
            seqnum: 0xffff,
            msg_cache: TimedCache::new(Duration::from_secs(30)),
            queue: VecDeque::new(),
            confirmed: false,
        }
    }

    /// Wrap an accepted inbound peer socket.
    pub fn incoming(
        stream: TcpStream,
        local_uin: u32,
        local_ext_ip: u32,
        local_server_port: u16,
    ) -> Self {
        let remote_addr = stream.peer_addr().ok();
        let mut dc = Self::base(local_uin, local_ext_ip, local_server_port);
        dc.state = DcState::WaitingForInit;
        dc.socket = DcSocket::Stream(stream);
        dc.incoming = true;
        dc.remote_addr = remote_addr;
        dc
    }

    /// Start an outbound peer connection to a contact's LAN endpoint.
    pub fn outgoing(
        remote_uin: u32,
        lan_ip: u32,
        lan_port: u16,
        remote_tcp_version: u8,
        local_uin: u32,
        local_ext_ip: u32,
        local_server_port: u16,
    ) -> Result<Self> {
        let eff = match remote_tcp_version {
            v if v >= 7 => 7,
            6 => 6,
            _ => {
                return Err(Error::Protocol(
                    "peer protocol too old for a direct connection".into(),
                ))
            }
        };

        let addr = SocketAddr::from((super::socket::u32_to_ip(lan_ip), lan_port));
        let mut dc = Self::base(local_uin, local_ext_ip, local_server_port);
        dc.remote_uin = remote_uin;
        dc.remote_tcp_version = remote_tcp_version as u16;
        dc.eff_tcp_version = eff;
        dc.session_id = rand::thread_rng().r#gen();
        dc.state = DcState::WaitingForInitAck;
        dc.socket = DcSocket::Connecting(Box::pin(TcpStream::connect(addr)));
        Ok(dc)
    }

    /// Handshake state.
    pub fn state(&self) -> DcState {
        self.state
    }

    /// Claimed (and possibly confirmed) peer UIN.
    pub fn remote_uin(&self) -> u32 {
        self.remote_uin
    }

    /// True once the peer UIN was validated against the roster.
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Poll the socket: connect completion or readability.
    pub fn poll_readiness(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<super::socket::Readiness>> {
        use std::task::Poll;
        match &mut self.socket {
            DcSocket::Connecting(fut) => match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(stream)) => {
                    self.remote_addr = stream.peer_addr().ok();
                    self.socket = DcSocket::Stream(stream);
                    Poll::Ready(Ok(super::socket::Readiness::ConnectFinished))
                }
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            },
            DcSocket::Stream(stream) => match stream.poll_read_ready(cx) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(super::socket::Readiness::Readable)),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            },
        }
    }

    /// The deferred connect finished: open the handshake.
    pub async fn on_connect_finished(&mut self) -> Result<()> {
        self.send_init().await
    }

    /// Submit a message: straight out when connected, queued otherwise.
    pub async fn send_event(&mut self, msg: OutgoingMessage, ctx: &DcContext<'_>) -> Result<()> {
        if self.state == DcState::Connected {
            self.send_message_packet(msg, ctx).await
        } else {
            self.queue.push_back(msg);
            Ok(())
        }
    }

    /// Move out everything not yet delivered (queued and unacknowledged),
    /// oldest first. Used at teardown so the orchestrator can fall back to
    /// the server.
    pub fn take_undelivered(&mut self) -> Vec<OutgoingMessage> {
        let mut out: Vec<OutgoingMessage> =
            self.msg_cache.drain_all().into_iter().map(|(_, m)| m).collect();
        out.extend(self.queue.drain(..));
        out
    }

    /// Drain per-message ack timeouts.
    pub fn drain_expired_messages(&mut self) -> Vec<OutgoingMessage> {
        self.msg_cache
            .drain_expired()
            .into_iter()
            .map(|(_, m)| m)
            .collect()
    }

    /// Consume readable bytes and run the state machine.
    ///
    /// Any error tears down this peer connection only.
    pub async fn on_readable(&mut self, ctx: &DcContext<'_>) -> Result<Vec<DcEvent>> {
        let stream = match &mut self.socket {
            DcSocket::Stream(s) => s,
            DcSocket::Connecting(_) => return Ok(Vec::new()),
        };

        let mut chunk = [0u8; 4096];
        loop {
            match stream.try_read(&mut chunk) {
                Ok(0) => return Err(Error::Protocol("peer closed the connection".into())),
                Ok(n) => self.recv.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        let mut events = Vec::new();
        while let Some(packet) = self.next_packet() {
            trace!(
                target: "icqlink::direct",
                len = packet.len(),
                peer = self.remote_uin,
                "direct packet received"
            );
            self.handle_packet(packet, ctx, &mut events).await?;
        }
        Ok(events)
    }

    /// Extract the next length-framed packet, if complete.
    fn next_packet(&mut self) -> Option<Vec<u8>> {
        if self.recv.len() < 2 {
            return None;
        }
        let len = u16::from_le_bytes([self.recv[0], self.recv[1]]) as usize;
        if self.recv.len() < 2 + len {
            return None;
        }
        let frame = self.recv.split_to(2 + len);
        Some(frame[2..].to_vec())
    }

    async fn handle_packet(
        &mut self,
        packet: Vec<u8>,
        ctx: &DcContext<'_>,
        events: &mut Vec<DcEvent>,
    ) -> Result<()> {
        match self.state {
            DcState::WaitingForInit => {
                self.parse_init(&packet)?;
                if self.incoming {
                    self.send_init_ack().await?;
                    self.send_init().await?;
                    self.state = DcState::WaitingForInitAck;
                } else {
                    self.send_init_ack().await?;
                    if self.eff_tcp_version == 7 {
                        self.send_init2().await?;
                        self.state = DcState::WaitingForInit2;
                    } else {
                        self.establish(ctx, events).await?;
                    }
                }
            }
            DcState::WaitingForInitAck => {
                parse_init_ack(&packet)?;
                if self.incoming {
                    if self.eff_tcp_version == 7 {
                        // v7 has an extra round of handshaking
                        self.state = DcState::WaitingForInit2;
                    } else {
                        self.confirm_uin(ctx.contacts)?;
                        self.establish(ctx, events).await?;
                    }
                } else {
                    // their init comes next
                    self.state = DcState::WaitingForInit;
                }
            }
            DcState::WaitingForInit2 => {
                parse_init2(&packet)?;
                if self.incoming {
                    self.send_init2().await?;
                    self.confirm_uin(ctx.contacts)?;
                }
                self.establish(ctx, events).await?;
            }
            DcState::Connected => {
                self.handle_data_packet(packet, ctx, events).await?;
            }
            DcState::NotConnected => {
                return Err(Error::Protocol("data before connect completed".into()));
            }
        }
        Ok(())
    }

    async fn establish(&mut self, ctx: &DcContext<'_>, events: &mut Vec<DcEvent>) -> Result<()> {
        self.state = DcState::Connected;
        debug!(target: "icqlink::direct", peer = self.remote_uin, "direct connection established");
        // flush messages queued while the handshake ran, in order
        while let Some(msg) = self.queue.pop_front() {
            self.send_message_packet(msg, ctx).await?;
        }
        events.push(DcEvent::Connected);
        Ok(())
    }

    // ==================================================================
    // Handshake packets
    // ==================================================================

    async fn send_init(&mut self) -> Result<()> {
        let v7 = self.eff_tcp_version == 7;
        let mut b = Buffer::new();
        b.write_u16_le(if v7 { 0x0030 } else { 0x002c });

        b.write_u8(0xff);
        b.write_u16_le(0x0007);
        b.write_u16_le(if v7 { 0x002b } else { 0x0027 });

        b.write_u32_le(self.remote_uin);
        b.write_u16_le(0x0000);
        b.write_u32_le(self.local_server_port as u32);

        b.write_u32_le(self.local_uin);
        b.write_u32_be(self.local_ext_ip);
        b.write_u32_be(self.local_ip());
        b.write_u8(0x04);
        b.write_u32_le(self.local_server_port as u32);
        b.write_u32_le(self.session_id);

        b.write_u32_le(0x00000050);
        b.write_u32_le(0x00000003);
        if v7 {
            b.write_u32_le(0x00000000);
        }

        self.send_raw(b.as_slice()).await
    }

    fn parse_init(&mut self, packet: &[u8]) -> Result<()> {
        let mut b = Buffer::from_bytes(packet);

        let start_byte = b.read_u8();
        if start_byte != 0xff {
            return Err(Error::parse("init packet did not start with 0xff"));
        }

        let tcp_version = b.read_u16_le();
        b.advance(2); // secondary length

        if self.incoming {
            self.remote_tcp_version = tcp_version;
            if tcp_version <= 5 {
                return Err(Error::Protocol("peer client too old".into()));
            }
            self.eff_tcp_version = if tcp_version == 6 { 6 } else { 7 };
        } else if tcp_version != self.remote_tcp_version {
            return Err(Error::Protocol(
                "peer claims a different protocol version than advertised".into(),
            ));
        }

        let our_uin = b.read_u32_le();
        if our_uin != self.local_uin {
            return Err(Error::Protocol(
                "init packet is not addressed to our UIN".into(),
            ));
        }

        b.advance(6); // 0x0000, sender's open port, 0x0000

        let remote_uin = b.read_u32_le();
        if self.incoming {
            self.remote_uin = remote_uin;
        } else if remote_uin != self.remote_uin {
            return Err(Error::Protocol("unexpected remote UIN in init packet".into()));
        }

        b.advance(8); // sender's external and LAN IPs
        self.tcp_flags = b.read_u8();
        b.advance(4); // sender's port again, 0x0000

        let session_id = b.read_u32_le();
        if self.incoming {
            self.session_id = session_id;
        } else if session_id != self.session_id {
            return Err(Error::Protocol("session id mismatch in init packet".into()));
        }

        b.advance(8);
        if self.eff_tcp_version == 7 {
            b.advance(4);
        }
        Ok(())
    }

    async fn send_init_ack(&mut self) -> Result<()> {
        let mut b = Buffer::new();
        b.write_u16_le(0x0004);
        b.write_u32_le(0x00000001);
        self.send_raw(b.as_slice()).await
    }

    async fn send_init2(&mut self) -> Result<()> {
        let mut b = Buffer::new();
        b.write_u16_le(0x0021);
        b.write_u8(0x03);
        b.write_u32_le(0x0000000a);
        b.write_u32_le(0x00000001);
        b.write_u32_le(if self.incoming { 0x00000001 } else { 0x00000000 });
        b.write_u32_le(0x00000000);
        b.write_u32_le(0x00000000);
        if self.incoming {
            b.write_u32_le(0x00040001);
            b.write_u32_le(0x00000000);
            b.write_u32_le(0x00000000);
        } else {
            b.write_u32_le(0x00000000);
            b.write_u32_le(0x00000000);
            b.write_u32_le(0x00040001);
        }
        self.send_raw(b.as_slice()).await
    }

    /// Validate the peer's claimed UIN against the roster.
    ///
    /// Accepted when the peer is behind the same NAT (external IPs match and
    /// its LAN IP is the address we see) or when its external IP is the
    /// address we see. Anything else smells like spoofing.
    fn confirm_uin(&mut self, contacts: &ContactList) -> Result<()> {
        let contact = contacts.get(self.remote_uin).ok_or_else(|| {
            Error::Protocol("refusing direct connection from a stranger".into())
        })?;
        let seen_ip = self
            .remote_addr
            .map(|a| ip_to_u32(a.ip()))
            .unwrap_or_default();

        let same_nat = contact.ext_ip == self.local_ext_ip && contact.lan_ip == seen_ip;
        if same_nat || contact.ext_ip == seen_ip {
            self.confirmed = true;
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "refusing direct connection claiming UIN {}: address mismatch",
                self.remote_uin
            )))
        }
    }

    // ==================================================================
    // Data packets
    // ==================================================================

    async fn handle_data_packet(
        &mut self,
        mut packet: Vec<u8>,
        ctx: &DcContext<'_>,
        events: &mut Vec<DcEvent>,
    ) -> Result<()> {
        // v7 prefixes the obfuscated body with a 0x02 marker
        let body = if self.eff_tcp_version == 7 {
            if packet.first() != Some(&0x02) {
                return Err(Error::parse("data packet did not start with 0x02"));
            }
            &mut packet[1..]
        } else {
            &mut packet[..]
        };

        if !crypt::open(body) {
            return Err(Error::parse("direct packet failed decryption checks"));
        }

        let mut b = Buffer::from_bytes(body);
        b.advance(4); // checksum
        let command = b.read_u16_le();
        b.advance(2); // 0x000e
        let seqnum = b.read_u16_le();
        b.advance(12);

        let frame = IcqSubType::parse(&mut b, true, ctx.translator)?;

        match command {
            TCP_START => {
                // own status decides delivery and the accept code
                let (accept, delivered) = accept_verdict(ctx.status);
                let away = if ctx.status == Status::Online {
                    ""
                } else {
                    ctx.away_message
                };
                self.send_ack_packet(&frame.kind, seqnum, accept, away, ctx).await?;
                if delivered {
                    events.push(DcEvent::Message(frame));
                }
            }
            TCP_ACK => match self.msg_cache.remove(&seqnum) {
                Some(message) => {
                    let away_message = match &frame.kind {
                        IcqSubType::AwayRequest { message, .. } => message.clone(),
                        IcqSubType::Normal { message, .. } => message.clone(),
                        _ => String::new(),
                    };
                    events.push(DcEvent::Ack {
                        message,
                        away_message,
                    });
                }
                None => {
                    warn!(target: "icqlink::direct", seqnum, "direct ACK for unknown message");
                }
            },
            0 => return Err(Error::parse("invalid TCP packet")),
            other => {
                return Err(Error::parse(format!(
                    "unknown TCP command 0x{:04x}",
                    other
                )))
            }
        }
        Ok(())
    }

    async fn send_message_packet(
        &mut self,
        msg: OutgoingMessage,
        ctx: &DcContext<'_>,
    ) -> Result<()> {
        let Some(kind) = outgoing_subtype(&msg, ctx) else {
            return Ok(());
        };
        let seqnum = self.next_seqnum();
        let status = ctx.status.icq_status_word(ctx.invisible);

        let mut b = Buffer::new();
        b.write_u32_le(0x00000000); // checksum, sealed in below
        b.write_u16_le(TCP_START);
        b.write_u16_le(0x000e);
        b.write_u16_le(seqnum);
        b.write_bytes(&[0u8; 12]);
        kind.write(
            &mut b,
            SubTypeWrite {
                advanced: true,
                ack: false,
                status,
                away_message: "",
            },
            ctx.translator,
        );

        self.send_sealed(b.into_vec()).await?;
        self.msg_cache.insert(seqnum, msg);
        Ok(())
    }

    async fn send_ack_packet(
        &mut self,
        kind: &IcqSubType,
        seqnum: u16,
        accept_status: u16,
        away_message: &str,
        ctx: &DcContext<'_>,
    ) -> Result<()> {
        let mut b = Buffer::new();
        b.write_u32_le(0x00000000);
        b.write_u16_le(TCP_ACK);
        b.write_u16_le(0x000e);
        b.write_u16_le(seqnum);
        b.write_bytes(&[0u8; 12]);
        kind.write(
            &mut b,
            SubTypeWrite {
                advanced: true,
                ack: true,
                status: accept_status,
                away_message,
            },
            ctx.translator,
        );
        self.send_sealed(b.into_vec()).await
    }

    async fn send_sealed(&mut self, mut body: Vec<u8>) -> Result<()> {
        crypt::seal(&mut body);
        let mut framed = Buffer::new();
        if self.eff_tcp_version == 7 {
            framed.write_u16_le(body.len() as u16 + 1);
            framed.write_u8(0x02);
        } else {
            framed.write_u16_le(body.len() as u16);
        }
        framed.write_bytes(&body);
        self.send_raw(framed.as_slice()).await
    }

    async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        trace!(
            target: "icqlink::direct",
            len = bytes.len(),
            peer = self.remote_uin,
            "direct packet sent"
        );
        match &mut self.socket {
            DcSocket::Stream(s) => Ok(s.write_all(bytes).await?),
            DcSocket::Connecting(_) => Err(Error::NotConnected),
        }
    }

    fn next_seqnum(&mut self) -> u16 {
        let s = self.seqnum;
        self.seqnum = self.seqnum.wrapping_sub(1);
        s
    }

    fn local_ip(&self) -> u32 {
        match &self.socket {
            DcSocket::Stream(s) => s
                .local_addr()
                .map(|a| ip_to_u32(a.ip()))
                .unwrap_or_default(),
            DcSocket::Connecting(_) => 0,
        }
    }
}

fn parse_init_ack(packet: &[u8]) -> Result<()> {
    if packet.len() != 4 {
        return Err(Error::parse("init ack not as expected"));
    }
    Ok(())
}

fn parse_init2(packet: &[u8]) -> Result<()> {
    let mut b = Buffer::from_bytes(packet);
    let ty = b.read_u8();
    if ty != 0x03 {
        return Err(Error::parse("expected second-stage handshake packet"));
    }
    b.advance(4); // 0x0000000a
    let discriminator = b.read_u32_le();
    if discriminator != 0x00000001 {
        // weird probes get dropped without ceremony
        return Err(Error::Protocol("ignoring odd direct connection".into()));
    }
    Ok(())
}

/// Map own status to the accept code and delivery verdict of an inbound
/// message acknowledgement.
pub fn accept_verdict(status: Status) -> (u16, bool) {
    use super::status::accept;
    match status {
        Status::Online | Status::FreeForChat | Status::Offline => (accept::ONLINE, true),
        Status::Away => (accept::AWAY, true),
        Status::NotAvailable => (accept::NA, true),
        Status::Occupied => (accept::OCCUPIED_ACCEPT, true),
        Status::DoNotDisturb => (accept::DND, false),
    }
}

/// Build the subtype for an outbound message, when the content can go
/// peer-to-peer.
pub fn outgoing_subtype(msg: &OutgoingMessage, ctx: &DcContext<'_>) -> Option<IcqSubType> {
    use super::events::MessageContent;
    match &msg.content {
        MessageContent::Normal {
            message,
            foreground,
            background,
        } => Some(IcqSubType::Normal {
            message: message.clone(),
            multi: false,
            foreground: *foreground,
            background: *background,
        }),
        MessageContent::Url { message, url } => Some(IcqSubType::Url {
            message: message.clone(),
            url: url.clone(),
        }),
        MessageContent::AwayRequest => {
            let probe = ctx
                .contacts
                .get(msg.to)
                .map(|c| c.status)
                .unwrap_or(Status::Away);
            Some(IcqSubType::AwayRequest {
                probe,
                message: String::new(),
            })
        }
        _ => None,
    }
}
