//! Common test utilities: an in-process mock OSCAR server.
//!
//! The mock speaks just enough FLAP/SNAC to walk a client through the
//! authorizer handshake and the BOS login burst, then hands the test script
//! a live connection to improvise on.

#![allow(dead_code)]

use icqlink::oscar::flap::{self, Assembled, Channel, Frame, FrameAssembler};
use icqlink::oscar::snac;
use icqlink::oscar::{Buffer, tlv};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One accepted client connection on the mock server.
pub struct MockConn {
    stream: TcpStream,
    assembler: FrameAssembler,
    seq: u16,
}

impl MockConn {
    pub fn new(stream: TcpStream) -> Self {
        MockConn {
            stream,
            assembler: FrameAssembler::new(),
            seq: 0,
        }
    }

    /// Read the next complete FLAP frame.
    pub async fn read_frame(&mut self) -> Frame {
        loop {
            match self.assembler.next() {
                Assembled::Frame(f) => return f,
                Assembled::BadStart(b) => panic!("client sent bad start byte 0x{:02x}", b),
                Assembled::Incomplete => {}
            }
            let mut buf = [0u8; 4096];
            let n = self
                .stream
                .read(&mut buf)
                .await
                .expect("read from client failed");
            assert!(n > 0, "client closed the connection");
            self.assembler.feed(&buf[..n]);
        }
    }

    /// Read the next SNAC, skipping keep-alives.
    /// Returns (family, subtype, request id, body after the header).
    pub async fn read_snac(&mut self) -> (u16, u16, u32, Vec<u8>) {
        loop {
            let mut frame = self.read_frame().await;
            match frame.channel {
                Channel::KeepAlive => continue,
                Channel::Snac => {
                    let family = frame.body.read_u16_be();
                    let subtype = frame.body.read_u16_be();
                    let _flags = frame.body.read_u16_be();
                    let request_id = frame.body.read_u32_be();
                    let rest = frame.body.read_bytes(frame.body.remaining());
                    return (family, subtype, request_id, rest);
                }
                other => panic!("expected SNAC frame, got channel {:?}", other),
            }
        }
    }

    /// Read SNACs until one matches (family, subtype).
    pub async fn expect_snac(&mut self, family: u16, subtype: u16) -> (u32, Vec<u8>) {
        loop {
            let (f, s, r, b) = self.read_snac().await;
            if (f, s) == (family, subtype) {
                return (r, b);
            }
        }
    }

    /// Send a raw FLAP frame.
    pub async fn send_frame(&mut self, channel: Channel, body: &[u8]) {
        self.seq = self.seq.wrapping_add(1) & 0x7fff;
        let mut b = Buffer::new();
        let m = flap::begin_frame(&mut b, channel, self.seq);
        b.write_bytes(body);
        flap::finish_frame(&mut b, m);
        self.stream
            .write_all(b.as_slice())
            .await
            .expect("write to client failed");
    }

    /// Send a SNAC frame.
    pub async fn send_snac(&mut self, family: u16, subtype: u16, request_id: u32, body: &[u8]) {
        let mut b = Buffer::new();
        b.write_u16_be(family);
        b.write_u16_be(subtype);
        b.write_u16_be(0);
        b.write_u32_be(request_id);
        b.write_bytes(body);
        self.send_frame(Channel::Snac, b.as_slice()).await;
    }

    /// Send the channel-1 connection acknowledge.
    pub async fn send_conn_ack(&mut self) {
        self.send_frame(Channel::SignOn, &[0, 0, 0, 1]).await;
    }
}

/// Walk a connecting client (UIN 123456) through authorizer and BOS up to
/// the login burst. Returns the live BOS connection after client-ready was
/// seen.
pub async fn run_login(listener: TcpListener, cookie: &[u8]) -> MockConn {
    run_login_as(listener, cookie, 123456).await
}

/// Walk a connecting client through authorizer and BOS up to the login
/// burst. Returns the live BOS connection after client-ready was seen.
///
/// Both connections arrive on the same listener; the redirect simply points
/// back at it. Like the real service, the mock finishes by pushing the
/// client its own user info, confirming the requested status.
pub async fn run_login_as(listener: TcpListener, cookie: &[u8], uin: u32) -> MockConn {
    let port = listener.local_addr().unwrap().port();

    // ---- authorizer leg ----
    let (stream, _) = listener.accept().await.unwrap();
    let mut auth = MockConn::new(stream);
    auth.send_conn_ack().await;

    let frame = auth.read_frame().await;
    assert_eq!(frame.channel, Channel::SignOn, "expected auth request");

    let mut reply = Buffer::new();
    tlv::write_tlv(&mut reply, tlv::TLV_COOKIE, cookie);
    tlv::write_tlv_str(
        &mut reply,
        tlv::TLV_REDIRECT,
        &format!("127.0.0.1:{}", port),
    );
    auth.send_frame(Channel::SignOff, reply.as_slice()).await;
    drop(auth);

    // ---- BOS leg ----
    let (stream, _) = listener.accept().await.unwrap();
    let mut bos = MockConn::new(stream);
    bos.send_conn_ack().await;

    let mut frame = bos.read_frame().await;
    assert_eq!(frame.channel, Channel::SignOn, "expected login cookie");
    frame.body.advance(4);
    let set = tlv::TlvSet::parse(&mut frame.body);
    assert_eq!(set.get(tlv::TLV_COOKIE), Some(cookie));

    bos.send_snac(snac::FAM_GENERIC, snac::generic::SRV_READY, 0, &[])
        .await;
    bos.expect_snac(snac::FAM_GENERIC, snac::generic::CAPABILITIES)
        .await;
    bos.send_snac(snac::FAM_GENERIC, snac::generic::CAP_ACK, 0, &[])
        .await;
    bos.expect_snac(snac::FAM_GENERIC, snac::generic::RATE_INFO_REQUEST)
        .await;
    bos.send_snac(snac::FAM_GENERIC, snac::generic::RATE_INFO, 0, &[])
        .await;

    // the login burst, in order
    bos.expect_snac(snac::FAM_GENERIC, snac::generic::RATE_INFO_ACK)
        .await;
    bos.expect_snac(snac::FAM_GENERIC, snac::generic::PERSONAL_INFO_REQUEST)
        .await;
    bos.expect_snac(snac::FAM_ICBM, snac::icbm::ADD_ICBM_PARAMETER)
        .await;
    bos.expect_snac(snac::FAM_LOCATION, snac::location::SET_USER_INFO)
        .await;
    bos.expect_snac(snac::FAM_GENERIC, snac::generic::SET_STATUS)
        .await;
    bos.expect_snac(snac::FAM_GENERIC, snac::generic::CLIENT_READY)
        .await;
    bos.expect_snac(snac::FAM_SRV, snac::srv::SEND).await;

    // the server confirms the requested status by pushing our user info
    let mut info = Buffer::new();
    info.write_str8(uin.to_string().as_bytes());
    info.write_u16_be(0);
    info.write_u16_be(1);
    info.write_u16_be(tlv::TLV_STATUS);
    info.write_u16_be(4);
    info.write_bytes(&[0x01, 0x00, 0x00, 0x00]);
    bos.send_snac(snac::FAM_GENERIC, snac::generic::USER_INFO, 0, info.as_slice())
        .await;

    bos
}

/// Build a buddy-online user-info block.
pub fn buddy_online_body(uin: u32, status_word: u16, lan: Option<(u32, u16, u8)>) -> Vec<u8> {
    let mut b = Buffer::new();
    b.write_str8(uin.to_string().as_bytes());
    b.write_u16_be(0); // warning level
    b.write_u16_be(if lan.is_some() { 2 } else { 1 });

    let mut status = Buffer::new();
    status.write_u8(0x01); // allow direct
    status.write_u8(0x00); // web aware
    status.write_u16_be(status_word);
    tlv::write_tlv(&mut b, tlv::TLV_STATUS, status.as_slice());

    if let Some((lan_ip, lan_port, tcp_version)) = lan {
        let mut details = Buffer::new();
        details.write_u32_be(lan_ip);
        details.write_u16_be(0);
        details.write_u16_be(lan_port);
        details.write_u16_be(0x0400);
        details.write_u16_be(tcp_version as u16);
        details.write_bytes(&[0u8; 0x25 - 12]);
        tlv::write_tlv(&mut b, tlv::TLV_LAN_DETAILS, details.as_slice());
    }
    b.into_vec()
}

/// Wrap an ICQ server response body (family 0x15 subtype 0x03).
pub fn srv_response_body(uin: u32, command: u16, request_word: u16, inner: &[u8]) -> Vec<u8> {
    let mut b = Buffer::new();
    b.write_u16_be(0x0001);
    let outer = b.mark_u16_be();
    let len = b.mark_u16_le();
    b.write_u32_le(uin);
    b.write_u16_le(command);
    b.write_u16_le(request_word);
    b.write_bytes(inner);
    b.patch_size_le(len);
    b.patch_size(outer);
    b.into_vec()
}
