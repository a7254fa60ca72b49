//! Login flow: authorizer handshake, BOS redirect, login burst, failures.

mod common;

use std::time::Duration;

use common::run_login;
use icqlink::oscar::flap::Channel;
use icqlink::oscar::{Buffer, tlv};
use icqlink::{Client, ClientConfig, ClientEvent, DisconnectReason, Status};
use tokio::net::TcpListener;

fn test_config(port: u16) -> ClientConfig {
    ClientConfig::new(123456, "secret")
        .authorizer("127.0.0.1", port)
        .accept_in_direct(false)
        .use_out_direct(false)
}

async fn next_until(
    client: &mut Client,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let ev = client.next_event().await;
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

#[tokio::test]
async fn test_successful_login_then_status_change() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move { run_login(listener, b"\xde\xad\xbe\xef").await });

    let mut client = Client::new(test_config(port));
    client.set_status(Status::Online).await.unwrap();

    let mut connected = 0;
    next_until(&mut client, |ev| {
        if matches!(ev, ClientEvent::Connected) {
            connected += 1;
        }
        matches!(ev, ClientEvent::Connected)
    })
    .await;
    assert_eq!(connected, 1);
    assert!(client.is_connected());

    // server pushes our own user info; the status change becomes observable
    let mut bos = server.await.unwrap();
    let mut info = Buffer::new();
    info.write_str8(b"123456");
    info.write_u16_be(0);
    info.write_u16_be(2);
    tlv::write_tlv(&mut info, tlv::TLV_STATUS, &[0x01, 0x00, 0x00, 0x00]);
    tlv::write_tlv_u32(&mut info, tlv::TLV_IP_ADDRESS, 0x0a141e28);
    bos.send_snac(0x0001, 0x000f, 0, info.as_slice()).await;

    let ev = next_until(&mut client, |ev| {
        matches!(ev, ClientEvent::MyStatusChange { .. })
    })
    .await;
    assert_eq!(
        ev,
        ClientEvent::MyStatusChange {
            status: Status::Online,
            invisible: false
        }
    );
    assert_eq!(client.status(), Status::Online);
}

#[tokio::test]
async fn test_auth_rejection_maps_error_code() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut auth = common::MockConn::new(stream);
        auth.send_conn_ack().await;
        let frame = auth.read_frame().await;
        assert_eq!(frame.channel, Channel::SignOn);

        let mut reply = Buffer::new();
        tlv::write_tlv_u16(&mut reply, tlv::TLV_ERROR_CODE, 0x0003);
        auth.send_frame(Channel::SignOff, reply.as_slice()).await;
        auth
    });

    let mut client = Client::new(test_config(port));
    client.connect();

    let ev = next_until(&mut client, |ev| {
        matches!(ev, ClientEvent::Disconnected(_))
    })
    .await;
    assert_eq!(
        ev,
        ClientEvent::Disconnected(DisconnectReason::FailedBadPassword)
    );
    assert!(!client.is_connected());
    server.await.unwrap();
}

#[tokio::test]
async fn test_dual_login_disconnect() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let mut bos = run_login(listener, b"cookie12").await;
        let mut reply = Buffer::new();
        tlv::write_tlv_u16(&mut reply, tlv::TLV_DISCONNECT_REASON, 0x0001);
        bos.send_frame(Channel::SignOff, reply.as_slice()).await;
        bos
    });

    let mut client = Client::new(test_config(port));
    client.connect();

    next_until(&mut client, |ev| matches!(ev, ClientEvent::Connected)).await;
    let ev = next_until(&mut client, |ev| {
        matches!(ev, ClientEvent::Disconnected(_))
    })
    .await;
    assert_eq!(
        ev,
        ClientEvent::Disconnected(DisconnectReason::FailedDualLogin)
    );
    server.await.unwrap();
}

#[tokio::test]
async fn test_requested_disconnect_is_synchronous() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move { run_login(listener, b"cookie12").await });

    let mut client = Client::new(test_config(port));
    client.connect();
    next_until(&mut client, |ev| matches!(ev, ClientEvent::Connected)).await;
    server.await.unwrap();

    client.disconnect();
    let ev = next_until(&mut client, |ev| {
        matches!(ev, ClientEvent::Disconnected(_))
    })
    .await;
    assert_eq!(ev, ClientEvent::Disconnected(DisconnectReason::Requested));
    assert!(!client.is_connected());
}
