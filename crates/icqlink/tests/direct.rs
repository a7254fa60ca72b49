//! Direct-connection fallback: messages to reachable peers bypass the
//! server entirely.

mod common;

use std::future::poll_fn;
use std::time::Duration;

use common::{buddy_online_body, run_login_as};
use icqlink::oscar::contact_list::ContactList;
use icqlink::oscar::direct::{DcContext, DcEvent, DirectClient};
use icqlink::oscar::snac::{FAM_BUDDY, FAM_ICBM, buddy};
use icqlink::oscar::socket::Readiness;
use icqlink::oscar::subtype::IcqSubType;
use icqlink::oscar::Translator;
use icqlink::{Client, ClientConfig, ClientEvent, Contact, Status};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const LOOPBACK: u32 = 0x7f000001;

async fn next_until(
    client: &mut Client,
    mut pred: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(30), async {
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

/// Run the peer end of a direct connection until a message arrives.
async fn peer_until_message(listener: TcpListener, peer_uin: u32, client_uin: u32) -> IcqSubType {
    let (stream, _) = listener.accept().await.unwrap();
    let port = stream.local_addr().unwrap().port();
    let mut dc = DirectClient::incoming(stream, peer_uin, 0, port);

    let tr = Translator::new();
    let mut roster = ContactList::new();
    let mut c = Contact::icq(client_uin);
    c.ext_ip = 0;
    c.lan_ip = LOOPBACK;
    c.tcp_version = 7;
    roster.add(c);

    loop {
        let ctx = DcContext {
            translator: &tr,
            contacts: &roster,
            status: Status::Online,
            invisible: false,
            away_message: "",
        };
        let readiness = poll_fn(|cx| dc.poll_readiness(cx)).await.unwrap();
        let events = match readiness {
            Readiness::ConnectFinished => {
                dc.on_connect_finished().await.unwrap();
                Vec::new()
            }
            Readiness::Readable => dc.on_readable(&ctx).await.unwrap(),
        };
        for ev in events {
            if let DcEvent::Message(frame) = ev {
                return frame.kind;
            }
        }
    }
}

#[tokio::test]
async fn test_direct_fallback_bypasses_server() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let peer_port = peer_listener.local_addr().unwrap().port();

    // the server side forwards every SNAC it sees after login
    let (snac_tx, mut snac_rx) = mpsc::unbounded_channel();
    let server = tokio::spawn(async move {
        let mut bos = run_login_as(listener, b"cookie12", 1111).await;
        bos.send_snac(
            FAM_BUDDY,
            buddy::ONLINE,
            0,
            &buddy_online_body(42, 0x0000, Some((LOOPBACK, peer_port, 7))),
        )
        .await;
        loop {
            let (family, subtype, _, _) = bos.read_snac().await;
            if snac_tx.send((family, subtype)).is_err() {
                return;
            }
        }
    });

    let peer = tokio::spawn(peer_until_message(peer_listener, 42, 1111));

    let cfg = ClientConfig::new(1111, "secret")
        .authorizer("127.0.0.1", port)
        .accept_in_direct(false)
        .use_out_direct(true);
    let mut client = Client::new(cfg);
    client.add_contact(Contact::icq(42)).await.unwrap();
    client.connect();

    next_until(&mut client, |ev| matches!(ev, ClientEvent::Connected)).await;
    next_until(&mut client, |ev| {
        matches!(
            ev,
            ClientEvent::ContactList(icqlink::ContactListEvent::StatusChange { uin: 42, .. })
        )
    })
    .await;

    client.send_message(42, "over the wire, not the server").await.unwrap();

    // the peer receives it over the direct socket, and the client sees the
    // direct ack
    let (kind, ack_ev) = tokio::join!(peer, async {
        next_until(&mut client, |ev| matches!(ev, ClientEvent::MessageAck(_))).await
    });
    match kind.unwrap() {
        IcqSubType::Normal { message, .. } => {
            assert_eq!(message, "over the wire, not the server")
        }
        other => panic!("wrong kind: {:?}", other),
    }
    match ack_ev {
        ClientEvent::MessageAck(ack) => {
            assert!(ack.delivered);
            assert!(ack.direct);
        }
        other => panic!("wrong event: {:?}", other),
    }

    // nothing message-shaped crossed the server connection
    server.abort();
    while let Ok((family, subtype)) = snac_rx.try_recv() {
        assert!(
            !(family == FAM_ICBM && subtype == icqlink::oscar::snac::icbm::SEND),
            "message leaked onto the server path"
        );
    }
}
