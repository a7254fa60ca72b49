//! Async client library for the legacy OSCAR/ICQ2000 instant-messaging
//! protocol.
//!
//! The crate logs into the service's authorizer, follows the redirect to a
//! BOS server, keeps a roster with presence, exchanges text/URL/SMS
//! messages, answers away-message probes, handles authorization requests,
//! and opportunistically negotiates peer-to-peer direct connections for
//! interactive chat.
//!
//! # Example
//!
//! ```ignore
//! use icqlink::{Client, ClientConfig, ClientEvent, Status};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> icqlink::Result<()> {
//!     let cfg = ClientConfig::new(123456, "secret");
//!     let mut client = Client::new(cfg);
//!     client.set_status(Status::Online).await?;
//!
//!     loop {
//!         match client.next_event().await {
//!             ClientEvent::Connected => println!("online"),
//!             ClientEvent::Message(msg) => println!("<{}> {:?}", msg.from, msg.kind),
//!             ClientEvent::Disconnected(reason) => {
//!                 println!("gone: {:?}", reason);
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Driving model
//!
//! No background task is spawned: all protocol work happens inside
//! [`Client::next_event`], which multiplexes the server socket, the peer
//! listener, every direct connection and a one-second maintenance tick.
//! Send methods are `async` and complete once the bytes are handed to the
//! kernel; delivery verdicts arrive later as
//! [`MessageAck`](oscar::events::MessageAck) events.
//!
//! # Features
//!
//! - `serde` — `Serialize`/`Deserialize` on the public data model (status,
//!   events, profile pages).

pub mod oscar;

pub use oscar::{
    Client, ClientConfig, ClientEvent, Contact, ContactList, ContactListEvent, DisconnectReason,
    Error, EventStream, IncomingKind, IncomingMessage, MessageAck, MessageContent,
    OutgoingMessage, Result, Status,
};
