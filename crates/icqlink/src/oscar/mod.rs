//! OSCAR/ICQ2000 protocol implementation.
//!
//! The layering mirrors the wire: [`buffer`] and [`tlv`] are the raw codec
//! floor, [`flap`] frames the server byte stream, [`snac`] types the
//! commands riding on it, [`subtype`] decodes the ICQ message payloads, and
//! [`client`] orchestrates the lot. Peer-to-peer traffic bypasses the server
//! through [`direct`], obfuscated by [`crypt`].

pub mod buffer;
pub mod cache;
pub mod caps;
pub mod client;
pub mod config;
pub mod contact;
pub mod contact_list;
pub mod cookie;
pub mod crypt;
pub mod direct;
mod error;
pub mod events;
pub mod flap;
pub mod snac;
pub mod socket;
pub mod status;
pub mod subtype;
pub mod tlv;
pub mod translator;
pub mod userinfo;
pub mod xml;

pub use buffer::Buffer;
pub use cache::TimedCache;
pub use caps::Capabilities;
pub use client::{Client, ConnectionState, EventStream};
pub use config::ClientConfig;
pub use contact::Contact;
pub use contact_list::ContactList;
pub use cookie::IcbmCookie;
pub use error::{Error, Result};
pub use events::{
    ClientEvent, ContactListEvent, DeliveryFailure, DisconnectReason, IncomingKind,
    IncomingMessage, MessageAck, MessageContent, OutgoingMessage,
};
pub use status::Status;
pub use translator::Translator;
