//! The closed set of events the client emits to its embedder.
//!
//! Every entry point pushes events onto an internal queue;
//! [`Client::next_event`](crate::oscar::client::Client::next_event) drains
//! it. Diagnostics go through `tracing` instead of the event stream.

use super::snac::generic::RateInfoChange;
use super::snac::srv::SimpleUserInfo;
use super::status::Status;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DisconnectReason {
    /// We asked for it.
    Requested,
    /// Socket-level failure.
    FailedLowlevel,
    /// Authorizer rejected the screen name.
    FailedBadUsername,
    /// Authorizer says: reconnecting too fast.
    FailedTurboing,
    /// Wrong password.
    FailedBadPassword,
    /// Username/password mismatch.
    FailedMismatchPasswd,
    /// Account signed on elsewhere.
    FailedDualLogin,
    /// Anything else.
    FailedUnknown,
}

/// Why an outbound message was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeliveryFailure {
    /// No route could deliver it (offline target, timeout, basic away probe).
    NotDelivered,
    /// Receiver explicitly refused.
    Denied,
    /// Receiver is occupied and refused.
    Occupied,
    /// Receiver is in do-not-disturb.
    Dnd,
}

/// An inbound message event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IncomingMessage {
    /// Contact the message is attributed to.
    pub from: u32,
    /// Original send time (offline messages), seconds since the epoch.
    pub time: Option<u64>,
    /// The payload.
    pub kind: IncomingKind,
}

/// Payload of an inbound message event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IncomingKind {
    /// Plain text message.
    Normal {
        message: String,
        multi: bool,
        foreground: u32,
        background: u32,
    },
    /// Message plus URL.
    Url { message: String, url: String },
    /// SMS relayed by the gateway.
    Sms {
        message: String,
        source: String,
        senders_network: String,
        time: String,
    },
    /// Delivery receipt for an SMS we sent.
    SmsReceipt {
        message: String,
        message_id: String,
        destination: String,
        delivered: bool,
        submission_time: String,
        delivery_time: String,
    },
    /// Authorization request from a stranger.
    AuthReq {
        nick: String,
        first_name: String,
        last_name: String,
        email: String,
        message: String,
    },
    /// Authorization verdict on a request we sent.
    AuthAck { granted: bool, message: String },
    /// "You were added" notice.
    UserAdd,
}

/// An outbound message handed to the send pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutgoingMessage {
    /// Destination contact.
    pub to: u32,
    /// The payload.
    pub content: MessageContent,
}

/// Payload of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MessageContent {
    /// Plain text message.
    Normal {
        message: String,
        foreground: u32,
        background: u32,
    },
    /// Message plus URL.
    Url { message: String, url: String },
    /// SMS through the gateway.
    Sms { message: String, delivery_receipt: bool },
    /// Probe the contact's away message.
    AwayRequest,
    /// Ask the contact for authorization.
    AuthReq { message: String },
    /// Answer an authorization request.
    AuthResponse { granted: bool, message: String },
}

/// Final verdict on an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MessageAck {
    /// The message this finalizes.
    pub message: OutgoingMessage,
    /// Delivered to the peer (or accepted by the gateway).
    pub delivered: bool,
    /// Went over a direct connection rather than the server.
    pub direct: bool,
    /// Away text reported by the peer, when there was one.
    pub away_message: String,
    /// Failure detail when not delivered.
    pub failure: Option<DeliveryFailure>,
}

/// Roster change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ContactListEvent {
    /// Presence changed.
    StatusChange {
        uin: u32,
        status: Status,
        old_status: Status,
    },
    /// Names/profile changed.
    UserInfoChange { uin: u32 },
    /// Contact added locally.
    UserAdded { uin: u32 },
    /// Contact removed locally.
    UserRemoved { uin: u32 },
    /// The pending-message queue of a contact changed.
    MessageQueueChanged { uin: u32 },
    /// Contact arrived from the server-stored roster.
    ServerBasedContact { uin: u32 },
}

/// Everything the client can tell its embedder.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ClientEvent {
    /// Logged into the BOS server.
    Connected,
    /// Session ended.
    Disconnected(DisconnectReason),
    /// Inbound message.
    Message(IncomingMessage),
    /// Outbound message finalized.
    MessageAck(MessageAck),
    /// Roster change.
    ContactList(ContactListEvent),
    /// Own status changed.
    MyStatusChange { status: Status, invisible: bool },
    /// Own user info (external IP etc.) changed.
    MyUserInfoChange,
    /// Whitepage search hit.
    SearchResult {
        info: SimpleUserInfo,
        /// Final frame of the search.
        last: bool,
    },
    /// New account registered (uin 0 means failure).
    NewUin { uin: u32, success: bool },
    /// Server rate limits changed.
    RateInfoChange(RateInfoChange),
}
