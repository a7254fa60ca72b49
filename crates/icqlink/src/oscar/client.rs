//! The client orchestrator.
//!
//! One struct owns the server connection, the peer listener, every direct
//! connection and all the delivery caches. The embedder drives it by
//! awaiting [`Client::next_event`]; everything else — login sequencing,
//! SNAC dispatch, message routing, keep-alive, cache expiry — happens inside
//! that call. No background task is spawned.

use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::task::{Context, Poll};
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::buffer::Buffer;
use super::cache::TimedCache;
use super::caps::Capabilities;
use super::config::ClientConfig;
use super::contact::Contact;
use super::contact_list::ContactList;
use super::cookie::IcbmCookie;
use super::direct::{self, DcContext, DcEvent, DcHandle, DirectClient};
use super::error::{Error, Result};
use super::events::{
    ClientEvent, ContactListEvent, DeliveryFailure, DisconnectReason, IncomingKind,
    IncomingMessage, MessageAck, MessageContent, OutgoingMessage,
};
use super::flap::{self, Assembled, Channel, Frame};
use super::snac::{self, OutSnac, SnacBody};
use super::socket::{PeerListener, ReadOutcome, Readiness, ServerConnection};
use super::status::{Status, accept};
use super::subtype::{IcqSubType, SmsPayload};
use super::translator::Translator;
use super::{tlv, userinfo::UserInfoBlock, xml};

/// XOR mask applied to the password TLV at sign-on.
const PASSWORD_XOR: [u8; 16] = [
    0xf3, 0x26, 0x81, 0xc4, 0x39, 0x86, 0xdb, 0x92, //
    0x71, 0xa3, 0xb9, 0xe6, 0x53, 0x7a, 0x95, 0x7c,
];

/// Client profile string advertised at sign-on.
const CLIENT_PROFILE: &str = "ICQ Inc. - Product of ICQ (TM).2000b.4.63.1.3279.85";

/// Keep-alive interval on the server connection.
const PING_INTERVAL: Duration = Duration::from_secs(60);
/// Default acknowledgement timeout for server cookies and fresh peers.
const ACK_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle timeout for an established peer connection.
const ESTABLISHED_DC_TIMEOUT: Duration = Duration::from_secs(600);

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Idle.
    NotConnected,
    /// Authorizer TCP up, waiting for its channel-1 hello.
    AuthAwaitingConnAck,
    /// Credentials sent, waiting for cookie/redirect or rejection.
    AuthAwaitingAuthReply,
    /// BOS TCP up, waiting for its channel-1 hello.
    BosAwaitingConnAck,
    /// Cookie sent, waiting for the server-ready SNAC.
    BosAwaitingLoginReply,
    /// Fully logged in.
    BosLoggedIn,
    /// Registration connection waiting for the hello.
    UinAwaitingConnAck,
    /// Registration request sent.
    UinAwaitingUinReply,
}

/// What a pending request id resolves to.
enum PendingRequest {
    /// An SMS awaiting its gateway verdict.
    SmsMessage(OutgoingMessage),
    /// A detailed-info fetch for a contact.
    UserInfo(u32),
    /// A whitepage search.
    Search,
}

enum Wake {
    Tick,
    Server(Readiness),
    ServerError(std::io::Error),
    Accept(TcpStream),
    Direct(DcHandle, Readiness),
    DirectError(DcHandle, std::io::Error),
}

/// OSCAR/ICQ2000 client.
pub struct Client {
    cfg: ClientConfig,
    translator: Translator,

    state: ConnectionState,
    status: Status,
    pending_status: Status,
    invisible: bool,
    away_message: String,
    ext_ip: u32,

    contacts: ContactList,
    cookie_cache: TimedCache<IcbmCookie, OutgoingMessage>,
    reqid_cache: TimedCache<u32, PendingRequest>,
    directs: TimedCache<DcHandle, DirectClient>,
    uin_to_dc: HashMap<u32, DcHandle>,
    next_dc_handle: DcHandle,

    server: Option<ServerConnection>,
    listener: Option<PeerListener>,
    bos_host: String,
    bos_port: u16,
    login_cookie: Option<Vec<u8>>,

    seq_num: u16,
    request_id: u32,
    last_send: Instant,
    tick: Option<Interval>,

    queue: VecDeque<ClientEvent>,
}

impl Client {
    /// Build a client from its configuration.
    ///
    /// A broken translation map is non-fatal; the identity map is kept.
    pub fn new(cfg: ClientConfig) -> Self {
        let translator = match &cfg.translation_map {
            Some(path) => match Translator::load_map(path) {
                Ok(t) => t,
                Err(e) => {
                    warn!("failed to load translation map: {}", e);
                    Translator::new()
                }
            },
            None => Translator::new(),
        };

        Client {
            cfg,
            translator,
            state: ConnectionState::NotConnected,
            status: Status::Offline,
            pending_status: Status::Online,
            invisible: false,
            away_message: String::new(),
            ext_ip: 0,
            contacts: ContactList::new(),
            cookie_cache: TimedCache::new(ACK_TIMEOUT),
            reqid_cache: TimedCache::new(ACK_TIMEOUT),
            directs: TimedCache::new(ACK_TIMEOUT),
            uin_to_dc: HashMap::new(),
            next_dc_handle: 1,
            server: None,
            listener: None,
            bos_host: String::new(),
            bos_port: 0,
            login_cookie: None,
            seq_num: 0,
            request_id: 0,
            last_send: Instant::now(),
            tick: None,
            queue: VecDeque::new(),
        }
    }

    // ==================================================================
    // Public surface
    // ==================================================================

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once logged into the BOS server.
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::BosLoggedIn
    }

    /// Own confirmed status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Borrow the roster.
    pub fn contacts(&self) -> &ContactList {
        &self.contacts
    }

    /// Borrow a contact.
    pub fn contact(&self, uin: u32) -> Option<&Contact> {
        self.contacts.get(uin)
    }

    /// Set the text served to away-message probes.
    pub fn set_away_message(&mut self, text: impl Into<String>) {
        self.away_message = text.into();
    }

    /// Number of server-routed messages still awaiting acknowledgement.
    pub fn pending_deliveries(&self) -> usize {
        self.cookie_cache.len()
    }

    /// Open the session (no-op unless idle).
    pub fn connect(&mut self) {
        if self.state == ConnectionState::NotConnected {
            self.connect_authorizer(ConnectionState::AuthAwaitingConnAck);
        }
    }

    /// Register a new account; finishes with a `NewUin` event.
    pub fn register_uin(&mut self) {
        if self.state == ConnectionState::NotConnected {
            self.connect_authorizer(ConnectionState::UinAwaitingConnAck);
        }
    }

    /// Tear the session down.
    pub fn disconnect(&mut self) {
        if self.state != ConnectionState::NotConnected {
            self.teardown(DisconnectReason::Requested);
        }
    }

    /// Change own status. `Offline` disconnects; anything else connects
    /// first when idle.
    pub async fn set_status(&mut self, status: Status) -> Result<()> {
        if self.state == ConnectionState::BosLoggedIn {
            if status == Status::Offline {
                self.disconnect();
                return Ok(());
            }
            self.pending_status = status;
            let word = status.icq_status_word(self.invisible);
            return self
                .send_snac(&snac::generic::SetStatusSnac {
                    status: word,
                    direct_details: None,
                })
                .await;
        }

        self.pending_status = status;
        if status != Status::Offline {
            self.connect();
        } else if self.state != ConnectionState::NotConnected {
            self.disconnect();
        }
        Ok(())
    }

    /// Toggle invisibility (takes effect with the next status send).
    pub async fn set_invisible(&mut self, invisible: bool) -> Result<()> {
        self.invisible = invisible;
        if self.state == ConnectionState::BosLoggedIn {
            let word = self.pending_status.icq_status_word(invisible);
            return self
                .send_snac(&snac::generic::SetStatusSnac {
                    status: word,
                    direct_details: None,
                })
                .await;
        }
        Ok(())
    }

    /// Add a contact; registered with the server when logged in.
    pub async fn add_contact(&mut self, contact: Contact) -> Result<()> {
        if self.contacts.exists(contact.uin()) {
            return Ok(());
        }
        let uin = contact.uin();
        let icq = contact.is_icq_contact();
        let screenname = contact.screenname();
        self.contacts.add(contact);
        self.push(ClientEvent::ContactList(ContactListEvent::UserAdded {
            uin,
        }));

        if icq && self.state == ConnectionState::BosLoggedIn {
            self.send_snac(&snac::buddy::AddBuddySnac {
                screennames: vec![screenname],
            })
            .await?;
            self.fetch_detailed_contact_info(uin).await?;
        }
        Ok(())
    }

    /// Add a mobile-only contact; returns its pseudo-UIN.
    pub fn add_mobile_contact(&mut self, alias: &str, mobile_no: &str) -> u32 {
        if let Some(uin) = self.contacts.lookup_mobile(mobile_no) {
            return uin;
        }
        let pseudo = self.contacts.next_pseudo_uin();
        self.contacts.add(Contact::mobile(pseudo, alias, mobile_no));
        self.push(ClientEvent::ContactList(ContactListEvent::UserAdded {
            uin: pseudo,
        }));
        pseudo
    }

    /// Remove a contact, its direct connections and its pending deliveries.
    pub async fn remove_contact(&mut self, uin: u32) -> Result<()> {
        if !self.contacts.exists(uin) {
            return Ok(());
        }
        self.push(ClientEvent::ContactList(ContactListEvent::UserRemoved {
            uin,
        }));

        let is_icq = self
            .contacts
            .get(uin)
            .map(|c| c.is_icq_contact())
            .unwrap_or(false);
        if is_icq && self.state == ConnectionState::BosLoggedIn {
            self.send_snac(&snac::buddy::RemoveBuddySnac {
                screennames: vec![uin.to_string()],
            })
            .await?;
        }

        // direct connections to the contact go away without redelivery
        if let Some(h) = self.uin_to_dc.remove(&uin) {
            if let Some(mut dc) = self.directs.remove(&h) {
                for msg in dc.take_undelivered() {
                    self.finalize_undelivered(msg, false);
                }
            }
        }
        // pending deliveries are cancelled
        for (_, msg) in self.cookie_cache.drain_where(|_, m| m.to == uin) {
            self.finalize_undelivered(msg, false);
        }
        let dropped = self.reqid_cache.drain_where(|_, req| match req {
            PendingRequest::SmsMessage(m) => m.to == uin,
            PendingRequest::UserInfo(u) => *u == uin,
            PendingRequest::Search => false,
        });
        for (_, req) in dropped {
            if let PendingRequest::SmsMessage(msg) = req {
                self.finalize_undelivered(msg, false);
            }
        }

        self.contacts.remove(uin);
        Ok(())
    }

    /// Drain a contact's pending-message queue (the embedder has consumed
    /// the messages).
    pub fn absorb_pending(&mut self, uin: u32) -> Vec<IncomingMessage> {
        let Some(c) = self.contacts.get_mut(uin) else {
            return Vec::new();
        };
        let drained = c.drain_pending();
        if !drained.is_empty() {
            self.push(ClientEvent::ContactList(
                ContactListEvent::MessageQueueChanged { uin },
            ));
        }
        drained
    }

    /// Send a plain text message.
    pub async fn send_message(&mut self, uin: u32, message: impl Into<String>) -> Result<()> {
        self.send_event(OutgoingMessage {
            to: uin,
            content: MessageContent::Normal {
                message: message.into(),
                foreground: 0x00000000,
                background: 0x00ffffff,
            },
        })
        .await
    }

    /// Send a URL message.
    pub async fn send_url(
        &mut self,
        uin: u32,
        message: impl Into<String>,
        url: impl Into<String>,
    ) -> Result<()> {
        self.send_event(OutgoingMessage {
            to: uin,
            content: MessageContent::Url {
                message: message.into(),
                url: url.into(),
            },
        })
        .await
    }

    /// Send an SMS to a contact's mobile number.
    pub async fn send_sms(
        &mut self,
        uin: u32,
        message: impl Into<String>,
        delivery_receipt: bool,
    ) -> Result<()> {
        self.send_event(OutgoingMessage {
            to: uin,
            content: MessageContent::Sms {
                message: message.into(),
                delivery_receipt,
            },
        })
        .await
    }

    /// Probe a contact's away message.
    pub async fn request_away_message(&mut self, uin: u32) -> Result<()> {
        self.send_event(OutgoingMessage {
            to: uin,
            content: MessageContent::AwayRequest,
        })
        .await
    }

    /// Ask a contact for authorization.
    pub async fn send_auth_request(&mut self, uin: u32, message: impl Into<String>) -> Result<()> {
        self.send_event(OutgoingMessage {
            to: uin,
            content: MessageContent::AuthReq {
                message: message.into(),
            },
        })
        .await
    }

    /// Answer a contact's authorization request.
    pub async fn send_auth_response(
        &mut self,
        uin: u32,
        granted: bool,
        message: impl Into<String>,
    ) -> Result<()> {
        self.send_event(OutgoingMessage {
            to: uin,
            content: MessageContent::AuthResponse {
                granted,
                message: message.into(),
            },
        })
        .await
    }

    /// Submit an outbound message to the routing pipeline.
    ///
    /// Messages that can go peer-to-peer try the direct path first; the rest
    /// (and every fallback) goes through the server. The final verdict
    /// arrives later as a `MessageAck` event.
    pub async fn send_event(&mut self, msg: OutgoingMessage) -> Result<()> {
        match msg.content {
            MessageContent::Normal { .. }
            | MessageContent::Url { .. }
            | MessageContent::AwayRequest => {
                if self.try_send_direct(&msg).await {
                    return Ok(());
                }
                self.send_via_server(msg).await
            }
            _ => self.send_via_server(msg).await,
        }
    }

    /// Fetch alias/name/email for a contact.
    pub async fn fetch_simple_contact_info(&mut self, uin: u32) -> Result<()> {
        if !self.contacts.get(uin).map(|c| c.is_icq_contact()).unwrap_or(false) {
            return Ok(());
        }
        let request_id = self.next_request_id();
        self.send_snac_with_id(
            &snac::srv::SimpleUserInfoRequestSnac {
                source_uin: self.cfg.uin,
                target_uin: uin,
                request_id,
            },
            request_id,
        )
        .await
    }

    /// Fetch the detailed profile pages for a contact.
    pub async fn fetch_detailed_contact_info(&mut self, uin: u32) -> Result<()> {
        if !self.contacts.get(uin).map(|c| c.is_icq_contact()).unwrap_or(false) {
            return Ok(());
        }
        let request_id = self.next_request_id();
        self.reqid_cache
            .insert(request_id, PendingRequest::UserInfo(uin));
        self.send_snac_with_id(
            &snac::srv::DetailedUserInfoRequestSnac {
                source_uin: self.cfg.uin,
                target_uin: uin,
                request_id,
            },
            request_id,
        )
        .await
    }

    /// Whitepage search by UIN; hits arrive as `SearchResult` events.
    pub async fn search_uin(&mut self, uin: u32) -> Result<()> {
        let request_id = self.next_request_id();
        self.reqid_cache.insert(request_id, PendingRequest::Search);
        self.send_snac_with_id(
            &snac::srv::SimpleUserInfoRequestSnac {
                source_uin: self.cfg.uin,
                target_uin: uin,
                request_id,
            },
            request_id,
        )
        .await
    }

    /// Request the server-stored roster.
    pub async fn fetch_server_based_contact_list(&mut self) -> Result<()> {
        self.send_snac(&snac::sbl::RequestListSnac).await
    }

    /// Store contacts on the server-side roster (one edit batch).
    pub async fn sbl_store_contacts(&mut self, uins: &[u32]) -> Result<()> {
        let entries = self.sbl_entries(uins);
        self.send_snac(&snac::sbl::EditStartSnac).await?;
        self.send_snac(&snac::sbl::AddItemSnac {
            items: snac::sbl::SblItems::Buddies(entries),
        })
        .await?;
        self.send_snac(&snac::sbl::EditFinishSnac).await
    }

    /// Remove contacts from the server-side roster (one edit batch).
    pub async fn sbl_remove_contacts(&mut self, uins: &[u32]) -> Result<()> {
        let entries = self.sbl_entries(uins);
        self.send_snac(&snac::sbl::EditStartSnac).await?;
        self.send_snac(&snac::sbl::RemoveItemSnac {
            items: snac::sbl::SblItems::Buddies(entries),
        })
        .await?;
        self.send_snac(&snac::sbl::EditFinishSnac).await
    }

    /// Rewrite a server-side group header.
    pub async fn sbl_update_group(
        &mut self,
        name: &str,
        group_id: u16,
        member_ids: Vec<u16>,
    ) -> Result<()> {
        self.send_snac(&snac::sbl::EditStartSnac).await?;
        self.send_snac(&snac::sbl::UpdateGroupSnac {
            name: name.to_string(),
            group_id,
            member_ids,
        })
        .await?;
        self.send_snac(&snac::sbl::EditFinishSnac).await
    }

    fn sbl_entries(&self, uins: &[u32]) -> Vec<snac::sbl::SblEntry> {
        uins.iter()
            .filter_map(|u| self.contacts.get(*u))
            .filter(|c| c.is_icq_contact())
            .map(|c| snac::sbl::SblEntry {
                uin: c.uin(),
                nickname: c.alias.clone(),
                group_id: if c.group_id == 0 { 1 } else { c.group_id },
                item_id: c.item_id,
                auth_awaited: c.auth_awaited,
            })
            .collect()
    }

    /// Add contacts to the visible list.
    pub async fn add_visible(&mut self, uins: &[u32]) -> Result<()> {
        self.send_snac(&snac::bos::AddVisibleSnac {
            screennames: uins.iter().map(u32::to_string).collect(),
        })
        .await
    }

    /// Remove contacts from the visible list.
    pub async fn remove_visible(&mut self, uins: &[u32]) -> Result<()> {
        self.send_snac(&snac::bos::RemoveVisibleSnac {
            screennames: uins.iter().map(u32::to_string).collect(),
        })
        .await
    }

    /// Add contacts to the invisible list.
    pub async fn add_invisible(&mut self, uins: &[u32]) -> Result<()> {
        self.send_snac(&snac::bos::AddInvisibleSnac {
            screennames: uins.iter().map(u32::to_string).collect(),
        })
        .await
    }

    /// Remove contacts from the invisible list.
    pub async fn remove_invisible(&mut self, uins: &[u32]) -> Result<()> {
        self.send_snac(&snac::bos::RemoveInvisibleSnac {
            screennames: uins.iter().map(u32::to_string).collect(),
        })
        .await
    }

    /// Wait for and return the next event, doing all protocol work inline.
    pub async fn next_event(&mut self) -> ClientEvent {
        loop {
            if let Some(ev) = self.queue.pop_front() {
                return ev;
            }
            let wake = poll_fn(|cx| self.poll_wake(cx)).await;
            match wake {
                Wake::Tick => self.handle_tick().await,
                Wake::Server(Readiness::ConnectFinished) => {
                    debug!("server TCP connect completed");
                }
                Wake::Server(Readiness::Readable) => self.handle_server_readable().await,
                Wake::ServerError(e) => {
                    warn!("server socket failed: {}", e);
                    self.teardown(DisconnectReason::FailedLowlevel);
                }
                Wake::Accept(stream) => self.handle_incoming_direct(stream),
                Wake::Direct(h, Readiness::ConnectFinished) => {
                    let failed = match self.directs.get_mut(&h) {
                        Some(dc) => dc.on_connect_finished().await.is_err(),
                        None => false,
                    };
                    if failed {
                        self.teardown_direct(h, true).await;
                    }
                }
                Wake::Direct(h, Readiness::Readable) => self.handle_direct_readable(h).await,
                Wake::DirectError(h, e) => {
                    warn!(target: "icqlink::direct", "direct socket failed: {}", e);
                    self.teardown_direct(h, true).await;
                }
            }
        }
    }

    // ==================================================================
    // Readiness multiplexing
    // ==================================================================

    fn poll_wake(&mut self, cx: &mut Context<'_>) -> Poll<Wake> {
        if let Some(server) = &mut self.server {
            match server.poll_readiness(cx) {
                Poll::Ready(Ok(r)) => return Poll::Ready(Wake::Server(r)),
                Poll::Ready(Err(e)) => return Poll::Ready(Wake::ServerError(e)),
                Poll::Pending => {}
            }
        }
        if let Some(listener) = &mut self.listener {
            match listener.poll_accept(cx) {
                Poll::Ready(Ok((stream, _addr))) => return Poll::Ready(Wake::Accept(stream)),
                Poll::Ready(Err(e)) => {
                    warn!("listener accept failed: {}", e);
                }
                Poll::Pending => {}
            }
        }
        for (h, dc) in self.directs.iter_mut() {
            match dc.poll_readiness(cx) {
                Poll::Ready(Ok(r)) => return Poll::Ready(Wake::Direct(*h, r)),
                Poll::Ready(Err(e)) => return Poll::Ready(Wake::DirectError(*h, e)),
                Poll::Pending => {}
            }
        }
        let tick = self.tick.get_or_insert_with(|| {
            let mut t = tokio::time::interval(Duration::from_secs(1));
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });
        if tick.poll_tick(cx).is_ready() {
            return Poll::Ready(Wake::Tick);
        }
        Poll::Pending
    }

    // ==================================================================
    // Maintenance
    // ==================================================================

    async fn handle_tick(&mut self) {
        if self.state == ConnectionState::BosLoggedIn
            && self.last_send.elapsed() >= PING_INTERVAL
        {
            let _ = self.send_frame(Channel::KeepAlive, &[]).await;
        }

        // expired server cookies finalize as undelivered
        for (_, msg) in self.cookie_cache.drain_expired() {
            warn!("message timeout without receiving ACK");
            self.finalize_undelivered(msg, false);
        }

        // expired request ids likewise
        for (_, req) in self.reqid_cache.drain_expired() {
            match req {
                PendingRequest::SmsMessage(msg) => self.finalize_undelivered(msg, false),
                PendingRequest::UserInfo(uin) => {
                    debug!(uin, "detailed info request expired");
                }
                PendingRequest::Search => debug!("search request expired"),
            }
        }

        // idle or stuck peers are dropped; their messages fall back to the
        // server path
        let expired: Vec<DcHandle> = self
            .directs
            .drain_expired()
            .into_iter()
            .map(|(h, dc)| {
                warn!(target: "icqlink::direct", peer = dc.remote_uin(), "direct connection timeout");
                self.put_back_for_teardown(h, dc)
            })
            .collect();
        for h in expired {
            self.teardown_direct(h, true).await;
        }

        // per-message ack timeouts on live peers retry via the server
        let mut retries = Vec::new();
        for (_, dc) in self.directs.iter_mut() {
            retries.extend(dc.drain_expired_messages());
        }
        for msg in retries {
            if let Some(c) = self.contacts.get_mut(msg.to) {
                c.direct = false;
            }
            let _ = self.send_via_server(msg).await;
        }
    }

    // drain_expired hands the value out; teardown_direct wants it back in
    // the table so one code path handles every teardown
    fn put_back_for_teardown(&mut self, h: DcHandle, dc: DirectClient) -> DcHandle {
        self.directs.insert(h, dc);
        h
    }

    // ==================================================================
    // Connection management
    // ==================================================================

    fn connect_authorizer(&mut self, state: ConnectionState) {
        info!("client connecting to {}:{}", self.cfg.authorizer_host, self.cfg.authorizer_port);
        self.server = Some(ServerConnection::connect(
            &self.cfg.authorizer_host,
            self.cfg.authorizer_port,
        ));
        let mut rng = rand::thread_rng();
        self.seq_num = rng.gen_range(0..0x8000);
        self.request_id = rng.gen_range(0..0x8000_0000);
        self.state = state;
    }

    fn connect_bos(&mut self) {
        info!("connecting to BOS server {}:{}", self.bos_host, self.bos_port);
        self.server = Some(ServerConnection::connect(&self.bos_host, self.bos_port));
        self.state = ConnectionState::BosAwaitingConnAck;
    }

    /// Tear down every socket, fail every pending delivery and emit the
    /// disconnect. Synchronous by design: nothing here can block.
    fn teardown(&mut self, reason: DisconnectReason) {
        info!("client disconnecting ({:?})", reason);
        self.server = None;
        self.listener = None;
        self.login_cookie = None;
        self.state = ConnectionState::NotConnected;

        // direct clients go down with their queues
        self.uin_to_dc.clear();
        for (_, mut dc) in self.directs.drain_all() {
            for msg in dc.take_undelivered() {
                self.finalize_undelivered(msg, true);
            }
        }
        for (_, msg) in self.cookie_cache.drain_all() {
            self.finalize_undelivered(msg, false);
        }
        for (_, req) in self.reqid_cache.drain_all() {
            if let PendingRequest::SmsMessage(msg) = req {
                self.finalize_undelivered(msg, false);
            }
        }

        self.push(ClientEvent::Disconnected(reason));

        if self.status != Status::Offline {
            self.status = Status::Offline;
            self.push(ClientEvent::MyStatusChange {
                status: Status::Offline,
                invisible: self.invisible,
            });
        }
        // every contact returns to offline
        let mut changes = Vec::new();
        for c in self.contacts.iter_mut() {
            if c.status != Status::Offline {
                let old_status = c.status;
                c.status = Status::Offline;
                changes.push((c.uin(), old_status));
            }
        }
        for (uin, old_status) in changes {
            self.push(ClientEvent::ContactList(ContactListEvent::StatusChange {
                uin,
                status: Status::Offline,
                old_status,
            }));
        }
    }

    // ==================================================================
    // Server I/O
    // ==================================================================

    async fn handle_server_readable(&mut self) {
        let outcome = match self.server.as_mut() {
            Some(server) => server.read_available(),
            None => return,
        };
        match outcome {
            Ok(ReadOutcome::Closed) => {
                warn!("server closed the connection");
                self.teardown(DisconnectReason::FailedLowlevel);
            }
            Ok(ReadOutcome::Data(_)) => self.parse_server_frames().await,
            Ok(ReadOutcome::WouldBlock) => {}
            Err(e) => {
                warn!("failed on recv: {}", e);
                self.teardown(DisconnectReason::FailedLowlevel);
            }
        }
    }

    async fn parse_server_frames(&mut self) {
        loop {
            let assembled = match self.server.as_mut() {
                Some(server) => server.assembler.next(),
                None => return,
            };
            match assembled {
                Assembled::Frame(frame) => {
                    trace!(
                        target: "icqlink::packet",
                        channel = frame.channel.as_u8(),
                        seq = frame.seq,
                        len = frame.body.len(),
                        "FLAP received"
                    );
                    self.dispatch_frame(frame).await;
                }
                Assembled::BadStart(byte) => {
                    warn!("invalid start byte 0x{:02x} on FLAP, flushing buffer", byte);
                    return;
                }
                Assembled::Incomplete => return,
            }
        }
    }

    async fn dispatch_frame(&mut self, mut frame: Frame) {
        match frame.channel {
            Channel::SignOn => self.handle_ch1(&mut frame.body).await,
            Channel::Snac => self.handle_ch2(&mut frame.body).await,
            Channel::Error => debug!("received packet on FLAP channel 3"),
            Channel::SignOff => self.handle_ch4(&mut frame.body),
            Channel::KeepAlive => {}
            Channel::Other(c) => warn!("FLAP on unrecognised channel 0x{:02x}", c),
        }
        if frame.body.before_end() {
            // parsers are expected to eat the whole frame; leftovers usually
            // mean a decoder bug
            warn!(
                "frame cursor not at end after parsing: 0x{:x} of 0x{:x}",
                frame.body.pos(),
                frame.body.len()
            );
        }
    }

    async fn handle_ch1(&mut self, b: &mut Buffer) {
        if b.remaining() == 4 {
            let _hello = b.read_u32_be();
            match self.state {
                ConnectionState::AuthAwaitingConnAck => {
                    info!("connection acknowledge from authorizer");
                    if self.send_login_auth_request().await.is_ok() {
                        self.state = ConnectionState::AuthAwaitingAuthReply;
                    }
                }
                ConnectionState::UinAwaitingConnAck => {
                    info!("connection acknowledge from authorizer (registration)");
                    if self.send_new_uin_request().await.is_ok() {
                        self.state = ConnectionState::UinAwaitingUinReply;
                    }
                }
                ConnectionState::BosAwaitingConnAck => {
                    info!("connection acknowledge from BOS server");
                    if self.send_login_cookie().await.is_ok() {
                        self.state = ConnectionState::BosAwaitingLoginReply;
                    }
                }
                _ => warn!("unexpected packet on channel 0x01"),
            }
        } else {
            b.advance(b.remaining());
            warn!("unknown packet received on channel 0x01");
        }
    }

    async fn handle_ch2(&mut self, b: &mut Buffer) {
        let frame = match snac::parse_snac(b, &self.translator) {
            Ok(f) => f,
            Err(e) => {
                warn!("problem parsing SNAC: {}", e);
                b.advance(b.remaining());
                return;
            }
        };
        self.dispatch_snac(frame).await;
    }

    fn handle_ch4(&mut self, b: &mut Buffer) {
        let set = tlv::TlvSet::parse(b);
        b.advance(b.remaining());

        if matches!(
            self.state,
            ConnectionState::AuthAwaitingAuthReply | ConnectionState::UinAwaitingUinReply
        ) {
            if set.contains(tlv::TLV_COOKIE) && set.contains(tlv::TLV_REDIRECT) {
                let redirect = set.get_string(tlv::TLV_REDIRECT).unwrap_or_default();
                let (host, port) = match redirect.rsplit_once(':') {
                    Some((h, p)) => (h.to_string(), p.trim().parse().unwrap_or(0)),
                    None => (redirect.clone(), 0),
                };
                info!("redirected to: {}:{}", host, port);

                self.bos_host = host;
                self.bos_port = match self.cfg.bos_override_port {
                    Some(p) => p,
                    None if port != 0 => port,
                    None => self.cfg.authorizer_port,
                };
                self.login_cookie = set.get(tlv::TLV_COOKIE).map(|v| v.to_vec());

                info!("authorisation accepted");
                self.server = None;
                self.connect_bos();
            } else {
                let reason = match set.get_u16(tlv::TLV_ERROR_CODE) {
                    Some(code) => {
                        warn!("error logging in, error code {}", code);
                        match code {
                            0x01 => DisconnectReason::FailedBadUsername,
                            0x02 | 0x18 => DisconnectReason::FailedTurboing,
                            0x03 => DisconnectReason::FailedBadPassword,
                            0x05 => DisconnectReason::FailedMismatchPasswd,
                            _ => DisconnectReason::FailedUnknown,
                        }
                    }
                    None if self.state == ConnectionState::AuthAwaitingAuthReply => {
                        warn!("error logging in, no error code given");
                        DisconnectReason::FailedUnknown
                    }
                    None => DisconnectReason::Requested,
                };
                self.teardown(reason);
            }
        } else {
            let reason = match set.get_u16(tlv::TLV_DISCONNECT_REASON) {
                Some(0x0001) => DisconnectReason::FailedDualLogin,
                Some(_) => DisconnectReason::FailedUnknown,
                None => {
                    warn!("unknown packet received on channel 4, disconnecting");
                    DisconnectReason::FailedUnknown
                }
            };
            self.teardown(reason);
        }
    }

    // ==================================================================
    // SNAC dispatch
    // ==================================================================

    async fn dispatch_snac(&mut self, frame: snac::SnacFrame) {
        match frame.body {
            SnacBody::ServerReady => {
                info!("received server ready");
                let _ = self.send_snac(&snac::generic::CapabilitiesSnac).await;
            }
            SnacBody::CapAck => {
                info!("received capabilities ack");
                let _ = self.send_snac(&snac::generic::RateInfoRequestSnac).await;
            }
            SnacBody::RateInfo => {
                info!("received rate information");
                let _ = self.finish_login().await;
            }
            SnacBody::Motd => {
                debug!("received message of the day");
            }
            SnacBody::UserInfo(info) => self.handle_self_info(info),
            SnacBody::RateInfoChange(change) => {
                self.push(ClientEvent::RateInfoChange(change));
            }
            SnacBody::BuddyOnline(info) => self.handle_buddy_online(info),
            SnacBody::BuddyOffline(info) => self.handle_buddy_offline(info),
            SnacBody::Message(msg) => self.handle_incoming_message(msg).await,
            SnacBody::MessageAck(ack) => self.handle_message_ack(ack),
            SnacBody::MessageSentOffline { screenname } => {
                debug!(screenname, "message stored offline by the server");
            }
            SnacBody::SblList(list) => self.handle_sbl_list(list),
            SnacBody::SblModificationAck(results) => {
                debug!(?results, "server list modification ack");
            }
            SnacBody::SblEditAccessGranted => {
                debug!("server list edit access granted");
            }
            SnacBody::SrvResponse(response) => {
                self.handle_srv_response(frame.request_id, response).await;
            }
            SnacBody::UinResponse { uin } => {
                info!(uin, "new UIN registered");
                self.push(ClientEvent::NewUin { uin, success: true });
            }
            SnacBody::UinRequestError => {
                warn!("UIN registration failed");
                self.push(ClientEvent::NewUin {
                    uin: 0,
                    success: false,
                });
            }
            SnacBody::Raw(raw) => {
                warn!(
                    "unknown SNAC received - family 0x{:04x} subtype 0x{:04x}",
                    raw.family, raw.subtype
                );
            }
        }
    }

    /// The post-rate-info login burst, ending in `BosLoggedIn`.
    async fn finish_login(&mut self) -> Result<()> {
        self.send_snac(&snac::generic::RateInfoAckSnac).await?;
        self.send_snac(&snac::generic::PersonalInfoRequestSnac)
            .await?;
        self.send_snac(&snac::icbm::AddIcbmParameterSnac).await?;
        self.send_snac(&snac::location::SetUserInfoSnac {
            capabilities: Capabilities::icq2000(),
        })
        .await?;

        // the listener starts now so its port can be advertised
        if self.cfg.accept_in_direct && self.listener.is_none() {
            match PeerListener::bind().await {
                Ok(l) => {
                    info!("listening for peer connections on port {}", l.port());
                    self.listener = Some(l);
                }
                Err(e) => warn!("could not open peer listener: {}", e),
            }
        }

        let screennames: Vec<String> = self
            .contacts
            .iter()
            .filter(|c| c.is_icq_contact())
            .map(|c| c.screenname())
            .collect();
        if !screennames.is_empty() {
            self.send_snac(&snac::buddy::AddBuddySnac { screennames })
                .await?;
        }

        let direct_details = self.listener.as_ref().map(|l| {
            let ip = self.server.as_ref().map(|s| s.local_ip()).unwrap_or(0);
            (ip, l.port())
        });
        let word = self.pending_status.icq_status_word(self.invisible);
        // the confirmed status comes back in our user info; keep Offline
        // until then so the change is observable
        self.status = Status::Offline;
        self.send_snac(&snac::generic::SetStatusSnac {
            status: word,
            direct_details,
        })
        .await?;

        self.send_snac(&snac::generic::ClientReadySnac).await?;
        self.send_snac(&snac::srv::OfflineRequestSnac { uin: self.cfg.uin })
            .await?;

        info!("logged in, sent contact list, status and client ready");
        self.state = ConnectionState::BosLoggedIn;
        self.push(ClientEvent::Connected);
        Ok(())
    }

    fn handle_self_info(&mut self, info: UserInfoBlock) {
        if info.uin() != self.cfg.uin {
            return;
        }
        if info.ext_ip != 0 && info.ext_ip != self.ext_ip {
            self.ext_ip = info.ext_ip;
            self.push(ClientEvent::MyUserInfoChange);
        }
        let status = Status::from_icq_status_word(info.status);
        if status != self.status {
            self.status = status;
            self.push(ClientEvent::MyStatusChange {
                status,
                invisible: Status::invisible_from_icq_status_word(info.status),
            });
        }
    }

    fn handle_buddy_online(&mut self, info: UserInfoBlock) {
        let uin = info.uin();
        let Some(c) = self.contacts.get_mut(uin) else {
            warn!(uin, "status change for user not on contact list");
            return;
        };
        let old_status = c.status;
        c.direct = true; // reset when a user comes (back) online
        c.status = Status::from_icq_status_word(info.status);
        c.invisible = Status::invisible_from_icq_status_word(info.status);
        c.ext_ip = info.ext_ip;
        c.ext_port = info.ext_port;
        c.lan_ip = info.lan_ip;
        c.lan_port = info.lan_port;
        c.tcp_version = info.tcp_version;
        let status = c.status;
        debug!(uin, %status, "buddy online");
        self.push(ClientEvent::ContactList(ContactListEvent::StatusChange {
            uin,
            status,
            old_status,
        }));
    }

    fn handle_buddy_offline(&mut self, info: UserInfoBlock) {
        let uin = info.uin();
        let Some(c) = self.contacts.get_mut(uin) else {
            warn!(uin, "status change for user not on contact list");
            return;
        };
        let old_status = c.status;
        c.status = Status::Offline;
        debug!(uin, "buddy offline");
        self.push(ClientEvent::ContactList(ContactListEvent::StatusChange {
            uin,
            status: Status::Offline,
            old_status,
        }));
    }

    fn handle_sbl_list(&mut self, list: snac::sbl::SblList) {
        for entry in list.entries {
            let uin = entry.uin;
            if !self.contacts.exists(uin) {
                let mut c = Contact::icq(uin);
                c.alias = entry.nickname.clone();
                c.server_based = true;
                c.group_id = entry.group_id;
                c.item_id = entry.item_id;
                c.auth_awaited = entry.auth_awaited;
                self.contacts.add(c);
                self.push(ClientEvent::ContactList(
                    ContactListEvent::ServerBasedContact { uin },
                ));
            } else if let Some(c) = self.contacts.get_mut(uin) {
                c.server_based = true;
                c.group_id = entry.group_id;
                c.item_id = entry.item_id;
            }
        }
    }

    // ==================================================================
    // Inbound messages
    // ==================================================================

    async fn handle_incoming_message(&mut self, msg: snac::icbm::MessageSnac) {
        let source = msg.source_uin();
        let advanced = msg.is_advanced();

        // advanced messages carry the sender's status word
        if advanced {
            if let Some(c) = self.contacts.get_mut(source) {
                c.status = Status::from_icq_status_word(msg.subtype.status);
                c.invisible = Status::invisible_from_icq_status_word(msg.subtype.status);
            }
        }

        if let IcqSubType::AwayRequest { .. } = msg.subtype.kind {
            // answered with our away message, no event emitted
            let _ = self.send_advanced_ack(&msg).await;
            return;
        }

        let incoming = match self.incoming_from_subtype(source, &msg.subtype.kind, None) {
            Some(ev) => ev,
            None => return,
        };

        if advanced {
            let _ = self.send_advanced_ack(&msg).await;
        }
        self.deliver_incoming(incoming);
    }

    /// Convert a decoded subtype into the event form, resolving the contact
    /// (lazily created for strangers and unknown mobiles).
    fn incoming_from_subtype(
        &mut self,
        source: u32,
        kind: &IcqSubType,
        time: Option<u64>,
    ) -> Option<IncomingMessage> {
        let (from, kind) = match kind {
            IcqSubType::Normal {
                message,
                multi,
                foreground,
                background,
            } => (
                self.lookup_icq(source),
                IncomingKind::Normal {
                    message: message.clone(),
                    multi: *multi,
                    foreground: *foreground,
                    background: *background,
                },
            ),
            IcqSubType::Url { message, url } => (
                self.lookup_icq(source),
                IncomingKind::Url {
                    message: message.clone(),
                    url: url.clone(),
                },
            ),
            IcqSubType::Sms(SmsPayload::Message(sms)) => (
                self.lookup_mobile(&sms.sender),
                IncomingKind::Sms {
                    message: sms.text.clone(),
                    source: sms.source.clone(),
                    senders_network: sms.senders_network.clone(),
                    time: sms.time.clone(),
                },
            ),
            IcqSubType::Sms(SmsPayload::Receipt(rcpt)) => (
                self.lookup_mobile(&rcpt.destination),
                IncomingKind::SmsReceipt {
                    message: rcpt.text.clone(),
                    message_id: rcpt.message_id.clone(),
                    destination: rcpt.destination.clone(),
                    delivered: rcpt.delivered,
                    submission_time: rcpt.submission_time.clone(),
                    delivery_time: rcpt.delivery_time.clone(),
                },
            ),
            IcqSubType::AuthReq {
                nick,
                first_name,
                last_name,
                email,
                message,
            } => (
                self.lookup_icq(source),
                IncomingKind::AuthReq {
                    nick: nick.clone(),
                    first_name: first_name.clone(),
                    last_name: last_name.clone(),
                    email: email.clone(),
                    message: message.clone(),
                },
            ),
            IcqSubType::AuthAcc => (
                self.lookup_icq(source),
                IncomingKind::AuthAck {
                    granted: true,
                    message: String::new(),
                },
            ),
            IcqSubType::AuthRej { message } => (
                self.lookup_icq(source),
                IncomingKind::AuthAck {
                    granted: false,
                    message: message.clone(),
                },
            ),
            IcqSubType::UserAdd => (self.lookup_icq(source), IncomingKind::UserAdd),
            IcqSubType::EmailEx { .. } | IcqSubType::WebPager { .. } => {
                debug!(source, "opaque message subtype ignored");
                return None;
            }
            IcqSubType::AwayRequest { .. } | IcqSubType::Sms(_) => return None,
        };
        Some(IncomingMessage { from, time, kind })
    }

    fn deliver_incoming(&mut self, ev: IncomingMessage) {
        let queued = match self.contacts.get_mut(ev.from) {
            Some(c) => {
                c.push_pending(ev.clone());
                true
            }
            None => false,
        };
        if queued {
            self.push(ClientEvent::ContactList(
                ContactListEvent::MessageQueueChanged { uin: ev.from },
            ));
        }
        self.push(ClientEvent::Message(ev));
    }

    async fn send_advanced_ack(&mut self, msg: &snac::icbm::MessageSnac) -> Result<()> {
        let (accept_status, _) = direct::accept_verdict(self.status);
        let away = if self.status == Status::Online {
            String::new()
        } else {
            self.away_message.clone()
        };
        info!("sending advanced message ack");
        self.send_snac(&snac::icbm::MsgAckOutSnac {
            cookie: msg.cookie,
            screenname: self.cfg.uin.to_string(),
            subtype: &msg.subtype.kind,
            accept_status,
            away_message: &away,
        })
        .await
    }

    fn handle_message_ack(&mut self, ack: snac::icbm::MessageAckSnac) {
        let Some(message) = self.cookie_cache.remove(&ack.cookie) else {
            warn!("received ACK for unknown message");
            return;
        };

        let away_message = match &ack.subtype.kind {
            IcqSubType::AwayRequest { message, .. } => message.clone(),
            IcqSubType::Normal { message, .. } => message.clone(),
            IcqSubType::Url { message, .. } => message.clone(),
            _ => String::new(),
        };

        let (delivered, failure, peer_status) = match ack.subtype.status {
            accept::ONLINE => (true, None, None),
            accept::AWAY => (true, None, Some(Status::Away)),
            accept::NA => (true, None, Some(Status::NotAvailable)),
            accept::OCCUPIED_ACCEPT => (true, None, Some(Status::Occupied)),
            accept::OCCUPIED => (false, Some(DeliveryFailure::Occupied), Some(Status::Occupied)),
            accept::DND => (false, Some(DeliveryFailure::Dnd), Some(Status::DoNotDisturb)),
            accept::DENIED => (false, Some(DeliveryFailure::Denied), None),
            _ => (true, None, None),
        };
        if let Some(st) = peer_status {
            if let Some(c) = self.contacts.get_mut(message.to) {
                c.status = st;
            }
        }

        self.push(ClientEvent::MessageAck(MessageAck {
            message,
            delivered,
            direct: false,
            away_message,
            failure,
        }));
    }

    // ==================================================================
    // Server responses (family 0x15)
    // ==================================================================

    async fn handle_srv_response(&mut self, request_id: u32, response: snac::srv::SrvResponse) {
        use snac::srv::SrvResponse as R;
        match response {
            R::OfflineMessage {
                sender_uin,
                time,
                subtype,
            } => {
                if let Some(ev) =
                    self.incoming_from_subtype(sender_uin, &subtype.kind, Some(time))
                {
                    self.deliver_incoming(ev);
                }
            }
            R::OfflineMessagesComplete => {
                // server may now discard its copies
                let _ = self
                    .send_snac(&snac::srv::OfflineAckSnac { uin: self.cfg.uin })
                    .await;
            }
            R::SmsError => {
                warn!("SMS gateway reported an error");
            }
            R::SmsResponse(verdict) => self.handle_sms_response(request_id, verdict),
            R::SmsDeliveryReceipt(rcpt) => {
                let from = self.lookup_mobile(&rcpt.destination);
                self.deliver_incoming(IncomingMessage {
                    from,
                    time: None,
                    kind: IncomingKind::SmsReceipt {
                        message: rcpt.text,
                        message_id: rcpt.message_id,
                        destination: rcpt.destination,
                        delivered: rcpt.delivered,
                        submission_time: rcpt.submission_time,
                        delivery_time: rcpt.delivery_time,
                    },
                });
            }
            R::SimpleUserInfo(info) => {
                if matches!(
                    self.reqid_cache.get(&request_id),
                    Some(PendingRequest::Search)
                ) {
                    self.reqid_cache.remove(&request_id);
                    self.push(ClientEvent::SearchResult { info, last: true });
                } else if let Some(c) = self.contacts.get_mut(info.uin) {
                    c.alias = info.alias;
                    c.first_name = info.first_name;
                    c.last_name = info.last_name;
                    c.email = info.email;
                    c.auth_required = info.auth_required;
                    let uin = info.uin;
                    self.push(ClientEvent::ContactList(
                        ContactListEvent::UserInfoChange { uin },
                    ));
                }
            }
            R::SearchResult { info, last } => {
                if last {
                    self.reqid_cache.remove(&request_id);
                }
                self.push(ClientEvent::SearchResult { info, last });
            }
            R::MainHomeInfo(page) => self.apply_detail_page(request_id, |c| {
                c.alias = page.alias.clone();
                c.first_name = page.first_name.clone();
                c.last_name = page.last_name.clone();
                c.email = page.email.clone();
                c.main_home_info = page;
            }),
            R::HomepageInfo(page) => {
                self.apply_detail_page(request_id, |c| c.homepage_info = page)
            }
            R::EmailInfo(page) => self.apply_detail_page(request_id, |c| c.email_info = page),
            R::WorkInfo(page) => self.apply_detail_page(request_id, |c| c.work_info = page),
            R::AboutInfo(text) => self.apply_detail_page(request_id, |c| c.about = text),
            R::InterestInfo(page) => {
                self.apply_detail_page(request_id, |c| c.interest_info = page)
            }
            R::BackgroundInfo(page) => {
                self.apply_detail_page(request_id, |c| c.background_info = page)
            }
            R::UnknownPage => {}
        }
    }

    fn handle_sms_response(&mut self, request_id: u32, verdict: xml::SmsResponse) {
        let deliverable = verdict.deliverable;
        // the gateway always tacks on a DUPLEX RESPONSE failure; ignore it
        // and wait for the real verdict (or the timeout)
        if !deliverable && verdict.error_param == "DUPLEX RESPONSE" {
            return;
        }
        let Some(PendingRequest::SmsMessage(message)) = self.reqid_cache.remove(&request_id)
        else {
            warn!("SMS response for unknown request id");
            return;
        };
        self.push(ClientEvent::MessageAck(MessageAck {
            message,
            delivered: deliverable,
            direct: false,
            away_message: String::new(),
            failure: if deliverable {
                None
            } else {
                Some(DeliveryFailure::NotDelivered)
            },
        }));
    }

    fn apply_detail_page(&mut self, request_id: u32, apply: impl FnOnce(&mut Contact)) {
        let Some(PendingRequest::UserInfo(uin)) = self.reqid_cache.get(&request_id) else {
            warn!("user info response for unknown request id");
            return;
        };
        let uin = *uin;
        if let Some(c) = self.contacts.get_mut(uin) {
            apply(c);
            self.push(ClientEvent::ContactList(
                ContactListEvent::UserInfoChange { uin },
            ));
        }
    }

    // ==================================================================
    // Outbound routing
    // ==================================================================

    async fn try_send_direct(&mut self, msg: &OutgoingMessage) -> bool {
        if !self.cfg.use_out_direct {
            return false;
        }
        let Some(c) = self.contacts.get(msg.to) else {
            return false;
        };
        if !c.direct || !c.is_icq_contact() {
            return false;
        }

        let h = match self.uin_to_dc.get(&msg.to).copied() {
            Some(h) => h,
            None => {
                // when NATed, only peers behind our own masquerade box are
                // reachable on their LAN address
                if c.ext_ip != c.lan_ip && self.ext_ip != c.ext_ip {
                    return false;
                }
                if c.lan_ip == 0 {
                    return false;
                }
                let (uin, lan_ip, lan_port, version) =
                    (c.uin(), c.lan_ip, c.lan_port, c.tcp_version);
                let server_port = self.listener.as_ref().map(|l| l.port()).unwrap_or(0);
                info!(peer = uin, "establishing direct connection");
                match DirectClient::outgoing(
                    uin,
                    lan_ip,
                    lan_port,
                    version,
                    self.cfg.uin,
                    self.ext_ip,
                    server_port,
                ) {
                    Ok(dc) => {
                        let h = self.alloc_direct(dc);
                        self.uin_to_dc.insert(uin, h);
                        h
                    }
                    Err(e) => {
                        warn!("direct connection not possible: {}", e);
                        return false;
                    }
                }
            }
        };

        let result = {
            let ctx = DcContext {
                translator: &self.translator,
                contacts: &self.contacts,
                status: self.status,
                invisible: self.invisible,
                away_message: &self.away_message,
            };
            match self.directs.get_mut(&h) {
                Some(dc) => dc.send_event(msg.clone(), &ctx).await,
                None => return false,
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("direct send failed: {}", e);
                self.teardown_direct(h, false).await;
                false
            }
        }
    }

    async fn send_via_server(&mut self, msg: OutgoingMessage) -> Result<()> {
        if self.state != ConnectionState::BosLoggedIn || self.status == Status::Offline {
            self.finalize_undelivered(msg, false);
            return Ok(());
        }

        let Some(c) = self.contacts.get_mut(msg.to) else {
            self.finalize_undelivered(msg, false);
            return Ok(());
        };
        let accepts_advanced = c.accepts_advanced_msgs();
        let screenname = c.screenname();
        let seqnum = c.next_seqnum();
        let mobile_no = c.mobile_no().to_string();
        let contact_status = c.status;
        let own_status = self.status.icq_status_word(self.invisible);

        match &msg.content {
            MessageContent::Normal { .. } | MessageContent::Url { .. } => {
                let kind = outgoing_kind(&msg, contact_status);
                if accepts_advanced {
                    // the cookie must be outstanding before the bytes hit
                    // the wire, or a fast ACK races the bookkeeping
                    let cookie = self.generate_unique_cookie();
                    self.cookie_cache.insert(cookie, msg);
                    self.send_snac(&snac::icbm::MsgSendSnac {
                        cookie,
                        dest_screenname: screenname,
                        source_uin: self.cfg.uin,
                        advanced: true,
                        seqnum,
                        status: own_status,
                        subtype: &kind,
                    })
                    .await?;
                } else {
                    self.send_snac(&snac::icbm::MsgSendSnac {
                        cookie: IcbmCookie::generate(),
                        dest_screenname: screenname,
                        source_uin: self.cfg.uin,
                        advanced: false,
                        seqnum: 0,
                        status: 0,
                        subtype: &kind,
                    })
                    .await?;
                    // best-effort: no ACK will ever come for basic sends
                    self.push(ClientEvent::MessageAck(MessageAck {
                        message: msg,
                        delivered: true,
                        direct: false,
                        away_message: String::new(),
                        failure: None,
                    }));
                }
            }
            MessageContent::AwayRequest => {
                if accepts_advanced {
                    let cookie = self.generate_unique_cookie();
                    let kind = outgoing_kind(&msg, contact_status);
                    self.cookie_cache.insert(cookie, msg);
                    self.send_snac(&snac::icbm::MsgSendSnac {
                        cookie,
                        dest_screenname: screenname,
                        source_uin: self.cfg.uin,
                        advanced: true,
                        seqnum,
                        status: own_status,
                        subtype: &kind,
                    })
                    .await?;
                } else {
                    // old clients cannot be probed through the server
                    self.finalize_undelivered(msg, false);
                }
            }
            MessageContent::AuthReq { .. } | MessageContent::AuthResponse { .. } => {
                let kind = outgoing_kind(&msg, contact_status);
                self.send_snac(&snac::icbm::MsgSendSnac {
                    cookie: IcbmCookie::generate(),
                    dest_screenname: screenname,
                    source_uin: self.cfg.uin,
                    advanced: false,
                    seqnum: 0,
                    status: 0,
                    subtype: &kind,
                })
                .await?;
                self.push(ClientEvent::MessageAck(MessageAck {
                    message: msg,
                    delivered: true,
                    direct: false,
                    away_message: String::new(),
                    failure: None,
                }));
            }
            MessageContent::Sms {
                message,
                delivery_receipt,
            } => {
                if mobile_no.is_empty() {
                    self.finalize_undelivered(msg, false);
                    return Ok(());
                }
                let request_id = self.next_request_id();
                let now = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let sms = snac::srv::SmsSendSnac {
                    source_uin: self.cfg.uin,
                    senders_name: self.cfg.uin.to_string(),
                    destination: mobile_no,
                    text: message.clone(),
                    delivery_receipt: *delivery_receipt,
                    time: snac::srv::gateway_timestamp(now),
                    request_id,
                };
                self.send_snac_with_id(&sms, request_id).await?;
                self.reqid_cache
                    .insert(request_id, PendingRequest::SmsMessage(msg));
            }
        }
        Ok(())
    }

    fn finalize_undelivered(&mut self, message: OutgoingMessage, direct: bool) {
        self.push(ClientEvent::MessageAck(MessageAck {
            message,
            delivered: false,
            direct,
            away_message: String::new(),
            failure: Some(DeliveryFailure::NotDelivered),
        }));
    }

    fn generate_unique_cookie(&self) -> IcbmCookie {
        loop {
            let c = IcbmCookie::generate();
            if !self.cookie_cache.contains(&c) {
                return c;
            }
        }
    }

    // ==================================================================
    // Direct connections
    // ==================================================================

    fn alloc_direct(&mut self, dc: DirectClient) -> DcHandle {
        let h = self.next_dc_handle;
        self.next_dc_handle += 1;
        self.directs.insert(h, dc);
        h
    }

    fn handle_incoming_direct(&mut self, stream: TcpStream) {
        if !self.cfg.accept_in_direct {
            return;
        }
        let server_port = self.listener.as_ref().map(|l| l.port()).unwrap_or(0);
        debug!(target: "icqlink::direct", "accepted inbound peer connection");
        let dc = DirectClient::incoming(stream, self.cfg.uin, self.ext_ip, server_port);
        self.alloc_direct(dc);
    }

    async fn handle_direct_readable(&mut self, h: DcHandle) {
        let result = {
            let ctx = DcContext {
                translator: &self.translator,
                contacts: &self.contacts,
                status: self.status,
                invisible: self.invisible,
                away_message: &self.away_message,
            };
            match self.directs.get_mut(&h) {
                Some(dc) => dc.on_readable(&ctx).await,
                None => return,
            }
        };
        match result {
            Ok(events) => {
                for ev in events {
                    self.process_dc_event(h, ev);
                }
            }
            Err(e) => {
                warn!(target: "icqlink::direct", "direct connection dropped: {}", e);
                self.teardown_direct(h, true).await;
            }
        }
    }

    fn process_dc_event(&mut self, h: DcHandle, ev: DcEvent) {
        match ev {
            DcEvent::Connected => {
                // established peers only idle out after ten minutes
                self.directs.set_timeout(&h, ESTABLISHED_DC_TIMEOUT);
                if let Some(dc) = self.directs.get(&h) {
                    self.uin_to_dc.insert(dc.remote_uin(), h);
                }
            }
            DcEvent::Message(frame) => {
                let uin = match self.directs.get(&h) {
                    Some(dc) => dc.remote_uin(),
                    None => return,
                };
                if let Some(c) = self.contacts.get_mut(uin) {
                    c.status = Status::from_icq_status_word(frame.status);
                }
                if let Some(ev) = self.incoming_from_subtype(uin, &frame.kind, None) {
                    self.deliver_incoming(ev);
                }
            }
            DcEvent::Ack {
                message,
                away_message,
            } => {
                self.push(ClientEvent::MessageAck(MessageAck {
                    message,
                    delivered: true,
                    direct: true,
                    away_message,
                    failure: None,
                }));
            }
        }
    }

    /// Drop one peer connection; optionally redeliver its messages through
    /// the server.
    async fn teardown_direct(&mut self, h: DcHandle, retry_via_server: bool) {
        let Some(mut dc) = self.directs.remove(&h) else {
            return;
        };
        let uin = dc.remote_uin();
        if self.uin_to_dc.get(&uin) == Some(&h) {
            self.uin_to_dc.remove(&uin);
        }
        let undelivered = dc.take_undelivered();
        drop(dc);

        if retry_via_server && self.contacts.exists(uin) {
            if let Some(c) = self.contacts.get_mut(uin) {
                c.direct = false;
            }
            for msg in undelivered {
                let _ = self.send_via_server(msg).await;
            }
        } else {
            for msg in undelivered {
                self.finalize_undelivered(msg, true);
            }
        }
    }

    // ==================================================================
    // Contact resolution
    // ==================================================================

    /// Contact for a UIN, created on first reference.
    fn lookup_icq(&mut self, uin: u32) -> u32 {
        if !self.contacts.exists(uin) {
            self.contacts.add(Contact::icq(uin));
            self.push(ClientEvent::ContactList(ContactListEvent::UserAdded {
                uin,
            }));
        }
        uin
    }

    /// Contact for a mobile number, created on first reference.
    fn lookup_mobile(&mut self, number: &str) -> u32 {
        if let Some(uin) = self.contacts.lookup_mobile(number) {
            return uin;
        }
        let pseudo = self.contacts.next_pseudo_uin();
        self.contacts.add(Contact::mobile(pseudo, number, number));
        self.push(ClientEvent::ContactList(ContactListEvent::UserAdded {
            uin: pseudo,
        }));
        pseudo
    }

    // ==================================================================
    // Low-level sending
    // ==================================================================

    fn next_seq(&mut self) -> u16 {
        self.seq_num = self.seq_num.wrapping_add(1) & 0x7fff;
        self.seq_num
    }

    fn next_request_id(&mut self) -> u32 {
        self.request_id = self.request_id.wrapping_add(1) & 0x7fff_ffff;
        self.request_id
    }

    async fn send_frame(&mut self, channel: Channel, body: &[u8]) -> Result<()> {
        let mut b = Buffer::new();
        let marker = flap::begin_frame(&mut b, channel, self.next_seq());
        b.write_bytes(body);
        flap::finish_frame(&mut b, marker);

        trace!(
            target: "icqlink::packet",
            channel = channel.as_u8(),
            len = b.len(),
            "FLAP sent"
        );
        let Some(server) = self.server.as_mut() else {
            return Err(Error::NotConnected);
        };
        if let Err(e) = server.send(b.as_slice()).await {
            warn!("failed to send: {}", e);
            self.teardown(DisconnectReason::FailedLowlevel);
            return Err(e.into());
        }
        self.last_send = Instant::now();
        Ok(())
    }

    async fn send_snac<S: OutSnac>(&mut self, s: &S) -> Result<()> {
        let request_id = self.next_request_id();
        self.send_snac_with_id(s, request_id).await
    }

    async fn send_snac_with_id<S: OutSnac>(&mut self, s: &S, request_id: u32) -> Result<()> {
        let mut body = Buffer::new();
        s.write(&mut body, request_id, &self.translator);
        self.send_frame(Channel::Snac, body.as_slice()).await
    }

    async fn send_login_auth_request(&mut self) -> Result<()> {
        let mut b = Buffer::new();
        b.write_u32_be(0x00000001);

        tlv::write_tlv_str(&mut b, tlv::TLV_SCREENNAME, &self.cfg.uin.to_string());

        let masked: Vec<u8> = self
            .cfg
            .password
            .bytes()
            .enumerate()
            .map(|(i, c)| c ^ PASSWORD_XOR[i % 16])
            .collect();
        tlv::write_tlv(&mut b, tlv::TLV_PASSWORD, &masked);

        tlv::write_tlv_str(&mut b, tlv::TLV_CLIENT_PROFILE, CLIENT_PROFILE);
        tlv::write_tlv_u16(&mut b, tlv::TLV_CLIENT_TYPE, 266);
        tlv::write_tlv_u16(&mut b, tlv::TLV_CLIENT_VERSION_MAJOR, 4);
        tlv::write_tlv_u16(&mut b, tlv::TLV_CLIENT_VERSION_MINOR, 63);
        tlv::write_tlv_u16(&mut b, tlv::TLV_CLIENT_ICQ_NUMBER, 1);
        tlv::write_tlv_u16(&mut b, tlv::TLV_CLIENT_BUILD_MAJOR, 3279);
        tlv::write_tlv_u32(&mut b, tlv::TLV_CLIENT_BUILD_MINOR, 85);
        tlv::write_tlv_str(&mut b, tlv::TLV_LANGUAGE, "en");
        tlv::write_tlv_str(&mut b, tlv::TLV_COUNTRY_CODE, "us");

        info!("sending authorisation request");
        self.send_frame(Channel::SignOn, b.as_slice()).await
    }

    async fn send_new_uin_request(&mut self) -> Result<()> {
        let mut hello = Buffer::new();
        hello.write_u32_be(0x00000001);
        self.send_frame(Channel::SignOn, hello.as_slice()).await?;

        info!("sending new UIN request");
        self.send_snac(&snac::uin::UinRequestSnac {
            password: self.cfg.password.clone(),
        })
        .await
    }

    async fn send_login_cookie(&mut self) -> Result<()> {
        let cookie = self.login_cookie.clone().unwrap_or_default();
        let mut b = Buffer::new();
        b.write_u32_be(0x00000001);
        tlv::write_tlv(&mut b, tlv::TLV_COOKIE, &cookie);
        info!("sending login cookie");
        self.send_frame(Channel::SignOn, b.as_slice()).await
    }

    fn push(&mut self, ev: ClientEvent) {
        self.queue.push_back(ev);
    }
}

/// Build the wire subtype of an outbound message for the server path.
fn outgoing_kind(msg: &OutgoingMessage, contact_status: Status) -> IcqSubType {
    match &msg.content {
        MessageContent::Normal {
            message,
            foreground,
            background,
        } => IcqSubType::Normal {
            message: message.clone(),
            multi: false,
            foreground: *foreground,
            background: *background,
        },
        MessageContent::Url { message, url } => IcqSubType::Url {
            message: message.clone(),
            url: url.clone(),
        },
        MessageContent::AwayRequest => IcqSubType::AwayRequest {
            probe: contact_status,
            message: String::new(),
        },
        MessageContent::AuthReq { message } => IcqSubType::AuthReq {
            nick: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
            message: message.clone(),
        },
        MessageContent::AuthResponse { granted, message } => {
            if *granted {
                IcqSubType::AuthAcc
            } else {
                IcqSubType::AuthRej {
                    message: message.clone(),
                }
            }
        }
        MessageContent::Sms { .. } => {
            // SMS never reaches the subtype path
            IcqSubType::UserAdd
        }
    }
}

/// Owned event stream over a client, for `tokio_stream` composition.
///
/// ```ignore
/// use tokio_stream::StreamExt;
///
/// let mut events = client.into_events();
/// while let Some(ev) = events.next().await {
///     println!("{:?}", ev);
/// }
/// ```
pub struct EventStream {
    fut: std::pin::Pin<Box<dyn std::future::Future<Output = (Client, ClientEvent)> + Send>>,
}

async fn advance(mut client: Client) -> (Client, ClientEvent) {
    let ev = client.next_event().await;
    (client, ev)
}

impl Client {
    /// Consume the client into a `Stream` of events.
    pub fn into_events(self) -> EventStream {
        EventStream {
            fut: Box::pin(advance(self)),
        }
    }
}

impl tokio_stream::Stream for EventStream {
    type Item = ClientEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        match self.fut.as_mut().poll(cx) {
            Poll::Ready((client, ev)) => {
                self.fut = Box::pin(advance(client));
                Poll::Ready(Some(ev))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_tlv_masking() {
        // "abc" masked with the sign-on table
        let masked: Vec<u8> = b"abc"
            .iter()
            .enumerate()
            .map(|(i, c)| c ^ PASSWORD_XOR[i % 16])
            .collect();
        assert_eq!(masked, vec![0x92, 0x44, 0xe2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seq_and_request_id_masks() {
        let mut client = Client::new(ClientConfig::new(1, "pw"));
        client.seq_num = 0x7fff;
        assert_eq!(client.next_seq(), 0x0000);
        client.request_id = 0x7fff_ffff;
        assert_eq!(client.next_request_id(), 0x0000_0000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absorb_pending_empties_queue() {
        let mut client = Client::new(ClientConfig::new(1, "pw"));
        client.contacts.add(Contact::icq(99));
        let ev = IncomingMessage {
            from: 99,
            time: None,
            kind: IncomingKind::UserAdd,
        };
        client.deliver_incoming(ev);
        assert_eq!(client.contacts.get(99).unwrap().pending_count(), 1);

        let drained = client.absorb_pending(99);
        assert_eq!(drained.len(), 1);
        assert_eq!(client.contacts.get(99).unwrap().pending_count(), 0);
    }
}
