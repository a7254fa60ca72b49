//! Contact records.
//!
//! A contact is either a real ICQ user keyed by UIN or a mobile-only entry
//! keyed by a pseudo-UIN the list allocates downward from the top of the
//! range (negative when read as a signed value). The UIN is the sole
//! identity; everything else is mutable presence and profile state.

use super::events::IncomingMessage;
use super::status::Status;
use super::userinfo::{
    BackgroundInfo, EmailInfo, HomepageInfo, MainHomeInfo, PersonalInterestInfo, WorkInfo,
};

/// Strip everything but digits from a phone number.
pub fn normalize_mobile_no(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// A roster entry.
#[derive(Debug, Clone)]
pub struct Contact {
    uin: u32,
    icq_contact: bool,
    mobile_contact: bool,

    /// Display alias.
    pub alias: String,
    /// First name.
    pub first_name: String,
    /// Last name.
    pub last_name: String,
    /// Email address.
    pub email: String,
    mobile_no: String,

    /// Presence as last pushed by the server.
    pub status: Status,
    /// Invisible flag from the last status word.
    pub invisible: bool,
    /// Contact requires authorization before being added.
    pub auth_required: bool,
    /// Our stored-list entry still awaits the contact's authorization.
    pub auth_awaited: bool,

    /// Direct-connection protocol version (>= 7 accepts advanced messages).
    pub tcp_version: u8,
    /// External IP as seen by the server.
    pub ext_ip: u32,
    /// External port.
    pub ext_port: u16,
    /// Advertised LAN IP.
    pub lan_ip: u32,
    /// Advertised LAN port.
    pub lan_port: u16,
    /// Direct connections are worth attempting.
    pub direct: bool,

    /// Entry lives on the server-stored roster.
    pub server_based: bool,
    /// Server-stored group id.
    pub group_id: u16,
    /// Server-stored item id.
    pub item_id: u16,

    seqnum: u16,
    pending: Vec<IncomingMessage>,

    /// Main/home profile page.
    pub main_home_info: MainHomeInfo,
    /// Homepage profile page.
    pub homepage_info: HomepageInfo,
    /// Email list page.
    pub email_info: EmailInfo,
    /// Work page.
    pub work_info: WorkInfo,
    /// Background (schools) page.
    pub background_info: BackgroundInfo,
    /// Personal interests page.
    pub interest_info: PersonalInterestInfo,
    /// Free-text about page.
    pub about: String,
}

impl Contact {
    fn blank(uin: u32) -> Self {
        Contact {
            uin,
            icq_contact: true,
            mobile_contact: false,
            alias: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
            mobile_no: String::new(),
            status: Status::Offline,
            invisible: false,
            auth_required: false,
            auth_awaited: false,
            tcp_version: 0,
            ext_ip: 0,
            ext_port: 0,
            lan_ip: 0,
            lan_port: 0,
            direct: true,
            server_based: false,
            group_id: 0,
            item_id: 0,
            seqnum: 0xffff,
            pending: Vec::new(),
            main_home_info: MainHomeInfo::default(),
            homepage_info: HomepageInfo::default(),
            email_info: EmailInfo::default(),
            work_info: WorkInfo::default(),
            background_info: BackgroundInfo::default(),
            interest_info: PersonalInterestInfo::default(),
            about: String::new(),
        }
    }

    /// A real ICQ contact.
    pub fn icq(uin: u32) -> Self {
        let mut c = Self::blank(uin);
        c.alias = uin.to_string();
        c
    }

    /// A mobile-only contact under a pseudo-UIN.
    pub fn mobile(pseudo_uin: u32, alias: &str, mobile_no: &str) -> Self {
        let mut c = Self::blank(pseudo_uin);
        c.icq_contact = false;
        c.mobile_contact = true;
        c.alias = alias.to_string();
        c.mobile_no = normalize_mobile_no(mobile_no);
        c
    }

    /// The identity key. Never changes.
    pub fn uin(&self) -> u32 {
        self.uin
    }

    /// Decimal form used as the screen name on the wire.
    pub fn screenname(&self) -> String {
        self.uin.to_string()
    }

    /// True for real ICQ users (pseudo-UINs read negative as i32).
    pub fn is_icq_contact(&self) -> bool {
        self.icq_contact
    }

    /// True for mobile-only entries.
    pub fn is_mobile_contact(&self) -> bool {
        self.mobile_contact
    }

    /// Normalized mobile number.
    pub fn mobile_no(&self) -> &str {
        &self.mobile_no
    }

    /// Set and normalize the mobile number; the entry becomes SMS-capable.
    pub fn set_mobile_no(&mut self, raw: &str) {
        self.mobile_no = normalize_mobile_no(raw);
        self.mobile_contact = !self.mobile_no.is_empty();
    }

    /// Contact is online with a client speaking the advanced protocol.
    pub fn accepts_advanced_msgs(&self) -> bool {
        self.tcp_version >= 7 && self.status != Status::Offline
    }

    /// Next outgoing message sequence number, decrementing from 0xFFFF.
    pub fn next_seqnum(&mut self) -> u16 {
        let s = self.seqnum;
        self.seqnum = self.seqnum.wrapping_sub(1);
        s
    }

    /// Queue an undelivered inbound event.
    pub fn push_pending(&mut self, ev: IncomingMessage) {
        self.pending.push(ev);
    }

    /// Number of queued inbound events.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drain the queued inbound events, oldest first.
    pub fn drain_pending(&mut self) -> Vec<IncomingMessage> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_and_kind() {
        let c = Contact::icq(123456);
        assert_eq!(c.uin(), 123456);
        assert!(c.is_icq_contact());
        assert_eq!(c.screenname(), "123456");

        let m = Contact::mobile(0xffff_fffe, "mum", "+44 (7700) 900-123");
        assert!(!m.is_icq_contact());
        assert!(m.is_mobile_contact());
        assert_eq!(m.mobile_no(), "447700900123");
        assert!((m.uin() as i32) < 0);
    }

    #[test]
    fn test_seqnum_decrements_from_ffff() {
        let mut c = Contact::icq(1);
        assert_eq!(c.next_seqnum(), 0xffff);
        assert_eq!(c.next_seqnum(), 0xfffe);
    }

    #[test]
    fn test_advanced_requires_online_and_v7() {
        let mut c = Contact::icq(1);
        c.tcp_version = 7;
        assert!(!c.accepts_advanced_msgs());
        c.status = Status::Online;
        assert!(c.accepts_advanced_msgs());
        c.tcp_version = 6;
        assert!(!c.accepts_advanced_msgs());
    }
}
