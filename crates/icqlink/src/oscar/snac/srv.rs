//! ICQ-specific server family (0x0015): the generic carrier the service
//! hacked every ICQ extension into.
//!
//! Offline messages, SMS, and the user-info/whitepage lookups all ride the
//! same send subtype and come back on the same response subtype; exchanges
//! are told apart by command words and the SNAC request id.

use crate::oscar::buffer::Buffer;
use crate::oscar::error::{Error, Result};
use crate::oscar::subtype::{IcqSubType, SubTypeFrame};
use crate::oscar::translator::Translator;
use crate::oscar::userinfo::{
    BackgroundInfo, EmailInfo, HomepageInfo, MainHomeInfo, PersonalInterestInfo, WorkInfo,
};
use crate::oscar::xml;

use super::{FAM_SRV, OutSnac};

pub const SEND: u16 = 0x0002;
pub const RESPONSE: u16 = 0x0003;

// Command words inside the send/response wrapper.
const CMD_OFFLINE_REQUEST: u16 = 60;
const CMD_OFFLINE_ACK: u16 = 62;
const CMD_OFFLINE_MESSAGE: u16 = 65;
const CMD_OFFLINE_DONE: u16 = 66;
const CMD_ICQ_REQUEST: u16 = 2000;
const CMD_ICQ_RESPONSE: u16 = 2010;

// Response sub-commands of CMD_ICQ_RESPONSE.
const RSP_SMS_ERROR: u16 = 0x0001;
const RSP_SMS: u16 = 100;
const RSP_SMS_DONE: u16 = 150;
const RSP_SIMPLE_UI: u16 = 0x0190;
const RSP_SIMPLE_UI_DONE: u16 = 0x019a;
const RSP_SEARCH_UI: u16 = 0x01a4;
const RSP_SEARCH_UI_DONE: u16 = 0x01ae;
const RSP_MAIN_HOME_INFO: u16 = 0x00c8;
const RSP_WORK_INFO: u16 = 0x00d2;
const RSP_HOMEPAGE_INFO: u16 = 0x00dc;
const RSP_ABOUT_INFO: u16 = 0x00e6;
const RSP_EMAIL_INFO: u16 = 0x00eb;
const RSP_INTEREST_INFO: u16 = 0x00f0;
const RSP_BACKGROUND_INFO: u16 = 0x00fa;
const RSP_UNKNOWN_PAGE: u16 = 0x010e;

// Request sub-commands of CMD_ICQ_REQUEST.
const REQ_SIMPLE_UI: u16 = 1311;
const REQ_DETAILED_UI: u16 = 0x04b2;
const REQ_SMS: u16 = 0x8214;

/// Write the common wrapper and return after the command-specific body has
/// been appended by `body`.
fn write_wrapper(
    b: &mut Buffer,
    uin: u32,
    command: u16,
    request_id: u32,
    body: impl FnOnce(&mut Buffer),
) {
    b.write_u16_be(0x0001);
    let outer = b.mark_u16_be();
    let inner = b.mark_u16_le();
    b.write_u32_le(uin);
    b.write_u16_le(command);
    b.write_u16_le(request_id as u16);
    body(b);
    b.patch_size_le(inner);
    b.patch_size(outer);
}

/// Outbound SMS through the gateway.
pub struct SmsSendSnac {
    /// Our UIN.
    pub source_uin: u32,
    /// Sender name shown to the mobile.
    pub senders_name: String,
    /// Destination number in international format.
    pub destination: String,
    /// Message text.
    pub text: String,
    /// Ask the network for a delivery receipt.
    pub delivery_receipt: bool,
    /// RFC-1123-style timestamp embedded in the XML.
    pub time: String,
    /// Request id for response routing.
    pub request_id: u32,
}

impl OutSnac for SmsSendSnac {
    const FAMILY: u16 = FAM_SRV;
    const SUBTYPE: u16 = SEND;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        let doc = xml::build_sms_message(
            &self.destination,
            &self.text,
            self.source_uin,
            &self.senders_name,
            self.delivery_receipt,
            &self.time,
        );
        write_wrapper(b, self.source_uin, CMD_ICQ_REQUEST, self.request_id, |b| {
            b.write_u16_be(REQ_SMS);
            b.write_u16_be(0x0001);
            b.write_u16_be(0x0016);
            b.write_bytes(&[0u8; 16]);
            b.write_u32_be(doc.len() as u32 + 1);
            b.write_bytes(doc.as_bytes());
            b.write_u8(0x00);
        });
    }
}

/// Fetch messages stored while we were offline.
pub struct OfflineRequestSnac {
    /// Our UIN.
    pub uin: u32,
}

impl OutSnac for OfflineRequestSnac {
    const FAMILY: u16 = FAM_SRV;
    const SUBTYPE: u16 = SEND;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        write_wrapper(b, self.uin, CMD_OFFLINE_REQUEST, 0, |_| {});
    }
}

/// Tell the server the offline messages arrived and can be dropped.
pub struct OfflineAckSnac {
    /// Our UIN.
    pub uin: u32,
}

impl OutSnac for OfflineAckSnac {
    const FAMILY: u16 = FAM_SRV;
    const SUBTYPE: u16 = SEND;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        write_wrapper(b, self.uin, CMD_OFFLINE_ACK, 0, |_| {});
    }
}

/// Look up alias/name/email of one UIN.
pub struct SimpleUserInfoRequestSnac {
    /// Our UIN.
    pub source_uin: u32,
    /// UIN being queried.
    pub target_uin: u32,
    /// Request id for response routing.
    pub request_id: u32,
}

impl OutSnac for SimpleUserInfoRequestSnac {
    const FAMILY: u16 = FAM_SRV;
    const SUBTYPE: u16 = SEND;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        let target = self.target_uin;
        write_wrapper(b, self.source_uin, CMD_ICQ_REQUEST, self.request_id, |b| {
            b.write_u16_le(REQ_SIMPLE_UI);
            b.write_u32_le(target);
        });
    }
}

/// Request the full profile pages of one UIN.
pub struct DetailedUserInfoRequestSnac {
    /// Our UIN.
    pub source_uin: u32,
    /// UIN being queried.
    pub target_uin: u32,
    /// Request id for response routing.
    pub request_id: u32,
}

impl OutSnac for DetailedUserInfoRequestSnac {
    const FAMILY: u16 = FAM_SRV;
    const SUBTYPE: u16 = SEND;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        let target = self.target_uin;
        write_wrapper(b, self.source_uin, CMD_ICQ_REQUEST, self.request_id, |b| {
            b.write_u16_le(REQ_DETAILED_UI);
            b.write_u32_le(target);
        });
    }
}

/// Alias/name/email record of a lookup or search hit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SimpleUserInfo {
    pub uin: u32,
    pub alias: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub auth_required: bool,
    pub status: u8,
}

/// A decoded family-0x15 response.
#[derive(Debug)]
pub enum SrvResponse {
    /// A message stored while we were offline.
    OfflineMessage {
        /// Original sender.
        sender_uin: u32,
        /// Original send time, seconds since the epoch.
        time: u64,
        /// The stored message.
        subtype: SubTypeFrame,
    },
    /// All stored messages delivered.
    OfflineMessagesComplete,
    /// SMS gateway error.
    SmsError,
    /// Gateway verdict on an SMS we sent.
    SmsResponse(xml::SmsResponse),
    /// Delivery receipt relayed from the mobile network.
    SmsDeliveryReceipt(xml::SmsReceipt),
    /// Simple user-info lookup result.
    SimpleUserInfo(SimpleUserInfo),
    /// Whitepage search hit; `last` marks the final frame.
    SearchResult {
        info: SimpleUserInfo,
        last: bool,
    },
    /// Detailed profile pages.
    MainHomeInfo(MainHomeInfo),
    HomepageInfo(HomepageInfo),
    EmailInfo(EmailInfo),
    WorkInfo(WorkInfo),
    AboutInfo(String),
    InterestInfo(PersonalInterestInfo),
    BackgroundInfo(BackgroundInfo),
    /// A page we do not interpret.
    UnknownPage,
}

impl SrvResponse {
    /// Parse a response body.
    pub fn parse(b: &mut Buffer, tr: &Translator) -> Result<Self> {
        let _tlv_type = b.read_u16_be();
        let _tlv_len = b.read_u16_be();
        let _len = b.read_u16_le();
        let _uin = b.read_u32_le();
        let command = b.read_u16_le();
        let _request_word = b.read_u16_le();

        let response = match command {
            CMD_OFFLINE_MESSAGE => {
                let sender_uin = b.read_u32_le();
                let year = b.read_u16_le();
                let month = b.read_u8();
                let day = b.read_u8();
                let hour = b.read_u8();
                let minute = b.read_u8();
                let subtype = IcqSubType::parse(b, false, tr)?;
                b.advance(2);
                SrvResponse::OfflineMessage {
                    sender_uin,
                    time: epoch_from_civil(year, month, day, hour, minute),
                    subtype,
                }
            }
            CMD_OFFLINE_DONE => {
                b.advance(1);
                SrvResponse::OfflineMessagesComplete
            }
            CMD_ICQ_RESPONSE => Self::parse_icq_response(b, tr)?,
            other => {
                return Err(Error::parse(format!(
                    "unknown command {} in server response",
                    other
                )))
            }
        };
        b.advance(b.remaining());
        Ok(response)
    }

    fn parse_icq_response(b: &mut Buffer, tr: &Translator) -> Result<Self> {
        let sub = b.read_u16_le();
        match sub {
            RSP_SMS_ERROR => Ok(SrvResponse::SmsError),
            RSP_SMS | RSP_SMS_DONE => {
                b.advance(7);
                let _tag = b.read_str16();
                let doc_raw = b.read_str16();
                let doc = String::from_utf8_lossy(&doc_raw).into_owned();
                let doc = doc.trim_end_matches('\0');
                // mobile-originated receipts ride the same channel as the
                // gateway's own verdicts
                if xml::root_tag(doc) == Some("sms_delivery_receipt") {
                    Ok(SrvResponse::SmsDeliveryReceipt(xml::parse_sms_receipt(
                        doc,
                    )?))
                } else {
                    Ok(SrvResponse::SmsResponse(xml::parse_sms_response(doc)?))
                }
            }
            RSP_SIMPLE_UI | RSP_SIMPLE_UI_DONE => {
                Ok(SrvResponse::SimpleUserInfo(parse_simple_user_info(b, tr)))
            }
            RSP_SEARCH_UI | RSP_SEARCH_UI_DONE => Ok(SrvResponse::SearchResult {
                info: parse_simple_user_info(b, tr),
                last: sub == RSP_SEARCH_UI_DONE,
            }),
            RSP_MAIN_HOME_INFO => {
                b.advance(1); // status code
                let mut i = MainHomeInfo::default();
                i.alias = tr.decode(&b.read_str16_null_le());
                i.first_name = tr.decode(&b.read_str16_null_le());
                i.last_name = tr.decode(&b.read_str16_null_le());
                i.email = tr.decode(&b.read_str16_null_le());
                i.city = tr.decode(&b.read_str16_null_le());
                i.state = tr.decode(&b.read_str16_null_le());
                i.phone = tr.decode(&b.read_str16_null_le());
                i.fax = tr.decode(&b.read_str16_null_le());
                i.street = tr.decode(&b.read_str16_null_le());
                i.cellular = tr.decode(&b.read_str16_null_le());
                i.zip = tr.decode(&b.read_str16_null_le());
                i.country = b.read_u16_le();
                i.gmt_offset = b.read_u8();
                Ok(SrvResponse::MainHomeInfo(i))
            }
            RSP_HOMEPAGE_INFO => {
                b.advance(1);
                let mut i = HomepageInfo::default();
                i.age = b.read_u8();
                b.advance(1);
                i.sex = b.read_u8();
                i.homepage = tr.decode(&b.read_str16_null_le());
                i.birth_year = b.read_u16_le();
                i.birth_month = b.read_u8();
                i.birth_day = b.read_u8();
                i.lang1 = b.read_u8();
                i.lang2 = b.read_u8();
                i.lang3 = b.read_u8();
                Ok(SrvResponse::HomepageInfo(i))
            }
            RSP_EMAIL_INFO => {
                b.advance(1);
                let n = b.read_u8();
                let mut info = EmailInfo::default();
                for _ in 0..n {
                    info.emails.push(tr.decode(&b.read_str16_null_le()));
                }
                Ok(SrvResponse::EmailInfo(info))
            }
            RSP_WORK_INFO => {
                b.advance(1);
                let mut i = WorkInfo::default();
                i.city = tr.decode(&b.read_str16_null_le());
                i.state = tr.decode(&b.read_str16_null_le());
                let _ = b.read_str16_null_le();
                let _ = b.read_str16_null_le();
                i.street = tr.decode(&b.read_str16_null_le());
                i.zip = tr.decode(&b.read_str16_null_le());
                i.country = b.read_u16_le();
                i.company_name = tr.decode(&b.read_str16_null_le());
                i.company_dept = tr.decode(&b.read_str16_null_le());
                i.company_position = tr.decode(&b.read_str16_null_le());
                b.advance(2);
                i.company_web = tr.decode(&b.read_str16_null_le());
                Ok(SrvResponse::WorkInfo(i))
            }
            RSP_ABOUT_INFO => {
                b.advance(1);
                Ok(SrvResponse::AboutInfo(tr.decode(&b.read_str16_null_le())))
            }
            RSP_INTEREST_INFO => {
                b.advance(1);
                let n = b.read_u8();
                let mut info = PersonalInterestInfo::default();
                for _ in 0..n {
                    let cat = b.read_u16_le();
                    let text = tr.decode(&b.read_str16_null_le());
                    info.interests.push((cat, text));
                }
                Ok(SrvResponse::InterestInfo(info))
            }
            RSP_BACKGROUND_INFO => {
                b.advance(1);
                let n = b.read_u16_le();
                if n > 0 {
                    b.advance(1);
                }
                let mut info = BackgroundInfo::default();
                for _ in 0..3 {
                    info.schools.push(tr.decode(&b.read_str16_null_le()));
                }
                b.advance(1);
                Ok(SrvResponse::BackgroundInfo(info))
            }
            RSP_UNKNOWN_PAGE => {
                b.advance(3);
                Ok(SrvResponse::UnknownPage)
            }
            other => Err(Error::parse(format!(
                "unknown ICQ response sub-command 0x{:04x}",
                other
            ))),
        }
    }
}

fn parse_simple_user_info(b: &mut Buffer, tr: &Translator) -> SimpleUserInfo {
    b.advance(1); // status code
    b.advance(2); // unknown
    let uin = b.read_u32_le();
    let alias = tr.decode(&b.read_str16_null_le());
    let first_name = tr.decode(&b.read_str16_null_le());
    let last_name = tr.decode(&b.read_str16_null_le());
    let email = tr.decode(&b.read_str16_null_le());
    let auth_required = b.read_u8() == 0;
    let status = b.read_u8();
    b.advance(1);
    b.advance(4); // end marker
    SimpleUserInfo {
        uin,
        alias,
        first_name,
        last_name,
        email,
        auth_required,
        status,
    }
}

/// Days since 1970-01-01 for a civil date (proleptic Gregorian).
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m as i64 + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn epoch_from_civil(year: u16, month: u8, day: u8, hour: u8, minute: u8) -> u64 {
    if year == 0 {
        return 0;
    }
    let days = days_from_civil(year as i64, month.clamp(1, 12) as u32, day.clamp(1, 31) as u32);
    (days.max(0) as u64) * 86_400 + hour as u64 * 3_600 + minute as u64 * 60
}

/// Format an epoch timestamp the way the gateway expects
/// (`Wkd, DD Mnm YYYY HH:MM:SS GMT`).
pub fn gateway_timestamp(epoch_secs: u64) -> String {
    const WEEKDAYS: [&str; 7] = ["Thu", "Fri", "Sat", "Sun", "Mon", "Tue", "Wed"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let days = (epoch_secs / 86_400) as i64;
    let secs_of_day = epoch_secs % 86_400;

    // civil_from_days, inverse of days_from_civil
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        WEEKDAYS[(days.rem_euclid(7)) as usize],
        d,
        MONTHS[(m - 1) as usize],
        y,
        secs_of_day / 3_600,
        (secs_of_day / 60) % 60,
        secs_of_day % 60,
    )
}
