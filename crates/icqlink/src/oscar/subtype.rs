//! ICQ message subtypes: the payload variants bundled into message SNACs
//! and direct packets.
//!
//! Every variant is one tagged case of [`IcqSubType`]; the same codec serves
//! the server path (basic and advanced) and the peer-to-peer path (always
//! advanced). ICQ payloads are little-endian throughout — the byte-order
//! switch relative to the OSCAR framing happens at the container boundary,
//! not here.

use super::buffer::Buffer;
use super::error::{Error, Result};
use super::status::Status;
use super::translator::Translator;
use super::xml;

// Message type bytes.
pub const MSG_TYPE_NORMAL: u8 = 0x01;
pub const MSG_TYPE_URL: u8 = 0x04;
pub const MSG_TYPE_AUTH_REQ: u8 = 0x06;
pub const MSG_TYPE_AUTH_REJ: u8 = 0x07;
pub const MSG_TYPE_AUTH_ACC: u8 = 0x08;
pub const MSG_TYPE_USER_ADD: u8 = 0x0c;
pub const MSG_TYPE_WEB_PAGER: u8 = 0x0d;
pub const MSG_TYPE_EMAIL_EX: u8 = 0x0e;
pub const MSG_TYPE_SMS: u8 = 0x1a;

pub const MSG_TYPE_AUTOREQ_AWAY: u8 = 0xe8;
pub const MSG_TYPE_AUTOREQ_OCC: u8 = 0xe9;
pub const MSG_TYPE_AUTOREQ_NA: u8 = 0xea;
pub const MSG_TYPE_AUTOREQ_DND: u8 = 0xeb;
pub const MSG_TYPE_AUTOREQ_FFC: u8 = 0xec;

// Flag bytes.
pub const MSG_FLAG_AUTOREQ: u8 = 0x03;
pub const MSG_FLAG_MULTI: u8 = 0x80;

/// SMS payload: either a message from the gateway or a delivery receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmsPayload {
    /// A message relayed from a mobile.
    Message(xml::SmsMessage),
    /// A delivery receipt for an SMS we sent.
    Receipt(xml::SmsReceipt),
}

/// One ICQ message subtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcqSubType {
    /// Plain text message.
    Normal {
        message: String,
        multi: bool,
        foreground: u32,
        background: u32,
    },
    /// Message plus a URL.
    Url { message: String, url: String },
    /// SMS gateway traffic.
    Sms(SmsPayload),
    /// Authorization request.
    AuthReq {
        nick: String,
        first_name: String,
        last_name: String,
        email: String,
        message: String,
    },
    /// Authorization granted.
    AuthAcc,
    /// Authorization refused.
    AuthRej { message: String },
    /// "You were added" notification.
    UserAdd,
    /// Email-express message; carried opaquely.
    EmailEx { raw: Vec<u8> },
    /// Web-pager message; carried opaquely.
    WebPager { raw: Vec<u8> },
    /// Away/auto-message probe for the given status (also the shape of its
    /// acknowledgement, whose message field carries the away text).
    AwayRequest { probe: Status, message: String },
}

/// A decoded subtype plus its envelope words.
#[derive(Debug, Clone)]
pub struct SubTypeFrame {
    /// Flag byte from the wire.
    pub flags: u8,
    /// First advanced word: sender status (requests) or accept-status (ACKs).
    pub status: u16,
    /// Second advanced word: 0 for ACKs, 1 for requests.
    pub ack_flags: u16,
    /// The payload.
    pub kind: IcqSubType,
}

impl SubTypeFrame {
    /// True when this frame is an acknowledgement.
    pub fn is_ack(&self) -> bool {
        self.ack_flags == 0x0000
    }
}

/// Envelope controls for writing a subtype.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubTypeWrite<'a> {
    /// Advanced form (status/ack words, colors).
    pub advanced: bool,
    /// Write as an acknowledgement of an inbound message.
    pub ack: bool,
    /// Status word: own status (requests) or accept-status (ACKs).
    pub status: u16,
    /// Away text to carry in an ACK (empty when online).
    pub away_message: &'a str,
}

impl IcqSubType {
    /// Wire type byte.
    pub fn msg_type(&self) -> u8 {
        match self {
            IcqSubType::Normal { .. } => MSG_TYPE_NORMAL,
            IcqSubType::Url { .. } => MSG_TYPE_URL,
            IcqSubType::Sms(_) => MSG_TYPE_SMS,
            IcqSubType::AuthReq { .. } => MSG_TYPE_AUTH_REQ,
            IcqSubType::AuthAcc => MSG_TYPE_AUTH_ACC,
            IcqSubType::AuthRej { .. } => MSG_TYPE_AUTH_REJ,
            IcqSubType::UserAdd => MSG_TYPE_USER_ADD,
            IcqSubType::EmailEx { .. } => MSG_TYPE_EMAIL_EX,
            IcqSubType::WebPager { .. } => MSG_TYPE_WEB_PAGER,
            IcqSubType::AwayRequest { probe, .. } => match probe {
                Status::Occupied => MSG_TYPE_AUTOREQ_OCC,
                Status::NotAvailable => MSG_TYPE_AUTOREQ_NA,
                Status::DoNotDisturb => MSG_TYPE_AUTOREQ_DND,
                Status::FreeForChat => MSG_TYPE_AUTOREQ_FFC,
                _ => MSG_TYPE_AUTOREQ_AWAY,
            },
        }
    }

    /// Wire flag byte.
    pub fn flags(&self) -> u8 {
        match self {
            IcqSubType::AwayRequest { .. } => MSG_FLAG_AUTOREQ,
            IcqSubType::Normal { multi: true, .. } => MSG_FLAG_MULTI,
            _ => 0x00,
        }
    }

    /// Parse a subtype at the buffer cursor.
    pub fn parse(b: &mut Buffer, advanced: bool, tr: &Translator) -> Result<SubTypeFrame> {
        let msg_type = b.read_u8();
        let flags = b.read_u8();
        let (status, ack_flags) = if advanced {
            (b.read_u16_le(), b.read_u16_le())
        } else {
            (0, 0x0001)
        };

        let kind = match msg_type {
            MSG_TYPE_NORMAL => {
                let message = tr.decode(&b.read_str16_null_le());
                let (foreground, background) = if advanced {
                    (b.read_u32_le(), b.read_u32_le())
                } else {
                    (0x00000000, 0x00ffffff)
                };
                IcqSubType::Normal {
                    message,
                    multi: flags & MSG_FLAG_MULTI != 0,
                    foreground,
                    background,
                }
            }
            MSG_TYPE_URL => {
                let text = b.read_str16_null_le();
                // format is [message] 0xFE [url]
                let (message, url) = match text.iter().position(|&c| c == 0xfe) {
                    Some(i) => (tr.decode(&text[..i]), tr.decode(&text[i + 1..])),
                    None => (tr.decode(&text), String::new()),
                };
                IcqSubType::Url { message, url }
            }
            MSG_TYPE_SMS => IcqSubType::Sms(parse_sms(b)?),
            MSG_TYPE_AUTH_REQ => {
                let nick = tr.decode(&b.read_str16_null_le());
                b.advance(1);
                let first_name = tr.decode(&b.read_str16_null_le());
                b.advance(1);
                let last_name = tr.decode(&b.read_str16_null_le());
                b.advance(1);
                let email = tr.decode(&b.read_str16_null_le());
                b.advance(3);
                let message = tr.decode(&b.read_str16_null_le());
                IcqSubType::AuthReq {
                    nick,
                    first_name,
                    last_name,
                    email,
                    message,
                }
            }
            MSG_TYPE_AUTH_ACC => IcqSubType::AuthAcc,
            MSG_TYPE_AUTH_REJ => IcqSubType::AuthRej {
                message: tr.decode(&b.read_str16_null_le()),
            },
            MSG_TYPE_USER_ADD => IcqSubType::UserAdd,
            MSG_TYPE_EMAIL_EX => IcqSubType::EmailEx {
                raw: b.read_bytes(b.remaining()),
            },
            MSG_TYPE_WEB_PAGER => IcqSubType::WebPager {
                raw: b.read_bytes(b.remaining()),
            },
            MSG_TYPE_AUTOREQ_AWAY | MSG_TYPE_AUTOREQ_OCC | MSG_TYPE_AUTOREQ_NA
            | MSG_TYPE_AUTOREQ_DND | MSG_TYPE_AUTOREQ_FFC => {
                let probe = match msg_type {
                    MSG_TYPE_AUTOREQ_OCC => Status::Occupied,
                    MSG_TYPE_AUTOREQ_NA => Status::NotAvailable,
                    MSG_TYPE_AUTOREQ_DND => Status::DoNotDisturb,
                    MSG_TYPE_AUTOREQ_FFC => Status::FreeForChat,
                    _ => Status::Away,
                };
                IcqSubType::AwayRequest {
                    probe,
                    message: tr.decode(&b.read_str16_null_le()),
                }
            }
            other => {
                return Err(Error::parse(format!(
                    "unknown ICQ subtype 0x{:02x}",
                    other
                )))
            }
        };

        Ok(SubTypeFrame {
            flags,
            status,
            ack_flags,
            kind,
        })
    }

    /// Write the subtype with its envelope.
    pub fn write(&self, b: &mut Buffer, w: SubTypeWrite<'_>, tr: &Translator) {
        b.write_u8(self.msg_type());
        b.write_u8(self.flags());
        if w.advanced {
            b.write_u16_le(w.status);
            b.write_u16_le(if w.ack { 0x0000 } else { 0x0001 });
        }

        match self {
            IcqSubType::Normal {
                message,
                foreground,
                background,
                ..
            } => {
                if w.ack {
                    b.write_str16_null_le(&tr.encode(w.away_message));
                } else {
                    b.write_str16_null_le(&tr.encode(message));
                }
                if w.advanced {
                    if w.ack {
                        b.write_u32_le(0x00000000);
                        b.write_u32_le(0xffffffff);
                    } else {
                        b.write_u32_le(*foreground);
                        b.write_u32_le(*background);
                    }
                }
            }
            IcqSubType::Url { message, url } => {
                if w.ack {
                    b.write_str16_null_le(&tr.encode(w.away_message));
                } else {
                    let mut text = tr.encode(message);
                    text.push(0xfe);
                    text.extend_from_slice(url.as_bytes());
                    b.write_str16_null_le(&text);
                }
            }
            IcqSubType::Sms(_) => {
                // SMS rides family 21, never a message subtype on the way out
            }
            IcqSubType::AuthReq { message, .. } => {
                b.write_str16_null_le(&tr.encode(message));
            }
            IcqSubType::AuthAcc | IcqSubType::UserAdd => {}
            IcqSubType::AuthRej { message } => {
                b.write_str16_null_le(&tr.encode(message));
            }
            IcqSubType::EmailEx { raw } | IcqSubType::WebPager { raw } => {
                b.write_bytes(raw);
            }
            IcqSubType::AwayRequest { .. } => {
                if w.ack {
                    b.write_str16_null_le(&tr.encode(w.away_message));
                } else {
                    // probes carry an empty message
                    b.write_u16_le(0x0001);
                    b.write_u8(0x00);
                }
            }
        }
    }
}

fn parse_sms(b: &mut Buffer) -> Result<SmsPayload> {
    // 21 bytes of opaque gateway header
    b.advance(21);

    // delivery status: 0 = message, 2/3 = receipt
    let delivery_status = b.read_u16_le();
    let receipt = match delivery_status {
        0x0000 => false,
        0x0002 | 0x0003 => true,
        other => {
            return Err(Error::parse(format!(
                "unknown SMS delivery status 0x{:04x}",
                other
            )))
        }
    };

    let tag = b.read_str32_le();
    if tag != b"ICQSMS\0" {
        return Err(Error::parse(format!(
            "unknown SMS tag string: {}",
            String::from_utf8_lossy(&tag)
        )));
    }

    b.advance(3);
    let _total_len = b.read_u32_le();
    let xml_raw = b.read_str32_le();
    let doc = String::from_utf8_lossy(&xml_raw);
    let doc = doc.trim_end_matches('\0');

    if receipt {
        Ok(SmsPayload::Receipt(xml::parse_sms_receipt(doc)?))
    } else {
        Ok(SmsPayload::Message(xml::parse_sms_message(doc)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tr() -> Translator {
        Translator::new()
    }

    fn round_trip(kind: &IcqSubType, advanced: bool) -> SubTypeFrame {
        let mut b = Buffer::new();
        kind.write(
            &mut b,
            SubTypeWrite {
                advanced,
                ack: false,
                status: 0,
                away_message: "",
            },
            &tr(),
        );
        let mut rb = Buffer::from_bytes(b.as_slice());
        let frame = IcqSubType::parse(&mut rb, advanced, &tr()).unwrap();
        assert!(!rb.before_end(), "codec left bytes behind");
        frame
    }

    #[test]
    fn test_normal_round_trip() {
        let kind = IcqSubType::Normal {
            message: "hello world".into(),
            multi: false,
            foreground: 0x00112233,
            background: 0x00ffffff,
        };
        assert_eq!(round_trip(&kind, true).kind, kind);

        // basic form drops the colors and restores the defaults
        let basic = round_trip(&kind, false).kind;
        match basic {
            IcqSubType::Normal {
                message,
                foreground,
                background,
                ..
            } => {
                assert_eq!(message, "hello world");
                assert_eq!(foreground, 0x00000000);
                assert_eq!(background, 0x00ffffff);
            }
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_url_round_trip() {
        let kind = IcqSubType::Url {
            message: "check this".into(),
            url: "http://example.com/".into(),
        };
        assert_eq!(round_trip(&kind, true).kind, kind);
        assert_eq!(round_trip(&kind, false).kind, kind);
    }

    #[test]
    fn test_url_without_separator() {
        let mut b = Buffer::new();
        b.write_u8(MSG_TYPE_URL);
        b.write_u8(0);
        b.write_str16_null_le(b"no separator here");
        let mut rb = Buffer::from_bytes(b.as_slice());
        let f = IcqSubType::parse(&mut rb, false, &tr()).unwrap();
        assert_eq!(
            f.kind,
            IcqSubType::Url {
                message: "no separator here".into(),
                url: String::new()
            }
        );
    }

    #[test]
    fn test_auth_round_trips() {
        for kind in [
            IcqSubType::AuthRej {
                message: "no thanks".into(),
            },
            IcqSubType::AuthAcc,
        ] {
            assert_eq!(round_trip(&kind, false).kind, kind);
            assert_eq!(round_trip(&kind, true).kind, kind);
        }
    }

    #[test]
    fn test_away_request_and_ack() {
        let kind = IcqSubType::AwayRequest {
            probe: Status::NotAvailable,
            message: String::new(),
        };
        let f = round_trip(&kind, true);
        assert_eq!(f.flags, MSG_FLAG_AUTOREQ);
        assert!(!f.is_ack());

        // the ACK carries the away text
        let mut b = Buffer::new();
        kind.write(
            &mut b,
            SubTypeWrite {
                advanced: true,
                ack: true,
                status: crate::oscar::status::accept::NA,
                away_message: "gone fishing",
            },
            &tr(),
        );
        let mut rb = Buffer::from_bytes(b.as_slice());
        let ack = IcqSubType::parse(&mut rb, true, &tr()).unwrap();
        assert!(ack.is_ack());
        assert_eq!(ack.status, crate::oscar::status::accept::NA);
        match ack.kind {
            IcqSubType::AwayRequest { probe, message } => {
                assert_eq!(probe, Status::NotAvailable);
                assert_eq!(message, "gone fishing");
            }
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_sms_parse() {
        let xml = "<sms_message><text>ping</text><sender>+4479</sender></sms_message>";
        let mut b = Buffer::new();
        b.write_u8(MSG_TYPE_SMS);
        b.write_u8(0);
        b.write_bytes(&[0u8; 21]);
        b.write_u16_le(0x0000);
        let tag = b"ICQSMS\0";
        b.write_u32_le(tag.len() as u32);
        b.write_bytes(tag);
        b.write_bytes(&[0u8; 3]);
        b.write_u32_le(xml.len() as u32 + 5);
        b.write_u32_le(xml.len() as u32 + 1);
        b.write_bytes(xml.as_bytes());
        b.write_u8(0);

        let mut rb = Buffer::from_bytes(b.as_slice());
        let f = IcqSubType::parse(&mut rb, false, &tr()).unwrap();
        match f.kind {
            IcqSubType::Sms(SmsPayload::Message(m)) => {
                assert_eq!(m.text, "ping");
                assert_eq!(m.sender, "+4479");
            }
            other => panic!("wrong kind: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut b = Buffer::from_bytes(&[0x55, 0x00]);
        assert!(IcqSubType::parse(&mut b, false, &tr()).is_err());
    }
}
