//! Message family (0x0004): inbound messages, sends and acknowledgements.
//!
//! Messages arrive on three ICBM channels: 1 carries plain AIM-style text,
//! 2 carries advanced (acknowledged) ICQ subtypes, 4 carries basic ICQ
//! subtypes. The nesting is TLVs inside TLVs; the payload proper is an
//! [`IcqSubType`].

use crate::oscar::buffer::Buffer;
use crate::oscar::caps::Capabilities;
use crate::oscar::cookie::IcbmCookie;
use crate::oscar::error::{Error, Result};
use crate::oscar::subtype::{IcqSubType, SubTypeFrame, SubTypeWrite};
use crate::oscar::tlv;
use crate::oscar::translator::Translator;
use crate::oscar::userinfo::UserInfoBlock;

use super::{FAM_ICBM, OutSnac};

pub const ERROR: u16 = 0x0001;
pub const ADD_ICBM_PARAMETER: u16 = 0x0002;
pub const SEND: u16 = 0x0006;
pub const MESSAGE: u16 = 0x0007;
pub const MESSAGE_ACK: u16 = 0x000b;
pub const SENT_OFFLINE: u16 = 0x000c;

/// ICBM channel carrying plain text fragments.
pub const CHANNEL_PLAIN: u16 = 0x0001;
/// ICBM channel carrying advanced ICQ subtypes.
pub const CHANNEL_ADVANCED: u16 = 0x0002;
/// ICBM channel carrying basic ICQ subtypes.
pub const CHANNEL_BASIC: u16 = 0x0004;

/// Install our ICBM parameters (message sizes, rate warnings).
pub struct AddIcbmParameterSnac;

impl OutSnac for AddIcbmParameterSnac {
    const FAMILY: u16 = FAM_ICBM;
    const SUBTYPE: u16 = ADD_ICBM_PARAMETER;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        b.write_u16_be(0x0001); // channel
        b.write_u32_be(0x00000003); // flags
        b.write_u16_be(0x1f40); // max message snac size
        b.write_u16_be(0x03e7); // max sender warning level
        b.write_u16_be(0x03e7); // max receiver warning level
        b.write_u32_be(0x00000000); // minimum message interval
    }
}

/// Outbound message send (subtype 0x06).
pub struct MsgSendSnac<'a> {
    /// Fresh ICBM cookie (tracked in the cookie cache for advanced sends).
    pub cookie: IcbmCookie,
    /// Destination screen name (decimal UIN).
    pub dest_screenname: String,
    /// Our UIN, embedded in basic sends.
    pub source_uin: u32,
    /// Send on the advanced (acknowledged) channel.
    pub advanced: bool,
    /// Per-contact sequence number, advanced only.
    pub seqnum: u16,
    /// Own status word, advanced only.
    pub status: u16,
    /// The payload.
    pub subtype: &'a IcqSubType,
}

impl OutSnac for MsgSendSnac<'_> {
    const FAMILY: u16 = FAM_ICBM;
    const SUBTYPE: u16 = SEND;

    fn write_body(&self, b: &mut Buffer, tr: &Translator) {
        self.cookie.write(b);
        b.write_u16_be(if self.advanced {
            CHANNEL_ADVANCED
        } else {
            CHANNEL_BASIC
        });
        b.write_str8(self.dest_screenname.as_bytes());

        if self.advanced {
            b.write_u16_be(tlv::TLV_ADV_MSG_DATA);
            let tlv_mark = b.mark_u16_be();
            b.write_u16_be(0x0000); // message request
            self.cookie.write(b);
            Capabilities::icq2000().write_first_guid(b);

            b.write_u16_be(tlv::TLV_ADV_MSG_BODY);
            let body_mark = b.mark_u16_be();
            b.write_bytes(&[0u8; 27]);
            b.write_u16_le(self.seqnum);
            b.write_u16_le(0x000e);
            b.write_u16_le(self.seqnum);
            b.write_bytes(&[0u8; 12]);
            self.subtype.write(
                b,
                SubTypeWrite {
                    advanced: true,
                    ack: false,
                    status: self.status,
                    away_message: "",
                },
                tr,
            );
            b.patch_size(body_mark);
            b.patch_size(tlv_mark);
        } else {
            b.write_u16_be(tlv::TLV_ICQ_DATA);
            let tlv_mark = b.mark_u16_be();
            b.write_u32_le(self.source_uin);
            self.subtype.write(
                b,
                SubTypeWrite {
                    advanced: false,
                    ack: false,
                    status: 0,
                    away_message: "",
                },
                tr,
            );
            b.patch_size(tlv_mark);
        }
    }
}

/// Decoded inbound message (subtype 0x07).
#[derive(Debug)]
pub struct MessageSnac {
    /// ICBM cookie, echoed in the advanced ACK.
    pub cookie: IcbmCookie,
    /// ICBM channel the message arrived on.
    pub channel: u16,
    /// Sender user-info block.
    pub userinfo: UserInfoBlock,
    /// Decoded subtype.
    pub subtype: SubTypeFrame,
    /// Sequence number, advanced channel only.
    pub seqnum: u16,
}

impl MessageSnac {
    /// Source UIN: basic subtypes embed it, otherwise the sender block has it.
    pub fn source_uin(&self) -> u32 {
        self.userinfo.uin()
    }

    /// True when the sender expects an advanced ACK.
    pub fn is_advanced(&self) -> bool {
        self.channel == CHANNEL_ADVANCED
    }

    /// Parse the message body.
    pub fn parse(b: &mut Buffer, tr: &Translator) -> Result<Self> {
        let cookie = IcbmCookie::parse(b);
        let channel = b.read_u16_be();
        let userinfo = UserInfoBlock::parse(b);

        let (subtype, seqnum) = match channel {
            CHANNEL_PLAIN => (parse_plain_channel(b, tr)?, 0),
            CHANNEL_ADVANCED => parse_advanced_channel(b, tr)?,
            CHANNEL_BASIC => (parse_basic_channel(b, tr)?, 0),
            other => {
                return Err(Error::parse(format!(
                    "message on unhandled ICBM channel {}",
                    other
                )))
            }
        };

        Ok(MessageSnac {
            cookie,
            channel,
            userinfo,
            subtype,
            seqnum,
        })
    }
}

fn parse_plain_channel(b: &mut Buffer, tr: &Translator) -> Result<SubTypeFrame> {
    let set = tlv::TlvSet::parse(b);
    let data = set
        .get(tlv::TLV_MESSAGE_DATA)
        .ok_or_else(|| Error::parse("plain message without message-data TLV"))?;

    // fragments inside: TLV 0x0501 (features), TLV 0x0101 (text)
    let mut inner = Buffer::from_bytes(data);
    let frags = tlv::TlvSet::parse(&mut inner);
    let text = frags
        .get(tlv::TLV_MESSAGE_TEXT)
        .ok_or_else(|| Error::parse("plain message without text fragment"))?;
    if text.len() < 4 {
        return Err(Error::Truncated {
            expected: 4,
            actual: text.len(),
        });
    }
    // two charset words, then the text
    let message = tr.decode(&text[4..]);
    Ok(SubTypeFrame {
        flags: 0,
        status: 0,
        ack_flags: 0x0001,
        kind: IcqSubType::Normal {
            message,
            multi: false,
            foreground: 0x00000000,
            background: 0x00ffffff,
        },
    })
}

fn parse_advanced_channel(b: &mut Buffer, tr: &Translator) -> Result<(SubTypeFrame, u16)> {
    let set = tlv::TlvSet::parse(b);
    let data = set
        .get(tlv::TLV_ADV_MSG_DATA)
        .ok_or_else(|| Error::parse("advanced message without data TLV"))?;

    let mut inner = Buffer::from_bytes(data);
    inner.advance(2); // message type word
    inner.advance(8); // cookie again
    inner.advance(16); // a capability

    let frags = tlv::TlvSet::parse(&mut inner);
    let body = frags
        .get(tlv::TLV_ADV_MSG_BODY)
        .ok_or_else(|| Error::parse("no advanced message body TLV in message SNAC"))?;

    let mut body = Buffer::from_bytes(body);
    body.advance(27);
    let seqnum = body.read_u16_le();
    let kind_word = body.read_u16_le();
    let _seqnum_again = body.read_u16_le();
    // 0x000e for messages, 0x0012 for the odd status queries some clients
    // push through the server; those are dropped after parsing
    if kind_word != 0x000e && kind_word != 0x0012 {
        return Err(Error::parse(format!(
            "unknown server-message kind 0x{:04x}",
            kind_word
        )));
    }
    body.advance(12);

    let frame = IcqSubType::parse(&mut body, true, tr)?;
    if kind_word == 0x0012 {
        return Err(Error::parse("dropping status-query pseudo message"));
    }
    Ok((frame, seqnum))
}

fn parse_basic_channel(b: &mut Buffer, tr: &Translator) -> Result<SubTypeFrame> {
    let set = tlv::TlvSet::parse(b);
    let data = set
        .get(tlv::TLV_ICQ_DATA)
        .ok_or_else(|| Error::parse("basic message without ICQ-data TLV"))?;

    let mut inner = Buffer::from_bytes(data);
    // Intel byte ordering from here on; SMS uses the magic UIN 1002
    let _uin = inner.read_u32_le();
    IcqSubType::parse(&mut inner, false, tr)
}

/// Advanced-message acknowledgement (subtype 0x0b), both directions.
#[derive(Debug)]
pub struct MessageAckSnac {
    /// Cookie of the message being acknowledged.
    pub cookie: IcbmCookie,
    /// Screen name of the acknowledging side.
    pub screenname: String,
    /// Echoed subtype; its status word carries the accept-status and its
    /// message field the away text.
    pub subtype: SubTypeFrame,
}

impl MessageAckSnac {
    /// Parse an inbound acknowledgement.
    pub fn parse(b: &mut Buffer, tr: &Translator) -> Result<Self> {
        let cookie = IcbmCookie::parse(b);
        let _channel = b.read_u16_be();
        let screenname = String::from_utf8_lossy(&b.read_str8()).into_owned();
        let _reason = b.read_u16_be();
        let subtype = IcqSubType::parse(b, true, tr)?;
        Ok(MessageAckSnac {
            cookie,
            screenname,
            subtype,
        })
    }
}

/// Outbound advanced-message acknowledgement.
pub struct MsgAckOutSnac<'a> {
    /// Cookie echoed from the inbound message.
    pub cookie: IcbmCookie,
    /// Our screen name.
    pub screenname: String,
    /// Subtype echoed from the inbound message.
    pub subtype: &'a IcqSubType,
    /// Accept-status to report.
    pub accept_status: u16,
    /// Away text when not plainly online.
    pub away_message: &'a str,
}

impl OutSnac for MsgAckOutSnac<'_> {
    const FAMILY: u16 = FAM_ICBM;
    const SUBTYPE: u16 = MESSAGE_ACK;

    fn write_body(&self, b: &mut Buffer, tr: &Translator) {
        self.cookie.write(b);
        b.write_u16_be(CHANNEL_ADVANCED);
        b.write_str8(self.screenname.as_bytes());
        b.write_u16_be(0x0003);
        self.subtype.write(
            b,
            SubTypeWrite {
                advanced: true,
                ack: true,
                status: self.accept_status,
                away_message: self.away_message,
            },
            tr,
        );
    }
}

/// Parse a sent-offline notification (subtype 0x0c).
pub fn parse_sent_offline(b: &mut Buffer) -> String {
    let _cookie = IcbmCookie::parse(b);
    let _channel = b.read_u16_be();
    let screenname = String::from_utf8_lossy(&b.read_str8()).into_owned();
    b.advance(b.remaining());
    screenname
}
