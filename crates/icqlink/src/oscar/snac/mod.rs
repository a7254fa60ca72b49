//! SNAC codec: the subsystem/command frames carried on FLAP channel 2.
//!
//! Inbound frames dispatch on (family, subtype) into typed bodies; unknown
//! combinations survive as [`RawSnac`] so the orchestrator can log them.
//! Outbound frames implement [`OutSnac`] and get their header written around
//! the subtype-specific body.

pub mod bos;
pub mod buddy;
pub mod generic;
pub mod icbm;
pub mod location;
pub mod sbl;
pub mod srv;
pub mod uin;

use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::buffer::Buffer;
use super::error::Result;
use super::translator::Translator;
use super::userinfo::UserInfoBlock;

/// SNAC families spoken by this client.
pub const FAM_GENERIC: u16 = 0x0001;
pub const FAM_LOCATION: u16 = 0x0002;
pub const FAM_BUDDY: u16 = 0x0003;
pub const FAM_ICBM: u16 = 0x0004;
pub const FAM_BOS: u16 = 0x0009;
pub const FAM_SBL: u16 = 0x0013;
pub const FAM_SRV: u16 = 0x0015;
pub const FAM_UIN: u16 = 0x0017;

/// Size of the SNAC header.
pub const SNAC_HDRLEN: usize = 10;

/// SNAC frame header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct SnacHeader {
    /// Subsystem family.
    pub family: U16,
    /// Command within the family.
    pub subtype: U16,
    /// Flag bits; unused by this client.
    pub flags: U16,
    /// Request id echoed by matched responses.
    pub request_id: U32,
}

/// An outbound SNAC body.
pub trait OutSnac {
    /// Subsystem family.
    const FAMILY: u16;
    /// Command within the family.
    const SUBTYPE: u16;

    /// Write the subtype-specific body.
    fn write_body(&self, b: &mut Buffer, tr: &Translator);

    /// Write header plus body.
    fn write(&self, b: &mut Buffer, request_id: u32, tr: &Translator) {
        b.write_u16_be(Self::FAMILY);
        b.write_u16_be(Self::SUBTYPE);
        b.write_u16_be(0x0000);
        b.write_u32_be(request_id);
        self.write_body(b, tr);
    }
}

/// Preserved unknown SNAC.
#[derive(Debug, Clone)]
pub struct RawSnac {
    /// Family of the unknown frame.
    pub family: u16,
    /// Subtype of the unknown frame.
    pub subtype: u16,
    /// Unparsed body bytes.
    pub data: Vec<u8>,
}

/// Typed inbound SNAC bodies.
#[derive(Debug)]
pub enum SnacBody {
    // -- Generic (0x0001) --
    /// Server is ready for the login burst.
    ServerReady,
    /// Rate information; content acknowledged, not interpreted.
    RateInfo,
    /// Capabilities acknowledged.
    CapAck,
    /// Message of the day.
    Motd,
    /// Own user info.
    UserInfo(UserInfoBlock),
    /// Rate limit change notification.
    RateInfoChange(generic::RateInfoChange),

    // -- Buddy (0x0003) --
    /// A roster contact came online (or changed status).
    BuddyOnline(UserInfoBlock),
    /// A roster contact went offline.
    BuddyOffline(UserInfoBlock),

    // -- Messages (0x0004) --
    /// Inbound message.
    Message(icbm::MessageSnac),
    /// Acknowledgement for an advanced message we sent.
    MessageAck(icbm::MessageAckSnac),
    /// Our message was stored offline.
    MessageSentOffline {
        /// Destination screen name.
        screenname: String,
    },

    // -- Server-stored list (0x0013) --
    /// The server-side roster.
    SblList(sbl::SblList),
    /// Results of an edit batch.
    SblModificationAck(Vec<sbl::SblResult>),
    /// Edit access granted.
    SblEditAccessGranted,

    // -- ICQ-specific (0x0015) --
    /// A generic ICQ server response, dispatched by request id.
    SrvResponse(srv::SrvResponse),

    // -- Registration (0x0017) --
    /// New account created.
    UinResponse {
        /// The freshly allocated UIN.
        uin: u32,
    },
    /// Registration failed.
    UinRequestError,

    /// Anything we do not understand.
    Raw(RawSnac),
}

/// A decoded inbound SNAC.
#[derive(Debug)]
pub struct SnacFrame {
    /// Subsystem family.
    pub family: u16,
    /// Command within the family.
    pub subtype: u16,
    /// Header flag bits.
    pub flags: u16,
    /// Request id this frame responds to.
    pub request_id: u32,
    /// Decoded body.
    pub body: SnacBody,
}

/// Parse one SNAC frame out of a FLAP channel-2 body.
pub fn parse_snac(b: &mut Buffer, tr: &Translator) -> Result<SnacFrame> {
    let family = b.read_u16_be();
    let subtype = b.read_u16_be();
    let flags = b.read_u16_be();
    let request_id = b.read_u32_be();

    let body = match (family, subtype) {
        (FAM_GENERIC, generic::SRV_READY) => {
            b.advance(b.remaining());
            SnacBody::ServerReady
        }
        (FAM_GENERIC, generic::RATE_INFO) => {
            b.advance(b.remaining());
            SnacBody::RateInfo
        }
        (FAM_GENERIC, generic::CAP_ACK) => {
            b.advance(b.remaining());
            SnacBody::CapAck
        }
        (FAM_GENERIC, generic::MOTD) => {
            b.advance(b.remaining());
            SnacBody::Motd
        }
        (FAM_GENERIC, generic::USER_INFO) => SnacBody::UserInfo(UserInfoBlock::parse(b)),
        (FAM_GENERIC, generic::RATE_INFO_CHANGE) => {
            SnacBody::RateInfoChange(generic::RateInfoChange::parse(b))
        }
        (FAM_BUDDY, buddy::ONLINE) => SnacBody::BuddyOnline(UserInfoBlock::parse(b)),
        (FAM_BUDDY, buddy::OFFLINE) => SnacBody::BuddyOffline(UserInfoBlock::parse(b)),
        (FAM_ICBM, icbm::MESSAGE) => SnacBody::Message(icbm::MessageSnac::parse(b, tr)?),
        (FAM_ICBM, icbm::MESSAGE_ACK) => {
            SnacBody::MessageAck(icbm::MessageAckSnac::parse(b, tr)?)
        }
        (FAM_ICBM, icbm::SENT_OFFLINE) => SnacBody::MessageSentOffline {
            screenname: icbm::parse_sent_offline(b),
        },
        (FAM_SBL, sbl::LIST_FROM_SERVER) => SnacBody::SblList(sbl::SblList::parse(b)),
        (FAM_SBL, sbl::MODIFICATION_ACK) => {
            SnacBody::SblModificationAck(sbl::parse_modification_ack(b))
        }
        (FAM_SBL, sbl::EDIT_ACCESS_GRANTED) => {
            b.advance(b.remaining());
            SnacBody::SblEditAccessGranted
        }
        (FAM_SRV, srv::RESPONSE) => SnacBody::SrvResponse(srv::SrvResponse::parse(b, tr)?),
        (FAM_UIN, uin::RESPONSE) => SnacBody::UinResponse {
            uin: uin::parse_response(b),
        },
        (FAM_UIN, uin::REQUEST_ERROR) => {
            b.advance(b.remaining());
            SnacBody::UinRequestError
        }
        _ => {
            let data = b.read_bytes(b.remaining());
            SnacBody::Raw(RawSnac {
                family,
                subtype,
                data,
            })
        }
    };

    Ok(SnacFrame {
        family,
        subtype,
        flags,
        request_id,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_snac_preserved_raw() {
        let mut b = Buffer::new();
        b.write_u16_be(0x00f0);
        b.write_u16_be(0x0001);
        b.write_u16_be(0x0000);
        b.write_u32_be(42);
        b.write_bytes(&[1, 2, 3]);

        let frame = parse_snac(&mut Buffer::from_bytes(b.as_slice()), &Translator::new()).unwrap();
        assert_eq!(frame.family, 0x00f0);
        assert_eq!(frame.request_id, 42);
        match frame.body {
            SnacBody::Raw(raw) => assert_eq!(raw.data, vec![1, 2, 3]),
            other => panic!("expected raw snac, got {:?}", other),
        }
    }

    #[test]
    fn test_out_snac_header() {
        struct Empty;
        impl OutSnac for Empty {
            const FAMILY: u16 = FAM_GENERIC;
            const SUBTYPE: u16 = 0x0099;
            fn write_body(&self, _b: &mut Buffer, _tr: &Translator) {}
        }

        let mut b = Buffer::new();
        Empty.write(&mut b, 0x01020304, &Translator::new());
        assert_eq!(
            b.as_slice(),
            &[0x00, 0x01, 0x00, 0x99, 0x00, 0x00, 0x01, 0x02, 0x03, 0x04]
        );
    }
}
