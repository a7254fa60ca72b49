//! Generic service family (0x0001): session bring-up and self info.

use crate::oscar::buffer::Buffer;
use crate::oscar::tlv;
use crate::oscar::translator::Translator;

use super::{FAM_GENERIC, OutSnac};

pub const CLIENT_READY: u16 = 0x0002;
pub const SRV_READY: u16 = 0x0003;
pub const RATE_INFO_REQUEST: u16 = 0x0006;
pub const RATE_INFO: u16 = 0x0007;
pub const RATE_INFO_ACK: u16 = 0x0008;
pub const RATE_INFO_CHANGE: u16 = 0x000a;
pub const PERSONAL_INFO_REQUEST: u16 = 0x000e;
pub const USER_INFO: u16 = 0x000f;
pub const MOTD: u16 = 0x0013;
pub const CAPABILITIES: u16 = 0x0017;
pub const CAP_ACK: u16 = 0x0018;
pub const SET_STATUS: u16 = 0x001e;

/// (family, version, tool id, tool version) rows advertised at login.
const FAMILY_VERSIONS: [(u16, u16); 8] = [
    (0x0001, 0x0003),
    (0x0002, 0x0001),
    (0x0003, 0x0001),
    (0x0004, 0x0001),
    (0x0009, 0x0001),
    (0x0013, 0x0002),
    (0x0015, 0x0001),
    (0x0017, 0x0001),
];

/// Advertise the family versions we speak.
pub struct CapabilitiesSnac;

impl OutSnac for CapabilitiesSnac {
    const FAMILY: u16 = FAM_GENERIC;
    const SUBTYPE: u16 = CAPABILITIES;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        for (family, version) in FAMILY_VERSIONS {
            b.write_u16_be(family);
            b.write_u16_be(version);
        }
    }
}

/// Ask for the rate classes.
pub struct RateInfoRequestSnac;

impl OutSnac for RateInfoRequestSnac {
    const FAMILY: u16 = FAM_GENERIC;
    const SUBTYPE: u16 = RATE_INFO_REQUEST;

    fn write_body(&self, _b: &mut Buffer, _tr: &Translator) {}
}

/// Accept the five standard rate classes.
pub struct RateInfoAckSnac;

impl OutSnac for RateInfoAckSnac {
    const FAMILY: u16 = FAM_GENERIC;
    const SUBTYPE: u16 = RATE_INFO_ACK;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        for class in 1..=5u16 {
            b.write_u16_be(class);
        }
    }
}

/// Request our own user info.
pub struct PersonalInfoRequestSnac;

impl OutSnac for PersonalInfoRequestSnac {
    const FAMILY: u16 = FAM_GENERIC;
    const SUBTYPE: u16 = PERSONAL_INFO_REQUEST;

    fn write_body(&self, _b: &mut Buffer, _tr: &Translator) {}
}

/// End of the login burst: ready for traffic.
pub struct ClientReadySnac;

impl OutSnac for ClientReadySnac {
    const FAMILY: u16 = FAM_GENERIC;
    const SUBTYPE: u16 = CLIENT_READY;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        for (family, version) in FAMILY_VERSIONS {
            b.write_u16_be(family);
            b.write_u16_be(version);
            b.write_u16_be(0x0110);
            b.write_u16_be(0x047b);
        }
    }
}

/// Set own status, optionally advertising direct-connection details.
pub struct SetStatusSnac {
    /// Encoded status word, invisibility flag included.
    pub status: u16,
    /// LAN (ip, port) to advertise for inbound peer connections.
    pub direct_details: Option<(u32, u16)>,
}

impl OutSnac for SetStatusSnac {
    const FAMILY: u16 = FAM_GENERIC;
    const SUBTYPE: u16 = SET_STATUS;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        // status TLV: allow-direct, web-aware, status word
        let mut v = Buffer::new();
        v.write_u8(0x01);
        v.write_u8(0x00);
        v.write_u16_be(self.status);
        tlv::write_tlv(b, tlv::TLV_STATUS, v.as_slice());

        if let Some((lan_ip, lan_port)) = self.direct_details {
            b.write_u16_be(tlv::TLV_LAN_DETAILS);
            let m = b.mark_u16_be();
            b.write_u32_be(lan_ip);
            b.write_u32_be(lan_port as u32);
            b.write_u16_be(0x0400); // firewall: direct allowed
            b.write_u16_be(0x0007); // tcp version
            b.write_u32_be(0x279c6996); // dc cookie
            b.write_u32_be(0x00000050);
            b.write_u32_be(0x00000003);
            b.write_u32_be(0x00000000); // client time stamps
            b.write_u32_be(0x00000000);
            b.write_u32_be(0x00000000);
            b.write_u16_be(0x0000);
            b.patch_size(m);
        }
    }
}

/// Parsed rate-limit change notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateInfoChange {
    pub code: u16,
    pub rate_class: u16,
    pub window_size: u32,
    pub clear: u32,
    pub alert: u32,
    pub limit: u32,
    pub disconnect: u32,
    pub current_avg: u32,
    pub max_avg: u32,
}

impl RateInfoChange {
    /// Parse the change notification body.
    pub fn parse(b: &mut Buffer) -> Self {
        let code = b.read_u16_be();
        let rate_class = b.read_u16_be();
        let change = RateInfoChange {
            code,
            rate_class,
            window_size: b.read_u32_be(),
            clear: b.read_u32_be(),
            alert: b.read_u32_be(),
            limit: b.read_u32_be(),
            disconnect: b.read_u32_be(),
            current_avg: b.read_u32_be(),
            max_avg: b.read_u32_be(),
        };
        b.advance(b.remaining());
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_status_tlv_layout() {
        let snac = SetStatusSnac {
            status: 0x0101,
            direct_details: None,
        };
        let mut b = Buffer::new();
        snac.write_body(&mut b, &Translator::new());
        // TLV 6, length 4, allow-direct, web-aware, status
        assert_eq!(
            b.as_slice(),
            &[0x00, 0x06, 0x00, 0x04, 0x01, 0x00, 0x01, 0x01]
        );
    }

    #[test]
    fn test_set_status_with_lan_details() {
        let snac = SetStatusSnac {
            status: 0x0000,
            direct_details: Some((0x0a000001, 4000)),
        };
        let mut b = Buffer::new();
        snac.write_body(&mut b, &Translator::new());
        let mut rb = Buffer::from_bytes(b.as_slice());
        let set = tlv::TlvSet::parse(&mut rb);
        let lan = set.get(tlv::TLV_LAN_DETAILS).unwrap();
        assert_eq!(&lan[..4], &0x0a000001u32.to_be_bytes());
        assert_eq!(lan.len(), 38);
    }

    #[test]
    fn test_rate_info_change_parse() {
        let mut b = Buffer::new();
        b.write_u16_be(2);
        b.write_u16_be(1);
        for v in [80u32, 2000, 1500, 1000, 500, 1200, 6000] {
            b.write_u32_be(v);
        }
        let change = RateInfoChange::parse(&mut Buffer::from_bytes(b.as_slice()));
        assert_eq!(change.code, 2);
        assert_eq!(change.window_size, 80);
        assert_eq!(change.max_avg, 6000);
    }
}
