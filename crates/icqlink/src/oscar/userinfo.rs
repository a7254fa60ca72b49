//! User-info blocks and detailed profile pages.
//!
//! The channel-2 user-info block (screenname, warning level, TLV list) rides
//! on buddy-online notifications, self info and inbound messages. The
//! detailed profile pages arrive as server-response payloads.

use super::buffer::Buffer;
use super::caps::Capabilities;
use super::tlv;

/// Parsed channel-2 user-info block.
#[derive(Debug, Clone, Default)]
pub struct UserInfoBlock {
    /// Screen name; for ICQ accounts this is the decimal UIN.
    pub screenname: String,
    /// Warning level.
    pub warning_level: u16,
    /// User class word.
    pub user_class: u16,
    /// Status word (flags included).
    pub status: u16,
    /// Allow-direct-connect byte from the status TLV.
    pub allow_direct: u8,
    /// Web-aware byte from the status TLV.
    pub web_aware: u8,
    /// Seconds online.
    pub time_online: u32,
    /// Signup timestamp.
    pub signup_date: u32,
    /// Signon timestamp.
    pub signon_date: u32,
    /// External IP as seen by the server.
    pub ext_ip: u32,
    /// External port.
    pub ext_port: u16,
    /// LAN IP advertised for direct connections.
    pub lan_ip: u32,
    /// LAN port advertised for direct connections.
    pub lan_port: u16,
    /// Firewall word from the LAN-details TLV.
    pub firewall: u16,
    /// Direct-connection protocol version.
    pub tcp_version: u8,
    /// Advertised capabilities.
    pub capabilities: Capabilities,
}

impl UserInfoBlock {
    /// Numeric UIN (0 for non-numeric screen names).
    pub fn uin(&self) -> u32 {
        self.screenname.trim().parse().unwrap_or(0)
    }

    /// Parse a user-info block at the buffer cursor.
    pub fn parse(b: &mut Buffer) -> Self {
        let screenname = String::from_utf8_lossy(&b.read_str8()).into_owned();
        let warning_level = b.read_u16_be();
        let tlv_count = b.read_u16_be() as usize;

        let mut info = UserInfoBlock {
            screenname,
            warning_level,
            ..Default::default()
        };

        let set = tlv::TlvSet::parse_limited(b, tlv_count);
        if let Some(v) = set.get_u16(tlv::TLV_USER_CLASS) {
            info.user_class = v;
        }
        if let Some(v) = set.get(tlv::TLV_STATUS) {
            if v.len() >= 4 {
                info.allow_direct = v[0];
                info.web_aware = v[1];
                info.status = u16::from_be_bytes([v[2], v[3]]);
            }
        }
        if let Some(v) = set.get_u32(tlv::TLV_TIME_ONLINE) {
            info.time_online = v;
        }
        if let Some(v) = set.get_u32(tlv::TLV_SIGNUP_DATE) {
            info.signup_date = v;
        }
        if let Some(v) = set.get_u32(tlv::TLV_SIGNON_DATE) {
            info.signon_date = v;
        }
        if let Some(v) = set.get_u32(tlv::TLV_IP_ADDRESS) {
            info.ext_ip = v;
        }
        if let Some(v) = set.get_u16(tlv::TLV_PORT) {
            info.ext_port = v;
        }
        if let Some(v) = set.get(tlv::TLV_LAN_DETAILS) {
            info.parse_lan_details(v);
        }
        if let Some(v) = set.get(tlv::TLV_CAPABILITIES) {
            let mut cb = Buffer::from_bytes(v);
            info.capabilities = Capabilities::parse(&mut cb, v.len());
        }
        info
    }

    fn parse_lan_details(&mut self, value: &[u8]) {
        let mut b = Buffer::from_bytes(value);
        // the long form advertises direct connections
        if value.len() >= 0x25 {
            self.lan_ip = b.read_u32_be();
            b.advance(2);
            self.lan_port = b.read_u16_be();
            self.firewall = b.read_u16_be();
            self.tcp_version = b.read_u16_be() as u8;
        }
    }
}

/// Main/home profile page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MainHomeInfo {
    pub alias: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub city: String,
    pub state: String,
    pub phone: String,
    pub fax: String,
    pub street: String,
    pub cellular: String,
    pub zip: String,
    pub country: u16,
    pub gmt_offset: u8,
}

/// Homepage profile page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HomepageInfo {
    pub age: u8,
    pub sex: u8,
    pub homepage: String,
    pub birth_year: u16,
    pub birth_month: u8,
    pub birth_day: u8,
    pub lang1: u8,
    pub lang2: u8,
    pub lang3: u8,
}

/// Email-list profile page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EmailInfo {
    pub emails: Vec<String>,
}

/// Work profile page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkInfo {
    pub city: String,
    pub state: String,
    pub street: String,
    pub zip: String,
    pub country: u16,
    pub company_name: String,
    pub company_dept: String,
    pub company_position: String,
    pub company_web: String,
}

/// Personal-interests profile page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PersonalInterestInfo {
    pub interests: Vec<(u16, String)>,
}

/// Background (schools) profile page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackgroundInfo {
    pub schools: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oscar::status::STATUS_FLAG_AWAY;

    fn status_tlv(allow_direct: u8, web_aware: u8, status: u16) -> Vec<u8> {
        let mut v = vec![allow_direct, web_aware];
        v.extend_from_slice(&status.to_be_bytes());
        v
    }

    #[test]
    fn test_parse_online_notification_block() {
        let mut b = Buffer::new();
        b.write_str8(b"123456");
        b.write_u16_be(0); // warning level
        b.write_u16_be(4); // tlv count
        tlv::write_tlv_u16(&mut b, tlv::TLV_USER_CLASS, 0x0050);
        tlv::write_tlv(&mut b, tlv::TLV_STATUS, &status_tlv(1, 0, STATUS_FLAG_AWAY));
        tlv::write_tlv_u32(&mut b, tlv::TLV_IP_ADDRESS, 0xc0a80101);
        tlv::write_tlv_u16(&mut b, tlv::TLV_PORT, 5191);

        let mut rb = Buffer::from_bytes(b.as_slice());
        let info = UserInfoBlock::parse(&mut rb);
        assert_eq!(info.uin(), 123456);
        assert_eq!(info.status, STATUS_FLAG_AWAY);
        assert_eq!(info.allow_direct, 1);
        assert_eq!(info.ext_ip, 0xc0a80101);
        assert_eq!(info.ext_port, 5191);
        assert!(!rb.before_end());
    }

    #[test]
    fn test_parse_lan_details() {
        let mut lan = Buffer::new();
        lan.write_u32_be(0x0a000001); // lan ip
        lan.write_u16_be(0);
        lan.write_u16_be(4000); // lan port
        lan.write_u16_be(0x0400); // firewall
        lan.write_u16_be(7); // tcp version
        lan.write_bytes(&[0u8; 0x25 - 12]);

        let mut b = Buffer::new();
        b.write_str8(b"42");
        b.write_u16_be(0);
        b.write_u16_be(1);
        tlv::write_tlv(&mut b, tlv::TLV_LAN_DETAILS, lan.as_slice());

        let mut rb = Buffer::from_bytes(b.as_slice());
        let info = UserInfoBlock::parse(&mut rb);
        assert_eq!(info.lan_ip, 0x0a000001);
        assert_eq!(info.lan_port, 4000);
        assert_eq!(info.tcp_version, 7);
    }
}
