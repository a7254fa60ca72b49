//! Server-stored list family (0x0013): the roster kept on the server.
//!
//! Edits are bracketed by edit-start/edit-finish; the server answers each
//! add/remove/update with a modification ack carrying one result code per
//! item.

use crate::oscar::buffer::Buffer;
use crate::oscar::tlv;
use crate::oscar::translator::Translator;

use super::{FAM_SBL, OutSnac};

pub const EDIT_REQUEST_ACCESS: u16 = 0x0002;
pub const EDIT_ACCESS_GRANTED: u16 = 0x0003;
pub const REQUEST_LIST: u16 = 0x0005;
pub const LIST_FROM_SERVER: u16 = 0x0006;
pub const ADD_ITEM: u16 = 0x0008;
pub const UPDATE_GROUP: u16 = 0x0009;
pub const REMOVE_ITEM: u16 = 0x000a;
pub const MODIFICATION_ACK: u16 = 0x000e;
pub const EDIT_START: u16 = 0x0011;
pub const EDIT_FINISH: u16 = 0x0012;

/// Result code of one list modification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SblResult {
    /// Item stored.
    Success,
    /// Server rejected the edit.
    Failed,
    /// Contact requires authorization before it can be stored.
    AuthRequired,
    /// Item already on the list.
    AlreadyExists,
}

/// One entry of the server-stored roster.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SblEntry {
    /// Decimal UIN.
    pub uin: u32,
    /// Stored nickname.
    pub nickname: String,
    /// Group the entry belongs to.
    pub group_id: u16,
    /// Item tag within the group.
    pub item_id: u16,
    /// The entry awaits the contact's authorization.
    pub auth_awaited: bool,
}

/// The roster as pushed by the server.
#[derive(Debug, Clone, Default)]
pub struct SblList {
    /// Buddy entries (group records are skipped).
    pub entries: Vec<SblEntry>,
}

impl SblList {
    /// Parse a list-from-server body.
    pub fn parse(b: &mut Buffer) -> Self {
        let mut list = SblList::default();
        b.advance(1);
        let _entity_count = b.read_u16_be();

        while b.remaining() >= 10 {
            let name = b.read_str16();
            let group_id = b.read_u16_be();
            let item_id = b.read_u16_be();
            let item_type = b.read_u16_be();
            let mut data_len = b.read_u16_be() as usize;

            let mut entry: Option<SblEntry> = None;
            while data_len >= 4 {
                let info_type = b.read_u16_be();
                let info_len = b.read_u16_be() as usize;
                data_len -= 4;
                match info_type {
                    tlv::TLV_CONTACT_NICKNAME => {
                        let nickname =
                            String::from_utf8_lossy(&b.read_bytes(info_len)).into_owned();
                        let uin = String::from_utf8_lossy(&name).trim().parse().unwrap_or(0);
                        let e = entry.get_or_insert(SblEntry {
                            uin,
                            nickname: String::new(),
                            group_id,
                            item_id,
                            auth_awaited: false,
                        });
                        e.nickname = nickname;
                    }
                    tlv::TLV_AUTH_AWAITED => {
                        b.advance(info_len);
                        if let Some(e) = entry.as_mut() {
                            e.auth_awaited = true;
                        }
                    }
                    _ => {
                        b.advance(info_len);
                    }
                }
                data_len = data_len.saturating_sub(info_len);
            }
            b.advance(data_len);

            // item type 0 is a buddy; groups and permit records carry no UIN
            if item_type == 0x0000 {
                if let Some(e) = entry {
                    if e.uin != 0 {
                        list.entries.push(e);
                    }
                }
            }
        }
        b.advance(b.remaining());
        list
    }
}

/// Ask the server for the stored roster.
pub struct RequestListSnac;

impl OutSnac for RequestListSnac {
    const FAMILY: u16 = FAM_SBL;
    const SUBTYPE: u16 = REQUEST_LIST;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        b.write_u32_be(0x00000000);
        b.write_u16_be(0x0001);
    }
}

/// Request write access to the stored roster.
pub struct EditRequestAccessSnac;

impl OutSnac for EditRequestAccessSnac {
    const FAMILY: u16 = FAM_SBL;
    const SUBTYPE: u16 = EDIT_REQUEST_ACCESS;

    fn write_body(&self, _b: &mut Buffer, _tr: &Translator) {}
}

/// Open an edit batch.
pub struct EditStartSnac;

impl OutSnac for EditStartSnac {
    const FAMILY: u16 = FAM_SBL;
    const SUBTYPE: u16 = EDIT_START;

    fn write_body(&self, _b: &mut Buffer, _tr: &Translator) {}
}

/// Close an edit batch.
pub struct EditFinishSnac;

impl OutSnac for EditFinishSnac {
    const FAMILY: u16 = FAM_SBL;
    const SUBTYPE: u16 = EDIT_FINISH;

    fn write_body(&self, _b: &mut Buffer, _tr: &Translator) {}
}

/// Items to add or remove: either a group record or buddy records.
#[derive(Debug, Clone)]
pub enum SblItems {
    /// A group header.
    Group {
        /// Group display name.
        name: String,
        /// Group id.
        group_id: u16,
    },
    /// Buddy entries.
    Buddies(Vec<SblEntry>),
}

fn write_items(b: &mut Buffer, items: &SblItems) {
    match items {
        SblItems::Group { name, group_id } => {
            b.write_str16(name.as_bytes());
            b.write_u16_be(*group_id);
            b.write_u16_be(0x0000);
            b.write_u16_be(0x0001);
            b.write_u16_be(0x0000);
        }
        SblItems::Buddies(entries) => {
            for e in entries {
                let suin = e.uin.to_string();
                b.write_str16(suin.as_bytes());
                b.write_u16_be(e.group_id);
                b.write_u16_be(e.item_id);
                b.write_u16_be(0x0000);

                // container length covers the nickname TLV and, when the
                // contact still owes us authorization, the flag TLV header
                let mut tlvlen = 4 + e.nickname.len();
                if e.auth_awaited {
                    tlvlen += 4;
                }
                b.write_u16_be(tlvlen as u16);

                b.write_u16_be(tlv::TLV_CONTACT_NICKNAME);
                b.write_u16_be(e.nickname.len() as u16);
                b.write_bytes(e.nickname.as_bytes());

                if e.auth_awaited {
                    b.write_u16_be(tlv::TLV_AUTH_AWAITED);
                    b.write_u16_be(0x0000);
                }
            }
        }
    }
}

/// Add items to the stored roster.
pub struct AddItemSnac {
    /// What to add.
    pub items: SblItems,
}

impl OutSnac for AddItemSnac {
    const FAMILY: u16 = FAM_SBL;
    const SUBTYPE: u16 = ADD_ITEM;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        write_items(b, &self.items);
    }
}

/// Remove items from the stored roster.
pub struct RemoveItemSnac {
    /// What to remove.
    pub items: SblItems,
}

impl OutSnac for RemoveItemSnac {
    const FAMILY: u16 = FAM_SBL;
    const SUBTYPE: u16 = REMOVE_ITEM;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        write_items(b, &self.items);
    }
}

/// Rewrite a group header with its member item ids.
pub struct UpdateGroupSnac {
    /// Group display name.
    pub name: String,
    /// Group id.
    pub group_id: u16,
    /// Item ids of the members.
    pub member_ids: Vec<u16>,
}

impl OutSnac for UpdateGroupSnac {
    const FAMILY: u16 = FAM_SBL;
    const SUBTYPE: u16 = UPDATE_GROUP;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        b.write_str16(self.name.as_bytes());
        b.write_u16_be(self.group_id);
        b.write_u16_be(0x0000);
        b.write_u16_be(0x0001);

        if self.member_ids.is_empty() {
            b.write_u16_be(0x0000);
        } else {
            b.write_u16_be(4 + self.member_ids.len() as u16 * 2);
            b.write_u16_be(tlv::TLV_GROUP_MEMBERS);
            b.write_u16_be(self.member_ids.len() as u16 * 2);
            for id in &self.member_ids {
                b.write_u16_be(*id);
            }
        }
    }
}

/// Parse a modification-ack body into one result per edited item.
pub fn parse_modification_ack(b: &mut Buffer) -> Vec<SblResult> {
    let mut results = Vec::new();
    while b.remaining() >= 2 {
        match b.read_u16_be() {
            0x0000 => results.push(SblResult::Success),
            0x0003 => results.push(SblResult::AlreadyExists),
            0x000a => results.push(SblResult::Failed),
            0x000e => results.push(SblResult::AuthRequired),
            _ => {}
        }
    }
    results
}
