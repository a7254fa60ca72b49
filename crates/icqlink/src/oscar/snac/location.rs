//! Location family (0x0002): user profile upload.

use crate::oscar::buffer::Buffer;
use crate::oscar::caps::Capabilities;
use crate::oscar::tlv;
use crate::oscar::translator::Translator;

use super::{FAM_LOCATION, OutSnac};

pub const SET_USER_INFO: u16 = 0x0004;

/// Upload our profile: the capability blob in a TLV.
pub struct SetUserInfoSnac {
    /// Capabilities to advertise.
    pub capabilities: Capabilities,
}

impl OutSnac for SetUserInfoSnac {
    const FAMILY: u16 = FAM_LOCATION;
    const SUBTYPE: u16 = SET_USER_INFO;

    fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
        b.write_u16_be(tlv::TLV_CAPABILITIES);
        let m = b.mark_u16_be();
        self.capabilities.write(b);
        b.patch_size(m);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_tlv() {
        let snac = SetUserInfoSnac {
            capabilities: Capabilities::icq2000(),
        };
        let mut b = Buffer::new();
        snac.write_body(&mut b, &Translator::new());
        assert_eq!(&b.as_slice()[..4], &[0x00, 0x05, 0x00, 0x20]);
        assert_eq!(b.len(), 4 + 32);
    }
}
