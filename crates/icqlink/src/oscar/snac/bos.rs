//! BOS family (0x0009): visible/invisible list manipulation.

use crate::oscar::buffer::Buffer;
use crate::oscar::translator::Translator;

use super::{FAM_BOS, OutSnac};

pub const ADD_VISIBLE: u16 = 0x0005;
pub const REMOVE_VISIBLE: u16 = 0x0006;
pub const ADD_INVISIBLE: u16 = 0x0007;
pub const REMOVE_INVISIBLE: u16 = 0x0008;

fn write_screennames(b: &mut Buffer, names: &[String]) {
    for name in names {
        b.write_str8(name.as_bytes());
    }
}

macro_rules! bos_list_snac {
    ($(#[$doc:meta])* $name:ident, $subtype:expr) => {
        $(#[$doc])*
        pub struct $name {
            /// Decimal UINs.
            pub screennames: Vec<String>,
        }

        impl OutSnac for $name {
            const FAMILY: u16 = FAM_BOS;
            const SUBTYPE: u16 = $subtype;

            fn write_body(&self, b: &mut Buffer, _tr: &Translator) {
                write_screennames(b, &self.screennames);
            }
        }
    };
}

bos_list_snac!(
    /// Add contacts to the visible list.
    AddVisibleSnac,
    ADD_VISIBLE
);
bos_list_snac!(
    /// Remove contacts from the visible list.
    RemoveVisibleSnac,
    REMOVE_VISIBLE
);
bos_list_snac!(
    /// Add contacts to the invisible list.
    AddInvisibleSnac,
    ADD_INVISIBLE
);
bos_list_snac!(
    /// Remove contacts from the invisible list.
    RemoveInvisibleSnac,
    REMOVE_INVISIBLE
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_body() {
        let snac = AddInvisibleSnac {
            screennames: vec!["9999".into()],
        };
        let mut b = Buffer::new();
        snac.write_body(&mut b, &Translator::new());
        assert_eq!(b.as_slice(), b"\x049999");
    }
}
