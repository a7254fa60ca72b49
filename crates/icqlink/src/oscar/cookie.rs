//! ICBM cookies: eight random bytes binding a message to its acknowledgement.

use rand::Rng;

use super::buffer::Buffer;

/// An 8-byte message cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IcbmCookie([u8; 8]);

impl IcbmCookie {
    /// Fresh random cookie. Uniqueness against outstanding cookies is the
    /// cookie cache's job ([`generate_unique`](crate::oscar::cache::TimedCache)
    /// callers rejection-sample against it).
    pub fn generate() -> Self {
        Self(rand::thread_rng().r#gen())
    }

    /// Cookie from raw bytes.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Read a cookie from a buffer.
    pub fn parse(b: &mut Buffer) -> Self {
        let raw = b.read_bytes(8);
        let mut bytes = [0u8; 8];
        bytes[..raw.len()].copy_from_slice(&raw);
        Self(bytes)
    }

    /// Write the cookie to a buffer.
    pub fn write(&self, b: &mut Buffer) {
        b.write_bytes(&self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let c = IcbmCookie::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let mut b = Buffer::new();
        c.write(&mut b);
        let mut rb = Buffer::from_bytes(b.as_slice());
        assert_eq!(IcbmCookie::parse(&mut rb), c);
    }

    #[test]
    fn test_generate_differs() {
        // two fresh cookies colliding is a 2^-64 event
        assert_ne!(IcbmCookie::generate(), IcbmCookie::generate());
    }
}
