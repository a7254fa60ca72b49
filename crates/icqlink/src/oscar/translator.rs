//! Charset translation between the wire and the client.
//!
//! The legacy service predates Unicode negotiation; clients agreed on a
//! single-byte charset and shipped 256-byte remap tables for everything that
//! wasn't Latin-1 (the `KOI8-R` ↔ `CP1251` pair being the classic case).
//! A map file carries both directions; with no map loaded the translator is
//! the identity.

use std::fmt;
use std::path::Path;

use super::error::{Error, Result};

/// Bidirectional single-byte charset translator.
pub struct Translator {
    server_to_client: [u8; 256],
    client_to_server: [u8; 256],
    map_name: String,
    default_map: bool,
}

impl Default for Translator {
    fn default() -> Self {
        let mut identity = [0u8; 256];
        for (i, v) in identity.iter_mut().enumerate() {
            *v = i as u8;
        }
        Self {
            server_to_client: identity,
            client_to_server: identity,
            map_name: "default".into(),
            default_map: true,
        }
    }
}

impl fmt::Debug for Translator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Translator")
            .field("map_name", &self.map_name)
            .field("default_map", &self.default_map)
            .finish()
    }
}

impl Translator {
    /// Identity translator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a translation map from a file.
    ///
    /// The format is the licq one: `#`-prefixed comment lines, then 512
    /// whitespace-separated byte values (decimal or `0x`-prefixed hex) — the
    /// server→client table followed by the client→server table.
    pub fn load_map(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Translator(format!("cannot read '{}': {}", path.display(), e)))?;

        let mut values = Vec::with_capacity(512);
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            for tok in line.split([' ', '\t', ',']) {
                let tok = tok.trim();
                if tok.is_empty() {
                    continue;
                }
                let v = parse_byte(tok).ok_or_else(|| {
                    Error::Translator(format!("bad byte value '{}' in '{}'", tok, path.display()))
                })?;
                values.push(v);
            }
        }

        if values.len() < 512 {
            return Err(Error::Translator(format!(
                "map '{}' holds {} values, need 512",
                path.display(),
                values.len()
            )));
        }

        let mut t = Self::new();
        t.server_to_client.copy_from_slice(&values[..256]);
        t.client_to_server.copy_from_slice(&values[256..512]);
        t.map_name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "custom".into());
        t.default_map = false;
        Ok(t)
    }

    /// True while no custom map has been loaded.
    pub fn is_default(&self) -> bool {
        self.default_map
    }

    /// Name of the loaded map.
    pub fn map_name(&self) -> &str {
        &self.map_name
    }

    /// Translate wire bytes in place to the client charset.
    pub fn to_client(&self, bytes: &mut [u8]) {
        if self.default_map {
            return;
        }
        for b in bytes {
            *b = self.server_to_client[*b as usize];
        }
    }

    /// Translate client bytes in place to the wire charset.
    pub fn to_server(&self, bytes: &mut [u8]) {
        if self.default_map {
            return;
        }
        for b in bytes {
            *b = self.client_to_server[*b as usize];
        }
    }

    /// Decode wire bytes into a client-side string.
    pub fn decode(&self, bytes: &[u8]) -> String {
        let mut v = bytes.to_vec();
        self.to_client(&mut v);
        String::from_utf8_lossy(&v).into_owned()
    }

    /// Encode a client-side string into wire bytes.
    pub fn encode(&self, s: &str) -> Vec<u8> {
        let mut v = s.as_bytes().to_vec();
        self.to_server(&mut v);
        v
    }
}

fn parse_byte(tok: &str) -> Option<u8> {
    if let Some(hex) = tok.strip_prefix("0x").or_else(|| tok.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).ok()
    } else {
        tok.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_identity_by_default() {
        let t = Translator::new();
        assert!(t.is_default());
        let mut data = *b"hello \xff";
        t.to_client(&mut data);
        assert_eq!(&data, b"hello \xff");
        assert_eq!(t.decode(b"abc"), "abc");
        assert_eq!(t.encode("abc"), b"abc");
    }

    #[test]
    fn test_load_map_round_trip() {
        // swap 'a' (0x61) and 'b' (0x62) in both directions
        let mut s2c: Vec<u8> = (0..=255).collect();
        s2c.swap(0x61, 0x62);
        let c2s = s2c.clone();

        let mut file = tempfile_path();
        {
            let mut f = std::fs::File::create(&file).unwrap();
            writeln!(f, "# swap map").unwrap();
            for chunk in s2c.chunks(16).chain(c2s.chunks(16)) {
                let line: Vec<String> = chunk.iter().map(|b| format!("0x{:02x}", b)).collect();
                writeln!(f, "{}", line.join(" ")).unwrap();
            }
        }

        let t = Translator::load_map(&file).unwrap();
        assert!(!t.is_default());
        assert_eq!(t.decode(b"abba"), "baab");
        assert_eq!(t.encode("baab"), b"abba");
        std::fs::remove_file(&file).ok();
        file.pop();
    }

    #[test]
    fn test_load_map_too_short() {
        let mut file = tempfile_path();
        std::fs::write(&file, "1 2 3").unwrap();
        let err = Translator::load_map(&file).unwrap_err();
        assert!(matches!(err, Error::Translator(_)));
        std::fs::remove_file(&file).ok();
        file.pop();
    }

    fn tempfile_path() -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("icqlink-map-{}-{:x}", std::process::id(), rand::random::<u32>()));
        p
    }
}
