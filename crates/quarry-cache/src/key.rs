#![forbid(unsafe_code)]

use std::{fmt::Debug, fmt::Display, hash::Hash};

/// Key type addressing one cacheable artifact (an IDE build, a plugin
/// archive, a parsed descriptor set).
///
/// ## Normative
/// - Value equality and a stable hash: the key is the map key of the cache.
/// - `dir_name()` is a deterministic, collision-free filesystem encoding.
///   Distinct keys must never map to the same directory name.
/// - `dir_name()` must be a plain path component: non-empty, not starting
///   with `.`, no separators. The store refuses anything else rather than
///   risk aliasing the storage root.
/// - `from_dir_name()` inverts `dir_name()`. The startup recovery scan uses
///   it to rebuild the inventory from directories found on disk; a name that
///   does not parse is not a cache artifact and is left alone.
pub trait CacheKey:
    Clone + Eq + Hash + Ord + Debug + Display + Send + Sync + 'static
{
    /// Stable directory name for this key under the storage root.
    fn dir_name(&self) -> String;

    /// Parse a directory name produced by [`CacheKey::dir_name`].
    fn from_dir_name(name: &str) -> Option<Self>;
}

/// Free-form strings (build numbers like `IU-243.12888.9`, plugin
/// coordinates) are the common key shape; the escaped encoding keeps them
/// filesystem-safe and reversible.
impl CacheKey for String {
    fn dir_name(&self) -> String {
        encode_dir_name(self)
    }

    fn from_dir_name(name: &str) -> Option<Self> {
        decode_dir_name(name)
    }
}

/// Encode an arbitrary string into a safe, collision-free directory name.
///
/// ASCII alphanumerics, `-` and `.` pass through (a leading `.` is escaped so
/// no artifact ever looks like a hidden directory); everything else becomes
/// `_XX` with the byte value in uppercase hex. `_` itself is escaped, which
/// makes the mapping injective. The empty key gets the reserved name `_`,
/// which the escaping can never produce, so every key yields a usable,
/// non-empty directory name.
pub fn encode_dir_name(raw: &str) -> String {
    if raw.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(raw.len());
    for (i, b) in raw.bytes().enumerate() {
        let plain = b.is_ascii_alphanumeric() || b == b'-' || (b == b'.' && i != 0);
        if plain {
            out.push(b as char);
        } else {
            out.push('_');
            out.push_str(&format!("{b:02X}"));
        }
    }
    out
}

/// Invert [`encode_dir_name`]. Returns `None` for names this module could not
/// have produced.
pub fn decode_dir_name(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    if name == "_" {
        return Some(String::new());
    }
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hi = (hex[0] as char).to_digit(16)?;
                let lo = (hex[1] as char).to_digit(16)?;
                // Only uppercase hex is ever emitted.
                if hex.iter().any(u8::is_ascii_lowercase) {
                    return None;
                }
                let b = (hi * 16 + lo) as u8;
                // Reject escapes of bytes the encoder passes through, so each
                // key has exactly one directory name.
                let plain = b.is_ascii_alphanumeric()
                    || b == b'-'
                    || (b == b'.' && !out.is_empty());
                if plain {
                    return None;
                }
                out.push(b);
                i += 3;
            }
            b if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' => {
                // A leading '.' is always escaped on encode.
                if i == 0 && b == b'.' {
                    return None;
                }
                out.push(b);
                i += 1;
            }
            _ => return None,
        }
    }
    String::from_utf8(out).ok()
}
