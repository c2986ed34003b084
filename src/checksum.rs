//! CRC32 checksums for cached artifacts.
//!
//! Artifacts are identified by the CRC32 (IEEE, reflected polynomial
//! 0xEDB88320) of their bytes, rendered as 8 lowercase hex characters.
//! The same encoding is used in cache metadata, history entries, the
//! `X-CRC32` response header, and the `.crc32` endpoint body.

/// Compute the CRC32 of a byte buffer.
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Compute the CRC32 of a byte buffer as 8 lowercase hex characters.
#[must_use]
pub fn crc32_hex(bytes: &[u8]) -> String {
    format!("{:08x}", crc32(bytes))
}

/// Render an already-computed CRC32 as 8 lowercase hex characters.
#[must_use]
pub fn format_crc32(value: u32) -> String {
    format!("{value:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        // Standard CRC32 check value for "123456789".
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
        assert_eq!(crc32_hex(b"123456789"), "cbf43926");
    }

    #[test]
    fn empty_buffer() {
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32_hex(b""), "00000000");
    }

    #[test]
    fn hex_is_zero_padded() {
        // CRC32 of "a" is 0xe8b7be43; pick an input with a small CRC to
        // exercise the padding.
        let hex = crc32_hex(b"a");
        assert_eq!(hex.len(), 8);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hex, hex.to_lowercase());
    }

    #[test]
    fn format_matches_compute() {
        let bytes = b"calendar bytes";
        assert_eq!(format_crc32(crc32(bytes)), crc32_hex(bytes));
    }
}
