//! CRC32 checksums for block payloads
//!
//! When checksumming is enabled, every block header carries a CRC32 (IEEE
//! polynomial) over the packed record region. The header field is written as
//! zero when checksumming is disabled, so checksummed and plain logs share
//! one on-disk layout.

use crc32fast::Hasher;

/// Computes a CRC32 checksum over the provided bytes.
///
/// Deterministic: the same input always produces the same output.
pub(crate) fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verifies bytes against an expected checksum.
pub(crate) fn verify_checksum(data: &[u8], expected: u32) -> bool {
    compute_checksum(data) == expected
}
