//! DNS-safe wire codec
//!
//! Binary payloads ride inside DNS names, so the upstream direction is base32
//! (RFC 4648 alphabet, no padding) split into short labels. The downstream
//! direction reuses the same encoding inside TXT strings, or one of the two
//! sentinel strings when there is nothing to carry.

use crate::{Result, TunnelError};
use base32::Alphabet;

/// Largest raw payload moved by one uplink read or one poll answer.
pub const MAX_CHUNK_SIZE: usize = 220;

/// Hard per-label limit from RFC 1035.
pub const MAX_LABEL_SIZE: usize = 63;

/// Label size actually emitted. Kept well under the 63-octet limit so
/// intermediate resolvers have headroom.
pub const MAX_SAFE_LABEL_SIZE: usize = 40;

/// TXT answer meaning "no payload".
pub const EMPTY_SENTINEL: &str = "EMPTY";

/// TXT answer meaning "backend is gone, tear down".
pub const CLOSED_SENTINEL: &str = "CLOSED";

const DNS_BASE32: Alphabet = Alphabet::Rfc4648 { padding: false };

/// Encode a payload into dot-separated DNS-safe labels.
///
/// An empty payload maps to the literal `"EMPTY"`; anything else becomes
/// unpadded base32 split into labels of at most [`MAX_SAFE_LABEL_SIZE`]
/// characters.
pub fn encode(data: &[u8]) -> String {
    if data.is_empty() {
        return EMPTY_SENTINEL.to_string();
    }

    let encoded = base32::encode(DNS_BASE32, data);

    let labels: Vec<&str> = encoded
        .as_bytes()
        .chunks(MAX_SAFE_LABEL_SIZE)
        .map(|chunk| std::str::from_utf8(chunk).unwrap())
        .collect();

    let result = labels.join(".");

    // Policy check: 40-char chunks can never exceed 63, but anything that
    // somehow does gets re-split at the same boundary.
    if result.split('.').any(|label| label.len() > MAX_LABEL_SIZE) {
        let relabeled: Vec<&str> = result
            .split('.')
            .flat_map(|label| {
                label
                    .as_bytes()
                    .chunks(MAX_SAFE_LABEL_SIZE)
                    .map(|chunk| std::str::from_utf8(chunk).unwrap())
            })
            .collect();
        return relabeled.join(".");
    }

    result
}

/// Decode dot-separated labels back into the original payload.
///
/// `"EMPTY"` maps to an empty payload. The input is case-folded to the
/// uppercase alphabet before decoding, so resolver case-mangling cannot
/// corrupt a payload. A failed decode is reported, never treated as empty.
pub fn decode(s: &str) -> Result<Vec<u8>> {
    if s == EMPTY_SENTINEL {
        return Ok(Vec::new());
    }

    let compact = s.replace('.', "").to_uppercase();
    base32::decode(DNS_BASE32, &compact).ok_or(TunnelError::Decode)
}

/// Append the XOR of all bytes as a trailing checksum byte.
pub fn add_checksum(data: &[u8]) -> Vec<u8> {
    let sum = data.iter().fold(0u8, |acc, b| acc ^ b);
    let mut out = Vec::with_capacity(data.len() + 1);
    out.extend_from_slice(data);
    out.push(sum);
    out
}

/// Verify and strip a trailing XOR checksum byte.
pub fn verify_and_strip_checksum(data: &[u8]) -> Result<Vec<u8>> {
    let (&checksum, payload) = data.split_last().ok_or(TunnelError::Checksum)?;
    let sum = payload.iter().fold(0u8, |acc, b| acc ^ b);
    if sum != checksum {
        return Err(TunnelError::Checksum);
    }
    Ok(payload.to_vec())
}
