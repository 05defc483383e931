//! Session identifiers and query-name framing
//!
//! Every tunneled connection is tagged by a random 7-character id drawn from
//! the DNS-safe base32 alphabet. Queries carry it in the fixed name shape
//! `<encoded-payload>.<seq-hex>.<sid>.<tld>`, parsed right-to-left so the
//! payload may span any number of labels.

use crate::{Result, TunnelError};
use rand::Rng;

/// Length of a session identifier (32^7 possibilities, treated as
/// collision-free).
pub const SESSION_ID_LENGTH: usize = 7;

/// Default trailing label on every query name.
pub const DEFAULT_TLD: &str = "edu";

/// Sequence value reserved for poll queries; never used for data.
pub const POLL_SEQ: &str = "ffff";

/// Fixed payload label carried by poll queries.
pub const POLL_PAYLOAD: &str = "AA";

const SESSION_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// The four components of a well-formed query name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryName {
    /// Dot-joined encoded payload labels (everything left of the seq field).
    pub payload: String,
    /// Four lowercase hex digits.
    pub seq: String,
    pub session_id: String,
    pub tld: String,
}

/// Draw a fresh session id from the base32 alphabet.
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LENGTH)
        .map(|_| SESSION_ALPHABET[rng.gen_range(0..SESSION_ALPHABET.len())] as char)
        .collect()
}

/// Compose a query name. The trailing FQDN dot is appended at emission time,
/// not here.
pub fn compose_name(encoded: &str, seq: u16, session_id: &str, tld: &str) -> String {
    format!("{}.{:04x}.{}.{}", encoded, seq, session_id, tld)
}

/// Split a query name into its components.
///
/// Requires at least four nonempty dot-separated parts with a 4-hex-digit
/// sequence field third from the right; anything else is a format error.
pub fn parse_name(name: &str) -> Result<QueryName> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    let parts: Vec<&str> = trimmed.split('.').collect();

    if parts.len() < 4 || parts.iter().any(|p| p.is_empty()) {
        return Err(TunnelError::BadName(name.to_string()));
    }

    let tld = parts[parts.len() - 1];
    let session_id = parts[parts.len() - 2];
    let seq = parts[parts.len() - 3].to_ascii_lowercase();

    if seq.len() != 4 || !seq.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TunnelError::BadName(name.to_string()));
    }

    Ok(QueryName {
        payload: parts[..parts.len() - 3].join("."),
        seq,
        session_id: session_id.to_string(),
        tld: tld.to_string(),
    })
}

/// A query with sequence `ffff` solicits downlink bytes instead of carrying
/// uplink bytes.
pub fn is_poll(seq: &str) -> bool {
    seq == POLL_SEQ
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_session_id_shape() {
        for _ in 0..100 {
            let sid = generate_session_id();
            assert_eq!(sid.len(), SESSION_ID_LENGTH);
            assert!(sid.bytes().all(|b| SESSION_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn test_session_ids_unique_over_many_draws() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(generate_session_id()), "duplicate session id");
        }
    }

    #[test]
    fn test_compose_parse_round_trip() {
        let name = compose_name("MFRGG.ZDF", 0x002a, "ABCDEF7", "edu");
        assert_eq!(name, "MFRGG.ZDF.002a.ABCDEF7.edu");

        let parsed = parse_name(&name).unwrap();
        assert_eq!(parsed.payload, "MFRGG.ZDF");
        assert_eq!(parsed.seq, "002a");
        assert_eq!(parsed.session_id, "ABCDEF7");
        assert_eq!(parsed.tld, "edu");
    }

    #[test]
    fn test_parse_strips_fqdn_dot() {
        let parsed = parse_name("AA.ffff.ABCDEF7.edu.").unwrap();
        assert_eq!(parsed.payload, "AA");
        assert!(is_poll(&parsed.seq));
    }

    #[test]
    fn test_parse_rejects_short_names() {
        assert!(parse_name("ffff.ABCDEF7.edu").is_err());
        assert!(parse_name("edu").is_err());
        assert!(parse_name("").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_labels() {
        assert!(parse_name("AA..ffff.ABCDEF7.edu").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_sequence() {
        assert!(parse_name("AA.zzzz.ABCDEF7.edu").is_err());
        assert!(parse_name("AA.fff.ABCDEF7.edu").is_err());
        assert!(parse_name("AA.fffff.ABCDEF7.edu").is_err());
    }

    #[test]
    fn test_poll_detection() {
        assert!(is_poll("ffff"));
        assert!(!is_poll("0000"));
        assert!(!is_poll("fffe"));
    }
}
