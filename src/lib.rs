//! Burrow: TCP-over-DNS tunnel
//!
//! Burrow smuggles arbitrary TCP byte streams through DNS queries and
//! responses, letting a client behind a restrictive egress filter (where only
//! outbound UDP/53 is reachable) talk to a remote TCP service.
//!
//! The client side accepts a local TCP connection and encodes its bytes as
//! base32 labels of TXT queries; the server side answers those queries,
//! terminates a real TCP connection to the configured backend, and relays
//! backend bytes back inside TXT answers. Because DNS is strictly
//! request/response, the downlink is *pulled*: the client polls on a short
//! cadence and writes whatever comes back to the local socket.
//!
//! ## Quick start
//!
//! ```bash
//! # Server: answer DNS on UDP 53, forward to an SSH daemon
//! sudo burrow server --listen 0.0.0.0:53 --dest 10.0.0.1:22
//!
//! # Client: expose the tunnel as a local TCP port
//! burrow client --listen 127.0.0.1:2222 --dest 8.8.8.8:53
//! ssh -p 2222 user@127.0.0.1
//! ```
//!
//! ## Architecture
//!
//! ```text
//! local TCP ──► client engine ──► TXT query ──► resolver ──► server engine ──► backend TCP
//!           ◄── client engine ◄── TXT answer ◄── resolver ◄── server engine ◄──
//! ```
//!
//! One local connection maps to one session id maps to one backend TCP
//! connection; there is no multiplexing, retransmission of application bytes,
//! or encryption. The transport looks syntactically like DNS and nothing more.

pub mod client;
pub mod codec;
pub mod config;
pub mod server;
pub mod session;

pub use client::DnsTunnelClient;
pub use config::{BurrowConfig, ClientConfig, ServerConfig, TunnelMode};
pub use server::DnsTunnelServer;

/// UDP payload size advertised via EDNS0 so TXT answers can exceed 512 bytes.
pub const EDNS_UDP_SIZE: u16 = 4096;

/// Burrow error types
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Payload labels did not decode as base32
    #[error("base32 decode error")]
    Decode,

    /// Trailing XOR checksum did not match
    #[error("checksum mismatch")]
    Checksum,

    /// Query name does not follow the `<data>.<seq>.<sid>.<tld>` shape
    #[error("malformed query name: {0}")]
    BadName(String),

    /// The peer reported the session as closed
    #[error("session closed")]
    SessionClosed,

    /// Session has no live backend connection to serve this request
    #[error("no backend connection")]
    BackendGone,

    /// All DNS query attempts timed out or were refused
    #[error("max retries exceeded")]
    MaxRetries,

    /// Backend host resolved, but not to any IPv4 address
    #[error("no IPv4 address found for {0}")]
    NoIpv4(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// DNS message encode/decode error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
