//! DNS tunnel client engine
//!
//! Accepts local TCP connections and runs two tasks per connection: an uplink
//! reader that ships local bytes as data queries, and a downlink poller that
//! solicits backend bytes on a fixed cadence. DNS is request/response only,
//! so the downlink is always pulled, never pushed.

use crate::codec::{self, CLOSED_SENTINEL, EMPTY_SENTINEL, MAX_CHUNK_SIZE};
use crate::session::{compose_name, generate_session_id, POLL_PAYLOAD};
use crate::{Result, TunnelError, EDNS_UDP_SIZE};
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use log::{debug, info, warn};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout, Duration};

/// Attempts per DNS exchange before the connection is torn down.
const MAX_RETRIES: u32 = 3;

/// Pause between retry attempts.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Downlink poll cadence while the backend has nothing buffered.
const POLL_DELAY: Duration = Duration::from_millis(100);

/// Receive deadline for a single DNS exchange.
const DNS_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(2);

/// Raw bytes per data query; one uplink read fans out into queries of at
/// most this size.
const MAX_SUBCHUNK_SIZE: usize = 100;

/// What a single DNS exchange yielded.
enum Reply {
    /// No downlink bytes pending (or a bare ack).
    Empty,
    /// Server marked the session closed.
    Closed,
    /// Decoded downlink bytes.
    Data(Vec<u8>),
}

/// DNS tunnel client: local TCP listener plus resolver coordinates.
pub struct DnsTunnelClient {
    listener: TcpListener,
    dns_server: SocketAddr,
    tld: String,
}

impl DnsTunnelClient {
    /// Bind the local TCP listener.
    pub async fn bind(listen_addr: SocketAddr, dns_server: SocketAddr, tld: String) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        Ok(Self {
            listener,
            dns_server,
            tld,
        })
    }

    /// Address the local listener actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever. Every accept gets a fresh session id and
    /// therefore a fresh backend connection on the server.
    pub async fn run(self) -> Result<()> {
        info!(
            "TCP listener on {}, tunneling via DNS server {}",
            self.listener.local_addr()?,
            self.dns_server
        );

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            };

            let session_id = generate_session_id();
            info!("connection from {} -> session {}", peer, session_id);

            let exchanger = Arc::new(DnsExchanger {
                server: self.dns_server,
                session_id,
                tld: self.tld.clone(),
            });

            tokio::spawn(async move {
                match handle_connection(stream, exchanger).await {
                    Ok(()) => debug!("session finished"),
                    Err(e) => debug!("session ended: {}", e),
                }
            });
        }
    }
}

/// Drive one local connection until EOF, error, or a `"CLOSED"` sentinel.
async fn handle_connection(stream: TcpStream, dns: Arc<DnsExchanger>) -> Result<()> {
    let (read_half, write_half) = stream.into_split();

    let mut uplink = tokio::spawn(uplink_loop(read_half, dns.clone()));
    let mut downlink = tokio::spawn(poll_loop(write_half, dns));

    // First task to finish decides the session's fate; the other is torn
    // down with it.
    let finished = tokio::select! {
        res = &mut uplink => {
            downlink.abort();
            res
        }
        res = &mut downlink => {
            uplink.abort();
            res
        }
    };

    match finished {
        Ok(inner) => inner,
        Err(join_err) if join_err.is_cancelled() => Ok(()),
        Err(join_err) => Err(TunnelError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            join_err,
        ))),
    }
}

/// Read from the local socket and ship every read as one or more data
/// queries. Each subchunk completes its DNS exchange before the next is
/// sent, which is what keeps uplink bytes ordered.
async fn uplink_loop(mut local: OwnedReadHalf, dns: Arc<DnsExchanger>) -> Result<()> {
    let mut buffer = vec![0u8; MAX_CHUNK_SIZE];
    let mut sequence: u16 = 0;

    loop {
        let n = local.read(&mut buffer).await?;
        if n == 0 {
            debug!("local socket EOF, uplink done");
            return Ok(());
        }

        for chunk in buffer[..n].chunks(MAX_SUBCHUNK_SIZE) {
            dns.send_data(chunk, sequence).await?;
            sequence = sequence.wrapping_add(1);
        }
    }
}

/// Poll for downlink bytes and write them to the local socket in arrival
/// order. Sleeps only when the server had nothing, so bursts drain fast.
async fn poll_loop(mut local: OwnedWriteHalf, dns: Arc<DnsExchanger>) -> Result<()> {
    loop {
        match dns.poll().await? {
            Reply::Empty => sleep(POLL_DELAY).await,
            Reply::Closed => {
                debug!("server reported session closed");
                return Err(TunnelError::SessionClosed);
            }
            Reply::Data(bytes) => {
                debug!("poll returned {} bytes", bytes.len());
                local.write_all(&bytes).await?;
            }
        }
    }
}

/// Stateless query sender for one session.
struct DnsExchanger {
    server: SocketAddr,
    session_id: String,
    tld: String,
}

impl DnsExchanger {
    /// Ship one data subchunk under the given sequence number.
    async fn send_data(&self, chunk: &[u8], sequence: u16) -> Result<()> {
        let name = compose_name(&codec::encode(chunk), sequence, &self.session_id, &self.tld);
        debug!(
            "data query seq={:04x} ({} bytes): {}",
            sequence,
            chunk.len(),
            name
        );
        self.send_query(&name).await?;
        Ok(())
    }

    /// Solicit pending downlink bytes.
    async fn poll(&self) -> Result<Reply> {
        let name = compose_name(POLL_PAYLOAD, 0xffff, &self.session_id, &self.tld);
        self.send_query(&name).await
    }

    /// One DNS TXT exchange with retry on timeout and non-success RCODE.
    ///
    /// Each attempt uses a fresh ephemeral socket so a late answer to an
    /// earlier attempt cannot be mistaken for the current one. Errors other
    /// than timeouts and refusals fail the session immediately.
    async fn send_query(&self, name: &str) -> Result<Reply> {
        let fqdn = Name::from_ascii(format!("{}.", name))?;

        let mut msg = Message::new();
        msg.set_id(rand::thread_rng().gen());
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(fqdn, RecordType::TXT));

        let edns = msg.extensions_mut().get_or_insert_with(Edns::new);
        edns.set_max_payload(EDNS_UDP_SIZE);

        let wire = msg.to_bytes()?;

        for attempt in 1..=MAX_RETRIES {
            let bind_addr: SocketAddr = if self.server.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let socket = UdpSocket::bind(bind_addr).await?;
            socket.connect(self.server).await?;
            socket.send(&wire).await?;

            let mut buf = vec![0u8; EDNS_UDP_SIZE as usize];
            let n = match timeout(DNS_EXCHANGE_TIMEOUT, socket.recv(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => {
                    debug!(
                        "query timed out, attempt {} of {}",
                        attempt, MAX_RETRIES
                    );
                    sleep(RETRY_DELAY).await;
                    continue;
                }
            };

            let response = Message::from_bytes(&buf[..n])?;
            if response.response_code() != ResponseCode::NoError {
                debug!(
                    "query returned {}, attempt {} of {}",
                    response.response_code(),
                    attempt,
                    MAX_RETRIES
                );
                sleep(RETRY_DELAY).await;
                continue;
            }

            let Some(answer) = response.answers().first() else {
                return Ok(Reply::Empty);
            };
            let Some(RData::TXT(txt)) = answer.data() else {
                return Ok(Reply::Empty);
            };

            let text: String = txt
                .txt_data()
                .iter()
                .map(|s| String::from_utf8_lossy(s))
                .collect();

            return match text.as_str() {
                "" | EMPTY_SENTINEL => Ok(Reply::Empty),
                CLOSED_SENTINEL => Ok(Reply::Closed),
                _ => Ok(Reply::Data(codec::decode(&text)?)),
            };
        }

        Err(TunnelError::MaxRetries)
    }
}
