//! DNS tunnel server engine
//!
//! Answers tunnel queries over UDP and proxies their payloads to a real TCP
//! backend. Each session id owns at most one backend connection; the query
//! handler (data) and the poll handler share it under the session's mutex.
//! A reaper task evicts closed and idle sessions.

use crate::codec::{self, CLOSED_SENTINEL, EMPTY_SENTINEL, MAX_CHUNK_SIZE};
use crate::session::{is_poll, parse_name};
use crate::{Result, TunnelError, EDNS_UDP_SIZE};
use hickory_proto::op::{Edns, Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use log::{debug, info, warn};
use socket2::{SockRef, TcpKeepalive};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Duration, Instant};

/// Bounded backend read per poll; a timeout just means nothing is buffered.
const POLL_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Deadline for pushing one data payload into the backend.
const BACKEND_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Backend TCP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Keepalive period on the backend socket.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// How often the reaper sweeps the session table.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Sessions idle longer than this are evicted.
const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

type SessionTable = Arc<Mutex<HashMap<String, Arc<Session>>>>;

/// What a bounded backend read produced.
enum PollReply {
    Empty,
    Closed,
    Data(Vec<u8>),
}

struct SessionInner {
    conn: Option<TcpStream>,
    last_active: Instant,
    closed: bool,
}

/// One tunneled session: at most one backend connection, guarded by a mutex
/// so the data handler and the poll handler never interleave backend I/O.
struct Session {
    inner: Mutex<SessionInner>,
}

impl Session {
    fn with_conn(conn: TcpStream) -> Self {
        Self {
            inner: Mutex::new(SessionInner {
                conn: Some(conn),
                last_active: Instant::now(),
                closed: false,
            }),
        }
    }

    /// An entry keeps serving (possibly as a tombstone answering `CLOSED`)
    /// while it is closed or still connected; only a nulled-but-open slot
    /// calls for a redial.
    async fn reusable(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.closed || inner.conn.is_some()
    }

    /// Write one decoded payload to the backend under the write deadline.
    /// Any failure drops the connection slot; the next query redials.
    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(conn) = inner.conn.as_mut() else {
            return Err(TunnelError::BackendGone);
        };

        match timeout(BACKEND_WRITE_TIMEOUT, conn.write_all(data)).await {
            Ok(Ok(())) => {
                inner.last_active = Instant::now();
                Ok(())
            }
            Ok(Err(e)) => {
                inner.conn = None;
                Err(e.into())
            }
            Err(_) => {
                inner.conn = None;
                Err(io::Error::new(io::ErrorKind::TimedOut, "backend write timed out").into())
            }
        }
    }

    /// Bounded read of whatever the backend has buffered.
    async fn poll(&self) -> Result<PollReply> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(PollReply::Closed);
        }
        let Some(conn) = inner.conn.as_mut() else {
            return Ok(PollReply::Closed);
        };

        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        match timeout(POLL_READ_TIMEOUT, conn.read(&mut buf)).await {
            // Nothing buffered within the deadline.
            Err(_) => Ok(PollReply::Empty),
            Ok(Ok(0)) => {
                inner.closed = true;
                inner.conn = None;
                Ok(PollReply::Closed)
            }
            Ok(Ok(n)) => {
                inner.last_active = Instant::now();
                buf.truncate(n);
                Ok(PollReply::Data(buf))
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                inner.closed = true;
                inner.conn = None;
                Ok(PollReply::Closed)
            }
            Ok(Err(e)) => Err(e.into()),
        }
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        inner.conn = None;
    }

    async fn expired(&self, idle: Duration) -> bool {
        let inner = self.inner.lock().await;
        inner.closed || inner.last_active.elapsed() > idle
    }
}

/// DNS tunnel server: UDP DNS front, TCP backend per session.
pub struct DnsTunnelServer {
    socket: Arc<UdpSocket>,
    tcp_dest: String,
    sessions: SessionTable,
}

impl DnsTunnelServer {
    /// Bind the UDP DNS socket.
    pub async fn bind(listen_addr: SocketAddr, tcp_dest: String) -> Result<Self> {
        let socket = UdpSocket::bind(listen_addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            tcp_dest,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Address the DNS socket actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve queries forever: one task per inbound datagram, plus the reaper.
    pub async fn run(self) -> Result<()> {
        info!(
            "DNS server on {} (UDP), forwarding to {}",
            self.socket.local_addr()?,
            self.tcp_dest
        );

        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            reap_sessions(sessions).await;
        });

        let mut buf = vec![0u8; EDNS_UDP_SIZE as usize];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("recv_from failed: {}", e);
                    continue;
                }
            };

            let packet = buf[..len].to_vec();
            let socket = self.socket.clone();
            let sessions = self.sessions.clone();
            let tcp_dest = self.tcp_dest.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_packet(socket, sessions, tcp_dest, packet, src).await {
                    debug!("query from {} failed: {}", src, e);
                }
            });
        }
    }
}

/// Handle one inbound DNS message end to end.
async fn handle_packet(
    socket: Arc<UdpSocket>,
    sessions: SessionTable,
    tcp_dest: String,
    packet: Vec<u8>,
    src: SocketAddr,
) -> Result<()> {
    let request = Message::from_bytes(&packet)?;

    // Questionless messages get no reply at all.
    let Some(question) = request.queries().first().cloned() else {
        return Ok(());
    };

    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(request.op_code());
    reply.set_recursion_desired(request.recursion_desired());
    reply.set_recursion_available(true);
    reply.add_query(question.clone());

    let (udp_size, dnssec_ok) = match request.extensions() {
        Some(opt) => (opt.max_payload(), opt.dnssec_ok()),
        None => (EDNS_UDP_SIZE, false),
    };
    {
        let edns = reply.extensions_mut().get_or_insert_with(Edns::new);
        edns.set_max_payload(udp_size);
        edns.set_dnssec_ok(dnssec_ok);
    }

    let name = question.name().to_string();
    debug!("query from {}: {}", src, name);

    let parsed = match parse_name(&name) {
        Ok(parsed) => parsed,
        Err(_) => {
            debug!("malformed query name: {}", name);
            reply.set_response_code(ResponseCode::FormErr);
            return send_reply(&socket, &reply, src).await;
        }
    };

    let session = match get_session(&sessions, &tcp_dest, &parsed.session_id).await {
        Ok(session) => session,
        Err(e) => {
            warn!(
                "backend connection for session {} failed: {}",
                parsed.session_id, e
            );
            reply.set_response_code(ResponseCode::ServFail);
            return send_reply(&socket, &reply, src).await;
        }
    };

    let txt_strings = if is_poll(&parsed.seq) {
        match session.poll().await {
            Ok(PollReply::Empty) => vec![EMPTY_SENTINEL.to_string()],
            Ok(PollReply::Closed) => vec![CLOSED_SENTINEL.to_string()],
            Ok(PollReply::Data(bytes)) => {
                debug!(
                    "session {}: {} backend bytes -> poll answer",
                    parsed.session_id,
                    bytes.len()
                );
                codec::encode(&bytes)
                    .split('.')
                    .map(str::to_string)
                    .collect()
            }
            Err(e) => {
                warn!("poll for session {} failed: {}", parsed.session_id, e);
                reply.set_response_code(ResponseCode::ServFail);
                return send_reply(&socket, &reply, src).await;
            }
        }
    } else {
        let data = match codec::decode(&parsed.payload) {
            Ok(data) => data,
            Err(_) => {
                debug!("undecodable payload from session {}", parsed.session_id);
                reply.set_response_code(ResponseCode::FormErr);
                return send_reply(&socket, &reply, src).await;
            }
        };

        if !data.is_empty() {
            debug!(
                "session {}: {} bytes -> backend",
                parsed.session_id,
                data.len()
            );
            if let Err(e) = session.write(&data).await {
                warn!(
                    "backend write for session {} failed: {}",
                    parsed.session_id, e
                );
                reply.set_response_code(ResponseCode::ServFail);
                return send_reply(&socket, &reply, src).await;
            }
        }

        vec![EMPTY_SENTINEL.to_string()]
    };

    let mut answer = Record::with(question.name().clone(), RecordType::TXT, 0);
    answer.set_data(Some(RData::TXT(TXT::new(txt_strings))));
    reply.add_answer(answer);

    send_reply(&socket, &reply, src).await
}

async fn send_reply(socket: &UdpSocket, reply: &Message, dst: SocketAddr) -> Result<()> {
    let wire = reply.to_bytes()?;
    socket.send_to(&wire, dst).await?;
    Ok(())
}

/// Fetch the session for an id, dialing the backend when the entry is absent
/// or its connection slot was nulled by a write failure. Closed entries are
/// returned as-is so later polls keep answering `"CLOSED"` until the reaper
/// removes them.
async fn get_session(
    sessions: &SessionTable,
    tcp_dest: &str,
    session_id: &str,
) -> Result<Arc<Session>> {
    let mut table = sessions.lock().await;

    if let Some(existing) = table.get(session_id) {
        if existing.reusable().await {
            return Ok(existing.clone());
        }
    }

    let conn = dial_backend(tcp_dest).await?;
    let session = Arc::new(Session::with_conn(conn));
    table.insert(session_id.to_string(), session.clone());
    info!("session {} connected to backend {}", session_id, tcp_dest);

    Ok(session)
}

/// Dial the backend over IPv4 only, with connect timeout and keepalive.
async fn dial_backend(tcp_dest: &str) -> Result<TcpStream> {
    let (host, port) = tcp_dest
        .rsplit_once(':')
        .ok_or_else(|| TunnelError::InvalidConfig(format!("invalid address {}", tcp_dest)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| TunnelError::InvalidConfig(format!("invalid port in {}", tcp_dest)))?;

    let addr = lookup_host((host, port))
        .await?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| TunnelError::NoIpv4(host.to_string()))?;

    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "backend connect timed out"))??;

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

    Ok(stream)
}

/// Periodically drop sessions that are closed or idle past the threshold.
async fn reap_sessions(sessions: SessionTable) {
    loop {
        sleep(REAP_INTERVAL).await;

        let mut table = sessions.lock().await;
        let mut dead = Vec::new();
        for (session_id, session) in table.iter() {
            if session.expired(SESSION_IDLE_TIMEOUT).await {
                dead.push(session_id.clone());
            }
        }

        for session_id in dead {
            if let Some(session) = table.remove(&session_id) {
                session.close().await;
                info!("reaped session {}", session_id);
            }
        }
    }
}
