//! Message-oriented RPC transport over non-blocking UDP.
//!
//! An [`Endpoint`] is created and used from exactly one OS thread (the I/O thread of the owning
//! node). `pump_once` drains the socket and invokes the registered per-type request handlers and
//! the response continuations inline on that thread; no transport call is legal from anywhere
//! else, which is enforced by `Endpoint` not being `Sync` and never leaving its thread.
//!
//! Every datagram carries a one-byte frame kind, the 8-bit request-type id and a 64-bit call id,
//! followed by the message bytes. Sessions are resolved peer addresses probed with a ping/pong
//! handshake at setup. Outgoing messages are staged in pooled buffers; the pool's outstanding
//! count returning to zero after shutdown is the leak check the tests assert.

use crate::buffer_pool::{BufferPool, LARGE_BUFFER_SIZE};
use crate::clock::{now_ns, Timestamp};
use crate::error::Error;
use log::{debug, warn};
use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

const FRAME_REQUEST: u8 = 0;
const FRAME_RESPONSE: u8 = 1;
const FRAME_PING: u8 = 2;
const FRAME_PONG: u8 = 3;
const FRAME_HEADER: usize = 10;
/// Datagrams drained per `pump_once` call before yielding back to the caller.
const PUMP_BATCH: usize = 64;

/// Index of a resolved peer within an endpoint.
pub type SessionId = usize;

/// Handle identifying an in-flight inbound request; passed back to
/// [`EndpointCore::enqueue_response`] by the I/O thread.
#[derive(Debug, Clone)]
pub struct ReqHandle {
    pub peer: SocketAddr,
    pub call_id: u64,
    pub req_type: u8,
}

impl ReqHandle {
    /// Placeholder handle for tasks constructed outside a transport context (tests).
    pub fn synthetic() -> ReqHandle {
        ReqHandle {
            peer: SocketAddr::from(([127, 0, 0, 1], 0)),
            call_id: 0,
            req_type: 0,
        }
    }
}

type Handler = Box<dyn FnMut(&mut EndpointCore, ReqHandle, &[u8]) + Send>;
type Continuation = Box<dyn FnOnce(&mut EndpointCore, Option<&[u8]>) + Send>;

struct PendingCall {
    continuation: Continuation,
    issued_at: Timestamp,
}

struct Session {
    peer: SocketAddr,
    connected: bool,
}

/// Socket-facing half of the endpoint, usable from inside handlers.
pub struct EndpointCore {
    socket: UdpSocket,
    local_addr: SocketAddr,
    sessions: Vec<Session>,
    pending: HashMap<u64, PendingCall>,
    next_call_id: u64,
    pool: Arc<BufferPool>,
}

impl EndpointCore {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Resolve a peer address into a session slot and send the connect probe.
    pub fn create_session(&mut self, addr: &str) -> Result<SessionId, Error> {
        let peer: SocketAddr = addr
            .parse()
            .map_err(|e| Error::TransportInit(format!("bad peer address {addr}: {e}")))?;
        let id = self.sessions.len();
        self.sessions.push(Session {
            peer,
            connected: false,
        });
        self.send_frame(peer, FRAME_PING, 0, 0, &[])?;
        Ok(id)
    }

    pub fn is_connected(&self, session: SessionId) -> bool {
        self.sessions
            .get(session)
            .map(|s| s.connected)
            .unwrap_or(false)
    }

    /// Send a request to a session peer; `continuation` fires on the pump thread when the
    /// matching response arrives (with `Some(bytes)`) or when the call is expired (`None`).
    pub fn enqueue_request(
        &mut self,
        session: SessionId,
        req_type: u8,
        msg: &[u8],
        continuation: Continuation,
    ) -> Result<u64, Error> {
        let peer = self
            .sessions
            .get(session)
            .ok_or_else(|| Error::TransportInit(format!("unknown session {session}")))?
            .peer;
        let call_id = self.next_call_id;
        self.next_call_id += 1;
        self.pending.insert(
            call_id,
            PendingCall {
                continuation,
                issued_at: now_ns(),
            },
        );
        self.send_frame(peer, FRAME_REQUEST, req_type, call_id, msg)?;
        Ok(call_id)
    }

    /// Send the response for an inbound request back to its originator.
    pub fn enqueue_response(&mut self, handle: &ReqHandle, msg: &[u8]) -> Result<(), Error> {
        self.send_frame(handle.peer, FRAME_RESPONSE, handle.req_type, handle.call_id, msg)
    }

    /// Expire pending calls older than `max_age_ns`, firing their continuations with `None`.
    pub fn expire_calls(&mut self, max_age_ns: u64) {
        let now = now_ns();
        let stale: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, call)| now.saturating_sub(call.issued_at) > max_age_ns)
            .map(|(id, _)| *id)
            .collect();
        for call_id in stale {
            if let Some(call) = self.pending.remove(&call_id) {
                debug!("transport: call {call_id} expired");
                (call.continuation)(self, None);
            }
        }
    }

    /// In-flight outbound calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn send_frame(
        &self,
        peer: SocketAddr,
        kind: u8,
        req_type: u8,
        call_id: u64,
        msg: &[u8],
    ) -> Result<(), Error> {
        let total = FRAME_HEADER + msg.len();
        let mut lease = self.pool.lease(total);
        let buf = lease.as_mut_slice();
        buf[0] = kind;
        buf[1] = req_type;
        buf[2..10].copy_from_slice(&call_id.to_le_bytes());
        buf[FRAME_HEADER..total].copy_from_slice(msg);
        match self.socket.send_to(&buf[..total], peer) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                warn!("transport: send to {peer} would block, dropping frame");
                Ok(())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// A single-threaded UDP endpoint: the core plus the registered request handlers.
pub struct Endpoint {
    core: EndpointCore,
    handlers: HashMap<u8, Handler>,
    recv_buf: Vec<u8>,
}

impl Endpoint {
    /// Bind an endpoint on `bind_addr` (port 0 picks an ephemeral port).
    pub fn bind(bind_addr: &str) -> Result<Endpoint, Error> {
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| Error::TransportInit(format!("bind {bind_addr}: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::TransportInit(format!("set_nonblocking: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| Error::TransportInit(format!("local_addr: {e}")))?;
        Ok(Endpoint {
            core: EndpointCore {
                socket,
                local_addr,
                sessions: Vec::new(),
                pending: HashMap::new(),
                next_call_id: 1,
                pool: BufferPool::new(),
            },
            handlers: HashMap::new(),
            recv_buf: vec![0u8; FRAME_HEADER + LARGE_BUFFER_SIZE],
        })
    }

    /// Register the handler invoked for inbound requests of `req_type`.
    pub fn register_handler(
        &mut self,
        req_type: u8,
        handler: impl FnMut(&mut EndpointCore, ReqHandle, &[u8]) + Send + 'static,
    ) {
        self.handlers.insert(req_type, Box::new(handler));
    }

    pub fn core(&mut self) -> &mut EndpointCore {
        &mut self.core
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.core.pool
    }

    /// Drain up to one batch of datagrams, dispatching handlers and continuations inline.
    /// Returns the number of frames processed.
    pub fn pump_once(&mut self) -> usize {
        let mut processed = 0;
        for _ in 0..PUMP_BATCH {
            let (len, peer) = match self.core.socket.recv_from(&mut self.recv_buf) {
                Ok(ok) => ok,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("transport: recv error: {e}");
                    break;
                }
            };
            if len < FRAME_HEADER {
                debug!("transport: runt frame ({len} bytes) from {peer}");
                continue;
            }
            processed += 1;
            let kind = self.recv_buf[0];
            let req_type = self.recv_buf[1];
            let call_id = u64::from_le_bytes(self.recv_buf[2..10].try_into().unwrap());
            match kind {
                FRAME_REQUEST => {
                    let handle = ReqHandle {
                        peer,
                        call_id,
                        req_type,
                    };
                    if let Some(handler) = self.handlers.get_mut(&req_type) {
                        handler(&mut self.core, handle, &self.recv_buf[FRAME_HEADER..len]);
                    } else {
                        warn!("transport: no handler for request type {req_type}, dropping");
                    }
                }
                FRAME_RESPONSE => match self.core.pending.remove(&call_id) {
                    Some(call) => {
                        (call.continuation)(&mut self.core, Some(&self.recv_buf[FRAME_HEADER..len]));
                    }
                    None => {
                        debug!("transport: response for unknown call {call_id} from {peer}, dropping");
                    }
                },
                FRAME_PING => {
                    if let Err(e) = self.core.send_frame(peer, FRAME_PONG, 0, call_id, &[]) {
                        warn!("transport: pong to {peer} failed: {e}");
                    }
                }
                FRAME_PONG => {
                    for session in &mut self.core.sessions {
                        if session.peer == peer {
                            session.connected = true;
                        }
                    }
                }
                other => {
                    debug!("transport: unknown frame kind {other} from {peer}");
                }
            }
        }
        processed
    }

    /// Pump until every session handshake completes or `timeout_ns` elapses.
    /// Returns the session ids that failed to connect.
    pub fn wait_connected(&mut self, timeout_ns: u64) -> Vec<SessionId> {
        let deadline = now_ns() + timeout_ns;
        let mut last_probe = 0u64;
        loop {
            self.pump_once();
            let unconnected: Vec<SessionId> = self
                .core
                .sessions
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.connected)
                .map(|(i, _)| i)
                .collect();
            if unconnected.is_empty() {
                return Vec::new();
            }
            let now = now_ns();
            if now >= deadline {
                return unconnected;
            }
            // Reissue probes every 50 ms in case the first ping raced the peer's bind.
            if now.saturating_sub(last_probe) > 50_000_000 {
                for idx in &unconnected {
                    let peer = self.core.sessions[*idx].peer;
                    let _ = self.core.send_frame(peer, FRAME_PING, 0, 0, &[]);
                }
                last_probe = now;
            }
            std::hint::spin_loop();
        }
    }
}

/// Pick the local IPv4 address whose dotted form starts with `subnet_prefix`,
/// falling back to loopback when no interface matches.
#[cfg(unix)]
pub fn local_ip_for_subnet(subnet_prefix: &str) -> String {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    let mut result = String::from("127.0.0.1");
    unsafe {
        if libc::getifaddrs(&mut ifap) != 0 {
            return result;
        }
        let mut cursor = ifap;
        while !cursor.is_null() {
            let entry = &*cursor;
            if !entry.ifa_addr.is_null()
                && (*entry.ifa_addr).sa_family == libc::AF_INET as libc::sa_family_t
            {
                let sin = entry.ifa_addr as *const libc::sockaddr_in;
                let raw = u32::from_be((*sin).sin_addr.s_addr);
                let ip = std::net::Ipv4Addr::from(raw);
                if ip.to_string().starts_with(subnet_prefix) {
                    result = ip.to_string();
                    break;
                }
            }
            cursor = entry.ifa_next;
        }
        libc::freeifaddrs(ifap);
    }
    result
}

#[cfg(not(unix))]
pub fn local_ip_for_subnet(_subnet_prefix: &str) -> String {
    String::from("127.0.0.1")
}
