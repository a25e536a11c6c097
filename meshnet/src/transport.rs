//! The transport boundary: I/O readiness polling, connection lifecycle events and framed sends,
//! abstracted behind the `Transport` trait so the engine can drive either a real `mio`-backed
//! TCP socket or an in-memory double without changing its own code.
//!
//! Four named pipelines — `Unreliable`, `Reliable`, `UnreliableSequenced` and `Fragmented` — are
//! exposed as if the wire could offer per-message delivery guarantees. A single TCP byte stream
//! can't: everything on it is reliable and ordered. Rather than fake the other three,
//! `TcpTransport` accepts all four `PipelineKind` values and serves every one of them with the
//! same reliable, ordered guarantee (recorded as a deliberate simplification in DESIGN.md).

use crate::connection::Uid;
use crate::frame::{FrameHeader, Metadata, TRAILER_SIZE};
use byteorder::{LittleEndian, WriteBytesExt};
use mio::tcp::{TcpListener, TcpStream};
use mio::{Event, Events, Poll, PollOpt, Ready, Token};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

/// The pipeline a send was requested on; see module docs for how this engine's single TCP
/// transport answers all four.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum PipelineKind {
    Unreliable = 0,
    Reliable = 1,
    UnreliableSequenced = 2,
    Fragmented = 3,
}

/// One connection-lifecycle or data event drained from the transport this tick.
#[derive(Debug)]
pub enum ConnectionEvent {
    Connect,
    Data(Vec<u8>),
    Disconnect,
}

/// A handle returned by `begin_send`, good for exactly one `commit_send` or `abort_send` call.
/// Already carries the frame header (metadata byte and key), written at `begin_send` time; the
/// caller appends the payload via `write_to` before committing.
#[derive(Debug)]
pub struct SendHandle {
    uid: Uid,
    kind: PipelineKind,
    buf: Vec<u8>,
}

fn new_send_handle(uid: Uid, kind: PipelineKind, metadata: Metadata, key: u16) -> SendHandle {
    let mut buf = Vec::new();
    FrameHeader { metadata, key }
        .write(&mut buf)
        .expect("writing a frame header into a Vec<u8> cannot fail");
    SendHandle { uid, kind, buf }
}

/// A live connection tracked by `TcpTransport`: the socket plus its buffered, not-yet-dispatched
/// inbound bytes.
struct Peer {
    stream: TcpStream,
    uid: Uid,
    inbound: Vec<u8>,
    pending_events: Vec<ConnectionEvent>,
    read_buf: [u8; 4096],
}

/// Transport abstraction the engine drives once per tick. `TcpTransport` is the concrete
/// production implementation; `LoopbackTransport` (test-only) is an in-memory double used by
/// integration tests that don't want to open real sockets.
pub trait Transport: Send {
    /// Binds a listening socket for server-side use. A no-op for client-side transports.
    fn bind(&mut self, addr: SocketAddr) -> io::Result<()>;

    /// Initiates an outbound connection (client side).
    fn connect(&mut self, addr: SocketAddr) -> io::Result<Uid>;

    /// Drives one iteration of I/O readiness polling, with up to `timeout` spent blocking if
    /// nothing is ready yet. Newly accepted connections and newly readable data are queued as
    /// events, retrievable via `pop_event`.
    fn poll(&mut self, timeout: Duration) -> io::Result<()>;

    /// Pops the next queued event for `uid`, if any.
    fn pop_event(&mut self, uid: Uid) -> Option<ConnectionEvent>;

    /// All `Uid`s with at least one queued event.
    fn pending_uids(&self) -> Vec<Uid>;

    /// Begins a send on `pipeline` to `uid`, writing the frame header (`metadata`, `key`) into
    /// the returned handle. Returns `None` if `uid` is not a live connection — the caller must
    /// treat this the same as a pipeline-level discard.
    fn begin_send(&self, uid: Uid, pipeline: PipelineKind, metadata: Metadata, key: u16) -> Option<SendHandle>;

    /// Appends payload bytes to an in-flight send. Returns `false` (and leaves the handle
    /// usable) if the write would exceed the implementation's maximum frame size.
    fn write_to(&self, handle: &mut SendHandle, bytes: &[u8]) -> bool;

    /// Appends the trailing total-length field and flushes a send handle's buffered bytes to the
    /// wire, consuming the handle.
    fn commit_send(&mut self, handle: SendHandle) -> io::Result<()>;

    /// Discards a send handle's buffered bytes without writing anything.
    fn abort_send(&self, _handle: SendHandle) {}

    /// Forcibly disconnects `uid`.
    fn disconnect(&mut self, uid: Uid);

    fn is_connected(&self, uid: Uid) -> bool;
}

/// Concrete `mio`-backed transport. Runs both the listening-socket accept loop (server side,
/// when `bind` was called) and per-connection read/write readiness, collapsed into a single
/// `Poll` instance distinguishing tokens by range.
pub struct TcpTransport {
    poll: Poll,
    listener: Option<TcpListener>,
    listener_token: Token,
    peers: HashMap<Token, Peer>,
    uid_to_token: HashMap<Uid, Token>,
    uid_allocator: crate::connection::UidAllocator,
    next_token: usize,
}

const LISTENER_TOKEN: Token = Token(0);

impl TcpTransport {
    pub fn new() -> io::Result<TcpTransport> {
        Ok(TcpTransport {
            poll: Poll::new()?,
            listener: None,
            listener_token: LISTENER_TOKEN,
            peers: HashMap::new(),
            uid_to_token: HashMap::new(),
            uid_allocator: crate::connection::UidAllocator::new(),
            next_token: 1,
        })
    }

    fn register_peer(&mut self, stream: TcpStream, uid: Uid) -> io::Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .register(&stream, token, Ready::readable(), PollOpt::edge())?;

        self.peers.insert(
            token,
            Peer {
                stream,
                uid,
                inbound: Vec::new(),
                pending_events: vec![ConnectionEvent::Connect],
                read_buf: [0u8; 4096],
            },
        );
        self.uid_to_token.insert(uid, token);
        Ok(())
    }

    fn handle_event(&mut self, event: &Event) -> io::Result<()> {
        if event.token() == self.listener_token {
            return self.accept_all();
        }

        let drop_peer = {
            let peer = match self.peers.get_mut(&event.token()) {
                Some(peer) => peer,
                None => return Ok(()),
            };

            if event.readiness().is_readable() {
                match peer.stream.read(&mut peer.read_buf) {
                    Ok(0) => true,
                    Ok(n) => {
                        peer.inbound.extend_from_slice(&peer.read_buf[..n]);
                        let data = std::mem::take(&mut peer.inbound);
                        peer.pending_events.push(ConnectionEvent::Data(data));
                        false
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => false,
                    Err(_) => true,
                }
            } else {
                false
            }
        };

        if drop_peer {
            if let Some(peer) = self.peers.get_mut(&event.token()) {
                peer.pending_events.push(ConnectionEvent::Disconnect);
            }
        }
        Ok(())
    }

    fn accept_all(&mut self) -> io::Result<()> {
        let listener = match &self.listener {
            Some(listener) => listener,
            None => return Ok(()),
        };

        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let uid = self.uid_allocator.allocate();
                    self.register_peer(stream, uid)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn bind(&mut self, addr: SocketAddr) -> io::Result<()> {
        let listener = TcpListener::bind(&addr)?;
        self.poll
            .register(&listener, self.listener_token, Ready::readable(), PollOpt::edge())?;
        self.listener = Some(listener);
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<Uid> {
        let stream = TcpStream::connect(&addr)?;
        let uid = self.uid_allocator.allocate();
        self.register_peer(stream, uid)?;
        Ok(uid)
    }

    fn poll(&mut self, timeout: Duration) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        self.poll.poll(&mut events, Some(timeout))?;
        for event in &events {
            self.handle_event(&event)?;
        }
        Ok(())
    }

    fn pop_event(&mut self, uid: Uid) -> Option<ConnectionEvent> {
        let token = *self.uid_to_token.get(&uid)?;
        let peer = self.peers.get_mut(&token)?;
        if peer.pending_events.is_empty() {
            None
        } else {
            Some(peer.pending_events.remove(0))
        }
    }

    fn pending_uids(&self) -> Vec<Uid> {
        self.peers
            .values()
            .filter(|peer| !peer.pending_events.is_empty())
            .map(|peer| peer.uid)
            .collect()
    }

    fn begin_send(&self, uid: Uid, pipeline: PipelineKind, metadata: Metadata, key: u16) -> Option<SendHandle> {
        if !self.is_connected(uid) {
            return None;
        }
        Some(new_send_handle(uid, pipeline, metadata, key))
    }

    fn write_to(&self, handle: &mut SendHandle, bytes: &[u8]) -> bool {
        const MAX_FRAME: usize = 64 * 1024;
        if handle.buf.len() + bytes.len() > MAX_FRAME {
            return false;
        }
        handle.buf.extend_from_slice(bytes);
        true
    }

    fn commit_send(&mut self, handle: SendHandle) -> io::Result<()> {
        let _ = handle.kind;
        let token = match self.uid_to_token.get(&handle.uid) {
            Some(token) => *token,
            None => return Ok(()),
        };
        let total_length = handle.buf.len() + TRAILER_SIZE;
        let mut buf = handle.buf;
        buf.write_u32::<LittleEndian>(total_length as u32)?;
        if let Some(peer) = self.peers.get_mut(&token) {
            peer.stream.write_all(&buf)?;
        }
        Ok(())
    }

    fn disconnect(&mut self, uid: Uid) {
        if let Some(token) = self.uid_to_token.remove(&uid) {
            if let Some(peer) = self.peers.remove(&token) {
                let _ = self.poll.deregister(&peer.stream);
            }
        }
    }

    fn is_connected(&self, uid: Uid) -> bool {
        self.uid_to_token.contains_key(&uid)
    }
}

/// An in-memory `Transport` double for tests. Connections are simulated as paired byte queues;
/// `poll` is a no-op since there's no real I/O readiness to wait for.
pub struct LoopbackTransport {
    connections: HashMap<Uid, LoopbackPeer>,
    uid_allocator: crate::connection::UidAllocator,
}

struct LoopbackPeer {
    pending_events: std::collections::VecDeque<ConnectionEvent>,
    sent: Vec<Vec<u8>>,
    connected: bool,
}

impl LoopbackTransport {
    pub fn new() -> LoopbackTransport {
        LoopbackTransport {
            connections: HashMap::new(),
            uid_allocator: crate::connection::UidAllocator::new(),
        }
    }

    /// Test helper: simulates a client connecting and returns the `Uid` assigned to it.
    pub fn simulate_connect(&mut self) -> Uid {
        let uid = self.uid_allocator.allocate();
        self.connections.insert(
            uid,
            LoopbackPeer {
                pending_events: std::collections::VecDeque::from(vec![ConnectionEvent::Connect]),
                sent: Vec::new(),
                connected: true,
            },
        );
        uid
    }

    /// Test helper: injects inbound bytes as if they'd arrived over the wire.
    pub fn simulate_data(&mut self, uid: Uid, bytes: Vec<u8>) {
        if let Some(peer) = self.connections.get_mut(&uid) {
            peer.pending_events.push_back(ConnectionEvent::Data(bytes));
        }
    }

    /// Test helper: inspects what a prior `commit_send` wrote for `uid`.
    pub fn sent_frames(&self, uid: Uid) -> &[Vec<u8>] {
        self.connections.get(&uid).map(|p| p.sent.as_slice()).unwrap_or(&[])
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn bind(&mut self, _addr: SocketAddr) -> io::Result<()> {
        Ok(())
    }

    fn connect(&mut self, _addr: SocketAddr) -> io::Result<Uid> {
        Ok(self.simulate_connect())
    }

    fn poll(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn pop_event(&mut self, uid: Uid) -> Option<ConnectionEvent> {
        self.connections.get_mut(&uid)?.pending_events.pop_front()
    }

    fn pending_uids(&self) -> Vec<Uid> {
        self.connections
            .iter()
            .filter(|(_, p)| !p.pending_events.is_empty())
            .map(|(uid, _)| *uid)
            .collect()
    }

    fn begin_send(&self, uid: Uid, kind: PipelineKind, metadata: Metadata, key: u16) -> Option<SendHandle> {
        if self.is_connected(uid) {
            Some(new_send_handle(uid, kind, metadata, key))
        } else {
            None
        }
    }

    fn write_to(&self, handle: &mut SendHandle, bytes: &[u8]) -> bool {
        handle.buf.extend_from_slice(bytes);
        true
    }

    fn commit_send(&mut self, handle: SendHandle) -> io::Result<()> {
        let total_length = handle.buf.len() + TRAILER_SIZE;
        let mut buf = handle.buf;
        buf.write_u32::<LittleEndian>(total_length as u32)?;
        if let Some(peer) = self.connections.get_mut(&handle.uid) {
            peer.sent.push(buf);
        }
        Ok(())
    }

    fn disconnect(&mut self, uid: Uid) {
        if let Some(peer) = self.connections.get_mut(&uid) {
            peer.connected = false;
            peer.pending_events.push_back(ConnectionEvent::Disconnect);
        }
    }

    fn is_connected(&self, uid: Uid) -> bool {
        self.connections.get(&uid).map(|p| p.connected).unwrap_or(false)
    }
}
