//! The tick-driven I/O loop: one `tick` call polls the transport, drains connection lifecycle
//! and data events, applies queued disconnects, and periodically sweeps stale connections.

use crate::codec::{install_defaults, CodecRegistry};
use crate::config::{EngineConfig, MessageSide};
use crate::connection::{self, ConnectionDirectory, ConnectionRecord, ExpirationTracker, Uid};
use crate::dispatch::Dispatcher;
use crate::error::{EngineError, EngineErrorCode};
use crate::frame::Metadata;
use crate::logging::{self, Logger};
use crate::pipeline::PipelineSet;
use crate::receiver::{process_inbound, ReceiveOutcome};
use crate::sender::{SendOutcome, Sender};
use crate::time::TickClock;
use crate::transport::{ConnectionEvent, PipelineKind, Transport};
use slog::{o, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Observability summary for one `Engine::tick` call. Nothing downstream depends on its fields
/// beyond logging/metrics; it exists so a caller can assert on tick behavior in tests without
/// reaching into engine internals.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct TickReport {
    pub connected: Vec<Uid>,
    pub disconnected: Vec<Uid>,
    pub rejected_over_capacity: usize,
}

/// A subscriber callback fired on a connection lifecycle transition.
pub type LifecycleCallback = Box<dyn Fn(Uid) + Send + Sync>;

/// The four lifecycle events a host application can subscribe to: `OnClientConnected` and
/// `OnClientDisconnected` fire on a server for each accepted/dropped peer; `OnConnect` and
/// `OnDisconnect` fire on a client for its own connection to the server.
#[derive(Default)]
struct LifecycleSubscribers {
    on_client_connected: Vec<LifecycleCallback>,
    on_client_disconnected: Vec<LifecycleCallback>,
    on_connect: Vec<LifecycleCallback>,
    on_disconnect: Vec<LifecycleCallback>,
}

impl LifecycleSubscribers {
    fn fire_client_connected(&self, uid: Uid) {
        for cb in &self.on_client_connected {
            cb(uid);
        }
    }

    fn fire_client_disconnected(&self, uid: Uid) {
        for cb in &self.on_client_disconnected {
            cb(uid);
        }
    }

    fn fire_connect(&self, uid: Uid) {
        for cb in &self.on_connect {
            cb(uid);
        }
    }

    fn fire_disconnect(&self, uid: Uid) {
        for cb in &self.on_disconnect {
            cb(uid);
        }
    }
}

/// Whether this engine instance is acting as a server (accepting and capping connections) or a
/// client (a single outbound connection, no cap).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Server,
    Client,
}

/// The engine: owns the connection directory, dispatcher, pipelines and transport, and drives
/// all of them forward one tick at a time.
pub struct Engine<T: Transport> {
    role: Role,
    config: EngineConfig,
    log: Logger,
    transport: T,
    directory: ConnectionDirectory,
    expiration: ExpirationTracker,
    dispatcher: Dispatcher,
    codecs: Arc<CodecRegistry>,
    pipelines: PipelineSet,
    sender: Sender,
    subscribers: LifecycleSubscribers,
    started: bool,
    sweep_interval: Duration,
    last_sweep: std::time::Instant,
    /// On `Role::Client`, the transport-assigned `Uid` of the connection to the server — the
    /// engine maps this to the logical `connection::SELF_UID` for everything the directory,
    /// dispatcher and expiration tracker see. `None` before the connection is established.
    client_peer_uid: Option<Uid>,
}

impl<T: Transport> Engine<T> {
    /// Builds (but does not start) an engine. `max_players` of zero is rejected immediately
    /// rather than deferred to `start`.
    pub fn new(role: Role, config: EngineConfig, transport: T, log: Logger) -> Result<Engine<T>, EngineError> {
        if config.max_players == 0 {
            return Err(EngineError::ZeroMaxPlayers);
        }

        let codecs = Arc::new(CodecRegistry::new());
        install_defaults(&codecs);
        let message_side = config.message_side;
        let log = log.new(o!("component" => "engine"));

        let dispatcher = Dispatcher::new(message_side, codecs.clone());
        for decl in &config.control_handlers {
            let key = decl.key as u16;
            if let Err(e) =
                dispatcher.register_control(key, decl.side, decl.expected_length, decl.required_flags, Box::new(|_, _, _| true))
            {
                warn!(log, "configured control handler rejected"; "key" => key, "error" => %e);
            }
        }

        Ok(Engine {
            role,
            config,
            log,
            transport,
            directory: ConnectionDirectory::new(),
            expiration: ExpirationTracker::new(),
            dispatcher,
            codecs,
            pipelines: PipelineSet::new(),
            sender: Sender::new(),
            subscribers: LifecycleSubscribers::default(),
            started: false,
            sweep_interval: Duration::from_secs(30),
            last_sweep: std::time::Instant::now(),
            client_peer_uid: None,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn directory(&self) -> &ConnectionDirectory {
        &self.directory
    }

    pub fn pipelines_mut(&mut self) -> &mut PipelineSet {
        &mut self.pipelines
    }

    /// Direct access to the transport, for callers (notably tests) that need to drive
    /// connection/data events a real socket would otherwise produce.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Sends `payload` to `uid` through this engine's own outbound send pipeline (the direction
    /// opposite its `Role`) and `Sender`, so any `DisconnectClient` outcome is queued and applied
    /// by the next `tick` the same way a pipeline-driven disconnect from inbound processing is.
    /// On `Role::Client`, `uid` is expected to be `connection::SELF_UID`; it's translated to the
    /// real transport-assigned peer `Uid` before reaching the transport.
    pub fn send_to_client(&mut self, uid: Uid, kind: PipelineKind, metadata: Metadata, key: u16, payload: &[u8]) -> SendOutcome {
        let pipeline = match self.role {
            Role::Server => &self.pipelines.server_to_client_send,
            Role::Client => &self.pipelines.client_to_server_send,
        };
        let transport_uid = match self.role {
            Role::Server => uid,
            Role::Client => match self.client_peer_uid {
                Some(peer) => peer,
                None => return SendOutcome::NotConnected,
            },
        };
        self.sender
            .send_one(&mut self.transport, pipeline, transport_uid, kind, metadata, key, payload)
    }

    /// Fires when a server accepts a new peer.
    pub fn on_client_connected(&mut self, cb: LifecycleCallback) {
        self.subscribers.on_client_connected.push(cb);
    }

    /// Fires when a server's peer disconnects.
    pub fn on_client_disconnected(&mut self, cb: LifecycleCallback) {
        self.subscribers.on_client_disconnected.push(cb);
    }

    /// Fires when a client's own connection to the server is established.
    pub fn on_connect(&mut self, cb: LifecycleCallback) {
        self.subscribers.on_connect.push(cb);
    }

    /// Fires when a client's own connection to the server is lost.
    pub fn on_disconnect(&mut self, cb: LifecycleCallback) {
        self.subscribers.on_disconnect.push(cb);
    }

    /// Starts the engine: for a server, binds the listening socket. Double-starting is a fatal
    /// error since the transport would otherwise silently rebind.
    pub fn start(&mut self, addr: SocketAddr) -> Result<(), EngineError> {
        if self.started {
            return Err(EngineError::DoubleStart);
        }

        match self.role {
            Role::Server => {
                if let Err(e) = self.transport.bind(addr) {
                    warn!(self.log, "bind failed"; "code" => EngineErrorCode::BindFailure as u16, "error" => %e);
                    if self.config.stop_on_bind_failure {
                        return Err(EngineError::BindFailure(e));
                    }
                }
            }
            Role::Client => {
                self.transport.connect(addr).map_err(EngineError::BindFailure)?;
            }
        }

        self.started = true;
        Ok(())
    }

    /// Runs one tick of the I/O loop:
    /// 1. poll the transport for readiness,
    /// 2. apply any disconnects the send pipeline queued last tick,
    /// 3. drain per-connection events — connect (server: accept and cap-check; client: register
    ///    self and emit `OnConnect`), data (dispatch through the inbound pipeline), disconnect,
    /// 4. periodically sweep the expiration tracker, driving an explicit disconnect for any
    ///    entry whose transport handle went stale without the engine noticing,
    /// 5. return a summary report.
    pub fn tick(&mut self, poll_timeout: Duration) -> TickReport {
        let clock = TickClock::new();
        let mut report = TickReport::default();

        if let Err(e) = self.transport.poll(poll_timeout) {
            warn!(self.log, "transport poll failed"; "error" => %e);
        }

        for uid in self.sender.drain_disconnect_queue() {
            self.disconnect(uid, clock.now(), &mut report);
        }

        let pending = self.transport.pending_uids();
        for uid in pending {
            loop {
                match self.transport.pop_event(uid) {
                    Some(ConnectionEvent::Connect) => match self.role {
                        Role::Server => self.accept_connection(uid, clock.now(), &mut report),
                        Role::Client => self.connect_self(uid, clock.now(), &mut report),
                    },
                    Some(ConnectionEvent::Data(bytes)) => {
                        let logical_uid = self.logical_uid(uid);
                        if self.directory.lookup(logical_uid).is_none() {
                            continue;
                        }
                        let mut buffer = bytes;
                        let pipeline = match self.role {
                            Role::Server => &self.pipelines.client_to_server_receive,
                            Role::Client => &self.pipelines.server_to_client_receive,
                        };
                        let outcome = process_inbound(
                            &self.log,
                            &self.dispatcher,
                            &self.directory,
                            pipeline,
                            logical_uid,
                            &mut buffer,
                        );
                        if outcome == ReceiveOutcome::Disconnect {
                            self.disconnect(uid, clock.now(), &mut report);
                            break;
                        }
                    }
                    Some(ConnectionEvent::Disconnect) => {
                        self.disconnect(uid, clock.now(), &mut report);
                        break;
                    }
                    None => break,
                }
            }
        }

        if clock.elapsed_since(self.last_sweep) >= self.sweep_interval {
            let stale = self.expiration.sweep(clock.now(), &self.transport);
            for uid in stale {
                self.disconnect(uid, clock.now(), &mut report);
            }
            self.last_sweep = clock.now();
        }

        report
    }

    /// Maps a raw transport `Uid` to the logical `Uid` the directory/dispatcher/tracker use:
    /// itself on a server, `connection::SELF_UID` on a client.
    fn logical_uid(&self, transport_uid: Uid) -> Uid {
        match self.role {
            Role::Server => transport_uid,
            Role::Client => connection::SELF_UID,
        }
    }

    fn accept_connection(&mut self, uid: Uid, now: std::time::Instant, report: &mut TickReport) {
        if self.directory.len() as u32 >= self.config.max_players {
            warn!(self.log, "connection rejected, at capacity"; "uid" => uid, "max_players" => self.config.max_players);
            report.rejected_over_capacity += 1;
            self.transport.disconnect(uid);
            return;
        }

        self.directory.register(ConnectionRecord::new(uid, now));
        self.expiration.mark_connected(uid);
        self.subscribers.fire_client_connected(uid);
        report.connected.push(uid);
    }

    /// Client-side counterpart of `accept_connection`: registers the connection to the server
    /// under the logical `SELF_UID` and remembers the real transport `Uid` for outbound sends.
    fn connect_self(&mut self, transport_uid: Uid, now: std::time::Instant, report: &mut TickReport) {
        self.client_peer_uid = Some(transport_uid);
        self.directory.register(ConnectionRecord::new(connection::SELF_UID, now));
        self.expiration.mark_connected(connection::SELF_UID);
        self.subscribers.fire_connect(connection::SELF_UID);
        report.connected.push(connection::SELF_UID);
    }

    /// `transport_uid` is the raw `Uid` the transport reported the event for; translated to the
    /// logical `Uid` internally before touching the directory, tracker or subscribers.
    fn disconnect(&mut self, transport_uid: Uid, now: std::time::Instant, report: &mut TickReport) {
        let logical_uid = self.logical_uid(transport_uid);
        if self.directory.remove(logical_uid).is_none() {
            return;
        }
        self.transport.disconnect(transport_uid);
        self.expiration.mark_disconnected(logical_uid, now);
        match self.role {
            Role::Server => self.subscribers.fire_client_disconnected(logical_uid),
            Role::Client => {
                self.client_peer_uid = None;
                self.subscribers.fire_disconnect(logical_uid);
            }
        }
        report.disconnected.push(logical_uid);
    }
}
