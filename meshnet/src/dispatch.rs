//! Typed dispatcher: four handler categories — default data, event, control and reflective —
//! each keyed for O(1)-ish lookup and invoked in registration order when more than one handler
//! shares a key (multicast semantics).

use crate::codec::{ArgsCodec, CodecRegistry, SizedRead};
use crate::config::MessageSide;
use crate::connection::{ConnectionDirectory, ConnectionRecord, Uid};
use crate::error::{FrameError, RegistrationError};
use crate::frame::Metadata;
use indexmap::IndexMap;
use std::any::Any;
use std::sync::{Arc, RwLock};

/// A default-data handler: given the sending connection, the frame's metadata byte and its raw
/// payload, does whatever it does with it. `message_metadata` is one of the two reserved
/// parameter names a `#[meshnet::handler]`-generated handler may bind positionally; handlers
/// that don't need it simply ignore the argument. Returns a `FrameError` only for malformed
/// payloads; the dispatcher does not otherwise interpret the return value.
pub type DefaultHandler =
    Box<dyn Fn(Uid, &ConnectionRecord, Metadata, &[u8]) -> Result<(), FrameError> + Send + Sync>;

/// An event handler: events carry no payload, so the handler only sees who sent it.
pub type EventHandler = Box<dyn Fn(Uid, &ConnectionRecord) + Send + Sync>;

/// A control handler. Returning `true` grants the permission bit associated with this handler's
/// key; returning `false` leaves permissions unchanged.
pub type ControlHandler = Box<dyn Fn(Uid, &ConnectionRecord, &[u8]) -> bool + Send + Sync>;

/// A registered default-data handler plus the permission bits a connection must already hold
/// before it's invoked.
struct DefaultEntry {
    required_flags: u16,
    handler: DefaultHandler,
}

/// A registered event handler plus the permission bits a connection must already hold before
/// it's invoked.
struct EventEntry {
    required_flags: u16,
    handler: EventHandler,
}

/// Declarative metadata attached to a control handler slot, checked by the dispatcher's
/// pre-check before the handler itself ever runs; the key-range check for the slot itself is
/// independent of the payload-length check.
struct ControlEntry {
    expected_length: u16,
    required_flags: u16,
    handler: ControlHandler,
}

const CONTROL_SLOT_COUNT: usize = 16;

/// The typed dispatcher. One instance is shared by the engine's receive pipeline; handlers are
/// registered once at startup and looked up per incoming frame.
pub struct Dispatcher {
    message_side: MessageSide,
    codecs: Arc<CodecRegistry>,
    default_handlers: RwLock<IndexMap<u16, Vec<DefaultEntry>>>,
    event_handlers: RwLock<IndexMap<u16, Vec<EventEntry>>>,
    control_handlers: RwLock<[Option<ControlEntry>; CONTROL_SLOT_COUNT]>,
}

impl Dispatcher {
    /// The codec registry this dispatcher decodes reflective-handler arguments with. Exposed so
    /// a `#[meshnet::handler]`-generated registration thunk — which only ever sees a `&Dispatcher`
    /// — can reach the registry without the host application threading it through separately.
    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    /// A cloned handle to the same registry, for a registration thunk whose closure outlives the
    /// registration call itself (every `#[meshnet::handler]`-generated thunk needs this).
    pub fn codecs_arc(&self) -> Arc<CodecRegistry> {
        self.codecs.clone()
    }

    pub fn new(message_side: MessageSide, codecs: Arc<CodecRegistry>) -> Dispatcher {
        Dispatcher {
            message_side,
            codecs,
            default_handlers: RwLock::new(IndexMap::new()),
            event_handlers: RwLock::new(IndexMap::new()),
            control_handlers: RwLock::new(Default::default()),
        }
    }

    /// Registers a default-data handler under `key`, gated by `required_flags`: a connection
    /// must already hold every one of those permission bits before this handler runs. Skipped
    /// (not an error) if `handler_side` isn't admitted by this dispatcher's configured side.
    pub fn register_default(&self, key: u16, handler_side: MessageSide, required_flags: u16, handler: DefaultHandler) {
        if !self.message_side.admits(handler_side) {
            return;
        }
        self.default_handlers
            .write()
            .unwrap()
            .entry(key)
            .or_default()
            .push(DefaultEntry { required_flags, handler });
    }

    /// Registers an event handler under `key`, gated by `required_flags` the same way
    /// `register_default` is.
    pub fn register_event(&self, key: u16, handler_side: MessageSide, required_flags: u16, handler: EventHandler) {
        if !self.message_side.admits(handler_side) {
            return;
        }
        self.event_handlers
            .write()
            .unwrap()
            .entry(key)
            .or_default()
            .push(EventEntry { required_flags, handler });
    }

    /// Registers a control handler in slot `key`. `key` must be in `[0, 15]` — validated
    /// independently of `expected_length`. A second registration for the same key replaces the
    /// first; control slots are not a multicast list.
    pub fn register_control(
        &self,
        key: u16,
        handler_side: MessageSide,
        expected_length: u16,
        required_flags: u16,
        handler: ControlHandler,
    ) -> Result<(), RegistrationError> {
        if key > 15 {
            return Err(RegistrationError::ControlKeyOutOfRange(key));
        }
        if !self.message_side.admits(handler_side) {
            return Ok(());
        }
        self.control_handlers.write().unwrap()[key as usize] = Some(ControlEntry {
            expected_length,
            required_flags,
            handler,
        });
        Ok(())
    }

    /// Registers a reflective handler: its parameters are deserialized positionally from the
    /// payload using the codec registry, then the handler is invoked with the decoded tuple.
    /// Internally this is installed as an ordinary default-data handler — reflective dispatch is
    /// sugar over the default-data path, not a fifth category.
    pub fn register_reflective<H, Args>(
        &self,
        key: u16,
        handler_side: MessageSide,
        required_flags: u16,
        handler: H,
    ) -> Result<(), RegistrationError>
    where
        H: Fn(Uid, &ConnectionRecord, Args) + Send + Sync + 'static,
        Args: ArgsCodec + Any + 'static,
    {
        Args::check_codecs(&self.codecs)?;
        let codecs = self.codecs.clone();
        self.register_default(
            key,
            handler_side,
            required_flags,
            Box::new(move |uid, record, _metadata, payload| {
                let mut cursor = std::io::Cursor::new(payload);
                let args = Args::decode(&mut cursor, &codecs)?;
                handler(uid, record, args);
                Ok(())
            }),
        );
        Ok(())
    }

    /// Runs every default-data handler registered under `key`, in registration order, after
    /// confirming `uid` is a live connection and gating each entry on its own `required_flags`.
    /// Unknown keys and unknown connections are silent no-ops — there is nothing actionable to
    /// report back over the wire.
    pub fn dispatch_default(&self, directory: &ConnectionDirectory, uid: Uid, metadata: Metadata, key: u16, payload: &[u8]) {
        let record = match directory.lookup(uid) {
            Some(record) => record,
            None => return,
        };
        let handlers = self.default_handlers.read().unwrap();
        if let Some(list) = handlers.get(&key) {
            for entry in list {
                if !record.permissions.meets(entry.required_flags) {
                    continue;
                }
                let _ = (entry.handler)(uid, &record, metadata, payload);
            }
        }
    }

    pub fn dispatch_event(&self, directory: &ConnectionDirectory, uid: Uid, key: u16) {
        let record = match directory.lookup(uid) {
            Some(record) => record,
            None => return,
        };
        let handlers = self.event_handlers.read().unwrap();
        if let Some(list) = handlers.get(&key) {
            for entry in list {
                if !record.permissions.meets(entry.required_flags) {
                    continue;
                }
                (entry.handler)(uid, &record);
            }
        }
    }

    /// Dispatches a control message. Pre-check order: resolve the slot, resolve the connection
    /// record, confirm the connection already meets `required_flags`, confirm the payload length
    /// matches `expected_length`, then invoke and apply the permission grant. Any pre-check
    /// failure is a silent drop — control messages never get a reply frame.
    pub fn dispatch_control(&self, directory: &ConnectionDirectory, uid: Uid, key: u16, payload: &[u8]) {
        if key > 15 {
            return;
        }
        let handlers = self.control_handlers.read().unwrap();
        let entry = match &handlers[key as usize] {
            Some(entry) => entry,
            None => return,
        };

        let record = match directory.lookup(uid) {
            Some(record) => record,
            None => return,
        };

        if !record.permissions.meets(entry.required_flags) {
            return;
        }

        if payload.len() as u16 != entry.expected_length {
            return;
        }

        if (entry.handler)(uid, &record, payload) {
            record.permissions.set_bit(key as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::install_defaults;
    use crate::frame::MessageType;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    fn default_metadata() -> Metadata {
        Metadata::new(MessageType::Default, 0)
    }

    fn new_dispatcher() -> (Dispatcher, Arc<CodecRegistry>) {
        let codecs = Arc::new(CodecRegistry::new());
        install_defaults(&codecs);
        (Dispatcher::new(MessageSide::Server, codecs.clone()), codecs)
    }

    #[test]
    fn default_handlers_run_in_registration_order() {
        let (dispatcher, _codecs) = new_dispatcher();
        let directory = ConnectionDirectory::new();
        directory.register(ConnectionRecord::new(1, Instant::now()));

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_a = order.clone();
        dispatcher.register_default(
            0x42,
            MessageSide::Server,
            0,
            Box::new(move |_, _, _, _| {
                order_a.lock().unwrap().push("a");
                Ok(())
            }),
        );
        let order_b = order.clone();
        dispatcher.register_default(
            0x42,
            MessageSide::Server,
            0,
            Box::new(move |_, _, _, _| {
                order_b.lock().unwrap().push("b");
                Ok(())
            }),
        );

        dispatcher.dispatch_default(&directory, 1, default_metadata(), 0x42, &[]);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn handler_side_mismatch_is_not_registered() {
        let (dispatcher, _codecs) = new_dispatcher();
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();

        dispatcher.register_default(
            1,
            MessageSide::Client,
            0,
            Box::new(move |_, _, _, _| {
                called2.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );

        let directory = ConnectionDirectory::new();
        directory.register(ConnectionRecord::new(1, Instant::now()));
        dispatcher.dispatch_default(&directory, 1, default_metadata(), 1, &[]);

        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn control_handler_gated_by_required_flags() {
        let (dispatcher, _codecs) = new_dispatcher();
        let directory = ConnectionDirectory::new();
        directory.register(ConnectionRecord::new(1, Instant::now()));

        dispatcher
            .register_control(5, MessageSide::Server, 0, 0x0001, Box::new(|_, _, _| true))
            .unwrap();

        dispatcher.dispatch_control(&directory, 1, 5, &[]);
        let record = directory.lookup(1).unwrap();
        assert!(!record.permissions.test_bit(5), "gate should have blocked this call");

        record.permissions.set_bit(0);
        dispatcher.dispatch_control(&directory, 1, 5, &[]);
        assert!(record.permissions.test_bit(5));
    }

    #[test]
    fn control_handler_rejects_length_mismatch() {
        let (dispatcher, _codecs) = new_dispatcher();
        let directory = ConnectionDirectory::new();
        directory.register(ConnectionRecord::new(1, Instant::now()));

        dispatcher
            .register_control(2, MessageSide::Server, 4, 0, Box::new(|_, _, _| true))
            .unwrap();

        dispatcher.dispatch_control(&directory, 1, 2, &[1, 2]);
        assert!(!directory.lookup(1).unwrap().permissions.test_bit(2));
    }

    #[test]
    fn control_key_out_of_range_is_rejected_at_registration() {
        let (dispatcher, _codecs) = new_dispatcher();
        let result = dispatcher.register_control(16, MessageSide::Server, 0, 0, Box::new(|_, _, _| true));
        assert!(matches!(result, Err(RegistrationError::ControlKeyOutOfRange(16))));
    }

    #[test]
    fn reflective_handler_decodes_and_invokes() {
        let (dispatcher, codecs) = new_dispatcher();
        let directory = ConnectionDirectory::new();
        directory.register(ConnectionRecord::new(1, Instant::now()));

        let seen = Arc::new(std::sync::Mutex::new(0i32));
        let seen2 = seen.clone();
        dispatcher
            .register_reflective(0x99, MessageSide::Server, 0, move |_uid, _record, args: (i32,)| {
                *seen2.lock().unwrap() = args.0;
            })
            .unwrap();

        let mut cursor = std::io::Cursor::new(Vec::new());
        codecs.serialize(&13i32, &mut cursor).unwrap();
        let payload = cursor.into_inner();

        dispatcher.dispatch_default(&directory, 1, default_metadata(), 0x99, &payload);
        assert_eq!(*seen.lock().unwrap(), 13);
    }

    #[test]
    fn default_handler_gated_by_required_flags() {
        let (dispatcher, _codecs) = new_dispatcher();
        let directory = ConnectionDirectory::new();
        directory.register(ConnectionRecord::new(1, Instant::now()));

        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        dispatcher.register_default(
            0x10,
            MessageSide::Server,
            0x0002,
            Box::new(move |_, _, _, _| {
                called2.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );

        dispatcher.dispatch_default(&directory, 1, default_metadata(), 0x10, &[]);
        assert!(!called.load(Ordering::SeqCst), "handler must not run before the flag is granted");

        let record = directory.lookup(1).unwrap();
        record.permissions.set_bit(1);
        dispatcher.dispatch_default(&directory, 1, default_metadata(), 0x10, &[]);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn event_handler_gated_by_required_flags() {
        let (dispatcher, _codecs) = new_dispatcher();
        let directory = ConnectionDirectory::new();
        directory.register(ConnectionRecord::new(1, Instant::now()));

        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        dispatcher.register_event(0x11, MessageSide::Server, 0x0001, Box::new(move |_, _| {
            called2.store(true, Ordering::SeqCst);
        }));

        dispatcher.dispatch_event(&directory, 1, 0x11);
        assert!(!called.load(Ordering::SeqCst));

        directory.lookup(1).unwrap().permissions.set_bit(0);
        dispatcher.dispatch_event(&directory, 1, 0x11);
        assert!(called.load(Ordering::SeqCst));
    }
}
