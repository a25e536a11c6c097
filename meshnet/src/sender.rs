//! Send-side pipeline processing: a two-phase begin/commit handle over the transport, with the
//! send pipeline running in between so a step can still veto or rewrite the payload before
//! anything reaches the wire.

use crate::codec::{CodecRegistry, Serialize};
use crate::connection::{ConnectionDirectory, Uid};
use crate::error::FrameError;
use crate::frame::Metadata;
use crate::pipeline::{Pipeline, PipelineParams, StepOutcome};
use crate::transport::{PipelineKind, Transport};
use std::any::Any;
use std::collections::HashSet;
use std::io;

/// Result of attempting to send one payload to one connection.
#[derive(Debug, Eq, PartialEq)]
pub enum SendOutcome {
    /// The payload was handed to the transport for delivery.
    Sent,
    /// A pipeline step discarded the payload before it reached the transport; no bytes were
    /// written and the connection is untouched.
    Discarded,
    /// A pipeline step asked for the destination connection to be disconnected. The send is
    /// aborted and the disconnect is queued for the engine to act on at the next sweep.
    Disconnected,
    /// The transport couldn't accommodate the payload ("writer too small") — no transport call
    /// was made at all, the handle is simply discarded unused.
    WriterTooSmall,
    /// `uid` was not a live connection when the send was attempted.
    NotConnected,
}

/// Runs outbound sends: tracks every `begin_send` handle until it's either committed or swept,
/// so a caller that forgets to finish a send doesn't leak a half-open write on the transport.
#[derive(Default)]
pub struct Sender {
    disconnect_queue: HashSet<Uid>,
}

impl Sender {
    pub fn new() -> Sender {
        Sender::default()
    }

    /// Sends `payload` to a single connection through `pipeline`, per the two-phase protocol:
    /// `begin_send` writes the frame header (`metadata`, `key`) into a freshly acquired handle,
    /// the send pipeline runs against a private copy of the payload (so a multicast's other
    /// recipients are unaffected by what one pipeline step did to this copy), and the handle is
    /// committed or aborted depending on the outcome.
    #[allow(clippy::too_many_arguments)]
    pub fn send_one(
        &mut self,
        transport: &mut dyn Transport,
        pipeline: &Pipeline,
        uid: Uid,
        kind: PipelineKind,
        metadata: Metadata,
        key: u16,
        payload: &[u8],
    ) -> SendOutcome {
        let mut handle = match transport.begin_send(uid, kind, metadata, key) {
            Some(handle) => handle,
            None => return SendOutcome::NotConnected,
        };

        let mut buf = payload.to_vec();
        let mut params = PipelineParams {
            connection_uid: uid,
            payload: &mut buf,
        };

        match pipeline.run(&mut params) {
            StepOutcome::Discard => {
                transport.abort_send(handle);
                SendOutcome::Discarded
            }
            StepOutcome::DisconnectClient => {
                transport.abort_send(handle);
                self.disconnect_queue.insert(uid);
                SendOutcome::Disconnected
            }
            StepOutcome::Success => {
                if !transport.write_to(&mut handle, &buf) {
                    transport.abort_send(handle);
                    return SendOutcome::WriterTooSmall;
                }
                match transport.commit_send(handle) {
                    Ok(()) => SendOutcome::Sent,
                    Err(_) => {
                        self.disconnect_queue.insert(uid);
                        SendOutcome::Disconnected
                    }
                }
            }
        }
    }

    /// Sends the same logical payload to several connections. Each recipient runs the pipeline
    /// independently against its own copy of a shared template buffer — one recipient's pipeline
    /// discarding or rewriting the payload never affects another's.
    #[allow(clippy::too_many_arguments)]
    pub fn multicast(
        &mut self,
        transport: &mut dyn Transport,
        pipeline: &Pipeline,
        recipients: &[Uid],
        kind: PipelineKind,
        metadata: Metadata,
        key: u16,
        payload: &[u8],
    ) -> Vec<(Uid, SendOutcome)> {
        recipients
            .iter()
            .map(|&uid| (uid, self.send_one(transport, pipeline, uid, kind, metadata, key, payload)))
            .collect()
    }

    /// Sends to every currently-registered connection — broadcast is multicast over the full
    /// connection directory.
    #[allow(clippy::too_many_arguments)]
    pub fn broadcast(
        &mut self,
        transport: &mut dyn Transport,
        pipeline: &Pipeline,
        directory: &ConnectionDirectory,
        kind: PipelineKind,
        metadata: Metadata,
        key: u16,
        payload: &[u8],
    ) -> Vec<(Uid, SendOutcome)> {
        let recipients = directory.all_uids();
        self.multicast(transport, pipeline, &recipients, kind, metadata, key, payload)
    }

    /// Serializes `value` through `codecs` and sends the resulting bytes as the payload of a
    /// single send, wiring the codec registry into the outbound path the way
    /// `register_reflective` wires it into the inbound one.
    #[allow(clippy::too_many_arguments)]
    pub fn send_typed<T: Serialize + Any + Send + Sync + 'static>(
        &mut self,
        transport: &mut dyn Transport,
        pipeline: &Pipeline,
        codecs: &CodecRegistry,
        uid: Uid,
        kind: PipelineKind,
        metadata: Metadata,
        key: u16,
        value: &T,
    ) -> Result<SendOutcome, FrameError> {
        let mut cursor = io::Cursor::new(Vec::new());
        codecs.serialize(value, &mut cursor)?;
        let payload = cursor.into_inner();
        Ok(self.send_one(transport, pipeline, uid, kind, metadata, key, &payload))
    }

    /// Drains the set of connections a send pipeline asked to disconnect this tick. The engine
    /// calls this once per tick and feeds the result into its own disconnect handling, rather
    /// than the sender tearing down connections directly.
    pub fn drain_disconnect_queue(&mut self) -> Vec<Uid> {
        self.disconnect_queue.drain().collect()
    }
}
