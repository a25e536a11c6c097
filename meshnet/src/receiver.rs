//! Receive-side frame decoding: pull whatever is available out of a connection's inbound buffer,
//! decide what kind of frame it is, and route it either through a pipeline into the dispatcher
//! or straight to the dispatcher (events, control) with no pipeline stage at all.

use crate::connection::{ConnectionDirectory, Uid};
use crate::dispatch::Dispatcher;
use crate::frame::{FrameHeader, MessageType, HEADER_SIZE, TRAILER_SIZE};
use crate::logging::Logger;
use crate::pipeline::{Pipeline, PipelineParams, StepOutcome};
use std::io::Cursor;

/// What happened while processing one inbound buffer's worth of frames.
#[derive(Debug, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// Every available frame was processed (possibly zero — fewer than `HEADER_SIZE` bytes were
    /// buffered, so processing stops and waits for more data; this is a keep-alive, not an
    /// error).
    Idle,
    /// A pipeline step asked for this connection to be disconnected.
    Disconnect,
}

/// Decodes and dispatches every complete frame sitting in `buffer`, draining the bytes it
/// consumes. Partial trailing data (fewer than a full frame) is left in `buffer` for the next
/// tick.
pub fn process_inbound(
    log: &Logger,
    dispatcher: &Dispatcher,
    directory: &ConnectionDirectory,
    pipeline: &Pipeline,
    uid: Uid,
    buffer: &mut Vec<u8>,
) -> ReceiveOutcome {
    let mut offset = 0usize;

    loop {
        let remaining = &buffer[offset..];
        if remaining.len() < HEADER_SIZE {
            break;
        }

        let mut cursor = Cursor::new(remaining);
        let header = match FrameHeader::read(&mut cursor) {
            Ok(header) => header,
            Err(_) => break,
        };
        let consumed_header = cursor.position() as usize;

        // Without a transport-level length prefix ahead of the header, the only frame kind whose
        // length can be inferred here is the event frame (always exactly HEADER_SIZE). Every
        // other kind consumes the remainder of the currently buffered data as its payload — a
        // single TCP read is processed as a single logical frame by this engine's pipeline.
        match header.metadata.message_type() {
            MessageType::Event => {
                // An event frame carries no payload: its total length is fixed at
                // HEADER_SIZE + TRAILER_SIZE. Anything else sharing this buffer's single read is
                // a length mismatch, dropped rather than forwarded to a handler that was never
                // told to expect a payload.
                offset = buffer.len();
                if remaining.len() == HEADER_SIZE + TRAILER_SIZE {
                    dispatcher.dispatch_event(directory, uid, header.key);
                } else {
                    slog::debug!(
                        log, "event frame length mismatch, dropped";
                        "uid" => uid, "key" => header.key, "len" => remaining.len()
                    );
                }
            }
            MessageType::Control => {
                offset = buffer.len();
                if remaining.len() < consumed_header + TRAILER_SIZE {
                    slog::debug!(log, "control frame missing trailer, dropped"; "uid" => uid, "key" => header.key);
                    continue;
                }
                // Bits 4-15 of a control key must be zero; a frame claiming a slot outside
                // [0, 15] is malformed and dropped rather than folded into a valid slot.
                if header.key & !0x000F != 0 {
                    slog::debug!(log, "control frame key out of range, dropped"; "uid" => uid, "key" => header.key);
                    continue;
                }
                let payload_end = remaining.len() - TRAILER_SIZE;
                let payload = remaining[consumed_header..payload_end].to_vec();
                dispatcher.dispatch_control(directory, uid, header.key, &payload);
            }
            MessageType::Default => {
                offset = buffer.len();
                if remaining.len() < consumed_header + TRAILER_SIZE {
                    slog::debug!(log, "default frame missing trailer, dropped"; "uid" => uid, "key" => header.key);
                    continue;
                }
                let payload_end = remaining.len() - TRAILER_SIZE;
                let mut payload = remaining[consumed_header..payload_end].to_vec();

                let mut params = PipelineParams {
                    connection_uid: uid,
                    payload: &mut payload,
                };
                match pipeline.run(&mut params) {
                    StepOutcome::Success => {
                        dispatcher.dispatch_default(directory, uid, header.metadata, header.key, &payload);
                    }
                    StepOutcome::Discard => {
                        slog::debug!(log, "default frame discarded by pipeline"; "uid" => uid, "key" => header.key);
                    }
                    StepOutcome::DisconnectClient => {
                        buffer.drain(..offset);
                        return ReceiveOutcome::Disconnect;
                    }
                }
            }
            MessageType::VarTracking => {
                // Reserved for future use; treated as a keep-alive no-op today.
                offset = buffer.len();
            }
        }
    }

    buffer.drain(..offset);
    ReceiveOutcome::Idle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{install_defaults, CodecRegistry};
    use crate::config::MessageSide;
    use crate::connection::ConnectionRecord;
    use crate::frame::{write_frame, Metadata};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn setup() -> (Dispatcher, ConnectionDirectory, Pipeline, Logger) {
        let codecs = Arc::new(CodecRegistry::new());
        install_defaults(&codecs);
        let dispatcher = Dispatcher::new(MessageSide::Server, codecs);
        let directory = ConnectionDirectory::new();
        directory.register(ConnectionRecord::new(1, Instant::now()));
        (dispatcher, directory, Pipeline::new(), crate::logging::discard())
    }

    #[test]
    fn fewer_than_header_size_bytes_is_idle_and_untouched() {
        let (dispatcher, directory, pipeline, log) = setup();
        let mut buffer = vec![0u8, 1];
        let outcome = process_inbound(&log, &dispatcher, &directory, &pipeline, 1, &mut buffer);
        assert_eq!(outcome, ReceiveOutcome::Idle);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn default_frame_reaches_dispatcher() {
        let (dispatcher, directory, pipeline, log) = setup();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        dispatcher.register_default(
            0x0042,
            MessageSide::Server,
            0,
            Box::new(move |_, _, _, payload| {
                assert_eq!(payload, &[13, 0, 0, 0]);
                hits2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        let header = FrameHeader {
            metadata: Metadata::new(MessageType::Default, 0),
            key: 0x0042,
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, header, &13i32.to_le_bytes()).unwrap();

        process_inbound(&log, &dispatcher, &directory, &pipeline, 1, &mut buffer);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn well_formed_event_frame_reaches_the_event_handler() {
        let (dispatcher, directory, pipeline, log) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        dispatcher.register_event(
            7,
            MessageSide::Server,
            0,
            Box::new(move |_, _| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let header = FrameHeader {
            metadata: Metadata::new(MessageType::Event, 0),
            key: 7,
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, header, &[]).unwrap();

        process_inbound(&log, &dispatcher, &directory, &pipeline, 1, &mut buffer);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn event_frame_with_extra_bytes_is_dropped_as_mismatch() {
        // An event frame's total length is fixed at HEADER_SIZE + TRAILER_SIZE; splicing in
        // extra bytes must never reach a handler registered for the same key.
        let (dispatcher, directory, pipeline, log) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        dispatcher.register_event(
            7,
            MessageSide::Server,
            0,
            Box::new(move |_, _| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let header = FrameHeader {
            metadata: Metadata::new(MessageType::Event, 0),
            key: 7,
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, header, &[0xFF]).unwrap();

        process_inbound(&log, &dispatcher, &directory, &pipeline, 1, &mut buffer);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn control_frame_with_key_bits_set_above_the_low_nibble_is_dropped() {
        let (dispatcher, directory, pipeline, log) = setup();
        dispatcher
            .register_control(3, MessageSide::Server, 0, 0, Box::new(|_, _, _| true))
            .unwrap();

        let header = FrameHeader {
            metadata: Metadata::new(MessageType::Control, 0),
            // bits 4-15 are non-zero: the frame must be discarded, not routed to slot 3.
            key: 0xFF03,
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, header, &[]).unwrap();

        process_inbound(&log, &dispatcher, &directory, &pipeline, 1, &mut buffer);
        assert!(!directory.lookup(1).unwrap().permissions.test_bit(3));
    }

    #[test]
    fn control_frame_with_key_in_range_is_dispatched() {
        let (dispatcher, directory, pipeline, log) = setup();
        dispatcher
            .register_control(3, MessageSide::Server, 0, 0, Box::new(|_, _, _| true))
            .unwrap();

        let header = FrameHeader {
            metadata: Metadata::new(MessageType::Control, 0),
            key: 3,
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, header, &[]).unwrap();

        process_inbound(&log, &dispatcher, &directory, &pipeline, 1, &mut buffer);
        assert!(directory.lookup(1).unwrap().permissions.test_bit(3));
    }

    #[test]
    fn pipeline_disconnect_drains_buffer_and_reports_disconnect() {
        let (dispatcher, directory, mut pipeline, log) = setup();
        pipeline.push(Box::new(|_| StepOutcome::DisconnectClient));

        let header = FrameHeader {
            metadata: Metadata::new(MessageType::Default, 0),
            key: 1,
        };
        let mut buffer = Vec::new();
        write_frame(&mut buffer, header, &[9]).unwrap();

        let outcome = process_inbound(&log, &dispatcher, &directory, &pipeline, 1, &mut buffer);
        assert_eq!(outcome, ReceiveOutcome::Disconnect);
        assert!(buffer.is_empty());
    }
}
