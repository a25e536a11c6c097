use std::io;

/// Non-fatal framing errors. A `FrameError` never terminates the connection that produced it —
/// the offending frame is dropped and processing continues.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("fewer than 3 bytes available, frame withheld")]
    Incomplete,
    #[error("event frame carried a non-empty payload")]
    EventPayloadMismatch,
    #[error("control message key {0} is outside the [0,15] range")]
    ControlKeyOutOfRange(u16),
    #[error("control payload length {actual} did not match the handler's declared {expected}")]
    ControlLengthMismatch { expected: u16, actual: u16 },
    #[error("string length prefix {0} is negative and not -1 (null)")]
    InvalidStringLength(i32),
    #[error("size arithmetic overflowed while framing a message")]
    SizeOverflow,
    #[error(transparent)]
    Io(#[from] io::Error),
}

// io::Error has no PartialEq, so this can't be derived; compare it by ErrorKind instead, which is
// enough for tests to assert on which failure occurred.
impl PartialEq for FrameError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FrameError::Incomplete, FrameError::Incomplete) => true,
            (FrameError::EventPayloadMismatch, FrameError::EventPayloadMismatch) => true,
            (FrameError::ControlKeyOutOfRange(a), FrameError::ControlKeyOutOfRange(b)) => a == b,
            (
                FrameError::ControlLengthMismatch { expected: e1, actual: a1 },
                FrameError::ControlLengthMismatch { expected: e2, actual: a2 },
            ) => e1 == e2 && a1 == a2,
            (FrameError::InvalidStringLength(a), FrameError::InvalidStringLength(b)) => a == b,
            (FrameError::SizeOverflow, FrameError::SizeOverflow) => true,
            (FrameError::Io(a), FrameError::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

/// Errors surfaced while registering a handler or codec. Rejects the individual registration;
/// other registrations already in place are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("no deserializer registered for parameter type {type_name}")]
    MissingCodec { type_name: &'static str },
    #[error("control key {0} is outside the [0,15] range")]
    ControlKeyOutOfRange(u16),
    #[error("reflective handler signature has two parameters both named `{0}`")]
    DuplicateReservedParam(&'static str),
}

/// Codes assigned per error/warning site so operators can triage from logs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u16)]
pub enum EngineErrorCode {
    NoDriversBound = 1,
    DriverCountOutOfRange = 2,
    ZeroMaxPlayers = 3,
    DoubleStart = 4,
    BindFailure = 5,
}

/// Fatal engine start/stop errors. Start aborts and all allocated resources are released.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no transport drivers were successfully bound")]
    NoDriversBound,
    #[error("driver count {0} is out of the supported range")]
    DriverCountOutOfRange(usize),
    #[error("max_players must be greater than zero")]
    ZeroMaxPlayers,
    #[error("engine is already started")]
    DoubleStart,
    #[error("failed to bind transport driver: {0}")]
    BindFailure(#[source] io::Error),
}

impl EngineError {
    /// Stable numeric code for this error, independent of its `Display` text.
    pub fn code(&self) -> EngineErrorCode {
        match self {
            EngineError::NoDriversBound => EngineErrorCode::NoDriversBound,
            EngineError::DriverCountOutOfRange(_) => EngineErrorCode::DriverCountOutOfRange,
            EngineError::ZeroMaxPlayers => EngineErrorCode::ZeroMaxPlayers,
            EngineError::DoubleStart => EngineErrorCode::DoubleStart,
            EngineError::BindFailure(_) => EngineErrorCode::BindFailure,
        }
    }
}
