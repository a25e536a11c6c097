//! `meshnet`: a client/server message engine — connection lifecycle, wire framing, staged
//! send/receive pipelines and a typed dispatcher over a tick-driven I/O loop.

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod frame;
pub mod logging;
pub mod pipeline;
pub mod receiver;
pub mod sender;
pub mod time;
pub mod transport;

pub use meshnet_macros::handler;

/// Common imports for a `meshnet` host application.
pub mod prelude {
    pub use crate::codec::{ArgsCodec, CodecRegistry, Deserialize, Serialize, SizedRead, SizedWrite, Timestamp, Vec2, Vec3};
    pub use crate::config::{EngineConfig, MessageSide};
    pub use crate::connection::{ConnectionDirectory, ConnectionRecord, Uid};
    pub use crate::dispatch::Dispatcher;
    pub use crate::engine::{Engine, Role, TickReport};
    pub use crate::error::{EngineError, FrameError, RegistrationError};
    pub use crate::pipeline::{Pipeline, PipelineParams, PipelineSet, StepOutcome};
    pub use crate::transport::{ConnectionEvent, LoopbackTransport, PipelineKind, TcpTransport, Transport};
    pub use meshnet_macros::handler;
}
