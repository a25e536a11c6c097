//! Ambient logging: `slog` drains built through `sloggers`, with every subsystem holding a child
//! logger tagged with its own component name.

pub use slog::{debug, error, info, o, trace, warn, Logger};

/// Builds the root logger for a `meshnet` process. Hard-codes a terminal destination at debug
/// level; swap for a config-driven `sloggers::LoggerConfig` once the host application wants to
/// own logging policy.
pub fn root() -> Logger {
    use sloggers::terminal::{Destination, TerminalLoggerBuilder};
    use sloggers::types::Severity;
    use sloggers::Build;

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(Severity::Debug);
    builder.destination(Destination::Stderr);

    builder.build().unwrap_or_else(|_| Logger::root(slog::Discard, o!()))
}

/// A logger that discards everything. Used when the caller doesn't supply one.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
