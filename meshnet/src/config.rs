//! Engine configuration: a `serde`-derived struct loaded with `serdeconv::from_toml_file`, with
//! a `Default` impl supplying documented fallback values.

use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_UDP_PORT: u16 = 7777;
pub const DEFAULT_WS_PORT: u16 = 7778;

/// Filters which reflectively-scanned handlers a dispatcher picks up.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum MessageSide {
    None,
    Client,
    Server,
    /// `Client | Server`.
    Common,
    /// All bits set; matches any non-`None` handler side.
    Any,
}

impl MessageSide {
    #[inline]
    fn bits(self) -> u8 {
        match self {
            MessageSide::None => 0b00,
            MessageSide::Client => 0b01,
            MessageSide::Server => 0b10,
            MessageSide::Common => 0b11,
            MessageSide::Any => 0xFF,
        }
    }

    /// Whether a handler declared with `handler_side` should be scanned into a dispatcher
    /// configured with `self` as its side: register iff
    /// `(handler.side & dispatcher.side) != 0` when either side is `Any`, else
    /// `handler.side ⊇ dispatcher.side`.
    pub fn admits(self, handler_side: MessageSide) -> bool {
        if self == MessageSide::Any || handler_side == MessageSide::Any {
            (self.bits() & handler_side.bits()) != 0
        } else {
            (handler_side.bits() & self.bits()) == self.bits()
        }
    }
}

/// Declarative registration of a control handler slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlHandlerDecl {
    pub key: u8,
    pub expected_length: u16,
    pub side: MessageSide,
    pub required_flags: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub port: u16,
    pub use_ipv4: bool,
    /// Zero is rejected at engine construction time (`EngineError::ZeroMaxPlayers`) rather than
    /// encoded at the type level, so a malformed config file produces a clear startup error
    /// instead of a deserialization failure with no context.
    pub max_players: u32,
    pub stop_on_bind_failure: bool,
    pub message_side: MessageSide,
    #[serde(default)]
    pub control_handlers: Vec<ControlHandlerDecl>,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            port: DEFAULT_UDP_PORT,
            use_ipv4: true,
            max_players: 256,
            stop_on_bind_failure: true,
            message_side: MessageSide::Server,
            control_handlers: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Loads a configuration file. A malformed or missing file is a startup error.
    pub fn load<P: AsRef<Path>>(path: P) -> EngineConfig {
        serdeconv::from_toml_file(path).expect("Error loading engine configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.port, DEFAULT_UDP_PORT);
        assert!(cfg.use_ipv4);
        assert_eq!(cfg.max_players, 256);
    }

    #[test]
    fn message_side_any_admits_any_nonempty_side() {
        assert!(MessageSide::Any.admits(MessageSide::Client));
        assert!(MessageSide::Any.admits(MessageSide::Server));
        assert!(!MessageSide::Any.admits(MessageSide::None));
    }

    #[test]
    fn message_side_admits_checks_handler_side_is_a_superset_of_dispatcher_side() {
        // A `Common`-declared handler is valid on both sides, so a `Client`-only dispatcher
        // admits it too.
        assert!(MessageSide::Common.admits(MessageSide::Common));
        assert!(MessageSide::Client.admits(MessageSide::Common));
        assert!(MessageSide::Common.admits(MessageSide::Any));
        // But a `Client`-only handler isn't valid on the server half of a `Common` dispatcher.
        assert!(!MessageSide::Common.admits(MessageSide::Client));
    }
}
