// RTP/RTCP transform pipeline for media sockets
//
// This library intercepts every inbound and outbound RTP/RTCP packet on a media
// socket pair and runs it through an ordered chain of reversible transformers.
// It also carries the reconnect state machine that keeps network registrations
// alive across connection failures and interface changes.

pub mod packet;
pub mod transform;
pub mod feedback;
pub mod stream;
pub mod connector;
pub mod reconnect;
pub mod config;

// Re-export commonly used types
pub use packet::RawPacket;
pub use transform::{PacketTransformer, TransformEngine, TransformEngineChain, TransformerHandle};
pub use config::Config;

/// Error types for the transform pipeline
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum TransformError {
        #[error("Packet error: {0}")]
        Packet(String),

        #[error("Transform error: {0}")]
        Transform(String),

        #[error("Outbound packet blocked by transformer while {targets} target(s) are active")]
        OutputBlocked { targets: usize },

        #[error("Stream error: {0}")]
        Stream(String),

        #[error("Connector error: {0}")]
        Connector(String),

        #[error("Registration error: {0}")]
        Registration(String),

        #[error("Config error: {0}")]
        Config(String),

        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),

        #[error("JSON error: {0}")]
        Json(#[from] serde_json::Error),

        #[error("Other error: {0}")]
        Other(String),
    }

    pub type Result<T> = std::result::Result<T, TransformError>;
}

pub use error::{Result, TransformError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging for the transform pipeline
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();
}
