use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmrpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Invalid routing pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Channel pool acquisition timed out after {0}ms")]
    PoolTimeout(u64),

    #[error("Channel pool is closed")]
    PoolClosed,

    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AmrpcError {
    /// Returns true for failures of the broker connection or channel.
    ///
    /// These are the errors the server's receive loop answers with a
    /// reconnect; everything else is a local or per-call failure.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AmrpcError::Transport(_) | AmrpcError::Connection(_) | AmrpcError::Io(_)
        )
    }
}

#[cfg(feature = "amqp")]
impl From<lapin::Error> for AmrpcError {
    fn from(err: lapin::Error) -> Self {
        AmrpcError::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AmrpcError>;
