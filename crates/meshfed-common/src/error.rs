//! Error taxonomy for the federation controller

/// Error type for federation control-plane operations
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    /// Malformed or invalid configuration documents. Fatal at startup.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Cluster catalog lookup failure. Aborts the current synthesis pass;
    /// fatal during the startup bootstrap probe.
    #[error("cluster api error: {0}")]
    ClusterApi(String),

    /// Discovery stream dial or receive failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A structured patch payload failed to encode or decode as JSON.
    #[error("patch encoding error: {0}")]
    PatchEncoding(#[from] serde_json::Error),

    /// An internal channel endpoint was dropped.
    #[error("channel closed")]
    ChannelClosed,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl From<tonic::Status> for FederationError {
    fn from(status: tonic::Status) -> Self {
        FederationError::Protocol(status.to_string())
    }
}

impl From<tonic::transport::Error> for FederationError {
    fn from(err: tonic::transport::Error) -> Self {
        FederationError::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FederationError>;
