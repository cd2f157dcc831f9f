//! Transport trait abstraction for pluggable dialers

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connected byte stream to the language server
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Human-readable description of the remote end
    fn peer(&self) -> String;
}

/// Factory for dial attempts
///
/// Each call to `connect` is one dial; the connection manager decides when
/// and how often to call it.
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    /// The stream type this connector produces
    type Stream: TransportStream;

    /// Attempt to connect, returning a stream on success
    async fn connect(&self) -> Result<Self::Stream>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;

    /// Where this connector dials
    fn target(&self) -> String;
}
