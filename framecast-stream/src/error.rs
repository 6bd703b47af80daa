use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Pipeline queue full ({0} frames)")]
    QueueFull(usize),

    #[error("Frame size mismatch: got {got} bytes, expected {expected}")]
    FrameSize { got: usize, expected: usize },

    #[error("Encoder error: {0}")]
    Encoder(String),

    /// Encoder exceeded its restart budget; the orchestrator must tear
    /// down and either fully restart or surface the failure.
    #[error("Encoder failed permanently after {0} restarts")]
    EncoderFatal(u32),

    #[error("RTMP protocol error: {0}")]
    Protocol(String),

    #[error("RTMP handshake failed: {0}")]
    Handshake(String),

    #[error("Publish rejected: {0}")]
    PublishRejected(#[source] framecast_core::Error),

    #[error("Core error: {0}")]
    Core(#[from] framecast_core::Error),

    #[error("Render error: {0}")]
    Render(#[from] framecast_render::RenderError),

    #[error("Preview error: {0}")]
    Preview(String),

    #[error("Not initialized")]
    NotInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;
