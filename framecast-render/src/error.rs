use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Canvas allocation failed: {0}x{1} is not a valid canvas size")]
    CanvasAllocation(u32, u32),

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Unsupported layer content: {0}")]
    UnsupportedContent(String),

    #[error("Layer has no raster payload: {0}")]
    MissingPayload(String),

    #[error("Invalid raster payload: {0}")]
    InvalidPayload(String),

    #[error("Image decode error: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("Font error: {0}")]
    Font(String),

    #[error("Animation error: {0}")]
    Animation(String),

    #[error("Render worker gone: {0}")]
    WorkerGone(String),

    #[error("Render task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;
