pub type FramixResult<T> = Result<T, FramixError>;

/// Media normalization failures. Raised while turning raw bytes into a
/// canonical asset; never raised by the compositor.
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("source contains no frames")]
    NoFrames,

    #[error("declared media duration {0} is non-finite or non-positive")]
    InvalidDuration(f64),

    #[error("unsupported media container: {0}")]
    UnsupportedFormat(String),
}

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("no drawing surface: {0}")]
    NoContext(String),

    #[error("layer '{layer}': {msg}")]
    Layer { layer: String, msg: String },
}

#[derive(thiserror::Error, Debug)]
pub enum EncodeError {
    #[error("no encoding context: {0}")]
    NoContext(String),

    #[error("container serialization produced no data: {0}")]
    SerializationFailed(String),

    #[error("no supported codec: {0}")]
    UnsupportedCodec(String),
}

#[derive(thiserror::Error, Debug)]
pub enum TimeoutError {
    #[error("video seek did not settle within {waited_ms}ms")]
    SeekTimeout { waited_ms: u64 },
}

#[derive(thiserror::Error, Debug)]
pub enum FramixError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("render error: {0}")]
    Render(#[from] RenderError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("timeout error: {0}")]
    Timeout(#[from] TimeoutError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FramixError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn layer(layer: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Render(RenderError::Layer {
            layer: layer.into(),
            msg: msg.into(),
        })
    }

    pub fn no_surface(msg: impl Into<String>) -> Self {
        Self::Render(RenderError::NoContext(msg.into()))
    }
}
