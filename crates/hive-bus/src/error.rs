use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed container: {0}")]
    Malformed(#[from] prost::DecodeError),

    #[error("unknown message type: {0:?}")]
    UnknownType(String),

    #[error("type tag {tag:?} does not match payload {actual}")]
    TypeMismatch { tag: String, actual: &'static str },
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("transport already started")]
    AlreadyStarted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
