use thiserror::Error;

#[derive(Debug, Error)]
pub enum FixlineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("dictionary: {0}")]
    Dictionary(String),

    #[error("unknown tag name: {0}")]
    UnknownTag(String),

    #[error("unknown tag number: {0}")]
    UnknownTagNumber(String),

    #[error("malformed field: {0}")]
    MalformedField(String),

    #[error("cannot compile message: {0}")]
    Compile(String),

    #[error("session closed")]
    SessionClosed,

    #[error("channel closed")]
    ChannelClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("TLS: {0}")]
    Tls(#[from] native_tls::Error),
}

pub type Result<T> = std::result::Result<T, FixlineError>;
