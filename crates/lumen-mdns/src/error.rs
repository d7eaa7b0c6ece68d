use thiserror::Error;

#[derive(Debug, Error)]
pub enum MdnsError {
    #[error("mDNS daemon error: {0}")]
    Daemon(String),

    #[error("invalid announcement: {0}")]
    InvalidAnnouncement(String),

    #[error("mDNS daemon must be started inside a tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MdnsError>;
