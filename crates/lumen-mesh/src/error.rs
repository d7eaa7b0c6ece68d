use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("registry error: {0}")]
    Registry(#[from] lumen_registry::RegistryError),

    #[error("mdns error: {0}")]
    Mdns(#[from] lumen_mdns::MdnsError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid group: {0}")]
    InvalidGroup(String),

    #[error("probe client error: {0}")]
    Probe(String),

    #[error("mesh runtime is not running")]
    Stopped,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MeshError>;
