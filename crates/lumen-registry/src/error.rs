use lumen_common::types::{ControllerId, GroupId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry store unavailable: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry file is corrupt: {0}")]
    Corrupt(String),

    #[error("controller not found: {0}")]
    ControllerNotFound(ControllerId),

    #[error("group not found: {0}")]
    GroupNotFound(GroupId),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
