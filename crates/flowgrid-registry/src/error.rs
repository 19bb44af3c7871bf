use thiserror::Error;

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable")]
    Unavailable,

    #[error("registry session {0} is closed")]
    SessionClosed(u64),

    #[error("lock {0} is not held by this session")]
    LockNotHeld(String),

    #[error("registry backend error: {0}")]
    Backend(String),
}
