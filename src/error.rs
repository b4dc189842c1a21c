use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Construction-time failures. Everything here is fatal to the run:
/// once the engine has started there are no user-visible recoverable
/// errors, so the taxonomy stays small.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unknown engine option: {0}")]
    UnknownOption(String),
    #[error("unknown scheduler: {0}")]
    UnknownScheduler(String),
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
}
