use crate::wg::config::ParseError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    ParseError(#[from] ParseError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{program} failed ({code:?}): {stderr}")]
    Command {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("interface already exists: {0}")]
    AlreadyExists(String),

    #[error("rejected by driver: {0}")]
    Rejected(String),
}
