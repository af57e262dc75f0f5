use thiserror::Error;

use arrow::error::ArrowError;
use sqlparser::parser::ParserError;

/// Error type shared by Igloo connectors and translators.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Translation error: {0}")]
    Translation(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Operation not supported: {0}")]
    NotSupported(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Arrow error: {0}")]
    Arrow(#[from] ArrowError),
    #[error("SQL parsing error: {0}")]
    SqlParser(#[from] ParserError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn execution(msg: impl Into<String>) -> Self {
        Error::Execution(msg.into())
    }

    pub fn translation(msg: impl Into<String>) -> Self {
        Error::Translation(msg.into())
    }
}
