use arrow::error::ArrowError;
use igloo_dispatch::DispatchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to load configuration")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Invalid query: {0}")]
    Query(#[from] igloo_common::Error),

    #[error("Failed to render results")]
    Arrow(#[from] ArrowError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Scan of request {0} was cancelled")]
    Cancelled(String),

    #[error("Delivery stream closed before request {0} finished")]
    Disconnected(String),
}
