use igloo_common::RequestId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connector pool is at capacity ({limit} concurrent executions)")]
    Overloaded { limit: usize },

    #[error("Translation failed for request {request_id}: {source}")]
    Translation {
        request_id: RequestId,
        #[source]
        source: igloo_common::Error,
    },

    #[error("Execution failed for request {request_id}: {source}")]
    Execution {
        request_id: RequestId,
        #[source]
        source: igloo_common::Error,
    },

    #[error("Connector manager is shutting down")]
    ShuttingDown,

    #[error("Invalid dispatch configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load configuration")]
    Config(#[from] config::ConfigError),
}
