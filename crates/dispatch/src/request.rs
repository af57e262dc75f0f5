use crate::error::DispatchError;
use igloo_connector::{Command, Connector, ExecutionContext, NativeQuery, Translator};
use std::fmt;
use std::sync::Arc;

/// The command of an atomic request, before or after translation.
#[derive(Debug, Clone)]
pub enum RequestCommand {
    Untranslated(Command),
    Translated(NativeQuery),
}

/// One unit of work against a single data source.
///
/// The connector is owned by the request, and therefore by the work item that
/// runs it; it is never shared with another request.
pub struct AtomicRequest {
    pub query_id: String,
    pub node_id: u32,
    pub command: RequestCommand,
    pub context: ExecutionContext,
    pub translator: Option<Arc<dyn Translator>>,
    pub connector: Option<Box<dyn Connector>>,
}

impl fmt::Debug for AtomicRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicRequest")
            .field("query_id", &self.query_id)
            .field("node_id", &self.node_id)
            .field("command", &self.command)
            .field("context", &self.context)
            .field("has_translator", &self.translator.is_some())
            .field("has_connector", &self.connector.is_some())
            .finish()
    }
}

impl AtomicRequest {
    pub fn new(query_id: impl Into<String>, node_id: u32, command: RequestCommand) -> Self {
        Self {
            query_id: query_id.into(),
            node_id,
            command,
            context: ExecutionContext::default(),
            translator: None,
            connector: None,
        }
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Box::new(connector));
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.query_id.trim().is_empty() {
            return Err(DispatchError::InvalidRequest("query id is empty".to_string()));
        }
        if self.connector.is_none() {
            return Err(DispatchError::InvalidRequest(format!(
                "request {}.{} has no target connector",
                self.query_id, self.node_id
            )));
        }
        if matches!(self.command, RequestCommand::Untranslated(_)) && self.translator.is_none() {
            return Err(DispatchError::InvalidRequest(format!(
                "request {}.{} needs a translator for its command",
                self.query_id, self.node_id
            )));
        }
        if self.context.fetch_size == 0 {
            return Err(DispatchError::InvalidRequest("fetch size must be positive".to_string()));
        }
        Ok(())
    }
}
