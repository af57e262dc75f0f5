use std::fmt;

/// Identity of one atomic request.
///
/// Combines the originating query, the plan node that produced the request and
/// an execution counter assigned by the dispatcher, so resubmitting the same
/// plan node yields a distinct id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId {
    pub query_id: String,
    pub node_id: u32,
    pub execution: u64,
}

impl RequestId {
    pub fn new(query_id: impl Into<String>, node_id: u32, execution: u64) -> Self {
        Self { query_id: query_id.into(), node_id, execution }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.query_id, self.node_id, self.execution)
    }
}
