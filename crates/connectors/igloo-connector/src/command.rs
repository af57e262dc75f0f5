use igloo_common::error::{Error, Result};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::fmt;

/// An engine-neutral command: exactly one parsed SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    statement: Statement,
}

impl Command {
    /// Parses `sql` with the generic dialect.
    pub fn parse(sql: &str) -> Result<Self> {
        let mut statements = Parser::parse_sql(&GenericDialect {}, sql)?;
        if statements.len() != 1 {
            return Err(Error::translation(format!(
                "expected exactly one statement, found {}",
                statements.len()
            )));
        }
        Ok(Self { statement: statements.remove(0) })
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }
}

impl From<Statement> for Command {
    fn from(statement: Statement) -> Self {
        Self { statement }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.statement)
    }
}

/// A command rewritten into the form a single data source executes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NativeQuery {
    /// Source-native statement text: SQL for relational sources, a path for files.
    pub statement: String,
    /// Column names to project, in output order. Empty projects every column.
    pub projection: Vec<String>,
    pub limit: Option<usize>,
}

impl NativeQuery {
    pub fn new(statement: impl Into<String>) -> Self {
        Self { statement: statement.into(), ..Default::default() }
    }

    pub fn with_projection(mut self, projection: Vec<String>) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
