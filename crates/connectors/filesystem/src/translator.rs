use igloo_common::error::{Error, Result};
use igloo_connector::{Command, ExecutionContext, NativeQuery, Translator};
use sqlparser::ast::{
    Expr, GroupByExpr, LimitClause, ObjectName, Query, SelectItem, SetExpr, Statement, TableFactor,
};
use std::path::{Component, Path, PathBuf};

/// Translates single-table SELECTs into scans of `<root>/<table>.csv`.
///
/// Schema-qualified names map to subdirectories, so `sales.orders` reads
/// `<root>/sales/orders.csv`.
#[derive(Debug, Clone)]
pub struct CsvTranslator {
    root: PathBuf,
}

impl CsvTranslator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn table_path(&self, name: &ObjectName) -> Result<PathBuf> {
        let rendered = name.to_string();
        let mut relative = PathBuf::new();
        for part in rendered.split('.') {
            relative.push(part.trim_matches(|c| c == '"' || c == '`'));
        }
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(Error::translation(format!("invalid table name: {}", rendered)));
        }
        relative.set_extension("csv");
        Ok(self.root.join(relative))
    }
}

impl Translator for CsvTranslator {
    fn translate(&self, command: &Command, _context: &ExecutionContext) -> Result<NativeQuery> {
        let query = match command.statement() {
            Statement::Query(query) => query,
            other => {
                return Err(Error::NotSupported(format!(
                    "CSV sources only accept SELECT statements, got: {}",
                    other
                )))
            }
        };
        let select = match query.body.as_ref() {
            SetExpr::Select(select) => select,
            other => {
                return Err(Error::NotSupported(format!("unsupported query body: {}", other)))
            }
        };
        if select.selection.is_some() {
            return Err(Error::NotSupported(
                "WHERE clauses are not pushed down to CSV sources".to_string(),
            ));
        }
        if select.distinct.is_some() || select.top.is_some() {
            return Err(Error::NotSupported("DISTINCT and TOP are not supported by CSV sources".to_string()));
        }
        let grouped = match &select.group_by {
            GroupByExpr::All(_) => true,
            GroupByExpr::Expressions(exprs, _) => !exprs.is_empty(),
        };
        if grouped || select.having.is_some() {
            return Err(Error::NotSupported("aggregation is not supported by CSV sources".to_string()));
        }
        if query.order_by.is_some() || !select.sort_by.is_empty() {
            return Err(Error::NotSupported("ORDER BY is not supported by CSV sources".to_string()));
        }
        let limit = scan_limit(query)?;

        let path = match select.from.as_slice() {
            [] => return Err(Error::translation("missing FROM clause")),
            [table] if table.joins.is_empty() => match &table.relation {
                TableFactor::Table { name, .. } => self.table_path(name)?,
                other => {
                    return Err(Error::NotSupported(format!("unsupported relation: {}", other)))
                }
            },
            _ => {
                return Err(Error::NotSupported(
                    "joins and multi-table scans are not supported by CSV sources".to_string(),
                ))
            }
        };

        let mut projection = Vec::with_capacity(select.projection.len());
        let mut wildcard = false;
        for item in &select.projection {
            match item {
                SelectItem::Wildcard(_) => wildcard = true,
                SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                    projection.push(ident.value.clone())
                }
                other => {
                    return Err(Error::NotSupported(format!(
                        "only plain column references can be projected, got: {}",
                        other
                    )))
                }
            }
        }
        if wildcard && !projection.is_empty() {
            return Err(Error::NotSupported(
                "mixing * with named columns is not supported".to_string(),
            ));
        }

        let native = NativeQuery::new(path_to_statement(&path)).with_projection(projection);
        Ok(match limit {
            Some(limit) => native.with_limit(limit),
            None => native,
        })
    }
}

/// The row limit of a plain `LIMIT n`. Offsets and `FETCH` would need the
/// scan to skip rows, which CSV sources do not do.
fn scan_limit(query: &Query) -> Result<Option<usize>> {
    if query.fetch.is_some() {
        return Err(Error::NotSupported("FETCH is not supported by CSV sources".to_string()));
    }
    let limit = match &query.limit_clause {
        None => return Ok(None),
        Some(LimitClause::LimitOffset { limit, offset: None, limit_by }) if limit_by.is_empty() => limit,
        Some(other) => {
            return Err(Error::NotSupported(format!(
                "only a plain LIMIT is supported by CSV sources, got: {}",
                other
            )))
        }
    };
    match limit {
        // LIMIT ALL
        None => Ok(None),
        Some(expr @ Expr::Value(_)) => expr
            .to_string()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| Error::translation(format!("LIMIT must be a non-negative integer, got: {}", expr))),
        Some(other) => Err(Error::NotSupported(format!("LIMIT must be a literal, got: {}", other))),
    }
}

fn path_to_statement(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(sql: &str) -> Result<NativeQuery> {
        let translator = CsvTranslator::new("/data");
        let command = Command::parse(sql).unwrap();
        translator.translate(&command, &ExecutionContext::default())
    }

    #[test]
    fn test_translates_projection_and_table() {
        let query = translate("SELECT id, name FROM people").unwrap();
        assert_eq!(query.statement, "/data/people.csv");
        assert_eq!(query.projection, vec!["id".to_string(), "name".to_string()]);
        assert_eq!(query.limit, None);
    }

    #[test]
    fn test_wildcard_projects_everything() {
        let query = translate("SELECT * FROM people").unwrap();
        assert!(query.projection.is_empty());
    }

    #[test]
    fn test_schema_qualified_tables_map_to_directories() {
        let query = translate("SELECT * FROM sales.orders").unwrap();
        assert_eq!(query.statement, "/data/sales/orders.csv");
    }

    #[test]
    fn test_rejects_filters() {
        let err = translate("SELECT id FROM people WHERE id = 1").unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_rejects_joins() {
        let err = translate("SELECT a.id FROM a JOIN b ON a.id = b.id").unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_rejects_non_select_statements() {
        let err = translate("DELETE FROM people").unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_limit_is_pushed_down() {
        let query = translate("SELECT name FROM people LIMIT 2").unwrap();
        assert_eq!(query.limit, Some(2));
        assert_eq!(query.projection, vec!["name".to_string()]);
    }

    #[test]
    fn test_limit_all_means_no_limit() {
        let query = translate("SELECT * FROM people LIMIT ALL").unwrap();
        assert_eq!(query.limit, None);
    }

    #[test]
    fn test_rejects_clauses_that_change_the_result() {
        for sql in [
            "SELECT * FROM people ORDER BY id DESC",
            "SELECT id FROM people GROUP BY id",
            "SELECT id FROM people GROUP BY id HAVING COUNT(*) > 1",
            "SELECT DISTINCT id FROM people",
            "SELECT * FROM people LIMIT 1 OFFSET 5",
            "SELECT * FROM people OFFSET 5",
        ] {
            let err = translate(sql).unwrap_err();
            assert!(matches!(err, Error::NotSupported(_)), "{} -> {:?}", sql, err);
        }
    }

    #[test]
    fn test_rejects_non_literal_limit() {
        let err = translate("SELECT * FROM people LIMIT id").unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_rejects_missing_from() {
        let err = translate("SELECT 1").unwrap_err();
        assert!(err.to_string().contains("FROM"));
    }
}
