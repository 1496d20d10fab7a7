use serde::Deserialize;
use sqlparser::ast as sp;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;
use std::fmt;
use std::sync::Arc;

use super::projection::ResultSection;
use crate::binder::PreparedTemplate;
use crate::param::{ParamSnapshot, QueryParam};

/// Shape of the statement a query runs, derived from its template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Returns rows (SELECT, WITH, SHOW, ...)
    Query,
    /// Modifies rows (INSERT, UPDATE, DELETE, MERGE)
    Update,
    /// Stored procedure call
    Call,
    Other,
}

impl StatementKind {
    /// Classify a positional template. Falls back to the leading keyword when
    /// the text does not parse (backend-specific syntax, splice points).
    pub fn classify(sql: &str) -> Self {
        match SqlParser::parse_sql(&GenericDialect {}, sql) {
            Ok(statements) => match statements.first() {
                Some(stmt) => Self::from_statement(stmt),
                None => StatementKind::Other,
            },
            Err(_) => Self::from_keyword(sql),
        }
    }

    fn from_statement(stmt: &sp::Statement) -> Self {
        match stmt {
            sp::Statement::Query(_) | sp::Statement::ShowTables { .. } => StatementKind::Query,
            sp::Statement::Insert { .. }
            | sp::Statement::Update { .. }
            | sp::Statement::Delete { .. }
            | sp::Statement::Merge { .. } => StatementKind::Update,
            sp::Statement::Call { .. } => StatementKind::Call,
            _ => StatementKind::Other,
        }
    }

    fn from_keyword(sql: &str) -> Self {
        let first = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or_default()
            .to_uppercase();
        match first.as_str() {
            "SELECT" | "WITH" | "SHOW" | "VALUES" | "TABLE" | "EXPLAIN" => StatementKind::Query,
            "INSERT" | "UPDATE" | "DELETE" | "MERGE" | "UPSERT" => StatementKind::Update,
            "CALL" | "EXEC" | "EXECUTE" | "{CALL" => StatementKind::Call,
            _ => StatementKind::Other,
        }
    }

    pub fn is_update(self) -> bool {
        self == StatementKind::Update
    }
}

/// Advanced per-query settings. Timeouts and fetch size are advisory and
/// interpreted by the backend adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueryProperties {
    pub fetch_size: Option<u32>,
    pub query_timeout_secs: Option<u64>,
    pub max_rows: Option<usize>,
    /// `None` leaves the datasource's default in effect.
    pub auto_commit: Option<bool>,
    /// Whether this query may join a backend batch.
    pub batch_enabled: bool,
    pub return_updated_row_count: bool,
    pub return_generated_keys: bool,
    pub key_columns: Vec<String>,
}

impl Default for QueryProperties {
    fn default() -> Self {
        Self {
            fetch_size: None,
            query_timeout_secs: None,
            max_rows: None,
            auto_commit: None,
            batch_enabled: true,
            return_updated_row_count: false,
            return_generated_keys: false,
            key_columns: Vec::new(),
        }
    }
}

/// Point in the protocol at which a hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// After validation, before the backend is called
    Input,
    /// Before the first result row is written
    Output,
}

#[derive(Debug)]
pub struct HookEvent<'a> {
    pub point: HookPoint,
    pub query_id: &'a str,
    pub params: &'a ParamSnapshot,
}

/// Side-effect callback attached to a query. Failures are reported but never
/// stop the invocation.
pub trait QueryHook: Send + Sync + fmt::Debug {
    fn on_event(&self, event: &HookEvent<'_>) -> anyhow::Result<()>;
}

/// A loaded query. Shared read-only across concurrent requests.
#[derive(Debug, Clone)]
pub struct QueryDefinition {
    pub id: String,
    pub datasource: String,
    pub sql: String,
    pub params: Vec<Arc<QueryParam>>,
    pub result: Option<ResultSection>,
    pub properties: QueryProperties,
    pub input_hook: Option<Arc<dyn QueryHook>>,
    pub output_hook: Option<Arc<dyn QueryHook>>,
    template: PreparedTemplate,
    kind: StatementKind,
}

impl QueryDefinition {
    pub fn new(
        id: impl Into<String>,
        datasource: impl Into<String>,
        sql: impl Into<String>,
        params: Vec<QueryParam>,
    ) -> Self {
        let sql = sql.into();
        let params: Vec<Arc<QueryParam>> = params.into_iter().map(Arc::new).collect();
        let template = PreparedTemplate::compile(&sql, &params);
        let kind = StatementKind::classify(template.sql());
        Self {
            id: id.into(),
            datasource: datasource.into(),
            sql,
            params,
            result: None,
            properties: QueryProperties::default(),
            input_hook: None,
            output_hook: None,
            template,
            kind,
        }
    }

    pub fn with_result(mut self, result: ResultSection) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_properties(mut self, properties: QueryProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_input_hook(mut self, hook: Arc<dyn QueryHook>) -> Self {
        self.input_hook = Some(hook);
        self
    }

    pub fn with_output_hook(mut self, hook: Arc<dyn QueryHook>) -> Self {
        self.output_hook = Some(hook);
        self
    }

    pub fn template(&self) -> &PreparedTemplate {
        &self.template
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    pub fn param(&self, name: &str) -> Option<&Arc<QueryParam>> {
        self.params.iter().find(|p| p.matches_name(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::DataType;

    #[test]
    fn test_classify_parsed_statements() {
        assert_eq!(StatementKind::classify("SELECT * FROM t WHERE a = ?"), StatementKind::Query);
        assert_eq!(
            StatementKind::classify("WITH c AS (SELECT 1) SELECT * FROM c"),
            StatementKind::Query
        );
        assert_eq!(
            StatementKind::classify("INSERT INTO t (a, b) VALUES (?, ?)"),
            StatementKind::Update
        );
        assert_eq!(StatementKind::classify("UPDATE t SET a = ? WHERE id = ?"), StatementKind::Update);
        assert_eq!(StatementKind::classify("DELETE FROM t WHERE id = ?"), StatementKind::Update);
        assert_eq!(StatementKind::classify("CREATE TABLE x (a INT)"), StatementKind::Other);
    }

    #[test]
    fn test_classify_falls_back_to_keyword() {
        assert_eq!(
            StatementKind::classify("select * from t where ? ~~ weird syntax ((("),
            StatementKind::Query
        );
        assert_eq!(
            StatementKind::classify("update t set x = x + 1 where ??? (("),
            StatementKind::Update
        );
    }

    #[test]
    fn test_definition_compiles_template() {
        let q = QueryDefinition::new(
            "byId",
            "main",
            "UPDATE items SET name = :name WHERE id = :id",
            vec![
                QueryParam::new("id", DataType::Integer),
                QueryParam::new("name", DataType::String),
            ],
        );
        assert_eq!(q.template().sql(), "UPDATE items SET name = ? WHERE id = ?");
        assert_eq!(q.kind(), StatementKind::Update);
        assert!(!q.has_result());
        assert!(q.param("ID").is_some());
        assert!(q.properties.batch_enabled);
    }
}
