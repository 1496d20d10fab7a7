//! Service descriptors.
//!
//! A descriptor is a TOML file listing datasources, queries and operations:
//!
//! ```toml
//! [service]
//! name = "shop"
//!
//! [[datasource]]
//! id = "main"
//! database = "shop"
//! username = "app"
//!
//! [[query]]
//! id = "customer"
//! datasource = "main"
//! sql = "SELECT id, name FROM customers WHERE id = :id"
//! [[query.param]]
//! name = "id"
//! type = "INTEGER"
//! [query.result]
//! element = "customers"
//! [query.result.row]
//! name = "customer"
//! [[query.result.row.children]]
//! type = "static"
//! name = "name"
//! source = { column = "name" }
//!
//! [[operation]]
//! name = "get_customer"
//! query = "customer"
//! ```
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::backend::postgres::{PgDatasourceConfig, PostgresAdapter};
use crate::engine::Engine;
use crate::model::{
    CallQuery, HookEvent, Operation, QueryDefinition, QueryHook, QueryProperties, ResultSection,
    WithParam,
};
use crate::param::{
    Cardinality, DataType, Direction, DoubleRangeValidator, LengthValidator, LongRangeValidator,
    PatternValidator, QueryParam, Validator,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceConfig {
    #[serde(default)]
    pub service: ServiceInfo,
    #[serde(default, rename = "datasource")]
    pub datasources: Vec<DatasourceConfig>,
    #[serde(default, rename = "query")]
    pub queries: Vec<QueryConfig>,
    #[serde(default, rename = "operation")]
    pub operations: Vec<OperationConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServiceInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DatasourceConfig {
    pub id: String,
    #[serde(flatten)]
    pub postgres: PgDatasourceConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QueryConfig {
    pub id: String,
    pub datasource: String,
    pub sql: String,
    #[serde(default, rename = "param")]
    pub params: Vec<ParamConfig>,
    #[serde(default)]
    pub properties: QueryProperties,
    #[serde(default)]
    pub result: Option<ResultSection>,
    /// Trace input and output events of this query.
    #[serde(default)]
    pub log_events: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ParamConfig {
    pub name: String,
    #[serde(default, rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default)]
    pub ordinals: Vec<usize>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub force_default: bool,
    #[serde(default)]
    pub struct_type: Option<String>,
    #[serde(default, rename = "validator")]
    pub validators: Vec<ValidatorConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ValidatorConfig {
    Length {
        min: Option<usize>,
        max: Option<usize>,
    },
    LongRange {
        min: Option<i64>,
        max: Option<i64>,
    },
    DoubleRange {
        min: Option<f64>,
        max: Option<f64>,
    },
    Pattern {
        pattern: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OperationConfig {
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub with_params: Vec<WithParam>,
}

/// Logs every input and output event at info level.
#[derive(Debug)]
pub struct TracingHook;

impl QueryHook for TracingHook {
    fn on_event(&self, event: &HookEvent<'_>) -> anyhow::Result<()> {
        info!(
            query = event.query_id,
            point = ?event.point,
            params = %event.params,
            "query event"
        );
        Ok(())
    }
}

impl ValidatorConfig {
    fn build(&self) -> Result<Arc<dyn Validator>> {
        Ok(match self {
            ValidatorConfig::Length { min, max } => Arc::new(LengthValidator {
                min: *min,
                max: *max,
            }),
            ValidatorConfig::LongRange { min, max } => Arc::new(LongRangeValidator {
                min: *min,
                max: *max,
            }),
            ValidatorConfig::DoubleRange { min, max } => Arc::new(DoubleRangeValidator {
                min: *min,
                max: *max,
            }),
            ValidatorConfig::Pattern { pattern } => Arc::new(
                PatternValidator::new(pattern)
                    .with_context(|| format!("invalid validator pattern '{}'", pattern))?,
            ),
        })
    }
}

impl ParamConfig {
    fn build(&self) -> Result<QueryParam> {
        let mut param = QueryParam::new(self.name.clone(), self.data_type.clone())
            .with_direction(self.direction)
            .with_ordinals(self.ordinals.clone());
        param.cardinality = self.cardinality;
        param.default_value = self.default.clone();
        param.optional = self.optional;
        param.force_default = self.force_default;
        param.struct_type = self.struct_type.clone();
        for validator in &self.validators {
            param = param.with_validator(
                validator
                    .build()
                    .with_context(|| format!("parameter '{}'", self.name))?,
            );
        }
        Ok(param)
    }
}

impl QueryConfig {
    fn build(&self) -> Result<QueryDefinition> {
        let params = self
            .params
            .iter()
            .map(ParamConfig::build)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("query '{}'", self.id))?;
        let mut query = QueryDefinition::new(&self.id, &self.datasource, &self.sql, params)
            .with_properties(self.properties.clone());
        if let Some(result) = &self.result {
            let mut result = result.clone();
            result.assign_group_ids();
            query = query.with_result(result);
        }
        if self.log_events {
            let hook: Arc<dyn QueryHook> = Arc::new(TracingHook);
            query = query
                .with_input_hook(Arc::clone(&hook))
                .with_output_hook(hook);
        }
        Ok(query)
    }
}

impl ServiceConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse service descriptor")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    /// `<config dir>/dsrelay/service.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dsrelay")
            .join("service.toml")
    }

    /// Build an engine with a PostgreSQL adapter per datasource.
    pub fn build_engine(&self) -> Result<Engine> {
        let mut engine = Engine::new();
        let mut seen = HashSet::new();
        for ds in &self.datasources {
            if !seen.insert(ds.id.as_str()) {
                bail!("datasource '{}' is declared twice", ds.id);
            }
            let adapter = PostgresAdapter::new(ds.id.clone(), ds.postgres.clone());
            engine.register_backend(ds.id.clone(), Arc::new(adapter));
        }
        self.populate(&mut engine)?;
        info!(
            service = %self.service.name,
            queries = self.queries.len(),
            operations = self.operations.len(),
            "service loaded"
        );
        Ok(engine)
    }

    /// Add every query and operation to `engine` and check the references
    /// between them. Backends must already be registered.
    pub fn populate(&self, engine: &mut Engine) -> Result<()> {
        let mut ids = HashSet::new();
        for query in &self.queries {
            if !ids.insert(query.id.as_str()) {
                bail!("query '{}' is declared twice", query.id);
            }
            engine.add_query(query.build()?);
        }
        for op in &self.operations {
            let mut call = CallQuery::new(op.query.clone());
            call.with_params = op.with_params.clone();
            let mut operation = Operation::new(op.name.clone(), call);
            if let Some(description) = &op.description {
                operation = operation.with_description(description.clone());
            }
            engine.add_operation(operation);
        }
        engine.verify().context("invalid service descriptor")?;
        Ok(())
    }
}
