//! Calling another query from inside a projected row.
use tracing::debug;

use super::output::OutputSink;
use crate::engine::{Engine, Phase, RequestContext};
use crate::error::{DataServiceError, Result};
use crate::model::{CallQuery, QueryDefinition};
use crate::param::{ExternalParamCollection, ParamMap};

/// Build the called query's parameters from the caller's row.
///
/// A with-param whose source has no value is skipped when the target
/// parameter will be filled in anyway: it has a default, or it is optional
/// on an update-shaped query. Anything else is an error.
pub fn relay_params(
    call: &CallQuery,
    row: &ExternalParamCollection,
    target: &QueryDefinition,
) -> Result<ParamMap> {
    let mut params = ParamMap::new();
    for with in &call.with_params {
        if let Some(found) = row.resolve(with.origin, &with.source) {
            params.insert(with.name.clone(), found.value.clone());
            continue;
        }

        let skippable = target.param(&with.name).is_some_and(|def| {
            def.default_value.is_some() || (def.optional && target.kind().is_update())
        });
        if skippable {
            debug!(
                query = %target.id,
                param = %with.name,
                "with-param source missing, leaving parameter unset"
            );
            continue;
        }
        return Err(DataServiceError::IncompatibleParameters(format!(
            "no value for '{}' of query '{}' (from {:?} '{}')",
            with.name, target.id, with.origin, with.source
        )));
    }
    Ok(params)
}

/// Run `call` to completion, both phases, one level below the caller.
pub(crate) async fn invoke_nested(
    engine: &Engine,
    ctx: &mut RequestContext,
    out: &mut dyn OutputSink,
    call: &CallQuery,
    row: &ExternalParamCollection,
    depth: usize,
) -> Result<()> {
    let target = engine.query(&call.query_id)?;
    let params = relay_params(call, row, &target)?;
    let id = ctx.next_invocation(depth);
    ctx.reset_slot(id);
    debug!(query = %call.query_id, invocation = %id, "nested call");
    engine
        .invoke(ctx, &call.query_id, params, Phase::Both, id, out)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::WithParam;
    use crate::param::{DataType, ParamOrigin, ParamValue, QueryParam};

    fn row() -> ExternalParamCollection {
        let mut row = ExternalParamCollection::new(false);
        row.add(ParamOrigin::Column, "CUSTOMER_ID", "42".into());
        row.add(ParamOrigin::QueryParam, "region", "eu".into());
        row
    }

    #[test]
    fn test_relay_with_origin_fallback() {
        let target = QueryDefinition::new(
            "orders",
            "main",
            "SELECT * FROM orders WHERE customer = :cid AND region = :r",
            vec![
                QueryParam::new("cid", DataType::Integer),
                QueryParam::new("r", DataType::String),
            ],
        );
        let call = CallQuery::new("orders")
            .with(WithParam::param("cid", "customer_id"))
            .with(WithParam::column("r", "region"));
        let params = relay_params(&call, &row(), &target).unwrap();
        assert_eq!(params.get("cid"), Some(&ParamValue::scalar("42")));
        assert_eq!(params.get("r"), Some(&ParamValue::scalar("eu")));
    }

    #[test]
    fn test_missing_source_on_optional_update_param_is_skipped() {
        let target = QueryDefinition::new(
            "touch",
            "main",
            "UPDATE customers SET note = :note WHERE id = :id",
            vec![
                QueryParam::new("note", DataType::String).optional(),
                QueryParam::new("id", DataType::Integer),
            ],
        );
        let call = CallQuery::new("touch")
            .with(WithParam::column("note", "missing_column"))
            .with(WithParam::column("id", "customer_id"));
        let params = relay_params(&call, &row(), &target).unwrap();
        assert!(!params.contains("note"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_missing_source_on_select_param_fails() {
        let target = QueryDefinition::new(
            "find",
            "main",
            "SELECT * FROM t WHERE note = :note",
            vec![QueryParam::new("note", DataType::String).optional()],
        );
        let call = CallQuery::new("find").with(WithParam::column("note", "missing_column"));
        let err = relay_params(&call, &row(), &target).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleParameters);
    }

    #[test]
    fn test_missing_source_with_default_is_skipped() {
        let target = QueryDefinition::new(
            "find",
            "main",
            "SELECT * FROM t WHERE owner = :owner",
            vec![QueryParam::new("owner", DataType::String).with_default("#{USERNAME}")],
        );
        let call = CallQuery::new("find").with(WithParam::column("owner", "missing_column"));
        assert!(relay_params(&call, &row(), &target).unwrap().is_empty());
    }
}
