//! Result projection: backend rows in, structured output out.
//!
//! Each row arrives through [`RowProjector`], which is the backend's
//! [`RowSink`]. When a row ends, the query's projection tree is walked top
//! down. Groups open wrapper elements, statics resolve values from the row's
//! columns and the invocation's parameters, and nested calls run another
//! query whose output lands inside the current row.
mod nested;
mod output;
mod roles;

pub use nested::relay_params;
pub use output::*;
pub use roles::*;

pub(crate) use nested::invoke_nested;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;

use crate::backend::RowSink;
use crate::engine::{Engine, RequestContext};
use crate::error::{DataServiceError, Result};
use crate::model::{
    Export, GroupNode, OutputKind, ProjectionNode, QueryDefinition, ResultSection, StaticNode,
    ValueSource,
};
use crate::param::{Cardinality, ExternalParamCollection, ParamMap, ParamOrigin, ParamValue};

/// Walks a projection tree for one row.
struct Projector<'a> {
    engine: &'a Engine,
    ctx: &'a mut RequestContext,
    out: &'a mut dyn OutputSink,
    query_id: &'a str,
    depth: usize,
    escape: bool,
}

impl<'a> Projector<'a> {
    fn project_group<'b>(
        &'b mut self,
        group: &'b GroupNode,
        row: &'b ExternalParamCollection,
        inherited_ns: Option<&'b str>,
    ) -> BoxFuture<'b, Result<()>> {
        async move {
            let Some(array) = &group.array_name else {
                return self.write_group(group, row, inherited_ns).await;
            };
            match row.resolve(ParamOrigin::Column, array).map(|p| &p.value) {
                Some(ParamValue::Array(items)) => {
                    for idx in 0..items.len() {
                        let narrowed = row.narrowed_to(idx);
                        self.write_group(group, &narrowed, inherited_ns).await?;
                    }
                    Ok(())
                }
                Some(_) => self.write_group(group, row, inherited_ns).await,
                None => Ok(()),
            }
        }
        .boxed()
    }

    async fn write_group(
        &mut self,
        group: &GroupNode,
        row: &ExternalParamCollection,
        inherited_ns: Option<&str>,
    ) -> Result<()> {
        let visible = self.visible_children(group);
        let namespace = group.namespace.as_deref().or(inherited_ns);

        if let Some(name) = &group.name {
            self.out.start_element(name, namespace)?;
        }
        for &idx in &visible.attributes {
            if let ProjectionNode::Static(node) = &group.children[idx] {
                self.write_static(node, row, namespace)?;
            }
        }
        for &idx in &visible.elements {
            match &group.children[idx] {
                ProjectionNode::Group(inner) => self.project_group(inner, row, namespace).await?,
                ProjectionNode::Static(node) => self.write_static(node, row, namespace)?,
                ProjectionNode::Nested(call) => {
                    invoke_nested(
                        self.engine,
                        &mut *self.ctx,
                        &mut *self.out,
                        call,
                        row,
                        self.depth + 1,
                    )
                    .await?
                }
            }
        }
        if group.name.is_some() {
            self.out.end_element()?;
        }
        Ok(())
    }

    /// Role-filtered children, computed once per request and group.
    fn visible_children(&mut self, group: &GroupNode) -> Arc<VisibleChildren> {
        let key = (self.query_id.to_string(), group.id);
        if let Some(cached) = self.ctx.visibility.get(&key) {
            return Arc::clone(cached);
        }
        let visible = Arc::new(filter_children(group, &self.ctx.user.roles));
        self.ctx.visibility.insert(key, Arc::clone(&visible));
        visible
    }

    fn write_static(
        &mut self,
        node: &StaticNode,
        row: &ExternalParamCollection,
        inherited_ns: Option<&str>,
    ) -> Result<()> {
        let Some(values) = resolve_static(node, row)? else {
            return Ok(());
        };
        let namespace = node.namespace.as_deref().or(inherited_ns);
        for value in &values {
            self.emit(node, namespace, value)?;
        }
        if let Some(export) = &node.export {
            self.export(export, values);
        }
        Ok(())
    }

    fn emit(&mut self, node: &StaticNode, namespace: Option<&str>, value: &ParamValue) -> Result<()> {
        match (node.kind, value) {
            (OutputKind::Attribute, ParamValue::Null) => Ok(()),
            (OutputKind::Attribute, other) => {
                let text = attribute_text(other);
                let text = escape_if(self.escape, &text);
                self.out.attribute(&node.name, &text)
            }
            (OutputKind::Element, ParamValue::Null) => {
                self.out
                    .value_element(&node.name, namespace, None, &node.data_type)
            }
            (OutputKind::Element, ParamValue::Array(items)) => items
                .iter()
                .try_for_each(|item| self.emit(node, namespace, item)),
            (OutputKind::Element, other) => {
                let text = other.display();
                let text = escape_if(self.escape, &text);
                self.out
                    .value_element(&node.name, namespace, Some(text.as_ref()), &node.data_type)
            }
        }
    }

    /// Scalar exports keep the last value; array exports accumulate.
    fn export(&mut self, export: &Export, values: Vec<ParamValue>) {
        let exports = &mut self.ctx.exports;
        match export.cardinality {
            Cardinality::Scalar => {
                if let Some(last) = values.into_iter().last() {
                    exports.insert(export.name.clone(), last);
                }
            }
            Cardinality::Array => {
                let mut items = match exports.remove(&export.name) {
                    Some(ParamValue::Array(items)) => items,
                    Some(ParamValue::Null) | None => Vec::new(),
                    Some(other) => vec![other],
                };
                for value in values {
                    match value {
                        ParamValue::Array(inner) => items.extend(inner),
                        other => items.push(other),
                    }
                }
                exports.insert(export.name.clone(), ParamValue::Array(items));
            }
        }
    }
}

fn escape_if(enabled: bool, text: &str) -> std::borrow::Cow<'_, str> {
    if enabled {
        escape_non_printable(text)
    } else {
        std::borrow::Cow::Borrowed(text)
    }
}

fn attribute_text(value: &ParamValue) -> String {
    match value {
        ParamValue::Array(items) => items
            .iter()
            .map(ParamValue::display)
            .collect::<Vec<_>>()
            .join(","),
        other => other.display(),
    }
}

/// The values a static node writes, or `None` when an optional node has
/// nothing to write.
fn resolve_static(node: &StaticNode, row: &ExternalParamCollection) -> Result<Option<Vec<ParamValue>>> {
    let resolved = match &node.array_name {
        Some(array) => {
            let origin = node
                .source
                .lookup()
                .map_or(ParamOrigin::Column, |(origin, _)| origin);
            row.resolve(origin, array).map(|p| match &p.value {
                ParamValue::Array(items) => items.clone(),
                other => vec![other.clone()],
            })
        }
        None => source_value(&node.source, row).map(|value| vec![value]),
    };

    let resolved = match resolved {
        Some(values) if !node.struct_indices.is_empty() => values
            .iter()
            .map(|value| {
                value
                    .as_struct()
                    .and_then(|s| s.walk(&node.struct_indices))
                    .cloned()
            })
            .collect::<Option<Vec<_>>>(),
        other => other,
    };

    match resolved {
        Some(values) => Ok(Some(values)),
        None if node.is_optional() => Ok(None),
        None => Err(DataServiceError::Output(format!(
            "no value for output '{}' from {:?}",
            node.name, node.source
        ))),
    }
}

fn source_value(source: &ValueSource, row: &ExternalParamCollection) -> Option<ParamValue> {
    match source {
        ValueSource::Constant(text) => Some(ParamValue::scalar(text.clone())),
        ValueSource::Reference(template) => fill_reference(template, row).map(ParamValue::Scalar),
        column_or_param => {
            let (origin, name) = column_or_param.lookup()?;
            row.resolve(origin, name).map(|p| p.value.clone())
        }
    }
}

/// Substitute `{name}` with the named column (or parameter). An unbalanced
/// brace is literal text; an unknown name yields `None`.
fn fill_reference(template: &str, row: &ExternalParamCollection) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        out.push_str(&rest[..open]);
        let found = row.resolve(ParamOrigin::Column, after[..close].trim())?;
        out.push_str(&found.value.display());
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Some(out)
}

/// The row sink handed to adapters for queries that have a result section.
pub(crate) struct RowProjector<'a> {
    engine: &'a Engine,
    ctx: &'a mut RequestContext,
    out: &'a mut dyn OutputSink,
    query: &'a QueryDefinition,
    section: &'a ResultSection,
    params: &'a ParamMap,
    depth: usize,
    case_sensitive: bool,
    row: ExternalParamCollection,
    rows: usize,
}

impl<'a> RowProjector<'a> {
    pub(crate) fn new(
        engine: &'a Engine,
        ctx: &'a mut RequestContext,
        out: &'a mut dyn OutputSink,
        query: &'a QueryDefinition,
        section: &'a ResultSection,
        params: &'a ParamMap,
        depth: usize,
    ) -> Self {
        Self {
            engine,
            ctx,
            out,
            query,
            section,
            params,
            depth,
            case_sensitive: false,
            row: fresh_row(params, false),
            rows: 0,
        }
    }

    pub(crate) fn case_sensitive(mut self, case_sensitive: bool) -> Self {
        self.case_sensitive = case_sensitive;
        self.row = fresh_row(self.params, case_sensitive);
        self
    }

    pub(crate) fn rows(&self) -> usize {
        self.rows
    }
}

/// A row's value space starts with the invocation's own parameters.
fn fresh_row(params: &ParamMap, case_sensitive: bool) -> ExternalParamCollection {
    let mut row = ExternalParamCollection::new(case_sensitive);
    for (name, value) in params.iter() {
        row.add(ParamOrigin::QueryParam, name, value.clone());
    }
    row
}

#[async_trait]
impl<'a> RowSink for RowProjector<'a> {
    fn add_value(&mut self, name: &str, value: ParamValue) {
        self.row.add(ParamOrigin::Column, name, value);
    }

    async fn end_row(&mut self) -> Result<()> {
        let row = std::mem::replace(&mut self.row, fresh_row(self.params, self.case_sensitive));
        let mut projector = Projector {
            engine: self.engine,
            ctx: &mut *self.ctx,
            out: &mut *self.out,
            query_id: &self.query.id,
            depth: self.depth,
            escape: self.section.escape_non_printable,
        };
        projector
            .project_group(&self.section.row, &row, self.section.namespace.as_deref())
            .await?;
        self.rows += 1;
        Ok(())
    }
}
