use serde::Deserialize;
use std::collections::BTreeSet;

use crate::param::{Cardinality, DataType, ParamOrigin};

/// How a query's rows are shaped into output.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResultSection {
    /// Wrapper element written once around all rows.
    #[serde(default)]
    pub element: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    /// Tree written once per row. Its name is the row element.
    pub row: GroupNode,
    /// Rewrite non-printable characters in scalar text as `\uXXXX`.
    #[serde(default)]
    pub escape_non_printable: bool,
}

impl ResultSection {
    pub fn new(element: Option<&str>, row: GroupNode) -> Self {
        let mut section = Self {
            element: element.map(str::to_string),
            namespace: None,
            row,
            escape_non_printable: false,
        };
        section.assign_group_ids();
        section
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn escaping_non_printable(mut self) -> Self {
        self.escape_non_printable = true;
        self
    }

    /// Number every group depth first so per-request caches can key on it.
    pub fn assign_group_ids(&mut self) {
        fn walk(group: &mut GroupNode, next: &mut usize) {
            group.id = *next;
            *next += 1;
            for child in &mut group.children {
                if let ProjectionNode::Group(inner) = child {
                    walk(inner, next);
                }
            }
        }
        let mut next = 0;
        walk(&mut self.row, &mut next);
    }

    /// Every nested call reachable from this section, hidden or not.
    pub fn nested_calls(&self) -> Vec<&CallQuery> {
        fn walk<'a>(group: &'a GroupNode, out: &mut Vec<&'a CallQuery>) {
            for child in &group.children {
                match child {
                    ProjectionNode::Group(inner) => walk(inner, out),
                    ProjectionNode::Nested(call) => out.push(call),
                    ProjectionNode::Static(_) => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.row, &mut out);
        out
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProjectionNode {
    Group(GroupNode),
    Static(StaticNode),
    Nested(CallQuery),
}

impl ProjectionNode {
    pub fn required_roles(&self) -> &BTreeSet<String> {
        match self {
            ProjectionNode::Group(g) => &g.required_roles,
            ProjectionNode::Static(s) => &s.required_roles,
            ProjectionNode::Nested(c) => &c.required_roles,
        }
    }

    pub fn is_attribute(&self) -> bool {
        matches!(self, ProjectionNode::Static(s) if s.kind == OutputKind::Attribute)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GroupNode {
    #[serde(skip)]
    pub id: usize,
    /// Wrapper element; `None` writes the children inline.
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub required_roles: BTreeSet<String>,
    /// Repeat the group once per element of this array parameter.
    pub array_name: Option<String>,
    pub children: Vec<ProjectionNode>,
}

impl GroupNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn requiring<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn repeated_over(mut self, array_name: impl Into<String>) -> Self {
        self.array_name = Some(array_name.into());
        self
    }

    pub fn child(mut self, node: impl Into<ProjectionNode>) -> Self {
        self.children.push(node.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    #[default]
    Element,
    Attribute,
}

/// Where a static node takes its value from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueSource {
    Column(String),
    QueryParam(String),
    /// Literal text
    Constant(String),
    /// Text with `{name}` placeholders filled from columns and parameters
    Reference(String),
}

impl ValueSource {
    /// The origin and name looked up for column and parameter sources.
    pub fn lookup(&self) -> Option<(ParamOrigin, &str)> {
        match self {
            ValueSource::Column(name) => Some((ParamOrigin::Column, name)),
            ValueSource::QueryParam(name) => Some((ParamOrigin::QueryParam, name)),
            ValueSource::Constant(_) | ValueSource::Reference(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Export {
    pub name: String,
    #[serde(default)]
    pub cardinality: Cardinality,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StaticNode {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub kind: OutputKind,
    pub source: ValueSource,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub required_roles: BTreeSet<String>,
    #[serde(default)]
    pub optional: bool,
    /// Emit the element once per entry of this array value.
    #[serde(default)]
    pub array_name: Option<String>,
    /// Attribute path into a structured value, outermost first.
    #[serde(default)]
    pub struct_indices: Vec<usize>,
    #[serde(default)]
    pub export: Option<Export>,
}

impl StaticNode {
    pub fn element(name: impl Into<String>, source: ValueSource) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            kind: OutputKind::Element,
            source,
            data_type: DataType::String,
            required_roles: BTreeSet::new(),
            optional: false,
            array_name: None,
            struct_indices: Vec::new(),
            export: None,
        }
    }

    pub fn column(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::element(name, ValueSource::Column(column.into()))
    }

    pub fn attribute(name: impl Into<String>, source: ValueSource) -> Self {
        Self {
            kind: OutputKind::Attribute,
            ..Self::element(name, source)
        }
    }

    pub fn requiring<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn per_entry_of(mut self, array_name: impl Into<String>) -> Self {
        self.array_name = Some(array_name.into());
        self
    }

    pub fn walking(mut self, indices: Vec<usize>) -> Self {
        self.struct_indices = indices;
        self
    }

    pub fn exported_as(mut self, name: impl Into<String>, cardinality: Cardinality) -> Self {
        self.export = Some(Export {
            name: name.into(),
            cardinality,
        });
        self
    }

    /// Missing values are skipped rather than reported.
    pub fn is_optional(&self) -> bool {
        self.optional || !self.required_roles.is_empty()
    }
}

/// Supplies one parameter of a called query.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WithParam {
    /// Parameter name on the called query
    pub name: String,
    #[serde(default = "default_origin")]
    pub origin: ParamOrigin,
    /// Column or parameter name on the calling side
    pub source: String,
}

fn default_origin() -> ParamOrigin {
    ParamOrigin::Column
}

impl WithParam {
    pub fn column(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: ParamOrigin::Column,
            source: column.into(),
        }
    }

    pub fn param(name: impl Into<String>, param: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: ParamOrigin::QueryParam,
            source: param.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CallQuery {
    #[serde(rename = "query")]
    pub query_id: String,
    #[serde(default)]
    pub with_params: Vec<WithParam>,
    #[serde(default)]
    pub required_roles: BTreeSet<String>,
}

impl CallQuery {
    pub fn new(query_id: impl Into<String>) -> Self {
        Self {
            query_id: query_id.into(),
            with_params: Vec::new(),
            required_roles: BTreeSet::new(),
        }
    }

    pub fn with(mut self, param: WithParam) -> Self {
        self.with_params.push(param);
        self
    }

    pub fn requiring<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

impl From<GroupNode> for ProjectionNode {
    fn from(node: GroupNode) -> Self {
        ProjectionNode::Group(node)
    }
}

impl From<StaticNode> for ProjectionNode {
    fn from(node: StaticNode) -> Self {
        ProjectionNode::Static(node)
    }
}

impl From<CallQuery> for ProjectionNode {
    fn from(node: CallQuery) -> Self {
        ProjectionNode::Nested(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_ids_depth_first() {
        let row = GroupNode::new("order")
            .child(GroupNode::new("customer").child(GroupNode::new("address")))
            .child(StaticNode::column("id", "id"))
            .child(GroupNode::new("lines"));
        let section = ResultSection::new(Some("orders"), row);
        assert_eq!(section.row.id, 0);
        let ids: Vec<usize> = section
            .row
            .children
            .iter()
            .filter_map(|c| match c {
                ProjectionNode::Group(g) => Some(g.id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_role_gated_static_is_optional() {
        assert!(!StaticNode::column("a", "a").is_optional());
        assert!(StaticNode::column("a", "a").optional().is_optional());
        assert!(StaticNode::column("a", "a").requiring(["admin"]).is_optional());
    }

    #[test]
    fn test_deserialize_tree() {
        let text = r#"
            element = "customers"
            [row]
            name = "customer"
            [[row.children]]
            type = "static"
            name = "id"
            kind = "attribute"
            source = { column = "customer_id" }
            [[row.children]]
            type = "nested"
            query = "ordersByCustomer"
            required-roles = ["sales"]
            with-params = [{ name = "cid", source = "customer_id" }]
        "#;
        let mut section: ResultSection = toml::from_str(text).unwrap();
        section.assign_group_ids();
        assert_eq!(section.element.as_deref(), Some("customers"));
        assert!(section.row.children[0].is_attribute());
        let calls = section.nested_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].with_params[0], WithParam::column("cid", "customer_id"));
        assert!(calls[0].required_roles.contains("sales"));
    }
}
