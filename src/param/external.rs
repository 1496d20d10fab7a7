use serde::Deserialize;
use std::collections::HashMap;

use super::value::ParamValue;

/// Where a projection-side value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParamOrigin {
    Column,
    QueryParam,
}

impl ParamOrigin {
    pub fn opposite(self) -> Self {
        match self {
            ParamOrigin::Column => ParamOrigin::QueryParam,
            ParamOrigin::QueryParam => ParamOrigin::Column,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExternalParam {
    pub name: String,
    pub origin: ParamOrigin,
    pub value: ParamValue,
}

/// Values visible to the projection of one result row: the row's columns
/// plus the invocation's own parameters.
#[derive(Debug, Clone, Default)]
pub struct ExternalParamCollection {
    case_sensitive: bool,
    params: HashMap<(ParamOrigin, String), ExternalParam>,
}

impl ExternalParamCollection {
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            case_sensitive,
            params: HashMap::new(),
        }
    }

    fn key(&self, name: &str) -> String {
        if self.case_sensitive {
            name.to_string()
        } else {
            super::fold_name(name)
        }
    }

    pub fn add(&mut self, origin: ParamOrigin, name: impl Into<String>, value: ParamValue) {
        let name = name.into();
        let key = (origin, self.key(&name));
        self.params.insert(
            key,
            ExternalParam {
                name,
                origin,
                value,
            },
        );
    }

    /// Exact lookup by origin and name.
    pub fn get(&self, origin: ParamOrigin, name: &str) -> Option<&ExternalParam> {
        self.params.get(&(origin, self.key(name)))
    }

    /// Lookup by origin, falling back to the opposite origin so that a column
    /// and a query parameter sharing a name still resolve.
    pub fn resolve(&self, origin: ParamOrigin, name: &str) -> Option<&ExternalParam> {
        self.get(origin, name)
            .or_else(|| self.get(origin.opposite(), name))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExternalParam> {
        self.params.values()
    }

    /// A view where every array-valued parameter is replaced by its element
    /// at `index` (null when the array is shorter). Scalars pass through.
    pub fn narrowed_to(&self, index: usize) -> ExternalParamCollection {
        let params = self
            .params
            .iter()
            .map(|(key, param)| {
                let value = match &param.value {
                    ParamValue::Array(items) => items.get(index).cloned().unwrap_or_default(),
                    other => other.clone(),
                };
                (
                    key.clone(),
                    ExternalParam {
                        name: param.name.clone(),
                        origin: param.origin,
                        value,
                    },
                )
            })
            .collect();
        ExternalParamCollection {
            case_sensitive: self.case_sensitive,
            params,
        }
    }
}
