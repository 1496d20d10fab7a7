mod external;
mod internal;
mod query_param;
mod validator;
mod value;

pub use external::*;
pub use internal::*;
pub use query_param::*;
pub use validator::*;
pub use value::*;

use std::collections::BTreeMap;
use std::fmt;

/// Parameter names compare by their lowercase form everywhere: templates,
/// supplied values, snapshots and exported names.
pub(crate) fn fold_name(name: &str) -> String {
    name.to_lowercase()
}

pub(crate) fn same_name(a: &str, b: &str) -> bool {
    a == b || fold_name(a) == fold_name(b)
}

/// Caller-supplied parameter values, looked up case-insensitively while
/// keeping the caller's spelling for diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamMap {
    entries: BTreeMap<String, (String, ParamValue)>,
}

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        let name = name.into();
        self.entries.insert(fold_name(&name), (name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.get(&fold_name(name)).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&fold_name(name))
    }

    pub fn remove(&mut self, name: &str) -> Option<ParamValue> {
        self.entries.remove(&fold_name(name)).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.values().map(|(k, v)| (k.as_str(), v))
    }

    pub fn snapshot(&self) -> ParamSnapshot {
        ParamSnapshot(
            self.iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }
}

impl<K, V> FromIterator<(K, V)> for ParamMap
where
    K: Into<String>,
    V: Into<ParamValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = ParamMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// Read-only copy of parameters handed to hooks and attached to errors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSnapshot(pub Vec<(String, ParamValue)>);

impl ParamSnapshot {
    pub fn push(&mut self, name: impl Into<String>, value: ParamValue) {
        self.0.push((name.into(), value));
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.0
            .iter()
            .find(|(k, _)| same_name(k, name))
            .map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ParamSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{{{}}}", items.join(", "))
    }
}
