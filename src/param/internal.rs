use std::collections::BTreeMap;
use std::sync::Arc;

use super::query_param::QueryParam;
use super::value::{DataType, ParamValue};
use super::ParamSnapshot;

/// One declared parameter bound to one value at one placeholder ordinal.
#[derive(Debug, Clone)]
pub struct InternalParam {
    pub def: Arc<QueryParam>,
    pub value: ParamValue,
    pub ordinal: usize,
    /// Position within the source array when an array value was expanded.
    pub element: Option<usize>,
}

impl InternalParam {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn data_type(&self) -> &DataType {
        &self.def.data_type
    }
}

/// Bound parameters keyed by ordinal, iterated in ascending ordinal order.
#[derive(Debug, Clone, Default)]
pub struct InternalParamCollection {
    params: BTreeMap<usize, InternalParam>,
}

impl InternalParamCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a parameter, replacing anything previously bound at its ordinal.
    pub fn insert(&mut self, param: InternalParam) -> Option<InternalParam> {
        self.params.insert(param.ordinal, param)
    }

    pub fn get(&self, ordinal: usize) -> Option<&InternalParam> {
        self.params.get(&ordinal)
    }

    pub fn remove(&mut self, ordinal: usize) -> Option<InternalParam> {
        self.params.remove(&ordinal)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InternalParam> {
        self.params.values()
    }

    pub fn ordinals(&self) -> impl Iterator<Item = usize> + '_ {
        self.params.keys().copied()
    }

    /// All bound entries of one declared parameter.
    pub fn by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a InternalParam> {
        self.params.values().filter(move |p| p.def.matches_name(name))
    }

    /// True when ordinals run 1..=len without gaps.
    pub fn is_dense(&self) -> bool {
        self.params.keys().copied().eq(1..=self.params.len())
    }

    /// Ordinal-to-value view, mainly for diagnostics and tests.
    pub fn values_by_ordinal(&self) -> Vec<(usize, &str, &ParamValue)> {
        self.params
            .values()
            .map(|p| (p.ordinal, p.name(), &p.value))
            .collect()
    }

    pub fn snapshot(&self) -> ParamSnapshot {
        let mut snapshot = ParamSnapshot::default();
        for p in self.params.values() {
            snapshot.push(format!("{}#{}", p.name(), p.ordinal), p.value.clone());
        }
        snapshot
    }
}

impl IntoIterator for InternalParamCollection {
    type Item = InternalParam;
    type IntoIter = std::collections::btree_map::IntoValues<usize, InternalParam>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(def: &Arc<QueryParam>, ordinal: usize, value: &str) -> InternalParam {
        InternalParam {
            def: Arc::clone(def),
            value: ParamValue::scalar(value),
            ordinal,
            element: None,
        }
    }

    #[test]
    fn test_iteration_is_ordinal_ordered() {
        let x = Arc::new(QueryParam::new("x", DataType::Integer));
        let mut params = InternalParamCollection::new();
        params.insert(bound(&x, 3, "c"));
        params.insert(bound(&x, 1, "a"));
        params.insert(bound(&x, 2, "b"));

        let order: Vec<usize> = params.ordinals().collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(params.is_dense());
        assert_eq!(params.get(2).unwrap().value, ParamValue::scalar("b"));
    }

    #[test]
    fn test_dense_detection() {
        let x = Arc::new(QueryParam::new("x", DataType::String));
        let mut params = InternalParamCollection::new();
        params.insert(bound(&x, 1, "a"));
        params.insert(bound(&x, 3, "c"));
        assert!(!params.is_dense());
        params.remove(3);
        assert!(params.is_dense());
    }

    #[test]
    fn test_by_name_is_case_insensitive() {
        let x = Arc::new(QueryParam::new("Name", DataType::String));
        let y = Arc::new(QueryParam::new("other", DataType::String));
        let mut params = InternalParamCollection::new();
        params.insert(bound(&x, 1, "a"));
        params.insert(bound(&y, 2, "b"));
        params.insert(bound(&x, 3, "c"));
        assert_eq!(params.by_name("name").count(), 2);
        assert_eq!(params.snapshot().to_string(), "{Name#1=a, other#2=b, Name#3=c}");
    }
}
