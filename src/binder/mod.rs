//! Parameter binding: declared parameters + query template → positional,
//! backend-ready invocation.
//!
//! ```text
//! template with :name / ? markers
//!       ↓  compile (once per query definition)
//! positional template + ordinals per parameter
//!       ↓  bind (once per invocation)
//! promote scalars → splice raw text → expand arrays
//!       ↓
//! BoundQuery { sql, InternalParamCollection }
//! ```
mod scanner;

pub use scanner::{count_placeholders, number_placeholders};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use scanner::{next_placeholder, open_quote, placeholder_offsets, scan_markers, Marker};

use crate::error::{DataServiceError, Result};
use crate::param::{DataType, InternalParam, InternalParamCollection, ParamMap, ParamValue, QueryParam};

/// Ordinals assigned to one declared parameter. Empty when the parameter is
/// not referenced by the template or was invalidated by a collision.
#[derive(Debug, Clone)]
pub struct ParamBinding {
    pub def: Arc<QueryParam>,
    pub ordinals: Vec<usize>,
}

/// The value-independent part of binding, computed once per definition.
#[derive(Debug, Clone)]
pub struct PreparedTemplate {
    sql: String,
    placeholder_count: usize,
    bindings: Vec<ParamBinding>,
}

/// A template ready for the backend together with its bound values.
#[derive(Debug, Clone)]
pub struct BoundQuery {
    pub sql: String,
    pub params: InternalParamCollection,
}

impl BoundQuery {
    pub fn placeholder_count(&self) -> usize {
        count_placeholders(&self.sql)
    }
}

impl PreparedTemplate {
    /// Resolve named markers to positional ones and assign ordinals.
    pub fn compile(template: &str, defs: &[Arc<QueryParam>]) -> Self {
        let markers = scan_markers(template, defs);
        let placeholder_count = markers.len();

        let mut named: Vec<Vec<usize>> = vec![Vec::new(); defs.len()];
        let mut sql = String::with_capacity(template.len());
        let mut cursor = 0;
        for (idx, marker) in markers.iter().enumerate() {
            if let Marker::Named { offset, len, param } = *marker {
                named[param].push(idx + 1);
                // Markers are whole identifier tokens, so `:abc` can never eat
                // into `:abcd`.
                sql.push_str(&template[cursor..offset]);
                sql.push('?');
                cursor = offset + len;
            }
        }
        sql.push_str(&template[cursor..]);

        let named_ordinals: HashSet<usize> = named.iter().flatten().copied().collect();

        let bindings = defs
            .iter()
            .enumerate()
            .map(|(idx, def)| {
                let ordinals = if !named[idx].is_empty() {
                    std::mem::take(&mut named[idx])
                } else {
                    let declared = if def.ordinals.is_empty() {
                        vec![idx + 1]
                    } else {
                        def.ordinals.clone()
                    };
                    if declared.iter().any(|o| named_ordinals.contains(o)) {
                        Vec::new()
                    } else if def.is_dynamic() {
                        // Out of range splice points are reported at bind time.
                        declared
                    } else {
                        declared
                            .into_iter()
                            .filter(|o| *o >= 1 && *o <= placeholder_count)
                            .collect()
                    }
                };
                ParamBinding {
                    def: Arc::clone(def),
                    ordinals,
                }
            })
            .collect();

        Self {
            sql,
            placeholder_count,
            bindings,
        }
    }

    /// The positional template, before splicing and expansion.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn placeholder_count(&self) -> usize {
        self.placeholder_count
    }

    pub fn bindings(&self) -> &[ParamBinding] {
        &self.bindings
    }

    pub fn ordinals_of(&self, name: &str) -> Option<&[usize]> {
        self.bindings
            .iter()
            .find(|b| b.def.matches_name(name))
            .map(|b| b.ordinals.as_slice())
    }

    /// Bind supplied values. Defaults must already be applied to `supplied`.
    pub fn bind(
        &self,
        supplied: &ParamMap,
        supports_type: impl Fn(&DataType) -> bool,
    ) -> Result<BoundQuery> {
        let mut slots: BTreeMap<usize, (Arc<QueryParam>, ParamValue)> = BTreeMap::new();

        for binding in &self.bindings {
            if binding.ordinals.is_empty() {
                continue;
            }
            let def = &binding.def;
            if !supports_type(&def.data_type) {
                return Err(DataServiceError::UnsupportedType(format!(
                    "{} (parameter '{}')",
                    def.data_type, def.name
                )));
            }

            let value = match supplied.get(&def.name) {
                Some(value) => value.clone(),
                None if def.is_out_only() || def.optional => ParamValue::Null,
                None => {
                    return Err(DataServiceError::IncompatibleParameters(format!(
                        "no value supplied for required parameter '{}'",
                        def.name
                    )))
                }
            };

            let value = if def.is_array() && !value.is_null() {
                value.into_array()
            } else if value.is_array() && !def.is_dynamic() {
                return Err(DataServiceError::IncompatibleParameters(format!(
                    "array value supplied for scalar parameter '{}'",
                    def.name
                )));
            } else {
                value
            };

            for ordinal in &binding.ordinals {
                slots.insert(*ordinal, (Arc::clone(def), value.clone()));
            }
        }

        let (sql, slots) = self.splice_dynamic(slots)?;
        expand_placeholders(&sql, slots)
    }

    /// Replace raw-text placeholders with their values and renumber the
    /// remaining ordinals densely from 1.
    fn splice_dynamic(
        &self,
        slots: BTreeMap<usize, (Arc<QueryParam>, ParamValue)>,
    ) -> Result<(String, BTreeMap<usize, (Arc<QueryParam>, ParamValue)>)> {
        if !slots.values().any(|(def, _)| def.is_dynamic()) {
            return Ok((self.sql.clone(), slots));
        }

        let offsets = placeholder_offsets(&self.sql);
        if let Some((ordinal, (def, _))) = slots
            .iter()
            .find(|(ordinal, (def, _))| def.is_dynamic() && **ordinal > offsets.len())
        {
            return Err(DataServiceError::IllegalArgument(format!(
                "parameter '{}' has no splice point at ordinal {}",
                def.name, ordinal
            )));
        }

        let mut slots = slots;
        let mut renumbered = BTreeMap::new();
        let mut sql = String::with_capacity(self.sql.len());
        let mut cursor = 0;
        let mut next_ordinal = 1;

        for (idx, pos) in offsets.into_iter().enumerate() {
            let ordinal = idx + 1;
            sql.push_str(&self.sql[cursor..pos]);
            cursor = pos + 1;
            match slots.remove(&ordinal) {
                Some((def, value)) if def.is_dynamic() => {
                    let text = match &value {
                        ParamValue::Null => "",
                        ParamValue::Scalar(text) => text.as_str(),
                        _ => {
                            return Err(DataServiceError::IllegalArgument(format!(
                                "raw query text for '{}' must be a scalar",
                                def.name
                            )))
                        }
                    };
                    if count_placeholders(text) > 0 {
                        return Err(DataServiceError::IllegalArgument(format!(
                            "raw query text for '{}' contains a placeholder",
                            def.name
                        )));
                    }
                    if let Some(quote) = open_quote(text) {
                        return Err(DataServiceError::IllegalArgument(format!(
                            "raw query text for '{}' leaves a {} quote open",
                            def.name, quote
                        )));
                    }
                    sql.push_str(text);
                }
                Some(slot) => {
                    sql.push('?');
                    renumbered.insert(next_ordinal, slot);
                    next_ordinal += 1;
                }
                None => {
                    sql.push('?');
                    next_ordinal += 1;
                }
            }
        }
        sql.push_str(&self.sql[cursor..]);

        Ok((sql, renumbered))
    }
}

/// Widen each array-bound `?` to one `?` per element and produce the final
/// ordinal → value collection.
fn expand_placeholders(
    sql: &str,
    slots: BTreeMap<usize, (Arc<QueryParam>, ParamValue)>,
) -> Result<BoundQuery> {
    let mut out = String::with_capacity(sql.len() + slots.len() * 2);
    let mut params = InternalParamCollection::new();
    let mut cursor = 0;
    let mut ordinal = 0;
    let mut final_ordinal = 1;

    while let Some(pos) = next_placeholder(sql, cursor) {
        ordinal += 1;
        out.push_str(&sql[cursor..pos]);
        cursor = pos + 1;

        let Some((def, value)) = slots.get(&ordinal) else {
            return Err(DataServiceError::IncompatibleParameters(format!(
                "no parameter bound at ordinal {}",
                ordinal
            )));
        };

        let elements: Vec<(Option<usize>, ParamValue)> = match value {
            ParamValue::Array(items) if items.is_empty() => vec![(Some(0), ParamValue::Null)],
            ParamValue::Array(items) => items
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, v)| (Some(i), v))
                .collect(),
            other => vec![(None, other.clone())],
        };

        let marks = vec!["?"; elements.len()];
        out.push_str(&marks.join(","));

        for (element, value) in elements {
            params.insert(InternalParam {
                def: Arc::clone(def),
                value,
                ordinal: final_ordinal,
                element,
            });
            final_ordinal += 1;
        }
    }
    out.push_str(&sql[cursor..]);

    if let Some((unused, (def, _))) = slots.range(ordinal + 1..).next() {
        return Err(DataServiceError::IncompatibleParameters(format!(
            "parameter '{}' bound at ordinal {} but the query has {} placeholders",
            def.name, unused, ordinal
        )));
    }

    Ok(BoundQuery { sql: out, params })
}

/// One-shot binding of a template against built-in types only.
pub fn bind(template: &str, defs: &[Arc<QueryParam>], supplied: &ParamMap) -> Result<BoundQuery> {
    PreparedTemplate::compile(template, defs).bind(supplied, DataType::is_builtin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::param::Direction;
    use proptest::prelude::*;

    fn arc(p: QueryParam) -> Arc<QueryParam> {
        Arc::new(p)
    }

    #[test]
    fn test_scalar_and_array_scenario() {
        let defs = vec![
            arc(QueryParam::new("x", DataType::Integer)),
            arc(QueryParam::new("y", DataType::String).array()),
        ];
        let supplied: ParamMap = [("x", ParamValue::scalar("1")), ("y", ParamValue::array(["a", "b"]))]
            .into_iter()
            .collect();

        let bound = bind("SELECT * FROM t WHERE a = :x AND b = :y", &defs, &supplied).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM t WHERE a = ? AND b = ?,?");

        let mapping: Vec<(usize, &str, &ParamValue)> = bound.params.values_by_ordinal();
        assert_eq!(
            mapping,
            vec![
                (1, "x", &ParamValue::scalar("1")),
                (2, "y", &ParamValue::scalar("a")),
                (3, "y", &ParamValue::scalar("b")),
            ]
        );
        assert_eq!(bound.params.get(3).unwrap().element, Some(1));
    }

    #[test]
    fn test_repeated_name_gets_one_ordinal_per_occurrence() {
        let defs = vec![arc(QueryParam::new("id", DataType::Integer))];
        let prepared = PreparedTemplate::compile("SELECT :id, :ID", &defs);
        assert_eq!(prepared.sql(), "SELECT ?, ?");
        assert_eq!(prepared.ordinals_of("id"), Some(&[1, 2][..]));
    }

    #[test]
    fn test_prefix_names_are_not_corrupted() {
        let defs = vec![
            arc(QueryParam::new("abc", DataType::String)),
            arc(QueryParam::new("abcd", DataType::String)),
        ];
        let supplied: ParamMap = [("abc", "short"), ("abcd", "long")].into_iter().collect();
        let bound = bind("WHERE a = :abcd AND b = :abc", &defs, &supplied).unwrap();
        assert_eq!(bound.sql, "WHERE a = ? AND b = ?");
        assert_eq!(bound.params.get(1).unwrap().name(), "abcd");
        assert_eq!(bound.params.get(2).unwrap().name(), "abc");
    }

    #[test]
    fn test_undeclared_names_left_untouched() {
        let defs = vec![arc(QueryParam::new("abc", DataType::String))];
        let supplied: ParamMap = [("abc", "v")].into_iter().collect();
        let bound = bind("WHERE a = :abcd AND b = :abc AND c = x::text", &defs, &supplied).unwrap();
        assert_eq!(bound.sql, "WHERE a = :abcd AND b = ? AND c = x::text");
    }

    #[test]
    fn test_positional_params_use_declaration_order() {
        let defs = vec![
            arc(QueryParam::new("a", DataType::String)),
            arc(QueryParam::new("b", DataType::String)),
        ];
        let supplied: ParamMap = [("a", "1"), ("b", "2")].into_iter().collect();
        let bound = bind("INSERT INTO t VALUES (?, ?)", &defs, &supplied).unwrap();
        assert_eq!(bound.params.get(1).unwrap().name(), "a");
        assert_eq!(bound.params.get(2).unwrap().name(), "b");
    }

    #[test]
    fn test_mixed_styles_invalidate_colliding_ordinal() {
        // `a` keeps implicit ordinal 1 only if no named occurrence uses it.
        let defs = vec![
            arc(QueryParam::new("a", DataType::String)),
            arc(QueryParam::new("b", DataType::String)),
        ];
        let prepared = PreparedTemplate::compile("SELECT :b, ?", &defs);
        assert_eq!(prepared.ordinals_of("b"), Some(&[1][..]));
        assert_eq!(prepared.ordinals_of("a"), Some(&[][..]));

        let explicit = vec![
            arc(QueryParam::new("a", DataType::String).with_ordinals(vec![2])),
            arc(QueryParam::new("b", DataType::String)),
        ];
        let prepared = PreparedTemplate::compile("SELECT :b, ?", &explicit);
        assert_eq!(prepared.ordinals_of("a"), Some(&[2][..]));

        let supplied: ParamMap = [("a", "pos"), ("b", "named")].into_iter().collect();
        let bound = prepared.bind(&supplied, DataType::is_builtin).unwrap();
        assert_eq!(bound.params.get(1).unwrap().value, "named".into());
        assert_eq!(bound.params.get(2).unwrap().value, "pos".into());
    }

    #[test]
    fn test_scalar_promoted_for_array_param() {
        let defs = vec![arc(QueryParam::new("ids", DataType::Integer).array())];
        let supplied: ParamMap = [("ids", "5")].into_iter().collect();
        let bound = bind("SELECT * FROM t WHERE id IN (:ids)", &defs, &supplied).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM t WHERE id IN (?)");
        assert_eq!(bound.params.get(1).unwrap().element, Some(0));
    }

    #[test]
    fn test_array_for_scalar_param_rejected() {
        let defs = vec![arc(QueryParam::new("id", DataType::Integer))];
        let supplied: ParamMap = [("id", ParamValue::array(["1", "2"]))].into_iter().collect();
        let err = bind("SELECT :id", &defs, &supplied).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleParameters);
    }

    #[test]
    fn test_empty_array_binds_single_null() {
        let defs = vec![arc(QueryParam::new("ids", DataType::Integer).array())];
        let supplied: ParamMap = [("ids", ParamValue::Array(vec![]))].into_iter().collect();
        let bound = bind("id IN (:ids)", &defs, &supplied).unwrap();
        assert_eq!(bound.sql, "id IN (?)");
        assert!(bound.params.get(1).unwrap().value.is_null());
    }

    #[test]
    fn test_missing_required_param() {
        let defs = vec![arc(QueryParam::new("id", DataType::Integer))];
        let err = bind("SELECT :id", &defs, &ParamMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleParameters);
        assert!(err.to_string().contains("'id'"));
    }

    #[test]
    fn test_missing_out_and_optional_bind_null() {
        let defs = vec![
            arc(QueryParam::new("total", DataType::Long).with_direction(Direction::Out)),
            arc(QueryParam::new("note", DataType::String).optional()),
        ];
        let bound = bind("CALL p(:total, :note)", &defs, &ParamMap::new()).unwrap();
        assert_eq!(bound.params.len(), 2);
        assert!(bound.params.iter().all(|p| p.value.is_null()));
    }

    #[test]
    fn test_unsupported_type() {
        let defs = vec![arc(QueryParam::new("g", DataType::Other("GEOMETRY".into())))];
        let supplied: ParamMap = [("g", "POINT(0 0)")].into_iter().collect();
        let err = bind("SELECT :g", &defs, &supplied).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedType);

        let prepared = PreparedTemplate::compile("SELECT :g", &defs);
        assert!(prepared.bind(&supplied, |_| true).is_ok());
    }

    #[test]
    fn test_dynamic_splice_keeps_ordinals_dense() {
        let defs = vec![
            arc(QueryParam::new("a", DataType::Integer)),
            arc(QueryParam::new("order", DataType::QueryString)),
            arc(QueryParam::new("b", DataType::Integer).array()),
        ];
        let supplied: ParamMap = [
            ("a", ParamValue::scalar("1")),
            ("order", ParamValue::scalar("ORDER BY name DESC")),
            ("b", ParamValue::array(["2", "3"])),
        ]
        .into_iter()
        .collect();

        let bound = bind(
            "SELECT * FROM t WHERE a = :a AND b IN (:b) :order",
            &defs,
            &supplied,
        )
        .unwrap();
        assert_eq!(bound.sql, "SELECT * FROM t WHERE a = ? AND b IN (?,?) ORDER BY name DESC");
        assert!(bound.params.is_dense());
        assert_eq!(bound.params.len(), 3);
        assert!(bound.params.iter().all(|p| p.name() != "order"));
    }

    #[test]
    fn test_dynamic_splice_before_other_params() {
        let defs = vec![
            arc(QueryParam::new("cols", DataType::QueryString)),
            arc(QueryParam::new("id", DataType::Integer)),
        ];
        let supplied: ParamMap = [("cols", "id, name"), ("id", "9")].into_iter().collect();
        let bound = bind("SELECT :cols FROM t WHERE id = :id", &defs, &supplied).unwrap();
        assert_eq!(bound.sql, "SELECT id, name FROM t WHERE id = ?");
        assert_eq!(bound.params.get(1).unwrap().name(), "id");
    }

    #[test]
    fn test_dynamic_text_with_placeholder_rejected() {
        let defs = vec![arc(QueryParam::new("w", DataType::QueryString))];
        let supplied: ParamMap = [("w", "WHERE a = ?")].into_iter().collect();
        let err = bind("SELECT * FROM t :w", &defs, &supplied).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    }

    #[test]
    fn test_dynamic_text_with_open_quote_rejected() {
        let defs = vec![
            arc(QueryParam::new("w", DataType::QueryString)),
            arc(QueryParam::new("a", DataType::Integer)),
        ];
        let supplied: ParamMap = [("w", "WHERE name = 'x"), ("a", "1")].into_iter().collect();
        let err = bind("SELECT * FROM t :w AND a = :a", &defs, &supplied).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
        assert!(err.to_string().contains("quote"));

        let supplied: ParamMap = [("w", "WHERE name = 'x'"), ("a", "1")].into_iter().collect();
        let bound = bind("SELECT * FROM t :w AND a = :a", &defs, &supplied).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM t WHERE name = 'x' AND a = ?");
        assert_eq!(bound.params.len(), 1);
    }

    #[test]
    fn test_unconsumed_slot_rejected() {
        let def = arc(QueryParam::new("a", DataType::Integer));
        let slots: BTreeMap<usize, (Arc<QueryParam>, ParamValue)> = [
            (1, (Arc::clone(&def), ParamValue::scalar("1"))),
            (2, (def, ParamValue::scalar("2"))),
        ]
        .into_iter()
        .collect();
        let err = expand_placeholders("SELECT ?", slots).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleParameters);
    }

    #[test]
    fn test_dynamic_without_splice_point_rejected() {
        let defs = vec![arc(QueryParam::new("w", DataType::QueryString).with_ordinals(vec![3]))];
        let supplied: ParamMap = [("w", "x")].into_iter().collect();
        let err = bind("SELECT ?", &defs, &supplied).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    }

    #[test]
    fn test_unbound_positional_rejected() {
        let err = bind("SELECT ?", &[], &ParamMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleParameters);
    }

    #[test]
    fn test_bind_round_trip_fixture() {
        let defs = vec![
            arc(QueryParam::new("dept", DataType::String)),
            arc(QueryParam::new("ids", DataType::Long).array()),
            arc(QueryParam::new("limit", DataType::Integer)),
        ];
        let supplied: ParamMap = [
            ("dept", ParamValue::scalar("eng")),
            ("ids", ParamValue::array(["10", "20", "30"])),
            ("limit", ParamValue::scalar("5")),
        ]
        .into_iter()
        .collect();
        let bound = bind(
            "SELECT * FROM e WHERE dept = :dept AND id IN (:ids) OR dept = :dept LIMIT :limit",
            &defs,
            &supplied,
        )
        .unwrap();

        let expected = vec![
            (1, "dept", ParamValue::scalar("eng")),
            (2, "ids", ParamValue::scalar("10")),
            (3, "ids", ParamValue::scalar("20")),
            (4, "ids", ParamValue::scalar("30")),
            (5, "dept", ParamValue::scalar("eng")),
            (6, "limit", ParamValue::scalar("5")),
        ];
        let actual: Vec<(usize, &str, ParamValue)> = bound
            .params
            .values_by_ordinal()
            .into_iter()
            .map(|(o, n, v)| (o, n, v.clone()))
            .collect();
        assert_eq!(actual, expected);
        assert_eq!(bound.placeholder_count(), bound.params.len());
    }

    fn name_strategy() -> impl Strategy<Value = String> {
        "[a-z]{1,6}".prop_map(|s| s)
    }

    proptest! {
        #[test]
        fn placeholder_count_matches_value_widths(
            widths in proptest::collection::vec(0usize..5, 1..6)
        ) {
            let defs: Vec<Arc<QueryParam>> = widths
                .iter()
                .enumerate()
                .map(|(i, w)| {
                    let p = QueryParam::new(format!("p{}", i), DataType::String);
                    arc(if *w == 0 { p } else { p.array() })
                })
                .collect();
            let template = (0..widths.len())
                .map(|i| format!("c{} IN (:p{})", i, i))
                .collect::<Vec<_>>()
                .join(" AND ");
            let supplied: ParamMap = widths
                .iter()
                .enumerate()
                .map(|(i, w)| {
                    let value = if *w == 0 {
                        ParamValue::scalar("s")
                    } else {
                        ParamValue::array((0..*w).map(|n| n.to_string()))
                    };
                    (format!("p{}", i), value)
                })
                .collect();

            let bound = bind(&template, &defs, &supplied).unwrap();
            let expected: usize = widths.iter().map(|w| (*w).max(1)).sum();
            prop_assert_eq!(bound.placeholder_count(), expected);
            prop_assert_eq!(bound.params.len(), expected);
            prop_assert!(bound.params.is_dense());
        }

        #[test]
        fn longer_names_survive_prefix_rewrite(base in name_strategy(), suffix in name_strategy()) {
            let long = format!("{}{}", base, suffix);
            let defs = vec![
                arc(QueryParam::new(base.clone(), DataType::String)),
                arc(QueryParam::new(long.clone(), DataType::String)),
            ];
            let supplied: ParamMap = [(base.clone(), "short"), (long.clone(), "long")]
                .into_iter()
                .collect();
            let template = format!("a = :{} AND b = :{} AND c = :{}", long, base, long);
            let bound = bind(&template, &defs, &supplied).unwrap();
            prop_assert_eq!(bound.sql.as_str(), "a = ? AND b = ? AND c = ?");
            prop_assert_eq!(bound.params.get(1).unwrap().value.clone(), ParamValue::scalar("long"));
            prop_assert_eq!(bound.params.get(2).unwrap().value.clone(), ParamValue::scalar("short"));
            prop_assert_eq!(bound.params.get(3).unwrap().value.clone(), ParamValue::scalar("long"));
        }

        #[test]
        fn splice_leaves_static_placeholders(k in 0usize..6, at in 0usize..6) {
            let at = at.min(k);
            let mut defs = Vec::new();
            let mut parts = Vec::new();
            let mut supplied = ParamMap::new();
            for i in 0..=k {
                if i == at {
                    defs.push(arc(QueryParam::new("dyn", DataType::QueryString)));
                    parts.push(":dyn".to_string());
                    supplied.insert("dyn", "1 = 1");
                }
                if i < k {
                    defs.push(arc(QueryParam::new(format!("s{}", i), DataType::Integer)));
                    parts.push(format!(":s{}", i));
                    supplied.insert(format!("s{}", i), i.to_string());
                }
            }
            let template = parts.join(" AND ");
            let bound = bind(&template, &defs, &supplied).unwrap();
            prop_assert_eq!(bound.placeholder_count(), k);
            prop_assert_eq!(bound.params.len(), k);
            prop_assert!(bound.params.is_dense());
        }
    }
}
