use std::sync::Arc;

use super::validator::Validator;
use super::value::{Cardinality, DataType, Direction};

/// A declared query parameter. Immutable once the owning query is loaded.
#[derive(Debug, Clone)]
pub struct QueryParam {
    pub name: String,
    pub data_type: DataType,
    pub direction: Direction,
    pub cardinality: Cardinality,
    /// Explicit 1-based ordinals. Empty means the declaration position.
    pub ordinals: Vec<usize>,
    /// Raw default expression: a literal or a `#{VARIABLE}` reference.
    pub default_value: Option<String>,
    pub optional: bool,
    /// Use the default even when a value was supplied.
    pub force_default: bool,
    pub struct_type: Option<String>,
    pub validators: Vec<Arc<dyn Validator>>,
}

impl QueryParam {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            direction: Direction::In,
            cardinality: Cardinality::Scalar,
            ordinals: Vec::new(),
            default_value: None,
            optional: false,
            force_default: false,
            struct_type: None,
            validators: Vec::new(),
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn array(mut self) -> Self {
        self.cardinality = Cardinality::Array;
        self
    }

    pub fn with_ordinals(mut self, ordinals: Vec<usize>) -> Self {
        self.ordinals = ordinals;
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default_value = Some(default.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn force_default(mut self) -> Self {
        self.force_default = true;
        self
    }

    pub fn with_struct_type(mut self, type_name: impl Into<String>) -> Self {
        self.struct_type = Some(type_name.into());
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn is_array(&self) -> bool {
        self.cardinality == Cardinality::Array
    }

    /// OUT parameters are never supplied by the caller.
    pub fn is_out_only(&self) -> bool {
        self.direction == Direction::Out
    }

    /// Raw-text parameters are spliced into the template, not bound.
    pub fn is_dynamic(&self) -> bool {
        self.data_type == DataType::QueryString
    }

    pub fn matches_name(&self, name: &str) -> bool {
        super::same_name(&self.name, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let p = QueryParam::new("id", DataType::Integer);
        assert_eq!(p.direction, Direction::In);
        assert!(!p.is_array());
        assert!(!p.optional);
        assert!(p.ordinals.is_empty());
    }

    #[test]
    fn test_builder_flags() {
        let p = QueryParam::new("ids", DataType::Integer)
            .array()
            .optional()
            .with_default("1,2")
            .with_ordinals(vec![2, 4]);
        assert!(p.is_array());
        assert!(p.optional);
        assert_eq!(p.default_value.as_deref(), Some("1,2"));
        assert_eq!(p.ordinals, vec![2, 4]);
        assert!(p.matches_name("IDS"));
    }

    #[test]
    fn test_direction_helpers() {
        let out = QueryParam::new("total", DataType::Long).with_direction(Direction::Out);
        assert!(out.is_out_only());
        assert!(!Direction::Out.is_input());
        assert!(Direction::InOut.is_input());
        assert!(QueryParam::new("q", DataType::QueryString).is_dynamic());
    }
}
