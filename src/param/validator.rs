//! Declared parameter validators.
//!
//! Validators run during the pre-execution phase, before the input hook and
//! before the backend sees anything. The first rejection aborts the
//! invocation with a validation error.
use regex::Regex;
use std::fmt;

use super::query_param::QueryParam;
use super::value::ParamValue;

/// A constraint checked against a supplied parameter value.
///
/// Array values are checked element by element; nulls are not checked.
pub trait Validator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Check one scalar value, returning a human-readable rejection.
    fn check(&self, value: &str) -> Result<(), String>;

    fn validate(&self, param: &QueryParam, value: &ParamValue) -> Result<(), String> {
        match value {
            ParamValue::Null | ParamValue::Structured(_) => Ok(()),
            ParamValue::Scalar(s) => self.check(s),
            ParamValue::Array(items) => items
                .iter()
                .try_for_each(|item| self.validate(param, item)),
        }
    }
}

/// Character length bounds.
#[derive(Debug, Clone)]
pub struct LengthValidator {
    pub min: Option<usize>,
    pub max: Option<usize>,
}

impl Validator for LengthValidator {
    fn name(&self) -> &str {
        "length"
    }

    fn check(&self, value: &str) -> Result<(), String> {
        let len = value.chars().count();
        if let Some(min) = self.min {
            if len < min {
                return Err(format!("length {} is less than minimum {}", len, min));
            }
        }
        if let Some(max) = self.max {
            if len > max {
                return Err(format!("length {} exceeds maximum {}", len, max));
            }
        }
        Ok(())
    }
}

/// Integer range bounds; non-integer input is rejected.
#[derive(Debug, Clone)]
pub struct LongRangeValidator {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl Validator for LongRangeValidator {
    fn name(&self) -> &str {
        "long-range"
    }

    fn check(&self, value: &str) -> Result<(), String> {
        let n: i64 = value
            .trim()
            .parse()
            .map_err(|_| format!("'{}' is not an integer", value))?;
        check_range(n, self.min, self.max)
    }
}

#[derive(Debug, Clone)]
pub struct DoubleRangeValidator {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Validator for DoubleRangeValidator {
    fn name(&self) -> &str {
        "double-range"
    }

    fn check(&self, value: &str) -> Result<(), String> {
        let n: f64 = value
            .trim()
            .parse()
            .map_err(|_| format!("'{}' is not a number", value))?;
        check_range(n, self.min, self.max)
    }
}

fn check_range<T: PartialOrd + fmt::Display>(
    n: T,
    min: Option<T>,
    max: Option<T>,
) -> Result<(), String> {
    if let Some(min) = min {
        if n < min {
            return Err(format!("{} is less than minimum {}", n, min));
        }
    }
    if let Some(max) = max {
        if n > max {
            return Err(format!("{} exceeds maximum {}", n, max));
        }
    }
    Ok(())
}

/// Whole-value regular expression match.
#[derive(Debug, Clone)]
pub struct PatternValidator {
    pattern: Regex,
}

impl PatternValidator {
    /// Compile `pattern`, anchoring it so the entire value must match.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!("^(?:{})$", pattern))?;
        Ok(Self { pattern })
    }
}

impl Validator for PatternValidator {
    fn name(&self) -> &str {
        "pattern"
    }

    fn check(&self, value: &str) -> Result<(), String> {
        if self.pattern.is_match(value) {
            Ok(())
        } else {
            Err(format!("'{}' does not match pattern {}", value, self.pattern))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::DataType;

    fn param() -> QueryParam {
        QueryParam::new("p", DataType::String)
    }

    #[test]
    fn test_length_validator() {
        let v = LengthValidator {
            min: Some(2),
            max: Some(4),
        };
        assert!(v.validate(&param(), &"abc".into()).is_ok());
        assert!(v.validate(&param(), &"a".into()).is_err());
        assert!(v.validate(&param(), &"abcde".into()).is_err());
        assert!(v.validate(&param(), &ParamValue::Null).is_ok());
    }

    #[test]
    fn test_range_validators() {
        let v = LongRangeValidator {
            min: Some(1),
            max: Some(10),
        };
        assert!(v.validate(&param(), &"5".into()).is_ok());
        assert!(v.validate(&param(), &"0".into()).is_err());
        assert!(v.validate(&param(), &"ten".into()).is_err());

        let d = DoubleRangeValidator {
            min: None,
            max: Some(1.5),
        };
        assert!(d.validate(&param(), &"1.25".into()).is_ok());
        assert!(d.validate(&param(), &"1.75".into()).is_err());
    }

    #[test]
    fn test_array_checked_per_element() {
        let v = LongRangeValidator {
            min: Some(0),
            max: None,
        };
        assert!(v.validate(&param(), &ParamValue::array(["1", "2"])).is_ok());
        let err = v
            .validate(&param(), &ParamValue::array(["1", "-2"]))
            .unwrap_err();
        assert!(err.contains("-2"));
    }

    #[test]
    fn test_pattern_is_anchored() {
        let v = PatternValidator::new("[a-z]+").unwrap();
        assert!(v.validate(&param(), &"abc".into()).is_ok());
        assert!(v.validate(&param(), &"abc1".into()).is_err());
        assert!(PatternValidator::new("(").is_err());
    }
}
