use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// A parameter or column value as carried through binding and projection.
///
/// Scalars are kept in their backend-native string form; the engine routes
/// them but never parses them.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ParamValue {
    #[default]
    Null,
    Scalar(String),
    Array(Vec<ParamValue>),
    Structured(StructValue),
}

impl ParamValue {
    pub fn scalar(value: impl Into<String>) -> Self {
        ParamValue::Scalar(value.into())
    }

    /// Build an array of scalars.
    pub fn array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ParamValue::Array(items.into_iter().map(|s| ParamValue::Scalar(s.into())).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ParamValue::Array(_))
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            ParamValue::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ParamValue]> {
        match self {
            ParamValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            ParamValue::Structured(s) => Some(s),
            _ => None,
        }
    }

    /// Number of placeholders this value occupies once expanded.
    pub fn width(&self) -> usize {
        match self {
            ParamValue::Array(items) => items.len().max(1),
            _ => 1,
        }
    }

    /// Wrap a non-array value in a single-element array.
    pub fn into_array(self) -> ParamValue {
        match self {
            array @ ParamValue::Array(_) => array,
            other => ParamValue::Array(vec![other]),
        }
    }

    pub fn display(&self) -> String {
        match self {
            ParamValue::Null => "NULL".to_string(),
            ParamValue::Scalar(s) => s.clone(),
            ParamValue::Array(items) => {
                let items: Vec<String> = items.iter().map(|v| v.display()).collect();
                format!("[{}]", items.join(", "))
            }
            ParamValue::Structured(s) => {
                let attrs: Vec<String> = s.attributes.iter().map(|v| v.display()).collect();
                match &s.type_name {
                    Some(name) => format!("{}({})", name, attrs.join(", ")),
                    None => format!("({})", attrs.join(", ")),
                }
            }
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Scalar(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Scalar(value)
    }
}

impl From<Vec<ParamValue>> for ParamValue {
    fn from(items: Vec<ParamValue>) -> Self {
        ParamValue::Array(items)
    }
}

impl From<Option<String>> for ParamValue {
    fn from(value: Option<String>) -> Self {
        value.map(ParamValue::Scalar).unwrap_or(ParamValue::Null)
    }
}

/// A backend record (composite/row type) whose fields are addressed by
/// position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructValue {
    pub type_name: Option<String>,
    pub attributes: Vec<ParamValue>,
}

impl StructValue {
    pub fn new(type_name: Option<String>, attributes: Vec<ParamValue>) -> Self {
        Self {
            type_name,
            attributes,
        }
    }

    pub fn attribute(&self, index: usize) -> Option<&ParamValue> {
        self.attributes.get(index)
    }

    /// Follow a path of attribute indices through nested records.
    pub fn walk(&self, path: &[usize]) -> Option<&ParamValue> {
        let (first, rest) = path.split_first()?;
        let value = self.attribute(*first)?;
        if rest.is_empty() {
            return Some(value);
        }
        value.as_struct()?.walk(rest)
    }
}

/// Logical type catalogue shared by parameters and result columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(from = "String")]
pub enum DataType {
    #[default]
    String,
    Integer,
    Long,
    Double,
    Decimal,
    Boolean,
    Date,
    Time,
    Timestamp,
    /// Binary content carried as base64 text
    Binary,
    Array,
    Struct,
    /// Raw query text spliced into the template rather than bound
    QueryString,
    /// A type name outside the catalogue; only backends that declare support
    /// for it can bind it.
    Other(String),
}

impl DataType {
    pub fn name(&self) -> &str {
        match self {
            DataType::String => "STRING",
            DataType::Integer => "INTEGER",
            DataType::Long => "LONG",
            DataType::Double => "DOUBLE",
            DataType::Decimal => "DECIMAL",
            DataType::Boolean => "BOOLEAN",
            DataType::Date => "DATE",
            DataType::Time => "TIME",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Binary => "BINARY",
            DataType::Array => "ARRAY",
            DataType::Struct => "STRUCT",
            DataType::QueryString => "QUERY_STRING",
            DataType::Other(name) => name,
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, DataType::Other(_))
    }
}

impl FromStr for DataType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s.trim().to_ascii_uppercase().as_str() {
            "STRING" | "VARCHAR" | "NVARCHAR" | "CHAR" | "TEXT" | "CLOB" => DataType::String,
            "INTEGER" | "INT" | "SMALLINT" | "TINYINT" => DataType::Integer,
            "LONG" | "BIGINT" => DataType::Long,
            "DOUBLE" | "FLOAT" | "REAL" => DataType::Double,
            "DECIMAL" | "NUMERIC" => DataType::Decimal,
            "BOOLEAN" | "BOOL" | "BIT" => DataType::Boolean,
            "DATE" => DataType::Date,
            "TIME" => DataType::Time,
            "TIMESTAMP" => DataType::Timestamp,
            "BINARY" | "BLOB" | "BYTEA" => DataType::Binary,
            "ARRAY" => DataType::Array,
            "STRUCT" => DataType::Struct,
            "QUERY_STRING" => DataType::QueryString,
            _ => DataType::Other(s.trim().to_string()),
        };
        Ok(ty)
    }
}

impl From<String> for DataType {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(ty) => ty,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    In,
    Out,
    InOut,
}

impl Direction {
    pub fn is_input(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    #[default]
    Scalar,
    Array,
}
