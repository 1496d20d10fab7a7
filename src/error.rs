use std::fmt;
use thiserror::Error;

use crate::param::ParamSnapshot;

pub type Result<T> = std::result::Result<T, DataServiceError>;

/// Coarse classification of a [`DataServiceError`], stable across wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    IncompatibleParameters,
    Validation,
    UnsupportedType,
    Database,
    IllegalArgument,
    Output,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::IncompatibleParameters => write!(f, "Incompatible Parameters"),
            ErrorKind::Validation => write!(f, "Validation Error"),
            ErrorKind::UnsupportedType => write!(f, "Unsupported Type"),
            ErrorKind::Database => write!(f, "Database Error"),
            ErrorKind::IllegalArgument => write!(f, "Illegal Argument"),
            ErrorKind::Output => write!(f, "Output Error"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DataServiceError {
    #[error("incompatible parameters: {0}")]
    IncompatibleParameters(String),
    #[error("validation failed for parameter '{param}': {message}")]
    Validation { param: String, message: String },
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    #[error(transparent)]
    Database(#[from] BackendError),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("output error: {0}")]
    Output(String),
    /// An error annotated with the request that raised it and the parameters
    /// the request was called with.
    #[error("request '{request}' failed (params: {params}): {source}")]
    Request {
        request: String,
        params: ParamSnapshot,
        #[source]
        source: Box<DataServiceError>,
    },
}

impl DataServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DataServiceError::IncompatibleParameters(_) => ErrorKind::IncompatibleParameters,
            DataServiceError::Validation { .. } => ErrorKind::Validation,
            DataServiceError::UnsupportedType(_) => ErrorKind::UnsupportedType,
            DataServiceError::Database(_) => ErrorKind::Database,
            DataServiceError::IllegalArgument(_) => ErrorKind::IllegalArgument,
            DataServiceError::Output(_) => ErrorKind::Output,
            DataServiceError::Request { source, .. } => source.kind(),
        }
    }

    /// Attach request diagnostics. Already-annotated errors keep the
    /// innermost request, which is the one that actually failed.
    pub fn with_request(self, request: &str, params: ParamSnapshot) -> Self {
        match self {
            err @ DataServiceError::Request { .. } => err,
            other => DataServiceError::Request {
                request: request.to_string(),
                params,
                source: Box::new(other),
            },
        }
    }

    pub fn request_name(&self) -> Option<&str> {
        match self {
            DataServiceError::Request { request, .. } => Some(request),
            _ => None,
        }
    }

    pub fn request_params(&self) -> Option<&ParamSnapshot> {
        match self {
            DataServiceError::Request { params, .. } => Some(params),
            _ => None,
        }
    }

    /// The backend error at the root of this error, if any.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            DataServiceError::Database(err) => Some(err),
            DataServiceError::Request { source, .. } => source.backend_error(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DataServiceError {
    fn from(err: std::io::Error) -> Self {
        DataServiceError::Output(err.to_string())
    }
}

/// What went wrong in a backend, as far as the caller can act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The statement text, or an object it names, is wrong.
    Statement,
    /// A value could not be converted on its way to or from the backend.
    Data,
    Constraint,
    /// Serialization failure, deadlock or an already aborted transaction.
    Transaction,
    /// The statement was cancelled, usually by its timeout.
    Cancelled,
    Connection,
    Execution,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Statement => "Invalid Statement",
            ErrorCategory::Data => "Data Error",
            ErrorCategory::Constraint => "Constraint Violation",
            ErrorCategory::Transaction => "Transaction Error",
            ErrorCategory::Cancelled => "Statement Cancelled",
            ErrorCategory::Connection => "Connection Error",
            ErrorCategory::Execution => "Execution Error",
        };
        f.write_str(label)
    }
}

/// Structured failure reported by a backend adapter.
#[derive(Debug, Clone, Error)]
#[error("{category}: {message}")]
pub struct BackendError {
    pub category: ErrorCategory,
    /// SQLSTATE or backend-specific error code, empty when unknown
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl BackendError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            code: String::new(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    /// Build an error from a SQLSTATE code, deriving its category.
    pub fn from_sqlstate(code: &str, message: impl Into<String>) -> Self {
        Self {
            category: categorize_sqlstate(code),
            code: code.to_string(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connection, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Execution, message)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Format as a rich multi-line string for diagnostics output.
    pub fn display_full(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.category, self.message)];

        if !self.code.is_empty() {
            lines.push(format!("  SQLSTATE: {}", self.code));
        }
        if let Some(detail) = &self.detail {
            lines.push(format!("  Detail: {}", detail));
        }
        if let Some(hint) = &self.hint {
            lines.push(format!("  Hint: {}", hint));
        }

        lines.join("\n")
    }
}

/// Map a SQLSTATE to its category by class. `57014` (query_canceled) is
/// the one code singled out, since statement timeouts report it.
pub fn categorize_sqlstate(code: &str) -> ErrorCategory {
    match code.get(..2) {
        Some("08") => ErrorCategory::Connection,
        Some("22") => ErrorCategory::Data,
        Some("23") => ErrorCategory::Constraint,
        Some("25" | "40") => ErrorCategory::Transaction,
        Some("0A" | "26" | "34" | "3F" | "42") => ErrorCategory::Statement,
        Some("57") if code == "57014" => ErrorCategory::Cancelled,
        Some("57") => ErrorCategory::Connection,
        _ => ErrorCategory::Execution,
    }
}
