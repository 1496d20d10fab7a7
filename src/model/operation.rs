use super::projection::CallQuery;

/// A named entry point callers invoke. Its call maps request parameters onto
/// the target query; with no with-params the request parameters pass through
/// by name.
#[derive(Debug, Clone)]
pub struct Operation {
    pub name: String,
    pub description: Option<String>,
    pub call: CallQuery,
}

impl Operation {
    pub fn new(name: impl Into<String>, call: CallQuery) -> Self {
        Self {
            name: name.into(),
            description: None,
            call,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn query_id(&self) -> &str {
        &self.call.query_id
    }
}
