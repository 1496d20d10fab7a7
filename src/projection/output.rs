//! Output formats. Projection drives an [`OutputSink`] with element events;
//! the sink decides how they look on the wire.
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::io::Write;

use crate::error::{DataServiceError, Result};
use crate::param::DataType;

const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Receives the projected document as a stream of element events.
pub trait OutputSink: Send {
    fn start_element(&mut self, name: &str, namespace: Option<&str>) -> Result<()>;

    /// Only valid directly after `start_element`.
    fn attribute(&mut self, name: &str, value: &str) -> Result<()>;

    /// A leaf element. `None` is an explicit null.
    fn value_element(
        &mut self,
        name: &str,
        namespace: Option<&str>,
        value: Option<&str>,
        data_type: &DataType,
    ) -> Result<()>;

    fn end_element(&mut self) -> Result<()>;

    /// Close anything still open and flush.
    fn finish(&mut self) -> Result<()>;
}

/// Rewrite control characters other than tab, newline and carriage return as
/// `\uXXXX`.
pub fn escape_non_printable(text: &str) -> Cow<'_, str> {
    if !text.chars().any(needs_escape) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        if needs_escape(c) {
            out.push_str(&format!("\\u{:04X}", c as u32));
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

fn needs_escape(c: char) -> bool {
    c.is_control() && !matches!(c, '\t' | '\n' | '\r')
}

fn xml_err(err: impl std::fmt::Display) -> DataServiceError {
    DataServiceError::Output(format!("xml: {}", err))
}

struct OpenElement {
    name: String,
    namespace: Option<String>,
}

/// Streams XML. A default `xmlns` is written whenever an element's namespace
/// differs from its parent's.
pub struct XmlOutput<W: Write> {
    writer: Writer<W>,
    open: Vec<OpenElement>,
    /// Start tag still accepting attributes.
    pending: Option<BytesStart<'static>>,
}

impl<W: Write + Send> XmlOutput<W> {
    pub fn new(inner: W) -> Self {
        Self::with_writer(Writer::new(inner))
    }

    pub fn pretty(inner: W) -> Self {
        Self::with_writer(Writer::new_with_indent(inner, b' ', 2))
    }

    fn with_writer(writer: Writer<W>) -> Self {
        Self {
            writer,
            open: Vec::new(),
            pending: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn current_namespace(&self) -> Option<&str> {
        self.open.last().and_then(|e| e.namespace.as_deref())
    }

    fn open_tag(&self, name: &str, namespace: Option<&str>) -> BytesStart<'static> {
        let mut start = BytesStart::new(name.to_string());
        if namespace.unwrap_or("") != self.current_namespace().unwrap_or("") {
            start.push_attribute(("xmlns", namespace.unwrap_or("")));
        }
        if self.open.is_empty() {
            start.push_attribute(("xmlns:xsi", XSI_NAMESPACE));
        }
        start
    }

    fn flush_pending(&mut self) -> Result<()> {
        if let Some(start) = self.pending.take() {
            self.writer
                .write_event(Event::Start(start))
                .map_err(xml_err)?;
        }
        Ok(())
    }
}

impl<W: Write + Send> OutputSink for XmlOutput<W> {
    fn start_element(&mut self, name: &str, namespace: Option<&str>) -> Result<()> {
        self.flush_pending()?;
        let start = self.open_tag(name, namespace);
        self.pending = Some(start);
        self.open.push(OpenElement {
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
        });
        Ok(())
    }

    fn attribute(&mut self, name: &str, value: &str) -> Result<()> {
        match self.pending.as_mut() {
            Some(start) => {
                start.push_attribute((name, value));
                Ok(())
            }
            None => Err(DataServiceError::Output(format!(
                "attribute '{}' written after element content",
                name
            ))),
        }
    }

    fn value_element(
        &mut self,
        name: &str,
        namespace: Option<&str>,
        value: Option<&str>,
        _data_type: &DataType,
    ) -> Result<()> {
        self.flush_pending()?;
        let mut start = self.open_tag(name, namespace);
        match value {
            Some(text) => {
                self.writer
                    .write_event(Event::Start(start))
                    .map_err(xml_err)?;
                self.writer
                    .write_event(Event::Text(BytesText::new(text)))
                    .map_err(xml_err)?;
                self.writer
                    .write_event(Event::End(BytesEnd::new(name.to_string())))
                    .map_err(xml_err)?;
            }
            None => {
                start.push_attribute(("xsi:nil", "true"));
                self.writer
                    .write_event(Event::Empty(start))
                    .map_err(xml_err)?;
            }
        }
        Ok(())
    }

    fn end_element(&mut self) -> Result<()> {
        let element = self
            .open
            .pop()
            .ok_or_else(|| DataServiceError::Output("no open element to close".into()))?;
        match self.pending.take() {
            Some(start) => self.writer.write_event(Event::Empty(start)),
            None => self
                .writer
                .write_event(Event::End(BytesEnd::new(element.name))),
        }
        .map_err(xml_err)
    }

    fn finish(&mut self) -> Result<()> {
        while !self.open.is_empty() {
            self.end_element()?;
        }
        self.writer.get_mut().flush()?;
        Ok(())
    }
}

/// Builds a JSON document in memory and writes it on [`finish`](OutputSink::finish).
/// Attributes and leaf elements become keys; a repeated key becomes an array.
pub struct JsonOutput<W: Write> {
    inner: W,
    frames: Vec<(String, Map<String, Value>)>,
    written: bool,
}

impl<W: Write + Send> JsonOutput<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            frames: vec![(String::new(), Map::new())],
            written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn top(&mut self) -> Result<&mut Map<String, Value>> {
        self.frames
            .last_mut()
            .map(|(_, map)| map)
            .ok_or_else(|| DataServiceError::Output("json document already finished".into()))
    }
}

fn insert_repeated(map: &mut Map<String, Value>, key: &str, value: Value) {
    match map.get_mut(key) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(key.to_string(), value);
        }
    }
}

/// Typed JSON for numeric and boolean columns; anything that does not parse
/// stays a string.
fn typed_json(text: &str, data_type: &DataType) -> Value {
    match data_type {
        DataType::Integer | DataType::Long => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        DataType::Double | DataType::Decimal => text
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        DataType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Value::Bool(true),
            "false" | "f" | "0" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        _ => Value::String(text.to_string()),
    }
}

impl<W: Write + Send> OutputSink for JsonOutput<W> {
    fn start_element(&mut self, name: &str, _namespace: Option<&str>) -> Result<()> {
        self.top()?;
        self.frames.push((name.to_string(), Map::new()));
        Ok(())
    }

    fn attribute(&mut self, name: &str, value: &str) -> Result<()> {
        let map = self.top()?;
        insert_repeated(map, name, Value::String(value.to_string()));
        Ok(())
    }

    fn value_element(
        &mut self,
        name: &str,
        _namespace: Option<&str>,
        value: Option<&str>,
        data_type: &DataType,
    ) -> Result<()> {
        let value = value.map_or(Value::Null, |text| typed_json(text, data_type));
        insert_repeated(self.top()?, name, value);
        Ok(())
    }

    fn end_element(&mut self) -> Result<()> {
        if self.frames.len() < 2 {
            return Err(DataServiceError::Output("no open element to close".into()));
        }
        let (name, map) = self
            .frames
            .pop()
            .ok_or_else(|| DataServiceError::Output("no open element to close".into()))?;
        insert_repeated(self.top()?, &name, Value::Object(map));
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.written {
            return Ok(());
        }
        while self.frames.len() > 1 {
            self.end_element()?;
        }
        let root = self
            .frames
            .pop()
            .map(|(_, map)| Value::Object(map))
            .unwrap_or(Value::Null);
        serde_json::to_writer_pretty(&mut self.inner, &root)
            .map_err(|e| DataServiceError::Output(format!("json: {}", e)))?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()?;
        self.written = true;
        Ok(())
    }
}
