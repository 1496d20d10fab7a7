use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use futures::{pin_mut, TryStreamExt};
use std::error::Error as StdError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};
use tokio_postgres::types::{to_sql_checked, Field, Format, FromSql, IsNull, Kind, ToSql, Type};
use tokio_postgres::{Client, Row};
use tracing::debug;

use crate::backend::ConnectionKey;
use crate::binder::{number_placeholders, BoundQuery};
use crate::error::{BackendError, DataServiceError, ErrorCategory, Result};
use crate::model::{QueryProperties, StatementKind};
use crate::param::{DataType, InternalParam, ParamValue, StructValue};

/// Column name of the single row reporting an update count.
pub const UPDATED_ROW_COUNT: &str = "UPDATED_ROW_COUNT";

type BoxError = Box<dyn StdError + Sync + Send>;

/// Convert a driver error, keeping SQLSTATE, detail and hint when the server
/// sent them.
pub fn backend_error(err: &tokio_postgres::Error) -> BackendError {
    if let Some(db_err) = err.as_db_error() {
        let mut converted = BackendError::from_sqlstate(db_err.code().code(), db_err.message());
        converted.detail = db_err.detail().map(|s| s.to_string());
        converted.hint = db_err.hint().map(|s| s.to_string());
        return converted;
    }
    let category = if err.source().is_some() || err.is_closed() {
        ErrorCategory::Connection
    } else {
        ErrorCategory::Execution
    };
    let converted = BackendError::new(category, err.to_string());
    match err.source() {
        Some(source) => converted.with_detail(source.to_string()),
        None => converted,
    }
}

/// A parameter sent in text format; the server parses it for whatever type
/// it inferred for the placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct TextParam(pub Option<String>);

impl ToSql for TextParam {
    fn to_sql(&self, _ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match &self.0 {
            Some(text) => {
                out.extend_from_slice(text.as_bytes());
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

/// One statement ready to run on a request connection.
#[derive(Debug, Clone)]
pub struct PgStatement {
    pub key: ConnectionKey,
    pub sql: String,
    pub params: Vec<TextParam>,
    pub kind: StatementKind,
    pub max_rows: Option<usize>,
    pub timeout: Option<Duration>,
}

impl PgStatement {
    /// Rewrite `?` placeholders as `$n` and render every bound value as text.
    pub fn prepare(
        key: ConnectionKey,
        bound: &BoundQuery,
        kind: StatementKind,
        props: &QueryProperties,
    ) -> Result<Self> {
        let mut sql = number_placeholders(&bound.sql, |n| format!("${}", n));
        if props.return_generated_keys && kind.is_update() {
            sql = with_returning(&sql, &props.key_columns);
        }
        let params = bound
            .params
            .iter()
            .map(param_text)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            key,
            sql,
            params,
            kind,
            max_rows: props.max_rows,
            timeout: props.query_timeout_secs.map(Duration::from_secs),
        })
    }

    /// Whether the statement produces rows rather than just a count.
    fn returns_rows(&self) -> bool {
        !self.kind.is_update() || contains_keyword(&self.sql, "RETURNING")
    }
}

/// What a statement produced, buffered until the post phase.
#[derive(Debug, Default)]
pub struct PgOutcome {
    pub rows: Vec<Vec<(String, ParamValue)>>,
    pub affected: Option<u64>,
}

fn contains_keyword(sql: &str, keyword: &str) -> bool {
    sql.split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .any(|word| word.eq_ignore_ascii_case(keyword))
}

/// Append a RETURNING clause so that an insert hands back its generated keys.
fn with_returning(sql: &str, key_columns: &[String]) -> String {
    if contains_keyword(sql, "RETURNING") {
        return sql.to_string();
    }
    let columns = if key_columns.is_empty() {
        "*".to_string()
    } else {
        key_columns.join(", ")
    };
    let trimmed = sql.trim_end().trim_end_matches(';');
    format!("{} RETURNING {}", trimmed, columns)
}

fn param_text(param: &InternalParam) -> Result<TextParam> {
    let text = match (&param.value, param.data_type()) {
        (ParamValue::Null, _) => None,
        (ParamValue::Scalar(encoded), DataType::Binary) => {
            let raw = STANDARD.decode(encoded.trim()).map_err(|e| {
                DataServiceError::IncompatibleParameters(format!(
                    "binary parameter '{}' is not valid base64: {}",
                    param.name(),
                    e
                ))
            })?;
            Some(format!("\\x{}", hex::encode(raw)))
        }
        (ParamValue::Scalar(text), _) => Some(text.clone()),
        (ParamValue::Array(items), _) => Some(array_literal(items)),
        (ParamValue::Structured(record), _) => Some(record_literal(record)),
    };
    Ok(TextParam(text))
}

fn quote_element(text: &str) -> String {
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

/// `{"a","b",NULL}`
fn array_literal(items: &[ParamValue]) -> String {
    let parts: Vec<String> = items
        .iter()
        .map(|item| match item {
            ParamValue::Null => "NULL".to_string(),
            ParamValue::Array(inner) => array_literal(inner),
            ParamValue::Structured(record) => quote_element(&record_literal(record)),
            ParamValue::Scalar(text) => quote_element(text),
        })
        .collect();
    format!("{{{}}}", parts.join(","))
}

/// `("a",,"b")`, an empty field being NULL.
fn record_literal(record: &StructValue) -> String {
    let parts: Vec<String> = record
        .attributes
        .iter()
        .map(|field| match field {
            ParamValue::Null => String::new(),
            ParamValue::Array(items) => quote_element(&array_literal(items)),
            ParamValue::Structured(inner) => quote_element(&record_literal(inner)),
            ParamValue::Scalar(text) => quote_element(text),
        })
        .collect();
    format!("({})", parts.join(","))
}

/// Run one statement. Row-returning statements stop reading after
/// `max_rows`; the rest only report their affected count.
pub async fn run_statement(client: &Client, statement: &PgStatement) -> Result<PgOutcome> {
    let work = execute(client, statement);
    match statement.timeout {
        Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
            BackendError::from_sqlstate(
                "57014",
                format!("canceling statement after {}s", limit.as_secs()),
            )
        })?,
        None => work.await,
    }
}

async fn execute(client: &Client, statement: &PgStatement) -> Result<PgOutcome> {
    let start = Instant::now();
    let params = statement.params.iter();

    if !statement.returns_rows() {
        let affected = client
            .execute_raw(statement.sql.as_str(), params)
            .await
            .map_err(|e| backend_error(&e))?;
        debug!(affected, elapsed = ?start.elapsed(), "statement executed");
        return Ok(PgOutcome {
            rows: Vec::new(),
            affected: Some(affected),
        });
    }

    let stream = client
        .query_raw(statement.sql.as_str(), params)
        .await
        .map_err(|e| backend_error(&e))?;
    pin_mut!(stream);

    let mut rows = Vec::new();
    while let Some(row) = stream.try_next().await.map_err(|e| backend_error(&e))? {
        if statement.max_rows.is_some_and(|max| rows.len() >= max) {
            break;
        }
        rows.push(convert_row(&row)?);
    }
    debug!(rows = rows.len(), elapsed = ?start.elapsed(), "statement executed");
    let affected = Some(rows.len() as u64);
    Ok(PgOutcome { rows, affected })
}

fn convert_row(row: &Row) -> Result<Vec<(String, ParamValue)>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| Ok((col.name().to_string(), extract_value(row, idx)?)))
        .collect()
}

/// Column bytes as sent by the server, decoded by [`decode_value`].
struct RawValue<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawValue<'a> {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        Ok(RawValue(raw))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// NUMERIC rendered exactly, from the binary wire format.
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        decode_numeric(raw).map(PgNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn decode_numeric(raw: &[u8]) -> std::result::Result<String, BoxError> {
    let word = |i: usize| -> std::result::Result<u16, BoxError> {
        raw.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated numeric".into())
    };
    let ndigits = word(0)? as usize;
    let weight = word(1)? as i16 as i64;
    let sign = word(2)?;
    let dscale = word(3)? as usize;
    match sign {
        0xC000 => return Ok("NaN".into()),
        0xD000 => return Ok("Infinity".into()),
        0xF000 => return Ok("-Infinity".into()),
        _ => {}
    }
    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<std::result::Result<Vec<u16>, _>>()?;
    let digit = |i: i64| -> u16 {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == 0x4000 {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                text.push_str(&digit(i).to_string());
            } else {
                text.push_str(&format!("{:04}", digit(i)));
            }
        }
    }
    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut group = 0;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(weight + 1 + group)));
            group += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    Ok(text)
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> std::result::Result<&'a [u8], BoxError> {
    if buf.len() < n {
        return Err("truncated value".into());
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_i32(buf: &mut &[u8]) -> std::result::Result<i32, BoxError> {
    Ok(i32::from_be_bytes(<[u8; 4]>::try_from(take(buf, 4)?)?))
}

/// `8-4-4-4-12` lowercase hex.
fn uuid_text(raw: &[u8]) -> std::result::Result<String, BoxError> {
    if raw.len() != 16 {
        return Err(format!("uuid of {} bytes", raw.len()).into());
    }
    let hex = hex::encode(raw);
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    ))
}

/// inet and cidr: family, prefix bits, cidr flag, address length, address.
fn inet_text(raw: &[u8]) -> std::result::Result<String, BoxError> {
    let mut buf = raw;
    let header = take(&mut buf, 4)?;
    let (family, bits, is_cidr) = (header[0], header[1], header[2] != 0);
    let (addr, full): (IpAddr, u8) = match family {
        2 => (Ipv4Addr::from(<[u8; 4]>::try_from(take(&mut buf, 4)?)?).into(), 32),
        3 => (Ipv6Addr::from(<[u8; 16]>::try_from(take(&mut buf, 16)?)?).into(), 128),
        other => return Err(format!("unknown address family {}", other).into()),
    };
    if is_cidr || bits != full {
        Ok(format!("{}/{}", addr, bits))
    } else {
        Ok(addr.to_string())
    }
}

fn macaddr_text(raw: &[u8]) -> String {
    raw.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Binary record: field count, then per field its type oid, length (-1 for
/// NULL) and bytes. Fields decode by the declared attribute types.
fn decode_composite(
    ty: &Type,
    fields: &[Field],
    raw: &[u8],
) -> std::result::Result<ParamValue, BoxError> {
    let mut buf = raw;
    let count = take_i32(&mut buf)?;
    if usize::try_from(count).ok() != Some(fields.len()) {
        return Err(format!(
            "record carries {} fields, {} declares {}",
            count,
            ty.name(),
            fields.len()
        )
        .into());
    }
    let attributes = fields
        .iter()
        .map(|field| {
            take_i32(&mut buf)?;
            let len = take_i32(&mut buf)?;
            match usize::try_from(len) {
                Ok(len) => decode_value(field.type_(), take(&mut buf, len)?),
                Err(_) => Ok(ParamValue::Null),
            }
        })
        .collect::<std::result::Result<Vec<_>, BoxError>>()?;
    Ok(ParamValue::Structured(StructValue::new(
        Some(ty.name().to_string()),
        attributes,
    )))
}

fn scalar<'a, T, F>(ty: &Type, raw: &'a [u8], render: F) -> std::result::Result<ParamValue, BoxError>
where
    T: FromSql<'a>,
    F: Fn(T) -> String,
{
    T::from_sql(ty, raw).map(|v| ParamValue::Scalar(render(v)))
}

fn array<'a, T, F>(ty: &Type, raw: &'a [u8], render: F) -> std::result::Result<ParamValue, BoxError>
where
    T: FromSql<'a>,
    F: Fn(T) -> String,
{
    let items = Vec::<Option<T>>::from_sql(ty, raw)?;
    Ok(ParamValue::Array(
        items
            .into_iter()
            .map(|item| item.map_or(ParamValue::Null, |v| ParamValue::Scalar(render(v))))
            .collect(),
    ))
}

fn naive_timestamp(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

fn utc_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn base64_text(raw: Vec<u8>) -> String {
    STANDARD.encode(raw)
}

/// Decode one non-NULL binary value into the backend-native string form
/// projection sees.
fn decode_value(ty: &Type, raw: &[u8]) -> std::result::Result<ParamValue, BoxError> {
    match *ty {
        Type::BOOL => scalar(ty, raw, |v: bool| v.to_string()),
        Type::INT2 => scalar(ty, raw, |v: i16| v.to_string()),
        Type::INT4 => scalar(ty, raw, |v: i32| v.to_string()),
        Type::INT8 => scalar(ty, raw, |v: i64| v.to_string()),
        Type::OID => scalar(ty, raw, |v: u32| v.to_string()),
        Type::FLOAT4 => scalar(ty, raw, |v: f32| v.to_string()),
        Type::FLOAT8 => scalar(ty, raw, |v: f64| v.to_string()),
        Type::NUMERIC => scalar(ty, raw, |v: PgNumeric| v.0),
        Type::TEXT
        | Type::VARCHAR
        | Type::NAME
        | Type::CHAR
        | Type::BPCHAR
        | Type::XML
        | Type::UNKNOWN => scalar(ty, raw, |v: String| v),
        Type::BYTEA => scalar(ty, raw, base64_text),
        Type::DATE => scalar(ty, raw, |v: NaiveDate| v.to_string()),
        Type::TIME => scalar(ty, raw, |v: NaiveTime| v.to_string()),
        Type::TIMESTAMP => scalar(ty, raw, naive_timestamp),
        Type::TIMESTAMPTZ => scalar(ty, raw, utc_timestamp),
        Type::JSON | Type::JSONB => scalar(ty, raw, |v: serde_json::Value| v.to_string()),
        Type::UUID => uuid_text(raw).map(ParamValue::Scalar),
        Type::INET | Type::CIDR => inet_text(raw).map(ParamValue::Scalar),
        Type::MACADDR => Ok(ParamValue::Scalar(macaddr_text(raw))),
        Type::BOOL_ARRAY => array(ty, raw, |v: bool| v.to_string()),
        Type::INT2_ARRAY => array(ty, raw, |v: i16| v.to_string()),
        Type::INT4_ARRAY => array(ty, raw, |v: i32| v.to_string()),
        Type::INT8_ARRAY => array(ty, raw, |v: i64| v.to_string()),
        Type::FLOAT8_ARRAY => array(ty, raw, |v: f64| v.to_string()),
        Type::NUMERIC_ARRAY => array(ty, raw, |v: PgNumeric| v.0),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => array(ty, raw, |v: String| v),
        Type::TIMESTAMPTZ_ARRAY => array(ty, raw, utc_timestamp),
        _ => match ty.kind() {
            Kind::Enum(_) => scalar(ty, raw, |v: String| v),
            Kind::Domain(base) => decode_value(base, raw),
            Kind::Composite(fields) => decode_composite(ty, fields, raw),
            Kind::Array(member) => Vec::<Option<RawValue>>::from_sql(ty, raw)?
                .into_iter()
                .map(|item| match item {
                    Some(RawValue(bytes)) => decode_value(member, bytes),
                    None => Ok(ParamValue::Null),
                })
                .collect::<std::result::Result<Vec<_>, BoxError>>()
                .map(ParamValue::Array),
            _ => Err(format!("no decoder for type {}", ty).into()),
        },
    }
}

/// Convert one column, failing with the column name and type rather than
/// passing an undecodable value on as NULL.
fn extract_value(row: &Row, idx: usize) -> Result<ParamValue> {
    let column = &row.columns()[idx];
    let undecodable = |e: &dyn std::fmt::Display| {
        BackendError::new(
            ErrorCategory::Data,
            format!(
                "cannot read column '{}' of type {}: {}",
                column.name(),
                column.type_(),
                e
            ),
        )
    };
    match row
        .try_get::<_, Option<RawValue>>(idx)
        .map_err(|e| undecodable(&e))?
    {
        Some(RawValue(raw)) => Ok(decode_value(column.type_(), raw).map_err(|e| undecodable(&e))?),
        None => Ok(ParamValue::Null),
    }
}
