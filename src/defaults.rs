//! Default-value evaluation for declared parameters.
//!
//! A default is either a literal or a `#{VARIABLE}` reference resolved against
//! the calling user. Defaults for ARRAY parameters that evaluate to a string
//! are split on commas:
//!
//! ```text
//! a,b\,c        → ["a", "b,c"]
//! 'x,y',"z"     → ["x,y", "z"]
//! a\tb          → ["a<TAB>b"]
//! ```
//!
//! Backslash escapes `,` `\` `'` `"` `n` `r` `t`; anything else after a
//! backslash, a trailing backslash, or an unterminated quote is rejected.
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;

use crate::engine::UserContext;
use crate::error::{DataServiceError, Result};
use crate::param::{ParamMap, ParamValue, QueryParam};

/// Variables usable as `#{NAME}` in default values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemVariable {
    Username,
    TenantId,
    UserRoles,
    CurrentTimestamp,
    Null,
}

impl SystemVariable {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "USERNAME" => Some(SystemVariable::Username),
            "TENANT_ID" => Some(SystemVariable::TenantId),
            "USER_ROLES" => Some(SystemVariable::UserRoles),
            "CURRENT_TIMESTAMP" => Some(SystemVariable::CurrentTimestamp),
            "NULL" => Some(SystemVariable::Null),
            _ => None,
        }
    }

    fn resolve(self, user: &UserContext, as_array: bool) -> ParamValue {
        match self {
            SystemVariable::Username => user.username.clone().into(),
            SystemVariable::TenantId => user.tenant_id.clone().into(),
            SystemVariable::UserRoles if as_array => {
                ParamValue::array(user.roles.iter().cloned())
            }
            SystemVariable::UserRoles => {
                let roles: Vec<String> = user.roles.iter().map(|r| escape_element(r)).collect();
                ParamValue::Scalar(roles.join(","))
            }
            SystemVariable::CurrentTimestamp => {
                ParamValue::Scalar(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            SystemVariable::Null => ParamValue::Null,
        }
    }
}

fn variable_reference(expr: &str) -> Option<&str> {
    expr.trim()
        .strip_prefix("#{")
        .and_then(|rest| rest.strip_suffix('}'))
}

/// Evaluate `param`'s default expression for `user`.
pub fn evaluate_default(param: &QueryParam, expr: &str, user: &UserContext) -> Result<ParamValue> {
    let value = match variable_reference(expr) {
        Some(name) => SystemVariable::parse(name)
            .ok_or_else(|| {
                DataServiceError::IllegalArgument(format!(
                    "unknown system variable '#{{{}}}' in default of '{}'",
                    name, param.name
                ))
            })?
            .resolve(user, param.is_array()),
        None => ParamValue::Scalar(expr.to_string()),
    };

    match value {
        ParamValue::Scalar(text) if param.is_array() => Ok(ParamValue::array(
            split_array_literal(&text).map_err(|msg| {
                DataServiceError::IllegalArgument(format!(
                    "default of array parameter '{}': {}",
                    param.name, msg
                ))
            })?,
        )),
        other => Ok(other),
    }
}

/// Split a comma-separated list using the escaping grammar described in the
/// module docs. An empty input yields no elements.
pub fn split_array_literal(text: &str) -> std::result::Result<Vec<String>, String> {
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let mut items = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = text.chars().enumerate();

    while let Some((pos, c)) = chars.next() {
        if c == '\\' {
            let (_, escaped) = chars
                .next()
                .ok_or_else(|| format!("dangling escape at position {}", pos))?;
            current.push(match escaped {
                ',' | '\\' | '\'' | '"' => escaped,
                'n' => '\n',
                'r' => '\r',
                't' => '\t',
                other => return Err(format!("unknown escape '\\{}' at position {}", other, pos)),
            });
            continue;
        }
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => quote = Some(c),
                ',' => items.push(std::mem::take(&mut current)),
                _ => current.push(c),
            },
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {} quote", q));
    }
    items.push(current);
    Ok(items)
}

/// Inverse of [`split_array_literal`] for a single element.
pub fn escape_element(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ',' | '\\' | '\'' | '"' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// Fill in values the caller did not supply: forced defaults first, then
/// values exported by earlier statements of a boxcar, then declared
/// defaults. OUT parameters are left alone.
pub fn apply_defaults(
    defs: &[Arc<QueryParam>],
    supplied: &mut ParamMap,
    exports: &ParamMap,
    user: &UserContext,
) -> Result<()> {
    for def in defs {
        if def.is_out_only() {
            continue;
        }
        let default = def.default_value.as_deref();
        match default {
            Some(expr) if def.force_default => {
                supplied.insert(def.name.clone(), evaluate_default(def, expr, user)?);
            }
            _ if supplied.contains(&def.name) => {}
            _ if exports.contains(&def.name) => {
                if let Some(value) = exports.get(&def.name) {
                    supplied.insert(def.name.clone(), value.clone());
                }
            }
            Some(expr) => {
                supplied.insert(def.name.clone(), evaluate_default(def, expr, user)?);
            }
            None => {}
        }
    }
    Ok(())
}
