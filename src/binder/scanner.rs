//! Quote-aware scanning of query templates.
//!
//! Everything between matching single or double quotes is literal text; the
//! other quote character has no meaning inside a quoted run. A doubled quote
//! (`''`) closes and immediately reopens the run, which leaves the state
//! unchanged, so SQL escaping needs no special case.
use std::sync::Arc;

use crate::param::QueryParam;

/// A parameter marker found in a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Marker {
    /// A bare `?` at `offset`.
    Positional { offset: usize },
    /// `:name` spanning `offset..offset + len`, naming `defs[param]`.
    Named {
        offset: usize,
        len: usize,
        param: usize,
    },
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Collect `?` markers and `:name` tokens that name a declared parameter, in
/// template order. Unknown `:name` tokens and `::type` casts are skipped.
pub(crate) fn scan_markers(template: &str, defs: &[Arc<QueryParam>]) -> Vec<Marker> {
    let bytes = template.as_bytes();
    let mut markers = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => {
                quote = Some(b);
                i += 1;
            }
            b'?' => {
                markers.push(Marker::Positional { offset: i });
                i += 1;
            }
            b':' => {
                let is_cast = bytes.get(i + 1) == Some(&b':') || (i > 0 && bytes[i - 1] == b':');
                if is_cast || !bytes.get(i + 1).copied().is_some_and(is_ident_start) {
                    i += 1;
                    continue;
                }
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && is_ident_char(bytes[end]) {
                    end += 1;
                }
                let name = &template[start..end];
                if let Some(param) = defs.iter().position(|d| d.matches_name(name)) {
                    markers.push(Marker::Named {
                        offset: i,
                        len: end - i,
                        param,
                    });
                }
                i = end;
            }
            _ => i += 1,
        }
    }

    markers
}

/// Offset of the first unquoted `?` at or after `from`. `from` must not lie
/// inside a quoted run.
pub(crate) fn next_placeholder(sql: &str, from: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut quote: Option<u8> = None;
    for (i, &b) in bytes.iter().enumerate().skip(from) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'\'' | b'"' => quote = Some(b),
                b'?' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

/// Offsets of every unquoted `?`.
pub(crate) fn placeholder_offsets(sql: &str) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut from = 0;
    while let Some(pos) = next_placeholder(sql, from) {
        offsets.push(pos);
        from = pos + 1;
    }
    offsets
}

/// The quote character left open at the end of `text`, if any.
pub(crate) fn open_quote(text: &str) -> Option<char> {
    let mut quote: Option<u8> = None;
    for &b in text.as_bytes() {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None => {}
        }
    }
    quote.map(char::from)
}

pub fn count_placeholders(sql: &str) -> usize {
    placeholder_offsets(sql).len()
}

/// Rewrite each unquoted `?` using `render(ordinal)`, ordinals from 1.
pub fn number_placeholders(sql: &str, render: impl Fn(usize) -> String) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut cursor = 0;
    for (idx, pos) in placeholder_offsets(sql).into_iter().enumerate() {
        out.push_str(&sql[cursor..pos]);
        out.push_str(&render(idx + 1));
        cursor = pos + 1;
    }
    out.push_str(&sql[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::DataType;

    fn defs(names: &[&str]) -> Vec<Arc<QueryParam>> {
        names
            .iter()
            .map(|n| Arc::new(QueryParam::new(*n, DataType::String)))
            .collect()
    }

    #[test]
    fn test_scan_named_and_positional() {
        let d = defs(&["x", "y"]);
        let markers = scan_markers("SELECT * FROM t WHERE a = :x AND b = ? AND c = :y", &d);
        assert_eq!(markers.len(), 3);
        assert!(matches!(markers[0], Marker::Named { param: 0, len: 2, .. }));
        assert!(matches!(markers[1], Marker::Positional { .. }));
        assert!(matches!(markers[2], Marker::Named { param: 1, .. }));
    }

    #[test]
    fn test_scan_ignores_quoted_and_casts() {
        let d = defs(&["x", "int"]);
        let markers = scan_markers("SELECT ':x', \"?\", col::int, '?''s' FROM t WHERE a = :x", &d);
        assert_eq!(markers.len(), 1);
        assert!(matches!(markers[0], Marker::Named { param: 0, .. }));
    }

    #[test]
    fn test_scan_leaves_unknown_names() {
        let d = defs(&["abc"]);
        let markers = scan_markers("a = :abcd OR b = :abc", &d);
        assert_eq!(markers.len(), 1);
        assert!(matches!(markers[0], Marker::Named { offset: 17, .. }));
    }

    #[test]
    fn test_nested_quotes() {
        assert_eq!(count_placeholders("SELECT '\"?' , ?"), 1);
        assert_eq!(count_placeholders("SELECT \"it's ?\" , ?, ?"), 2);
    }

    #[test]
    fn test_number_placeholders() {
        assert_eq!(
            number_placeholders("a = ? AND b IN (?,?) AND c = '?'", |n| format!("${}", n)),
            "a = $1 AND b IN ($2,$3) AND c = '?'"
        );
    }

    #[test]
    fn test_open_quote() {
        assert_eq!(open_quote("WHERE name = 'x"), Some('\''));
        assert_eq!(open_quote("WHERE \"col"), Some('"'));
        assert_eq!(open_quote("WHERE name = 'it''s' AND \"a'b\" = 1"), None);
        assert_eq!(open_quote(""), None);
    }

    #[test]
    fn test_next_placeholder_from_offset() {
        let sql = "? , '?' , ?";
        assert_eq!(next_placeholder(sql, 0), Some(0));
        assert_eq!(next_placeholder(sql, 1), Some(10));
        assert_eq!(next_placeholder(sql, 11), None);
    }
}
