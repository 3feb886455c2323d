//! `ParamSource` — the contract the named-parameter collaborator is built
//! against — plus the positional-substitution primitives that make it
//! usable. Rather than deriving field order from a struct via reflection,
//! callers hand the handle something that already knows how to order
//! itself against a slice of names.

use std::collections::{BTreeMap, HashMap};

use mysql_async::Value;

use crate::error::{DbCoreError, Operation};

/// Given the list of `:name` placeholders found in a statement (in
/// left-to-right order), yields the bound values in that same order.
///
/// Two implementations ship here: a keyed mapping (`MapParams`) and a
/// plain ordered pass-through (`SliceParams`) for callers who already have
/// positional values but want named-SQL ergonomics. A struct-field-tagged
/// derive is explicitly not built.
pub trait ParamSource {
    fn ordered_values(&self, names: &[String]) -> Result<Vec<Value>, DbCoreError>;
}

/// Keyed parameter source backed by a `HashMap`. Missing names surface as a
/// `SyntaxError`-classified error: a caller who misnamed a bound parameter
/// made a mistake that no retry will fix.
pub struct MapParams(pub HashMap<String, Value>);

impl ParamSource for MapParams {
    fn ordered_values(&self, names: &[String]) -> Result<Vec<Value>, DbCoreError> {
        names
            .iter()
            .map(|name| {
                self.0.get(name).cloned().ok_or_else(|| {
                    DbCoreError::classified(
                        crate::error::ErrorClass::SyntaxError,
                        Operation::Exec,
                        format!("missing named parameter `:{name}`"),
                    )
                })
            })
            .collect()
    }
}

/// Same contract, backed by a `BTreeMap` for callers who want deterministic
/// iteration order upstream (irrelevant here since lookup is by name, but
/// convenient for tests that build expected parameter maps).
pub struct SortedMapParams(pub BTreeMap<String, Value>);

impl ParamSource for SortedMapParams {
    fn ordered_values(&self, names: &[String]) -> Result<Vec<Value>, DbCoreError> {
        names
            .iter()
            .map(|name| {
                self.0.get(name).cloned().ok_or_else(|| {
                    DbCoreError::classified(
                        crate::error::ErrorClass::SyntaxError,
                        Operation::Exec,
                        format!("missing named parameter `:{name}`"),
                    )
                })
            })
            .collect()
    }
}

/// A source that already has its values in the right order and ignores the
/// names entirely. Useful for tests and for callers migrating named SQL
/// onto an existing positional call site.
pub struct SliceParams(pub Vec<Value>);

impl ParamSource for SliceParams {
    fn ordered_values(&self, names: &[String]) -> Result<Vec<Value>, DbCoreError> {
        if self.0.len() != names.len() {
            return Err(DbCoreError::classified(
                crate::error::ErrorClass::SyntaxError,
                Operation::Exec,
                format!(
                    "expected {} positional values for {} named parameters",
                    self.0.len(),
                    names.len()
                ),
            ));
        }
        Ok(self.0.clone())
    }
}

/// Expands `:name` placeholders in `sql` into positional `?` placeholders,
/// returning the rewritten SQL and the names in the order they appeared.
/// A `:` is only treated as a placeholder marker when followed by an
/// identifier character and not itself preceded by another `:` (so `::`
/// casts and bare colons inside string literals pass through unless they
/// happen to match `:ident`, which is the one corner this minimal expander
/// doesn't attempt to resolve).
pub fn expand_named(sql: &str) -> (String, Vec<String>) {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut names = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == ':' && i + 1 < bytes.len() && (bytes[i + 1] as char).is_ascii_alphabetic() && (i == 0 || bytes[i - 1] as char != ':') {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && ((bytes[end] as char).is_ascii_alphanumeric() || bytes[end] as char == '_') {
                end += 1;
            }
            names.push(sql[start..end].to_string());
            out.push('?');
            i = end;
        } else {
            out.push(c);
            i += 1;
        }
    }
    (out, names)
}

/// Expands the first `IN (?)` occurrence (case-insensitive, whitespace
/// tolerant) into `len(xs)` placeholders, splicing `xs` into the correct
/// position of an otherwise-positional argument list. `rest` holds the
/// values bound to every other `?` in `sql`, in their original order;
/// `build_in` locates where, among those, the list's single placeholder
/// would have fallen by counting `?` occurrences before the match.
///
/// Preserves the order of the remaining arguments and
/// produces exactly `len(xs)` placeholders in the list position.
pub fn build_in(sql: &str, xs: &[Value], rest: &[Value]) -> (String, Vec<Value>) {
    let lower = sql.to_ascii_lowercase();
    let Some(paren_rel) = lower.find("in") .and_then(|start| {
        find_in_paren(&lower[start..]).map(|(open, close)| (start + open, start + close))
    }) else {
        return (sql.to_string(), rest.to_vec());
    };
    let (open, close) = paren_rel;

    let insertion_index = sql[..open].matches('?').count();

    let placeholders = std::iter::repeat("?").take(xs.len().max(1)).collect::<Vec<_>>().join(",");
    let mut new_sql = String::with_capacity(sql.len() + placeholders.len());
    new_sql.push_str(&sql[..open]);
    new_sql.push('(');
    new_sql.push_str(&placeholders);
    new_sql.push(')');
    new_sql.push_str(&sql[close + 1..]);

    let mut args = Vec::with_capacity(rest.len() + xs.len());
    args.extend_from_slice(&rest[..insertion_index.min(rest.len())]);
    args.extend_from_slice(xs);
    if insertion_index < rest.len() {
        args.extend_from_slice(&rest[insertion_index..]);
    }
    (new_sql, args)
}

/// Finds the first `(...)` group following an `IN` token that contains
/// exactly one `?`. Returns byte offsets of the opening and closing paren
/// relative to the start of `haystack`.
fn find_in_paren(haystack: &str) -> Option<(usize, usize)> {
    let bytes = haystack.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] as char == '(' {
            if let Some(close_rel) = haystack[i..].find(')') {
                let close = i + close_rel;
                let inner = &haystack[i + 1..close];
                if inner.trim() == "?" {
                    return Some((i, close));
                }
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_named_rewrites_in_order() {
        let (sql, names) = expand_named("INSERT INTO t(a,b) VALUES(:a,:b)");
        assert_eq!(sql, "INSERT INTO t(a,b) VALUES(?,?)");
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn expand_named_leaves_double_colon_alone() {
        let (sql, names) = expand_named("SELECT x::int, :y");
        assert_eq!(sql, "SELECT x::int, ?");
        assert_eq!(names, vec!["y".to_string()]);
    }

    #[test]
    fn map_params_orders_by_name() {
        let mut m = HashMap::new();
        m.insert("a".to_string(), Value::Int(1));
        m.insert("b".to_string(), Value::Bytes(b"x".to_vec()));
        let source = MapParams(m);
        let values = source.ordered_values(&["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(values, vec![Value::Int(1), Value::Bytes(b"x".to_vec())]);
    }

    #[test]
    fn map_params_missing_name_is_syntax_error() {
        let source = MapParams(HashMap::new());
        let err = source.ordered_values(&["missing".to_string()]).unwrap_err();
        assert_eq!(err.class(), Some(crate::error::ErrorClass::SyntaxError));
    }

    #[test]
    fn build_in_expands_list_in_place() {
        let xs = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
        let rest = vec![Value::Int(100), Value::Int(200)];
        let (sql, args) = build_in("SELECT * FROM t WHERE a = ? AND id IN (?) AND b = ?", &xs, &rest);
        assert_eq!(sql, "SELECT * FROM t WHERE a = ? AND id IN (?,?,?) AND b = ?");
        assert_eq!(args, vec![Value::Int(100), Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(200)]);
    }

    #[test]
    fn build_in_at_start_preserves_trailing_order() {
        let xs = vec![Value::Int(7)];
        let rest = vec![Value::Int(9)];
        let (sql, args) = build_in("SELECT * FROM t WHERE id IN (?) AND b = ?", &xs, &rest);
        assert_eq!(sql, "SELECT * FROM t WHERE id IN (?) AND b = ?");
        assert_eq!(args, vec![Value::Int(7), Value::Int(9)]);
    }
}
