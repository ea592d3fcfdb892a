//! Deterministic serialization of recipe option tables into the canonical
//! Lua-table-literal form used to build canonical keys (spec §3).
//!
//! Keys sort lexicographically; strings are quoted and backslash-escaped;
//! contiguous `1..n` integer-keyed tables serialize positionally as arrays;
//! booleans/integers/floats use their natural literal forms; nested tables
//! recurse. Functions anywhere in the tree are rejected.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::error::{Error, Result};

/// A parsed option value. `Function` exists only so a parser can represent
/// "a function literal was given here" long enough to reject it with a
/// useful path; it never serializes successfully.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// Contiguous integer keys `0..len` in table order; serializes
    /// positionally without keys.
    Array(Vec<OptionValue>),
    Table(BTreeMap<String, OptionValue>),
    Function,
}

/// Serialize an option value to its canonical string form. The top-level
/// value is expected to be a `Table` (possibly empty, serializing to `{}`);
/// non-table top-level values still serialize via the general rules so the
/// function stays total over the documented leaf/table types.
pub fn serialize(value: &OptionValue) -> Result<String> {
    let mut out = String::new();
    write_value(&mut out, value, "$")?;
    Ok(out)
}

fn write_value(out: &mut String, value: &OptionValue, path: &str) -> Result<()> {
    match value {
        OptionValue::Nil => out.push_str("nil"),
        OptionValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        OptionValue::Integer(i) => {
            write!(out, "{i}").expect("write to String never fails");
        }
        OptionValue::Float(f) => {
            write_float(out, *f);
        }
        OptionValue::String(s) => write_quoted_string(out, s),
        OptionValue::Array(items) => {
            out.push('{');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item, &format!("{path}[{i}]"))?;
            }
            out.push('}');
        }
        OptionValue::Table(map) => {
            out.push('{');
            // BTreeMap iterates in sorted key order already.
            for (i, (k, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(k);
                out.push('=');
                write_value(out, v, &format!("{path}.{k}"))?;
            }
            out.push('}');
        }
        OptionValue::Function => {
            return Err(Error::UnsupportedOptionType {
                path: path.to_string(),
                reason: "functions are not permitted in option tables".into(),
            });
        }
    }
    Ok(())
}

fn write_quoted_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_float(out: &mut String, f: f64) {
    if f.fract() == 0.0 && f.is_finite() {
        write!(out, "{f:.1}").expect("write to String never fails");
    } else {
        write!(out, "{f}").expect("write to String never fails");
    }
}

/// Parse a previously-serialized canonical option string back into an
/// `OptionValue`. Used by the round-trip law in spec §8 and by tests; the
/// phase engine itself only ever serializes (options arrive already parsed
/// from the embedded script's table).
pub fn parse(input: &str) -> Result<OptionValue> {
    let mut chars = input.trim().chars().peekable();
    let value = parse_value(&mut chars)?;
    Ok(value)
}

fn parse_value(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<OptionValue> {
    skip_ws(chars);
    match chars.peek().copied() {
        Some('{') => parse_table(chars),
        Some('"') => parse_string(chars).map(OptionValue::String),
        Some('t') | Some('f') => parse_bool(chars),
        Some('n') => {
            consume_literal(chars, "nil")?;
            Ok(OptionValue::Nil)
        }
        Some(c) if c == '-' || c.is_ascii_digit() => parse_number(chars),
        other => Err(Error::MalformedRecipe {
            path: None,
            reason: format!("unexpected character in option literal: {other:?}"),
        }),
    }
}

fn skip_ws(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
        chars.next();
    }
}

fn consume_literal(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    literal: &str,
) -> Result<()> {
    for expected in literal.chars() {
        match chars.next() {
            Some(c) if c == expected => {}
            _ => {
                return Err(Error::MalformedRecipe {
                    path: None,
                    reason: format!("expected literal {literal:?}"),
                });
            }
        }
    }
    Ok(())
}

fn parse_bool(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<OptionValue> {
    if chars.peek() == Some(&'t') {
        consume_literal(chars, "true")?;
        Ok(OptionValue::Bool(true))
    } else {
        consume_literal(chars, "false")?;
        Ok(OptionValue::Bool(false))
    }
}

fn parse_string(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<String> {
    chars.next(); // opening quote
    let mut s = String::new();
    loop {
        match chars.next() {
            Some('"') => break,
            Some('\\') => match chars.next() {
                Some('\\') => s.push('\\'),
                Some('"') => s.push('"'),
                Some('n') => s.push('\n'),
                Some('t') => s.push('\t'),
                Some('r') => s.push('\r'),
                Some(other) => s.push(other),
                None => {
                    return Err(Error::MalformedRecipe {
                        path: None,
                        reason: "unterminated escape in string literal".into(),
                    });
                }
            },
            Some(c) => s.push(c),
            None => {
                return Err(Error::MalformedRecipe {
                    path: None,
                    reason: "unterminated string literal".into(),
                });
            }
        }
    }
    Ok(s)
}

fn parse_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<OptionValue> {
    let mut text = String::new();
    let mut is_float = false;
    if chars.peek() == Some(&'-') {
        text.push(chars.next().unwrap());
    }
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            text.push(c);
            chars.next();
        } else if c == '.' {
            is_float = true;
            text.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if is_float {
        text.parse::<f64>()
            .map(OptionValue::Float)
            .map_err(|e| Error::MalformedRecipe {
                path: None,
                reason: format!("invalid float literal {text:?}: {e}"),
            })
    } else {
        text.parse::<i64>()
            .map(OptionValue::Integer)
            .map_err(|e| Error::MalformedRecipe {
                path: None,
                reason: format!("invalid integer literal {text:?}: {e}"),
            })
    }
}

fn parse_table(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Result<OptionValue> {
    chars.next(); // '{'
    skip_ws(chars);
    if chars.peek() == Some(&'}') {
        chars.next();
        return Ok(OptionValue::Table(BTreeMap::new()));
    }
    let mut map = BTreeMap::new();
    let mut array = Vec::new();
    let mut is_array = true;
    loop {
        skip_ws(chars);
        // Peek ahead: is this `key=value` or a bare positional value?
        let mut lookahead = chars.clone();
        let mut ident = String::new();
        while matches!(lookahead.peek(), Some(c) if c.is_alphanumeric() || *c == '_') {
            ident.push(lookahead.next().unwrap());
        }
        let is_keyed = !ident.is_empty() && lookahead.peek() == Some(&'=');
        if is_keyed {
            for _ in 0..ident.len() {
                chars.next();
            }
            chars.next(); // '='
            is_array = false;
            let v = parse_value(chars)?;
            map.insert(ident, v);
        } else {
            let v = parse_value(chars)?;
            if is_array {
                array.push(v);
            } else {
                map.insert(array.len().to_string(), v);
            }
        }
        skip_ws(chars);
        match chars.next() {
            Some(',') => continue,
            Some('}') => break,
            other => {
                return Err(Error::MalformedRecipe {
                    path: None,
                    reason: format!("expected ',' or '}}' in table literal, found {other:?}"),
                });
            }
        }
    }
    if is_array {
        Ok(OptionValue::Array(array))
    } else {
        for (i, v) in array.into_iter().enumerate() {
            map.insert(i.to_string(), v);
        }
        Ok(OptionValue::Table(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_serializes_to_braces() {
        let v = OptionValue::Table(BTreeMap::new());
        assert_eq!(serialize(&v).unwrap(), "{}");
    }

    #[test]
    fn keys_sort_lexicographically() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), OptionValue::Integer(2));
        map.insert("a".to_string(), OptionValue::Integer(1));
        let v = OptionValue::Table(map);
        assert_eq!(serialize(&v).unwrap(), "{a=1,b=2}");
    }

    #[test]
    fn strings_quoted_and_escaped() {
        let v = OptionValue::String("a\"b\\c".to_string());
        assert_eq!(serialize(&v).unwrap(), r#""a\"b\\c""#);
    }

    #[test]
    fn arrays_serialize_positionally() {
        let v = OptionValue::Array(vec![OptionValue::Integer(1), OptionValue::Integer(2)]);
        assert_eq!(serialize(&v).unwrap(), "{1,2}");
    }

    #[test]
    fn functions_rejected() {
        let v = OptionValue::Function;
        assert!(serialize(&v).is_err());
    }

    #[test]
    fn nested_tables_recurse() {
        let mut inner = BTreeMap::new();
        inner.insert("x".to_string(), OptionValue::Bool(true));
        let mut outer = BTreeMap::new();
        outer.insert("nested".to_string(), OptionValue::Table(inner));
        let v = OptionValue::Table(outer);
        assert_eq!(serialize(&v).unwrap(), "{nested={x=true}}");
    }

    #[test]
    fn round_trip_supported_types() {
        let mut map = BTreeMap::new();
        map.insert("version".to_string(), OptionValue::String("1.0".into()));
        map.insert("count".to_string(), OptionValue::Integer(3));
        map.insert("ratio".to_string(), OptionValue::Float(1.5));
        map.insert("on".to_string(), OptionValue::Bool(true));
        let v = OptionValue::Table(map);
        let s = serialize(&v).unwrap();
        let parsed = parse(&s).unwrap();
        assert_eq!(v, parsed);
    }
}
