//! JSON helpers shared by the protocol engines.
//!
//! Control messages, REST payloads and cached property values are all
//! `serde_json` values. The helpers here add the pieces the engines need on
//! top of that: typed member access where a wrong type is an error but an
//! absent member is not, deep equality, recursive patching, and an
//! incremental scanner used to stream JSON values out of a byte stream.

use serde_json::{Map, Value};

/// Wrong JSON type for a member that was present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mismatch;

type GetResult<T> = std::result::Result<T, Mismatch>;

pub(crate) fn get_int(options: &Map<String, Value>, name: &str, default: i64) -> GetResult<i64> {
    match options.get(name) {
        None => Ok(default),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) => Ok(v),
            None => n.as_f64().map(|v| v as i64).ok_or(Mismatch),
        },
        Some(_) => Err(Mismatch),
    }
}

pub(crate) fn get_bool(options: &Map<String, Value>, name: &str, default: bool) -> GetResult<bool> {
    match options.get(name) {
        None => Ok(default),
        Some(Value::Bool(v)) => Ok(*v),
        Some(_) => Err(Mismatch),
    }
}

pub(crate) fn get_str<'a>(
    options: &'a Map<String, Value>,
    name: &str,
) -> GetResult<Option<&'a str>> {
    match options.get(name) {
        None => Ok(None),
        Some(Value::String(v)) => Ok(Some(v)),
        Some(_) => Err(Mismatch),
    }
}

pub(crate) fn get_object<'a>(
    options: &'a Map<String, Value>,
    name: &str,
) -> GetResult<Option<&'a Map<String, Value>>> {
    match options.get(name) {
        None => Ok(None),
        Some(Value::Object(v)) => Ok(Some(v)),
        Some(_) => Err(Mismatch),
    }
}

/// Gets a member that must be an array of strings, if present.
pub(crate) fn get_strv(
    options: &Map<String, Value>,
    name: &str,
) -> GetResult<Option<Vec<String>>> {
    match options.get(name) {
        None => Ok(None),
        Some(Value::Array(items)) => {
            let mut strings = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => strings.push(s.clone()),
                    _ => return Err(Mismatch),
                }
            }
            Ok(Some(strings))
        }
        Some(_) => Err(Mismatch),
    }
}

/// Compares two JSON values for deep equality.
///
/// Object member order is irrelevant. Values of different types, and numbers
/// of different numeric classes (integer vs floating point), are unequal.
/// `None` stands in for an absent value and is only equal to `None`.
pub fn equal(previous: Option<&Value>, current: Option<&Value>) -> bool {
    let (previous, current) = match (previous, current) {
        (None, None) => return true,
        (Some(a), Some(b)) => (a, b),
        _ => return false,
    };

    match (previous, current) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => {
            if a.is_f64() || b.is_f64() {
                match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => a.is_f64() == b.is_f64() && x == y,
                    _ => false,
                }
            } else if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
                x == y
            } else if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                x == y
            } else {
                false
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b.iter())
                    .all(|(x, y)| equal(Some(x), Some(y)))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(name, x)| equal(Some(x), b.get(name)))
        }
        _ => false,
    }
}

/// Overrides members of `target` with the members of `overlay`.
///
/// A `null` member removes the target member. When both sides hold objects
/// for the same member they are patched recursively.
pub fn patch(target: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (name, node) in overlay {
        match node {
            Value::Null => {
                target.remove(name);
            }
            Value::Object(inner) => {
                if let Some(Value::Object(prev)) = target.get_mut(name) {
                    patch(prev, inner);
                } else {
                    target.insert(name.clone(), node.clone());
                }
            }
            _ => {
                target.insert(name.clone(), node.clone());
            }
        }
    }
}

/// Result of scanning a byte stream for one JSON value.
///
/// `spaces` counts leading whitespace. `block` is the number of bytes
/// holding that whitespace plus one complete value, or zero when more data
/// is needed to finish the value. A block equal to `spaces` means the input
/// was whitespace only.
pub(crate) fn skip(data: &[u8]) -> (usize, usize) {
    let spaces = data
        .iter()
        .take_while(|b| matches!(**b, b' ' | b'\t' | b'\r' | b'\n'))
        .count();
    if spaces == data.len() {
        return (spaces, spaces);
    }

    let rest = &data[spaces..];
    match rest[0] {
        b'{' | b'[' => {
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;
            for (i, b) in rest.iter().enumerate() {
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if *b == b'\\' {
                        escaped = true;
                    } else if *b == b'"' {
                        in_string = false;
                    }
                    continue;
                }
                match *b {
                    b'"' => in_string = true,
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            return (spaces, spaces + i + 1);
                        }
                    }
                    _ => (),
                }
            }
            (spaces, 0)
        }
        b'"' => {
            let mut escaped = false;
            for (i, b) in rest.iter().enumerate().skip(1) {
                if escaped {
                    escaped = false;
                } else if *b == b'\\' {
                    escaped = true;
                } else if *b == b'"' {
                    return (spaces, spaces + i + 1);
                }
            }
            (spaces, 0)
        }
        _ => {
            // A number or literal: runs until a delimiter. At the end of
            // input we cannot know it is finished; the caller decides based
            // on end-of-data.
            for (i, b) in rest.iter().enumerate() {
                if matches!(*b, b' ' | b'\t' | b'\r' | b'\n' | b',' | b']' | b'}') {
                    return (spaces, spaces + i);
                }
            }
            (spaces, 0)
        }
    }
}
