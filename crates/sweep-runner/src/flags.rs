//! Text encoding for flag values.
//!
//! Flag values are carried as [`serde_json::Value`]. The text form is compact
//! and YAML-like: booleans are `yes`/`no`, lists are `[a, b]`, and strings that
//! would read back as something else are single-quoted. Decoding never fails;
//! text that cannot be interpreted decodes to itself.
//!
//! Decoding additionally recognises flag functions (`name[a:b:...]`, or the
//! anonymous form `[a:b]`), which are kept as strings so they can be resolved
//! later, sequence functions (`range`, `linspace`, `logspace`, `geomspace`),
//! which expand to lists eagerly, and list repetition (`[1, 2]*3`).

use anyhow::{anyhow, Result};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// A concrete assignment of flag names to values.
pub type Flags = BTreeMap<String, Value>;

pub const FUNCTION_ARG_DELIM: char = ':';
pub const DEFAULT_FLOAT_TRUNC_LEN: usize = 5;

/// Upper bound on values produced by a sequence function or `[..]*N`.
const MAX_EXPANDED_ITEMS: usize = 1_000_000;
const SEQUENCE_FUNCTIONS: &[&str] = &["range", "linspace", "geomspace", "logspace"];

const YAML_TRUE: &[&str] = &["yes", "Yes", "YES", "true", "True", "TRUE", "on", "On", "ON"];
const YAML_FALSE: &[&str] = &["no", "No", "NO", "false", "False", "FALSE", "off", "Off", "OFF"];
const YAML_NULL: &[&str] = &["null", "Null", "NULL", "~"];

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

pub fn encode_flag_val(val: &Value) -> String {
    match val {
        Value::Bool(true) => "yes".to_string(),
        Value::Bool(false) => "no".to_string(),
        Value::Null => "null".to_string(),
        Value::Number(n) => encode_number(n),
        Value::String(s) => encode_string(s),
        Value::Array(items) => encode_list(items),
        Value::Object(map) => encode_dict(map),
    }
}

fn encode_number(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) => encode_float(f),
        None => n.to_string(),
    }
}

/// Shortest text that parses back to the same float. Integral values keep a
/// trailing `.0` so they are not read back as integers.
pub fn encode_float(f: f64) -> String {
    format!("{f:?}")
}

fn encode_string(s: &str) -> String {
    if decode_flag_val(s) == Value::String(s.to_string()) {
        s.to_string()
    } else {
        quote(s)
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn encode_list(items: &[Value]) -> String {
    let joined = items
        .iter()
        .map(encode_item)
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{joined}]")
}

fn encode_dict(map: &Map<String, Value>) -> String {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    let body = entries
        .into_iter()
        .map(|(k, v)| format!("{}: {}", encode_item(&Value::String(k.clone())), encode_item(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{body}}}")
}

/// Items inside a list or dict are quoted whenever they contain characters
/// that would confuse splitting on read.
fn encode_item(val: &Value) -> String {
    let encoded = encode_flag_val(val);
    match val {
        Value::String(s) if !encoded.starts_with('\'') && needs_item_quote(s) => quote(s),
        _ => encoded,
    }
}

fn needs_item_quote(s: &str) -> bool {
    s.is_empty()
        || s.trim() != s
        || s.chars()
            .any(|c| matches!(c, ',' | '[' | ']' | '{' | '}' | ':' | '\'' | '"' | '#'))
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

pub fn decode_flag_val(s: &str) -> Value {
    let decoded = decode_raw(s);
    fix_surprising_number(decoded, s)
}

fn decode_raw(s: &str) -> Value {
    if s.is_empty() {
        return Value::String(String::new());
    }
    if let Some(val) = decode_number(s) {
        return val;
    }
    if let Some(val) = decode_keyword(s) {
        return val;
    }
    if let Some(val) = decode_quoted(s) {
        return val;
    }
    if let Some(val) = decode_function_or_sequence(s) {
        return val;
    }
    if let Some(val) = decode_concatenated_list(s) {
        return val;
    }
    if let Some(val) = decode_collection(s) {
        return val;
    }
    decode_yaml(s).unwrap_or_else(|| Value::String(s.to_string()))
}

fn decode_number(s: &str) -> Option<Value> {
    let t = s.trim();
    if let Ok(i) = t.parse::<i64>() {
        return Some(Value::from(i));
    }
    if let Ok(u) = t.parse::<u64>() {
        return Some(Value::from(u));
    }
    if !t.chars().any(|c| c.is_ascii_digit()) {
        // Rejects "inf", "NaN" and friends.
        return None;
    }
    t.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn decode_keyword(s: &str) -> Option<Value> {
    if YAML_TRUE.contains(&s) {
        Some(Value::Bool(true))
    } else if YAML_FALSE.contains(&s) {
        Some(Value::Bool(false))
    } else if YAML_NULL.contains(&s) {
        Some(Value::Null)
    } else {
        None
    }
}

fn decode_quoted(s: &str) -> Option<Value> {
    if s.len() < 2 {
        return None;
    }
    if s.starts_with('\'') && s.ends_with('\'') {
        let inner = &s[1..s.len() - 1];
        if inner.replace("''", "").contains('\'') {
            return None;
        }
        return Some(Value::String(inner.replace("''", "'")));
    }
    if s.starts_with('"') && s.ends_with('"') {
        return serde_json::from_str::<String>(s).ok().map(Value::String);
    }
    None
}

/// Anonymous functions stay strings (YAML would otherwise read `[1:2]` as a
/// list); sequence functions expand to lists.
fn decode_function_or_sequence(s: &str) -> Option<Value> {
    let (name, args) = decode_flag_function(s).ok()?;
    match name {
        None if args.len() >= 2 => Some(Value::String(s.to_string())),
        None => None,
        Some(name) if SEQUENCE_FUNCTIONS.contains(&name.as_str()) => {
            match expand_sequence(&name, &args) {
                Ok(items) => Some(Value::Array(items)),
                Err(e) => {
                    warn!("error decoding {:?}: {}", s, e);
                    None
                }
            }
        }
        Some(_) => Some(Value::String(s.to_string())),
    }
}

fn decode_concatenated_list(s: &str) -> Option<Value> {
    let t = s.trim();
    let star = t.rfind('*')?;
    let count = t[star + 1..].trim();
    if count.is_empty() || !count.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let list_part = t[..star].trim();
    if !(list_part.starts_with('[') && list_part.ends_with(']')) {
        return None;
    }
    let count: usize = count.parse().ok()?;
    match decode_raw(list_part) {
        Value::Array(items) => {
            let total = match items.len().checked_mul(count) {
                Some(total) if total <= MAX_EXPANDED_ITEMS => total,
                _ => return Some(Value::String(s.to_string())),
            };
            let mut repeated = Vec::with_capacity(total);
            for _ in 0..count {
                repeated.extend(items.iter().cloned());
            }
            Some(Value::Array(repeated))
        }
        _ => Some(Value::String(s.to_string())),
    }
}

fn decode_collection(s: &str) -> Option<Value> {
    let t = s.trim();
    if t.len() < 2 {
        return None;
    }
    if t.starts_with('[') && t.ends_with(']') {
        let inner = t[1..t.len() - 1].trim();
        if inner.is_empty() {
            return Some(Value::Array(Vec::new()));
        }
        let mut items = Vec::new();
        for part in split_top_level(inner, ',')? {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }
            items.push(decode_flag_val(part));
        }
        return Some(Value::Array(items));
    }
    if t.starts_with('{') && t.ends_with('}') {
        let inner = t[1..t.len() - 1].trim();
        let mut map = Map::new();
        if inner.is_empty() {
            return Some(Value::Object(map));
        }
        for entry in split_top_level(inner, ',')? {
            let entry = entry.trim();
            let (key, val) = split_once_top_level(entry, ':')?;
            let key = match decode_flag_val(key.trim()) {
                Value::String(k) => k,
                other => encode_flag_val(&other),
            };
            map.insert(key, decode_flag_val(val.trim()));
        }
        return Some(Value::Object(map));
    }
    None
}

fn decode_yaml(s: &str) -> Option<Value> {
    serde_yaml::from_str::<Value>(s).ok()
}

/// Numeric results are surprising for text containing `_` or `:`; such text
/// stays a string.
fn fix_surprising_number(val: Value, s: &str) -> Value {
    if val.is_number() && !s.contains("!!") && s.chars().any(|c| c == '_' || c == ':') {
        Value::String(s.to_string())
    } else {
        val
    }
}

/// Splits `s` on `sep` outside of brackets, braces and quotes. Returns `None`
/// when nesting is unbalanced.
fn split_top_level(s: &str, sep: char) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth: i32 = 0;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '[' | '{' => depth += 1,
                ']' | '}' => {
                    depth -= 1;
                    if depth < 0 {
                        return None;
                    }
                }
                c if c == sep && depth == 0 => {
                    parts.push(&s[start..i]);
                    start = i + c.len_utf8();
                }
                _ => {}
            },
        }
    }
    if depth != 0 || quote.is_some() {
        return None;
    }
    parts.push(&s[start..]);
    Some(parts)
}

fn split_once_top_level(s: &str, sep: char) -> Option<(&str, &str)> {
    let parts = split_top_level(s, sep)?;
    if parts.len() < 2 {
        return None;
    }
    let key = parts[0];
    Some((key, &s[key.len() + sep.len_utf8()..]))
}

// ---------------------------------------------------------------------------
// Flag functions
// ---------------------------------------------------------------------------

/// Splits a flag function into its name (`None` for the anonymous form) and
/// decoded arguments. Errors when `s` is not function syntax.
pub fn decode_flag_function(s: &str) -> Result<(Option<String>, Vec<Value>)> {
    let (name, args_raw) = split_named_function(s)
        .or_else(|| split_anonymous_function(s))
        .ok_or_else(|| anyhow!("not a function"))?;
    let args = if args_raw.is_empty() {
        Vec::new()
    } else {
        args_raw
            .split(FUNCTION_ARG_DELIM)
            .map(|arg| decode_flag_val(arg.trim()))
            .collect()
    };
    Ok((name, args))
}

pub fn is_flag_function(s: &str) -> bool {
    split_named_function(s).is_some() || split_anonymous_function(s).is_some()
}

fn split_named_function(s: &str) -> Option<(Option<String>, &str)> {
    let open = s.find('[')?;
    let name = &s[..open];
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return None;
    }
    if !s.ends_with(']') || s.len() < open + 2 {
        return None;
    }
    Some((Some(name.to_string()), s[open + 1..s.len() - 1].trim()))
}

/// `[a:b]` is a function while `[a, b]` and `[a: b]` are collections.
fn split_anonymous_function(s: &str) -> Option<(Option<String>, &str)> {
    if s.len() < 2 || !s.starts_with('[') || !s.ends_with(']') {
        return None;
    }
    let inner = &s[1..s.len() - 1];
    if !inner.contains(':')
        || inner.contains(',')
        || inner.contains(": ")
        || inner.starts_with('[')
        || inner.starts_with('{')
    {
        return None;
    }
    Some((None, inner))
}

/// Text form of a flag function, as written by an operator.
pub fn flag_function_text(name: Option<&str>, args: &[Value]) -> String {
    let args = args
        .iter()
        .map(encode_flag_val)
        .collect::<Vec<_>>()
        .join(":");
    format!("{}[{}]", name.unwrap_or(""), args)
}

fn expand_sequence(name: &str, args: &[Value]) -> Result<Vec<Value>> {
    match name {
        "range" => expand_range(args),
        "linspace" => expand_linspace(args),
        "logspace" => expand_logspace(args),
        "geomspace" => expand_geomspace(args),
        _ => Err(anyhow!("unsupported sequence function {}", name)),
    }
}

fn numeric_arg(args: &[Value], idx: usize, required: usize) -> Result<Option<f64>> {
    match args.get(idx) {
        None if idx < required => Err(anyhow!("function requires at least {} arg(s)", required)),
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| anyhow!("invalid arg {}: expected a number", encode_flag_val(v))),
    }
}

fn warn_extra_args(name: &str, args: &[Value], max: usize) {
    if args.len() > max {
        let rest: Vec<String> = args[max..].iter().map(encode_flag_val).collect();
        warn!(
            "unsupported arguments for {} function: {} - ignoring",
            name,
            rest.join(", ")
        );
    }
}

fn seq_val(x: f64) -> Value {
    let x = if x > 1e-8 { (x * 1e8).round() / 1e8 } else { x };
    Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
}

fn expand_range(args: &[Value]) -> Result<Vec<Value>> {
    warn_extra_args("range", args, 3);
    let start = numeric_arg(args, 0, 1)?.unwrap_or(0.0);
    let end = numeric_arg(args, 1, 1)?;
    let step = numeric_arg(args, 2, 1)?.unwrap_or(1.0);
    if step == 0.0 {
        return Err(anyhow!("invalid arg 0: step cannot be zero"));
    }
    // A missing end counts from zero to start. A given end is inclusive.
    let (start, end) = match end {
        Some(end) => (start, end + step.min(1.0)),
        None => (0.0, start),
    };
    let all_ints = args.iter().take(3).all(|v| v.is_i64() || v.is_u64());
    let count = ((end - start) / step).ceil();
    if !count.is_finite() || count > MAX_EXPANDED_ITEMS as f64 {
        return Err(anyhow!("range[{}:{}:{}] has too many values", start, end, step));
    }
    if count <= 0.0 {
        return Ok(Vec::new());
    }
    Ok((0..count as usize)
        .map(|i| {
            let x = start + i as f64 * step;
            if all_ints {
                Value::from(x as i64)
            } else {
                seq_val(x)
            }
        })
        .collect())
}

fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count - 1) as f64;
            (0..count).map(|i| start + i as f64 * step).collect()
        }
    }
}

fn count_arg(args: &[Value], idx: usize, required: usize) -> Result<usize> {
    let count = numeric_arg(args, idx, required)?.unwrap_or(5.0);
    if count < 0.0 {
        return Err(anyhow!("invalid arg {}: count must be non-negative", count));
    }
    if !count.is_finite() || count > MAX_EXPANDED_ITEMS as f64 {
        return Err(anyhow!("invalid arg {}: count is too large", count));
    }
    Ok(count as usize)
}

fn expand_linspace(args: &[Value]) -> Result<Vec<Value>> {
    warn_extra_args("linspace", args, 3);
    let start = numeric_arg(args, 0, 2)?.unwrap_or_default();
    let end = numeric_arg(args, 1, 2)?.unwrap_or_default();
    let count = count_arg(args, 2, 2)?;
    Ok(linspace(start, end, count).into_iter().map(seq_val).collect())
}

fn expand_logspace(args: &[Value]) -> Result<Vec<Value>> {
    warn_extra_args("logspace", args, 4);
    let start = numeric_arg(args, 0, 2)?.unwrap_or_default();
    let end = numeric_arg(args, 1, 2)?.unwrap_or_default();
    let count = count_arg(args, 2, 2)?;
    let base = numeric_arg(args, 3, 2)?.unwrap_or(10.0);
    Ok(linspace(start, end, count)
        .into_iter()
        .map(|x| seq_val(base.powf(x)))
        .collect())
}

fn expand_geomspace(args: &[Value]) -> Result<Vec<Value>> {
    warn_extra_args("geomspace", args, 3);
    let start = numeric_arg(args, 0, 2)?.unwrap_or_default();
    let end = numeric_arg(args, 1, 2)?.unwrap_or_default();
    let count = count_arg(args, 2, 2)?;
    if start == 0.0 || end == 0.0 || start.signum() != end.signum() {
        return Err(anyhow!("geomspace bounds must be non-zero with the same sign"));
    }
    let sign = start.signum();
    Ok(linspace(start.abs().ln(), end.abs().ln(), count)
        .into_iter()
        .map(|x| seq_val(sign * x.exp()))
        .collect())
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// Encodes a value for display. Floats may be truncated to `truncate_floats`
/// decimal digits; strings containing spaces are quoted.
pub fn format_flag(val: &Value, truncate_floats: Option<usize>) -> String {
    let mut encoded = encode_flag_val(val);
    if let (Some(len), Value::Number(n)) = (truncate_floats, val) {
        if n.is_f64() {
            encoded = truncate_formatted_float(&encoded, len);
        }
    }
    match val {
        Value::String(_) if !encoded.starts_with('\'') && encoded.contains(' ') => quote(&encoded),
        _ => encoded,
    }
}

fn truncate_formatted_float(s: &str, trunc_len: usize) -> String {
    let mut out = String::with_capacity(s.len());
    let mut digits_kept: Option<usize> = None;
    for c in s.chars() {
        match (c, digits_kept) {
            ('.', _) => {
                digits_kept = Some(0);
                out.push(c);
            }
            (d, Some(n)) if d.is_ascii_digit() => {
                if n < trunc_len {
                    out.push(d);
                }
                digits_kept = Some(n + 1);
            }
            _ => {
                digits_kept = None;
                out.push(c);
            }
        }
    }
    out
}

pub fn flag_assign(name: &str, val: &Value, truncate_floats: Option<usize>) -> String {
    format!("{}={}", name, format_flag(val, truncate_floats))
}

/// `NAME=VALUE` strings sorted by name.
pub fn flag_assigns(flags: &Flags, truncate_floats: Option<usize>) -> Vec<String> {
    flags
        .iter()
        .map(|(name, val)| flag_assign(name, val, truncate_floats))
        .collect()
}

pub fn flags_desc(flags: &Flags) -> String {
    flag_assigns(flags, None).join(", ")
}

/// Default run label: non-null flags as `NAME=VALUE`, floats truncated.
pub fn default_label(flags: &Flags) -> String {
    let non_null: Flags = flags
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    flag_assigns(&non_null, Some(DEFAULT_FLOAT_TRUNC_LEN)).join(" ")
}

/// Renders `${name}` references in `template`. `${default_label}` expands to
/// [`default_label`]; references to missing or null flags render empty.
pub fn render_label(template: Option<&str>, flags: &Flags) -> String {
    let default = default_label(flags);
    let Some(template) = template else {
        return default;
    };
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = after[..end].trim();
                if name == "default_label" {
                    out.push_str(&default);
                } else if let Some(val) = flags.get(name).filter(|v| !v.is_null()) {
                    out.push_str(&format_flag(val, Some(DEFAULT_FLOAT_TRUNC_LEN)));
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(v: Value) {
        let encoded = encode_flag_val(&v);
        assert_eq!(decode_flag_val(&encoded), v, "encoded as {encoded:?}");
    }

    #[test]
    fn encodes_scalars() {
        assert_eq!(encode_flag_val(&json!(true)), "yes");
        assert_eq!(encode_flag_val(&json!(false)), "no");
        assert_eq!(encode_flag_val(&Value::Null), "null");
        assert_eq!(encode_flag_val(&json!(3)), "3");
        assert_eq!(encode_flag_val(&json!(0.1)), "0.1");
        assert_eq!(encode_flag_val(&json!(1.0)), "1.0");
        assert_eq!(encode_flag_val(&json!("abc")), "abc");
        assert_eq!(encode_flag_val(&json!([1, "a", true])), "[1, a, yes]");
    }

    #[test]
    fn numeric_looking_strings_are_quoted() {
        assert_eq!(encode_flag_val(&json!("123")), "'123'");
        assert_eq!(encode_flag_val(&json!("yes")), "'yes'");
        assert_eq!(encode_flag_val(&json!("null")), "'null'");
        assert_eq!(decode_flag_val("'123'"), json!("123"));
    }

    #[test]
    fn round_trips_supported_types() {
        roundtrip(json!(true));
        roundtrip(json!(false));
        roundtrip(Value::Null);
        roundtrip(json!(42));
        roundtrip(json!(-7));
        roundtrip(json!(0.001));
        roundtrip(json!(1e-12));
        roundtrip(json!(2.0));
        roundtrip(json!("hello world"));
        roundtrip(json!("it's"));
        roundtrip(json!("1.5"));
        roundtrip(json!(""));
        roundtrip(json!([1, 2.5, "a,b", null, [true, "no"]]));
        roundtrip(json!({"a": 1, "b": {"c": "x y", "d": [1, 2]}}));
    }

    #[test]
    fn decodes_strings_and_numbers() {
        assert_eq!(decode_flag_val("1"), json!(1));
        assert_eq!(decode_flag_val("1.5"), json!(1.5));
        assert_eq!(decode_flag_val("1e-3"), json!(0.001));
        assert_eq!(decode_flag_val("no"), json!(false));
        assert_eq!(decode_flag_val("abc"), json!("abc"));
        assert_eq!(decode_flag_val(""), json!(""));
        assert_eq!(decode_flag_val("inf"), json!("inf"));
    }

    #[test]
    fn underscore_and_colon_numbers_stay_strings() {
        assert_eq!(decode_flag_val("1_000"), json!("1_000"));
        assert_eq!(decode_flag_val("1:12"), json!("1:12"));
        assert_eq!(decode_flag_val("1e2_3"), json!("1e2_3"));
    }

    #[test]
    fn decodes_flag_functions_as_strings() {
        assert_eq!(decode_flag_val("[1:2]"), json!("[1:2]"));
        assert_eq!(decode_flag_val("uniform[0.1:0.5]"), json!("uniform[0.1:0.5]"));
        assert_eq!(decode_flag_val("loguniform[1e-5:1e-1]"), json!("loguniform[1e-5:1e-1]"));

        let (name, args) = decode_flag_function("[1:2]").expect("anonymous function");
        assert_eq!(name, None);
        assert_eq!(args, vec![json!(1), json!(2)]);

        let (name, args) = decode_flag_function("loguniform[1e-5:0.1:0.01]").expect("named");
        assert_eq!(name.as_deref(), Some("loguniform"));
        assert_eq!(args, vec![json!(1e-5), json!(0.1), json!(0.01)]);

        assert!(decode_flag_function("[1, 2]").is_err());
        assert!(decode_flag_function("abc").is_err());
        assert!(!is_flag_function("[a: 1]"));
    }

    #[test]
    fn expands_sequences() {
        assert_eq!(decode_flag_val("range[1:3]"), json!([1, 2, 3]));
        assert_eq!(decode_flag_val("range[0:10:5]"), json!([0, 5, 10]));
        assert_eq!(decode_flag_val("range[3]"), json!([0, 1, 2]));
        assert_eq!(decode_flag_val("linspace[0:1:3]"), json!([0.0, 0.5, 1.0]));
        assert_eq!(decode_flag_val("logspace[0:2:3]"), json!([1.0, 10.0, 100.0]));
        assert_eq!(decode_flag_val("geomspace[1:100:3]"), json!([1.0, 10.0, 100.0]));
    }

    #[test]
    fn invalid_sequence_args_decode_to_text() {
        assert_eq!(decode_flag_val("range[a:3]"), json!("range[a:3]"));
    }

    #[test]
    fn oversized_sequences_decode_to_text() {
        assert_eq!(decode_flag_val("range[0:1e300]"), json!("range[0:1e300]"));
        assert_eq!(decode_flag_val("range[1e300]"), json!("range[1e300]"));
        assert_eq!(decode_flag_val("linspace[0:1:1e300]"), json!("linspace[0:1:1e300]"));
        assert_eq!(decode_flag_val("logspace[0:1:1e12]"), json!("logspace[0:1:1e12]"));
    }

    #[test]
    fn expands_concatenated_lists() {
        assert_eq!(decode_flag_val("[1]*3"), json!([1, 1, 1]));
        assert_eq!(decode_flag_val("[1, 2] * 2"), json!([1, 2, 1, 2]));
    }

    #[test]
    fn oversized_repetition_decodes_to_text() {
        assert_eq!(
            decode_flag_val("[1, 2]*9223372036854775808"),
            json!("[1, 2]*9223372036854775808")
        );
        assert_eq!(decode_flag_val("[1]*1000001"), json!("[1]*1000001"));
    }

    #[test]
    fn decodes_collections() {
        assert_eq!(decode_flag_val("[0.01, 0.1]"), json!([0.01, 0.1]));
        assert_eq!(decode_flag_val("[]"), json!([]));
        assert_eq!(decode_flag_val("{a: 1, b: [x, y]}"), json!({"a": 1, "b": ["x", "y"]}));
        assert_eq!(decode_flag_val("[a: 1]"), json!([{"a": 1}]));
    }

    #[test]
    fn unparseable_text_decodes_to_itself() {
        assert_eq!(decode_flag_val("[1, 2"), json!("[1, 2"));
        assert_eq!(decode_flag_val("a]b"), json!("a]b"));
    }

    #[test]
    fn formats_labels() {
        let mut flags = Flags::new();
        flags.insert("lr".into(), json!(0.0123456789));
        flags.insert("name".into(), json!("a b"));
        flags.insert("skip".into(), Value::Null);
        flags.insert("epochs".into(), json!(10));
        assert_eq!(default_label(&flags), "epochs=10 lr=0.01234 name='a b'");
        assert_eq!(
            render_label(Some("run-${epochs} (${default_label}) ${missing}"), &flags),
            "run-10 (epochs=10 lr=0.01234 name='a b') "
        );
        assert_eq!(flags_desc(&flags), "epochs=10, lr=0.0123456789, name='a b', skip=null");
    }
}
