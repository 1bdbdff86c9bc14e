//! Builtin helper functions available to every template.
//!
//! These cover comparison, strings, lists, dictionaries, encoding and dates.
//! Argument order follows the pipeline convention of the helpers authors
//! already know: the value being operated on comes last, so
//! `{{ var "name" | upper | trimSuffix "-svc" }}` works.
//!
//! Helpers are pure; anything that needs I/O is provided by the caller's
//! [`super::Functions`] table instead.

use anyhow::{Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use super::value::{as_i64, compare, loosely_equal, to_text, truthy, type_name};

/// Names of every builtin, used for lookups and "did you mean" suggestions.
pub const BUILTIN_NAMES: &[&str] = &[
    "eq", "ne", "lt", "le", "gt", "ge", "and", "or", "not", "len", "index", "print", "printf",
    "println", "upper", "lower", "title", "trim", "trimAll", "trimPrefix", "trimSuffix",
    "replace", "contains", "hasPrefix", "hasSuffix", "split", "splitList", "join", "repeat",
    "quote", "squote", "substr", "list", "first", "last", "append", "uniq", "has", "dict", "get",
    "hasKey", "keys", "default", "empty", "coalesce", "ternary", "toJson", "toRawJson",
    "toPrettyJson", "fromJson", "b64enc", "b64dec", "urlquery", "now", "date", "unixEpoch",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

/// Call builtin `name`. Returns `None` when no such builtin exists.
pub fn call(name: &str, args: Vec<Value>) -> Option<Result<Value>> {
    let result = match name {
        "eq" => eq(&args),
        "ne" => arity(&args, 2, name).map(|_| Value::Bool(!loosely_equal(&args[0], &args[1]))),
        "lt" => ordered(&args, name, |o| o.is_lt()),
        "le" => ordered(&args, name, |o| o.is_le()),
        "gt" => ordered(&args, name, |o| o.is_gt()),
        "ge" => ordered(&args, name, |o| o.is_ge()),
        "and" => Ok(and(args)),
        "or" => Ok(or(args)),
        "not" => arity(&args, 1, name).map(|_| Value::Bool(!truthy(&args[0]))),
        "len" => arity(&args, 1, name).and_then(|_| len(&args[0])),
        "index" => index(args),
        "print" => Ok(Value::String(print(&args))),
        "println" => Ok(Value::String(format!(
            "{}\n",
            args.iter().map(to_text).collect::<Vec<_>>().join(" ")
        ))),
        "printf" => printf(&args),
        "upper" => text1(&args, name, |s| s.to_uppercase()),
        "lower" => text1(&args, name, |s| s.to_lowercase()),
        "title" => text1(&args, name, title),
        "trim" => text1(&args, name, |s| s.trim().to_string()),
        "trimAll" => text2(&args, name, |cut, s| {
            s.trim_matches(|c| cut.contains(c)).to_string()
        }),
        "trimPrefix" => text2(&args, name, |prefix, s| {
            s.strip_prefix(prefix).unwrap_or(s).to_string()
        }),
        "trimSuffix" => text2(&args, name, |suffix, s| {
            s.strip_suffix(suffix).unwrap_or(s).to_string()
        }),
        "replace" => arity(&args, 3, name).map(|_| {
            Value::String(to_text(&args[2]).replace(&to_text(&args[0]), &to_text(&args[1])))
        }),
        "contains" => bool2(&args, name, |needle, s| s.contains(needle)),
        "hasPrefix" => bool2(&args, name, |prefix, s| s.starts_with(prefix)),
        "hasSuffix" => bool2(&args, name, |suffix, s| s.ends_with(suffix)),
        "split" | "splitList" => arity(&args, 2, name).map(|_| {
            let sep = to_text(&args[0]);
            let text = to_text(&args[1]);
            Value::Array(text.split(sep.as_str()).map(|p| Value::String(p.to_string())).collect())
        }),
        "join" => arity(&args, 2, name).and_then(|_| {
            let items = as_list(&args[1], name)?;
            let joined = items.iter().map(to_text).collect::<Vec<_>>().join(&to_text(&args[0]));
            Ok(Value::String(joined))
        }),
        "repeat" => arity(&args, 2, name).and_then(|_| {
            let count = as_i64(&args[0]).ok_or_else(|| anyhow!("repeat: count must be a number"))?;
            Ok(Value::String(to_text(&args[1]).repeat(count.max(0) as usize)))
        }),
        "quote" => Ok(Value::String(
            args.iter().map(|a| format!("{:?}", to_text(a))).collect::<Vec<_>>().join(" "),
        )),
        "squote" => Ok(Value::String(
            args.iter().map(|a| format!("'{}'", to_text(a))).collect::<Vec<_>>().join(" "),
        )),
        "substr" => substr(&args),
        "list" => Ok(Value::Array(args)),
        "first" => arity(&args, 1, name).and_then(|_| {
            as_list(&args[0], name).map(|l| l.first().cloned().unwrap_or(Value::Null))
        }),
        "last" => arity(&args, 1, name).and_then(|_| {
            as_list(&args[0], name).map(|l| l.last().cloned().unwrap_or(Value::Null))
        }),
        "append" => arity(&args, 2, name).and_then(|_| {
            let mut items = as_list(&args[0], name)?.clone();
            items.push(args[1].clone());
            Ok(Value::Array(items))
        }),
        "uniq" => arity(&args, 1, name).and_then(|_| {
            let mut out: Vec<Value> = Vec::new();
            for item in as_list(&args[0], name)? {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
            Ok(Value::Array(out))
        }),
        "has" => arity(&args, 2, name).and_then(|_| {
            Ok(Value::Bool(as_list(&args[1], name)?.iter().any(|v| loosely_equal(v, &args[0]))))
        }),
        "dict" => dict(args),
        "get" => arity(&args, 2, name).and_then(|_| {
            Ok(as_map(&args[0], name)?.get(&to_text(&args[1])).cloned().unwrap_or(Value::Null))
        }),
        "hasKey" => arity(&args, 2, name).and_then(|_| {
            Ok(Value::Bool(as_map(&args[0], name)?.contains_key(&to_text(&args[1]))))
        }),
        "keys" => arity(&args, 1, name).and_then(|_| {
            let mut keys: Vec<String> = as_map(&args[0], name)?.keys().cloned().collect();
            keys.sort();
            Ok(Value::Array(keys.into_iter().map(Value::String).collect()))
        }),
        "default" => default(args),
        "empty" => arity(&args, 1, name).map(|_| Value::Bool(!truthy(&args[0]))),
        "coalesce" => Ok(args.into_iter().find(truthy).unwrap_or(Value::Null)),
        "ternary" => arity(&args, 3, name).map(|_| {
            if truthy(&args[2]) {
                args[0].clone()
            } else {
                args[1].clone()
            }
        }),
        "toJson" | "toRawJson" => arity(&args, 1, name)
            .and_then(|_| Ok(Value::String(serde_json::to_string(&args[0])?))),
        "toPrettyJson" => arity(&args, 1, name)
            .and_then(|_| Ok(Value::String(serde_json::to_string_pretty(&args[0])?))),
        "fromJson" => arity(&args, 1, name)
            .and_then(|_| serde_json::from_str(&to_text(&args[0])).map_err(Into::into)),
        "b64enc" => text1(&args, name, |s| BASE64.encode(s.as_bytes())),
        "b64dec" => arity(&args, 1, name).and_then(|_| {
            let bytes = BASE64.decode(to_text(&args[0]).as_bytes())?;
            Ok(Value::String(String::from_utf8(bytes)?))
        }),
        "urlquery" => Ok(Value::String(
            url::form_urlencoded::byte_serialize(print(&args).as_bytes()).collect(),
        )),
        "now" => Ok(Value::String(Utc::now().to_rfc3339())),
        "date" => date(&args),
        "unixEpoch" => args
            .first()
            .map_or_else(|| Ok(Utc::now()), parse_time)
            .map(|time| Value::from(time.timestamp())),
        _ => return None,
    };
    Some(result)
}

fn arity(args: &[Value], expected: usize, name: &str) -> Result<()> {
    if args.len() != expected {
        bail!("{name}: expected {expected} argument(s), got {}", args.len());
    }
    Ok(())
}

fn text1(args: &[Value], name: &str, f: impl Fn(&str) -> String) -> Result<Value> {
    arity(args, 1, name)?;
    Ok(Value::String(f(&to_text(&args[0]))))
}

fn text2(args: &[Value], name: &str, f: impl Fn(&str, &str) -> String) -> Result<Value> {
    arity(args, 2, name)?;
    Ok(Value::String(f(&to_text(&args[0]), &to_text(&args[1]))))
}

fn bool2(args: &[Value], name: &str, f: impl Fn(&str, &str) -> bool) -> Result<Value> {
    arity(args, 2, name)?;
    Ok(Value::Bool(f(&to_text(&args[0]), &to_text(&args[1]))))
}

fn as_list<'v>(value: &'v Value, name: &str) -> Result<&'v Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => bail!("{name}: expected a list, got {}", type_name(other)),
    }
}

fn as_map<'v>(value: &'v Value, name: &str) -> Result<&'v Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("{name}: expected a map, got {}", type_name(other)),
    }
}

fn eq(args: &[Value]) -> Result<Value> {
    let Some((first, rest)) = args.split_first() else {
        bail!("eq: missing arguments");
    };
    if rest.is_empty() {
        bail!("eq: missing argument for comparison");
    }
    Ok(Value::Bool(rest.iter().any(|other| loosely_equal(first, other))))
}

fn ordered(
    args: &[Value],
    name: &str,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<Value> {
    arity(args, 2, name)?;
    let ordering = compare(&args[0], &args[1]).ok_or_else(|| {
        anyhow!(
            "{name}: incompatible types for comparison: {} and {}",
            type_name(&args[0]),
            type_name(&args[1])
        )
    })?;
    Ok(Value::Bool(accept(ordering)))
}

/// `and` returns the first falsy argument, or the last one.
fn and(args: Vec<Value>) -> Value {
    let mut last = Value::Bool(true);
    for arg in args {
        if !truthy(&arg) {
            return arg;
        }
        last = arg;
    }
    last
}

/// `or` returns the first truthy argument, or the last one.
fn or(args: Vec<Value>) -> Value {
    let mut last = Value::Bool(false);
    for arg in args {
        if truthy(&arg) {
            return arg;
        }
        last = arg;
    }
    last
}

fn len(value: &Value) -> Result<Value> {
    let n = match value {
        Value::String(s) => s.len(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        Value::Null => 0,
        other => bail!("len of type {}", type_name(other)),
    };
    Ok(Value::from(n))
}

fn index(args: Vec<Value>) -> Result<Value> {
    let mut iter = args.into_iter();
    let Some(mut current) = iter.next() else {
        bail!("index: missing collection");
    };
    for key in iter {
        current = match &current {
            Value::Array(items) => {
                let i = as_i64(&key).ok_or_else(|| anyhow!("index: non-integer slice index"))?;
                usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| anyhow!("index: index out of range: {i}"))?
            }
            Value::Object(map) => map.get(&to_text(&key)).cloned().unwrap_or(Value::Null),
            Value::Null => Value::Null,
            other => bail!("index: can't index item of type {}", type_name(other)),
        };
    }
    Ok(current)
}

/// Go's `print`: spaces only between operands when neither is a string.
fn print(args: &[Value]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 && !arg.is_string() && !args[i - 1].is_string() {
            out.push(' ');
        }
        out.push_str(&to_text(arg));
    }
    out
}

fn printf(args: &[Value]) -> Result<Value> {
    let Some((format, rest)) = args.split_first() else {
        bail!("printf: missing format");
    };
    let format = to_text(format);
    let mut operands = rest.iter();
    let mut out = String::new();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let Some(verb) = chars.next() else {
            out.push('%');
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let Some(operand) = operands.next() else {
            out.push_str(&format!("%!{verb}(MISSING)"));
            continue;
        };
        match verb {
            's' | 'v' => out.push_str(&to_text(operand)),
            'q' => out.push_str(&format!("{:?}", to_text(operand))),
            'd' => match as_i64(operand) {
                Some(n) => out.push_str(&n.to_string()),
                None => out.push_str(&format!("%!d({})", to_text(operand))),
            },
            'f' => match operand.as_f64() {
                Some(f) => out.push_str(&format!("{f:.6}")),
                None => out.push_str(&format!("%!f({})", to_text(operand))),
            },
            't' => out.push_str(&truthy(operand).to_string()),
            other => out.push_str(&format!("%!{other}({})", to_text(operand))),
        }
    }
    Ok(Value::String(out))
}

fn title(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for c in s.chars() {
        if at_word_start && c.is_alphabetic() {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_word_start = !c.is_alphanumeric();
    }
    out
}

fn substr(args: &[Value]) -> Result<Value> {
    arity(args, 3, "substr")?;
    let text: Vec<char> = to_text(&args[2]).chars().collect();
    let start = as_i64(&args[0]).unwrap_or(0).max(0) as usize;
    let end = match as_i64(&args[1]) {
        Some(e) if e >= 0 => (e as usize).min(text.len()),
        _ => text.len(),
    };
    if start >= end {
        return Ok(Value::String(String::new()));
    }
    Ok(Value::String(text[start..end].iter().collect()))
}

fn dict(args: Vec<Value>) -> Result<Value> {
    let mut map = Map::new();
    let mut iter = args.into_iter();
    while let Some(key) = iter.next() {
        let value = iter.next().unwrap_or(Value::String(String::new()));
        map.insert(to_text(&key), value);
    }
    Ok(Value::Object(map))
}

/// `default DEFAULT [GIVEN]`: GIVEN unless it is empty.
fn default(args: Vec<Value>) -> Result<Value> {
    let mut iter = args.into_iter();
    let Some(fallback) = iter.next() else {
        bail!("default: missing default value");
    };
    match iter.next() {
        Some(given) if truthy(&given) => Ok(given),
        _ => Ok(fallback),
    }
}

fn parse_time(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_i64().ok_or_else(|| anyhow!("invalid epoch seconds {n}"))?;
            Utc.timestamp_opt(secs, 0).single().ok_or_else(|| anyhow!("invalid epoch seconds {n}"))
        }
        Value::String(s) => Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc)),
        other => bail!("expected a time, got {}", type_name(other)),
    }
}

/// `date LAYOUT [TIME]` using reference-time layouts (`2006-01-02 15:04:05`).
fn date(args: &[Value]) -> Result<Value> {
    let Some(layout) = args.first() else {
        bail!("date: missing layout");
    };
    let time = match args.get(1) {
        Some(v) => parse_time(v)?,
        None => Utc::now(),
    };
    Ok(Value::String(time.format(&layout_to_strftime(&to_text(layout))).to_string()))
}

/// Translate a reference-time layout into a strftime pattern.
fn layout_to_strftime(layout: &str) -> String {
    const TOKENS: &[(&str, &str)] = &[
        ("2006", "%Y"),
        ("-0700", "%z"),
        ("Monday", "%A"),
        ("January", "%B"),
        ("MST", "%Z"),
        ("Mon", "%a"),
        ("Jan", "%b"),
        ("01", "%m"),
        ("02", "%d"),
        ("15", "%H"),
        ("03", "%I"),
        ("04", "%M"),
        ("05", "%S"),
        ("PM", "%p"),
        ("06", "%y"),
    ];
    let mut out = String::new();
    let mut rest = layout;
    'outer: while !rest.is_empty() {
        for (token, replacement) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            if c == '%' {
                out.push_str("%%");
            } else {
                out.push(c);
            }
        }
        rest = chars.as_str();
    }
    out
}
