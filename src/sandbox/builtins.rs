//! Builtin functions available to every snippet.
//!
//! Builtins are pure functions of their arguments, except for `print` and
//! `eprint` which write to the execution's captured output. Non-mutating
//! builtins listed in [`METHODS`] can also be called in method form,
//! `xs.len()` being the same as `len(xs)`.

use std::cmp::Ordering;

use super::interpreter::{check_collection, check_string, Fault};
use super::output::OutputCapture;
use super::value::Value;

pub const BUILTINS: &[&str] = &[
    "print",
    "eprint",
    "len",
    "str",
    "int",
    "float",
    "bool",
    "type",
    "range",
    "abs",
    "min",
    "max",
    "sum",
    "round",
    "sorted",
    "reversed",
    "enumerate",
    "zip",
    "keys",
    "values",
    "items",
    "get",
    "join",
    "split",
    "upper",
    "lower",
    "strip",
    "replace",
    "contains",
    "starts_with",
    "ends_with",
    "append",
    "slice",
    "to_json",
    "from_json",
    "fail",
];

/// Builtins that accept their first argument as a method receiver.
pub const METHODS: &[&str] = &[
    "len",
    "str",
    "int",
    "float",
    "bool",
    "abs",
    "min",
    "max",
    "sum",
    "round",
    "sorted",
    "reversed",
    "enumerate",
    "keys",
    "values",
    "items",
    "get",
    "join",
    "split",
    "upper",
    "lower",
    "strip",
    "replace",
    "contains",
    "starts_with",
    "ends_with",
    "slice",
    "to_json",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

pub fn is_method(name: &str) -> bool {
    METHODS.contains(&name)
}

type Result<T> = std::result::Result<T, Fault>;

pub fn call(name: &str, args: Vec<Value>, output: &OutputCapture) -> Result<Value> {
    match name {
        "print" | "eprint" => {
            let mut line = args
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            line.push('\n');
            if name == "print" {
                output.write_stdout(&line);
            } else {
                output.write_stderr(&line);
            }
            Ok(Value::Null)
        }
        "len" => {
            arity(name, &args, 1, 1)?;
            let len = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.len(),
                Value::Map(map) => map.len(),
                other => return Err(type_error(name, "a string, list or map", other)),
            };
            Ok(Value::Int(len as i64))
        }
        "str" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Str(args[0].to_string()))
        }
        "int" => {
            arity(name, &args, 1, 1)?;
            to_int(&args[0]).map(Value::Int)
        }
        "float" => {
            arity(name, &args, 1, 1)?;
            let n = match &args[0] {
                Value::Int(n) => *n as f64,
                Value::Float(n) => *n,
                Value::Bool(b) => f64::from(u8::from(*b)),
                Value::Str(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| Fault::runtime(format!("cannot convert {s:?} to float")))?,
                other => return Err(type_error(name, "a number or string", other)),
            };
            Ok(Value::Float(n))
        }
        "bool" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(args[0].truthy()))
        }
        "type" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Str(args[0].type_name().to_string()))
        }
        "range" => range(&args),
        "abs" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Int(n) => n
                    .checked_abs()
                    .map(Value::Int)
                    .ok_or_else(|| Fault::runtime("integer overflow")),
                Value::Float(n) => Ok(Value::Float(n.abs())),
                other => Err(type_error(name, "a number", other)),
            }
        }
        "min" | "max" => extreme(name, args),
        "sum" => {
            arity(name, &args, 1, 1)?;
            let mut total = Value::Int(0);
            for item in list_arg(name, &args[0])? {
                total = match (&total, item) {
                    (Value::Int(a), Value::Int(b)) => Value::Int(
                        a.checked_add(*b)
                            .ok_or_else(|| Fault::runtime("integer overflow"))?,
                    ),
                    (a, b) => match (a.as_f64(), b.as_f64()) {
                        (Some(x), Some(y)) => Value::Float(x + y),
                        _ => return Err(type_error(name, "a list of numbers", b)),
                    },
                };
            }
            Ok(total)
        }
        "round" => {
            arity(name, &args, 1, 2)?;
            let digits = match args.get(1) {
                Some(d) => Some(int_arg(name, d)?),
                None => None,
            };
            match (&args[0], digits) {
                (Value::Int(n), _) => Ok(Value::Int(*n)),
                (Value::Float(n), None) => {
                    to_int(&Value::Float(n.round())).map(Value::Int)
                }
                (Value::Float(n), Some(d)) => {
                    let factor = 10f64.powi(d.clamp(-300, 300) as i32);
                    Ok(Value::Float((n * factor).round() / factor))
                }
                (other, _) => Err(type_error(name, "a number", other)),
            }
        }
        "sorted" => {
            arity(name, &args, 1, 1)?;
            let mut items = list_arg(name, &args[0])?.to_vec();
            let mut incomparable = None;
            items.sort_by(|a, b| {
                a.compare(b).unwrap_or_else(|| {
                    incomparable.get_or_insert((a.type_name(), b.type_name()));
                    Ordering::Equal
                })
            });
            if let Some((a, b)) = incomparable {
                return Err(Fault::runtime(format!("sorted(): cannot compare {a} and {b}")));
            }
            Ok(Value::List(items))
        }
        "reversed" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::List(items) => Ok(Value::List(items.iter().rev().cloned().collect())),
                Value::Str(s) => Ok(Value::Str(s.chars().rev().collect())),
                other => Err(type_error(name, "a list or string", other)),
            }
        }
        "enumerate" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::List(
                list_arg(name, &args[0])?
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Value::List(vec![Value::Int(i as i64), v.clone()]))
                    .collect(),
            ))
        }
        "zip" => {
            arity(name, &args, 2, 2)?;
            let a = list_arg(name, &args[0])?;
            let b = list_arg(name, &args[1])?;
            Ok(Value::List(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| Value::List(vec![x.clone(), y.clone()]))
                    .collect(),
            ))
        }
        "keys" | "values" | "items" => {
            arity(name, &args, 1, 1)?;
            let Value::Map(map) = &args[0] else {
                return Err(type_error(name, "a map", &args[0]));
            };
            let out = map
                .iter()
                .map(|(k, v)| match name {
                    "keys" => Value::Str(k.clone()),
                    "values" => v.clone(),
                    _ => Value::List(vec![Value::Str(k.clone()), v.clone()]),
                })
                .collect();
            Ok(Value::List(out))
        }
        "get" => {
            arity(name, &args, 2, 3)?;
            let Value::Map(map) = &args[0] else {
                return Err(type_error(name, "a map", &args[0]));
            };
            let key = str_arg(name, &args[1])?;
            Ok(map
                .get(key)
                .cloned()
                .unwrap_or_else(|| args.get(2).cloned().unwrap_or(Value::Null)))
        }
        "join" => {
            arity(name, &args, 1, 2)?;
            // Accept both `join(list, sep)` and `join(sep, list)`.
            let (items, sep) = match (&args[0], args.get(1)) {
                (Value::Str(sep), Some(Value::List(items))) => (items.as_slice(), sep.as_str()),
                (list, sep) => (
                    list_arg(name, list)?,
                    match sep {
                        Some(s) => str_arg(name, s)?,
                        None => "",
                    },
                ),
            };
            let mut out = String::new();
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(sep);
                }
                out.push_str(&item.to_string());
                check_string(out.len())?;
            }
            Ok(Value::Str(out))
        }
        "split" => {
            arity(name, &args, 1, 2)?;
            let s = str_arg(name, &args[0])?;
            let parts: Vec<Value> = match args.get(1) {
                None | Some(Value::Null) => s
                    .split_whitespace()
                    .map(|p| Value::Str(p.to_string()))
                    .collect(),
                Some(sep) => {
                    let sep = str_arg(name, sep)?;
                    if sep.is_empty() {
                        return Err(Fault::runtime("split(): separator must not be empty"));
                    }
                    s.split(sep).map(|p| Value::Str(p.to_string())).collect()
                }
            };
            check_collection(parts.len())?;
            Ok(Value::List(parts))
        }
        "upper" | "lower" | "strip" => {
            arity(name, &args, 1, 1)?;
            let s = str_arg(name, &args[0])?;
            Ok(Value::Str(match name {
                "upper" => s.to_uppercase(),
                "lower" => s.to_lowercase(),
                _ => s.trim().to_string(),
            }))
        }
        "replace" => {
            arity(name, &args, 3, 3)?;
            let s = str_arg(name, &args[0])?;
            let from = str_arg(name, &args[1])?;
            let to = str_arg(name, &args[2])?;
            let occurrences = if from.is_empty() {
                s.chars().count() + 1
            } else {
                s.matches(from).count()
            };
            check_string(s.len() + occurrences.saturating_mul(to.len()))?;
            Ok(Value::Str(s.replace(from, to)))
        }
        "contains" => {
            arity(name, &args, 2, 2)?;
            contains(&args[0], &args[1]).map(Value::Bool)
        }
        "starts_with" | "ends_with" => {
            arity(name, &args, 2, 2)?;
            let s = str_arg(name, &args[0])?;
            let affix = str_arg(name, &args[1])?;
            Ok(Value::Bool(if name == "starts_with" {
                s.starts_with(affix)
            } else {
                s.ends_with(affix)
            }))
        }
        "append" => {
            arity(name, &args, 2, 2)?;
            let mut items = list_arg(name, &args[0])?.to_vec();
            check_collection(items.len() + 1)?;
            items.push(args[1].clone());
            Ok(Value::List(items))
        }
        "slice" => {
            arity(name, &args, 2, 3)?;
            let start = int_arg(name, &args[1])?;
            let end = match args.get(2) {
                None | Some(Value::Null) => None,
                Some(end) => Some(int_arg(name, end)?),
            };
            match &args[0] {
                Value::List(items) => {
                    let (a, b) = bounds(items.len(), start, end);
                    Ok(Value::List(items[a..b].to_vec()))
                }
                Value::Str(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let (a, b) = bounds(chars.len(), start, end);
                    Ok(Value::Str(chars[a..b].iter().collect()))
                }
                other => Err(type_error(name, "a list or string", other)),
            }
        }
        "to_json" => {
            arity(name, &args, 1, 1)?;
            let json = args[0].to_json().map_err(Fault::runtime)?;
            serde_json::to_string(&json)
                .map(Value::Str)
                .map_err(|e| Fault::runtime(e.to_string()))
        }
        "from_json" => {
            arity(name, &args, 1, 1)?;
            let text = str_arg(name, &args[0])?;
            serde_json::from_str(text)
                .map(Value::from_json)
                .map_err(|e| Fault::runtime(format!("invalid JSON: {e}")))
        }
        "fail" => {
            let message = args
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            Err(Fault::runtime(if message.is_empty() {
                "fail() called".to_string()
            } else {
                message
            }))
        }
        other => Err(Fault::runtime(format!("`{other}` is not a builtin"))),
    }
}

/// Membership test shared by `contains()` and the `in` operator.
pub fn contains(haystack: &Value, needle: &Value) -> Result<bool> {
    match haystack {
        Value::List(items) => Ok(items.contains(needle)),
        Value::Str(s) => match needle {
            Value::Str(sub) => Ok(s.contains(sub.as_str())),
            other => Err(Fault::runtime(format!(
                "cannot search a string for a {}",
                other.type_name()
            ))),
        },
        Value::Map(map) => match needle {
            Value::Str(key) => Ok(map.contains_key(key)),
            _ => Ok(false),
        },
        other => Err(Fault::runtime(format!(
            "a {} does not support membership tests",
            other.type_name()
        ))),
    }
}

fn range(args: &[Value]) -> Result<Value> {
    arity("range", args, 1, 3)?;
    let ints = args
        .iter()
        .map(|a| int_arg("range", a))
        .collect::<Result<Vec<_>>>()?;
    let (start, stop, step) = match ints[..] {
        [stop] => (0, stop, 1),
        [start, stop] => (start, stop, 1),
        [start, stop, step] => (start, stop, step),
        _ => return Err(Fault::runtime("range() takes 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(Fault::runtime("range() step must not be zero"));
    }

    let (start, stop, step) = (i128::from(start), i128::from(stop), i128::from(step));
    let len = if step > 0 && stop > start {
        (stop - start + step - 1) / step
    } else if step < 0 && start > stop {
        (start - stop - step - 1) / -step
    } else {
        0
    };
    check_collection(usize::try_from(len).unwrap_or(usize::MAX))?;
    Ok(Value::List(
        (0..len)
            .map(|i| Value::Int((start + i * step) as i64))
            .collect(),
    ))
}

fn extreme(name: &str, args: Vec<Value>) -> Result<Value> {
    let candidates = match <[Value; 1]>::try_from(args) {
        Ok([Value::List(items)]) => items,
        Ok([other]) => return Err(type_error(name, "a list or several values", &other)),
        Err(args) => args,
    };
    let mut iter = candidates.into_iter();
    let mut best = iter
        .next()
        .ok_or_else(|| Fault::runtime(format!("{name}() of an empty sequence")))?;
    for candidate in iter {
        let ordering = candidate.compare(&best).ok_or_else(|| {
            Fault::runtime(format!(
                "{name}(): cannot compare {} and {}",
                candidate.type_name(),
                best.type_name()
            ))
        })?;
        let better = if name == "min" {
            ordering == Ordering::Less
        } else {
            ordering == Ordering::Greater
        };
        if better {
            best = candidate;
        }
    }
    Ok(best)
}

fn to_int(value: &Value) -> Result<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Float(n) => {
            let t = n.trunc();
            if t.is_finite() && t >= i64::MIN as f64 && t < i64::MAX as f64 {
                Ok(t as i64)
            } else {
                Err(Fault::runtime(format!("cannot convert {n} to int")))
            }
        }
        Value::Str(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| Fault::runtime(format!("cannot convert {s:?} to int"))),
        other => Err(type_error("int", "a number or string", other)),
    }
}

/// Resolves Python-style slice bounds against a length.
fn bounds(len: usize, start: i64, end: Option<i64>) -> (usize, usize) {
    let resolve = |i: i64| -> usize {
        if i < 0 {
            len.saturating_sub(i.unsigned_abs() as usize)
        } else {
            (i as usize).min(len)
        }
    };
    let a = resolve(start);
    let b = end.map_or(len, resolve);
    (a, b.max(a))
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<()> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min}")
        } else {
            format!("{min} to {max}")
        };
        return Err(Fault::runtime(format!(
            "{name}() takes {expected} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn type_error(name: &str, expected: &str, got: &Value) -> Fault {
    Fault::runtime(format!(
        "{name}() expects {expected}, got {}",
        got.type_name()
    ))
}

fn str_arg<'a>(name: &str, value: &'a Value) -> Result<&'a str> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(type_error(name, "a string", other)),
    }
}

fn int_arg(name: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(type_error(name, "an int", other)),
    }
}

fn list_arg<'a>(name: &str, value: &'a Value) -> Result<&'a [Value]> {
    match value {
        Value::List(items) => Ok(items),
        other => Err(type_error(name, "a list", other)),
    }
}
