// Built-in Functions for Block Scripts
// Comparison, logic, string, conversion and numeric helpers

use crate::model::Value;
use crate::script::evaluator::{as_numbers, values_equal, EvalError};

/// Registry of built-in functions. Names match case-insensitively.
pub struct BuiltinFunctions;

impl BuiltinFunctions {
    pub fn new() -> Self {
        Self
    }

    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        match name.to_lowercase().as_str() {
            // Comparison
            "eq" => self.binary(args, "eq", |a, b| Ok(Value::Bool(values_equal(a, b)))),
            "ne" => self.binary(args, "ne", |a, b| Ok(Value::Bool(!values_equal(a, b)))),
            "lt" => self.compare(args, "lt", |a, b| a < b),
            "le" => self.compare(args, "le", |a, b| a <= b),
            "gt" => self.compare(args, "gt", |a, b| a > b),
            "ge" => self.compare(args, "ge", |a, b| a >= b),
            "in" => self.fn_in(args).map(Value::Bool),
            "notin" => self.fn_in(args).map(|found| Value::Bool(!found)),

            // Logic
            "and" => Ok(Value::Bool(args.iter().all(Value::is_truthy))),
            "or" => Ok(Value::Bool(args.iter().any(Value::is_truthy))),
            "not" => {
                self.require_args(&args, 1, "not")?;
                Ok(Value::Bool(!args[0].is_truthy()))
            }
            "xor" => self.binary(args, "xor", |a, b| {
                Ok(Value::Bool(a.is_truthy() ^ b.is_truthy()))
            }),

            // Strings
            "contains" => self.fn_contains(args),
            "startswith" => self.binary(args, "startsWith", |a, b| {
                Ok(Value::Bool(a.as_string().starts_with(&b.as_string())))
            }),
            "endswith" => self.binary(args, "endsWith", |a, b| {
                Ok(Value::Bool(a.as_string().ends_with(&b.as_string())))
            }),
            "format" => self.fn_format(args),
            "join" => self.fn_join(args),
            "replace" => {
                self.require_args(&args, 3, "replace")?;
                Ok(Value::String(
                    args[0]
                        .as_string()
                        .replace(&args[1].as_string(), &args[2].as_string()),
                ))
            }
            "split" => self.binary(args, "split", |a, b| {
                Ok(Value::Array(
                    a.as_string()
                        .split(b.as_string().as_str())
                        .map(Value::from)
                        .collect(),
                ))
            }),
            "lower" => self.unary(args, "lower", |v| Ok(Value::String(v.as_string().to_lowercase()))),
            "upper" => self.unary(args, "upper", |v| Ok(Value::String(v.as_string().to_uppercase()))),
            "trim" => self.unary(args, "trim", |v| {
                Ok(Value::String(v.as_string().trim().to_string()))
            }),

            // Conversion
            "converttojson" => self.unary(args, "convertToJson", |v| Ok(Value::String(v.to_json()))),
            "isnumeric" => self.unary(args, "isNumeric", |v| Ok(Value::Bool(v.as_number().is_some()))),
            "int" => self.unary(args, "int", |v| {
                to_number(v, "int").map(|n| Value::Number(n.trunc()))
            }),
            "float" => self.unary(args, "float", |v| to_number(v, "float").map(Value::Number)),
            "str" => self.unary(args, "str", |v| Ok(Value::String(v.as_string()))),

            // Numeric
            "abs" => self.unary(args, "abs", |v| to_number(v, "abs").map(|n| Value::Number(n.abs()))),
            "min" => self.fold_numbers(args, "min", f64::min),
            "max" => self.fold_numbers(args, "max", f64::max),

            // Utility
            "coalesce" => Ok(args
                .into_iter()
                .find(|arg| match arg {
                    Value::Null => false,
                    Value::String(s) => !s.is_empty(),
                    _ => true,
                })
                .unwrap_or_default()),
            "iif" => {
                self.require_args(&args, 3, "iif")?;
                let mut args = args;
                let branch = if args[0].is_truthy() { 1 } else { 2 };
                Ok(args.swap_remove(branch))
            }
            "length" => self.unary(args, "length", |v| match v {
                Value::String(s) => Ok(Value::Number(s.chars().count() as f64)),
                Value::Array(items) => Ok(Value::Number(items.len() as f64)),
                Value::Object(map) => Ok(Value::Number(map.len() as f64)),
                _ => Err(EvalError::new("length() requires string, array, or object")),
            }),

            _ => Err(EvalError::new(format!("unknown function: {}", name))),
        }
    }

    fn unary(
        &self,
        args: Vec<Value>,
        name: &str,
        f: impl FnOnce(&Value) -> Result<Value, EvalError>,
    ) -> Result<Value, EvalError> {
        self.require_args(&args, 1, name)?;
        f(&args[0])
    }

    fn binary(
        &self,
        args: Vec<Value>,
        name: &str,
        f: impl FnOnce(&Value, &Value) -> Result<Value, EvalError>,
    ) -> Result<Value, EvalError> {
        self.require_args(&args, 2, name)?;
        f(&args[0], &args[1])
    }

    fn compare(
        &self,
        args: Vec<Value>,
        name: &str,
        op: impl FnOnce(f64, f64) -> bool,
    ) -> Result<Value, EvalError> {
        self.binary(args, name, |a, b| {
            let (a, b) = as_numbers(a, b)?;
            Ok(Value::Bool(op(a, b)))
        })
    }

    fn fold_numbers(
        &self,
        args: Vec<Value>,
        name: &str,
        op: fn(f64, f64) -> f64,
    ) -> Result<Value, EvalError> {
        // min([1, 2]) and min(1, 2) are both accepted
        let values = match <[Value; 1]>::try_from(args) {
            Ok([Value::Array(items)]) => items,
            Ok(single) => Vec::from(single),
            Err(args) => args,
        };
        let mut numbers = values.iter().map(|v| to_number(v, name));
        let first = numbers
            .next()
            .ok_or_else(|| EvalError::new(format!("{}() requires at least 1 argument", name)))??;
        numbers
            .try_fold(first, |acc, n| n.map(|n| op(acc, n)))
            .map(Value::Number)
    }

    fn fn_in(&self, args: Vec<Value>) -> Result<bool, EvalError> {
        let Some((needle, haystack)) = args.split_first() else {
            return Err(EvalError::new("in() requires at least 2 arguments"));
        };
        if haystack.is_empty() {
            return Err(EvalError::new("in() requires at least 2 arguments"));
        }
        Ok(haystack.iter().any(|v| values_equal(needle, v)))
    }

    fn fn_contains(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 2, "contains")?;
        match (&args[0], &args[1]) {
            (Value::Array(items), needle) => {
                Ok(Value::Bool(items.iter().any(|item| values_equal(item, needle))))
            }
            (Value::Object(map), key) => Ok(Value::Bool(map.contains_key(&key.as_string()))),
            (haystack, needle) => Ok(Value::Bool(
                haystack.as_string().contains(&needle.as_string()),
            )),
        }
    }

    /// format('{0} of {1}', a, b)
    fn fn_format(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        let Some((template, rest)) = args.split_first() else {
            return Err(EvalError::new("format() requires at least 1 argument"));
        };
        let mut result = template.as_string();
        for (i, arg) in rest.iter().enumerate() {
            result = result.replace(&format!("{{{}}}", i), &arg.as_string());
        }
        Ok(Value::String(result))
    }

    fn fn_join(&self, args: Vec<Value>) -> Result<Value, EvalError> {
        self.require_args(&args, 2, "join")?;
        let Value::Array(items) = &args[0] else {
            return Err(EvalError::new("join() requires array as first argument"));
        };
        let parts: Vec<String> = items.iter().map(Value::as_string).collect();
        Ok(Value::String(parts.join(&args[1].as_string())))
    }

    fn require_args(&self, args: &[Value], count: usize, name: &str) -> Result<(), EvalError> {
        if args.len() != count {
            return Err(EvalError::new(format!(
                "{}() requires {} argument(s), got {}",
                name,
                count,
                args.len()
            )));
        }
        Ok(())
    }
}

impl Default for BuiltinFunctions {
    fn default() -> Self {
        Self::new()
    }
}

fn to_number(value: &Value, name: &str) -> Result<f64, EvalError> {
    match value {
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => other.as_number().ok_or_else(|| {
            EvalError::new(format!("{}() cannot convert {} to a number", name, other.to_json()))
        }),
    }
}
