// Block Script Evaluator
// Evaluates expression trees against a block's variable bindings

use crate::model::Value;
use crate::script::functions::BuiltinFunctions;
use crate::script::parser::{BinaryOp, Expr, UnaryOp};

use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub message: String,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Expression evaluator over a snapshot of variables
pub struct Evaluator<'a> {
    variables: &'a HashMap<String, Value>,
    functions: BuiltinFunctions,
}

impl<'a> Evaluator<'a> {
    pub fn new(variables: &'a HashMap<String, Value>) -> Self {
        Self {
            variables,
            functions: BuiltinFunctions::new(),
        }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),

            Expr::Variable(name) => self
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::new(format!("unknown variable '{}'", name))),

            Expr::Call { name, args } => {
                let values = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.functions.call(name, values)
            }

            Expr::Index { object, index } => {
                let obj = self.eval(object)?;
                let idx = self.eval(index)?;
                eval_index(&obj, &idx)
            }

            Expr::Member { object, property } => {
                let obj = self.eval(object)?;
                eval_member(&obj, property)
            }

            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                    UnaryOp::Neg => value
                        .as_number()
                        .map(|n| Value::Number(-n))
                        .ok_or_else(|| EvalError::new("cannot negate non-number")),
                }
            }

            // && and || short-circuit
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => {
                if !self.eval(left)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }
            Expr::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                if self.eval(left)?.is_truthy() {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(self.eval(right)?.is_truthy()))
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                eval_binary(*op, &left, &right)
            }

            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                if self.eval(condition)?.is_truthy() {
                    self.eval(then_expr)
                } else {
                    self.eval(else_expr)
                }
            }

            Expr::Array(items) => items
                .iter()
                .map(|e| self.eval(e))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),

            Expr::Object(pairs) => {
                let mut map = HashMap::new();
                for (key, value_expr) in pairs {
                    map.insert(key.clone(), self.eval(value_expr)?);
                }
                Ok(Value::Object(map))
            }
        }
    }
}

fn eval_index(object: &Value, index: &Value) -> Result<Value, EvalError> {
    match (object, index) {
        (Value::Array(items), Value::Number(n)) => items
            .get(position(*n)?)
            .cloned()
            .ok_or_else(|| EvalError::new(format!("array index {} out of bounds", n))),
        (Value::Object(map), key) => Ok(map.get(&key.as_string()).cloned().unwrap_or_default()),
        (Value::String(s), Value::Number(n)) => s
            .chars()
            .nth(position(*n)?)
            .map(|c| Value::String(c.to_string()))
            .ok_or_else(|| EvalError::new(format!("string index {} out of bounds", n))),
        _ => Err(EvalError::new(format!(
            "cannot index {} with {}",
            object.to_json(),
            index.to_json()
        ))),
    }
}

/// Whole, non-negative numbers only
fn position(n: f64) -> Result<usize, EvalError> {
    if n < 0.0 || n.fract() != 0.0 || !n.is_finite() {
        return Err(EvalError::new(format!("invalid index {}", n)));
    }
    Ok(n as usize)
}

fn eval_member(object: &Value, property: &str) -> Result<Value, EvalError> {
    match object {
        Value::Object(map) => Ok(map.get(property).cloned().unwrap_or_default()),
        Value::Array(items) if property == "length" => Ok(Value::Number(items.len() as f64)),
        Value::String(s) if property == "length" => Ok(Value::Number(s.chars().count() as f64)),
        _ => Err(EvalError::new(format!(
            "cannot access property '{}' on {}",
            property,
            object.to_json()
        ))),
    }
}

fn eval_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Add => eval_add(left, right),
        BinaryOp::Sub => numeric(left, right, |a, b| a - b),
        BinaryOp::Mul => numeric(left, right, |a, b| a * b),
        BinaryOp::Div => {
            if right.as_number() == Some(0.0) {
                return Err(EvalError::new("division by zero"));
            }
            numeric(left, right, |a, b| a / b)
        }
        BinaryOp::Mod => numeric(left, right, |a, b| a % b),
        BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinaryOp::Lt => compare(left, right, |a, b| a < b),
        BinaryOp::Le => compare(left, right, |a, b| a <= b),
        BinaryOp::Gt => compare(left, right, |a, b| a > b),
        BinaryOp::Ge => compare(left, right, |a, b| a >= b),
        BinaryOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
    }
}

/// Numbers add; anything involving a string concatenates
fn eval_add(left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
        (Value::String(a), b) => Ok(Value::String(format!("{}{}", a, b.as_string()))),
        (a, Value::String(b)) => Ok(Value::String(format!("{}{}", a.as_string(), b))),
        (Value::Array(a), Value::Array(b)) => {
            Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
        }
        _ => Err(EvalError::new(format!(
            "cannot add {} and {}",
            left.to_json(),
            right.to_json()
        ))),
    }
}

fn numeric(left: &Value, right: &Value, op: impl FnOnce(f64, f64) -> f64) -> Result<Value, EvalError> {
    let (a, b) = as_numbers(left, right)?;
    Ok(Value::Number(op(a, b)))
}

fn compare(left: &Value, right: &Value, op: impl FnOnce(f64, f64) -> bool) -> Result<Value, EvalError> {
    let (a, b) = as_numbers(left, right)?;
    Ok(Value::Bool(op(a, b)))
}

pub(crate) fn as_numbers(left: &Value, right: &Value) -> Result<(f64, f64), EvalError> {
    let a = left
        .as_number()
        .ok_or_else(|| EvalError::new(format!("{} is not a number", left.to_json())))?;
    let b = right
        .as_number()
        .ok_or_else(|| EvalError::new(format!("{} is not a number", right.to_json())))?;
    Ok((a, b))
}

/// Equality with numeric and boolean coercion of text. String comparison is
/// case-sensitive.
pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => (a - b).abs() < f64::EPSILON,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Number(a), s @ Value::String(_)) | (s @ Value::String(_), Value::Number(a)) => s
            .as_number()
            .map(|n| (a - n).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::Bool(a), s @ Value::String(_)) | (s @ Value::String(_), Value::Bool(a)) => {
            s.as_bool() == Some(*a)
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parser::ScriptParser;

    fn variables() -> HashMap<String, Value> {
        let mut vars = HashMap::new();
        vars.insert("X".to_string(), Value::Number(5.0));
        vars.insert("Y".to_string(), Value::Number(10.0));
        vars.insert("Name".to_string(), Value::String("block".to_string()));
        vars.insert(
            "Items".to_string(),
            Value::Array(vec![Value::Number(10.0), Value::Number(20.0)]),
        );
        vars.insert(
            "Dims".to_string(),
            Value::Object(HashMap::from([
                ("w".to_string(), Value::Number(2.0)),
                ("h".to_string(), Value::Number(5.0)),
            ])),
        );
        vars
    }

    fn eval(input: &str) -> Result<Value, EvalError> {
        let vars = variables();
        let expr = ScriptParser::parse_expr(input).unwrap();
        Evaluator::new(&vars).eval(&expr)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("X + Y").unwrap(), Value::Number(15.0));
        assert_eq!(eval("Y / X - 1").unwrap(), Value::Number(1.0));
        assert_eq!(eval("Y % 3").unwrap(), Value::Number(1.0));
        assert_eq!(eval("-X").unwrap(), Value::Number(-5.0));
        assert_eq!(eval("Dims.w * Dims['h']").unwrap(), Value::Number(10.0));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(
            eval("Name + '-' + X").unwrap(),
            Value::String("block-5".to_string())
        );
    }

    #[test]
    fn test_comparison_and_logic() {
        assert_eq!(eval("X < Y && Y >= 10").unwrap(), Value::Bool(true));
        assert_eq!(eval("X == '5'").unwrap(), Value::Bool(true));
        assert_eq!(eval("Name == 'Block'").unwrap(), Value::Bool(false));
        assert_eq!(eval("!(X > Y)").unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_short_circuit_skips_unknown_variable() {
        assert_eq!(eval("true || Missing").unwrap(), Value::Bool(true));
        assert_eq!(eval("false && Missing").unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_ternary() {
        assert_eq!(
            eval("X > 3 ? 'big' : 'small'").unwrap(),
            Value::String("big".to_string())
        );
    }

    #[test]
    fn test_unknown_variable() {
        let err = eval("Missing + 1").unwrap_err();
        assert!(err.message.contains("Missing"));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(eval("X / 0").is_err());
    }

    #[test]
    fn test_numeric_op_on_text_fails() {
        assert!(eval("Name * 2").is_err());
    }

    #[test]
    fn test_index_must_be_whole_and_non_negative() {
        assert_eq!(eval("Items[1]").unwrap(), Value::Number(20.0));
        assert_eq!(eval("Name[0]").unwrap(), Value::String("b".to_string()));

        let err = eval("Items[-1]").unwrap_err();
        assert!(err.message.contains("invalid index"));
        assert!(eval("Items[0.5]").is_err());
        assert!(eval("Name[1.7]").is_err());
        assert!(eval("Items[2]").unwrap_err().message.contains("out of bounds"));
    }
}
