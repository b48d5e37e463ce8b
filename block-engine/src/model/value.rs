// Block Values
// Dynamic values carried by variables, plus the closed data-type family

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Declared data type of a block variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    Decimal,
    #[default]
    String,
    Object,
}

impl DataType {
    /// Closed numeric family: integers of any width, float, double, decimal
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Int8
                | DataType::Int16
                | DataType::Int32
                | DataType::Int64
                | DataType::UInt8
                | DataType::UInt16
                | DataType::UInt32
                | DataType::UInt64
                | DataType::Float
                | DataType::Double
                | DataType::Decimal
        )
    }

    pub fn is_integer(&self) -> bool {
        self.is_numeric() && !matches!(self, DataType::Float | DataType::Double | DataType::Decimal)
    }
}

/// Runtime value stored in cells and passed to scripts
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Value::Null => "".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    (*n as i64).to_string()
                } else {
                    n.to_string()
                }
            }
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => self.to_json(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }

    /// Present a value according to a declared type: numeric-typed text that
    /// parses becomes a number, boolean text becomes a bool. Anything else is
    /// returned untouched.
    pub fn coerce_to(&self, data_type: DataType) -> Value {
        match (data_type, self) {
            (t, Value::String(_)) if t.is_numeric() => match self.as_number() {
                Some(n) => Value::Number(n),
                None => self.clone(),
            },
            (DataType::Bool, Value::String(_)) => match self.as_bool() {
                Some(b) => Value::Bool(b),
                None => self.clone(),
            },
            (DataType::String, Value::Number(_) | Value::Bool(_)) => {
                Value::String(self.as_string())
            }
            _ => self.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_is_truthy() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Number(1.0).is_truthy());
        assert!(!Value::String("".to_string()).is_truthy());
        assert!(Value::String("hello".to_string()).is_truthy());
    }

    #[test]
    fn test_value_as_string() {
        assert_eq!(Value::Null.as_string(), "");
        assert_eq!(Value::Bool(true).as_string(), "true");
        assert_eq!(Value::Number(42.0).as_string(), "42");
        assert_eq!(Value::Number(3.14).as_string(), "3.14");
        assert_eq!(Value::String("hello".to_string()).as_string(), "hello");
    }

    #[test]
    fn test_numeric_family() {
        for t in [
            DataType::Int8,
            DataType::UInt64,
            DataType::Float,
            DataType::Double,
            DataType::Decimal,
        ] {
            assert!(t.is_numeric(), "{:?} should be numeric", t);
        }
        assert!(!DataType::Bool.is_numeric());
        assert!(!DataType::String.is_numeric());
        assert!(!DataType::Object.is_numeric());
        assert!(DataType::Int32.is_integer());
        assert!(!DataType::Double.is_integer());
    }

    #[test]
    fn test_coerce_to_numeric() {
        let v = Value::String(" 12 ".to_string());
        assert_eq!(v.coerce_to(DataType::Int32), Value::Number(12.0));

        let bad = Value::String("abc".to_string());
        assert_eq!(bad.coerce_to(DataType::Int32), bad);

        assert_eq!(
            Value::String("TRUE".to_string()).coerce_to(DataType::Bool),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_value_from_yaml_scalars() {
        let v: Value = serde_yaml::from_str("5").unwrap();
        assert_eq!(v, Value::Number(5.0));
        let v: Value = serde_yaml::from_str("'five'").unwrap();
        assert_eq!(v, Value::String("five".to_string()));
        let v: Value = serde_yaml::from_str("~").unwrap();
        assert_eq!(v, Value::Null);
    }
}
