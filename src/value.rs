//! Dynamic values seen by template expressions at runtime.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::eval::EvalError;
use crate::expression::format_number;
use crate::reactive::{Property, Publisher};

pub type NativeFn = Rc<dyn Fn(Vec<Value>) -> Result<Value, EvalError>>;
pub type ObjectMap = IndexMap<String, Value>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<ObjectMap>>),
    Function(NativeFn),
    Property(Property<Value>),
    Publisher(Publisher<Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(Rc::new(RefCell::new(
            entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        )))
    }

    pub fn function(f: impl Fn(Vec<Value>) -> Result<Value, EvalError> + 'static) -> Self {
        Value::Function(Rc::new(f))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    /// A `Property` yields its current value; everything else is returned as is.
    pub fn unwrap_property(&self) -> Value {
        match self {
            Value::Property(prop) => prop.get(),
            other => other.clone(),
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) => "function",
            _ => "object",
        }
    }

    /// `===`
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Property(a), Value::Property(b)) => a.ptr_eq(b),
            (Value::Publisher(a), Value::Publisher(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// `==` for the primitive cases templates use.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (a, b) if a.is_nullish() || b.is_nullish() => false,
            (Value::Number(_), Value::String(_))
            | (Value::String(_), Value::Number(_))
            | (Value::Bool(_), _)
            | (_, Value::Bool(_)) => self.to_number() == other.to_number(),
            _ => self.strict_eq(other),
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse().unwrap_or(f64::NAN)
                }
            }
            Value::Property(prop) => prop.get().to_number(),
            Value::Array(items) => {
                let items = items.borrow();
                match items.len() {
                    0 => 0.0,
                    1 => items[0].to_number(),
                    _ => f64::NAN,
                }
            }
            _ => f64::NAN,
        }
    }

    /// JavaScript `String(value)`.
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) => s.clone(),
            Value::Array(items) => items
                .borrow()
                .iter()
                .map(|v| if v.is_nullish() { String::new() } else { v.to_js_string() })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) | Value::Publisher(_) => "[object Object]".to_string(),
            Value::Function(_) => "function () { [native code] }".to_string(),
            Value::Property(prop) => prop.get().to_js_string(),
        }
    }

    /// Text-marker formatting: nullish renders empty, objects render as JSON.
    pub fn format_text(&self) -> String {
        match self {
            Value::Undefined | Value::Null => String::new(),
            Value::Array(_) | Value::Object(_) => self.to_json_string(),
            Value::Property(prop) => prop.get().format_text(),
            other => other.to_js_string(),
        }
    }

    pub fn to_json(&self) -> Option<serde_json::Value> {
        use serde_json::Value as Json;
        match self {
            Value::Undefined | Value::Function(_) => None,
            Value::Null => Some(Json::Null),
            Value::Bool(b) => Some(Json::Bool(*b)),
            Value::Number(n) => Some(number_to_json(*n)),
            Value::String(s) => Some(Json::String(s.clone())),
            Value::Array(items) => Some(Json::Array(
                items
                    .borrow()
                    .iter()
                    .map(|v| v.to_json().unwrap_or(Json::Null))
                    .collect(),
            )),
            Value::Object(map) => Some(Json::Object(
                map.borrow()
                    .iter()
                    .filter_map(|(k, v)| v.to_json().map(|j| (k.clone(), j)))
                    .collect(),
            )),
            Value::Property(prop) => prop.get().to_json(),
            Value::Publisher(_) => Some(Json::Object(Default::default())),
        }
    }

    /// `JSON.stringify(value)`; `undefined` and functions stringify to `undefined`.
    pub fn to_json_string(&self) -> String {
        match self.to_json() {
            Some(json) => serde_json::to_string(&json).unwrap_or_default(),
            None => "undefined".to_string(),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::object(map.iter().map(|(k, v)| (k.clone(), Value::from_json(v)))),
        }
    }

    /// Snapshot of array items, `None` for non-arrays.
    pub fn as_array(&self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items.borrow().clone()),
            Value::Property(prop) => prop.get().as_array(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Plain member read. Reading through a `Property` reads its value.
    pub fn get_member(&self, name: &str) -> Result<Value, EvalError> {
        match self {
            Value::Undefined | Value::Null => Err(EvalError::Type(format!(
                "Cannot read properties of {} (reading '{}')",
                self.to_js_string(),
                name
            ))),
            Value::Property(prop) => match name {
                "value" => Ok(prop.get()),
                _ => prop.get().get_member(name),
            },
            Value::Object(map) => Ok(map.borrow().get(name).cloned().unwrap_or_default()),
            Value::Array(items) => {
                let items = items.borrow();
                if name == "length" {
                    return Ok(Value::Number(items.len() as f64));
                }
                Ok(name
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or_default())
            }
            Value::String(s) => {
                if name == "length" {
                    return Ok(Value::Number(s.encode_utf16().count() as f64));
                }
                Ok(name
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or_default())
            }
            _ => Ok(Value::Undefined),
        }
    }

    pub fn set_member(&self, name: &str, value: Value) -> Result<(), EvalError> {
        match self {
            Value::Object(map) => {
                map.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            Value::Array(items) => {
                let mut items = items.borrow_mut();
                match name.parse::<usize>() {
                    Ok(i) => {
                        if i >= items.len() {
                            items.resize(i + 1, Value::Undefined);
                        }
                        items[i] = value;
                        Ok(())
                    }
                    Err(_) if name == "length" => {
                        let len = value.to_number();
                        if len >= 0.0 && len.fract() == 0.0 {
                            items.resize(len as usize, Value::Undefined);
                            Ok(())
                        } else {
                            Err(EvalError::Type("Invalid array length".to_string()))
                        }
                    }
                    Err(_) => Ok(()),
                }
            }
            Value::Property(prop) if name == "value" => {
                prop.set_value(value);
                Ok(())
            }
            Value::Undefined | Value::Null => Err(EvalError::Type(format!(
                "Cannot set properties of {} (setting '{}')",
                self.to_js_string(),
                name
            ))),
            _ => Ok(()),
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if !n.is_finite() {
        return serde_json::Value::Null;
    }
    if n == n.trunc() && n.abs() < 9_007_199_254_740_992.0 {
        return serde_json::Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.strict_eq(other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Function(_) => write!(f, "[function]"),
            Value::Property(prop) => write!(f, "Property({:?})", prop.get()),
            Value::Publisher(_) => write!(f, "[publisher]"),
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other.to_json_string()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Undefined.truthy());
        assert!(!Value::Number(0.0).truthy());
        assert!(!Value::Number(f64::NAN).truthy());
        assert!(!Value::from("").truthy());
        assert!(Value::from("0").truthy());
        assert!(Value::array(vec![]).truthy());
    }

    #[test]
    fn test_strict_and_loose_equality() {
        assert_eq!(Value::from("a"), Value::from("a"));
        assert_ne!(Value::from(1), Value::from("1"));
        assert!(Value::from(1).loose_eq(&Value::from("1")));
        assert!(Value::Null.loose_eq(&Value::Undefined));
        assert!(!Value::Null.loose_eq(&Value::from(0)));

        let a = Value::array(vec![]);
        assert_eq!(a, a.clone());
        assert_ne!(a, Value::array(vec![]));
    }

    #[test]
    fn test_text_formatting() {
        assert_eq!(Value::Null.format_text(), "");
        assert_eq!(Value::Undefined.format_text(), "");
        assert_eq!(Value::from(3).format_text(), "3");
        assert_eq!(Value::from(2.5).format_text(), "2.5");
        assert_eq!(Value::from(false).format_text(), "false");
        assert_eq!(
            Value::object([("a", Value::from(1)), ("b", Value::array(vec![Value::Null]))]).format_text(),
            r#"{"a":1,"b":[null]}"#
        );
    }

    #[test]
    fn test_json_round_trip_keeps_order() {
        let json = json!({"z": 1, "a": [true, "x"]});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json_string(), r#"{"z":1,"a":[true,"x"]}"#);
    }

    #[test]
    fn test_member_access() {
        let item = Value::object([("title", Value::from("Hi"))]);
        assert_eq!(item.get_member("title").unwrap(), Value::from("Hi"));
        assert_eq!(item.get_member("missing").unwrap(), Value::Undefined);
        assert_eq!(Value::from("abc").get_member("length").unwrap(), Value::from(3));
        assert!(matches!(
            Value::Undefined.get_member("x"),
            Err(EvalError::Type(_))
        ));

        let prop = Property::new(Value::object([("n", Value::from(1))]));
        let wrapped = Value::Property(prop);
        assert_eq!(wrapped.get_member("n").unwrap(), Value::from(1));
    }
}
