//! Evaluator for compiled template expressions and handlers.
//!
//! Table sources are parsed once into [`Expr`] trees and wrapped in closures
//! with the `(host, locals)` / `(host, locals, event)` shapes of the generated
//! JavaScript. The evaluated subset follows JavaScript semantics for the
//! operators and built-ins templates use; anything else is an [`EvalError`].

use lazy_static::lazy_static;
use regex::Regex;
use std::rc::Rc;
use tracing::{debug, error, warn};

use crate::expression::{
    format_number, is_global, parse_expression, parse_handler, BinaryOp, Expr, LogicalOp, UnaryOp,
    EVENT_IDENT,
};
use crate::host::HostRef;
use crate::scope::Locals;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("SyntaxError: {0}")]
    Syntax(String),
    #[error("TypeError: {0} is not a function")]
    NotCallable(String),
    #[error("Unknown member: {0}")]
    UnknownMember(String),
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
    #[error("Cannot assign to loop local '{0}'")]
    AssignToLocal(String),
    #[error("TypeError: {0}")]
    Type(String),
}

pub type ExprFn = Rc<dyn Fn(&HostRef, &Locals) -> Result<Value, EvalError>>;
pub type HandlerFn = Rc<dyn Fn(&HostRef, &Locals, Value) -> Result<(), EvalError>>;

lazy_static! {
    static ref FLOAT_PREFIX_RE: Regex =
        Regex::new(r"^[+-]?(Infinity|\d+\.?\d*(?:[eE][+-]?\d+)?|\.\d+(?:[eE][+-]?\d+)?)").unwrap();
}

/// Lower a canonical expression source into an evaluable closure.
pub fn compile_expression(source: &str) -> Result<ExprFn, EvalError> {
    let expr = Rc::new(parse_expression(source).map_err(|e| EvalError::Syntax(e.message))?);
    Ok(Rc::new(move |host: &HostRef, locals: &Locals| {
        Evaluator::new(host, locals, None).eval(&expr)
    }))
}

/// Lower a canonical handler body into an evaluable closure.
pub fn compile_handler(source: &str) -> Result<HandlerFn, EvalError> {
    let stmts = Rc::new(parse_handler(source).map_err(|e| EvalError::Syntax(e.message))?);
    Ok(Rc::new(move |host: &HostRef, locals: &Locals, event: Value| {
        let evaluator = Evaluator::new(host, locals, Some(&event));
        for stmt in stmts.iter() {
            evaluator.eval(stmt)?;
        }
        Ok(())
    }))
}

struct Evaluator<'a> {
    host: &'a HostRef,
    locals: &'a Locals,
    event: Option<&'a Value>,
}

impl<'a> Evaluator<'a> {
    fn new(host: &'a HostRef, locals: &'a Locals, event: Option<&'a Value>) -> Self {
        Evaluator {
            host,
            locals,
            event,
        }
    }

    fn is_local(&self, name: &str) -> bool {
        self.locals.contains_key(name) || (name == EVENT_IDENT && self.event.is_some())
    }

    fn is_global_ref(&self, name: &str) -> bool {
        is_global(name) && !self.is_local(name)
    }

    fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        Ok(self.eval_chain(expr)?.unwrap_or_default())
    }

    fn eval_args(&self, args: &[Expr]) -> Result<Vec<Value>, EvalError> {
        args.iter().map(|a| self.eval(a)).collect()
    }

    /// `None` means an optional chain short-circuited.
    fn eval_chain(&self, expr: &Expr) -> Result<Option<Value>, EvalError> {
        match expr {
            Expr::Member {
                object,
                property,
                optional,
            } => {
                if let Expr::This = object.as_ref() {
                    return Ok(Some(self.host.member(property)));
                }
                if let Expr::Ident(name) = object.as_ref() {
                    if self.is_global_ref(name) {
                        return global_member(name, property).map(Some);
                    }
                }
                let Some(target) = self.eval_chain(object)? else {
                    return Ok(None);
                };
                if *optional && target.is_nullish() {
                    return Ok(None);
                }
                target.get_member(property).map(Some)
            }
            Expr::Index {
                object,
                index,
                optional,
            } => {
                let Some(target) = self.eval_chain(object)? else {
                    return Ok(None);
                };
                if *optional && target.is_nullish() {
                    return Ok(None);
                }
                let key = property_key(&self.eval(index)?);
                target.get_member(&key).map(Some)
            }
            Expr::Call {
                callee,
                args,
                optional,
            } => self.call(callee, args, *optional),
            other => self.eval_plain(other).map(Some),
        }
    }

    fn call(&self, callee: &Expr, args: &[Expr], optional: bool) -> Result<Option<Value>, EvalError> {
        match callee {
            Expr::Member {
                object,
                property,
                optional: member_optional,
            } => {
                if let Expr::This = object.as_ref() {
                    let args = self.eval_args(args)?;
                    return self.host.call_method(property, args).map(Some);
                }
                if let Expr::Ident(name) = object.as_ref() {
                    if self.is_global_ref(name) {
                        let args = self.eval_args(args)?;
                        return call_global_method(name, property, args).map(Some);
                    }
                }
                let Some(receiver) = self.eval_chain(object)? else {
                    return Ok(None);
                };
                if *member_optional && receiver.is_nullish() {
                    return Ok(None);
                }
                if optional && receiver.get_member(property)?.is_nullish() && !has_builtin(&receiver, property) {
                    return Ok(None);
                }
                let args = self.eval_args(args)?;
                call_method(&receiver, property, args).map(Some)
            }
            Expr::Ident(name) if self.is_global_ref(name) => {
                let args = self.eval_args(args)?;
                call_global_function(name, args).map(Some)
            }
            other => {
                let Some(function) = self.eval_chain(other)? else {
                    return Ok(None);
                };
                if optional && function.is_nullish() {
                    return Ok(None);
                }
                let args = self.eval_args(args)?;
                invoke(&function, args, &describe(other)).map(Some)
            }
        }
    }

    fn eval_plain(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Undefined => Ok(Value::Undefined),
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Template { quasis, exprs } => {
                let mut out = String::new();
                for (i, (_, cooked)) in quasis.iter().enumerate() {
                    out.push_str(cooked);
                    if let Some(e) = exprs.get(i) {
                        out.push_str(&self.eval(e)?.to_js_string());
                    }
                }
                Ok(Value::String(out))
            }
            Expr::Ident(name) => Ok(self.lookup(name)),
            Expr::This => Err(EvalError::Type(
                "the component instance cannot be used as a value".to_string(),
            )),
            Expr::Unary { op, arg } => {
                let value = self.eval(arg)?;
                Ok(match op {
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                    UnaryOp::Neg => Value::Number(-value.to_number()),
                    UnaryOp::Plus => Value::Number(value.to_number()),
                    UnaryOp::TypeOf => Value::from(value.type_of()),
                    UnaryOp::Void => Value::Undefined,
                })
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary(*op, &left, &right)
            }
            Expr::Logical { op, left, right } => {
                let left = self.eval(left)?;
                match op {
                    LogicalOp::And if !left.truthy() => Ok(left),
                    LogicalOp::Or if left.truthy() => Ok(left),
                    LogicalOp::Coalesce if !left.is_nullish() => Ok(left),
                    _ => self.eval(right),
                }
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test)?.truthy() {
                    self.eval(consequent)
                } else {
                    self.eval(alternate)
                }
            }
            Expr::Array(items) => Ok(Value::array(self.eval_args(items)?)),
            Expr::Object(entries) => {
                let mut values = Vec::with_capacity(entries.len());
                for (key, value) in entries {
                    values.push((key.clone(), self.eval(value)?));
                }
                Ok(Value::object(values))
            }
            Expr::Assign { target, op, value } => self.assign(target, *op, value),
            Expr::Sequence(exprs) => {
                let mut last = Value::Undefined;
                for e in exprs {
                    last = self.eval(e)?;
                }
                Ok(last)
            }
            Expr::Arrow { params, body } => Ok(self.make_closure(params.clone(), body.as_ref().clone())),
            Expr::Opaque(source) => Err(EvalError::Syntax(format!(
                "unsupported syntax in template expression: {}",
                source
            ))),
            Expr::Member { .. } | Expr::Index { .. } | Expr::Call { .. } => self.eval(expr),
        }
    }

    fn lookup(&self, name: &str) -> Value {
        if name == EVENT_IDENT {
            if let Some(event) = self.event {
                return event.clone();
            }
        }
        if let Some(value) = self.locals.get(name) {
            return value.clone();
        }
        match name {
            "NaN" => Value::Number(f64::NAN),
            "Infinity" => Value::Number(f64::INFINITY),
            _ => Value::Undefined,
        }
    }

    fn make_closure(&self, params: Vec<String>, body: Expr) -> Value {
        let host = self.host.clone();
        let locals = self.locals.clone();
        let event = self.event.cloned();
        Value::function(move |args| {
            let mut scope = locals.clone();
            for (i, param) in params.iter().enumerate() {
                scope.insert(param.clone(), args.get(i).cloned().unwrap_or_default());
            }
            Evaluator::new(&host, &scope, event.as_ref()).eval(&body)
        })
    }

    fn assign(&self, target: &Expr, op: Option<BinaryOp>, value: &Expr) -> Result<Value, EvalError> {
        let rhs = self.eval(value)?;
        let next = match op {
            Some(op) => binary(op, &self.eval(target)?, &rhs)?,
            None => rhs,
        };

        match target {
            Expr::Member {
                object, property, ..
            } => {
                if let Expr::This = object.as_ref() {
                    self.host.set_member(property, next.clone())?;
                } else {
                    self.eval(object)?.set_member(property, next.clone())?;
                }
            }
            Expr::Index { object, index, .. } => {
                let key = property_key(&self.eval(index)?);
                self.eval(object)?.set_member(&key, next.clone())?;
            }
            Expr::Ident(name) if self.is_local(name) => {
                return Err(EvalError::AssignToLocal(name.clone()));
            }
            other => {
                return Err(EvalError::Type(format!(
                    "invalid assignment target: {}",
                    describe(other)
                )))
            }
        }
        Ok(next)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OPERATORS
// ═══════════════════════════════════════════════════════════════════════════════

fn property_key(value: &Value) -> String {
    match value {
        Value::Number(n) => format_number(*n),
        other => other.to_js_string(),
    }
}

fn is_stringish(value: &Value) -> bool {
    matches!(
        value.unwrap_property(),
        Value::String(_) | Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Publisher(_)
    )
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    let num = |f: fn(f64, f64) -> f64| Value::Number(f(left.to_number(), right.to_number()));
    let compare = |f: fn(std::cmp::Ordering) -> bool| -> Value {
        if let (Value::String(a), Value::String(b)) = (left, right) {
            return Value::Bool(f(a.cmp(b)));
        }
        let (a, b) = (left.to_number(), right.to_number());
        Value::Bool(a.partial_cmp(&b).is_some_and(f))
    };

    Ok(match op {
        BinaryOp::Add => {
            if is_stringish(left) || is_stringish(right) {
                Value::String(format!("{}{}", left.to_js_string(), right.to_js_string()))
            } else {
                num(|a, b| a + b)
            }
        }
        BinaryOp::Sub => num(|a, b| a - b),
        BinaryOp::Mul => num(|a, b| a * b),
        BinaryOp::Div => num(|a, b| a / b),
        BinaryOp::Rem => num(|a, b| a % b),
        BinaryOp::Exp => num(f64::powf),
        BinaryOp::Eq => Value::Bool(left.loose_eq(right)),
        BinaryOp::NotEq => Value::Bool(!left.loose_eq(right)),
        BinaryOp::StrictEq => Value::Bool(left.strict_eq(right)),
        BinaryOp::StrictNotEq => Value::Bool(!left.strict_eq(right)),
        BinaryOp::Lt => compare(|o| o.is_lt()),
        BinaryOp::LtEq => compare(|o| o.is_le()),
        BinaryOp::Gt => compare(|o| o.is_gt()),
        BinaryOp::GtEq => compare(|o| o.is_ge()),
        BinaryOp::In => {
            let key = property_key(left);
            match right.unwrap_property() {
                Value::Object(map) => Value::Bool(map.borrow().contains_key(&key)),
                Value::Array(items) => Value::Bool(
                    key == "length" || key.parse::<usize>().is_ok_and(|i| i < items.borrow().len()),
                ),
                other => {
                    return Err(EvalError::Type(format!(
                        "Cannot use 'in' operator to search for '{}' in {}",
                        key,
                        other.to_js_string()
                    )))
                }
            }
        }
    })
}

fn invoke(function: &Value, args: Vec<Value>, name: &str) -> Result<Value, EvalError> {
    match function {
        Value::Function(f) => f(args),
        _ => Err(EvalError::NotCallable(name.to_string())),
    }
}

fn describe(expr: &Expr) -> String {
    crate::expression::print(expr, crate::expression::PrintMode::Canonical)
}

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or_default()
}

/// Resolve a relative `slice` index against `len`.
fn relative_index(value: &Value, len: usize, default: usize) -> usize {
    if matches!(value, Value::Undefined) {
        return default;
    }
    let n = value.to_number();
    let n = if n.is_nan() { 0.0 } else { n.trunc() };
    if n < 0.0 {
        (len as f64 + n).max(0.0) as usize
    } else {
        (n as usize).min(len)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BUILT-IN METHODS
// ═══════════════════════════════════════════════════════════════════════════════

fn has_builtin(receiver: &Value, name: &str) -> bool {
    match receiver.unwrap_property() {
        Value::Array(_) => ARRAY_METHODS.contains(&name),
        Value::String(_) => STRING_METHODS.contains(&name),
        Value::Number(_) => matches!(name, "toFixed" | "toString"),
        _ => false,
    }
}

const ARRAY_METHODS: &[&str] = &[
    "push", "pop", "shift", "unshift", "includes", "indexOf", "join", "slice", "concat",
    "reverse", "map", "filter", "find", "findIndex", "some", "every", "forEach", "reduce", "at",
    "toString",
];

const STRING_METHODS: &[&str] = &[
    "toUpperCase", "toLowerCase", "trim", "trimStart", "trimEnd", "includes", "startsWith",
    "endsWith", "indexOf", "slice", "substring", "split", "replace", "replaceAll", "padStart",
    "padEnd", "charAt", "repeat", "concat", "at", "toString",
];

fn call_method(receiver: &Value, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    match receiver {
        Value::Property(prop) => match name {
            "getValue" => Ok(prop.get()),
            "setValue" => {
                prop.set_value(arg(&args, 0));
                Ok(Value::Undefined)
            }
            _ => call_method(&prop.get(), name, args),
        },
        Value::Publisher(publisher) => match name {
            "emit" => {
                publisher.emit(&arg(&args, 0));
                Ok(Value::Undefined)
            }
            _ => Err(EvalError::UnknownMethod(format!("Publisher.{}", name))),
        },
        Value::Array(items) => array_method(items, name, args),
        Value::String(s) => string_method(s, name, args),
        Value::Number(n) => match name {
            "toFixed" => {
                let digits = arg(&args, 0).to_number();
                let digits = if digits.is_nan() { 0 } else { digits.clamp(0.0, 100.0) as usize };
                Ok(Value::String(format!("{:.*}", digits, n)))
            }
            "toString" => Ok(Value::String(format_number(*n))),
            _ => Err(EvalError::UnknownMethod(format!("Number.{}", name))),
        },
        Value::Object(map) => {
            let member = map.borrow().get(name).cloned();
            match member {
                Some(function @ Value::Function(_)) => invoke(&function, args, name),
                Some(_) => Err(EvalError::NotCallable(name.to_string())),
                None if name == "toString" => Ok(Value::from(receiver.to_js_string())),
                None => Err(EvalError::UnknownMethod(name.to_string())),
            }
        }
        Value::Undefined | Value::Null => Err(EvalError::Type(format!(
            "Cannot read properties of {} (reading '{}')",
            receiver.to_js_string(),
            name
        ))),
        other => match name {
            "toString" => Ok(Value::from(other.to_js_string())),
            _ => Err(EvalError::UnknownMethod(format!("{}.{}", other.type_of(), name))),
        },
    }
}

fn array_method(
    items: &Rc<std::cell::RefCell<Vec<Value>>>,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, EvalError> {
    let callback = |i: usize| -> Result<Value, EvalError> {
        match args.first() {
            Some(f @ Value::Function(_)) => {
                let item = items.borrow().get(i).cloned().unwrap_or_default();
                invoke(f, vec![item, Value::Number(i as f64)], name)
            }
            _ => Err(EvalError::NotCallable(format!("{} callback", name))),
        }
    };
    let len = items.borrow().len();

    match name {
        "push" => {
            let mut items = items.borrow_mut();
            items.extend(args);
            Ok(Value::Number(items.len() as f64))
        }
        "pop" => Ok(items.borrow_mut().pop().unwrap_or_default()),
        "shift" => {
            let mut items = items.borrow_mut();
            if items.is_empty() {
                Ok(Value::Undefined)
            } else {
                Ok(items.remove(0))
            }
        }
        "unshift" => {
            let mut items = items.borrow_mut();
            for (i, value) in args.into_iter().enumerate() {
                items.insert(i, value);
            }
            Ok(Value::Number(items.len() as f64))
        }
        "includes" => {
            let needle = arg(&args, 0);
            Ok(Value::Bool(items.borrow().iter().any(|v| {
                v.strict_eq(&needle)
                    || matches!((v, &needle), (Value::Number(a), Value::Number(b)) if a.is_nan() && b.is_nan())
            })))
        }
        "indexOf" => {
            let needle = arg(&args, 0);
            let index = items.borrow().iter().position(|v| v.strict_eq(&needle));
            Ok(Value::Number(index.map_or(-1.0, |i| i as f64)))
        }
        "join" => {
            let separator = match arg(&args, 0) {
                Value::Undefined => ",".to_string(),
                other => other.to_js_string(),
            };
            Ok(Value::String(
                items
                    .borrow()
                    .iter()
                    .map(|v| if v.is_nullish() { String::new() } else { v.to_js_string() })
                    .collect::<Vec<_>>()
                    .join(&separator),
            ))
        }
        "slice" => {
            let start = relative_index(&arg(&args, 0), len, 0);
            let end = relative_index(&arg(&args, 1), len, len);
            let items = items.borrow();
            Ok(Value::array(if start < end { items[start..end].to_vec() } else { Vec::new() }))
        }
        "concat" => {
            let mut out = items.borrow().clone();
            for value in args {
                match value.as_array() {
                    Some(more) => out.extend(more),
                    None => out.push(value),
                }
            }
            Ok(Value::array(out))
        }
        "reverse" => {
            items.borrow_mut().reverse();
            Ok(Value::Array(items.clone()))
        }
        "at" => {
            let i = arg(&args, 0).to_number().trunc();
            let index = if i < 0.0 { len as f64 + i } else { i };
            Ok(if index < 0.0 {
                Value::Undefined
            } else {
                items.borrow().get(index as usize).cloned().unwrap_or_default()
            })
        }
        "map" => {
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                out.push(callback(i)?);
            }
            Ok(Value::array(out))
        }
        "filter" => {
            let mut out = Vec::new();
            for i in 0..len {
                if callback(i)?.truthy() {
                    out.push(items.borrow()[i].clone());
                }
            }
            Ok(Value::array(out))
        }
        "find" | "findIndex" => {
            for i in 0..len {
                if callback(i)?.truthy() {
                    return Ok(if name == "find" {
                        items.borrow()[i].clone()
                    } else {
                        Value::Number(i as f64)
                    });
                }
            }
            Ok(if name == "find" { Value::Undefined } else { Value::Number(-1.0) })
        }
        "some" => {
            for i in 0..len {
                if callback(i)?.truthy() {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "every" => {
            for i in 0..len {
                if !callback(i)?.truthy() {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        "forEach" => {
            for i in 0..len {
                callback(i)?;
            }
            Ok(Value::Undefined)
        }
        "reduce" => {
            let f = arg(&args, 0);
            let snapshot = items.borrow().clone();
            let mut iter = snapshot.into_iter().enumerate();
            let mut acc = match args.get(1) {
                Some(initial) => initial.clone(),
                None => match iter.next() {
                    Some((_, first)) => first,
                    None => {
                        return Err(EvalError::Type(
                            "Reduce of empty array with no initial value".to_string(),
                        ))
                    }
                },
            };
            for (i, item) in iter {
                acc = invoke(&f, vec![acc, item, Value::Number(i as f64)], "reduce")?;
            }
            Ok(acc)
        }
        "toString" => Ok(Value::String(Value::Array(items.clone()).to_js_string())),
        _ => Err(EvalError::UnknownMethod(format!("Array.{}", name))),
    }
}

fn string_method(s: &str, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let text = |i: usize| arg(&args, i).to_js_string();
    let pad = |at_start: bool| -> Value {
        let target = arg(&args, 0).to_number();
        let fill = match arg(&args, 1) {
            Value::Undefined => " ".to_string(),
            other => other.to_js_string(),
        };
        if target.is_nan() || target as usize <= len || fill.is_empty() {
            return Value::from(s);
        }
        let padding: String = fill.chars().cycle().take(target as usize - len).collect();
        Value::String(if at_start {
            format!("{}{}", padding, s)
        } else {
            format!("{}{}", s, padding)
        })
    };

    Ok(match name {
        "toUpperCase" => Value::String(s.to_uppercase()),
        "toLowerCase" => Value::String(s.to_lowercase()),
        "trim" => Value::from(s.trim()),
        "trimStart" => Value::from(s.trim_start()),
        "trimEnd" => Value::from(s.trim_end()),
        "includes" => Value::Bool(s.contains(text(0).as_str())),
        "startsWith" => Value::Bool(s.starts_with(text(0).as_str())),
        "endsWith" => Value::Bool(s.ends_with(text(0).as_str())),
        "indexOf" => {
            let needle = text(0);
            Value::Number(match s.find(&needle) {
                Some(byte) => s[..byte].chars().count() as f64,
                None => -1.0,
            })
        }
        "slice" => {
            let start = relative_index(&arg(&args, 0), len, 0);
            let end = relative_index(&arg(&args, 1), len, len);
            Value::String(if start < end { chars[start..end].iter().collect() } else { String::new() })
        }
        "substring" => {
            let clamp = |v: Value, default: usize| -> usize {
                if matches!(v, Value::Undefined) {
                    return default;
                }
                let n = v.to_number();
                if n.is_nan() || n < 0.0 {
                    0
                } else {
                    (n as usize).min(len)
                }
            };
            let a = clamp(arg(&args, 0), 0);
            let b = clamp(arg(&args, 1), len);
            let (start, end) = if a <= b { (a, b) } else { (b, a) };
            Value::String(chars[start..end].iter().collect())
        }
        "split" => match arg(&args, 0) {
            Value::Undefined => Value::array(vec![Value::from(s)]),
            separator => {
                let separator = separator.to_js_string();
                if separator.is_empty() {
                    Value::array(chars.iter().map(|c| Value::String(c.to_string())).collect())
                } else {
                    Value::array(s.split(separator.as_str()).map(Value::from).collect())
                }
            }
        },
        "replace" => Value::String(s.replacen(text(0).as_str(), &text(1), 1)),
        "replaceAll" => Value::String(s.replace(text(0).as_str(), &text(1))),
        "padStart" => pad(true),
        "padEnd" => pad(false),
        "charAt" => {
            let i = arg(&args, 0).to_number();
            let i = if i.is_nan() { 0.0 } else { i };
            Value::String(
                chars
                    .get(i as usize)
                    .filter(|_| i >= 0.0)
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
            )
        }
        "at" => {
            let i = arg(&args, 0).to_number().trunc();
            let index = if i < 0.0 { len as f64 + i } else { i };
            if index < 0.0 {
                Value::Undefined
            } else {
                chars
                    .get(index as usize)
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or_default()
            }
        }
        "repeat" => {
            let count = arg(&args, 0).to_number();
            if count < 0.0 || count.is_infinite() {
                return Err(EvalError::Type(format!("Invalid count value: {}", format_number(count))));
            }
            Value::String(s.repeat(if count.is_nan() { 0 } else { count as usize }))
        }
        "concat" => Value::String(format!(
            "{}{}",
            s,
            args.iter().map(Value::to_js_string).collect::<String>()
        )),
        "toString" => Value::from(s),
        _ => return Err(EvalError::UnknownMethod(format!("String.{}", name))),
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// GLOBALS
// ═══════════════════════════════════════════════════════════════════════════════

fn global_member(global: &str, name: &str) -> Result<Value, EvalError> {
    match (global, name) {
        ("Math", "PI") => Ok(Value::Number(std::f64::consts::PI)),
        ("Math", "E") => Ok(Value::Number(std::f64::consts::E)),
        ("Number", "MAX_SAFE_INTEGER") => Ok(Value::Number(9_007_199_254_740_991.0)),
        ("Number", "EPSILON") => Ok(Value::Number(f64::EPSILON)),
        _ => Err(EvalError::UnknownMember(format!("{}.{}", global, name))),
    }
}

fn call_global_method(global: &str, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let n = |i: usize| arg(&args, i).to_number();
    let math = |f: fn(f64) -> f64| Ok(Value::Number(f(n(0))));

    match (global, name) {
        ("Math", "abs") => math(f64::abs),
        ("Math", "floor") => math(f64::floor),
        ("Math", "ceil") => math(f64::ceil),
        ("Math", "round") => math(|x| (x + 0.5).floor()),
        ("Math", "trunc") => math(f64::trunc),
        ("Math", "sqrt") => math(f64::sqrt),
        ("Math", "sign") => math(|x| if x == 0.0 || x.is_nan() { x } else { x.signum() }),
        ("Math", "pow") => Ok(Value::Number(n(0).powf(n(1)))),
        ("Math", "min") => Ok(Value::Number(
            args.iter().map(Value::to_number).fold(f64::INFINITY, |a, b| {
                if a.is_nan() || b.is_nan() { f64::NAN } else { a.min(b) }
            }),
        )),
        ("Math", "max") => Ok(Value::Number(
            args.iter().map(Value::to_number).fold(f64::NEG_INFINITY, |a, b| {
                if a.is_nan() || b.is_nan() { f64::NAN } else { a.max(b) }
            }),
        )),
        ("JSON", "stringify") => Ok(match arg(&args, 0).to_json() {
            Some(json) => Value::String(serde_json::to_string(&json).unwrap_or_default()),
            None => Value::Undefined,
        }),
        ("JSON", "parse") => serde_json::from_str::<serde_json::Value>(&arg(&args, 0).to_js_string())
            .map(|json| Value::from_json(&json))
            .map_err(|e| EvalError::Syntax(format!("JSON.parse: {}", e))),
        ("Number", "isInteger") => Ok(Value::Bool(
            matches!(arg(&args, 0), Value::Number(x) if x.is_finite() && x.trunc() == x),
        )),
        ("Number", "isFinite") => Ok(Value::Bool(matches!(arg(&args, 0), Value::Number(x) if x.is_finite()))),
        ("Number", "parseFloat") => call_global_function("parseFloat", args),
        ("Number", "parseInt") => call_global_function("parseInt", args),
        ("Array", "isArray") => Ok(Value::Bool(matches!(arg(&args, 0), Value::Array(_)))),
        ("Object", "keys") | ("Object", "values") | ("Object", "entries") => match arg(&args, 0) {
            Value::Object(map) => {
                let map = map.borrow();
                Ok(Value::array(
                    map.iter()
                        .map(|(k, v)| match name {
                            "keys" => Value::from(k.as_str()),
                            "values" => v.clone(),
                            _ => Value::array(vec![Value::from(k.as_str()), v.clone()]),
                        })
                        .collect(),
                ))
            }
            Value::Array(items) => {
                let items = items.borrow();
                Ok(Value::array(
                    items
                        .iter()
                        .enumerate()
                        .map(|(i, v)| match name {
                            "keys" => Value::String(i.to_string()),
                            "values" => v.clone(),
                            _ => Value::array(vec![Value::String(i.to_string()), v.clone()]),
                        })
                        .collect(),
                ))
            }
            other if other.is_nullish() => Err(EvalError::Type(
                "Cannot convert undefined or null to object".to_string(),
            )),
            _ => Ok(Value::array(Vec::new())),
        },
        ("console", level) => {
            let message = args
                .iter()
                .map(Value::to_js_string)
                .collect::<Vec<_>>()
                .join(" ");
            match level {
                "error" => error!(target: "fluff::console", "{}", message),
                "warn" => warn!(target: "fluff::console", "{}", message),
                _ => debug!(target: "fluff::console", "{}", message),
            }
            Ok(Value::Undefined)
        }
        _ => Err(EvalError::UnknownMethod(format!("{}.{}", global, name))),
    }
}

fn call_global_function(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    let first = arg(&args, 0);
    match name {
        "String" => Ok(Value::String(if args.is_empty() {
            String::new()
        } else {
            first.to_js_string()
        })),
        "Number" => Ok(Value::Number(if args.is_empty() { 0.0 } else { first.to_number() })),
        "Boolean" => Ok(Value::Bool(first.truthy())),
        "isNaN" => Ok(Value::Bool(first.to_number().is_nan())),
        "parseFloat" => {
            let text = first.to_js_string();
            let trimmed = text.trim_start();
            Ok(Value::Number(
                FLOAT_PREFIX_RE
                    .find(trimmed)
                    .and_then(|m| {
                        let matched = m.as_str();
                        if matched.ends_with("Infinity") {
                            Some(if matched.starts_with('-') { f64::NEG_INFINITY } else { f64::INFINITY })
                        } else {
                            matched.parse().ok()
                        }
                    })
                    .unwrap_or(f64::NAN),
            ))
        }
        "parseInt" => Ok(Value::Number(parse_int(&first.to_js_string(), &arg(&args, 1)))),
        "encodeURIComponent" => Ok(Value::String(encode_uri_component(&first.to_js_string()))),
        _ => Err(EvalError::NotCallable(name.to_string())),
    }
}

fn parse_int(text: &str, radix: &Value) -> f64 {
    let mut rest = text.trim_start();
    let mut sign = 1.0;
    if let Some(stripped) = rest.strip_prefix('-') {
        sign = -1.0;
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix('+') {
        rest = stripped;
    }

    let requested = match radix {
        Value::Undefined => 0,
        other => other.to_number() as u32,
    };
    let mut radix = if requested == 0 { 10 } else { requested };
    if (requested == 0 || requested == 16) && (rest.starts_with("0x") || rest.starts_with("0X")) {
        rest = &rest[2..];
        radix = 16;
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }

    let digits: String = rest.chars().take_while(|c| c.is_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let value = digits
        .chars()
        .filter_map(|c| c.to_digit(radix))
        .fold(0.0, |acc, d| acc * radix as f64 + d as f64);
    sign * value
}

fn encode_uri_component(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        let c = byte as char;
        if c.is_ascii_alphanumeric() || "-_.!~*'()".contains(c) {
            out.push(c);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}
