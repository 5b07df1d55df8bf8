//! Expression Module for Fluff Compiler
//!
//! Template expressions are parsed with oxc and lowered into an owned [`Expr`] tree.
//! The same tree serves three consumers:
//! - the parser, which extracts dependency chains and a canonical source string
//!   (host identifiers qualified as `this.<name>`) used as the interning key,
//! - the emitter, which prints `(t, l) => ...` JavaScript from the canonical source,
//! - the runtime evaluator, which walks the tree directly.

use lazy_static::lazy_static;
use oxc_allocator::Allocator;
use oxc_ast::ast::{
    Argument, ArrowFunctionExpression, AssignmentTarget, BindingIdentifier, ChainElement,
    Expression, ObjectPropertyKind, PropertyKey, SimpleAssignmentTarget, Statement,
};
use oxc_ast_visit::Visit;
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType};
use oxc_syntax::operator::{
    AssignmentOperator, BinaryOperator, LogicalOperator, UnaryOperator, UpdateOperator,
};
use std::collections::HashSet;

use crate::validate::PropertyChain;

// ═══════════════════════════════════════════════════════════════════════════════
// GLOBALS
// ═══════════════════════════════════════════════════════════════════════════════

lazy_static! {
    /// Identifiers that are never qualified onto the host.
    static ref GLOBALS: HashSet<&'static str> = {
        let mut s = HashSet::new();
        s.insert("Math");
        s.insert("JSON");
        s.insert("Number");
        s.insert("String");
        s.insert("Boolean");
        s.insert("Array");
        s.insert("Object");
        s.insert("Date");
        s.insert("console");
        s.insert("window");
        s.insert("document");
        s.insert("parseInt");
        s.insert("parseFloat");
        s.insert("isNaN");
        s.insert("encodeURIComponent");
        s
    };
}

/// Name of the event payload inside handlers.
pub const EVENT_IDENT: &str = "$event";

pub fn is_global(name: &str) -> bool {
    GLOBALS.contains(name)
}

// ═══════════════════════════════════════════════════════════════════════════════
// EXPRESSION TREE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
    TypeOf,
    Void,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Exp,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Coalesce,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    /// Template literal: `quasis` are (raw, cooked) pairs, one more than `exprs`.
    Template {
        quasis: Vec<(String, String)>,
        exprs: Vec<Expr>,
    },
    Ident(String),
    This,
    Member {
        object: Box<Expr>,
        property: String,
        optional: bool,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        optional: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        optional: bool,
    },
    Unary {
        op: UnaryOp,
        arg: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        test: Box<Expr>,
        consequent: Box<Expr>,
        alternate: Box<Expr>,
    },
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Assign {
        target: Box<Expr>,
        op: Option<BinaryOp>,
        value: Box<Expr>,
    },
    Sequence(Vec<Expr>),
    Arrow {
        params: Vec<String>,
        body: Box<Expr>,
    },
    /// Syntax outside the evaluable subset, kept verbatim for emission.
    Opaque(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct SyntaxError {
    pub message: String,
}

impl SyntaxError {
    fn new(message: impl Into<String>) -> Self {
        SyntaxError {
            message: message.into(),
        }
    }
}

/// Canonical form of a template expression plus the host state it reads.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionInfo {
    pub source: String,
    pub deps: Vec<PropertyChain>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLIC ENTRY POINTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Analyze a template expression written against the component.
/// Identifiers not in `locals` (and not globals) are host members.
pub fn analyze_expression(
    code: &str,
    locals: &HashSet<String>,
) -> Result<ExpressionInfo, SyntaxError> {
    let expr = lower_expression_source(code, Some(locals))?;
    let deps = collect_dependencies(std::slice::from_ref(&expr));
    Ok(ExpressionInfo {
        source: print(&expr, PrintMode::Canonical),
        deps,
    })
}

/// Analyze an event handler body. `$event` is always in scope.
pub fn analyze_handler(code: &str, locals: &HashSet<String>) -> Result<ExpressionInfo, SyntaxError> {
    let mut scope = locals.clone();
    scope.insert(EVENT_IDENT.to_string());
    let stmts = lower_handler_source(code, Some(&scope))?;
    let deps = collect_dependencies(&stmts);
    Ok(ExpressionInfo {
        source: print_statements(&stmts, PrintMode::Canonical),
        deps,
    })
}

/// Parse a canonical expression. Bare identifiers stay bare (they are locals).
pub fn parse_expression(code: &str) -> Result<Expr, SyntaxError> {
    lower_expression_source(code, None)
}

/// Parse a canonical handler body into its statement expressions.
pub fn parse_handler(code: &str) -> Result<Vec<Expr>, SyntaxError> {
    lower_handler_source(code, None)
}

/// `(t, l) => ...` source for a canonical expression.
pub fn emit_expression_function(canonical: &str) -> Result<String, SyntaxError> {
    let expr = parse_expression(canonical)?;
    let body = print(&expr, PrintMode::Js);
    if matches!(expr, Expr::Object(_)) {
        Ok(format!("(t, l) => ({})", body))
    } else {
        Ok(format!("(t, l) => {}", body))
    }
}

/// `(t, l, __ev) => { ... }` source for a canonical handler.
pub fn emit_handler_function(canonical: &str) -> Result<String, SyntaxError> {
    let stmts = parse_handler(canonical)?;
    let body = print_statements(&stmts, PrintMode::Js);
    if body.is_empty() {
        Ok("(t, l, __ev) => {}".to_string())
    } else {
        Ok(format!("(t, l, __ev) => {{ {}; }}", body))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PIPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Split `expr | name:arg1:arg2 | other` into the base expression and its pipes.
/// `||` and separators inside strings or brackets are not pipe boundaries.
pub fn split_pipes(code: &str) -> (String, Vec<(String, Vec<String>)>) {
    let segments = split_top_level(code, '|');
    let mut iter = segments.into_iter();
    let base = iter.next().unwrap_or_default().trim().to_string();

    let pipes = iter
        .map(|segment| {
            let mut parts = split_top_level(&segment, ':').into_iter();
            let name = parts.next().unwrap_or_default().trim().to_string();
            let args = parts
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect();
            (name, args)
        })
        .filter(|(name, _)| !name.is_empty())
        .collect();

    (base, pipes)
}

fn split_top_level(code: &str, separator: char) -> Vec<String> {
    let chars: Vec<char> = code.chars().collect();
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if let Some(quote) = in_string {
            current.push(c);
            if c == '\\' && i + 1 < chars.len() {
                current.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == quote {
                in_string = None;
            }
            i += 1;
            continue;
        }

        match c {
            '"' | '\'' | '`' => in_string = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }

        if c == separator && depth == 0 {
            let prev = if i > 0 { chars[i - 1] } else { ' ' };
            let next = chars.get(i + 1).copied().unwrap_or(' ');
            // `||` for pipes, `::` never appears but `?:` ternaries do
            let doubled = separator == '|' && (prev == '|' || next == '|');
            let ternary = separator == ':' && has_open_ternary(&current);
            if !doubled && !ternary {
                parts.push(std::mem::take(&mut current));
                i += 1;
                continue;
            }
        }

        current.push(c);
        i += 1;
    }

    parts.push(current);
    parts
}

fn has_open_ternary(segment: &str) -> bool {
    let questions = segment
        .char_indices()
        .filter(|(i, c)| {
            *c == '?'
                && !segment[i + 1..].starts_with('?')
                && !segment[i + 1..].starts_with('.')
                && !segment[..*i].ends_with('?')
        })
        .count();
    let colons = segment.matches(':').count();
    questions > colons
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOWERING
// ═══════════════════════════════════════════════════════════════════════════════

fn source_type() -> SourceType {
    SourceType::default().with_module(true)
}

fn lower_expression_source(
    code: &str,
    locals: Option<&HashSet<String>>,
) -> Result<Expr, SyntaxError> {
    if code.trim().is_empty() {
        return Err(SyntaxError::new("Empty expression"));
    }

    let wrapped = format!("({}\n)", code);
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, &wrapped, source_type()).parse();
    if !ret.errors.is_empty() || ret.panicked {
        return Err(SyntaxError::new(format!("Invalid expression `{}`", code.trim())));
    }

    let mut lowerer = Lowerer::new(&wrapped, locals);
    match ret.program.body.first() {
        Some(Statement::ExpressionStatement(stmt)) if ret.program.body.len() == 1 => {
            Ok(lowerer.lower(&stmt.expression))
        }
        _ => Err(SyntaxError::new(format!(
            "Expected a single expression in `{}`",
            code.trim()
        ))),
    }
}

fn lower_handler_source(
    code: &str,
    locals: Option<&HashSet<String>>,
) -> Result<Vec<Expr>, SyntaxError> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, code, source_type()).parse();
    if !ret.errors.is_empty() || ret.panicked {
        return Err(SyntaxError::new(format!("Invalid handler `{}`", code.trim())));
    }

    let mut lowerer = Lowerer::new(code, locals);
    let mut stmts = Vec::new();
    for stmt in &ret.program.body {
        match stmt {
            Statement::ExpressionStatement(s) => stmts.push(lowerer.lower(&s.expression)),
            Statement::EmptyStatement(_) => {}
            other => stmts.push(Expr::Opaque(lowerer.slice(other.span()))),
        }
    }
    Ok(stmts)
}

#[derive(Default)]
struct ParamCollector {
    names: Vec<String>,
}

impl<'a> Visit<'a> for ParamCollector {
    fn visit_binding_identifier(&mut self, ident: &BindingIdentifier<'a>) {
        self.names.push(ident.name.to_string());
    }
}

struct Lowerer<'s> {
    source: &'s str,
    locals: Option<&'s HashSet<String>>,
    params: Vec<Vec<String>>,
}

impl<'s> Lowerer<'s> {
    fn new(source: &'s str, locals: Option<&'s HashSet<String>>) -> Self {
        Lowerer {
            source,
            locals,
            params: Vec::new(),
        }
    }

    fn slice(&self, span: oxc_span::Span) -> String {
        self.source
            .get(span.start as usize..span.end as usize)
            .unwrap_or("")
            .to_string()
    }

    fn ident(&self, name: &str) -> Expr {
        match name {
            "undefined" => return Expr::Undefined,
            "NaN" => return Expr::Number(f64::NAN),
            "Infinity" => return Expr::Number(f64::INFINITY),
            _ => {}
        }

        let Some(locals) = self.locals else {
            return Expr::Ident(name.to_string());
        };

        let is_param = self.params.iter().any(|p| p.iter().any(|n| n == name));
        if is_param || locals.contains(name) || is_global(name) || name == EVENT_IDENT {
            Expr::Ident(name.to_string())
        } else {
            Expr::Member {
                object: Box::new(Expr::This),
                property: name.to_string(),
                optional: false,
            }
        }
    }

    fn lower_args(&mut self, args: &[Argument]) -> Vec<Expr> {
        args.iter()
            .map(|arg| match arg.as_expression() {
                Some(e) => self.lower(e),
                None => Expr::Opaque(self.slice(arg.span())),
            })
            .collect()
    }

    fn lower_arrow(&mut self, arrow: &ArrowFunctionExpression) -> Expr {
        let mut collector = ParamCollector::default();
        collector.visit_formal_parameters(&arrow.params);
        let params = collector.names;

        self.params.push(params.clone());
        let body = match arrow.body.statements.first() {
            Some(Statement::ExpressionStatement(s)) if arrow.expression => self.lower(&s.expression),
            Some(Statement::ReturnStatement(r)) if arrow.body.statements.len() == 1 => {
                match &r.argument {
                    Some(arg) => self.lower(arg),
                    None => Expr::Undefined,
                }
            }
            _ => Expr::Opaque(self.slice(arrow.span)),
        };
        self.params.pop();

        if let Expr::Opaque(_) = body {
            return body;
        }
        Expr::Arrow {
            params,
            body: Box::new(body),
        }
    }

    fn lower_simple_target(&mut self, target: &SimpleAssignmentTarget) -> Expr {
        match target {
            SimpleAssignmentTarget::AssignmentTargetIdentifier(id) => self.ident(&id.name),
            SimpleAssignmentTarget::StaticMemberExpression(m) => Expr::Member {
                object: Box::new(self.lower(&m.object)),
                property: m.property.name.to_string(),
                optional: false,
            },
            SimpleAssignmentTarget::ComputedMemberExpression(m) => Expr::Index {
                object: Box::new(self.lower(&m.object)),
                index: Box::new(self.lower(&m.expression)),
                optional: false,
            },
            other => Expr::Opaque(self.slice(other.span())),
        }
    }

    fn lower_chain(&mut self, element: &ChainElement) -> Expr {
        match element {
            ChainElement::CallExpression(call) => Expr::Call {
                callee: Box::new(self.lower(&call.callee)),
                args: self.lower_args(&call.arguments),
                optional: call.optional,
            },
            ChainElement::StaticMemberExpression(m) => Expr::Member {
                object: Box::new(self.lower(&m.object)),
                property: m.property.name.to_string(),
                optional: m.optional,
            },
            ChainElement::ComputedMemberExpression(m) => Expr::Index {
                object: Box::new(self.lower(&m.object)),
                index: Box::new(self.lower(&m.expression)),
                optional: m.optional,
            },
            other => Expr::Opaque(self.slice(other.span())),
        }
    }

    fn lower(&mut self, expr: &Expression) -> Expr {
        match expr {
            Expression::BooleanLiteral(b) => Expr::Bool(b.value),
            Expression::NullLiteral(_) => Expr::Null,
            Expression::NumericLiteral(n) => Expr::Number(n.value),
            Expression::StringLiteral(s) => Expr::Str(s.value.to_string()),
            Expression::TemplateLiteral(tpl) => Expr::Template {
                quasis: tpl
                    .quasis
                    .iter()
                    .map(|q| {
                        let raw = q.value.raw.to_string();
                        let cooked = q
                            .value
                            .cooked
                            .as_ref()
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| raw.clone());
                        (raw, cooked)
                    })
                    .collect(),
                exprs: tpl.expressions.iter().map(|e| self.lower(e)).collect(),
            },
            Expression::Identifier(id) => self.ident(&id.name),
            Expression::ThisExpression(_) => Expr::This,
            Expression::ParenthesizedExpression(p) => self.lower(&p.expression),
            Expression::StaticMemberExpression(m) => Expr::Member {
                object: Box::new(self.lower(&m.object)),
                property: m.property.name.to_string(),
                optional: m.optional,
            },
            Expression::ComputedMemberExpression(m) => Expr::Index {
                object: Box::new(self.lower(&m.object)),
                index: Box::new(self.lower(&m.expression)),
                optional: m.optional,
            },
            Expression::ChainExpression(chain) => self.lower_chain(&chain.expression),
            Expression::CallExpression(call) => Expr::Call {
                callee: Box::new(self.lower(&call.callee)),
                args: self.lower_args(&call.arguments),
                optional: call.optional,
            },
            Expression::UnaryExpression(u) => {
                let op = match u.operator {
                    UnaryOperator::LogicalNot => UnaryOp::Not,
                    UnaryOperator::UnaryNegation => UnaryOp::Neg,
                    UnaryOperator::UnaryPlus => UnaryOp::Plus,
                    UnaryOperator::Typeof => UnaryOp::TypeOf,
                    UnaryOperator::Void => UnaryOp::Void,
                    _ => return Expr::Opaque(self.slice(u.span)),
                };
                Expr::Unary {
                    op,
                    arg: Box::new(self.lower(&u.argument)),
                }
            }
            Expression::UpdateExpression(u) => {
                let op = match u.operator {
                    UpdateOperator::Increment => BinaryOp::Add,
                    UpdateOperator::Decrement => BinaryOp::Sub,
                };
                Expr::Assign {
                    target: Box::new(self.lower_simple_target(&u.argument)),
                    op: Some(op),
                    value: Box::new(Expr::Number(1.0)),
                }
            }
            Expression::BinaryExpression(b) => {
                let op = match b.operator {
                    BinaryOperator::Addition => BinaryOp::Add,
                    BinaryOperator::Subtraction => BinaryOp::Sub,
                    BinaryOperator::Multiplication => BinaryOp::Mul,
                    BinaryOperator::Division => BinaryOp::Div,
                    BinaryOperator::Remainder => BinaryOp::Rem,
                    BinaryOperator::Exponential => BinaryOp::Exp,
                    BinaryOperator::Equality => BinaryOp::Eq,
                    BinaryOperator::Inequality => BinaryOp::NotEq,
                    BinaryOperator::StrictEquality => BinaryOp::StrictEq,
                    BinaryOperator::StrictInequality => BinaryOp::StrictNotEq,
                    BinaryOperator::LessThan => BinaryOp::Lt,
                    BinaryOperator::LessEqualThan => BinaryOp::LtEq,
                    BinaryOperator::GreaterThan => BinaryOp::Gt,
                    BinaryOperator::GreaterEqualThan => BinaryOp::GtEq,
                    BinaryOperator::In => BinaryOp::In,
                    _ => return Expr::Opaque(self.slice(b.span)),
                };
                Expr::Binary {
                    op,
                    left: Box::new(self.lower(&b.left)),
                    right: Box::new(self.lower(&b.right)),
                }
            }
            Expression::LogicalExpression(l) => Expr::Logical {
                op: match l.operator {
                    LogicalOperator::And => LogicalOp::And,
                    LogicalOperator::Or => LogicalOp::Or,
                    LogicalOperator::Coalesce => LogicalOp::Coalesce,
                },
                left: Box::new(self.lower(&l.left)),
                right: Box::new(self.lower(&l.right)),
            },
            Expression::ConditionalExpression(c) => Expr::Conditional {
                test: Box::new(self.lower(&c.test)),
                consequent: Box::new(self.lower(&c.consequent)),
                alternate: Box::new(self.lower(&c.alternate)),
            },
            Expression::ArrayExpression(arr) => Expr::Array(
                arr.elements
                    .iter()
                    .map(|el| match el.as_expression() {
                        Some(e) => self.lower(e),
                        None => Expr::Opaque(self.slice(el.span())),
                    })
                    .collect(),
            ),
            Expression::ObjectExpression(obj) => {
                let mut fields = Vec::new();
                for prop in &obj.properties {
                    match prop {
                        ObjectPropertyKind::ObjectProperty(p) if !p.computed => {
                            let key = match &p.key {
                                PropertyKey::StaticIdentifier(id) => id.name.to_string(),
                                PropertyKey::StringLiteral(s) => s.value.to_string(),
                                PropertyKey::NumericLiteral(n) => format_number(n.value),
                                _ => return Expr::Opaque(self.slice(obj.span)),
                            };
                            fields.push((key, self.lower(&p.value)));
                        }
                        _ => return Expr::Opaque(self.slice(obj.span)),
                    }
                }
                Expr::Object(fields)
            }
            Expression::AssignmentExpression(a) => {
                let target = match &a.left {
                    AssignmentTarget::AssignmentTargetIdentifier(id) => self.ident(&id.name),
                    AssignmentTarget::StaticMemberExpression(m) => Expr::Member {
                        object: Box::new(self.lower(&m.object)),
                        property: m.property.name.to_string(),
                        optional: false,
                    },
                    AssignmentTarget::ComputedMemberExpression(m) => Expr::Index {
                        object: Box::new(self.lower(&m.object)),
                        index: Box::new(self.lower(&m.expression)),
                        optional: false,
                    },
                    _ => return Expr::Opaque(self.slice(a.span)),
                };
                let op = match a.operator {
                    AssignmentOperator::Assign => None,
                    AssignmentOperator::Addition => Some(BinaryOp::Add),
                    AssignmentOperator::Subtraction => Some(BinaryOp::Sub),
                    AssignmentOperator::Multiplication => Some(BinaryOp::Mul),
                    AssignmentOperator::Division => Some(BinaryOp::Div),
                    AssignmentOperator::Remainder => Some(BinaryOp::Rem),
                    _ => return Expr::Opaque(self.slice(a.span)),
                };
                Expr::Assign {
                    target: Box::new(target),
                    op,
                    value: Box::new(self.lower(&a.right)),
                }
            }
            Expression::SequenceExpression(seq) => {
                Expr::Sequence(seq.expressions.iter().map(|e| self.lower(e)).collect())
            }
            Expression::ArrowFunctionExpression(arrow) => self.lower_arrow(arrow),
            other => Expr::Opaque(self.slice(other.span())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEPENDENCY EXTRACTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Host property chains read by the given (canonical) expressions, in first-seen order.
pub fn collect_dependencies(exprs: &[Expr]) -> Vec<PropertyChain> {
    let mut deps = Vec::new();
    for expr in exprs {
        collect_into(expr, &mut deps);
    }
    deps
}

/// `this.a.b` → `["a", "b"]`. Chains rooted anywhere else are not host state.
fn host_chain(expr: &Expr) -> Option<Vec<String>> {
    match expr {
        Expr::Member {
            object, property, ..
        } => {
            if let Expr::This = object.as_ref() {
                return Some(vec![property.clone()]);
            }
            let mut chain = host_chain(object)?;
            chain.push(property.clone());
            Some(chain)
        }
        _ => None,
    }
}

fn push_dep(deps: &mut Vec<PropertyChain>, segments: Vec<String>) {
    let chain = PropertyChain::from_segments(segments);
    if !deps.contains(&chain) {
        deps.push(chain);
    }
}

fn collect_into(expr: &Expr, deps: &mut Vec<PropertyChain>) {
    match expr {
        Expr::Member { object, .. } => match host_chain(expr) {
            Some(chain) => push_dep(deps, chain),
            None => collect_into(object, deps),
        },
        Expr::Index { object, index, .. } => {
            collect_into(object, deps);
            collect_into(index, deps);
        }
        Expr::Call { callee, args, .. } => {
            // the method itself is not state; its receiver is
            match callee.as_ref() {
                Expr::Member { object, .. } => collect_into(object, deps),
                Expr::Ident(_) => {}
                other => collect_into(other, deps),
            }
            for arg in args {
                collect_into(arg, deps);
            }
        }
        Expr::Template { exprs, .. } => exprs.iter().for_each(|e| collect_into(e, deps)),
        Expr::Unary { arg, .. } => collect_into(arg, deps),
        Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
            collect_into(left, deps);
            collect_into(right, deps);
        }
        Expr::Conditional {
            test,
            consequent,
            alternate,
        } => {
            collect_into(test, deps);
            collect_into(consequent, deps);
            collect_into(alternate, deps);
        }
        Expr::Array(items) | Expr::Sequence(items) => {
            items.iter().for_each(|e| collect_into(e, deps))
        }
        Expr::Object(fields) => fields.iter().for_each(|(_, e)| collect_into(e, deps)),
        Expr::Assign { target, value, .. } => {
            collect_into(target, deps);
            collect_into(value, deps);
        }
        Expr::Arrow { body, .. } => collect_into(body, deps),
        Expr::Undefined
        | Expr::Null
        | Expr::Bool(_)
        | Expr::Number(_)
        | Expr::Str(_)
        | Expr::Ident(_)
        | Expr::This
        | Expr::Opaque(_) => {}
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PRINTING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintMode {
    /// `this.x`, bare locals. Used as the interning key.
    Canonical,
    /// `t.x`, `l.x`, `__ev`. Used in generated table functions.
    Js,
}

/// JavaScript `Number.prototype.toString` for the common cases.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == n.trunc() && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

pub fn print(expr: &Expr, mode: PrintMode) -> String {
    let mut printer = Printer {
        mode,
        params: Vec::new(),
    };
    printer.expr(expr)
}

pub fn print_statements(stmts: &[Expr], mode: PrintMode) -> String {
    stmts
        .iter()
        .map(|s| print(s, mode))
        .collect::<Vec<_>>()
        .join("; ")
}

fn is_identifier_name(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$')
}

fn binary_str(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Rem => "%",
        BinaryOp::Exp => "**",
        BinaryOp::Eq => "==",
        BinaryOp::NotEq => "!=",
        BinaryOp::StrictEq => "===",
        BinaryOp::StrictNotEq => "!==",
        BinaryOp::Lt => "<",
        BinaryOp::LtEq => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::GtEq => ">=",
        BinaryOp::In => "in",
    }
}

struct Printer {
    mode: PrintMode,
    params: Vec<Vec<String>>,
}

impl Printer {
    fn is_primary(expr: &Expr) -> bool {
        matches!(
            expr,
            Expr::Undefined
                | Expr::Null
                | Expr::Bool(_)
                | Expr::Str(_)
                | Expr::Template { .. }
                | Expr::Ident(_)
                | Expr::This
                | Expr::Member { .. }
                | Expr::Index { .. }
                | Expr::Call { .. }
                | Expr::Array(_)
                | Expr::Object(_)
        ) || matches!(expr, Expr::Number(n) if *n >= 0.0)
    }

    fn operand(&mut self, expr: &Expr) -> String {
        let printed = self.expr(expr);
        if Self::is_primary(expr) {
            printed
        } else {
            format!("({})", printed)
        }
    }

    /// Receiver of a member access or call; numbers need parentheses there too.
    fn receiver(&mut self, expr: &Expr) -> String {
        if matches!(expr, Expr::Number(_) | Expr::Object(_)) {
            format!("({})", self.expr(expr))
        } else {
            self.operand(expr)
        }
    }

    fn ident(&self, name: &str) -> String {
        if self.mode == PrintMode::Canonical {
            return name.to_string();
        }
        let is_param = self.params.iter().any(|p| p.iter().any(|n| n == name));
        if name == EVENT_IDENT {
            "__ev".to_string()
        } else if is_param || is_global(name) {
            name.to_string()
        } else {
            format!("l.{}", name)
        }
    }

    fn expr(&mut self, expr: &Expr) -> String {
        match expr {
            Expr::Undefined => "undefined".to_string(),
            Expr::Null => "null".to_string(),
            Expr::Bool(b) => b.to_string(),
            Expr::Number(n) => format_number(*n),
            Expr::Str(s) => serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string()),
            Expr::Template { quasis, exprs } => {
                let mut out = String::from("`");
                for (i, (raw, _)) in quasis.iter().enumerate() {
                    out.push_str(raw);
                    if let Some(e) = exprs.get(i) {
                        out.push_str("${");
                        out.push_str(&self.expr(e));
                        out.push('}');
                    }
                }
                out.push('`');
                out
            }
            Expr::Ident(name) => self.ident(name),
            Expr::This => match self.mode {
                PrintMode::Canonical => "this".to_string(),
                PrintMode::Js => "t".to_string(),
            },
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let dot = if *optional { "?." } else { "." };
                format!("{}{}{}", self.receiver(object), dot, property)
            }
            Expr::Index {
                object,
                index,
                optional,
            } => {
                let open = if *optional { "?.[" } else { "[" };
                format!("{}{}{}]", self.receiver(object), open, self.expr(index))
            }
            Expr::Call {
                callee,
                args,
                optional,
            } => {
                let args: Vec<String> = args.iter().map(|a| self.expr(a)).collect();
                let open = if *optional { "?.(" } else { "(" };
                format!("{}{}{})", self.receiver(callee), open, args.join(", "))
            }
            Expr::Unary { op, arg } => {
                let arg = self.operand(arg);
                match op {
                    UnaryOp::Not => format!("!{}", arg),
                    UnaryOp::Neg => format!("-{}", arg),
                    UnaryOp::Plus => format!("+{}", arg),
                    UnaryOp::TypeOf => format!("typeof {}", arg),
                    UnaryOp::Void => format!("void {}", arg),
                }
            }
            Expr::Binary { op, left, right } => format!(
                "{} {} {}",
                self.operand(left),
                binary_str(*op),
                self.operand(right)
            ),
            Expr::Logical { op, left, right } => {
                let op = match op {
                    LogicalOp::And => "&&",
                    LogicalOp::Or => "||",
                    LogicalOp::Coalesce => "??",
                };
                format!("{} {} {}", self.operand(left), op, self.operand(right))
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => format!(
                "{} ? {} : {}",
                self.operand(test),
                self.operand(consequent),
                self.operand(alternate)
            ),
            Expr::Array(items) => {
                let items: Vec<String> = items.iter().map(|e| self.expr(e)).collect();
                format!("[{}]", items.join(", "))
            }
            Expr::Object(fields) => {
                let fields: Vec<String> = fields
                    .iter()
                    .map(|(k, v)| {
                        let key = if is_identifier_name(k) {
                            k.clone()
                        } else {
                            serde_json::to_string(k).unwrap_or_default()
                        };
                        format!("{}: {}", key, self.expr(v))
                    })
                    .collect();
                format!("{{{}}}", fields.join(", "))
            }
            Expr::Assign { target, op, value } => {
                let op = match op {
                    None => "=".to_string(),
                    Some(op) => format!("{}=", binary_str(*op)),
                };
                let value = match value.as_ref() {
                    Expr::Sequence(_) => format!("({})", self.expr(value)),
                    _ => self.expr(value),
                };
                format!("{} {} {}", self.expr(target), op, value)
            }
            Expr::Sequence(items) => {
                let items: Vec<String> = items.iter().map(|e| self.operand(e)).collect();
                items.join(", ")
            }
            Expr::Arrow { params, body } => {
                self.params.push(params.clone());
                let printed = if matches!(body.as_ref(), Expr::Object(_)) {
                    format!("({})", self.expr(body))
                } else {
                    self.operand(body)
                };
                self.params.pop();
                format!("({}) => {}", params.join(", "), printed)
            }
            Expr::Opaque(source) => source.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locals(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_host_identifiers_are_qualified() {
        let info = analyze_expression("searchQuery", &locals(&[])).unwrap();
        assert_eq!(info.source, "this.searchQuery");
        assert_eq!(info.deps, vec![PropertyChain::Simple("searchQuery".into())]);
    }

    #[test]
    fn test_locals_are_excluded_from_deps() {
        let info = analyze_expression("item.name + suffix", &locals(&["item"])).unwrap();
        assert_eq!(info.source, "item.name + this.suffix");
        assert_eq!(info.deps, vec![PropertyChain::Simple("suffix".into())]);
    }

    #[test]
    fn test_nested_chain_recorded_in_order() {
        let info = analyze_expression("this.user.profile.name", &locals(&[])).unwrap();
        assert_eq!(
            info.deps,
            vec![PropertyChain::Nested(vec![
                "user".into(),
                "profile".into(),
                "name".into()
            ])]
        );
    }

    #[test]
    fn test_method_calls_depend_on_receiver_only() {
        let info =
            analyze_expression("tasks.filter(t => t.done).length", &locals(&[])).unwrap();
        assert_eq!(info.source, "this.tasks.filter((t) => t.done).length");
        assert_eq!(info.deps, vec![PropertyChain::Simple("tasks".into())]);

        let info = analyze_expression("getTasksForColumn(col)", &locals(&["col"])).unwrap();
        assert!(info.deps.is_empty());
    }

    #[test]
    fn test_globals_stay_bare() {
        let info = analyze_expression("Math.max(a, 0)", &locals(&[])).unwrap();
        assert_eq!(info.source, "Math.max(this.a, 0)");
        assert_eq!(info.deps, vec![PropertyChain::Simple("a".into())]);
    }

    #[test]
    fn test_whitespace_is_canonicalized() {
        let a = analyze_expression("count+1", &locals(&[])).unwrap();
        let b = analyze_expression("count  +  1", &locals(&[])).unwrap();
        assert_eq!(a.source, b.source);
    }

    #[test]
    fn test_handler_keeps_event_bare() {
        let info = analyze_handler("handleClick($event.target.value)", &locals(&[])).unwrap();
        assert_eq!(info.source, "this.handleClick($event.target.value)");
        assert_eq!(
            emit_handler_function(&info.source).unwrap(),
            "(t, l, __ev) => { t.handleClick(__ev.target.value); }"
        );
    }

    #[test]
    fn test_assignment_value_is_not_parenthesized() {
        let info = analyze_handler("count = count + 1", &locals(&[])).unwrap();
        assert_eq!(info.source, "this.count = this.count + 1");
        let info = analyze_handler("total += price * qty", &locals(&[])).unwrap();
        assert_eq!(info.source, "this.total += this.price * this.qty");
        assert_eq!(
            emit_handler_function(&info.source).unwrap(),
            "(t, l, __ev) => { t.total += t.price * t.qty; }"
        );
    }

    #[test]
    fn test_emit_rewrites_locals() {
        let info = analyze_expression("item.title || fallback", &locals(&["item"])).unwrap();
        assert_eq!(
            emit_expression_function(&info.source).unwrap(),
            "(t, l) => l.item.title || t.fallback"
        );
    }

    #[test]
    fn test_split_pipes() {
        let (base, pipes) = split_pipes("amount | currency:locale");
        assert_eq!(base, "amount");
        assert_eq!(pipes, vec![("currency".to_string(), vec!["locale".to_string()])]);

        let (base, pipes) = split_pipes("a || b");
        assert_eq!(base, "a || b");
        assert!(pipes.is_empty());

        let (base, pipes) = split_pipes("'x|y' | upper");
        assert_eq!(base, "'x|y'");
        assert_eq!(pipes.len(), 1);
    }

    #[test]
    fn test_pipe_args_keep_ternaries() {
        let (_, pipes) = split_pipes("v | fmt:(flag ? 'a' : 'b'):2");
        assert_eq!(pipes[0].1, vec!["(flag ? 'a' : 'b')".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_syntax_error() {
        assert!(analyze_expression("a +", &locals(&[])).is_err());
        assert!(analyze_expression("", &locals(&[])).is_err());
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(-0.0), "0");
    }
}
