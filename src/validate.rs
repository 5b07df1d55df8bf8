use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// INVARIANT CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const INV_MISSING_BINDING_ID: &str = "FLUFF-ERR-BIND-001";
pub const INV_MISSING_EXPRESSION: &str = "FLUFF-ERR-BIND-002";
pub const INV_TWO_WAY_TARGET: &str = "FLUFF-ERR-BIND-003";
pub const INV_EXPRESSION_SYNTAX: &str = "FLUFF-ERR-EXPR-001";
pub const INV_UNBALANCED_BLOCK: &str = "FLUFF-ERR-BLOCK-001";
pub const INV_MALFORMED_FOR: &str = "FLUFF-ERR-BLOCK-002";
pub const INV_MALFORMED_BINDING: &str = "FLUFF-ERR-PARSE-001";
pub const INV_CONFIG_UNREADABLE: &str = "FLUFF-ERR-CACHE-001";

// ═══════════════════════════════════════════════════════════════════════════════
// GUARANTEES
// ═══════════════════════════════════════════════════════════════════════════════

fn get_guarantee(code: &str) -> &'static str {
    match code {
        INV_MISSING_BINDING_ID => "Every element carrying bindings is addressable by a data-lid.",
        INV_MISSING_EXPRESSION => {
            "Property, event and two-way bindings always carry an expression."
        }
        INV_TWO_WAY_TARGET => "Two-way bindings write back to a property owned by the host.",
        INV_EXPRESSION_SYNTAX => "Every binding expression has statically known dependencies.",
        INV_UNBALANCED_BLOCK => "Control-flow blocks are balanced and correctly nested.",
        INV_MALFORMED_FOR => "Loops name an iterator and an iterable.",
        INV_MALFORMED_BINDING => "Binding attributes and interpolations are well formed.",
        INV_CONFIG_UNREADABLE => "Compiler options are read from valid JSON.",
        _ => "Unknown invariant.",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {message} ({file}:{line}:{column})")]
pub struct CompilerError {
    pub code: String,
    pub error_type: String,
    pub message: String,
    pub guarantee: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub context: Option<String>,
    pub hints: Vec<String>,
}

impl CompilerError {
    pub fn new(code: &str, message: &str, file: &str, line: u32, column: u32) -> Self {
        Self::with_details(code, message, file, line, column, None, vec![])
    }

    pub fn at(code: &str, message: &str, file: &str, location: &SourceLocation) -> Self {
        Self::new(code, message, file, location.line, location.column)
    }

    pub fn with_details(
        code: &str,
        message: &str,
        file: &str,
        line: u32,
        column: u32,
        context: Option<String>,
        hints: Vec<String>,
    ) -> Self {
        CompilerError {
            code: code.to_string(),
            error_type: "TEMPLATE_COMPILE_ERROR".to_string(),
            message: message.to_string(),
            guarantee: get_guarantee(code).to_string(),
            file: file.to_string(),
            line,
            column,
            context,
            hints,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IR TYPES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    /// 1-based line and column of a byte offset.
    pub fn from_offset(source: &str, offset: usize) -> Self {
        let offset = offset.min(source.len());
        let before = &source[..offset];
        let line = before.matches('\n').count() as u32 + 1;
        let column = match before.rfind('\n') {
            Some(nl) => before[nl + 1..].chars().count() as u32 + 1,
            None => before.chars().count() as u32 + 1,
        };
        SourceLocation { line, column }
    }
}

/// A dependency a binding observes: a bare host property or an access chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum PropertyChain {
    Simple(String),
    Nested(Vec<String>),
}

impl PropertyChain {
    pub fn from_segments(mut segments: Vec<String>) -> Self {
        if segments.len() == 1 {
            PropertyChain::Simple(segments.remove(0))
        } else {
            PropertyChain::Nested(segments)
        }
    }

    pub fn segments(&self) -> Vec<&str> {
        match self {
            PropertyChain::Simple(name) => vec![name.as_str()],
            PropertyChain::Nested(parts) => parts.iter().map(|s| s.as_str()).collect(),
        }
    }

    pub fn root(&self) -> &str {
        match self {
            PropertyChain::Simple(name) => name,
            PropertyChain::Nested(parts) => parts.first().map(|s| s.as_str()).unwrap_or(""),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PipeInfo {
    pub name: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BindingKind {
    Property,
    Event,
    TwoWay,
    Class,
    Style,
    Ref,
}

impl BindingKind {
    /// Numeric tag used in the compact wire format.
    pub fn code(self) -> u8 {
        match self {
            BindingKind::Property => 0,
            BindingKind::Event => 1,
            BindingKind::TwoWay => 2,
            BindingKind::Class => 3,
            BindingKind::Style => 4,
            BindingKind::Ref => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(BindingKind::Property),
            1 => Some(BindingKind::Event),
            2 => Some(BindingKind::TwoWay),
            3 => Some(BindingKind::Class),
            4 => Some(BindingKind::Style),
            5 => Some(BindingKind::Ref),
            _ => None,
        }
    }

    pub fn requires_expression(self) -> bool {
        matches!(
            self,
            BindingKind::Property | BindingKind::Event | BindingKind::TwoWay
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingInfo {
    pub name: String,
    pub binding: BindingKind,
    pub expression: Option<String>,
    #[serde(default)]
    pub deps: Vec<PropertyChain>,
    pub subscribe: Option<String>,
    #[serde(default)]
    pub pipes: Vec<PipeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttributeIR {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TemplateNode {
    Element(ElementNode),
    Text(TextNode),
    Interpolation(InterpolationNode),
    Comment(CommentNode),
    If(IfNode),
    For(ForNode),
    Switch(SwitchNode),
    Break(BreakNode),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElementNode {
    pub tag_name: String,
    pub attributes: Vec<AttributeIR>,
    pub bindings: Vec<BindingInfo>,
    pub children: Vec<TemplateNode>,
    pub id: Option<String>,
    /// Tag matches a known component selector.
    #[serde(default)]
    pub is_component: bool,
    /// Directive selectors present on this element.
    #[serde(default)]
    pub directives: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TextNode {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InterpolationNode {
    pub expression: String,
    pub deps: Vec<PropertyChain>,
    pub pipes: Vec<PipeInfo>,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommentNode {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IfBranch {
    pub condition: Option<String>,
    #[serde(default)]
    pub condition_deps: Vec<PropertyChain>,
    pub children: Vec<TemplateNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IfNode {
    pub branches: Vec<IfBranch>,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForNode {
    pub iterator: String,
    pub iterable: String,
    pub iterable_deps: Vec<PropertyChain>,
    pub track_by: Option<String>,
    pub children: Vec<TemplateNode>,
    pub empty_content: Option<Vec<TemplateNode>>,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwitchCase {
    pub value_expression: Option<String>,
    pub is_default: bool,
    pub fallthrough: bool,
    pub children: Vec<TemplateNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwitchNode {
    pub expression: String,
    pub expression_deps: Vec<PropertyChain>,
    pub cases: Vec<SwitchCase>,
    #[serde(default)]
    pub location: SourceLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BreakNode {
    #[serde(default)]
    pub location: SourceLocation,
}

/// Parser output: the root node list plus every generated local id in document order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTemplate {
    pub nodes: Vec<TemplateNode>,
    pub element_ids: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// BINDING VALIDATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Check the structural rules every bound element must satisfy before encoding.
pub fn validate_element_bindings(element: &ElementNode, selector: &str) -> Result<(), CompilerError> {
    if element.bindings.is_empty() {
        return Ok(());
    }

    if element.id.is_none() {
        return Err(CompilerError::new(
            INV_MISSING_BINDING_ID,
            &format!("Bindings on <{}> require a data-lid", element.tag_name),
            selector,
            0,
            0,
        ));
    }

    for binding in &element.bindings {
        let has_expression = binding
            .expression
            .as_deref()
            .map(|e| !e.trim().is_empty())
            .unwrap_or(false);

        if binding.binding.requires_expression() && !has_expression {
            let message = if binding.binding == BindingKind::Event {
                format!("Event binding for {} is missing expression", binding.name)
            } else {
                format!("Binding for {} is missing expression", binding.name)
            };
            return Err(CompilerError::new(INV_MISSING_EXPRESSION, &message, selector, 0, 0));
        }

        if binding.binding == BindingKind::TwoWay {
            two_way_target(binding).ok_or_else(|| {
                CompilerError::new(
                    INV_TWO_WAY_TARGET,
                    &format!(
                        "Two-way binding for {} must target a component property",
                        binding.name
                    ),
                    selector,
                    0,
                    0,
                )
                .with_hint("Bind to a plain host property, e.g. [(value)]=\"query\".")
            })?;
        }
    }

    Ok(())
}

/// Host property a two-way binding writes back to, if its expression names one.
pub fn two_way_target(binding: &BindingInfo) -> Option<String> {
    let expr = binding.expression.as_deref()?.trim();
    let target = expr.strip_prefix("this.")?;
    let is_identifier = !target.is_empty()
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        && !target.starts_with(|c: char| c.is_ascii_digit());
    if is_identifier {
        Some(target.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(bindings: Vec<BindingInfo>, id: Option<&str>) -> ElementNode {
        ElementNode {
            tag_name: "input".to_string(),
            attributes: vec![],
            bindings,
            children: vec![],
            id: id.map(|s| s.to_string()),
            is_component: false,
            directives: vec![],
        }
    }

    fn binding(kind: BindingKind, expr: Option<&str>) -> BindingInfo {
        BindingInfo {
            name: "value".to_string(),
            binding: kind,
            expression: expr.map(|s| s.to_string()),
            deps: vec![],
            subscribe: None,
            pipes: vec![],
        }
    }

    #[test]
    fn test_binding_without_id_is_rejected() {
        let el = element(vec![binding(BindingKind::Property, Some("this.a"))], None);
        let err = validate_element_bindings(&el, "my-cmp").unwrap_err();
        assert_eq!(err.code, INV_MISSING_BINDING_ID);
        assert_eq!(err.file, "my-cmp");
        assert!(err.message.contains("require a data-lid"));
    }

    #[test]
    fn test_missing_expression_messages() {
        let el = element(vec![binding(BindingKind::Event, None)], Some("l0"));
        let err = validate_element_bindings(&el, "x-a").unwrap_err();
        assert_eq!(err.message, "Event binding for value is missing expression");

        let el = element(vec![binding(BindingKind::Property, Some("  "))], Some("l0"));
        let err = validate_element_bindings(&el, "x-a").unwrap_err();
        assert_eq!(err.message, "Binding for value is missing expression");
    }

    #[test]
    fn test_ref_needs_no_expression() {
        let el = element(vec![binding(BindingKind::Ref, None)], Some("l0"));
        assert!(validate_element_bindings(&el, "x-a").is_ok());
    }

    #[test]
    fn test_two_way_target_must_be_host_property() {
        let ok = element(vec![binding(BindingKind::TwoWay, Some("this.query"))], Some("l0"));
        assert!(validate_element_bindings(&ok, "x-a").is_ok());

        let bad = element(vec![binding(BindingKind::TwoWay, Some("item.name"))], Some("l0"));
        let err = validate_element_bindings(&bad, "x-a").unwrap_err();
        assert_eq!(err.code, INV_TWO_WAY_TARGET);
        assert!(!err.hints.is_empty());
    }

    #[test]
    fn test_location_from_offset() {
        let src = "ab\ncd\nef";
        assert_eq!(SourceLocation::from_offset(src, 0), SourceLocation { line: 1, column: 1 });
        assert_eq!(SourceLocation::from_offset(src, 4), SourceLocation { line: 2, column: 2 });
    }

    #[test]
    fn test_chain_shapes_serialize_untagged() {
        let simple = PropertyChain::from_segments(vec!["a".into()]);
        let nested = PropertyChain::from_segments(vec!["a".into(), "b".into()]);
        assert_eq!(serde_json::to_string(&simple).unwrap(), "\"a\"");
        assert_eq!(serde_json::to_string(&nested).unwrap(), "[\"a\",\"b\"]");
    }
}
