//! Parse Module for Fluff Compiler
//!
//! Turns a component template into the [`TemplateNode`] tree.
//!
//! html5ever knows nothing about `@if` blocks, `{{ }}` interpolation or bracketed
//! binding attributes, and it lowercases attribute names. A pre-pass therefore
//! rewrites the template before tree building:
//! - control-flow keywords, closing braces and interpolations become
//!   `<!--fluff-cf:N-->` placeholder comments indexed into a side table,
//! - binding attributes (`[x]`, `(x)`, `[(x)]`, `#x`) are renamed to
//!   `data-fluff-attr-N` so their original spelling survives,
//! - self-closing non-void tags are expanded so they never swallow siblings.
//!
//! Markup inside `<!-- -->` comments and raw-text elements is copied verbatim.

use html5ever::tendril::TendrilSink;
use html5ever::{parse_fragment, LocalName, Namespace, QualName};
use lazy_static::lazy_static;
use markup5ever_rcdom::{Handle, NodeData, RcDom};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::expression::{analyze_expression, analyze_handler, split_pipes, ExpressionInfo};
use crate::validate::{
    AttributeIR, BindingInfo, BindingKind, BreakNode, CommentNode, CompilerError, ElementNode,
    ForNode, IfBranch, IfNode, InterpolationNode, ParsedTemplate, PipeInfo, PropertyChain,
    SourceLocation, SwitchCase, SwitchNode, TemplateNode, TextNode, INV_CONFIG_UNREADABLE,
    INV_EXPRESSION_SYNTAX, INV_MALFORMED_BINDING, INV_MALFORMED_FOR, INV_UNBALANCED_BLOCK,
};

// ═══════════════════════════════════════════════════════════════════════════════
// OPTIONS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CompileOptions {
    /// Selector of the component being compiled. Prefixes template ids.
    pub selector: String,
    /// Tags that are framework components.
    pub component_selectors: Vec<String>,
    /// Attribute selectors of registered directives.
    pub directive_selectors: Vec<String>,
    /// Components nested under these tags are not marked.
    pub restricted_parents: Vec<String>,
    /// Drop whitespace-only text at block boundaries.
    pub collapse_whitespace: bool,
    /// Directory for the persistent parse cache.
    pub cache_dir: Option<PathBuf>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            selector: String::new(),
            component_selectors: Vec::new(),
            directive_selectors: Vec::new(),
            restricted_parents: ["select", "option", "optgroup", "datalist"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            collapse_whitespace: true,
            cache_dir: None,
        }
    }
}

impl CompileOptions {
    pub fn new(selector: &str) -> Self {
        CompileOptions {
            selector: selector.to_string(),
            ..Default::default()
        }
    }

    pub fn with_components<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.component_selectors
            .extend(selectors.into_iter().map(Into::into));
        self
    }

    pub fn with_directives<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.directive_selectors
            .extend(selectors.into_iter().map(Into::into));
        self
    }

    /// Load options from a `fluff.json`-style document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, CompilerError> {
        serde_json::from_str(json).map_err(|e| {
            CompilerError::new(
                INV_CONFIG_UNREADABLE,
                &format!("Invalid compiler options: {}", e),
                "fluff.json",
                e.line() as u32,
                e.column() as u32,
            )
        })
    }

    pub fn is_component(&self, tag: &str) -> bool {
        self.component_selectors
            .iter()
            .any(|s| s.eq_ignore_ascii_case(tag))
    }

    /// Directive selectors matched by an attribute name (`[appTooltip]` matches `apptooltip`).
    fn directive_for_attribute(&self, attr: &str) -> Option<&String> {
        self.directive_selectors.iter().find(|sel| {
            let bare = sel.trim_start_matches('[').trim_end_matches(']');
            bare.eq_ignore_ascii_case(attr)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SVG ATTRIBUTE CASE MAPPING
// ═══════════════════════════════════════════════════════════════════════════════

lazy_static! {
    /// html5ever lowercases attributes; SVG needs these back in camelCase.
    static ref SVG_ATTR_CASE_MAP: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("viewbox", "viewBox");
        m.insert("preserveaspectratio", "preserveAspectRatio");
        m.insert("gradienttransform", "gradientTransform");
        m.insert("gradientunits", "gradientUnits");
        m.insert("patterntransform", "patternTransform");
        m.insert("patternunits", "patternUnits");
        m.insert("markerheight", "markerHeight");
        m.insert("markerwidth", "markerWidth");
        m.insert("clippathunits", "clipPathUnits");
        m.insert("stddeviation", "stdDeviation");
        m.insert("textlength", "textLength");
        m.insert("pathlength", "pathLength");
        m.insert("refx", "refX");
        m.insert("refy", "refY");
        m
    };

    static ref SVG_TAGS: HashSet<&'static str> = [
        "svg", "path", "circle", "ellipse", "line", "polyline", "polygon", "rect", "g",
        "defs", "use", "symbol", "clippath", "mask", "pattern", "marker",
        "lineargradient", "radialgradient", "stop", "filter", "fegaussianblur", "text",
        "tspan", "textpath",
    ]
    .into_iter()
    .collect();

    static ref VOID_TAGS: HashSet<&'static str> = [
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta",
        "param", "source", "track", "wbr",
    ]
    .into_iter()
    .collect();

    static ref RAW_TEXT_TAGS: HashSet<&'static str> =
        ["script", "style", "textarea", "title"].into_iter().collect();

    static ref PLACEHOLDER_RE: Regex = Regex::new(r"^fluff-cf:(\d+)$").unwrap();

    static ref FOR_HEADER_RE: Regex =
        Regex::new(r"^\s*(?:(?:let|const)\s+)?([A-Za-z_$][\w$]*)\s+of\s+([\s\S]+?)\s*$").unwrap();
}

/// Correct SVG attribute casing - restores camelCase for SVG attributes
fn correct_svg_attribute_name(attr_name: &str, tag_name: &str) -> String {
    if SVG_TAGS.contains(tag_name.to_lowercase().as_str()) {
        if let Some(&corrected) = SVG_ATTR_CASE_MAP.get(attr_name.to_lowercase().as_str()) {
            return corrected.to_string();
        }
    }
    attr_name.to_string()
}

const ATTR_PLACEHOLDER_PREFIX: &str = "data-fluff-attr-";
const ITERATION_INDEX: &str = "$index";

// ═══════════════════════════════════════════════════════════════════════════════
// PRE-PASS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
enum Directive {
    If(String),
    ElseIf(String),
    Else,
    For(String),
    Empty,
    Switch(String),
    Case(String),
    Default,
    Close,
    Break,
    Fallthrough,
    Interpolation(String),
}

impl Directive {
    fn keyword(&self) -> &'static str {
        match self {
            Directive::If(_) => "@if",
            Directive::ElseIf(_) => "@else if",
            Directive::Else => "@else",
            Directive::For(_) => "@for",
            Directive::Empty => "@empty",
            Directive::Switch(_) => "@switch",
            Directive::Case(_) => "@case",
            Directive::Default => "@default",
            Directive::Close => "}",
            Directive::Break => "@break",
            Directive::Fallthrough => "@fallthrough",
            Directive::Interpolation(_) => "{{ }}",
        }
    }
}

#[derive(Debug, Clone)]
struct BindingAttr {
    name: String,
    offset: usize,
}

#[derive(Debug, Default)]
struct Preprocessed {
    html: String,
    directives: Vec<(Directive, usize)>,
    binding_attrs: Vec<BindingAttr>,
}

struct Preprocessor<'a> {
    src: &'a str,
    selector: &'a str,
    pos: usize,
    depth: usize,
    out: Preprocessed,
}

impl<'a> Preprocessor<'a> {
    fn new(src: &'a str, selector: &'a str) -> Self {
        Preprocessor {
            src,
            selector,
            pos: 0,
            depth: 0,
            out: Preprocessed::default(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn error(&self, code: &str, message: &str, offset: usize) -> CompilerError {
        CompilerError::at(
            code,
            message,
            self.selector,
            &SourceLocation::from_offset(self.src, offset),
        )
    }

    fn push_directive(&mut self, directive: Directive, offset: usize) {
        let index = self.out.directives.len();
        self.out.directives.push((directive, offset));
        self.out.html.push_str(&format!("<!--fluff-cf:{}-->", index));
    }

    fn copy_char(&mut self) {
        if let Some(c) = self.rest().chars().next() {
            self.out.html.push(c);
            self.pos += c.len_utf8();
        }
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.rest().chars().next() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn run(mut self) -> Result<Preprocessed, CompilerError> {
        while self.pos < self.src.len() {
            let rest = self.rest();
            if rest.starts_with("<!--") {
                let end = rest
                    .find("-->")
                    .map(|i| i + 3)
                    .unwrap_or(rest.len());
                self.out.html.push_str(&rest[..end]);
                self.pos += end;
            } else if rest.starts_with('<')
                && rest[1..]
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_alphabetic() || c == '/')
                    .unwrap_or(false)
            {
                self.tag()?;
            } else if rest.starts_with("{{") {
                self.interpolation()?;
            } else if rest.starts_with('@') {
                if !self.keyword()? {
                    self.copy_char();
                }
            } else if rest.starts_with('}') && self.depth > 0 {
                self.depth -= 1;
                let offset = self.pos;
                self.pos += 1;
                self.push_directive(Directive::Close, offset);
            } else {
                self.copy_char();
            }
        }

        if self.depth > 0 {
            return Err(self.error(
                INV_UNBALANCED_BLOCK,
                "Unclosed control-flow block: missing `}`",
                self.src.len(),
            ));
        }
        Ok(self.out)
    }

    fn interpolation(&mut self) -> Result<(), CompilerError> {
        let start = self.pos;
        let body_start = start + 2;
        let end = find_interpolation_end(self.src, body_start).ok_or_else(|| {
            self.error(INV_MALFORMED_BINDING, "Unterminated interpolation `{{`", start)
        })?;
        let expression = self.src[body_start..end].trim().to_string();
        self.pos = end + 2;
        self.push_directive(Directive::Interpolation(expression), start);
        Ok(())
    }

    /// Consume `(...)` after optional whitespace and return its inner text.
    fn parenthesized(&mut self, keyword_offset: usize) -> Result<String, CompilerError> {
        self.skip_ws();
        if !self.rest().starts_with('(') {
            return Err(self.error(
                INV_UNBALANCED_BLOCK,
                "Expected `(` after control-flow keyword",
                keyword_offset,
            ));
        }
        let end = find_balanced_end(self.src, self.pos, '(', ')').ok_or_else(|| {
            self.error(INV_UNBALANCED_BLOCK, "Unbalanced parentheses", keyword_offset)
        })?;
        let inner = self.src[self.pos + 1..end - 1].trim().to_string();
        self.pos = end;
        Ok(inner)
    }

    fn open_brace(&mut self, keyword_offset: usize) -> Result<(), CompilerError> {
        self.skip_ws();
        if !self.rest().starts_with('{') {
            return Err(self.error(
                INV_UNBALANCED_BLOCK,
                "Expected `{` to open control-flow block",
                keyword_offset,
            ));
        }
        self.pos += 1;
        self.depth += 1;
        Ok(())
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let rest = self.rest();
        if !rest.starts_with(keyword) {
            return false;
        }
        let boundary = rest[keyword.len()..]
            .chars()
            .next()
            .map(|c| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(true);
        if boundary {
            self.pos += keyword.len();
        }
        boundary
    }

    /// Returns false when the `@` does not start a known keyword.
    fn keyword(&mut self) -> Result<bool, CompilerError> {
        let offset = self.pos;

        if self.eat_keyword("@if") {
            let cond = self.parenthesized(offset)?;
            self.open_brace(offset)?;
            self.push_directive(Directive::If(cond), offset);
        } else if self.eat_keyword("@else") {
            let save = self.pos;
            self.skip_ws();
            if self.eat_keyword("if") {
                let cond = self.parenthesized(offset)?;
                self.open_brace(offset)?;
                self.push_directive(Directive::ElseIf(cond), offset);
            } else {
                self.pos = save;
                self.open_brace(offset)?;
                self.push_directive(Directive::Else, offset);
            }
        } else if self.eat_keyword("@for") {
            let header = self.parenthesized(offset)?;
            self.open_brace(offset)?;
            self.push_directive(Directive::For(header), offset);
        } else if self.eat_keyword("@empty") {
            self.open_brace(offset)?;
            self.push_directive(Directive::Empty, offset);
        } else if self.eat_keyword("@switch") {
            let expr = self.parenthesized(offset)?;
            self.open_brace(offset)?;
            self.push_directive(Directive::Switch(expr), offset);
        } else if self.eat_keyword("@case") {
            let expr = self.parenthesized(offset)?;
            self.open_brace(offset)?;
            self.push_directive(Directive::Case(expr), offset);
        } else if self.eat_keyword("@default") {
            self.open_brace(offset)?;
            self.push_directive(Directive::Default, offset);
        } else if self.eat_keyword("@break") {
            self.eat_semicolon();
            self.push_directive(Directive::Break, offset);
        } else if self.eat_keyword("@fallthrough") {
            self.eat_semicolon();
            self.push_directive(Directive::Fallthrough, offset);
        } else {
            return Ok(false);
        }
        Ok(true)
    }

    fn eat_semicolon(&mut self) {
        if self.rest().starts_with(';') {
            self.pos += 1;
        }
    }

    fn tag(&mut self) -> Result<(), CompilerError> {
        let start = self.pos;
        let end = find_tag_end(self.src, start)
            .ok_or_else(|| self.error(INV_MALFORMED_BINDING, "Unterminated tag", start))?;
        let raw = &self.src[start..end];
        self.pos = end;

        if raw.starts_with("</") {
            self.out.html.push_str(raw);
            return Ok(());
        }

        let tag = rewrite_tag(raw, start, &mut self.out.binding_attrs);
        self.out.html.push_str(&tag.html);

        let lower = tag.name.to_lowercase();
        if RAW_TEXT_TAGS.contains(lower.as_str()) && !tag.self_closing {
            let close = format!("</{}", lower);
            let rest_lower = self.rest().to_lowercase();
            let content_end = rest_lower.find(&close).unwrap_or(rest_lower.len());
            self.out.html.push_str(&self.rest()[..content_end]);
            self.pos += content_end;
        }
        Ok(())
    }
}

/// Index of the `}}` closing an interpolation body starting at `from`.
fn find_interpolation_end(src: &str, from: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut i = from;
    let mut depth = 0usize;
    let mut in_string: Option<u8> = None;

    while i < bytes.len() {
        let c = bytes[i];
        if let Some(q) = in_string {
            if c == b'\\' {
                i += 2;
                continue;
            }
            if c == q {
                in_string = None;
            }
            i += 1;
            continue;
        }
        match c {
            b'"' | b'\'' | b'`' => in_string = Some(c),
            b'{' => depth += 1,
            b'}' if depth > 0 => depth -= 1,
            b'}' if bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Index after the bracket closing the one at `start`.
fn find_balanced_end(src: &str, start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string: Option<char> = None;
    let mut escaped = false;

    for (i, c) in src[start..].char_indices() {
        if let Some(q) = in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                in_string = None;
            }
            continue;
        }
        if c == '"' || c == '\'' || c == '`' {
            in_string = Some(c);
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Some(start + i + c.len_utf8());
            }
        }
    }
    None
}

/// Index after the `>` closing the tag at `start`, skipping quoted attribute values.
fn find_tag_end(src: &str, start: usize) -> Option<usize> {
    let mut in_quote: Option<char> = None;
    for (i, c) in src[start..].char_indices() {
        match in_quote {
            Some(q) if c == q => in_quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => in_quote = Some(c),
            None if c == '>' => return Some(start + i + 1),
            None => {}
        }
    }
    None
}

struct RewrittenTag {
    html: String,
    name: String,
    self_closing: bool,
}

fn is_binding_attribute(name: &str) -> bool {
    name.starts_with('[') || name.starts_with('(') || name.starts_with('#')
}

/// Rename binding attributes to placeholders and expand `<x/>` for non-void tags.
fn rewrite_tag(raw: &str, offset: usize, bindings: &mut Vec<BindingAttr>) -> RewrittenTag {
    let inner = raw[1..raw.len() - 1].trim_end();
    let self_closing = inner.ends_with('/');
    let inner = inner.trim_end_matches('/');

    let name_end = inner
        .find(|c: char| c.is_whitespace())
        .unwrap_or(inner.len());
    let name = inner[..name_end].to_string();

    let mut html = format!("<{}", name);
    let chars: Vec<(usize, char)> = inner.char_indices().collect();
    let mut i = chars.iter().position(|(p, _)| *p >= name_end).unwrap_or(chars.len());

    while i < chars.len() {
        while i < chars.len() && chars[i].1.is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        let attr_start = chars[i].0;
        while i < chars.len() && !chars[i].1.is_whitespace() && chars[i].1 != '=' {
            i += 1;
        }
        let attr_end = chars.get(i).map(|(p, _)| *p).unwrap_or(inner.len());
        let attr_name = &inner[attr_start..attr_end];

        let mut j = i;
        while j < chars.len() && chars[j].1.is_whitespace() {
            j += 1;
        }
        let mut value = String::new();
        if j < chars.len() && chars[j].1 == '=' {
            j += 1;
            while j < chars.len() && chars[j].1.is_whitespace() {
                j += 1;
            }
            let value_start = chars.get(j).map(|(p, _)| *p).unwrap_or(inner.len());
            if let Some(&(_, quote)) = chars.get(j).filter(|(_, c)| *c == '"' || *c == '\'') {
                j += 1;
                while j < chars.len() && chars[j].1 != quote {
                    j += 1;
                }
                j += 1;
            } else {
                while j < chars.len() && !chars[j].1.is_whitespace() {
                    j += 1;
                }
            }
            let value_end = chars.get(j).map(|(p, _)| *p).unwrap_or(inner.len());
            value = format!("={}", &inner[value_start..value_end]);
            i = j;
        }

        if is_binding_attribute(attr_name) {
            html.push_str(&format!(" {}{}{}", ATTR_PLACEHOLDER_PREFIX, bindings.len(), value));
            bindings.push(BindingAttr {
                name: attr_name.to_string(),
                offset: offset + 1 + attr_start,
            });
        } else {
            html.push_str(&format!(" {}{}", attr_name, value));
        }
    }

    let lower = name.to_lowercase();
    if self_closing && !VOID_TAGS.contains(lower.as_str()) {
        html.push_str(&format!("></{}>", name));
        RewrittenTag {
            html,
            name,
            self_closing: true,
        }
    } else {
        html.push('>');
        RewrittenTag {
            html,
            name,
            self_closing,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TREE BUILDING
// ═══════════════════════════════════════════════════════════════════════════════

/// A child of an html5ever node before control-flow blocks are assembled.
///
/// Elements stay unconverted until `assemble` knows which block they sit in,
/// so loop locals reach their bindings and descendants.
enum Item {
    Node(TemplateNode),
    Element(Handle),
    Directive(usize),
}

struct TreeBuilder<'a> {
    source: &'a str,
    options: &'a CompileOptions,
    pre: &'a Preprocessed,
    next_id: usize,
    element_ids: Vec<String>,
}

impl<'a> TreeBuilder<'a> {
    fn selector(&self) -> &str {
        &self.options.selector
    }

    fn location(&self, offset: usize) -> SourceLocation {
        SourceLocation::from_offset(self.source, offset)
    }

    fn error_at(&self, code: &str, message: &str, offset: usize) -> CompilerError {
        CompilerError::at(code, message, self.selector(), &self.location(offset))
    }

    fn analyze(
        &self,
        code: &str,
        locals: &HashSet<String>,
        offset: usize,
    ) -> Result<ExpressionInfo, CompilerError> {
        analyze_expression(code, locals).map_err(|e| {
            self.error_at(INV_EXPRESSION_SYNTAX, &e.message, offset)
                .with_hint(format!("in `{}`", code))
        })
    }

    fn directive(&self, index: usize) -> &(Directive, usize) {
        &self.pre.directives[index]
    }

    fn convert_children(
        &mut self,
        handles: &[Handle],
        locals: &HashSet<String>,
    ) -> Result<Vec<TemplateNode>, CompilerError> {
        let items: Vec<Item> = handles.iter().filter_map(|h| self.classify(h)).collect();
        let mut pos = 0;
        let nodes = self.assemble(&items, &mut pos, locals, None)?;
        Ok(self.collapse(nodes))
    }

    fn classify(&self, handle: &Handle) -> Option<Item> {
        match &handle.data {
            NodeData::Text { contents } => {
                let content = contents.borrow().to_string();
                Some(Item::Node(TemplateNode::Text(TextNode { content })))
            }
            NodeData::Comment { contents } => {
                let text = contents.to_string();
                if let Some(caps) = PLACEHOLDER_RE.captures(&text) {
                    let index: usize = caps[1].parse().unwrap_or(usize::MAX);
                    if index < self.pre.directives.len() {
                        return Some(Item::Directive(index));
                    }
                }
                Some(Item::Node(TemplateNode::Comment(CommentNode { content: text })))
            }
            NodeData::Element { .. } => Some(Item::Element(handle.clone())),
            NodeData::Document | NodeData::Doctype { .. } | NodeData::ProcessingInstruction { .. } => {
                None
            }
        }
    }

    fn convert_element(
        &mut self,
        handle: &Handle,
        locals: &HashSet<String>,
    ) -> Result<TemplateNode, CompilerError> {
        match &handle.data {
            NodeData::Element {
                name,
                attrs,
                template_contents,
                ..
            } => {
                let tag_name = name.local.to_string();
                let attributes = attrs.borrow();

                let mut static_attrs = Vec::new();
                let mut bindings = Vec::new();
                let mut directives = Vec::new();

                for attr in attributes.iter() {
                    let attr_name = attr.name.local.to_string();
                    let value = attr.value.to_string();

                    if let Some(index) = attr_name
                        .strip_prefix(ATTR_PLACEHOLDER_PREFIX)
                        .and_then(|n| n.parse::<usize>().ok())
                    {
                        if let Some(original) = self.pre.binding_attrs.get(index) {
                            bindings.push(self.parse_binding(original, &value, locals)?);
                            continue;
                        }
                    }

                    if let Some(selector) = self.options.directive_for_attribute(&attr_name) {
                        directives.push(selector.clone());
                    }

                    static_attrs.push(AttributeIR {
                        name: correct_svg_attribute_name(&attr_name, &tag_name),
                        value,
                    });
                }

                let id = if bindings.is_empty() {
                    None
                } else {
                    let id = format!("l{}", self.next_id);
                    self.next_id += 1;
                    self.element_ids.push(id.clone());
                    Some(id)
                };

                let child_handles: Vec<Handle> = match template_contents.borrow().as_ref() {
                    Some(content) => content.children.borrow().clone(),
                    None => handle.children.borrow().clone(),
                };
                let children = self.convert_children(&child_handles, locals)?;

                Ok(TemplateNode::Element(ElementNode {
                    is_component: self.options.is_component(&tag_name),
                    tag_name,
                    attributes: static_attrs,
                    bindings,
                    children,
                    id,
                    directives,
                }))
            }
            _ => Ok(TemplateNode::Comment(CommentNode { content: String::new() })),
        }
    }

    fn parse_binding(
        &self,
        original: &BindingAttr,
        value: &str,
        locals: &HashSet<String>,
    ) -> Result<BindingInfo, CompilerError> {
        let raw = original.name.as_str();
        let malformed = || {
            self.error_at(
                INV_MALFORMED_BINDING,
                &format!("Malformed binding attribute `{}`", raw),
                original.offset,
            )
        };

        let (kind, target) = if let Some(inner) = raw.strip_prefix("[(") {
            (BindingKind::TwoWay, inner.strip_suffix(")]").ok_or_else(malformed)?)
        } else if let Some(inner) = raw.strip_prefix('[') {
            let inner = inner.strip_suffix(']').ok_or_else(malformed)?;
            if let Some(class) = inner.strip_prefix("class.") {
                (BindingKind::Class, class)
            } else if let Some(style) = inner.strip_prefix("style.") {
                (BindingKind::Style, style)
            } else {
                (BindingKind::Property, inner)
            }
        } else if let Some(inner) = raw.strip_prefix('(') {
            (BindingKind::Event, inner.strip_suffix(')').ok_or_else(malformed)?)
        } else if let Some(name) = raw.strip_prefix('#') {
            (BindingKind::Ref, name)
        } else {
            return Err(malformed());
        };

        let (name, subscribe) = match (kind, target.split_once(':')) {
            (BindingKind::Property, Some((name, source))) => {
                (name.to_string(), Some(source.to_string()))
            }
            _ => (target.to_string(), None),
        };
        if name.is_empty() {
            return Err(malformed());
        }

        let mut binding = BindingInfo {
            name,
            binding: kind,
            expression: None,
            deps: Vec::new(),
            subscribe,
            pipes: Vec::new(),
        };

        let code = value.trim();
        if code.is_empty() || kind == BindingKind::Ref {
            return Ok(binding);
        }

        match kind {
            BindingKind::Event => {
                let info = analyze_handler(code, locals).map_err(|e| {
                    self.error_at(INV_EXPRESSION_SYNTAX, &e.message, original.offset)
                })?;
                binding.expression = Some(info.source);
                binding.deps = info.deps;
            }
            BindingKind::TwoWay => {
                let info = self.analyze(code, locals, original.offset)?;
                binding.expression = Some(info.source);
                binding.deps = info.deps;
            }
            _ => {
                let (base, pipes) = split_pipes(code);
                let info = self.analyze(&base, locals, original.offset)?;
                let (pipes, arg_deps) = self.analyze_pipes(pipes, locals, original.offset)?;
                binding.expression = Some(info.source);
                binding.deps = merge_deps(info.deps, arg_deps);
                binding.pipes = pipes;
            }
        }
        Ok(binding)
    }

    fn analyze_pipes(
        &self,
        pipes: Vec<(String, Vec<String>)>,
        locals: &HashSet<String>,
        offset: usize,
    ) -> Result<(Vec<PipeInfo>, Vec<PropertyChain>), CompilerError> {
        let mut infos = Vec::new();
        let mut deps = Vec::new();
        for (name, args) in pipes {
            let mut canonical_args = Vec::new();
            for arg in args {
                let info = self.analyze(&arg, locals, offset)?;
                deps = merge_deps(deps, info.deps);
                canonical_args.push(info.source);
            }
            infos.push(PipeInfo {
                name,
                args: canonical_args,
            });
        }
        Ok((infos, deps))
    }

    /// Fold the flat item list into structured nodes, consuming up to the matching close.
    fn assemble(
        &mut self,
        items: &[Item],
        pos: &mut usize,
        locals: &HashSet<String>,
        open: Option<usize>,
    ) -> Result<Vec<TemplateNode>, CompilerError> {
        let mut nodes = Vec::new();

        while *pos < items.len() {
            let index = match &items[*pos] {
                Item::Node(node) => {
                    nodes.push(node.clone());
                    *pos += 1;
                    continue;
                }
                Item::Element(handle) => {
                    nodes.push(self.convert_element(handle, locals)?);
                    *pos += 1;
                    continue;
                }
                Item::Directive(index) => *index,
            };
            *pos += 1;

            let (directive, offset) = self.directive(index).clone();
            match directive {
                Directive::Close => {
                    if open.is_some() {
                        return Ok(nodes);
                    }
                    return Err(self.error_at(INV_UNBALANCED_BLOCK, "Unexpected `}`", offset));
                }
                Directive::Interpolation(code) => {
                    nodes.push(self.interpolation(&code, locals, offset)?);
                }
                Directive::Break => nodes.push(TemplateNode::Break(BreakNode {
                    location: self.location(offset),
                })),
                Directive::If(cond) => {
                    nodes.push(self.if_block(items, pos, locals, &cond, offset)?);
                }
                Directive::For(header) => {
                    nodes.push(self.for_block(items, pos, locals, &header, offset)?);
                }
                Directive::Switch(expr) => {
                    nodes.push(self.switch_block(items, pos, locals, &expr, offset)?);
                }
                Directive::Fallthrough => {
                    let in_case = open
                        .map(|i| matches!(self.directive(i).0, Directive::Case(_) | Directive::Default))
                        .unwrap_or(false);
                    if !in_case {
                        return Err(self.error_at(
                            INV_UNBALANCED_BLOCK,
                            "@fallthrough is only allowed inside @case or @default",
                            offset,
                        ));
                    }
                    nodes.push(TemplateNode::Comment(CommentNode {
                        content: FALLTHROUGH_SENTINEL.to_string(),
                    }));
                }
                other => {
                    return Err(self.error_at(
                        INV_UNBALANCED_BLOCK,
                        &format!("{} without a matching opening block", other.keyword()),
                        offset,
                    ));
                }
            }
        }

        match open {
            Some(index) => {
                let (directive, offset) = self.directive(index);
                Err(self.error_at(
                    INV_UNBALANCED_BLOCK,
                    &format!("{} block is not closed at the same nesting level", directive.keyword()),
                    *offset,
                ))
            }
            None => Ok(nodes),
        }
    }

    /// Next directive after whitespace-only text, without consuming anything.
    fn peek_directive(&self, items: &[Item], pos: usize) -> Option<(usize, usize)> {
        let mut i = pos;
        while i < items.len() {
            match &items[i] {
                Item::Node(TemplateNode::Text(t)) if t.content.trim().is_empty() => i += 1,
                Item::Directive(index) => return Some((i, *index)),
                _ => return None,
            }
        }
        None
    }

    fn block_body(
        &mut self,
        items: &[Item],
        pos: &mut usize,
        locals: &HashSet<String>,
        open: usize,
    ) -> Result<Vec<TemplateNode>, CompilerError> {
        let nodes = self.assemble(items, pos, locals, Some(open))?;
        Ok(self.collapse(nodes))
    }

    fn interpolation(
        &self,
        code: &str,
        locals: &HashSet<String>,
        offset: usize,
    ) -> Result<TemplateNode, CompilerError> {
        if code.is_empty() {
            return Err(self.error_at(INV_MALFORMED_BINDING, "Empty interpolation", offset));
        }
        let (base, pipes) = split_pipes(code);
        let info = self.analyze(&base, locals, offset)?;
        let (pipes, arg_deps) = self.analyze_pipes(pipes, locals, offset)?;
        Ok(TemplateNode::Interpolation(InterpolationNode {
            expression: info.source,
            deps: merge_deps(info.deps, arg_deps),
            pipes,
            location: self.location(offset),
        }))
    }

    fn if_block(
        &mut self,
        items: &[Item],
        pos: &mut usize,
        locals: &HashSet<String>,
        cond: &str,
        offset: usize,
    ) -> Result<TemplateNode, CompilerError> {
        let open = self.open_index(items, *pos);
        let info = self.analyze(cond, locals, offset)?;
        let children = self.block_body(items, pos, locals, open)?;
        let mut branches = vec![IfBranch {
            condition: Some(info.source),
            condition_deps: info.deps,
            children,
        }];

        while let Some((at, index)) = self.peek_directive(items, *pos) {
            let (directive, branch_offset) = self.directive(index).clone();
            match directive {
                Directive::ElseIf(cond) => {
                    *pos = at + 1;
                    let info = self.analyze(&cond, locals, branch_offset)?;
                    let children = self.block_body(items, pos, locals, index)?;
                    branches.push(IfBranch {
                        condition: Some(info.source),
                        condition_deps: info.deps,
                        children,
                    });
                }
                Directive::Else => {
                    *pos = at + 1;
                    let children = self.block_body(items, pos, locals, index)?;
                    branches.push(IfBranch {
                        condition: None,
                        condition_deps: vec![],
                        children,
                    });
                    break;
                }
                _ => break,
            }
        }

        Ok(TemplateNode::If(IfNode {
            branches,
            location: self.location(offset),
        }))
    }

    /// Directive index of the block opened just before `pos`.
    fn open_index(&self, items: &[Item], pos: usize) -> usize {
        match items.get(pos.wrapping_sub(1)) {
            Some(Item::Directive(index)) => *index,
            _ => 0,
        }
    }

    fn for_block(
        &mut self,
        items: &[Item],
        pos: &mut usize,
        locals: &HashSet<String>,
        header: &str,
        offset: usize,
    ) -> Result<TemplateNode, CompilerError> {
        let open = self.open_index(items, *pos);
        let mut clauses = header.split(';');
        let head = clauses.next().unwrap_or_default();
        let caps = FOR_HEADER_RE.captures(head).ok_or_else(|| {
            self.error_at(
                INV_MALFORMED_FOR,
                &format!("Malformed @for header `{}`", header),
                offset,
            )
            .with_hint("Use `@for (item of items; track item.id)`.")
        })?;
        let iterator = caps[1].to_string();
        let info = self.analyze(&caps[2], locals, offset)?;

        let track_by = clauses
            .map(str::trim)
            .find_map(|c| c.strip_prefix("track"))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        let mut item_locals = locals.clone();
        item_locals.insert(iterator.clone());
        item_locals.insert(ITERATION_INDEX.to_string());
        let children = self.block_body(items, pos, &item_locals, open)?;

        let mut empty_content = None;
        if let Some((at, index)) = self.peek_directive(items, *pos) {
            if self.directive(index).0 == Directive::Empty {
                *pos = at + 1;
                empty_content = Some(self.block_body(items, pos, locals, index)?);
            }
        }

        Ok(TemplateNode::For(ForNode {
            iterator,
            iterable: info.source,
            iterable_deps: info.deps,
            track_by,
            children,
            empty_content,
            location: self.location(offset),
        }))
    }

    fn switch_block(
        &mut self,
        items: &[Item],
        pos: &mut usize,
        locals: &HashSet<String>,
        expr: &str,
        offset: usize,
    ) -> Result<TemplateNode, CompilerError> {
        let info = self.analyze(expr, locals, offset)?;
        let mut cases = Vec::new();

        loop {
            let Some(item) = items.get(*pos) else {
                return Err(self.error_at(INV_UNBALANCED_BLOCK, "@switch block is not closed", offset));
            };
            *pos += 1;
            let index = match item {
                Item::Node(TemplateNode::Text(t)) if t.content.trim().is_empty() => continue,
                Item::Node(TemplateNode::Comment(_)) => continue,
                Item::Node(_) | Item::Element(_) => {
                    return Err(self.error_at(
                        INV_UNBALANCED_BLOCK,
                        "Only @case and @default blocks may appear inside @switch",
                        offset,
                    ))
                }
                Item::Directive(index) => *index,
            };

            let (directive, case_offset) = self.directive(index).clone();
            let (value_expression, is_default) = match directive {
                Directive::Close => break,
                Directive::Case(value) => {
                    (Some(self.analyze(&value, locals, case_offset)?.source), false)
                }
                Directive::Default => (None, true),
                other => {
                    return Err(self.error_at(
                        INV_UNBALANCED_BLOCK,
                        &format!("{} is not allowed directly inside @switch", other.keyword()),
                        case_offset,
                    ))
                }
            };

            let mut children = self.block_body(items, pos, locals, index)?;
            let fallthrough = take_fallthrough(&mut children);
            let children = self.collapse(children);
            cases.push(SwitchCase {
                value_expression,
                is_default,
                fallthrough,
                children,
            });
        }

        Ok(TemplateNode::Switch(SwitchNode {
            expression: info.source,
            expression_deps: info.deps,
            cases,
            location: self.location(offset),
        }))
    }

    fn collapse(&self, nodes: Vec<TemplateNode>) -> Vec<TemplateNode> {
        if !self.options.collapse_whitespace {
            return nodes;
        }
        let is_block = |n: Option<&TemplateNode>| {
            matches!(
                n,
                Some(TemplateNode::If(_))
                    | Some(TemplateNode::For(_))
                    | Some(TemplateNode::Switch(_))
                    | Some(TemplateNode::Break(_))
            )
        };
        let last = nodes.len().saturating_sub(1);
        nodes
            .iter()
            .enumerate()
            .filter(|(i, node)| match node {
                TemplateNode::Text(t) if t.content.trim().is_empty() => {
                    let at_edge = *i == 0 || *i == last;
                    let near_block = (*i > 0 && is_block(nodes.get(i - 1))) || is_block(nodes.get(i + 1));
                    !(at_edge || near_block)
                }
                _ => true,
            })
            .map(|(_, node)| node.clone())
            .collect()
    }
}

const FALLTHROUGH_SENTINEL: &str = "\u{0}fluff-fallthrough";

/// Strip trailing `@fallthrough` sentinels from a case body.
fn take_fallthrough(children: &mut Vec<TemplateNode>) -> bool {
    let mut found = false;
    children.retain(|node| match node {
        TemplateNode::Comment(c) if c.content == FALLTHROUGH_SENTINEL => {
            found = true;
            false
        }
        _ => true,
    });
    found
}

fn merge_deps(mut deps: Vec<PropertyChain>, more: Vec<PropertyChain>) -> Vec<PropertyChain> {
    for dep in more {
        if !deps.contains(&dep) {
            deps.push(dep);
        }
    }
    deps
}

// ═══════════════════════════════════════════════════════════════════════════════
// MAIN PARSING FUNCTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Parse a component template into its node tree.
pub fn parse_template(template: &str, options: &CompileOptions) -> Result<ParsedTemplate, CompilerError> {
    let pre = Preprocessor::new(template, &options.selector).run()?;

    let context = QualName::new(
        None,
        Namespace::from("http://www.w3.org/1999/xhtml"),
        LocalName::from("template"),
    );
    let dom = parse_fragment(RcDom::default(), Default::default(), context, vec![])
        .from_utf8()
        .read_from(&mut pre.html.as_bytes())
        .map_err(|e| {
            CompilerError::new(
                INV_MALFORMED_BINDING,
                &format!("Failed to parse HTML: {}", e),
                &options.selector,
                0,
                0,
            )
        })?;

    // parse_fragment roots the fragment under a synthetic <html> element
    let roots: Vec<Handle> = {
        let document_children = dom.document.children.borrow();
        match document_children.first() {
            Some(html) => html.children.borrow().clone(),
            None => Vec::new(),
        }
    };

    let mut builder = TreeBuilder {
        source: template,
        options,
        pre: &pre,
        next_id: 0,
        element_ids: Vec::new(),
    };
    let nodes = builder.convert_children(&roots, &HashSet::new())?;

    Ok(ParsedTemplate {
        nodes,
        element_ids: builder.element_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_svg_attribute_correction() {
        assert_eq!(correct_svg_attribute_name("viewbox", "svg"), "viewBox");
        assert_eq!(correct_svg_attribute_name("class", "svg"), "class");
        assert_eq!(correct_svg_attribute_name("viewbox", "div"), "viewbox");
    }

    #[test]
    fn test_rewrite_tag_renames_bindings() {
        let mut attrs = Vec::new();
        let tag = rewrite_tag(r#"<input [value]="q" (input)="set($event)" />"#, 0, &mut attrs);
        assert_eq!(
            tag.html,
            r#"<input data-fluff-attr-0="q" data-fluff-attr-1="set($event)">"#
        );
        assert_eq!(attrs[0].name, "[value]");
        assert_eq!(attrs[1].name, "(input)");
    }

    #[test]
    fn test_rewrite_tag_expands_self_closing() {
        let mut attrs = Vec::new();
        let tag = rewrite_tag("<my-child />", 0, &mut attrs);
        assert_eq!(tag.html, "<my-child></my-child>");
        let tag = rewrite_tag("<br/>", 0, &mut attrs);
        assert_eq!(tag.html, "<br>");
    }

    #[test]
    fn test_find_interpolation_end() {
        let src = "{{ {a: 1}.a }} tail";
        assert_eq!(find_interpolation_end(src, 2), Some(12));
        assert_eq!(find_interpolation_end("{{ '}}' }}", 2), Some(8));
        assert_eq!(find_interpolation_end("{{ a ", 2), None);
    }

    #[test]
    fn test_preprocess_comments_untouched() {
        let pre = Preprocessor::new("<!-- @if (x) { -->text", "x-a").run().unwrap();
        assert!(pre.directives.is_empty());
        assert!(pre.html.starts_with("<!-- @if (x) { -->"));
    }

    #[test]
    fn test_preprocess_literal_at_sign() {
        let pre = Preprocessor::new("mail me @ home", "x-a").run().unwrap();
        assert_eq!(pre.html, "mail me @ home");
    }

    #[test]
    fn test_options_from_json_defaults() {
        let options =
            CompileOptions::from_json(r#"{"selector":"app-root","componentSelectors":["x-card"]}"#)
                .unwrap();
        assert_eq!(options.selector, "app-root");
        assert!(options.is_component("x-card"));
        assert!(options.collapse_whitespace);
        assert!(options.restricted_parents.contains(&"select".to_string()));

        let err = CompileOptions::from_json("{nope").unwrap_err();
        assert_eq!(err.code, INV_CONFIG_UNREADABLE);
    }
}
