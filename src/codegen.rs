//! Codegen module for Fluff compiler
//!
//! Walks a parsed template and produces:
//! - the static HTML skeleton with `fluff:<type>:<id>` comment markers,
//! - out-of-band `<template>` fragments for every branch, loop item and case,
//! - the per-element compact binding map and the ordered marker configs.
//!
//! All strings, expressions and handlers are interned into a [`CompilationSession`]
//! shared by every component compiled in one build, so identical source text
//! across components resolves to one table slot.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::compact::{
    BindingExtras, CompactBinding, CompactBranch, CompactCase, CompactDep, CompactMarkerConfig,
    CompactPipe, MarkerConfigEntries, MarkerType,
};
use crate::parse::CompileOptions;
use crate::validate::{
    two_way_target, validate_element_bindings, BindingInfo, BindingKind, CompilerError,
    ElementNode, ForNode, IfNode, InterpolationNode, ParsedTemplate, PipeInfo, PropertyChain,
    SwitchNode, TemplateNode,
};

/// Tags written with this prefix are emitted without it.
pub const RESTRICTED_ELEMENT_PREFIX: &str = "x-fluff-el-";
/// Attribute marking elements that are framework components.
pub const COMPONENT_MARKER_ATTR: &str = "x-fluff-component";
pub const LOCAL_ID_ATTR: &str = "data-lid";
pub const REF_ATTR: &str = "data-ref";
pub const DIRECTIVES_ATTR: &str = "data-fluff-directives";
pub const BRANCH_TEMPLATE_ATTR: &str = "data-fluff-branch";
pub const ITEM_TEMPLATE_ATTR: &str = "data-fluff-tpl";
pub const EMPTY_TEMPLATE_ATTR: &str = "data-fluff-empty";
pub const CASE_TEMPLATE_ATTR: &str = "data-fluff-case";

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILATION SESSION
// ═══════════════════════════════════════════════════════════════════════════════

/// The three process-wide tables. Indices are stable once assigned.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionTables {
    pub expressions: Vec<String>,
    pub handlers: Vec<String>,
    pub strings: Vec<String>,
}

/// Append-only interning tables owned by the caller of the compiler.
#[derive(Debug, Clone, Default)]
pub struct CompilationSession {
    strings: IndexSet<String>,
    expressions: IndexSet<String>,
    handlers: IndexSet<String>,
}

impl CompilationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern_string(&mut self, s: &str) -> u32 {
        intern(&mut self.strings, s)
    }

    pub fn intern_expression(&mut self, expr: &str) -> u32 {
        intern(&mut self.expressions, expr)
    }

    pub fn intern_handler(&mut self, handler: &str) -> u32 {
        intern(&mut self.handlers, handler)
    }

    pub fn strings(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(String::as_str)
    }

    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.expressions.iter().map(String::as_str)
    }

    pub fn handlers(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(String::as_str)
    }

    pub fn expression_count(&self) -> usize {
        self.expressions.len()
    }

    pub fn tables(&self) -> ExpressionTables {
        ExpressionTables {
            expressions: self.expressions().map(str::to_string).collect(),
            handlers: self.handlers().map(str::to_string).collect(),
            strings: self.strings().map(str::to_string).collect(),
        }
    }

    /// Drop every interned entry.
    pub fn reset(&mut self) {
        self.strings.clear();
        self.expressions.clear();
        self.handlers.clear();
    }

    /// Independent copy that keeps the indices assigned so far.
    pub fn fork(&self) -> Self {
        self.clone()
    }
}

fn intern(table: &mut IndexSet<String>, s: &str) -> u32 {
    if let Some(index) = table.get_index_of(s) {
        return index as u32;
    }
    let (index, _) = table.insert_full(s.to_string());
    index as u32
}

// ═══════════════════════════════════════════════════════════════════════════════
// GENERATED OUTPUT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedTemplate {
    pub html: String,
    /// `data-lid` value to its bindings, in document order.
    pub bindings: IndexMap<String, Vec<CompactBinding>>,
    pub markers: MarkerConfigEntries,
    /// Expression ids this component references, in first-use order.
    pub used_expressions: Vec<u32>,
    pub used_handlers: Vec<u32>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// CODE GENERATOR
// ═══════════════════════════════════════════════════════════════════════════════

pub struct CodeGenerator<'a> {
    session: &'a mut CompilationSession,
    options: &'a CompileOptions,
    marker_id: u32,
    markers: MarkerConfigEntries,
    bindings: IndexMap<String, Vec<CompactBinding>>,
    templates: Vec<String>,
    used_expressions: IndexSet<u32>,
    used_handlers: IndexSet<u32>,
    /// Open element tags from the root to the current node.
    ancestors: Vec<String>,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(session: &'a mut CompilationSession, options: &'a CompileOptions) -> Self {
        CodeGenerator {
            session,
            options,
            marker_id: 0,
            markers: Vec::new(),
            bindings: IndexMap::new(),
            templates: Vec::new(),
            used_expressions: IndexSet::new(),
            used_handlers: IndexSet::new(),
            ancestors: Vec::new(),
        }
    }

    fn selector(&self) -> &str {
        &self.options.selector
    }

    /// Generate one component's render output. Marker ids restart at zero.
    pub fn generate(&mut self, template: &ParsedTemplate) -> Result<GeneratedTemplate, CompilerError> {
        self.marker_id = 0;
        self.markers.clear();
        self.bindings.clear();
        self.templates.clear();
        self.used_expressions.clear();
        self.used_handlers.clear();
        self.ancestors.clear();

        let mut html = String::new();
        self.render_nodes(&template.nodes, &mut html)?;
        for tpl in self.templates.drain(..) {
            html.push_str(&tpl);
        }

        Ok(GeneratedTemplate {
            html,
            bindings: std::mem::take(&mut self.bindings),
            markers: std::mem::take(&mut self.markers),
            used_expressions: self.used_expressions.iter().copied().collect(),
            used_handlers: self.used_handlers.iter().copied().collect(),
        })
    }

    fn next_marker_id(&mut self) -> u32 {
        let id = self.marker_id;
        self.marker_id += 1;
        id
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Interning
    // ───────────────────────────────────────────────────────────────────────────

    fn expression(&mut self, expr: &str) -> u32 {
        let id = self.session.intern_expression(expr);
        self.used_expressions.insert(id);
        id
    }

    fn handler(&mut self, handler: &str) -> u32 {
        let id = self.session.intern_handler(handler);
        self.used_handlers.insert(id);
        id
    }

    fn deps(&mut self, deps: &[PropertyChain]) -> Vec<CompactDep> {
        deps.iter()
            .map(|dep| match dep {
                PropertyChain::Simple(name) => CompactDep::Simple(self.session.intern_string(name)),
                PropertyChain::Nested(parts) => CompactDep::Chain(
                    parts.iter().map(|p| self.session.intern_string(p)).collect(),
                ),
            })
            .collect()
    }

    fn pipes(&mut self, pipes: &[PipeInfo]) -> Vec<CompactPipe> {
        pipes
            .iter()
            .map(|pipe| {
                let name = self.session.intern_string(&pipe.name);
                let args = pipe.args.iter().map(|arg| self.expression(arg)).collect();
                CompactPipe(name, args)
            })
            .collect()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Node rendering
    // ───────────────────────────────────────────────────────────────────────────

    fn render_nodes(&mut self, nodes: &[TemplateNode], out: &mut String) -> Result<(), CompilerError> {
        for node in nodes {
            self.render_node(node, out)?;
        }
        Ok(())
    }

    fn render_node(&mut self, node: &TemplateNode, out: &mut String) -> Result<(), CompilerError> {
        match node {
            TemplateNode::Element(el) => self.render_element(el, out)?,
            TemplateNode::Text(text) => {
                let raw_parent = self
                    .ancestors
                    .last()
                    .map(|tag| RAW_TEXT_PARENTS.contains(&tag.as_str()))
                    .unwrap_or(false);
                if raw_parent {
                    out.push_str(&text.content);
                } else {
                    out.push_str(&escape_text(&text.content));
                }
            }
            TemplateNode::Comment(comment) => push_comment(out, &comment.content),
            TemplateNode::Interpolation(interp) => self.render_interpolation(interp, out),
            TemplateNode::If(node) => self.render_if(node, out)?,
            TemplateNode::For(node) => self.render_for(node, out)?,
            TemplateNode::Switch(node) => self.render_switch(node, out)?,
            TemplateNode::Break(_) => {
                let id = self.next_marker_id();
                self.markers.push((id, CompactMarkerConfig::Break));
                push_comment(out, &MarkerType::Break.start_sentinel(id));
            }
        }
        Ok(())
    }

    fn is_component_tag(&self, element: &ElementNode, tag: &str) -> bool {
        element.is_component || self.options.is_component(tag)
    }

    fn under_restricted_parent(&self) -> bool {
        self.ancestors.iter().any(|tag| {
            self.options
                .restricted_parents
                .iter()
                .any(|r| r.eq_ignore_ascii_case(tag))
        })
    }

    fn render_element(&mut self, el: &ElementNode, out: &mut String) -> Result<(), CompilerError> {
        let tag = el
            .tag_name
            .strip_prefix(RESTRICTED_ELEMENT_PREFIX)
            .unwrap_or(&el.tag_name)
            .to_string();

        let mut attrs: Vec<(String, String)> = Vec::new();
        if self.is_component_tag(el, &tag) && !self.under_restricted_parent() {
            attrs.push((COMPONENT_MARKER_ATTR.to_string(), String::new()));
        }
        for attr in &el.attributes {
            attrs.push((attr.name.clone(), attr.value.clone()));
        }
        if let Some(id) = &el.id {
            attrs.push((LOCAL_ID_ATTR.to_string(), id.clone()));
        }

        if !el.bindings.is_empty() {
            validate_element_bindings(el, self.selector())?;
            let compact: Vec<CompactBinding> =
                el.bindings.iter().map(|b| self.serialize_binding(b)).collect();
            if let Some(id) = &el.id {
                self.bindings.insert(id.clone(), compact);
            }
        }

        if let Some(reference) = el.bindings.iter().find(|b| b.binding == BindingKind::Ref) {
            attrs.push((REF_ATTR.to_string(), reference.name.clone()));
        }
        if !el.directives.is_empty() {
            attrs.push((DIRECTIVES_ATTR.to_string(), el.directives.join(",")));
        }

        out.push('<');
        out.push_str(&tag);
        for (name, value) in &attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_attribute(value));
            out.push('"');
        }
        out.push('>');

        if VOID_ELEMENTS.contains(&tag.to_ascii_lowercase().as_str()) {
            return Ok(());
        }

        self.ancestors.push(tag.to_ascii_lowercase());
        let result = self.render_nodes(&el.children, out);
        self.ancestors.pop();
        result?;

        out.push_str("</");
        out.push_str(&tag);
        out.push('>');
        Ok(())
    }

    fn serialize_binding(&mut self, binding: &BindingInfo) -> CompactBinding {
        let name = self.session.intern_string(&binding.name);

        if binding.binding == BindingKind::Ref {
            return CompactBinding {
                name,
                kind: BindingKind::Ref,
                deps: None,
                id: None,
                extras: None,
            };
        }

        let deps = Some(self.deps(&binding.deps));
        let expression = binding.expression.as_deref().unwrap_or_default();

        if binding.binding == BindingKind::Event {
            return CompactBinding {
                name,
                kind: BindingKind::Event,
                deps,
                id: Some(self.handler(expression)),
                extras: None,
            };
        }

        let id = self.expression(expression);
        let mut extras = BindingExtras::default();
        if binding.binding == BindingKind::TwoWay {
            extras.t = two_way_target(binding);
        }
        if let Some(source) = &binding.subscribe {
            extras.s = Some(source.clone());
        }
        if !binding.pipes.is_empty() {
            extras.p = Some(self.pipes(&binding.pipes));
        }

        CompactBinding {
            name,
            kind: binding.binding,
            deps,
            id: Some(id),
            extras: if extras.is_empty() { None } else { Some(extras) },
        }
    }

    fn render_interpolation(&mut self, node: &InterpolationNode, out: &mut String) {
        let id = self.next_marker_id();
        let expr = self.expression(&node.expression);
        let deps = Some(self.deps(&node.deps));
        let pipes = if node.pipes.is_empty() {
            None
        } else {
            Some(self.pipes(&node.pipes))
        };
        self.markers
            .push((id, CompactMarkerConfig::Text { expr, deps, pipes }));

        push_comment(out, &MarkerType::Text.start_sentinel(id));
        push_comment(out, &MarkerType::Text.end_sentinel(id));
    }

    /// Render `children` into a detached `<template>` collected for the end of the fragment.
    fn collect_template(
        &mut self,
        attr: &str,
        template_id: &str,
        children: &[TemplateNode],
    ) -> Result<(), CompilerError> {
        let saved = std::mem::take(&mut self.ancestors);
        let mut content = String::new();
        let result = self.render_nodes(children, &mut content);
        self.ancestors = saved;
        result?;

        self.templates.push(format!(
            "<template {}=\"{}\">{}</template>",
            attr,
            escape_attribute(template_id),
            content
        ));
        Ok(())
    }

    fn render_if(&mut self, node: &IfNode, out: &mut String) -> Result<(), CompilerError> {
        let id = self.next_marker_id();
        let branches = node
            .branches
            .iter()
            .map(|branch| match &branch.condition {
                Some(condition) => CompactBranch {
                    expr: Some(self.expression(condition)),
                    deps: Some(self.deps(&branch.condition_deps)),
                },
                None => CompactBranch::default(),
            })
            .collect();
        self.markers.push((id, CompactMarkerConfig::If { branches }));

        push_comment(out, &MarkerType::If.start_sentinel(id));
        for (i, branch) in node.branches.iter().enumerate() {
            let template_id = format!("{}-{}-{}", self.selector(), id, i);
            self.collect_template(BRANCH_TEMPLATE_ATTR, &template_id, &branch.children)?;
        }
        push_comment(out, &MarkerType::If.end_sentinel(id));
        Ok(())
    }

    fn render_for(&mut self, node: &ForNode, out: &mut String) -> Result<(), CompilerError> {
        let id = self.next_marker_id();
        let config = CompactMarkerConfig::For {
            iterator: self.session.intern_string(&node.iterator),
            iterable: self.expression(&node.iterable),
            has_empty: node.empty_content.is_some(),
            deps: Some(self.deps(&node.iterable_deps)),
            track_by: node
                .track_by
                .as_deref()
                .map(|t| self.session.intern_string(t)),
        };
        self.markers.push((id, config));

        push_comment(out, &MarkerType::For.start_sentinel(id));
        let template_id = format!("{}-{}", self.selector(), id);
        self.collect_template(ITEM_TEMPLATE_ATTR, &template_id, &node.children)?;
        if let Some(empty) = &node.empty_content {
            self.collect_template(EMPTY_TEMPLATE_ATTR, &template_id, empty)?;
        }
        push_comment(out, &MarkerType::For.end_sentinel(id));
        Ok(())
    }

    fn render_switch(&mut self, node: &SwitchNode, out: &mut String) -> Result<(), CompilerError> {
        let id = self.next_marker_id();
        let expr = self.expression(&node.expression);
        let deps = Some(self.deps(&node.expression_deps));
        let cases = node
            .cases
            .iter()
            .map(|case| CompactCase {
                is_default: case.is_default,
                fallthrough: case.fallthrough,
                value: case.value_expression.as_deref().map(|v| self.expression(v)),
            })
            .collect();
        self.markers
            .push((id, CompactMarkerConfig::Switch { expr, deps, cases }));

        push_comment(out, &MarkerType::Switch.start_sentinel(id));
        for (i, case) in node.cases.iter().enumerate() {
            let template_id = format!("{}-{}-{}", self.selector(), id, i);
            self.collect_template(CASE_TEMPLATE_ATTR, &template_id, &case.children)?;
        }
        push_comment(out, &MarkerType::Switch.end_sentinel(id));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTML SERIALIZATION HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

pub(crate) const RAW_TEXT_PARENTS: &[&str] = &[
    "style", "script", "xmp", "iframe", "noembed", "noframes", "plaintext",
];

pub(crate) fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(c),
        }
    }
    out
}

pub(crate) fn escape_attribute(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            _ => out.push(c),
        }
    }
    out
}

fn push_comment(out: &mut String, content: &str) {
    out.push_str("<!--");
    out.push_str(content);
    out.push_str("-->");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_text() {
        assert_eq!(escape_text("a < b && c"), "a &lt; b &amp;&amp; c");
        assert_eq!(escape_attribute("say \"hi\""), "say &quot;hi&quot;");
    }

    #[test]
    fn test_intern_first_occurrence_wins() {
        let mut session = CompilationSession::new();
        assert_eq!(session.intern_string("value"), 0);
        assert_eq!(session.intern_string("click"), 1);
        assert_eq!(session.intern_string("value"), 0);
        assert_eq!(session.strings().collect::<Vec<_>>(), vec!["value", "click"]);
    }

    #[test]
    fn test_tables_are_independent() {
        let mut session = CompilationSession::new();
        assert_eq!(session.intern_expression("this.a"), 0);
        assert_eq!(session.intern_handler("this.a"), 0);
        assert_eq!(session.intern_string("this.a"), 0);
        assert_eq!(session.intern_expression("this.b"), 1);
    }

    #[test]
    fn test_fork_and_reset() {
        let mut session = CompilationSession::new();
        session.intern_expression("this.shared");

        let mut fork = session.fork();
        assert_eq!(fork.intern_expression("this.other"), 1);
        assert_eq!(session.expression_count(), 1);

        session.reset();
        assert_eq!(session.expression_count(), 0);
        assert_eq!(session.intern_expression("this.other"), 0);
    }
}
