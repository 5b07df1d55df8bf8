//! Finalize Module for Fluff Compiler
//!
//! Turns generated templates and the session tables into JavaScript source:
//! the per-component render method, the static bindings map and the single
//! global expression-table module.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::codegen::{CompilationSession, GeneratedTemplate};
use crate::expression::{emit_expression_function, emit_handler_function};
use crate::validate::{CompilerError, INV_EXPRESSION_SYNTAX, INV_MALFORMED_BINDING};

/// Package the generated table module imports the runtime base from.
pub const RUNTIME_PACKAGE: &str = "@fluffjs/fluff";

lazy_static! {
    static ref COMMENT_RE: Regex = Regex::new(r"(?s)<!--.*?-->").unwrap();
    static ref RAW_INTERPOLATION_RE: Regex = Regex::new(r"\{\{[^}]*\}\}").unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedComponent {
    pub selector: String,
    pub render_method: String,
    pub bindings_setup: String,
    pub bindings_assignment: String,
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

/// Body of the component's render method.
pub fn render_method(generated: &GeneratedTemplate, styles: Option<&str>) -> String {
    let mut content = generated.html.clone();
    if let Some(css) = styles.filter(|s| !s.trim().is_empty()) {
        content.push_str("<style>");
        content.push_str(css);
        content.push_str("</style>");
    }

    let markers = serde_json::to_string(&generated.markers).unwrap_or_else(|_| "[]".to_string());
    format!(
        "this.__getShadowRoot().innerHTML = {};\nthis.__setMarkerConfigs({});",
        js_string(&content),
        markers
    )
}

/// Body of the component's bindings setup method.
pub fn bindings_setup() -> String {
    "this.__initializeMarkers(MarkerManager);\nsuper.__setupBindings();".to_string()
}

/// `ClassName.__bindings = {...};`
pub fn bindings_assignment(class_name: &str, generated: &GeneratedTemplate) -> String {
    let bindings = serde_json::to_string(&generated.bindings).unwrap_or_else(|_| "{}".to_string());
    format!("{}.__bindings = {};", class_name, bindings)
}

/// The module that installs every expression, handler and string of the session.
pub fn expression_table_module(session: &CompilationSession) -> Result<String, CompilerError> {
    let table_error = |kind: &str, index: usize, message: String| {
        CompilerError::new(
            INV_EXPRESSION_SYNTAX,
            &format!("Cannot emit {} {}: {}", kind, index, message),
            "expression-table",
            0,
            0,
        )
    };

    let mut expressions = Vec::new();
    for (i, expr) in session.expressions().enumerate() {
        expressions.push(
            emit_expression_function(expr).map_err(|e| table_error("expression", i, e.message))?,
        );
    }

    let mut handlers = Vec::new();
    for (i, handler) in session.handlers().enumerate() {
        handlers.push(emit_handler_function(handler).map_err(|e| table_error("handler", i, e.message))?);
    }

    let strings: Vec<String> = session.strings().map(js_string).collect();

    Ok(format!(
        "import {{ FluffBase }} from '{}';\nFluffBase.__setExpressionTable([{}], [{}], [{}]);\n",
        RUNTIME_PACKAGE,
        expressions.join(", "),
        handlers.join(", "),
        strings.join(", ")
    ))
}

/// Reject HTML that still contains `{{ }}` outside comments.
pub fn verify_no_raw_interpolations(html: &str, selector: &str) -> Result<(), CompilerError> {
    let visible = COMMENT_RE.replace_all(html, "");
    let leftovers: Vec<&str> = RAW_INTERPOLATION_RE
        .find_iter(&visible)
        .map(|m| m.as_str())
        .collect();

    if leftovers.is_empty() {
        return Ok(());
    }
    Err(CompilerError::new(
        INV_MALFORMED_BINDING,
        &format!(
            "HTML contains raw interpolations that were not compiled: {}",
            leftovers.join(", ")
        ),
        selector,
        0,
        0,
    )
    .with_hint("All interpolations must be replaced with text markers."))
}

/// Assemble the emitted pieces for one component.
pub fn finalize_component(
    selector: &str,
    class_name: &str,
    generated: &GeneratedTemplate,
    styles: Option<&str>,
) -> Result<FinalizedComponent, CompilerError> {
    verify_no_raw_interpolations(&generated.html, selector)?;
    Ok(FinalizedComponent {
        selector: selector.to_string(),
        render_method: render_method(generated, styles),
        bindings_setup: bindings_setup(),
        bindings_assignment: bindings_assignment(class_name, generated),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::CodeGenerator;
    use crate::parse::{parse_template, CompileOptions};

    fn generated(template: &str, session: &mut CompilationSession) -> GeneratedTemplate {
        let options = CompileOptions::new("x-demo");
        let parsed = parse_template(template, &options).unwrap();
        CodeGenerator::new(session, &options).generate(&parsed).unwrap()
    }

    #[test]
    fn test_render_method() {
        let mut session = CompilationSession::new();
        let out = generated(r#"<p class="n">{{ name }}</p>"#, &mut session);
        let render = render_method(&out, Some(":host { display: block; }"));
        assert_eq!(
            render,
            concat!(
                r#"this.__getShadowRoot().innerHTML = "<p class=\"n\"><!--fluff:text:0--><!--/fluff:text:0--></p><style>:host { display: block; }</style>";"#,
                "\n",
                "this.__setMarkerConfigs([[0,[2,0,[0],null]]]);"
            )
        );
    }

    #[test]
    fn test_bindings_assignment() {
        let mut session = CompilationSession::new();
        let out = generated(r#"<input [value]="q" (input)="q = $event.target.value">"#, &mut session);
        assert_eq!(
            bindings_assignment("DemoComponent", &out),
            r#"DemoComponent.__bindings = {"l0":[[0,0,[1],0],[2,1,[1],0]]};"#
        );
    }

    #[test]
    fn test_expression_table_module() {
        let mut session = CompilationSession::new();
        generated(
            r#"@for (item of items) { <b (click)="pick(item, $event)">{{ item.label }}</b> }"#,
            &mut session,
        );
        let module = expression_table_module(&session).unwrap();
        assert_eq!(
            module,
            concat!(
                "import { FluffBase } from '@fluffjs/fluff';\n",
                "FluffBase.__setExpressionTable(",
                "[(t, l) => t.items, (t, l) => l.item.label], ",
                "[(t, l, __ev) => { t.pick(l.item, __ev); }], ",
                r#"["item", "items", "click"]);"#,
                "\n"
            )
        );
    }

    #[test]
    fn test_raw_interpolation_detection() {
        assert!(verify_no_raw_interpolations("<!-- {{ kept }} --><p>x</p>", "x-a").is_ok());
        let err = verify_no_raw_interpolations("<p>{{ oops }}</p>", "x-a").unwrap_err();
        assert_eq!(err.code, INV_MALFORMED_BINDING);
        assert!(err.message.contains("{{ oops }}"));
    }

    #[test]
    fn test_finalize_component() {
        let mut session = CompilationSession::new();
        let out = generated("<span>static</span>", &mut session);
        let finalized = finalize_component("x-demo", "Demo", &out, None).unwrap();
        assert_eq!(finalized.bindings_assignment, "Demo.__bindings = {};");
        assert!(finalized.render_method.ends_with("this.__setMarkerConfigs([]);"));
        assert_eq!(
            finalized.bindings_setup,
            "this.__initializeMarkers(MarkerManager);\nsuper.__setupBindings();"
        );
    }
}
