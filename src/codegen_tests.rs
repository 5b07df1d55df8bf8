#[cfg(test)]
mod tests {
    use crate::codegen::{CodeGenerator, CompilationSession, GeneratedTemplate};
    use crate::compact::{CompactBinding, CompactDep, CompactMarkerConfig, CompactPipe};
    use crate::parse::{parse_template, CompileOptions};
    use crate::validate::{BindingKind, INV_TWO_WAY_TARGET};
    use serde_json::json;

    fn generate(
        session: &mut CompilationSession,
        options: &CompileOptions,
        template: &str,
    ) -> GeneratedTemplate {
        let parsed = parse_template(template, options).unwrap();
        CodeGenerator::new(session, options).generate(&parsed).unwrap()
    }

    fn compile(template: &str) -> (GeneratedTemplate, CompilationSession) {
        let mut session = CompilationSession::new();
        let options = CompileOptions::new("test-component");
        let generated = generate(&mut session, &options, template);
        (generated, session)
    }

    fn string_at(session: &CompilationSession, index: u32) -> String {
        session.strings().nth(index as usize).unwrap().to_string()
    }

    #[test]
    fn test_shared_expression_is_interned_once_across_components() {
        let mut session = CompilationSession::new();
        let first = CompileOptions::new("x-first");
        let second = CompileOptions::new("x-second");

        let a = generate(&mut session, &first, r#"<p>{{ "shared" }}</p>"#);
        let b = generate(&mut session, &second, r#"<span [title]="'shared'"></span>"#);

        let shared: Vec<&str> = session.expressions().filter(|e| e.contains("shared")).collect();
        assert_eq!(shared, vec!["\"shared\""]);
        assert_eq!(a.used_expressions, b.used_expressions);
    }

    #[test]
    fn test_identical_binding_reuses_ids() {
        let mut session = CompilationSession::new();
        let options = CompileOptions::new("x-a");
        let first = generate(&mut session, &options, r#"<input [value]="query">"#);
        let second = generate(&mut session, &options, r#"<input [value]="query">"#);
        assert_eq!(first.bindings, second.bindings);
        assert_eq!(session.expression_count(), 1);
    }

    #[test]
    fn test_property_binding_round_trip() {
        let (generated, session) = compile(r#"<input [value]="searchQuery" />"#);
        let bindings = &generated.bindings["l0"];
        assert_eq!(bindings.len(), 1);

        let CompactBinding { name, kind, deps, id, extras } = &bindings[0];
        assert_eq!(string_at(&session, *name), "value");
        assert_eq!(*kind, BindingKind::Property);
        assert!(extras.is_none());

        let dep = match deps.as_deref() {
            Some([CompactDep::Simple(dep)]) => *dep,
            other => panic!("unexpected deps {:?}", other),
        };
        assert_eq!(string_at(&session, dep), "searchQuery");

        let expr = session.expressions().nth(id.unwrap() as usize).unwrap();
        assert_eq!(expr, "this.searchQuery");
    }

    #[test]
    fn test_html_never_carries_bindings_inline() {
        let (generated, _) = compile(
            r#"<button [disabled]="busy" (click)="save()">Save</button><div class="plain"></div>"#,
        );
        assert!(!generated.html.contains("data-bindings"));
        assert!(!generated.html.contains("[disabled]"));
        assert!(generated
            .html
            .starts_with(r#"<button data-lid="l0">Save</button><div class="plain"></div>"#));
    }

    #[test]
    fn test_event_binding_uses_handler_table() {
        let (generated, session) = compile(r#"<button (click)="count = count + 1">+</button>"#);
        let binding = &generated.bindings["l0"][0];
        assert_eq!(binding.kind, BindingKind::Event);
        assert_eq!(binding.id, Some(0));
        assert_eq!(
            session.handlers().collect::<Vec<_>>(),
            vec!["this.count = this.count + 1"]
        );
        assert_eq!(session.expression_count(), 0);
        assert_eq!(generated.used_handlers, vec![0]);
    }

    #[test]
    fn test_two_way_and_subscribe_extras() {
        let (generated, _) =
            compile(r#"<x-edit [(value)]="draft" [items:itemsChanged]="items"></x-edit>"#);
        let bindings = serde_json::to_value(&generated.bindings["l0"]).unwrap();
        assert_eq!(bindings[0][4], json!({"t": "draft"}));
        assert_eq!(bindings[1][4], json!({"s": "itemsChanged"}));
    }

    #[test]
    fn test_two_way_to_loop_local_is_rejected() {
        let mut session = CompilationSession::new();
        let options = CompileOptions::new("x-a");
        let parsed =
            parse_template(r#"@for (row of rows) { <input [(value)]="row"> }"#, &options).unwrap();
        let err = CodeGenerator::new(&mut session, &options)
            .generate(&parsed)
            .unwrap_err();
        assert_eq!(err.code, INV_TWO_WAY_TARGET);
        assert_eq!(err.message, "Two-way binding for value must target a component property");
    }

    #[test]
    fn test_ref_binding_emits_data_ref() {
        let (generated, _) = compile(r#"<canvas #surface></canvas>"#);
        assert!(generated.html.contains(r#"data-ref="surface""#));
        let binding = serde_json::to_value(&generated.bindings["l0"][0]).unwrap();
        assert_eq!(binding, json!([0, 5, null, null]));
    }

    #[test]
    fn test_comment_with_control_flow_is_preserved() {
        let (generated, _) = compile("<!-- @if (x) { hidden } --><p>ok</p>");
        assert_eq!(generated.html, "<!-- @if (x) { hidden } --><p>ok</p>");
        assert!(generated.markers.is_empty());
    }

    #[test]
    fn test_if_markers_and_branch_templates() {
        let (generated, _) = compile("@if (a) { <b>yes</b> } @else { <i>no</i> }");
        assert_eq!(
            generated.html,
            concat!(
                "<!--fluff:if:0--><!--/fluff:if:0-->",
                r#"<template data-fluff-branch="test-component-0-0"><b>yes</b></template>"#,
                r#"<template data-fluff-branch="test-component-0-1"><i>no</i></template>"#,
            )
        );
        assert_eq!(
            serde_json::to_value(&generated.markers).unwrap(),
            json!([[0, [0, [[0, [0]], []]]]])
        );
    }

    #[test]
    fn test_for_with_empty_template() {
        let (generated, session) = compile(
            "<ul>@for (item of items; track item.id) { <li>{{ item }}</li> } @empty { <li>none</li> }</ul>",
        );
        assert!(generated.html.starts_with("<ul><!--fluff:for:0--><!--/fluff:for:0--></ul>"));
        assert!(generated.html.contains(
            r#"<template data-fluff-tpl="test-component-0"><li><!--fluff:text:1--><!--/fluff:text:1--></li></template>"#
        ));
        assert!(generated
            .html
            .contains(r#"<template data-fluff-empty="test-component-0"><li>none</li></template>"#));

        match &generated.markers[0].1 {
            CompactMarkerConfig::For { iterator, has_empty, track_by, .. } => {
                assert_eq!(string_at(&session, *iterator), "item");
                assert!(*has_empty);
                assert_eq!(string_at(&session, track_by.unwrap()), "item.id");
            }
            other => panic!("expected for config, got {:?}", other),
        }
        match &generated.markers[1].1 {
            CompactMarkerConfig::Text { deps, .. } => assert_eq!(deps.as_deref(), Some(&[][..])),
            other => panic!("expected text config, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_templates_are_hoisted() {
        let (generated, _) = compile("@if (a) { @if (b) { <i>inner</i> } }");
        assert_eq!(
            generated.html,
            concat!(
                "<!--fluff:if:0--><!--/fluff:if:0-->",
                r#"<template data-fluff-branch="test-component-1-0"><i>inner</i></template>"#,
                r#"<template data-fluff-branch="test-component-0-0"><!--fluff:if:1--><!--/fluff:if:1--></template>"#,
            )
        );
    }

    #[test]
    fn test_switch_and_break_markers() {
        let (generated, _) = compile(
            "@switch (mode) { @case (1) { one @break } @case (2) { two } @default { other } }",
        );
        assert!(generated.html.contains("<!--fluff:break:1-->"));
        assert!(!generated.html.contains("/fluff:break"));
        assert_eq!(
            serde_json::to_value(&generated.markers[0].1).unwrap(),
            json!([3, 0, [0], [[false, false, 1], [false, false, 2], [true, false, null]]])
        );
        assert_eq!(generated.markers[1].1, CompactMarkerConfig::Break);
    }

    #[test]
    fn test_currency_pipe_config() {
        let (generated, session) = compile("<p>{{ amount | currency:locale }}</p>");
        match &generated.markers[0].1 {
            CompactMarkerConfig::Text { expr, pipes: Some(pipes), .. } => {
                assert_eq!(pipes.len(), 1);
                let CompactPipe(name, args) = &pipes[0];
                assert_eq!(string_at(&session, *name), "currency");
                assert_eq!(args.len(), 1);
                assert_eq!(session.expressions().nth(args[0] as usize), Some("this.locale"));
                assert_eq!(session.expressions().nth(*expr as usize), Some("this.amount"));
            }
            other => panic!("expected text config with pipes, got {:?}", other),
        }
    }

    #[test]
    fn test_component_marker_and_restricted_parents() {
        let mut session = CompilationSession::new();
        let options = CompileOptions::new("x-host").with_components(["x-card", "x-opt"]);
        let generated = generate(
            &mut session,
            &options,
            "<x-card></x-card><datalist><x-opt></x-opt></datalist>",
        );
        assert!(generated.html.contains(r#"<x-card x-fluff-component="">"#));
        assert!(generated.html.contains("<x-opt></x-opt>"));
    }

    #[test]
    fn test_restricted_prefix_is_stripped() {
        let (generated, _) = compile(r#"<x-fluff-el-option value="a">A</x-fluff-el-option>"#);
        assert_eq!(generated.html, r#"<option value="a">A</option>"#);
    }

    #[test]
    fn test_directives_attribute() {
        let mut session = CompilationSession::new();
        let options = CompileOptions::new("x-host").with_directives(["[appTooltip]"]);
        let generated = generate(
            &mut session,
            &options,
            r#"<span apptooltip (shown)="log($event)"></span>"#,
        );
        assert!(generated
            .html
            .contains(r#"data-lid="l0" data-fluff-directives="[appTooltip]""#));
    }

    #[test]
    fn test_marker_ids_restart_per_component() {
        let mut session = CompilationSession::new();
        let options = CompileOptions::new("x-a");
        generate(&mut session, &options, "{{ a }}{{ b }}");
        let second = generate(&mut session, &options, "{{ c }}");
        assert_eq!(second.markers[0].0, 0);
        assert_eq!(session.expression_count(), 3);
    }
}
