#[cfg(test)]
mod tests {
    use crate::parse::{parse_template, CompileOptions};
    use crate::validate::{
        BindingKind, ElementNode, PropertyChain, TemplateNode, INV_EXPRESSION_SYNTAX,
        INV_MALFORMED_FOR, INV_UNBALANCED_BLOCK,
    };

    fn parse(template: &str) -> Vec<TemplateNode> {
        parse_template(template, &CompileOptions::new("test-component"))
            .unwrap()
            .nodes
    }

    fn element(node: &TemplateNode) -> &ElementNode {
        match node {
            TemplateNode::Element(el) => el,
            other => panic!("expected element, got {:?}", other),
        }
    }

    #[test]
    fn test_plain_markup() {
        let nodes = parse(r#"<div class="card"><span>Hi</span></div>"#);
        assert_eq!(nodes.len(), 1);
        let div = element(&nodes[0]);
        assert_eq!(div.tag_name, "div");
        assert_eq!(div.attributes[0].name, "class");
        assert_eq!(div.attributes[0].value, "card");
        assert!(div.id.is_none());
        assert!(div.bindings.is_empty());
    }

    #[test]
    fn test_property_binding_gets_local_id() {
        let parsed = parse_template(
            r#"<input [value]="searchQuery" (input)="onSearch($event)">"#,
            &CompileOptions::new("x-search"),
        )
        .unwrap();
        assert_eq!(parsed.element_ids, vec!["l0".to_string()]);

        let input = element(&parsed.nodes[0]);
        assert_eq!(input.id.as_deref(), Some("l0"));
        assert_eq!(input.bindings.len(), 2);

        let value = &input.bindings[0];
        assert_eq!(value.binding, BindingKind::Property);
        assert_eq!(value.name, "value");
        assert_eq!(value.expression.as_deref(), Some("this.searchQuery"));
        assert_eq!(value.deps, vec![PropertyChain::Simple("searchQuery".into())]);

        let input_event = &input.bindings[1];
        assert_eq!(input_event.binding, BindingKind::Event);
        assert_eq!(input_event.expression.as_deref(), Some("this.onSearch($event)"));
    }

    #[test]
    fn test_binding_attribute_case_is_preserved() {
        let nodes = parse(r#"<x-child [itemCount]="count"></x-child>"#);
        let child = element(&nodes[0]);
        assert_eq!(child.bindings[0].name, "itemCount");
    }

    #[test]
    fn test_class_style_ref_and_two_way() {
        let nodes = parse(
            r#"<div [class.active]="isActive" [style.color]="tint" #panel></div><input [(value)]="query">"#,
        );
        let div = element(&nodes[0]);
        let kinds: Vec<BindingKind> = div.bindings.iter().map(|b| b.binding).collect();
        assert_eq!(kinds, vec![BindingKind::Class, BindingKind::Style, BindingKind::Ref]);
        assert_eq!(div.bindings[0].name, "active");
        assert_eq!(div.bindings[1].name, "color");
        assert_eq!(div.bindings[2].name, "panel");
        assert!(div.bindings[2].expression.is_none());

        let input = element(&nodes[1]);
        assert_eq!(input.id.as_deref(), Some("l1"));
        assert_eq!(input.bindings[0].binding, BindingKind::TwoWay);
        assert_eq!(input.bindings[0].expression.as_deref(), Some("this.query"));
    }

    #[test]
    fn test_subscribe_hint() {
        let nodes = parse(r#"<x-list [items:itemsChanged]="items"></x-list>"#);
        let binding = &element(&nodes[0]).bindings[0];
        assert_eq!(binding.name, "items");
        assert_eq!(binding.subscribe.as_deref(), Some("itemsChanged"));
    }

    #[test]
    fn test_interpolation_with_pipes() {
        let nodes = parse(r#"<p>{{ price | currency:'EUR' }}</p>"#);
        let p = element(&nodes[0]);
        match &p.children[0] {
            TemplateNode::Interpolation(interp) => {
                assert_eq!(interp.expression, "this.price");
                assert_eq!(interp.pipes.len(), 1);
                assert_eq!(interp.pipes[0].name, "currency");
                assert_eq!(interp.pipes[0].args, vec!["\"EUR\"".to_string()]);
            }
            other => panic!("expected interpolation, got {:?}", other),
        }
    }

    #[test]
    fn test_interpolation_between_text() {
        let nodes = parse("<p>Hello {{ name }}!</p>");
        let p = element(&nodes[0]);
        assert_eq!(p.children.len(), 3);
        assert!(matches!(&p.children[0], TemplateNode::Text(t) if t.content == "Hello "));
        assert!(matches!(&p.children[2], TemplateNode::Text(t) if t.content == "!"));
    }

    #[test]
    fn test_if_else_chain() {
        let nodes = parse(
            r#"@if (count > 10) { <b>many</b> } @else if (count > 0) { <i>some</i> } @else { none }"#,
        );
        assert_eq!(nodes.len(), 1);
        match &nodes[0] {
            TemplateNode::If(node) => {
                assert_eq!(node.branches.len(), 3);
                assert_eq!(node.branches[0].condition.as_deref(), Some("this.count > 10"));
                assert_eq!(
                    node.branches[0].condition_deps,
                    vec![PropertyChain::Simple("count".into())]
                );
                assert!(node.branches[2].condition.is_none());
                assert_eq!(node.branches[0].children.len(), 1);
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_for_with_track_and_empty() {
        let nodes = parse(
            r#"<ul>@for (item of items; track item.id) { <li>{{ item.title }} {{ $index }}</li> } @empty { <li>Nothing</li> }</ul>"#,
        );
        let ul = element(&nodes[0]);
        match &ul.children[0] {
            TemplateNode::For(node) => {
                assert_eq!(node.iterator, "item");
                assert_eq!(node.iterable, "this.items");
                assert_eq!(node.track_by.as_deref(), Some("item.id"));
                assert!(node.empty_content.is_some());

                let li = element(&node.children[0]);
                match &li.children[0] {
                    TemplateNode::Interpolation(interp) => {
                        assert_eq!(interp.expression, "item.title");
                        assert!(interp.deps.is_empty());
                    }
                    other => panic!("expected interpolation, got {:?}", other),
                }
            }
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn test_loop_locals_reach_nested_elements() {
        let nodes = parse(
            r#"@for (row of rows) { <ul [title]="row.name">@for (cell of row.cells) { <li (click)="pick(cell, $index)">{{ cell }}</li> }</ul> }"#,
        );
        let TemplateNode::For(outer) = &nodes[0] else {
            panic!("expected for, got {:?}", nodes[0]);
        };
        assert_eq!(outer.iterable, "this.rows");

        let ul = element(&outer.children[0]);
        assert_eq!(ul.bindings[0].expression.as_deref(), Some("row.name"));
        assert!(ul.bindings[0].deps.is_empty());

        let TemplateNode::For(inner) = &ul.children[0] else {
            panic!("expected nested for, got {:?}", ul.children[0]);
        };
        assert_eq!(inner.iterable, "row.cells");
        assert!(inner.iterable_deps.is_empty());

        let li = element(&inner.children[0]);
        assert_eq!(li.bindings[0].expression.as_deref(), Some("this.pick(cell, $index)"));
        assert!(li.bindings[0].deps.is_empty());
        match &li.children[0] {
            TemplateNode::Interpolation(interp) => {
                assert_eq!(interp.expression, "cell");
                assert!(interp.deps.is_empty());
            }
            other => panic!("expected interpolation, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_block_does_not_see_loop_locals() {
        let nodes = parse("@for (item of items) { <i>{{ item }}</i> } @empty { <i>{{ item }}</i> }");
        let TemplateNode::For(node) = &nodes[0] else {
            panic!("expected for, got {:?}", nodes[0]);
        };
        let empty = node.empty_content.as_ref().unwrap();
        match &element(&empty[0]).children[0] {
            TemplateNode::Interpolation(interp) => assert_eq!(interp.expression, "this.item"),
            other => panic!("expected interpolation, got {:?}", other),
        }
    }

    #[test]
    fn test_for_header_must_use_of() {
        let err = parse_template("@for (item in items) { x }", &CompileOptions::new("x-a"))
            .unwrap_err();
        assert_eq!(err.code, INV_MALFORMED_FOR);
    }

    #[test]
    fn test_switch_cases_and_fallthrough() {
        let nodes = parse(
            r#"@switch (mode) { @case ('a') { A @fallthrough } @case ('b') { B } @default { D } }"#,
        );
        match &nodes[0] {
            TemplateNode::Switch(node) => {
                assert_eq!(node.expression, "this.mode");
                assert_eq!(node.cases.len(), 3);
                assert_eq!(node.cases[0].value_expression.as_deref(), Some("\"a\""));
                assert!(node.cases[0].fallthrough);
                assert!(!node.cases[1].fallthrough);
                assert!(node.cases[2].is_default);
            }
            other => panic!("expected switch, got {:?}", other),
        }
    }

    #[test]
    fn test_break_inside_loop() {
        let nodes = parse("@for (n of nums) { @if (n > 2) { @break } <i>{{ n }}</i> }");
        match &nodes[0] {
            TemplateNode::For(node) => match &node.children[0] {
                TemplateNode::If(branch) => {
                    assert!(matches!(branch.branches[0].children[0], TemplateNode::Break(_)));
                }
                other => panic!("expected if, got {:?}", other),
            },
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn test_control_flow_inside_comment_is_literal() {
        let nodes = parse("<!-- @if (x) { --><p>ok</p>");
        assert!(matches!(&nodes[0], TemplateNode::Comment(c) if c.content.contains("@if")));
        assert_eq!(element(&nodes[1]).tag_name, "p");
    }

    #[test]
    fn test_unclosed_block() {
        let err = parse_template("@if (x) { <p>open</p>", &CompileOptions::new("x-a")).unwrap_err();
        assert_eq!(err.code, INV_UNBALANCED_BLOCK);
        assert_eq!(err.file, "x-a");
    }

    #[test]
    fn test_block_crossing_element_boundary() {
        let err = parse_template("<div>@if (x) {</div> }", &CompileOptions::new("x-a"))
            .unwrap_err();
        assert_eq!(err.code, INV_UNBALANCED_BLOCK);
    }

    #[test]
    fn test_expression_syntax_error_location() {
        let err = parse_template("<p>\n  {{ a + }}</p>", &CompileOptions::new("x-a")).unwrap_err();
        assert_eq!(err.code, INV_EXPRESSION_SYNTAX);
        assert_eq!(err.line, 2);
        assert_eq!(err.column, 3);
    }

    #[test]
    fn test_component_and_directive_detection() {
        let options = CompileOptions::new("x-host")
            .with_components(["x-card"])
            .with_directives(["[appTooltip]"]);
        let parsed = parse_template(r#"<x-card apptooltip="hi"></x-card><div></div>"#, &options).unwrap();
        let card = element(&parsed.nodes[0]);
        assert!(card.is_component);
        assert_eq!(card.directives, vec!["[appTooltip]".to_string()]);
        assert!(!element(&parsed.nodes[1]).is_component);
    }

    #[test]
    fn test_self_closing_component_does_not_swallow_siblings() {
        let nodes = parse("<div><x-icon /><span>after</span></div>");
        let div = element(&nodes[0]);
        assert_eq!(div.children.len(), 2);
        assert_eq!(element(&div.children[0]).tag_name, "x-icon");
        assert_eq!(element(&div.children[1]).tag_name, "span");
    }

    #[test]
    fn test_whitespace_collapse_around_blocks() {
        let nodes = parse("<div>\n  @if (a) {\n    <b>x</b>\n  }\n</div>");
        let div = element(&nodes[0]);
        assert_eq!(div.children.len(), 1);
        assert!(matches!(div.children[0], TemplateNode::If(_)));

        let mut options = CompileOptions::new("x-a");
        options.collapse_whitespace = false;
        let parsed = parse_template("<div>\n  @if (a) { <b>x</b> }\n</div>", &options).unwrap();
        assert_eq!(element(&parsed.nodes[0]).children.len(), 3);
    }

    #[test]
    fn test_svg_attribute_case_restored() {
        let nodes = parse(r#"<svg viewBox="0 0 10 10"><path d="M0 0"/></svg>"#);
        let svg = element(&nodes[0]);
        assert_eq!(svg.attributes[0].name, "viewBox");
    }
}
