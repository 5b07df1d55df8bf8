#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::component::{compile_components, CompileOutput, ComponentSource};
    use crate::dom::NodeId;
    use crate::host::{Component, HostRef};
    use crate::markers::RegionState;
    use crate::parse::CompileOptions;
    use crate::reactive::Property;
    use crate::runtime::{ComponentDefinition, Runtime};
    use crate::value::Value;

    fn compile(sources: &[(&str, &str)], options: CompileOptions) -> CompileOutput {
        let sources: Vec<ComponentSource> = sources
            .iter()
            .map(|(selector, template)| ComponentSource::new(selector, "Component", template))
            .collect();
        compile_components(&sources, &options).unwrap()
    }

    fn define_shared(runtime: &Runtime, output: &CompileOutput, selector: &str, host: &Rc<Component>) {
        let compiled = output
            .components
            .iter()
            .find(|c| c.selector == selector)
            .unwrap();
        let host = host.clone();
        runtime
            .define(ComponentDefinition::from_compiled(compiled, move || {
                host.clone() as HostRef
            }))
            .unwrap();
    }

    /// Compile one component, load the tables, define it and mount it.
    fn mount(template: &str, host: &Rc<Component>) -> (Runtime, NodeId) {
        let output = compile(&[("x-app", template)], CompileOptions::default());
        let runtime = Runtime::new();
        runtime.load_tables(&output.tables).unwrap();
        define_shared(&runtime, &output, "x-app", host);
        let element = runtime.mount(runtime.document().root(), "x-app").unwrap();
        (runtime, element)
    }

    fn shadow(runtime: &Runtime, element: NodeId) -> NodeId {
        runtime.instance(element).unwrap().shadow_root()
    }

    fn shadow_text(runtime: &Runtime, element: NodeId) -> String {
        let text = runtime.document().text_content(shadow(runtime, element));
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn find_all(runtime: &Runtime, root: NodeId, tag: &str) -> Vec<NodeId> {
        let doc = runtime.document();
        doc.descendants(root)
            .into_iter()
            .filter(|node| doc.tag_name(*node).as_deref() == Some(tag))
            .collect()
    }

    fn texts_of(runtime: &Runtime, root: NodeId, tag: &str) -> Vec<String> {
        find_all(runtime, root, tag)
            .into_iter()
            .map(|node| runtime.document().text_content(node).trim().to_string())
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Control flow
    // ═══════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_if_renders_and_follows_dependencies() {
        let host = Component::builder("x-app")
            .reactive("show", true)
            .reactive("name", "Ada")
            .build();
        let (runtime, app) = mount(
            "@if (show) { <span>{{ name }}</span> } @else { <em>hidden</em> }",
            &host,
        );
        assert_eq!(shadow_text(&runtime, app), "Ada");

        host.set("name", "Grace");
        assert_eq!(shadow_text(&runtime, app), "Grace");

        host.set("show", false);
        assert_eq!(shadow_text(&runtime, app), "hidden");
        let controller = runtime.instance(app).unwrap().markers().controller(0, None).unwrap();
        assert_eq!(controller.state(), RegionState::Rendered(1));

        host.set("show", true);
        let root = shadow(&runtime, app);
        assert_eq!(texts_of(&runtime, root, "span"), vec!["Grace"]);
        assert!(find_all(&runtime, root, "em").is_empty());
        assert_eq!(controller.state(), RegionState::Rendered(0));

        host.set("name", "Ada");
        assert_eq!(shadow_text(&runtime, app), "Ada");
    }

    #[test]
    fn test_if_keeps_region_when_branch_is_unchanged() {
        let host = Component::builder("x-app").reactive("show", true).build();
        let (runtime, app) = mount("@if (show) { <span>on</span> }", &host);
        let before = find_all(&runtime, shadow(&runtime, app), "span");
        assert_eq!(before.len(), 1);

        host.set("show", "still truthy");
        let after = find_all(&runtime, shadow(&runtime, app), "span");
        assert_eq!(before, after);

        host.set("show", false);
        assert!(find_all(&runtime, shadow(&runtime, app), "span").is_empty());
        let controller = runtime.instance(app).unwrap().markers().controller(0, None).unwrap();
        assert_eq!(controller.state(), RegionState::Empty);
    }

    #[test]
    fn test_for_renders_items_with_index() {
        let host = Component::builder("x-app")
            .reactive("items", Value::array(vec![1.into(), 2.into(), 3.into()]))
            .build();
        let (runtime, app) = mount(
            "<ul>@for (item of items; track item) { <li>{{ item }}-{{ $index }}</li> } @empty { <li>none</li> }</ul>",
            &host,
        );
        let root = shadow(&runtime, app);
        assert_eq!(texts_of(&runtime, root, "li"), vec!["1-0", "2-1", "3-2"]);

        host.set("items", Value::array(vec!["a".into()]));
        assert_eq!(texts_of(&runtime, root, "li"), vec!["a-0"]);

        host.set("items", Value::array(vec![]));
        assert_eq!(texts_of(&runtime, root, "li"), vec!["none"]);
    }

    #[test]
    fn test_loop_locals_bind_inside_nested_elements() {
        let host = Component::builder("x-app")
            .reactive(
                "rows",
                Value::array(vec![
                    Value::array(vec!["a".into(), "b".into()]),
                    Value::array(vec!["c".into()]),
                ]),
            )
            .build();
        let (runtime, app) = mount(
            r#"@for (row of rows) { <ul [title]="row.length">@for (c of row) { <li>{{ c }}{{ $index }}</li> }</ul> }"#,
            &host,
        );
        let root = shadow(&runtime, app);
        assert_eq!(texts_of(&runtime, root, "li"), vec!["a0", "b1", "c0"]);
        let lists = find_all(&runtime, root, "ul");
        let titles: Vec<_> = lists
            .iter()
            .map(|ul| runtime.document().property(*ul, "title"))
            .collect();
        assert_eq!(titles, vec![Some(Value::from(2)), Some(Value::from(1))]);
    }

    #[test]
    fn test_break_stops_remaining_iterations() {
        let host = Component::builder("x-app")
            .reactive("nums", Value::array(vec![1.into(), 2.into(), 3.into(), 4.into()]))
            .build();
        let (runtime, app) = mount(
            "@for (n of nums) { @if (n > 2) { @break } <i>{{ n }}</i> }",
            &host,
        );
        assert_eq!(texts_of(&runtime, shadow(&runtime, app), "i"), vec!["1", "2", "3"]);
    }

    #[test]
    fn test_switch_fallthrough_and_default() {
        let host = Component::builder("x-app").reactive("mode", "a").build();
        let (runtime, app) = mount(
            "@switch (mode) { @case ('a') { <b>A</b> @fallthrough } @case ('b') { <b>B</b> } @case ('c') { <b>C</b> } @default { <b>D</b> } }",
            &host,
        );
        let root = shadow(&runtime, app);
        assert_eq!(texts_of(&runtime, root, "b"), vec!["A", "B"]);

        host.set("mode", "c");
        assert_eq!(texts_of(&runtime, root, "b"), vec!["C"]);

        host.set("mode", "zzz");
        assert_eq!(texts_of(&runtime, root, "b"), vec!["D"]);
    }

    #[test]
    fn test_break_in_case_suppresses_fallthrough() {
        let host = Component::builder("x-app").reactive("level", 1).build();
        let (runtime, app) = mount(
            "@switch (level) { @case (1) { <b>one</b> @break @fallthrough } @case (2) { <b>two</b> } @default { <b>other</b> } }",
            &host,
        );
        let root = shadow(&runtime, app);
        assert_eq!(texts_of(&runtime, root, "b"), vec!["one"]);

        host.set("level", 2);
        assert_eq!(texts_of(&runtime, root, "b"), vec!["two"]);

        host.set("level", 1);
        assert_eq!(texts_of(&runtime, root, "b"), vec!["one"]);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Bindings
    // ═══════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_native_property_and_input_event_round_trip() {
        let host = Component::builder("x-app").reactive("searchQuery", "abc").build();
        let (runtime, app) = mount(
            r#"<input [value]="searchQuery" (input)="searchQuery = $event.target.value">"#,
            &host,
        );
        let doc = runtime.document();
        let input = find_all(&runtime, shadow(&runtime, app), "input")[0];
        assert_eq!(doc.property(input, "value"), Some(Value::from("abc")));

        doc.set_property(input, "value", Value::from("typed"));
        doc.dispatch_event(input, "input", &doc.event_payload(input, "input"));
        assert_eq!(host.get("searchQuery"), Value::from("typed"));

        host.set("searchQuery", "reset");
        assert_eq!(doc.property(input, "value"), Some(Value::from("reset")));
    }

    #[test]
    fn test_click_handler_updates_text() {
        let host = Component::builder("x-app").reactive("count", 0).build();
        let (runtime, app) = mount(
            r#"<button (click)="count = count + 1">+</button><b>{{ count }}</b>"#,
            &host,
        );
        let doc = runtime.document();
        let root = shadow(&runtime, app);
        let button = find_all(&runtime, root, "button")[0];
        doc.dispatch_event(button, "click", &doc.event_payload(button, "click"));
        doc.dispatch_event(button, "click", &doc.event_payload(button, "click"));

        assert_eq!(host.get("count"), Value::from(2));
        assert_eq!(texts_of(&runtime, root, "b"), vec!["2"]);
        assert_eq!(doc.listener_count(button, "click"), 1);
    }

    #[test]
    fn test_class_and_style_bindings() {
        let host = Component::builder("x-app")
            .reactive("on", true)
            .reactive("tint", "red")
            .build();
        let (runtime, app) = mount(r#"<div [class.active]="on" [style.color]="tint"></div>"#, &host);
        let doc = runtime.document();
        let div = find_all(&runtime, shadow(&runtime, app), "div")[0];
        assert!(doc.has_class(div, "active"));
        assert_eq!(doc.style_property(div, "color").as_deref(), Some("red"));

        host.set("on", false);
        host.set("tint", "blue");
        assert!(!doc.has_class(div, "active"));
        assert_eq!(doc.style_property(div, "color").as_deref(), Some("blue"));
    }

    #[test]
    fn test_pipes_resolve_on_host_then_registry() {
        let host = Component::builder("x-app")
            .reactive("name", "ada")
            .reactive("price", 5)
            .pipe("shout", |value, _| Value::from(value.to_js_string().to_uppercase()))
            .build();
        let output = compile(
            &[(
                "x-app",
                "<p>{{ name | shout }}</p><i>{{ price | currency:'EUR' }}</i><b>{{ name | missing }}</b>",
            )],
            CompileOptions::default(),
        );
        let runtime = Runtime::new();
        runtime.register_pipe("currency", |value, args| {
            Value::from(format!("{} {}", args[0].to_js_string(), value.to_js_string()))
        });
        runtime.load_tables(&output.tables).unwrap();
        define_shared(&runtime, &output, "x-app", &host);
        let app = runtime.mount(runtime.document().root(), "x-app").unwrap();

        let root = shadow(&runtime, app);
        assert_eq!(texts_of(&runtime, root, "p"), vec!["ADA"]);
        assert_eq!(texts_of(&runtime, root, "i"), vec!["EUR 5"]);
        assert_eq!(texts_of(&runtime, root, "b"), vec!["ada"]);
    }

    #[test]
    fn test_chain_follows_replaced_intermediate_object() {
        let first_name = Property::new(Value::from("Ann"));
        let host = Component::builder("x-app")
            .reactive("user", Value::object([("name", Value::Property(first_name.clone()))]))
            .build();
        let (runtime, app) = mount("<p>{{ user.name }}</p>", &host);
        let root = shadow(&runtime, app);
        assert_eq!(texts_of(&runtime, root, "p"), vec!["Ann"]);
        assert!(first_name.on_change().subscriber_count() > 0);

        let second_name = Property::new(Value::from("Bob"));
        host.set("user", Value::object([("name", Value::Property(second_name.clone()))]));
        assert_eq!(texts_of(&runtime, root, "p"), vec!["Bob"]);
        assert_eq!(first_name.on_change().subscriber_count(), 0);

        second_name.set_value(Value::from("Cy"));
        assert_eq!(texts_of(&runtime, root, "p"), vec!["Cy"]);

        first_name.set_value(Value::from("stale"));
        assert_eq!(texts_of(&runtime, root, "p"), vec!["Cy"]);
    }

    #[test]
    fn test_unresolved_dependency_warns_once() {
        let host = Component::builder("x-app").build();
        let (runtime, _app) = mount("<p>{{ ghost }}</p><b>{{ ghost }}</b>", &host);
        assert!(!runtime.warn_once("x-app", "ghost"));
        assert!(runtime.warn_once("x-app", "other"));
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Component composition
    // ═══════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_two_way_binding_links_child_and_parent() {
        let output = compile(
            &[
                ("x-field", "<span>{{ value }}</span>"),
                ("x-app", r#"<x-field [(value)]="query"></x-field>"#),
            ],
            CompileOptions::default().with_components(["x-field"]),
        );
        let parent = Component::builder("x-app").reactive("query", "start").build();
        let child = Component::builder("x-field").reactive("value", "").build();

        let runtime = Runtime::new();
        runtime.load_tables(&output.tables).unwrap();
        define_shared(&runtime, &output, "x-field", &child);
        define_shared(&runtime, &output, "x-app", &parent);
        let app = runtime.mount(runtime.document().root(), "x-app").unwrap();

        assert_eq!(child.get("value"), Value::from("start"));
        child.set("value", "typed");
        assert_eq!(parent.get("query"), Value::from("typed"));
        parent.set("query", "again");
        assert_eq!(child.get("value"), Value::from("again"));

        let field = find_all(&runtime, shadow(&runtime, app), "x-field")[0];
        assert_eq!(shadow_text(&runtime, field), "again");
    }

    #[test]
    fn test_output_subscription_waits_for_definition() {
        let output = compile(
            &[
                ("x-child", "<i>child</i>"),
                ("x-app", r#"<x-child (changed)="last = $event"></x-child>"#),
            ],
            CompileOptions::default().with_components(["x-child"]),
        );
        let parent = Component::builder("x-app").reactive("last", "").build();
        let child = Component::builder("x-child").output("changed").build();

        let runtime = Runtime::new();
        runtime.load_tables(&output.tables).unwrap();
        define_shared(&runtime, &output, "x-app", &parent);
        let app = runtime.mount(runtime.document().root(), "x-app").unwrap();
        let element = find_all(&runtime, shadow(&runtime, app), "x-child")[0];
        assert!(!runtime.is_upgraded(element));

        define_shared(&runtime, &output, "x-child", &child);
        assert!(runtime.is_upgraded(element));
        child.emit("changed", "early");
        assert_eq!(parent.get("last"), Value::from(""));

        runtime.flush_microtasks();
        child.emit("changed", "hi");
        assert_eq!(parent.get("last"), Value::from("hi"));
    }

    #[test]
    fn test_deferred_property_reaches_late_child() {
        let output = compile(
            &[
                ("x-label", "<b>{{ label }}</b>"),
                ("x-app", r#"<x-label [label]="title"></x-label>"#),
            ],
            CompileOptions::default().with_components(["x-label"]),
        );
        let parent = Component::builder("x-app").reactive("title", "Hello").build();
        let child = Component::builder("x-label").reactive("label", "").build();

        let runtime = Runtime::new();
        runtime.load_tables(&output.tables).unwrap();
        define_shared(&runtime, &output, "x-app", &parent);
        let app = runtime.mount(runtime.document().root(), "x-app").unwrap();

        define_shared(&runtime, &output, "x-label", &child);
        assert_eq!(runtime.pending_microtasks(), 1);
        runtime.flush_microtasks();
        assert_eq!(child.get("label"), Value::from("Hello"));

        let label = find_all(&runtime, shadow(&runtime, app), "x-label")[0];
        assert_eq!(shadow_text(&runtime, label), "Hello");
    }

    #[test]
    fn test_deferred_work_skips_detached_elements() {
        let output = compile(
            &[
                ("x-late", "<b>{{ label }}</b>"),
                ("x-app", r#"@if (show) { <x-late [label]="title"></x-late> }"#),
            ],
            CompileOptions::default().with_components(["x-late"]),
        );
        let parent = Component::builder("x-app")
            .reactive("show", true)
            .reactive("title", "t")
            .build();
        let child = Component::builder("x-late").reactive("label", "").build();

        let runtime = Runtime::new();
        runtime.load_tables(&output.tables).unwrap();
        define_shared(&runtime, &output, "x-app", &parent);
        let app = runtime.mount(runtime.document().root(), "x-app").unwrap();
        let late = find_all(&runtime, shadow(&runtime, app), "x-late")[0];

        parent.set("show", false);
        assert!(!runtime.document().is_connected(late));

        define_shared(&runtime, &output, "x-late", &child);
        runtime.flush_microtasks();
        assert!(!runtime.is_upgraded(late));
        assert_eq!(child.get("label"), Value::from(""));
    }

    #[test]
    fn test_pending_properties_replay_on_upgrade() {
        let output = compile(&[("x-later", "<b>{{ label }}</b>")], CompileOptions::default());
        let child = Component::builder("x-later").reactive("label", "").build();

        let runtime = Runtime::new();
        runtime.load_tables(&output.tables).unwrap();
        let element = runtime.mount(runtime.document().root(), "x-later").unwrap();
        runtime.set_property(element, "label", Value::from("queued"));
        assert_eq!(
            runtime.pending_properties(element).unwrap().get("label"),
            Some(&Value::from("queued"))
        );

        define_shared(&runtime, &output, "x-later", &child);
        assert_eq!(child.get("label"), Value::from("queued"));
        assert!(runtime.pending_properties(element).is_none());
        assert_eq!(shadow_text(&runtime, element), "queued");
    }

    #[test]
    fn test_loop_components_get_scopes_that_are_released() {
        let output = compile(
            &[
                ("x-badge", "<b>{{ label }}</b>"),
                ("x-app", r#"@for (u of users) { <x-badge [label]="u.name"></x-badge> }"#),
            ],
            CompileOptions::default().with_components(["x-badge"]),
        );
        let users = Value::array(vec![
            Value::object([("name", Value::from("Ann"))]),
            Value::object([("name", Value::from("Bob"))]),
        ]);
        let parent = Component::builder("x-app").reactive("users", users).build();

        let runtime = Runtime::new();
        runtime.load_tables(&output.tables).unwrap();
        let compiled = output.components.iter().find(|c| c.selector == "x-badge").unwrap();
        runtime
            .define(ComponentDefinition::from_compiled(compiled, || {
                Component::builder("x-badge").reactive("label", "").build() as HostRef
            }))
            .unwrap();
        define_shared(&runtime, &output, "x-app", &parent);
        let app = runtime.mount(runtime.document().root(), "x-app").unwrap();

        let badges = find_all(&runtime, shadow(&runtime, app), "x-badge");
        let labels: Vec<String> = badges.iter().map(|b| shadow_text(&runtime, *b)).collect();
        assert_eq!(labels, vec!["Ann", "Bob"]);
        assert_eq!(runtime.scopes().len(), 2);
        let first = runtime.instance(badges[0]).unwrap();
        assert!(first.parent_scope().is_some());
        assert!(first.loop_context().contains_key("u"));

        parent.set("users", Value::array(vec![]));
        assert!(runtime.scopes().is_empty());
        assert!(!runtime.is_upgraded(badges[0]));
    }

    #[test]
    fn test_loop_scopes_on_foreign_custom_elements_are_released() {
        let host = Component::builder("x-app")
            .reactive("icons", Value::array(vec!["star".into(), "moon".into()]))
            .build();
        let (runtime, app) = mount("@for (icon of icons) { <my-icon>{{ icon }}</my-icon> }", &host);
        let root = shadow(&runtime, app);
        assert_eq!(texts_of(&runtime, root, "my-icon"), vec!["star", "moon"]);
        assert_eq!(runtime.scopes().len(), 2);

        host.set("icons", Value::array(vec!["sun".into(), "rain".into(), "snow".into()]));
        assert_eq!(texts_of(&runtime, root, "my-icon"), vec!["sun", "rain", "snow"]);
        assert_eq!(runtime.scopes().len(), 3);

        host.set("icons", Value::array(vec![]));
        assert!(runtime.scopes().is_empty());
    }

    #[test]
    fn test_directive_receives_inputs_and_emits_outputs() {
        let output = compile(
            &[(
                "x-app",
                r#"<span apptooltip [text]="tip" (shown)="last = $event"></span>"#,
            )],
            CompileOptions::default().with_directives(["[appTooltip]"]),
        );
        let host = Component::builder("x-app")
            .reactive("tip", "hello")
            .reactive("last", "")
            .build();

        let runtime = Runtime::new();
        runtime.define_directive("[appTooltip]", |_, _| {
            Component::builder("[appTooltip]")
                .reactive("text", "")
                .output("shown")
                .build() as HostRef
        });
        runtime.load_tables(&output.tables).unwrap();
        define_shared(&runtime, &output, "x-app", &host);
        let app = runtime.mount(runtime.document().root(), "x-app").unwrap();

        let span = find_all(&runtime, shadow(&runtime, app), "span")[0];
        let directives = runtime.directives_on(span);
        assert_eq!(directives.len(), 1);
        let text = directives[0].reactive_property("text").unwrap();
        assert_eq!(text.get(), Value::from("hello"));

        host.set("tip", "updated");
        assert_eq!(text.get(), Value::from("updated"));

        directives[0].output("shown").unwrap().emit(&Value::from("yes"));
        assert_eq!(host.get("last"), Value::from("yes"));
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_hydration_waits_for_tables() {
        let output = compile(&[("x-app", "<p>{{ greeting }}</p>")], CompileOptions::default());
        let host = Component::builder("x-app").reactive("greeting", "hi").build();

        let runtime = Runtime::new();
        define_shared(&runtime, &output, "x-app", &host);
        let app = runtime.mount(runtime.document().root(), "x-app").unwrap();
        assert!(!runtime.is_upgraded(app));

        runtime.load_tables(&output.tables).unwrap();
        assert!(runtime.is_upgraded(app));
        assert_eq!(shadow_text(&runtime, app), "hi");
    }

    #[test]
    fn test_removal_runs_destroy_and_releases_subscriptions() {
        let destroyed = Rc::new(Cell::new(false));
        let flag = destroyed.clone();
        let host = Component::builder("x-app")
            .reactive("name", "a")
            .on_destroy(move |_| flag.set(true))
            .build();
        let (runtime, app) = mount(r#"<p [title]="name">{{ name }}</p>"#, &host);
        let instance = runtime.instance(app).unwrap();
        assert!(instance.subscription_count() > 0);

        runtime.remove_node(app);
        assert!(destroyed.get());
        assert!(!runtime.is_upgraded(app));
        assert_eq!(instance.subscription_count(), 0);
        assert!(instance.markers().is_empty());

        host.set("name", "b");
        let p = find_all(&runtime, instance.shadow_root(), "p")[0];
        assert_eq!(runtime.document().property(p, "title"), Some(Value::from("a")));
    }

    #[test]
    fn test_duplicate_definition_is_ignored() {
        let host = Component::builder("x-app").reactive("name", "first").build();
        let (runtime, _app) = mount("<p>{{ name }}</p>", &host);
        let output = compile(&[("x-app", "<p>other</p>")], CompileOptions::default());
        define_shared(&runtime, &output, "x-app", &host);

        let second = runtime.mount(runtime.document().root(), "x-app").unwrap();
        assert_eq!(shadow_text(&runtime, second), "first");
    }
}
