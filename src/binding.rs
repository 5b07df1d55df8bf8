//! Binding engine.
//!
//! Applies the compact binding tuples of a component to the `data-lid`
//! elements of its shadow tree (or of a freshly cloned region) and keeps them
//! in sync with their dependencies. Evaluation failures are logged per binding
//! and never reach sibling bindings; integrity failures (a table id with no
//! entry) are returned to the caller.

use lazy_static::lazy_static;
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use tracing::{debug, error, warn};

use crate::codegen::{COMPONENT_MARKER_ATTR, DIRECTIVES_ATTR, LOCAL_ID_ATTR};
use crate::compact::{CompactBinding, CompactDep, CompactPipe};
use crate::dom::NodeId;
use crate::eval::ExprFn;
use crate::host::PipeFn;
use crate::reactive::{Property, Subscription, SubscriptionSet};
use crate::runtime::{ComponentInstance, Runtime, RuntimeError, Updater};
use crate::scope::Locals;
use crate::validate::BindingKind;
use crate::value::Value;

lazy_static! {
    /// Element properties written as properties rather than attributes.
    static ref NATIVE_PROPERTIES: HashSet<&'static str> = [
        "value", "checked", "disabled", "selected", "hidden", "id", "title", "placeholder",
        "type", "name", "href", "src", "alt", "tabIndex", "readOnly", "required", "multiple",
        "min", "max", "step", "indeterminate", "className", "htmlFor", "lang", "dir",
        "draggable", "contentEditable", "selectedIndex",
    ]
    .into_iter()
    .collect();
}

/// Where a set of bindings is applied: which component, which loop locals,
/// and which subscription set owns what gets created.
pub(crate) struct BindContext<'a> {
    pub runtime: &'a Runtime,
    pub instance: &'a Rc<ComponentInstance>,
    pub locals: &'a Locals,
    pub subscriptions: &'a SubscriptionSet,
}

/// A pipe with its name resolved and its argument expressions looked up.
pub(crate) struct ResolvedPipe {
    name: String,
    args: Vec<ExprFn>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROCESSING
// ═══════════════════════════════════════════════════════════════════════════════

/// Apply the bindings of every `data-lid` element under `roots`.
pub(crate) fn process_bindings(ctx: &BindContext<'_>, roots: &[NodeId]) -> Result<(), RuntimeError> {
    let doc = ctx.runtime.document();
    for root in roots {
        for element in std::iter::once(*root).chain(doc.descendants(*root)) {
            let Some(lid) = doc.attribute(element, LOCAL_ID_ATTR) else {
                continue;
            };
            let Some(bindings) = ctx.instance.definition().bindings.get(&lid) else {
                continue;
            };
            for binding in bindings {
                apply_binding(ctx, element, binding)?;
            }
        }
    }
    Ok(())
}

fn apply_binding(ctx: &BindContext<'_>, element: NodeId, binding: &CompactBinding) -> Result<(), RuntimeError> {
    let name = ctx.runtime.string(binding.name)?;
    match binding.kind {
        BindingKind::Property => bind_property(ctx, element, &name, binding),
        BindingKind::Event => bind_event(ctx, element, &name, binding),
        BindingKind::TwoWay => bind_two_way(ctx, element, &name, binding),
        BindingKind::Class => {
            let class = name.clone();
            let apply = effect(ctx, element, &name, binding, move |runtime, _, value| {
                runtime
                    .document()
                    .toggle_class(element, &class, value.unwrap_property().truthy());
            })?;
            apply();
            Ok(())
        }
        BindingKind::Style => {
            let property = name.clone();
            let apply = effect(ctx, element, &name, binding, move |runtime, _, value| {
                runtime.document().set_style_property(
                    element,
                    &property,
                    &value.unwrap_property().to_js_string(),
                );
            })?;
            apply();
            Ok(())
        }
        BindingKind::Ref => Ok(()),
    }
}

fn expression_id(binding: &CompactBinding, name: &str) -> Result<u32, RuntimeError> {
    binding.id.ok_or_else(|| {
        RuntimeError::InvalidTuple(format!("binding '{}' has no expression id", name))
    })
}

/// Build an updater that evaluates the binding's expression, pipes the
/// result and hands it to `sink`. It re-runs whenever a dependency changes.
fn effect(
    ctx: &BindContext<'_>,
    element: NodeId,
    name: &str,
    binding: &CompactBinding,
    sink: impl Fn(&Runtime, &Rc<ComponentInstance>, Value) + 'static,
) -> Result<Updater, RuntimeError> {
    let expr_id = expression_id(binding, name)?;
    let expr = ctx.runtime.expression(expr_id)?;
    let pipes = resolve_pipes(
        ctx.runtime,
        binding.extras.as_ref().and_then(|e| e.p.as_deref()),
    )?;

    let runtime = ctx.runtime.downgrade();
    let instance = Rc::downgrade(ctx.instance);
    let locals = ctx.locals.clone();
    let binding_name = name.to_string();
    let update: Updater = Rc::new(move || {
        let (Some(runtime), Some(instance)) = (runtime.upgrade(), instance.upgrade()) else {
            return;
        };
        match expr(instance.host(), &locals) {
            Ok(value) => {
                let value = apply_pipes(&runtime, &instance, value, &pipes, &locals);
                sink(&runtime, &instance, value);
            }
            Err(err) => error!(
                selector = instance.selector(),
                binding = %binding_name,
                element = %element,
                expr_id,
                "binding evaluation failed: {}",
                err
            ),
        }
    });

    subscribe_dependencies(ctx, binding.deps.as_deref().unwrap_or_default(), update.clone())?;
    Ok(update)
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROPERTY & TWO-WAY
// ═══════════════════════════════════════════════════════════════════════════════

fn bind_property(
    ctx: &BindContext<'_>,
    element: NodeId,
    name: &str,
    binding: &CompactBinding,
) -> Result<(), RuntimeError> {
    let property = name.to_string();
    let update = effect(ctx, element, name, binding, move |runtime, _, value| {
        set_child_property(runtime, element, &property, value);
    })?;

    if let Some(source) = binding.extras.as_ref().and_then(|e| e.s.as_deref()) {
        match resolve_reactive(ctx.instance, ctx.locals, source) {
            Some(prop) => {
                let update = update.clone();
                ctx.subscriptions.push(prop.subscribe(move |_| update()));
            }
            None => warn_unresolved(ctx, source),
        }
    }

    ctx.runtime.register_updater(element, update.clone());
    apply_when_ready(ctx.runtime, element, move || update());
    Ok(())
}

/// Run `apply` now, or once the element's custom tag is defined when the
/// element is a component that has not been upgraded yet.
fn apply_when_ready(runtime: &Runtime, element: NodeId, apply: impl Fn() + 'static) {
    let doc = runtime.document();
    let tag = doc.tag_name(element).unwrap_or_default();
    if !runtime.is_component_element(element) || runtime.is_upgraded(element) {
        apply();
        return;
    }

    let weak = runtime.downgrade();
    runtime.when_defined(&tag, move || {
        let Some(runtime) = weak.upgrade() else {
            return;
        };
        if runtime.document().is_connected(element) {
            apply();
        } else {
            debug!(element = %element, "skipping deferred binding on a detached element");
        }
    });
}

fn bind_two_way(
    ctx: &BindContext<'_>,
    element: NodeId,
    name: &str,
    binding: &CompactBinding,
) -> Result<(), RuntimeError> {
    bind_property(ctx, element, name, binding)?;

    let Some(target) = binding.extras.as_ref().and_then(|e| e.t.clone()) else {
        return Ok(());
    };
    let Some(host_prop) = ctx.instance.host().reactive_property(&target) else {
        warn_unresolved(ctx, &target);
        return Ok(());
    };

    if link_two_way(ctx.runtime, element, name, &host_prop, ctx.subscriptions) {
        return Ok(());
    }
    if ctx.runtime.is_component_element(element) && !ctx.runtime.is_upgraded(element) {
        let tag = ctx.runtime.document().tag_name(element).unwrap_or_default();
        let weak = ctx.runtime.downgrade();
        let subscriptions = ctx.subscriptions.clone();
        let name = name.to_string();
        ctx.runtime.when_defined(&tag, move || {
            let Some(runtime) = weak.upgrade() else {
                return;
            };
            if runtime.document().is_connected(element) {
                link_two_way(&runtime, element, &name, &host_prop, &subscriptions);
            }
        });
    }
    Ok(())
}

/// Write changes of the child's `name` property back to `host_prop`.
fn link_two_way(
    runtime: &Runtime,
    element: NodeId,
    name: &str,
    host_prop: &Property<Value>,
    subscriptions: &SubscriptionSet,
) -> bool {
    let Some(child) = runtime
        .host(element)
        .and_then(|child| child.reactive_property(name))
    else {
        return false;
    };
    let host_prop = host_prop.clone();
    subscriptions.push(child.subscribe(move |value| host_prop.set_value(value.clone())));
    true
}

/// Assign a bound value onto `element`. Priority: a reactive property of an
/// upgraded component, any member of an upgraded component, a pending
/// property of a component awaiting upgrade, a native property, an attribute.
/// Directives on the element that declare `name` receive the value as well.
pub(crate) fn set_child_property(runtime: &Runtime, element: NodeId, name: &str, value: Value) {
    let doc = runtime.document();
    if let Some(child) = runtime.host(element) {
        match child.reactive_property(name) {
            Some(prop) => prop.set_value(value.unwrap_property()),
            None => {
                if let Err(err) = child.set_member(name, value.clone()) {
                    error!(selector = child.selector(), binding = %name, "failed to set member: {}", err);
                }
            }
        }
    } else if runtime.is_component_element(element) {
        runtime.set_pending_property(element, name, value.clone());
    } else if NATIVE_PROPERTIES.contains(name) || doc.property(element, name).is_some() {
        doc.set_property(element, name, value.unwrap_property());
    } else {
        doc.set_attribute(element, name, &value.unwrap_property().to_js_string());
    }

    for directive in runtime.directives_on(element) {
        if let Some(prop) = directive.reactive_property(name) {
            prop.set_value(value.unwrap_property());
        } else if directive.has_member(name) {
            if let Err(err) = directive.set_member(name, value.clone()) {
                error!(selector = directive.selector(), binding = %name, "failed to set directive member: {}", err);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENTS & OUTPUTS
// ═══════════════════════════════════════════════════════════════════════════════

type Listener = Rc<dyn Fn(&Value)>;

fn bind_event(
    ctx: &BindContext<'_>,
    element: NodeId,
    name: &str,
    binding: &CompactBinding,
) -> Result<(), RuntimeError> {
    if !ctx.runtime.mark_event_bound(element, name) {
        return Ok(());
    }
    let handler_id = expression_id(binding, name)?;
    let handler = ctx.runtime.handler(handler_id)?;

    let instance = Rc::downgrade(ctx.instance);
    let locals = ctx.locals.clone();
    let event = name.to_string();
    let listener: Listener = Rc::new(move |payload: &Value| {
        let Some(instance) = instance.upgrade() else {
            return;
        };
        if let Err(err) = handler(instance.host(), &locals, payload.clone()) {
            error!(
                selector = instance.selector(),
                binding = %event,
                element = %element,
                handler_id,
                "event handler failed: {}",
                err
            );
        }
    });

    let doc = ctx.runtime.document();
    let output_capable = doc.has_attribute(element, COMPONENT_MARKER_ATTR)
        || doc.has_attribute(element, DIRECTIVES_ATTR);
    if output_capable {
        if subscribe_output(ctx.runtime, element, name, &listener, ctx.subscriptions) {
            return Ok(());
        }
        if ctx.runtime.is_component_element(element) && !ctx.runtime.is_upgraded(element) {
            let tag = doc.tag_name(element).unwrap_or_default();
            let weak = ctx.runtime.downgrade();
            let subscriptions = ctx.subscriptions.clone();
            let event = name.to_string();
            ctx.runtime.when_defined(&tag, move || {
                let Some(runtime) = weak.upgrade() else {
                    return;
                };
                if !runtime.document().is_connected(element) {
                    return;
                }
                if !subscribe_output(&runtime, element, &event, &listener, &subscriptions) {
                    add_listener(&runtime, element, &event, listener);
                }
            });
            return Ok(());
        }
    }
    add_listener(ctx.runtime, element, name, listener);
    Ok(())
}

fn add_listener(runtime: &Runtime, element: NodeId, event: &str, listener: Listener) {
    runtime
        .document()
        .add_event_listener(element, event, move |payload| listener(payload));
}

/// Subscribe to the output `name` of a directive on the element, or of the
/// element's own component. Directives are searched first.
fn subscribe_output(
    runtime: &Runtime,
    element: NodeId,
    name: &str,
    listener: &Listener,
    subscriptions: &SubscriptionSet,
) -> bool {
    let publisher = runtime
        .directives_on(element)
        .iter()
        .find_map(|directive| directive.output(name))
        .or_else(|| runtime.host(element).and_then(|host| host.output(name)));
    match publisher {
        Some(publisher) => {
            let listener = listener.clone();
            subscriptions.push(publisher.subscribe(move |value| listener(value)));
            true
        }
        None => false,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEPENDENCIES
// ═══════════════════════════════════════════════════════════════════════════════

/// Subscribe `callback` to every dependency in `deps`.
pub(crate) fn subscribe_dependencies(
    ctx: &BindContext<'_>,
    deps: &[CompactDep],
    callback: Updater,
) -> Result<(), RuntimeError> {
    for dep in deps {
        let path: Vec<String> = match dep {
            CompactDep::Simple(idx) => vec![ctx.runtime.string(*idx)?],
            CompactDep::Chain(indices) => indices
                .iter()
                .map(|idx| ctx.runtime.string(*idx))
                .collect::<Result<_, _>>()?,
        };
        let Some((first, rest)) = path.split_first() else {
            continue;
        };

        if let Some(local) = ctx.locals.get(first) {
            let subscription = match local {
                Value::Property(prop) => Some(subscribe_property_chain(prop, rest, callback.clone())),
                other => subscribe_value_chain(other, rest, callback.clone()),
            };
            if let Some(subscription) = subscription {
                ctx.subscriptions.push(subscription);
            }
            continue;
        }

        match resolve_reactive(ctx.instance, ctx.locals, first) {
            Some(prop) => {
                ctx.subscriptions
                    .push(subscribe_property_chain(&prop, rest, callback.clone()));
            }
            None => {
                if !ctx.instance.host().has_member(first) {
                    warn_unresolved(ctx, first);
                }
            }
        }
    }
    Ok(())
}

fn warn_unresolved(ctx: &BindContext<'_>, dep: &str) {
    if ctx.runtime.warn_once(ctx.instance.selector(), dep) {
        warn!(
            selector = ctx.instance.selector(),
            dep = %dep,
            "dependency is neither a loop local nor a reactive property; binding will not update"
        );
    }
}

/// The reactive property `name` resolves to, walking outward through the
/// scope chain. Loop locals shadow host members.
fn resolve_reactive(
    instance: &ComponentInstance,
    locals: &Locals,
    name: &str,
) -> Option<Property<Value>> {
    if locals.contains_key(name) {
        return None;
    }
    if let Some(prop) = instance.host().reactive_property(name) {
        return Some(prop);
    }
    let mut scope = instance.parent_scope().cloned();
    while let Some(current) = scope {
        if current.locals.contains_key(name) {
            return None;
        }
        if let Some(prop) = current.host.reactive_property(name) {
            return Some(prop);
        }
        scope = current.parent.clone();
    }
    None
}

/// Subscribe to `prop` and, through `rest`, to reactive members of its value.
/// When `prop` emits a new value the tail subscription is rebuilt against it.
fn subscribe_property_chain(prop: &Property<Value>, rest: &[String], callback: Updater) -> Subscription {
    if rest.is_empty() {
        return prop.subscribe(move |_| callback());
    }

    let tail = Rc::new(RefCell::new(subscribe_value_chain(
        &prop.get(),
        rest,
        callback.clone(),
    )));
    let path: Rc<[String]> = rest.into();
    let outer = {
        let tail = tail.clone();
        prop.subscribe(move |value| {
            let previous = tail.borrow_mut().take();
            if let Some(previous) = previous {
                previous.unsubscribe();
            }
            let next = subscribe_value_chain(value, &path, callback.clone());
            *tail.borrow_mut() = next;
            callback();
        })
    };

    Subscription::new(move || {
        outer.unsubscribe();
        let last = tail.borrow_mut().take();
        if let Some(last) = last {
            last.unsubscribe();
        }
    })
}

fn subscribe_value_chain(value: &Value, path: &[String], callback: Updater) -> Option<Subscription> {
    let (first, rest) = path.split_first()?;
    let target = value.unwrap_property();
    let member = match &target {
        Value::Object(map) => map.borrow().get(first).cloned(),
        _ => None,
    }?;
    match member {
        Value::Property(prop) => Some(subscribe_property_chain(&prop, rest, callback)),
        other => subscribe_value_chain(&other, rest, callback),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PIPES
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) fn resolve_pipes(
    runtime: &Runtime,
    pipes: Option<&[CompactPipe]>,
) -> Result<Vec<ResolvedPipe>, RuntimeError> {
    pipes
        .unwrap_or_default()
        .iter()
        .map(|CompactPipe(name, args)| {
            Ok(ResolvedPipe {
                name: runtime.string(*name)?,
                args: args
                    .iter()
                    .map(|id| runtime.expression(*id))
                    .collect::<Result<_, _>>()?,
            })
        })
        .collect()
}

/// Thread `value` through `pipes`. Pipes resolve on the host, then on the
/// hosts of enclosing scopes, then in the runtime registry. Unknown pipes are
/// skipped with a warning.
pub(crate) fn apply_pipes(
    runtime: &Runtime,
    instance: &ComponentInstance,
    value: Value,
    pipes: &[ResolvedPipe],
    locals: &Locals,
) -> Value {
    let mut value = value;
    for pipe in pipes {
        let Some(function) = find_pipe(runtime, instance, &pipe.name) else {
            warn!(selector = instance.selector(), pipe = %pipe.name, "unknown pipe; value passed through");
            continue;
        };
        let args = pipe
            .args
            .iter()
            .map(|arg| {
                arg(instance.host(), locals).unwrap_or_else(|err| {
                    error!(selector = instance.selector(), pipe = %pipe.name, "pipe argument failed: {}", err);
                    Value::Undefined
                })
            })
            .collect();
        value = function(value.unwrap_property(), args);
    }
    value
}

fn find_pipe(runtime: &Runtime, instance: &ComponentInstance, name: &str) -> Option<PipeFn> {
    if let Some(pipe) = instance.host().pipe(name) {
        return Some(pipe);
    }
    let mut scope = instance.parent_scope().cloned();
    while let Some(current) = scope {
        if let Some(pipe) = current.host.pipe(name) {
            return Some(pipe);
        }
        scope = current.parent.clone();
    }
    runtime.pipe(name)
}
