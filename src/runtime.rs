//! Hydration runtime.
//!
//! A [`Runtime`] owns the arena [`Document`], the installed expression tables
//! and the custom-element registry. Component elements are upgraded when they
//! become connected and their definition is known: the host is created, the
//! compiled HTML is rendered into a shadow root, bindings are applied and the
//! marker controllers take over the dynamic regions.
//!
//! Everything runs on one thread. The only deferred work is `when_defined`
//! callbacks, which run on [`Runtime::flush_microtasks`].

use indexmap::{IndexMap, IndexSet};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::binding;
use crate::codegen::{ExpressionTables, GeneratedTemplate, COMPONENT_MARKER_ATTR, DIRECTIVES_ATTR};
use crate::compact::{CompactBinding, MarkerConfigEntries};
use crate::component::CompiledComponent;
use crate::dom::{Document, NodeId, NodeKind};
use crate::eval::{compile_expression, compile_handler, EvalError, ExprFn, HandlerFn};
use crate::host::{HostRef, PipeFn};
use crate::markers::MarkerManager;
use crate::reactive::SubscriptionSet;
use crate::scope::{Locals, Scope, ScopeRegistry};
use crate::value::Value;

/// Attribute linking a component cloned inside a loop to its registered scope.
pub const SCOPE_ID_ATTR: &str = "data-fluff-scope-id";

pub type HostFactory = Rc<dyn Fn() -> HostRef>;
pub type DirectiveFactory = Rc<dyn Fn(&Document, NodeId) -> HostRef>;
pub(crate) type Updater = Rc<dyn Fn()>;
type Task = Box<dyn FnOnce()>;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Missing compiled expression #{0}: expression table does not match the runtime")]
    MissingExpression(u32),
    #[error("Missing compiled handler #{0}: handler table does not match the runtime")]
    MissingHandler(u32),
    #[error("Missing string table entry #{0}")]
    MissingString(u32),
    #[error("Expression tables have not been loaded")]
    TablesNotLoaded,
    #[error("No component definition for <{0}>")]
    UnknownComponent(String),
    #[error("Invalid compact tuple: {0}")]
    InvalidTuple(String),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("Failed to render HTML: {0}")]
    Html(#[from] std::io::Error),
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEFINITIONS & TABLES
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything needed to upgrade one custom element tag.
pub struct ComponentDefinition {
    pub selector: String,
    pub html: String,
    pub bindings: IndexMap<String, Vec<CompactBinding>>,
    pub markers: MarkerConfigEntries,
    factory: HostFactory,
}

impl ComponentDefinition {
    pub fn new(
        selector: &str,
        template: &GeneratedTemplate,
        factory: impl Fn() -> HostRef + 'static,
    ) -> Self {
        ComponentDefinition {
            selector: selector.to_string(),
            html: template.html.clone(),
            bindings: template.bindings.clone(),
            markers: template.markers.clone(),
            factory: Rc::new(factory),
        }
    }

    pub fn from_compiled(
        compiled: &CompiledComponent,
        factory: impl Fn() -> HostRef + 'static,
    ) -> Self {
        Self::new(&compiled.selector, &compiled.generated, factory)
    }

    pub fn with_styles(mut self, css: &str) -> Self {
        if !css.trim().is_empty() {
            self.html.push_str("<style>");
            self.html.push_str(css);
            self.html.push_str("</style>");
        }
        self
    }
}

struct Tables {
    expressions: Vec<ExprFn>,
    handlers: Vec<HandlerFn>,
    strings: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPONENT INSTANCES
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-element state of an upgraded component.
pub struct ComponentInstance {
    element: NodeId,
    shadow_root: NodeId,
    host: HostRef,
    definition: Rc<ComponentDefinition>,
    parent_scope: Option<Rc<Scope>>,
    loop_context: Locals,
    subscriptions: SubscriptionSet,
    markers: MarkerManager,
    directive_elements: RefCell<Vec<NodeId>>,
}

impl ComponentInstance {
    pub fn element(&self) -> NodeId {
        self.element
    }

    pub fn shadow_root(&self) -> NodeId {
        self.shadow_root
    }

    pub fn host(&self) -> &HostRef {
        &self.host
    }

    pub fn selector(&self) -> &str {
        &self.definition.selector
    }

    pub fn definition(&self) -> &ComponentDefinition {
        &self.definition
    }

    pub fn parent_scope(&self) -> Option<&Rc<Scope>> {
        self.parent_scope.as_ref()
    }

    /// Loop locals inherited from the scope the element was cloned in.
    pub fn loop_context(&self) -> &Locals {
        &self.loop_context
    }

    pub fn markers(&self) -> &MarkerManager {
        &self.markers
    }

    pub(crate) fn subscriptions(&self) -> &SubscriptionSet {
        &self.subscriptions
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUNTIME
// ═══════════════════════════════════════════════════════════════════════════════

struct RuntimeInner {
    document: Document,
    tables: RefCell<Option<Rc<Tables>>>,
    definitions: RefCell<HashMap<String, Rc<ComponentDefinition>>>,
    directive_factories: RefCell<HashMap<String, DirectiveFactory>>,
    directives: RefCell<HashMap<NodeId, Vec<HostRef>>>,
    pipes: RefCell<HashMap<String, PipeFn>>,
    scopes: ScopeRegistry,
    instances: RefCell<HashMap<NodeId, Rc<ComponentInstance>>>,
    pending_props: RefCell<HashMap<NodeId, IndexMap<String, Value>>>,
    pending_init: RefCell<IndexSet<NodeId>>,
    waiting: RefCell<HashMap<String, Vec<Task>>>,
    microtasks: RefCell<VecDeque<Task>>,
    updaters: RefCell<HashMap<NodeId, Vec<Updater>>>,
    bound_events: RefCell<HashSet<(NodeId, String)>>,
    warned: RefCell<HashSet<(String, String)>>,
}

#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

/// Non-owning handle captured by subscription callbacks.
#[derive(Clone)]
pub struct WeakRuntime(Weak<RuntimeInner>);

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(|inner| Runtime { inner })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_document(Document::new())
    }

    pub fn with_document(document: Document) -> Self {
        Runtime {
            inner: Rc::new(RuntimeInner {
                document,
                tables: RefCell::new(None),
                definitions: RefCell::new(HashMap::new()),
                directive_factories: RefCell::new(HashMap::new()),
                directives: RefCell::new(HashMap::new()),
                pipes: RefCell::new(HashMap::new()),
                scopes: ScopeRegistry::new(),
                instances: RefCell::new(HashMap::new()),
                pending_props: RefCell::new(HashMap::new()),
                pending_init: RefCell::new(IndexSet::new()),
                waiting: RefCell::new(HashMap::new()),
                microtasks: RefCell::new(VecDeque::new()),
                updaters: RefCell::new(HashMap::new()),
                bound_events: RefCell::new(HashSet::new()),
                warned: RefCell::new(HashSet::new()),
            }),
        }
    }

    pub fn document(&self) -> &Document {
        &self.inner.document
    }

    pub fn downgrade(&self) -> WeakRuntime {
        WeakRuntime(Rc::downgrade(&self.inner))
    }

    pub fn scopes(&self) -> &ScopeRegistry {
        &self.inner.scopes
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Tables
    // ───────────────────────────────────────────────────────────────────────────

    /// Install the three shared tables. Indices must match the ones the
    /// compiler assigned. Components that connected early hydrate now.
    pub fn set_expression_table(
        &self,
        expressions: Vec<ExprFn>,
        handlers: Vec<HandlerFn>,
        strings: Vec<String>,
    ) -> Result<(), RuntimeError> {
        debug!(
            expressions = expressions.len(),
            handlers = handlers.len(),
            strings = strings.len(),
            "installing expression tables"
        );
        *self.inner.tables.borrow_mut() = Some(Rc::new(Tables {
            expressions,
            handlers,
            strings,
        }));

        let pending: Vec<NodeId> = self.inner.pending_init.borrow_mut().drain(..).collect();
        for element in pending {
            self.connect_element(element)?;
        }
        Ok(())
    }

    /// Lower the serialized table sources and install them.
    pub fn load_tables(&self, tables: &ExpressionTables) -> Result<(), RuntimeError> {
        let expressions = tables
            .expressions
            .iter()
            .map(|source| compile_expression(source))
            .collect::<Result<Vec<_>, _>>()?;
        let handlers = tables
            .handlers
            .iter()
            .map(|source| compile_handler(source))
            .collect::<Result<Vec<_>, _>>()?;
        self.set_expression_table(expressions, handlers, tables.strings.clone())
    }

    pub fn tables_loaded(&self) -> bool {
        self.inner.tables.borrow().is_some()
    }

    fn tables(&self) -> Result<Rc<Tables>, RuntimeError> {
        self.inner
            .tables
            .borrow()
            .clone()
            .ok_or(RuntimeError::TablesNotLoaded)
    }

    pub fn expression(&self, id: u32) -> Result<ExprFn, RuntimeError> {
        self.tables()?
            .expressions
            .get(id as usize)
            .cloned()
            .ok_or(RuntimeError::MissingExpression(id))
    }

    pub fn handler(&self, id: u32) -> Result<HandlerFn, RuntimeError> {
        self.tables()?
            .handlers
            .get(id as usize)
            .cloned()
            .ok_or(RuntimeError::MissingHandler(id))
    }

    pub fn string(&self, id: u32) -> Result<String, RuntimeError> {
        self.tables()?
            .strings
            .get(id as usize)
            .cloned()
            .ok_or(RuntimeError::MissingString(id))
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Registries
    // ───────────────────────────────────────────────────────────────────────────

    /// Register a component tag and upgrade connected elements that use it.
    pub fn define(&self, definition: ComponentDefinition) -> Result<(), RuntimeError> {
        let selector = definition.selector.clone();
        if self.is_defined(&selector) {
            warn!(selector = %selector, "component is already defined; ignoring redefinition");
            return Ok(());
        }
        self.inner
            .definitions
            .borrow_mut()
            .insert(selector.clone(), Rc::new(definition));

        let waiting = self.inner.waiting.borrow_mut().remove(&selector);
        if let Some(waiting) = waiting {
            self.inner.microtasks.borrow_mut().extend(waiting);
        }

        let doc = self.document();
        let candidates: Vec<NodeId> = doc
            .shadow_including_inclusive_descendants(doc.root())
            .into_iter()
            .filter(|node| doc.tag_name(*node).as_deref() == Some(selector.as_str()))
            .collect();
        for element in candidates {
            self.connect_element(element)?;
        }
        Ok(())
    }

    pub fn is_defined(&self, tag: &str) -> bool {
        self.inner.definitions.borrow().contains_key(tag)
    }

    fn definition(&self, tag: &str) -> Option<Rc<ComponentDefinition>> {
        self.inner.definitions.borrow().get(tag).cloned()
    }

    /// Register a directive instantiated on elements listing `selector`
    /// in their `data-fluff-directives` attribute.
    pub fn define_directive(
        &self,
        selector: &str,
        factory: impl Fn(&Document, NodeId) -> HostRef + 'static,
    ) {
        self.inner
            .directive_factories
            .borrow_mut()
            .insert(selector.to_string(), Rc::new(factory));
    }

    pub fn register_pipe(&self, name: &str, pipe: impl Fn(Value, Vec<Value>) -> Value + 'static) {
        self.inner
            .pipes
            .borrow_mut()
            .insert(name.to_string(), Rc::new(pipe));
    }

    pub fn pipe(&self, name: &str) -> Option<PipeFn> {
        self.inner.pipes.borrow().get(name).cloned()
    }

    /// Run `callback` on the microtask after `tag` is defined.
    pub fn when_defined(&self, tag: &str, callback: impl FnOnce() + 'static) {
        if self.is_defined(tag) {
            self.inner.microtasks.borrow_mut().push_back(Box::new(callback));
        } else {
            self.inner
                .waiting
                .borrow_mut()
                .entry(tag.to_string())
                .or_default()
                .push(Box::new(callback));
        }
    }

    /// Drain the microtask queue, including tasks queued while draining.
    pub fn flush_microtasks(&self) {
        loop {
            let task = self.inner.microtasks.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    pub fn pending_microtasks(&self) -> usize {
        self.inner.microtasks.borrow().len()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Tree mutation
    // ───────────────────────────────────────────────────────────────────────────

    /// Insert `child` (or a fragment's children) before `reference` and
    /// upgrade any component elements that became connected.
    pub fn insert(
        &self,
        parent: NodeId,
        child: NodeId,
        reference: Option<NodeId>,
    ) -> Result<(), RuntimeError> {
        let doc = self.document();
        let inserted = match doc.kind(child) {
            NodeKind::Fragment => doc.children(child),
            _ => vec![child],
        };
        doc.insert_before(parent, child, reference);
        if doc.is_connected(parent) {
            for node in inserted {
                self.connect_tree(node)?;
            }
        }
        Ok(())
    }

    pub fn append(&self, parent: NodeId, child: NodeId) -> Result<(), RuntimeError> {
        self.insert(parent, child, None)
    }

    /// Create `<tag>` and append it to `parent`.
    pub fn mount(&self, parent: NodeId, tag: &str) -> Result<NodeId, RuntimeError> {
        let element = self.document().create_element(tag);
        self.append(parent, element)?;
        Ok(element)
    }

    /// Detach `node` and tear down every component instance inside it.
    pub fn remove_node(&self, node: NodeId) {
        let doc = self.document();
        let subtree = doc.shadow_including_inclusive_descendants(node);
        let was_connected = doc.is_connected(node);
        doc.remove(node);

        if was_connected {
            let affected: Vec<NodeId> = {
                let instances = self.inner.instances.borrow();
                subtree
                    .iter()
                    .copied()
                    .filter(|n| instances.contains_key(n))
                    .collect()
            };
            for element in affected {
                self.disconnect_element(element);
            }
        }
        self.release(&subtree);
    }

    fn connect_tree(&self, node: NodeId) -> Result<(), RuntimeError> {
        let doc = self.document();
        for candidate in doc.shadow_including_inclusive_descendants(node) {
            let upgradable = doc
                .tag_name(candidate)
                .is_some_and(|tag| self.is_defined(&tag));
            if upgradable {
                self.connect_element(candidate)?;
            }
        }
        Ok(())
    }

    /// Forget per-element runtime state of nodes that left the tree.
    ///
    /// Loop scopes are stamped on any custom element, upgraded or not, so
    /// they are dropped here rather than on component disconnect.
    fn release(&self, nodes: &[NodeId]) {
        let doc = self.document();
        for node in nodes {
            if let Some(scope_id) = doc.attribute(*node, SCOPE_ID_ATTR) {
                self.inner.scopes.unregister(&scope_id);
            }
        }

        let mut destroyed = Vec::new();
        {
            let mut directives = self.inner.directives.borrow_mut();
            let mut updaters = self.inner.updaters.borrow_mut();
            for node in nodes {
                if let Some(list) = directives.remove(node) {
                    destroyed.extend(list);
                }
                updaters.remove(node);
            }
            let gone: HashSet<NodeId> = nodes.iter().copied().collect();
            self.inner
                .bound_events
                .borrow_mut()
                .retain(|(node, _)| !gone.contains(node));
        }
        for directive in destroyed {
            directive.on_destroy();
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Component lifecycle
    // ───────────────────────────────────────────────────────────────────────────

    fn connect_element(&self, element: NodeId) -> Result<(), RuntimeError> {
        let doc = self.document();
        if self.inner.instances.borrow().contains_key(&element) || !doc.is_connected(element) {
            return Ok(());
        }
        let Some(tag) = doc.tag_name(element) else {
            return Ok(());
        };
        let Some(definition) = self.definition(&tag) else {
            return Ok(());
        };
        if !self.tables_loaded() {
            debug!(selector = %tag, element = %element, "expression tables not loaded; deferring hydration");
            self.inner.pending_init.borrow_mut().insert(element);
            return Ok(());
        }

        let started = Instant::now();
        let parent_scope = doc
            .attribute(element, SCOPE_ID_ATTR)
            .and_then(|id| self.inner.scopes.get(&id));
        let loop_context = parent_scope
            .as_ref()
            .map(|scope| scope.locals.clone())
            .unwrap_or_default();
        let host = (definition.factory)();
        let shadow_root = doc.attach_shadow(element);

        let instance = Rc::new(ComponentInstance {
            element,
            shadow_root,
            host: host.clone(),
            definition: definition.clone(),
            parent_scope,
            loop_context,
            subscriptions: SubscriptionSet::new(),
            markers: MarkerManager::new(),
            directive_elements: RefCell::new(Vec::new()),
        });
        self.inner
            .instances
            .borrow_mut()
            .insert(element, instance.clone());

        self.apply_pending_props(element, &host);

        doc.set_inner_html(shadow_root, &definition.html)?;
        let roots = doc.children(shadow_root);
        for node in &roots {
            self.connect_tree(*node)?;
        }
        self.attach_directives(&instance, &roots);
        binding::process_bindings(
            &binding::BindContext {
                runtime: self,
                instance: &instance,
                locals: instance.loop_context(),
                subscriptions: instance.subscriptions(),
            },
            &roots,
        )?;
        instance.markers().initialize(self, &instance)?;

        host.on_init();
        debug!(
            selector = %tag,
            element = %element,
            elapsed_us = started.elapsed().as_micros() as u64,
            "component hydrated"
        );
        Ok(())
    }

    fn apply_pending_props(&self, element: NodeId, host: &HostRef) {
        let pending = self.inner.pending_props.borrow_mut().remove(&element);
        for (name, value) in pending.into_iter().flatten() {
            match host.reactive_property(&name) {
                Some(prop) => prop.set_value(value),
                None => {
                    if let Err(err) = host.set_member(&name, value) {
                        error!(selector = host.selector(), binding = %name, "failed to apply pending property: {}", err);
                    }
                }
            }
        }
    }

    fn disconnect_element(&self, element: NodeId) {
        let Some(instance) = self.inner.instances.borrow_mut().remove(&element) else {
            return;
        };
        self.inner.pending_init.borrow_mut().shift_remove(&element);

        instance.host().on_destroy();
        let directive_elements: Vec<NodeId> = instance.directive_elements.borrow_mut().drain(..).collect();
        self.release(&directive_elements);
        instance.markers().cleanup();
        instance.subscriptions().unsubscribe_all();
        debug!(selector = instance.selector(), element = %element, "component disconnected");
    }

    pub fn instance(&self, element: NodeId) -> Option<Rc<ComponentInstance>> {
        self.inner.instances.borrow().get(&element).cloned()
    }

    pub fn host(&self, element: NodeId) -> Option<HostRef> {
        self.instance(element).map(|instance| instance.host().clone())
    }

    pub fn is_upgraded(&self, element: NodeId) -> bool {
        self.inner.instances.borrow().contains_key(&element)
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Element state used by the binding engine
    // ───────────────────────────────────────────────────────────────────────────

    /// Assign `name` on `element` the way a property binding does.
    pub fn set_property(&self, element: NodeId, name: &str, value: Value) {
        binding::set_child_property(self, element, name, value);
    }

    pub fn pending_properties(&self, element: NodeId) -> Option<IndexMap<String, Value>> {
        self.inner.pending_props.borrow().get(&element).cloned()
    }

    pub(crate) fn set_pending_property(&self, element: NodeId, name: &str, value: Value) {
        self.inner
            .pending_props
            .borrow_mut()
            .entry(element)
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn directives_on(&self, element: NodeId) -> Vec<HostRef> {
        self.inner
            .directives
            .borrow()
            .get(&element)
            .cloned()
            .unwrap_or_default()
    }

    /// Instantiate registered directives on annotated elements under `roots`.
    pub(crate) fn attach_directives(&self, instance: &ComponentInstance, roots: &[NodeId]) {
        let doc = self.document();
        for root in roots {
            for element in std::iter::once(*root).chain(doc.descendants(*root)) {
                let Some(list) = doc.attribute(element, DIRECTIVES_ATTR) else {
                    continue;
                };
                if self.inner.directives.borrow().contains_key(&element) {
                    continue;
                }
                let mut created = Vec::new();
                for selector in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    let factory = self.inner.directive_factories.borrow().get(selector).cloned();
                    match factory {
                        Some(factory) => created.push(factory(doc, element)),
                        None => warn!(
                            selector = instance.selector(),
                            directive = selector,
                            "no directive registered for selector"
                        ),
                    }
                }
                self.inner
                    .directives
                    .borrow_mut()
                    .insert(element, created.clone());
                instance.directive_elements.borrow_mut().push(element);
                for directive in created {
                    directive.on_init();
                }
            }
        }
    }

    pub(crate) fn is_component_element(&self, element: NodeId) -> bool {
        let doc = self.document();
        doc.has_attribute(element, COMPONENT_MARKER_ATTR)
            || doc.tag_name(element).is_some_and(|tag| tag.contains('-'))
    }

    pub(crate) fn register_updater(&self, element: NodeId, updater: Updater) {
        self.inner
            .updaters
            .borrow_mut()
            .entry(element)
            .or_default()
            .push(updater);
    }

    /// Re-run the property bindings applied to `element`.
    pub(crate) fn refresh_bindings(&self, element: NodeId) {
        let updaters = self
            .inner
            .updaters
            .borrow()
            .get(&element)
            .cloned()
            .unwrap_or_default();
        for updater in updaters {
            updater();
        }
    }

    /// Record `(element, event)`; false when it was already bound.
    pub(crate) fn mark_event_bound(&self, element: NodeId, event: &str) -> bool {
        self.inner
            .bound_events
            .borrow_mut()
            .insert((element, event.to_string()))
    }

    /// True the first time `(selector, dep)` is seen.
    pub(crate) fn warn_once(&self, selector: &str, dep: &str) -> bool {
        self.inner
            .warned
            .borrow_mut()
            .insert((selector.to_string(), dep.to_string()))
    }
}
