//! Marker manager and region controllers.
//!
//! Each `fluff:<type>:<id>` / `/fluff:<type>:<id>` comment pair bounds a
//! dynamic region owned by one [`MarkerController`]. Controllers are keyed by
//! marker id *and* start comment, so the copies of one marker inside repeated
//! loop items are independent.
//!
//! A controller subscribes to its dependencies, then renders eagerly. Every
//! re-render first unsubscribes whatever the previous render created inside
//! the region and removes its nodes, then clones the selected template(s)
//! back in.

use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tracing::{debug, error, warn};

use crate::binding::{self, BindContext};
use crate::codegen::{
    BRANCH_TEMPLATE_ATTR, CASE_TEMPLATE_ATTR, EMPTY_TEMPLATE_ATTR, ITEM_TEMPLATE_ATTR, LOCAL_ID_ATTR,
};
use crate::compact::{CompactDep, CompactMarkerConfig, MarkerConfigEntries, MarkerType};
use crate::dom::{Anchor, NodeId};
use crate::reactive::SubscriptionSet;
use crate::runtime::{ComponentInstance, Runtime, RuntimeError, WeakRuntime, SCOPE_ID_ATTR};
use crate::scope::{Locals, Scope};
use crate::value::Value;

/// Local holding the item index inside a `@for` item.
pub const INDEX_LOCAL: &str = "$index";

/// Shared across one For/Switch render pass; a `@break` reached while
/// rendering sets it and the pass stops.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    should_break: Rc<Cell<bool>>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_break(&self) -> bool {
        self.should_break.get()
    }

    pub fn request_break(&self) {
        self.should_break.set(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Empty,
    /// If: the branch index. For: the number of items. Switch: the first
    /// rendered case. Text: always 0.
    Rendered(usize),
}

/// Parse `fluff:<type>:<id>` or `/fluff:<type>:<id>`; the flag is true for end markers.
pub fn parse_sentinel(data: &str) -> Option<(bool, MarkerType, u32)> {
    let (is_end, rest) = match data.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, data),
    };
    let mut parts = rest.strip_prefix("fluff:")?.splitn(2, ':');
    let name = parts.next()?;
    let id = parts.next()?.parse().ok()?;
    let marker_type = (0..=4)
        .filter_map(MarkerType::from_code)
        .find(|t| t.name() == name)?;
    Some((is_end, marker_type, id))
}

/// Pair start and end sentinels among `comments`. The last start and the
/// last end for an id win. A start without an end keeps `end: None`.
fn pair_markers(comments: &[(NodeId, String)]) -> Vec<(u32, MarkerType, Anchor)> {
    let mut starts: IndexMap<(u32, MarkerType), NodeId> = IndexMap::new();
    let mut ends: IndexMap<(u32, MarkerType), NodeId> = IndexMap::new();
    for (node, data) in comments {
        if let Some((is_end, marker_type, id)) = parse_sentinel(data) {
            let slot = if is_end { &mut ends } else { &mut starts };
            slot.insert((id, marker_type), *node);
        }
    }
    starts
        .into_iter()
        .map(|((id, marker_type), start)| {
            let end = ends.get(&(id, marker_type)).copied();
            (id, marker_type, Anchor { start, end })
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// MARKER MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct MarkerManager {
    configs: RefCell<IndexMap<u32, CompactMarkerConfig>>,
    controllers: RefCell<Vec<Rc<MarkerController>>>,
}

impl MarkerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize_from_config(&self, entries: &MarkerConfigEntries) {
        let mut configs = self.configs.borrow_mut();
        for (id, config) in entries {
            configs.insert(*id, config.clone());
        }
    }

    /// Create a controller for every configured marker found in the shadow
    /// tree, then initialize them in marker-id order.
    pub(crate) fn initialize(
        &self,
        runtime: &Runtime,
        instance: &Rc<ComponentInstance>,
    ) -> Result<(), RuntimeError> {
        self.initialize_from_config(&instance.definition().markers);
        let comments = runtime.document().comments(instance.shadow_root());
        let found = pair_markers(&comments);

        let ids: Vec<(u32, MarkerType)> = self
            .configs
            .borrow()
            .iter()
            .map(|(id, config)| (*id, config.marker_type()))
            .collect();
        let mut created = Vec::new();
        for (id, marker_type) in ids {
            let anchor = found
                .iter()
                .find(|(found_id, found_type, _)| *found_id == id && *found_type == marker_type)
                .map(|(_, _, anchor)| *anchor);
            let Some(anchor) = anchor else {
                debug!(selector = instance.selector(), marker_id = id, "marker not present in shadow tree; skipped");
                continue;
            };
            if let Some(controller) = self.ensure_controller(runtime, instance, id, marker_type, anchor) {
                created.push(controller);
            }
        }

        for controller in created {
            controller.initialize(instance.loop_context().clone(), None)?;
        }
        Ok(())
    }

    /// The controller for `(id, anchor.start)`, created if missing. Returns
    /// `None` when the id has no config or the config has another type.
    pub(crate) fn ensure_controller(
        &self,
        runtime: &Runtime,
        instance: &Rc<ComponentInstance>,
        id: u32,
        marker_type: MarkerType,
        anchor: Anchor,
    ) -> Option<Rc<MarkerController>> {
        if let Some(existing) = self.controller(id, Some(anchor.start)) {
            return Some(existing);
        }
        let config = self.configs.borrow().get(&id).cloned();
        let Some(config) = config else {
            debug!(selector = instance.selector(), marker_id = id, "no config for marker");
            return None;
        };
        if config.marker_type() != marker_type {
            warn!(
                selector = instance.selector(),
                marker_id = id,
                expected = config.marker_type().name(),
                found = marker_type.name(),
                "marker type does not match its config"
            );
            return None;
        }

        let controller = Rc::new(MarkerController {
            id,
            anchor,
            config,
            runtime: runtime.downgrade(),
            instance: Rc::downgrade(instance),
            loop_context: RefCell::new(Locals::new()),
            render_context: RefCell::new(None),
            dependencies: SubscriptionSet::new(),
            region: SubscriptionSet::new(),
            state: Cell::new(RegionState::Empty),
            text_node: Cell::new(None),
        });
        self.controllers.borrow_mut().push(controller.clone());
        Some(controller)
    }

    /// With `start`, the controller of that marker instance; without, the
    /// first one for `id`.
    pub fn controller(&self, id: u32, start: Option<NodeId>) -> Option<Rc<MarkerController>> {
        self.controllers
            .borrow()
            .iter()
            .find(|c| c.id == id && start.map_or(true, |s| c.anchor.start == s))
            .cloned()
    }

    pub fn controllers(&self) -> Vec<Rc<MarkerController>> {
        self.controllers.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.controllers.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy the controllers of marker `id` (only the one at `start`, if given).
    pub fn cleanup_controller(&self, id: u32, start: Option<NodeId>) {
        let removed: Vec<Rc<MarkerController>> = {
            let mut controllers = self.controllers.borrow_mut();
            let (removed, kept) = controllers
                .drain(..)
                .partition(|c| c.id == id && start.map_or(true, |s| c.anchor.start == s));
            *controllers = kept;
            removed
        };
        for controller in removed {
            controller.destroy();
        }
    }

    pub fn cleanup(&self) {
        let removed: Vec<Rc<MarkerController>> = self.controllers.borrow_mut().drain(..).collect();
        for controller in removed {
            controller.destroy();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTROLLER
// ═══════════════════════════════════════════════════════════════════════════════

pub struct MarkerController {
    id: u32,
    anchor: Anchor,
    config: CompactMarkerConfig,
    runtime: WeakRuntime,
    instance: Weak<ComponentInstance>,
    loop_context: RefCell<Locals>,
    render_context: RefCell<Option<RenderContext>>,
    /// Dependency subscriptions of the controller itself.
    dependencies: SubscriptionSet,
    /// Everything created by the current render of the region.
    region: SubscriptionSet,
    state: Cell<RegionState>,
    text_node: Cell<Option<NodeId>>,
}

impl MarkerController {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn anchor(&self) -> Anchor {
        self.anchor
    }

    pub fn marker_type(&self) -> MarkerType {
        self.config.marker_type()
    }

    pub fn state(&self) -> RegionState {
        self.state.get()
    }

    pub fn text_node(&self) -> Option<NodeId> {
        self.text_node.get()
    }

    /// First subscribe-and-render pass.
    pub(crate) fn initialize(
        self: &Rc<Self>,
        loop_context: Locals,
        render_context: Option<RenderContext>,
    ) -> Result<(), RuntimeError> {
        *self.loop_context.borrow_mut() = loop_context;
        *self.render_context.borrow_mut() = render_context.clone();

        if let CompactMarkerConfig::Break = self.config {
            if let Some(context) = render_context {
                context.request_break();
            }
            return Ok(());
        }

        let (Some(runtime), Some(instance)) = (self.runtime.upgrade(), self.instance.upgrade()) else {
            return Ok(());
        };

        if let CompactMarkerConfig::Text { .. } = self.config {
            let doc = runtime.document();
            let node = doc.create_text("");
            if let Some(parent) = doc.parent(self.anchor.start) {
                let reference = self.anchor.end.or_else(|| doc.next_sibling(self.anchor.start));
                doc.insert_before(parent, node, reference);
            }
            self.text_node.set(Some(node));
        }

        let weak = Rc::downgrade(self);
        let callback: Rc<dyn Fn()> = Rc::new(move || {
            let Some(controller) = weak.upgrade() else {
                return;
            };
            if let Err(err) = controller.update() {
                error!(marker_id = controller.id, "marker update failed: {}", err);
            }
        });
        let locals = self.loop_context.borrow().clone();
        binding::subscribe_dependencies(
            &BindContext {
                runtime: &runtime,
                instance: &instance,
                locals: &locals,
                subscriptions: &self.dependencies,
            },
            &self.dependency_list(),
            callback,
        )?;

        self.update()
    }

    fn dependency_list(&self) -> Vec<CompactDep> {
        match &self.config {
            CompactMarkerConfig::If { branches } => branches
                .iter()
                .flat_map(|b| b.deps.iter().flatten().cloned())
                .collect(),
            CompactMarkerConfig::For { deps, .. }
            | CompactMarkerConfig::Text { deps, .. }
            | CompactMarkerConfig::Switch { deps, .. } => deps.clone().unwrap_or_default(),
            CompactMarkerConfig::Break => Vec::new(),
        }
    }

    /// Re-evaluate and re-render the region.
    pub fn update(&self) -> Result<(), RuntimeError> {
        let (Some(runtime), Some(instance)) = (self.runtime.upgrade(), self.instance.upgrade()) else {
            return Ok(());
        };
        match &self.config {
            CompactMarkerConfig::If { branches } => {
                let mut matched = None;
                for (index, branch) in branches.iter().enumerate() {
                    let selected = match branch.expr {
                        None => true,
                        Some(expr) => self.evaluate(&runtime, &instance, expr)?.unwrap_property().truthy(),
                    };
                    if selected {
                        matched = Some(index);
                        break;
                    }
                }
                self.update_if(&runtime, &instance, matched)
            }
            CompactMarkerConfig::For {
                iterator,
                iterable,
                has_empty,
                ..
            } => self.update_for(&runtime, &instance, *iterator, *iterable, *has_empty),
            CompactMarkerConfig::Switch { expr, cases, .. } => {
                self.clear_region(&runtime, &instance);
                let value = self.evaluate(&runtime, &instance, *expr)?.unwrap_property();
                let context = RenderContext::new();
                let locals = self.loop_context.borrow().clone();
                let mut matched = false;
                let mut fallthrough = false;
                let mut first = None;
                for (index, case) in cases.iter().enumerate() {
                    if context.should_break() {
                        break;
                    }
                    let Some(template) = self.template(&runtime, &instance, CASE_TEMPLATE_ATTR, Some(index)) else {
                        continue;
                    };
                    let case_matches = case.is_default
                        || match case.value {
                            Some(value_expr) => self
                                .evaluate(&runtime, &instance, value_expr)?
                                .unwrap_property()
                                .strict_eq(&value),
                            None => false,
                        };
                    if fallthrough || (!matched && case_matches) {
                        matched = true;
                        first.get_or_insert(index);
                        self.clone_and_insert(&runtime, &instance, template, &locals, Some(&context))?;
                        fallthrough = case.fallthrough;
                    }
                }
                self.state.set(first.map_or(RegionState::Empty, RegionState::Rendered));
                self.refresh_parent_bindings(&runtime);
                Ok(())
            }
            CompactMarkerConfig::Text { expr, pipes, .. } => {
                let Some(node) = self.text_node.get() else {
                    return Ok(());
                };
                let value = self.evaluate(&runtime, &instance, *expr)?;
                let pipes = binding::resolve_pipes(&runtime, pipes.as_deref())?;
                let mut locals = instance
                    .parent_scope()
                    .map(|scope| scope.collect_locals())
                    .unwrap_or_default();
                for (name, local) in self.loop_context.borrow().iter() {
                    locals.insert(name.clone(), local.clone());
                }
                let value = binding::apply_pipes(&runtime, &instance, value, &pipes, &locals);
                runtime.document().set_text(node, &value.format_text());
                self.state.set(RegionState::Rendered(0));
                Ok(())
            }
            CompactMarkerConfig::Break => Ok(()),
        }
    }

    fn update_if(
        &self,
        runtime: &Runtime,
        instance: &Rc<ComponentInstance>,
        matched: Option<usize>,
    ) -> Result<(), RuntimeError> {
        let current = match self.state.get() {
            RegionState::Rendered(index) => Some(index),
            RegionState::Empty => None,
        };
        if matched == current {
            return Ok(());
        }

        self.clear_region(runtime, instance);
        self.state.set(RegionState::Empty);
        if let Some(index) = matched {
            match self.template(runtime, instance, BRANCH_TEMPLATE_ATTR, Some(index)) {
                Some(template) => {
                    let locals = self.loop_context.borrow().clone();
                    let context = self.render_context.borrow().clone();
                    self.clone_and_insert(runtime, instance, template, &locals, context.as_ref())?;
                    self.state.set(RegionState::Rendered(index));
                }
                None => warn!(selector = instance.selector(), marker_id = self.id, branch = index, "branch template missing"),
            }
        }
        self.refresh_parent_bindings(runtime);
        Ok(())
    }

    fn update_for(
        &self,
        runtime: &Runtime,
        instance: &Rc<ComponentInstance>,
        iterator: u32,
        iterable: u32,
        has_empty: bool,
    ) -> Result<(), RuntimeError> {
        self.clear_region(runtime, instance);
        let items = self
            .evaluate(runtime, instance, iterable)?
            .unwrap_property()
            .as_array()
            .unwrap_or_default();
        let locals = self.loop_context.borrow().clone();

        if items.is_empty() {
            self.state.set(RegionState::Empty);
            if has_empty {
                if let Some(template) = self.template(runtime, instance, EMPTY_TEMPLATE_ATTR, None) {
                    let context = self.render_context.borrow().clone();
                    self.clone_and_insert(runtime, instance, template, &locals, context.as_ref())?;
                }
            }
            self.refresh_parent_bindings(runtime);
            return Ok(());
        }

        let Some(template) = self.template(runtime, instance, ITEM_TEMPLATE_ATTR, None) else {
            warn!(selector = instance.selector(), marker_id = self.id, "item template missing");
            return Ok(());
        };
        let name = runtime.string(iterator)?;
        let context = RenderContext::new();
        let mut rendered = 0;
        for (index, item) in items.into_iter().enumerate() {
            if context.should_break() {
                break;
            }
            let mut item_locals = locals.clone();
            item_locals.insert(name.clone(), item);
            item_locals.insert(INDEX_LOCAL.to_string(), Value::Number(index as f64));
            self.clone_and_insert(runtime, instance, template, &item_locals, Some(&context))?;
            rendered += 1;
        }
        self.state.set(RegionState::Rendered(rendered));
        self.refresh_parent_bindings(runtime);
        Ok(())
    }

    /// Evaluation errors are logged and read as `undefined`.
    fn evaluate(&self, runtime: &Runtime, instance: &ComponentInstance, expr_id: u32) -> Result<Value, RuntimeError> {
        let expr = runtime.expression(expr_id)?;
        let locals = self.loop_context.borrow().clone();
        Ok(expr(instance.host(), &locals).unwrap_or_else(|err| {
            error!(
                selector = instance.selector(),
                marker_id = self.id,
                expr_id,
                "marker expression failed: {}",
                err
            );
            Value::Undefined
        }))
    }

    /// Template for this marker: `<selector>-<id>` or `<selector>-<id>-<index>`.
    fn template(
        &self,
        runtime: &Runtime,
        instance: &ComponentInstance,
        attr: &str,
        index: Option<usize>,
    ) -> Option<NodeId> {
        let key = match index {
            Some(index) => format!("{}-{}-{}", instance.selector(), self.id, index),
            None => format!("{}-{}", instance.selector(), self.id),
        };
        let doc = runtime.document();
        doc.elements_with_attribute(instance.shadow_root(), attr)
            .into_iter()
            .find(|node| doc.attribute(*node, attr).as_deref() == Some(key.as_str()))
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Region management
    // ───────────────────────────────────────────────────────────────────────────

    /// Clone `template` before the end marker with `locals` in scope, then
    /// wire up its directives, bindings and nested markers.
    fn clone_and_insert(
        &self,
        runtime: &Runtime,
        instance: &Rc<ComponentInstance>,
        template: NodeId,
        locals: &Locals,
        render_context: Option<&RenderContext>,
    ) -> Result<(), RuntimeError> {
        let doc = runtime.document();
        let Some(parent) = doc.parent(self.anchor.start) else {
            return Ok(());
        };
        let fragment = doc.clone_template_content(template);
        let roots = doc.children(fragment);
        if !locals.is_empty() {
            self.stamp_scopes(runtime, instance, &roots, locals);
        }
        let comments: Vec<(NodeId, String)> = roots
            .iter()
            .flat_map(|root| {
                doc.comment_data(*root)
                    .map(|data| vec![(*root, data)])
                    .unwrap_or_else(|| doc.comments(*root))
            })
            .collect();

        let reference = self.anchor.end.or_else(|| doc.next_sibling(self.anchor.start));
        runtime.insert(parent, fragment, reference)?;

        runtime.attach_directives(instance, &roots);
        binding::process_bindings(
            &BindContext {
                runtime,
                instance,
                locals,
                subscriptions: &self.region,
            },
            &roots,
        )?;

        for (id, marker_type, anchor) in pair_markers(&comments) {
            if let Some(nested) = instance
                .markers()
                .ensure_controller(runtime, instance, id, marker_type, anchor)
            {
                nested.initialize(locals.clone(), render_context.cloned())?;
            }
        }
        Ok(())
    }

    /// Link component elements in a clone to a registered scope holding `locals`.
    fn stamp_scopes(&self, runtime: &Runtime, instance: &ComponentInstance, roots: &[NodeId], locals: &Locals) {
        let doc = runtime.document();
        for root in roots {
            for element in std::iter::once(*root).chain(doc.descendants(*root)) {
                if !doc.is_element(element) || !runtime.is_component_element(element) {
                    continue;
                }
                let scope = Scope::new(
                    instance.host().clone(),
                    locals.clone(),
                    instance.parent_scope().cloned(),
                );
                let scope_id = runtime.scopes().register(Rc::new(scope));
                doc.set_attribute(element, SCOPE_ID_ATTR, &scope_id);
            }
        }
    }

    /// Unsubscribe the previous render and remove every node strictly
    /// between the markers, destroying nested controllers on the way.
    fn clear_region(&self, runtime: &Runtime, instance: &ComponentInstance) {
        self.region.unsubscribe_all();
        let Some(end) = self.anchor.end else {
            return;
        };
        let doc = runtime.document();
        let mut nodes = Vec::new();
        let mut cursor = doc.next_sibling(self.anchor.start);
        while let Some(node) = cursor {
            if node == end {
                break;
            }
            nodes.push(node);
            cursor = doc.next_sibling(node);
        }

        for node in &nodes {
            let comments = match doc.comment_data(*node) {
                Some(data) => vec![(*node, data)],
                None => doc.comments(*node),
            };
            for (comment, data) in comments {
                if let Some((false, _, id)) = parse_sentinel(&data) {
                    instance.markers().cleanup_controller(id, Some(comment));
                }
            }
        }
        for node in nodes {
            runtime.remove_node(node);
        }
    }

    /// Re-apply the property bindings of the element containing the region,
    /// whose value may depend on the content just rendered.
    fn refresh_parent_bindings(&self, runtime: &Runtime) {
        let doc = runtime.document();
        if let Some(parent) = doc.parent_element(self.anchor.start) {
            if doc.has_attribute(parent, LOCAL_ID_ATTR) {
                runtime.refresh_bindings(parent);
            }
        }
    }

    fn destroy(&self) {
        self.dependencies.unsubscribe_all();
        self.region.unsubscribe_all();
    }
}
