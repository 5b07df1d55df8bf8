//! The capability interface the binding engine uses to talk to component and
//! directive instances, plus a ready-made host assembled with a builder.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::rc::Rc;

use crate::eval::EvalError;
use crate::reactive::{Property, Publisher};
use crate::value::Value;

pub type HostRef = Rc<dyn ReactiveHost>;
pub type PipeFn = Rc<dyn Fn(Value, Vec<Value>) -> Value>;
pub type MethodFn = Rc<dyn Fn(&Component, Vec<Value>) -> Result<Value, EvalError>>;
pub type LifecycleFn = Rc<dyn Fn(&Component)>;

pub trait ReactiveHost {
    fn selector(&self) -> &str;

    /// The reactive property backing `name`, if the host owns one.
    fn reactive_property(&self, name: &str) -> Option<Property<Value>>;

    fn has_member(&self, name: &str) -> bool;

    /// Current value of `name`. Reactive properties read their value.
    fn member(&self, name: &str) -> Value;

    fn set_member(&self, name: &str, value: Value) -> Result<(), EvalError>;

    fn call_method(&self, name: &str, args: Vec<Value>) -> Result<Value, EvalError>;

    fn output(&self, _name: &str) -> Option<Publisher<Value>> {
        None
    }

    fn pipe(&self, _name: &str) -> Option<PipeFn> {
        None
    }

    fn on_init(&self) {}

    fn on_destroy(&self) {}
}

pub struct Component {
    selector: String,
    reactive: IndexMap<String, Property<Value>>,
    fields: RefCell<IndexMap<String, Value>>,
    methods: IndexMap<String, MethodFn>,
    outputs: IndexMap<String, Publisher<Value>>,
    pipes: IndexMap<String, PipeFn>,
    on_init: Option<LifecycleFn>,
    on_destroy: Option<LifecycleFn>,
}

impl Component {
    pub fn builder(selector: &str) -> ComponentBuilder {
        ComponentBuilder {
            component: Component {
                selector: selector.to_string(),
                reactive: IndexMap::new(),
                fields: RefCell::new(IndexMap::new()),
                methods: IndexMap::new(),
                outputs: IndexMap::new(),
                pipes: IndexMap::new(),
                on_init: None,
                on_destroy: None,
            },
        }
    }

    pub fn get(&self, name: &str) -> Value {
        self.member(name)
    }

    /// Assign `name`; reactive properties notify their subscribers.
    pub fn set(&self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.reactive.get(name) {
            Some(prop) => prop.set_value(value),
            None => {
                self.fields.borrow_mut().insert(name.to_string(), value);
            }
        }
    }

    pub fn property(&self, name: &str) -> Option<Property<Value>> {
        self.reactive.get(name).cloned()
    }

    pub fn emit(&self, output: &str, value: impl Into<Value>) {
        if let Some(publisher) = self.outputs.get(output) {
            publisher.emit(&value.into());
        }
    }
}

impl ReactiveHost for Component {
    fn selector(&self) -> &str {
        &self.selector
    }

    fn reactive_property(&self, name: &str) -> Option<Property<Value>> {
        self.property(name)
    }

    fn has_member(&self, name: &str) -> bool {
        self.reactive.contains_key(name)
            || self.fields.borrow().contains_key(name)
            || self.methods.contains_key(name)
            || self.outputs.contains_key(name)
    }

    fn member(&self, name: &str) -> Value {
        if let Some(prop) = self.reactive.get(name) {
            return prop.get();
        }
        if let Some(value) = self.fields.borrow().get(name) {
            return value.clone();
        }
        if let Some(publisher) = self.outputs.get(name) {
            return Value::Publisher(publisher.clone());
        }
        Value::Undefined
    }

    fn set_member(&self, name: &str, value: Value) -> Result<(), EvalError> {
        if self.methods.contains_key(name) || self.outputs.contains_key(name) {
            return Err(EvalError::Type(format!(
                "Cannot assign to read-only member '{}' of {}",
                name, self.selector
            )));
        }
        self.set(name, value);
        Ok(())
    }

    fn call_method(&self, name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        if let Some(method) = self.methods.get(name) {
            return method(self, args);
        }
        let field = self.fields.borrow().get(name).cloned();
        match field {
            Some(Value::Function(f)) => f(args),
            Some(_) => Err(EvalError::NotCallable(format!("this.{}", name))),
            None => Err(EvalError::UnknownMethod(format!(
                "{} has no method '{}'",
                self.selector, name
            ))),
        }
    }

    fn output(&self, name: &str) -> Option<Publisher<Value>> {
        self.outputs.get(name).cloned()
    }

    fn pipe(&self, name: &str) -> Option<PipeFn> {
        self.pipes.get(name).cloned()
    }

    fn on_init(&self) {
        if let Some(hook) = &self.on_init {
            hook(self);
        }
    }

    fn on_destroy(&self) {
        if let Some(hook) = &self.on_destroy {
            hook(self);
        }
    }
}

pub struct ComponentBuilder {
    component: Component,
}

impl ComponentBuilder {
    pub fn reactive(mut self, name: &str, initial: impl Into<Value>) -> Self {
        self.component
            .reactive
            .insert(name.to_string(), Property::new(initial.into()));
        self
    }

    /// Share an existing property, e.g. one owned by a test.
    pub fn reactive_property(mut self, name: &str, property: Property<Value>) -> Self {
        self.component.reactive.insert(name.to_string(), property);
        self
    }

    pub fn field(self, name: &str, value: impl Into<Value>) -> Self {
        self.component
            .fields
            .borrow_mut()
            .insert(name.to_string(), value.into());
        self
    }

    pub fn method(
        mut self,
        name: &str,
        method: impl Fn(&Component, Vec<Value>) -> Result<Value, EvalError> + 'static,
    ) -> Self {
        self.component
            .methods
            .insert(name.to_string(), Rc::new(method));
        self
    }

    pub fn output(mut self, name: &str) -> Self {
        self.component
            .outputs
            .insert(name.to_string(), Publisher::new());
        self
    }

    pub fn pipe(mut self, name: &str, pipe: impl Fn(Value, Vec<Value>) -> Value + 'static) -> Self {
        self.component.pipes.insert(name.to_string(), Rc::new(pipe));
        self
    }

    pub fn on_init(mut self, hook: impl Fn(&Component) + 'static) -> Self {
        self.component.on_init = Some(Rc::new(hook));
        self
    }

    pub fn on_destroy(mut self, hook: impl Fn(&Component) + 'static) -> Self {
        self.component.on_destroy = Some(Rc::new(hook));
        self
    }

    pub fn build(self) -> Rc<Component> {
        Rc::new(self.component)
    }
}
