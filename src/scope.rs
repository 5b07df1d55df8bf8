//! Lexical scopes for hydrated components and the registry that links
//! components rendered inside loops to the scope they were cloned in.

use indexmap::IndexMap;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::host::HostRef;
use crate::value::Value;

/// Loop-local bindings visible to an expression.
pub type Locals = IndexMap<String, Value>;

#[derive(Clone)]
pub struct Scope {
    pub host: HostRef,
    pub locals: Locals,
    pub parent: Option<Rc<Scope>>,
}

impl Scope {
    pub fn new(host: HostRef, locals: Locals, parent: Option<Rc<Scope>>) -> Self {
        Scope {
            host,
            locals,
            parent,
        }
    }

    /// Locals of the whole chain; inner scopes shadow outer ones.
    pub fn collect_locals(&self) -> Locals {
        let mut merged = match &self.parent {
            Some(parent) => parent.collect_locals(),
            None => Locals::new(),
        };
        for (name, value) in &self.locals {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("host", &self.host.selector())
            .field("locals", &self.locals.keys().collect::<Vec<_>>())
            .field("parent", &self.parent)
            .finish()
    }
}

#[derive(Default)]
pub struct ScopeRegistry {
    next_id: Cell<u64>,
    scopes: RefCell<HashMap<String, Rc<Scope>>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `scope` under a fresh opaque id.
    pub fn register(&self, scope: Rc<Scope>) -> String {
        let id = format!("s{}", self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        self.scopes.borrow_mut().insert(id.clone(), scope);
        id
    }

    pub fn get(&self, id: &str) -> Option<Rc<Scope>> {
        self.scopes.borrow().get(id).cloned()
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.scopes.borrow_mut().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.scopes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
