//! # Fluff Native
//!
//! Template compiler and hydration runtime for Fluff web components.
//!
//! ## Compiler Invariants
//!
//! 1. **Shared Tables**: every expression, handler and string a batch of
//!    components needs lives in one of three session-wide tables. Identical
//!    canonical text always gets the same index, and indices are assigned in
//!    input order no matter how parsing was scheduled.
//!
//! 2. **Canonical Expressions**: bare identifiers that are neither loop locals
//!    nor globals are qualified with `this.`. `$event` is only in scope in
//!    handlers.
//!
//! 3. **Compact Wire Format**: bindings and marker configs are emitted as
//!    positional JSON tuples referencing table indices. Optional trailing
//!    members are omitted, never written as `null`.
//!
//! 4. **No Raw Interpolation**: finalized HTML never contains `{{`. Dynamic
//!    regions are comment sentinel pairs (`fluff:<type>:<id>`) whose content
//!    is cloned from hoisted `<template>` elements at runtime.
//!
//! ## Runtime Invariants
//!
//! 1. **Single Thread**: the runtime is `Rc`-based. Deferred work only runs
//!    when [`Runtime::flush_microtasks`] is called.
//!
//! 2. **Lifecycle Ownership**: every subscription created for a component or
//!    a rendered region is owned by a [`SubscriptionSet`] and released when
//!    the component disconnects or the region re-renders.
//!
//! 3. **Failure Isolation**: an expression that throws is logged and leaves
//!    its own binding untouched. Table mismatches are integrity errors and
//!    propagate as [`RuntimeError`].

mod binding;
mod cache;
mod codegen;
mod compact;
mod component;
mod dom;
mod eval;
mod expression;
mod finalize;
mod host;
mod markers;
mod parse;
mod reactive;
mod runtime;
mod scope;
mod validate;
mod value;

#[cfg(test)]
mod codegen_tests;
#[cfg(test)]
mod parse_tests;
#[cfg(test)]
mod runtime_tests;

// Compiler surface
pub use cache::{CacheStats, ParseCache};
pub use codegen::{
    CodeGenerator, CompilationSession, ExpressionTables, GeneratedTemplate, COMPONENT_MARKER_ATTR,
    DIRECTIVES_ATTR, LOCAL_ID_ATTR, REF_ATTR, RESTRICTED_ELEMENT_PREFIX,
};
pub use compact::{
    BindingExtras, CompactBinding, CompactBranch, CompactCase, CompactDep, CompactMarkerConfig,
    CompactPipe, MarkerConfigEntries, MarkerType,
};
pub use component::{compile_component, compile_components, CompileOutput, CompiledComponent, ComponentSource};
pub use expression::{parse_expression, parse_handler, Expr, SyntaxError};
pub use finalize::{FinalizedComponent, RUNTIME_PACKAGE};
pub use parse::{parse_template, CompileOptions};
pub use validate::*;

// Runtime surface
pub use dom::{Anchor, Document, NodeId, NodeKind};
pub use eval::{compile_expression, compile_handler, EvalError, ExprFn, HandlerFn};
pub use host::{Component, ComponentBuilder, HostRef, PipeFn, ReactiveHost};
pub use markers::{parse_sentinel, MarkerController, MarkerManager, RegionState, RenderContext};
pub use reactive::{Property, Publisher, Subscription, SubscriptionSet};
pub use runtime::{
    ComponentDefinition, ComponentInstance, DirectiveFactory, HostFactory, Runtime, RuntimeError,
    WeakRuntime, SCOPE_ID_ATTR,
};
pub use scope::{Locals, Scope, ScopeRegistry};
pub use value::Value;
